//! # Voice Chat Backend - Main Application Entry Point
//!
//! An actix-web server for streamed voice conversations: clients connect over
//! WebSocket, stream audio fragments or whole recordings for live
//! transcription, and exchange text turns with a locally hosted language
//! model whose replies stream back chunk by chunk with per-sentence speech
//! synthesis.
//!
//! ## Application Architecture:
//! - **config / state / error**: configuration, shared state + metrics, and
//!   the error taxonomy with its HTTP mapping
//! - **audio**: per-session fragment queue, merge and transcription pipeline
//! - **transcription / generation / speech**: the external engine seams
//!   (whisper CLI, llama.cpp CLI, espeak-ng)
//! - **conversation**: message history and the streamed reply flow
//! - **registry / outbound / websocket**: session lifecycle, the per-session
//!   event channel and the WebSocket transport
//! - **health / handlers / middleware**: the REST surface around it

mod audio;
mod config;
mod conversation;
mod error;
mod generation;
mod handlers;
mod health;
mod middleware;
mod outbound;
mod registry;
mod speech;
mod state;
mod transcription;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use generation::SharedModel;
use registry::SessionRegistry;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown flag set by the signal handler and polled by main.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-chat-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // External capabilities: the audio toolchain is probed once up front so
    // sessions can fail fast, the generation model loads in the background
    // behind the readiness gate.
    let toolchain = Arc::new(audio::FfmpegToolchain::detect().await);
    let transcriber = Arc::new(transcription::WhisperCliEngine::new(
        config.models.whisper_binary.clone(),
        config.models.whisper_model.clone(),
    ));
    let speech_engine = Arc::new(speech::EspeakEngine::new(
        config.speech.binary.clone(),
        config.synthesis_timeout(),
    ));

    let model = SharedModel::new();
    generation::gate::spawn_load(model.clone(), config.models.clone());

    let session_registry = Arc::new(SessionRegistry::new(
        app_state.clone(),
        model.clone(),
        toolchain,
        transcriber,
        speech_engine,
    ));

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::Data::new(model.clone()))
            .app_data(web::Data::new(session_registry.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/ws", web::get().to(websocket::chat_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Race the server against the shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Console logging via tracing. `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_chat_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Install SIGTERM/SIGINT handlers that flip the global shutdown flag, so
/// in-flight requests get to finish before the server stops.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag. Simple and good enough for a once-per-process
/// event.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
