//! # WebSocket Chat Transport
//!
//! Bidirectional transport for one client session. Clients connect to `/ws`,
//! send text turns and audio, and receive the session's outbound events
//! (messages, stream chunks, transcriptions, synthesized speech).
//!
//! ## WebSocket Protocol:
//! - **Client → Server, text frames**: tagged JSON, either
//!   `{"event":"user_message","text":"..."}` or
//!   `{"event":"audio_file","audio":"<base64>"}`
//! - **Client → Server, binary frames**: one streamed audio fragment per frame
//! - **Server → Client**: the session's outbound events as tagged JSON
//!   (`message`, `stream_message`, `transcription`, `speech_file`,
//!   `error_message`)
//!
//! The actor itself stays thin: every payload is handed straight to the
//! session registry, and the registry's outbound channel is attached to the
//! actor as an input stream so events flow back without explicit pumping.

use crate::conversation::Sender;
use crate::outbound::OutboundEvent;
use crate::registry::SessionRegistry;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// Ping cadence for idle connections.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long a client may stay silent before the connection is dropped.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Structured messages a client can send as text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum InboundMessage {
    /// One user turn for the conversation
    UserMessage { text: String },

    /// A complete audio recording, base64-encoded
    AudioFile { audio: String },
}

/// WebSocket actor owning one client connection.
///
/// Each connection is one session: the actor allocates the session id,
/// registers it on start and tears it down when the connection stops.
pub struct ChatSocket {
    session_id: String,
    registry: Arc<SessionRegistry>,
    last_heartbeat: Instant,
}

impl ChatSocket {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            registry,
            last_heartbeat: Instant::now(),
        }
    }

    fn handle_text(&self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<InboundMessage>(text) {
            Ok(InboundMessage::UserMessage { text }) => {
                self.registry.dispatch_user_message(&self.session_id, &text);
            }
            Ok(InboundMessage::AudioFile { audio }) => match BASE64.decode(audio.as_bytes()) {
                Ok(bytes) => self.registry.dispatch_audio_file(&self.session_id, bytes),
                Err(e) => self.send_error(ctx, &format!("Invalid base64 audio payload: {}", e)),
            },
            Err(e) => {
                self.send_error(ctx, &format!("Invalid message: {}", e));
            }
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, message: &str) {
        warn!("Session {} protocol error: {}", self.session_id, message);
        let event = OutboundEvent::ErrorMessage {
            sender: Sender::Error,
            content: message.to_string(),
        };
        if let Ok(json) = serde_json::to_string(&event) {
            ctx.text(json);
        }
    }
}

impl Actor for ChatSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Register the session and wire its outbound channel into the actor.
    fn started(&mut self, ctx: &mut Self::Context) {
        match self.registry.on_connect(&self.session_id) {
            Ok(rx) => {
                ctx.add_stream(UnboundedReceiverStream::new(rx));
            }
            Err(e) => {
                error!("Could not register session {}: {}", self.session_id, e);
                self.send_error(ctx, "Could not establish a session");
                ctx.stop();
                return;
            }
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Session {} heartbeat timeout, closing connection", act.session_id);
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        info!("WebSocket connection started for session {}", self.session_id);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.registry.on_disconnect(&self.session_id);
        info!("WebSocket connection stopped for session {}", self.session_id);
    }
}

/// Outbound events produced by the session's components, forwarded verbatim.
impl StreamHandler<OutboundEvent> for ChatSocket {
    fn handle(&mut self, event: OutboundEvent, ctx: &mut Self::Context) {
        match serde_json::to_string(&event) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Could not serialize outbound event: {}", e),
        }
    }
}

/// Inbound client frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ChatSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                debug!("Session {} sent a {}-byte audio fragment", self.session_id, data.len());
                self.registry.dispatch_audio_fragment(&self.session_id, data.to_vec());
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Session {} closed by client: {:?}", self.session_id, reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Session {} sent an unexpected continuation frame", self.session_id);
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!("WebSocket protocol error on session {}: {}", self.session_id, e);
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// Upgrades the HTTP request and hands the connection to a fresh `ChatSocket`
/// actor; everything session-scoped lives behind the shared registry.
pub async fn chat_websocket(
    req: HttpRequest,
    stream: web::Payload,
    registry: web::Data<Arc<SessionRegistry>>,
) -> ActixResult<HttpResponse> {
    info!(
        "New WebSocket connection request from: {:?}",
        req.connection_info().peer_addr()
    );
    ws::start(ChatSocket::new(registry.get_ref().clone()), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_message_parsing() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"event":"user_message","text":"hello"}"#).unwrap();
        match msg {
            InboundMessage::UserMessage { text } => assert_eq!(text, "hello"),
            other => panic!("Wrong message type: {:?}", other),
        }

        let msg: InboundMessage =
            serde_json::from_str(r#"{"event":"audio_file","audio":"aGk="}"#).unwrap();
        match msg {
            InboundMessage::AudioFile { audio } => {
                assert_eq!(BASE64.decode(audio.as_bytes()).unwrap(), b"hi");
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_inbound_event_is_rejected() {
        let result = serde_json::from_str::<InboundMessage>(r#"{"event":"shutdown"}"#);
        assert!(result.is_err());
    }
}
