//! # Shared Model Handle & Readiness Gate
//!
//! One generation engine is shared process-wide. It starts loading in the
//! background at startup and transitions `Loading → Ready` exactly once per
//! process lifetime; the transition is broadcast so that any number of
//! sessions blocked on `wait_ready()` are all released together. No request
//! is ever serviced by a partially loaded engine.
//!
//! A `tokio::sync::watch` channel plays the condition-variable role: waiters
//! suspend on the receiver, the loader publishes the ready engine through the
//! sender, and the handle is read-only after that point, so generation needs
//! no further synchronization.

use crate::config::ModelsConfig;
use crate::error::{AppError, AppResult};
use crate::generation::engine::{GenerationEngine, LlamaCliEngine};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

type EngineHandle = Arc<dyn GenerationEngine>;

/// Process-wide, reference-counted handle to the generation engine.
#[derive(Clone)]
pub struct SharedModel {
    inner: Arc<GateInner>,
}

struct GateInner {
    tx: watch::Sender<Option<EngineHandle>>,
    rx: watch::Receiver<Option<EngineHandle>>,
}

impl SharedModel {
    /// A handle in the `Loading` state. `mark_ready` performs the one-time
    /// transition.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            inner: Arc::new(GateInner { tx, rx }),
        }
    }

    /// A handle that is ready from the start (test construction).
    pub fn ready(engine: EngineHandle) -> Self {
        let model = Self::new();
        model.mark_ready(engine);
        model
    }

    /// Publish the loaded engine and release every waiter.
    ///
    /// A second call is ignored: the Loading→Ready transition happens exactly
    /// once.
    pub fn mark_ready(&self, engine: EngineHandle) {
        let mut transitioned = false;
        self.inner.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(engine.clone());
                transitioned = true;
                true
            } else {
                false
            }
        });

        if transitioned {
            info!("Generation model ready, releasing waiting sessions");
        } else {
            warn!("Ignoring duplicate model-ready transition");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.rx.borrow().is_some()
    }

    /// Non-blocking lookup, used by `receive()` to reject with 400 instead of
    /// stalling the caller.
    pub fn try_engine(&self) -> Option<EngineHandle> {
        self.inner.rx.borrow().clone()
    }

    /// Suspend until the engine is ready. Unbounded by design: the only way
    /// this fails is the process shutting down while the model never loaded.
    pub async fn wait_ready(&self) -> AppResult<EngineHandle> {
        let mut rx = self.inner.rx.clone();
        let guard = rx
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| AppError::Internal("Model loader went away before reaching ready".into()))?;

        guard
            .clone()
            .ok_or_else(|| AppError::Internal("Readiness gate opened without an engine".into()))
    }
}

impl Default for SharedModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Load the generation engine in the background and open the gate when done.
///
/// When the configured model file or binary is absent the handle simply stays
/// in `Loading`: sessions keep getting the synchronous not-ready rejection
/// until the operator provides the model and restarts.
pub fn spawn_load(model: SharedModel, models: ModelsConfig) {
    tokio::spawn(async move {
        info!("Loading generation model in background, this might take a while");

        if !Path::new(&models.llm_model_path).exists() {
            warn!(
                "Model file {} not found; text generation stays unavailable",
                models.llm_model_path
            );
            return;
        }

        let engine = LlamaCliEngine::new(models.llm_binary.clone(), models.llm_model_path.clone());
        if let Err(e) = engine.probe().await {
            warn!("Generation binary unusable, staying in loading state: {}", e);
            return;
        }

        model.mark_ready(Arc::new(engine));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::engine::FragmentStream;
    use async_trait::async_trait;
    use futures_util::StreamExt;

    struct NoopEngine;

    #[async_trait]
    impl GenerationEngine for NoopEngine {
        async fn generate(&self, _prompt: &str) -> AppResult<FragmentStream> {
            Ok(futures_util::stream::empty().boxed())
        }
    }

    #[tokio::test]
    async fn test_starts_loading_and_transitions_once() {
        let model = SharedModel::new();
        assert!(!model.is_ready());
        assert!(model.try_engine().is_none());

        model.mark_ready(Arc::new(NoopEngine));
        assert!(model.is_ready());
        assert!(model.try_engine().is_some());

        // Second transition is a no-op, not a panic
        model.mark_ready(Arc::new(NoopEngine));
        assert!(model.is_ready());
    }

    #[tokio::test]
    async fn test_all_waiters_released_together() {
        let model = SharedModel::new();

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let model = model.clone();
            waiters.push(tokio::spawn(async move { model.wait_ready().await.is_ok() }));
        }

        // Give the waiters time to suspend on the gate
        tokio::task::yield_now().await;
        model.mark_ready(Arc::new(NoopEngine));

        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_wait_after_ready_returns_immediately() {
        let model = SharedModel::ready(Arc::new(NoopEngine));
        assert!(model.wait_ready().await.is_ok());
    }
}
