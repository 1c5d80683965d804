//! Shared application state for the HTTP surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stagegate_assess::{SessionProgress, StageConfig};
use stagegate_config::Config;
use stagegate_machine::{EventPublisher, Machine};
use stagegate_store::RunStore;
use stagegate_types::RunEvent;
use stagegate_worker::{HttpResumeClient, ResumeTransport};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Forwards committed events onto the broadcast channel feeding the SSE
/// streams. Lossy when no subscriber is listening, which is fine: clients
/// reconcile from the snapshot endpoint.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<RunEvent>,
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: &RunEvent) {
        let _ = self.tx.send(event.clone());
    }
}

#[derive(Clone)]
pub struct AppState {
    pub machine: Arc<Machine>,
    pub store: Arc<RunStore>,
    pub stage_config: Arc<StageConfig>,
    pub sessions: Arc<Mutex<HashMap<Uuid, SessionProgress>>>,
    pub events: broadcast::Sender<RunEvent>,
    /// Bearer token the worker must present; `None` rejects every webhook.
    pub webhook_token: Option<Arc<String>>,
}

impl AppState {
    /// Wire the full stack from configuration: HTTP resume client as
    /// transport, webhook token from the configured environment variable.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let transport: Arc<dyn ResumeTransport> = Arc::new(HttpResumeClient::new(
            config.worker.base_url.clone(),
            config.worker.max_resume_attempts,
            Duration::from_millis(config.worker.initial_backoff_ms),
        ));
        let webhook_token = match std::env::var(&config.server.bearer_token_env) {
            Ok(token) if !token.is_empty() => Some(token),
            _ => {
                warn!(
                    env_var = %config.server.bearer_token_env,
                    "webhook bearer token not set; all webhook deliveries will be rejected"
                );
                None
            }
        };
        Self::with_transport(config, transport, webhook_token)
    }

    /// Same wiring with caller-supplied transport and token; integration
    /// tests use this with a recording mock.
    #[must_use]
    pub fn with_transport(
        config: &Config,
        transport: Arc<dyn ResumeTransport>,
        webhook_token: Option<String>,
    ) -> Self {
        let (tx, _) = broadcast::channel(256);
        let store = Arc::new(RunStore::new());
        let publisher = Arc::new(BroadcastPublisher { tx: tx.clone() });
        let machine = Arc::new(Machine::new(
            Arc::clone(&store),
            config,
            transport,
            publisher,
        ));
        let webhook_token = webhook_token.map(Arc::new);
        Self {
            machine,
            store,
            stage_config: Arc::new(config.stage_config()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            events: tx,
            webhook_token,
        }
    }
}
