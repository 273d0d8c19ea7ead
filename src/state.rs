//! # Application State Management
//!
//! Shared state handed to every HTTP handler and voice socket.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers hold a reference to the same data
//! - **RwLock**: many readers or one writer at a time
//! - Locks are held only long enough to copy or swap a value, never across `.await`
//!
//! A poisoned lock is recovered rather than propagated: every write here replaces
//! a value wholesale or bumps a counter, so the data behind it is always usable.
//!
//! ## What lives here:
//! - **config**: runtime-updatable configuration
//! - **metrics**: HTTP request counters per route pattern
//! - **arbitrator**: the single microphone lease shared by conversations and dictation
//! - **reply_hub**: webhook-fed completion watcher
//! - **services**: HTTP/realtime collaborators built from the current config
//! - **conversations**: registry of open conversations

use crate::arbitrator::MicrophoneArbitrator;
use crate::config::AppConfig;
use crate::conversation::controller::{StatsSnapshot, TurnController};
use crate::conversation::state::{SessionToken, TurnState};
use crate::conversation::watcher::ReplyHub;
use crate::error::{AppError, AppResult};
use crate::services::ServiceClients;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
    pub arbitrator: MicrophoneArbitrator,
    pub reply_hub: ReplyHub,
    pub conversations: ConversationRegistry,
    services: Arc<RwLock<Arc<ServiceClients>>>,
}

/// Request metrics collected by the metrics middleware.
#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Open voice sockets
    pub active_connections: u32,

    /// Keyed by method and route pattern, e.g. "POST /api/v1/conversations/{id}/close"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AppState {
    /// Build the shared state. Fails only if the HTTP clients cannot be created.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let reply_hub = ReplyHub::new();
        let services = ServiceClients::from_config(&config, &reply_hub)?;
        let conversations = ConversationRegistry::new(config.conversation.max_concurrent_conversations);

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            arbitrator: MicrophoneArbitrator::new(),
            reply_hub,
            conversations,
            services: Arc::new(RwLock::new(Arc::new(services))),
        })
    }

    pub fn get_config(&self) -> AppConfig {
        read(&self.config).clone()
    }

    /// Validate and apply a new configuration.
    ///
    /// Service clients are rebuilt so conversations opened afterwards use the new
    /// endpoints; open conversations keep the clients they started with.
    pub fn update_config(&self, new_config: AppConfig) -> AppResult<()> {
        new_config
            .validate()
            .map_err(|e| AppError::ValidationError(e.to_string()))?;
        let services = ServiceClients::from_config(&new_config, &self.reply_hub)?;

        self.conversations
            .set_limit(new_config.conversation.max_concurrent_conversations);
        *write(&self.services) = Arc::new(services);
        *write(&self.config) = new_config;
        info!("Configuration updated");
        Ok(())
    }

    pub fn services(&self) -> Arc<ServiceClients> {
        read(&self.services).clone()
    }

    pub fn increment_request_count(&self) {
        write(&self.metrics).request_count += 1;
    }

    pub fn increment_error_count(&self) {
        write(&self.metrics).error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = write(&self.metrics);
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn increment_active_connections(&self) {
        write(&self.metrics).active_connections += 1;
    }

    pub fn decrement_active_connections(&self) {
        let mut metrics = write(&self.metrics);
        metrics.active_connections = metrics.active_connections.saturating_sub(1);
    }

    /// Copy the metrics so no lock is held while a response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = read(&self.metrics);
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_connections: metrics.active_connections,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

/// What `GET /api/v1/conversations` reports per conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub state: TurnState,
    pub indicator: &'static str,
    pub session_token: Option<SessionToken>,
    pub stats: StatsSnapshot,
}

/// Open conversations by id, bounded by `max_concurrent_conversations`.
///
/// One controller per conversation id: a second socket trying to open the same
/// conversation is refused rather than allowed to race the first.
#[derive(Clone)]
pub struct ConversationRegistry {
    conversations: Arc<RwLock<HashMap<String, TurnController>>>,
    max_conversations: Arc<RwLock<usize>>,
}

impl ConversationRegistry {
    pub fn new(max_conversations: usize) -> Self {
        Self {
            conversations: Arc::new(RwLock::new(HashMap::new())),
            max_conversations: Arc::new(RwLock::new(max_conversations)),
        }
    }

    pub fn set_limit(&self, max_conversations: usize) {
        *write(&self.max_conversations) = max_conversations;
    }

    pub fn register(&self, controller: TurnController) -> AppResult<()> {
        let limit = *read(&self.max_conversations);
        let mut conversations = write(&self.conversations);

        // Closed controllers are dead weight; let their ids be reused
        conversations.retain(|_, existing| !existing.is_closed());

        let id = controller.conversation_id().to_string();
        if conversations.contains_key(&id) {
            return Err(AppError::Conflict(format!(
                "Conversation {} is already open",
                id
            )));
        }
        if conversations.len() >= limit {
            return Err(AppError::Conflict(format!(
                "Maximum concurrent conversations ({}) reached",
                limit
            )));
        }

        conversations.insert(id.clone(), controller);
        info!(conversation_id = %id, "Conversation registered");
        Ok(())
    }

    pub fn get(&self, conversation_id: &str) -> Option<TurnController> {
        read(&self.conversations).get(conversation_id).cloned()
    }

    /// Remove `controller`'s entry, if the registry still holds that same one.
    pub fn remove(&self, controller: &TurnController) {
        let mut conversations = write(&self.conversations);
        let same = conversations
            .get(controller.conversation_id())
            .map_or(false, |existing| existing.ptr_eq(controller));
        if same {
            conversations.remove(controller.conversation_id());
        }
    }

    /// Close and forget a conversation.
    pub fn close(&self, conversation_id: &str) -> AppResult<()> {
        let controller = write(&self.conversations).remove(conversation_id);
        match controller {
            Some(controller) => {
                controller.close();
                Ok(())
            }
            None => Err(AppError::NotFound(format!(
                "Conversation {} is not open",
                conversation_id
            ))),
        }
    }

    /// Close everything (server shutdown).
    pub fn close_all(&self) {
        let drained: Vec<TurnController> = write(&self.conversations).drain().map(|(_, c)| c).collect();
        if !drained.is_empty() {
            warn!(count = drained.len(), "Closing open conversations");
        }
        for controller in drained {
            controller.close();
        }
    }

    pub fn len(&self) -> usize {
        read(&self.conversations).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summaries(&self) -> Vec<ConversationSummary> {
        let controllers: Vec<TurnController> = read(&self.conversations).values().cloned().collect();
        let mut summaries: Vec<ConversationSummary> = controllers
            .iter()
            .map(|controller| {
                let state = controller.state();
                ConversationSummary {
                    conversation_id: controller.conversation_id().to_string(),
                    indicator: state.indicator(),
                    state,
                    session_token: controller.session_token(),
                    stats: controller.stats(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        summaries
    }

    /// Controller counters summed over every open conversation.
    pub fn aggregate_stats(&self) -> StatsSnapshot {
        let mut total = StatsSnapshot::default();
        for controller in read(&self.conversations).values() {
            total.merge(&controller.stats());
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrator::OwnerTag;
    use crate::conversation::controller::{Collaborators, ControllerConfig};
    use crate::test_support::{FakeCapture, FakeDispatcher, FakePlayback, FakeTranscriber, ScriptedWatcher};

    fn controller(id: &str, arbitrator: &MicrophoneArbitrator) -> TurnController {
        TurnController::new(
            id,
            ControllerConfig::default(),
            arbitrator.clone(),
            Collaborators {
                capture: Arc::new(FakeCapture::new()),
                transcriber: Arc::new(FakeTranscriber::new()),
                dispatcher: Arc::new(FakeDispatcher::new()),
                watcher: Arc::new(ScriptedWatcher::new()),
                playback: Arc::new(FakePlayback::new()),
            },
        )
    }

    #[test]
    fn test_metrics_tracking() {
        let state = AppState::new(AppConfig::default()).unwrap();
        state.increment_request_count();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);
        state.increment_active_connections();
        state.decrement_active_connections();
        state.decrement_active_connections();

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 1);
        assert_eq!(metrics.active_connections, 0);
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_invalid_config_update_is_rejected() {
        let state = AppState::new(AppConfig::default()).unwrap();
        let mut config = state.get_config();
        config.conversation.silence_timeout_ms = 0;
        assert!(matches!(state.update_config(config), Err(AppError::ValidationError(_))));
        assert_eq!(state.get_config(), AppConfig::default());
    }

    #[test]
    fn test_registry_limits_and_duplicates() {
        let arbitrator = MicrophoneArbitrator::new();
        let registry = ConversationRegistry::new(2);

        registry.register(controller("a", &arbitrator)).unwrap();
        assert!(matches!(
            registry.register(controller("a", &arbitrator)),
            Err(AppError::Conflict(_))
        ));
        registry.register(controller("b", &arbitrator)).unwrap();
        assert!(matches!(
            registry.register(controller("c", &arbitrator)),
            Err(AppError::Conflict(_))
        ));

        registry.close("a").unwrap();
        assert!(matches!(registry.close("a"), Err(AppError::NotFound(_))));
        registry.register(controller("c", &arbitrator)).unwrap();

        let ids: Vec<String> = registry.summaries().into_iter().map(|s| s.conversation_id).collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_remove_only_drops_the_same_controller() {
        let arbitrator = MicrophoneArbitrator::new();
        let registry = ConversationRegistry::new(4);

        let first = controller("a", &arbitrator);
        registry.register(first.clone()).unwrap();
        first.close();

        let second = controller("a", &arbitrator);
        registry.register(second.clone()).unwrap();

        // The first socket going away must not evict its replacement
        registry.remove(&first);
        assert!(registry.get("a").map_or(false, |c| c.ptr_eq(&second)));

        registry.remove(&second);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_releases_microphone() {
        let arbitrator = MicrophoneArbitrator::new();
        let registry = ConversationRegistry::new(4);
        let conversation = controller("a", &arbitrator);
        registry.register(conversation.clone()).unwrap();

        conversation.start().await.unwrap();
        assert_eq!(arbitrator.holder(), Some(OwnerTag::Conversation));

        registry.close_all();
        assert!(conversation.is_closed());
        assert_eq!(arbitrator.holder(), None);
        assert!(registry.is_empty());
    }
}
