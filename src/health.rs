use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::storage::{BackendKind, BlockStorage};
use crate::stream::MessageStream;

pub const HEALTHY: &str = "healthy";
pub const DEGRADED: &str = "degraded";
pub const UNHEALTHY: &str = "unhealthy";

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: String,
    pub services: HashMap<String, ServiceHealth>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceHealth {
    pub status: String,
    pub message: Option<String>,
    pub response_time_ms: Option<u64>,
}

pub struct HealthChecker {
    storage: BlockStorage,
    stream: Option<MessageStream>,
    last_status: Mutex<Option<String>>,
}

impl HealthChecker {
    pub fn new(storage: BlockStorage) -> Self {
        Self {
            storage,
            stream: None,
            last_status: Mutex::new(None),
        }
    }

    pub fn with_stream(mut self, stream: MessageStream) -> Self {
        self.stream = Some(stream);
        self
    }

    pub async fn check_storage(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.storage.stats().await {
            Ok(stats) => {
                let response_time = start.elapsed().as_millis() as u64;
                let (status, message) = match self.storage.backend_kind() {
                    BackendKind::Sqlite => (HEALTHY, format!("SQLite store holds {} blocks", stats.total_blocks)),
                    BackendKind::Memory => (
                        DEGRADED,
                        format!("In-memory store holds {} blocks, nothing survives restart", stats.total_blocks),
                    ),
                };
                ServiceHealth {
                    status: status.to_string(),
                    message: Some(message),
                    response_time_ms: Some(response_time),
                }
            }
            Err(e) => ServiceHealth {
                status: UNHEALTHY.to_string(),
                message: Some(format!("Block storage error: {}", e)),
                response_time_ms: Some(start.elapsed().as_millis() as u64),
            },
        }
    }

    pub async fn check_stream(&self, stream: &MessageStream) -> ServiceHealth {
        let start = Instant::now();
        let running = stream.is_running().await;
        let session = stream.session().await;

        ServiceHealth {
            status: (if running { HEALTHY } else { DEGRADED }).to_string(),
            message: Some(match (running, session) {
                (true, Some(session)) => format!("Capturing session {}", session),
                (true, None) => "Running, no session primed yet".to_string(),
                (false, _) => "Message stream stopped".to_string(),
            }),
            response_time_ms: Some(start.elapsed().as_millis() as u64),
        }
    }

    pub async fn get_overall_health(&self) -> HealthStatus {
        let mut services = HashMap::new();
        services.insert("storage".to_string(), self.check_storage().await);
        if let Some(stream) = &self.stream {
            services.insert("stream".to_string(), self.check_stream(stream).await);
        }

        let overall_status = if services.values().any(|service| service.status == UNHEALTHY) {
            UNHEALTHY
        } else if services.values().all(|service| service.status == HEALTHY) {
            HEALTHY
        } else {
            DEGRADED
        };

        let mut last = self.last_status.lock().await;
        if last.as_deref() != Some(overall_status) {
            tracing::info!(status = overall_status, "Health status changed");
            *last = Some(overall_status.to_string());
        }

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            services,
        }
    }
}
