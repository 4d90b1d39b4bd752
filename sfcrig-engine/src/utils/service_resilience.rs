//! Per-operation retry policies.
//!
//! Only operations that observe converging state go through these policies:
//! traffic checks run right after a chain mutation and the first command on a
//! freshly booted VM. Control-plane calls are never retried.

use crate::utils::error_handling::retry_async;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::info;

/// Operation type of traffic validation probes
pub const TRAFFIC_CHECK: &str = "traffic_check";
/// Operation type of remote commands on a VM
pub const REMOTE_COMMAND: &str = "remote_command";

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        }
    }
}

/// Registry of retry policies keyed by operation type
pub struct ServiceResilienceManager {
    retry_configs: Arc<Mutex<HashMap<String, RetryConfig>>>,
}

impl ServiceResilienceManager {
    pub fn new() -> Self {
        let mut retry_configs = HashMap::new();

        // Chain programming reaches the data plane some seconds after the API accepts it
        retry_configs.insert(
            TRAFFIC_CHECK.to_string(),
            RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_secs(2),
                backoff_multiplier: 1.5,
            },
        );

        retry_configs.insert(
            REMOTE_COMMAND.to_string(),
            RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_secs(1),
                backoff_multiplier: 2.0,
            },
        );

        Self {
            retry_configs: Arc::new(Mutex::new(retry_configs)),
        }
    }

    /// Policy for an operation type, the default one when unknown
    pub fn get_retry_config(&self, operation_type: &str) -> RetryConfig {
        self.retry_configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the policy of an operation type
    pub fn set_retry_config(&self, operation_type: &str, config: RetryConfig) {
        info!(
            "Retry policy for '{}': {} attempts from {:?}",
            operation_type, config.max_attempts, config.initial_delay
        );
        self.retry_configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation_type.to_string(), config);
    }

    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        operation: F,
        operation_type: &str,
        operation_name: &str,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let config = self.get_retry_config(operation_type);
        retry_async(
            operation,
            config.max_attempts,
            config.initial_delay,
            config.backoff_multiplier,
            operation_name,
        )
        .await
    }
}

impl Default for ServiceResilienceManager {
    fn default() -> Self {
        Self::new()
    }
}

static RESILIENCE_MANAGER: std::sync::OnceLock<Arc<ServiceResilienceManager>> = std::sync::OnceLock::new();

/// Process-wide policy registry, the default of every orchestrator
pub fn get_resilience_manager() -> Arc<ServiceResilienceManager> {
    RESILIENCE_MANAGER
        .get_or_init(|| Arc::new(ServiceResilienceManager::new()))
        .clone()
}
