//! Background endpoint health checking.
//!
//! One task sweeps the endpoint set every `health.check-interval`. In
//! auto-switch mode only the active group's endpoints are probed; in manual
//! mode every endpoint is, so operators can see which backup group is worth
//! activating. A 2xx from `GET <url><health-path>` marks the endpoint
//! healthy and resets its failure streak; any other response or transport
//! error marks it unhealthy.

use std::time::{Duration, Instant};

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::HealthSettings;
use crate::endpoint::EndpointConfig;
use crate::group::GroupManager;
use crate::logging::{log_debug, log_warn};

/// Periodic health sweeper over the manager's endpoint set.
pub struct HealthChecker {
    manager: Arc<GroupManager>,
    client: reqwest::Client,
    settings: HealthSettings,
    cancel: CancellationToken,
}

impl HealthChecker {
    pub fn new(
        manager: Arc<GroupManager>,
        client: reqwest::Client,
        settings: HealthSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager,
            client,
            settings,
            cancel,
        }
    }

    /// Start the background loop. The first sweep runs immediately; the
    /// task stops when the cancellation token fires.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Endpoints start optimistic; the first sweep waits one full
            // interval instead of firing at startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = ticker.tick() => self.run_sweep().await,
                }
            }
            log_debug!("Health checker stopped");
        })
    }

    /// Run one sweep on demand (operator command path). Checks are issued
    /// concurrently and each result is recorded as it lands.
    pub async fn run_sweep(&self) {
        let endpoints = self.manager.endpoints_to_check();
        if endpoints.is_empty() {
            return;
        }
        let checks = endpoints.into_iter().map(|endpoint| async move {
            let (healthy, response_time) = self.check_endpoint(&endpoint).await;
            self.manager
                .record_health_result(&endpoint.name, healthy, response_time);
        });
        futures_util::future::join_all(checks).await;
    }

    async fn check_endpoint(&self, endpoint: &EndpointConfig) -> (bool, Option<Duration>) {
        let url = format!("{}{}", endpoint.url, self.settings.health_path);
        let (token, api_key) = self.manager.resolve_credentials(&endpoint.name);

        let mut request = self.client.get(&url).timeout(self.settings.timeout);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(api_key) = api_key {
            request = request.header("x-api-key", api_key);
        }

        let started = Instant::now();
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                let elapsed = started.elapsed();
                log_debug!(
                    endpoint = %endpoint.name,
                    response_time_ms = elapsed.as_millis(),
                    "Endpoint healthy"
                );
                (true, Some(elapsed))
            }
            Ok(response) => {
                log_warn!(
                    endpoint = %endpoint.name,
                    status = response.status().as_u16(),
                    "Endpoint health check returned non-success"
                );
                (false, Some(started.elapsed()))
            }
            Err(error) => {
                log_warn!(
                    endpoint = %endpoint.name,
                    error = %error,
                    "Endpoint health check failed"
                );
                (false, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointEntry, RelayConfig};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn manager_for(url: String) -> Arc<GroupManager> {
        let mut config = RelayConfig::default();
        config.endpoints.push(EndpointEntry {
            name: "primary".to_string(),
            url,
            token: Some("tok".to_string()),
            ..Default::default()
        });
        config.apply_inheritance();
        GroupManager::new(&config, reqwest::Client::new())
    }

    #[tokio::test]
    async fn sweep_marks_endpoints_by_health_path_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let manager = manager_for(server.uri()).await;
        let checker = HealthChecker::new(
            Arc::clone(&manager),
            reqwest::Client::new(),
            HealthSettings::default(),
            CancellationToken::new(),
        );
        checker.run_sweep().await;
        assert_eq!(manager.healthy_endpoints("default"), 0);

        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        checker.run_sweep().await;
        assert_eq!(manager.healthy_endpoints("default"), 1);
    }

    #[tokio::test]
    async fn transport_failure_marks_unhealthy() {
        // Nothing listens on this port.
        let manager = manager_for("http://127.0.0.1:1".to_string()).await;
        let checker = HealthChecker::new(
            Arc::clone(&manager),
            reqwest::Client::new(),
            HealthSettings {
                timeout: Duration::from_millis(200),
                ..Default::default()
            },
            CancellationToken::new(),
        );
        checker.run_sweep().await;
        assert_eq!(manager.healthy_endpoints("default"), 0);
    }
}
