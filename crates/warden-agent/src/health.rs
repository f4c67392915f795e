use std::{collections::BTreeMap, time::Duration};

use anyhow::Context;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use warden_process::{ComponentId, HealthState, HealthStatus, ReadinessStatus};

use crate::settings::HealthSettings;
use crate::support::{compute_backoff, now_unix_ms, truncate_utf8};

const MAX_ERROR_BYTES: usize = 512;

/// Progress emitted while waiting for a component to become healthy.
#[derive(Debug, Clone)]
pub struct HealthProgress {
    pub component_id: ComponentId,
    pub elapsed: Duration,
    pub timeout: Duration,
    pub state: HealthState,
}

#[derive(Debug, Default, serde::Deserialize)]
struct HealthBody {
    status: Option<String>,
    version: Option<String>,
    ready: Option<serde_json::Value>,
}

fn state_from_body_status(status: Option<&str>) -> HealthState {
    match status.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        Some("unhealthy") | Some("error") | Some("down") | Some("fail") | Some("failed") => {
            HealthState::Unhealthy
        }
        Some("starting") | Some("initializing") | Some("warming") => HealthState::Starting,
        _ => HealthState::Healthy,
    }
}

/// Accepts `true`, `"true"`, `"ok"`, `"ready"`, `"yes"`, `1`.
pub(crate) fn truthy(v: &serde_json::Value) -> bool {
    match v {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "ok" | "ready" | "yes" | "1"
        ),
        _ => false,
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn classify_transport_error(err: &reqwest::Error) -> HealthState {
    if err.is_timeout() {
        HealthState::Timeout
    } else if err.is_connect() {
        HealthState::NotRunning
    } else {
        HealthState::Error
    }
}

/// Polls component HTTP health endpoints. Never mutates processes.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: reqwest::Client,
    settings: HealthSettings,
    host: String,
}

impl HealthChecker {
    pub fn new(settings: HealthSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("warden/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.request_timeout)
            .build()
            .context("build health client")?;
        Ok(Self {
            client,
            settings,
            host: "127.0.0.1".to_string(),
        })
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{}{}", self.host, port, normalize_path(path))
    }

    pub async fn check_health(&self, id: &ComponentId, port: u16) -> HealthStatus {
        self.check_health_with(id, port, &self.settings.paths, self.settings.attempts)
            .await
    }

    /// Retries with exponential backoff until healthy, out of attempts, or out of budget.
    pub async fn check_health_with(
        &self,
        id: &ComponentId,
        port: u16,
        paths: &[String],
        attempts: u32,
    ) -> HealthStatus {
        let attempts = attempts.max(1);
        let deadline = tokio::time::Instant::now() + self.settings.budget;
        let mut attempt = 1;
        loop {
            let mut status = self.probe(port, paths).await;
            status.attempts = attempt;
            if status.state.is_healthy() {
                tracing::debug!(component = %id, port, endpoint = ?status.endpoint, attempt, "healthy");
                return status;
            }

            let now = tokio::time::Instant::now();
            if attempt >= attempts || now >= deadline {
                tracing::debug!(
                    component = %id,
                    port,
                    state = ?status.state,
                    error = ?status.last_error,
                    attempt,
                    "health check failed"
                );
                return status;
            }

            let backoff = compute_backoff(self.settings.backoff_base, self.settings.backoff_max, attempt)
                .min(deadline.saturating_duration_since(now));
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// One pass over the candidate paths. 2xx wins; 404/405 moves on; anything else is
    /// remembered and the next candidate is tried.
    pub async fn probe(&self, port: u16, paths: &[String]) -> HealthStatus {
        let mut failure: Option<HealthStatus> = None;
        let mut not_found = Vec::new();

        for path in paths {
            let path = normalize_path(path);
            let started = tokio::time::Instant::now();
            let resp = match self.client.get(self.url(port, &path)).send().await {
                Ok(r) => r,
                Err(e) => {
                    let state = classify_transport_error(&e);
                    let status = HealthStatus {
                        state,
                        response_time_ms: None,
                        last_error: Some(truncate_utf8(&format!("GET {path}: {e}"), MAX_ERROR_BYTES)),
                        endpoint: Some(path),
                        checked_at_unix_ms: now_unix_ms(),
                        ..HealthStatus::default()
                    };
                    // Refused or hung: the other candidates live on the same socket.
                    if matches!(state, HealthState::NotRunning | HealthState::Timeout) {
                        return status;
                    }
                    failure = Some(status);
                    continue;
                }
            };

            let code = resp.status();
            let elapsed_ms = started.elapsed().as_millis() as u64;

            if code.is_success() {
                let body: HealthBody = resp
                    .bytes()
                    .await
                    .ok()
                    .and_then(|b| serde_json::from_slice(&b).ok())
                    .unwrap_or_default();
                return HealthStatus {
                    state: state_from_body_status(body.status.as_deref()),
                    response_time_ms: Some(elapsed_ms),
                    version: body.version,
                    last_error: None,
                    endpoint: Some(path),
                    ready: body.ready.as_ref().map(truthy),
                    checked_at_unix_ms: now_unix_ms(),
                    attempts: 0,
                };
            }

            if code == StatusCode::NOT_FOUND || code == StatusCode::METHOD_NOT_ALLOWED {
                not_found.push(path);
                continue;
            }

            failure = Some(HealthStatus {
                state: HealthState::Unhealthy,
                response_time_ms: Some(elapsed_ms),
                last_error: Some(format!("GET {path} returned {code}")),
                endpoint: Some(path),
                checked_at_unix_ms: now_unix_ms(),
                ..HealthStatus::default()
            });
        }

        failure.unwrap_or_else(|| HealthStatus {
            state: HealthState::Unhealthy,
            last_error: Some(format!(
                "no health endpoint answered (404/405 on {})",
                not_found.join(", ")
            )),
            checked_at_unix_ms: now_unix_ms(),
            ..HealthStatus::default()
        })
    }

    /// Readiness is layered on top of liveness; callers treat it as optional.
    pub async fn check_readiness(&self, id: &ComponentId, port: u16) -> ReadinessStatus {
        let path = normalize_path(&self.settings.readiness_path);
        let resp = match self.client.get(self.url(port, &path)).send().await {
            Ok(r) => r,
            Err(e) => {
                return ReadinessStatus {
                    ready: false,
                    error: Some(truncate_utf8(&format!("GET {path}: {e}"), MAX_ERROR_BYTES)),
                    ..ReadinessStatus::default()
                };
            }
        };

        let code = resp.status();
        let body: Option<serde_json::Value> = resp
            .bytes()
            .await
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok());

        let mut out = ReadinessStatus {
            ready: code.is_success(),
            ..ReadinessStatus::default()
        };
        if let Some(serde_json::Value::Object(map)) = body {
            if let Some(v) = map.get("ready") {
                out.ready = code.is_success() && truthy(v);
            }
            out.version = map
                .get("version")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            if let Some(serde_json::Value::Object(checks)) = map.get("checks") {
                out.checks = checks
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<BTreeMap<_, _>>();
            }
        }
        if !code.is_success() {
            out.error = Some(format!("GET {path} returned {code}"));
        }
        tracing::debug!(component = %id, port, ready = out.ready, "readiness checked");
        out
    }

    /// Capability discovery: a JSON array, or an object with a `capabilities` array.
    /// Items may be strings or objects with a `name`.
    pub async fn fetch_capabilities(&self, port: u16) -> Option<Vec<String>> {
        let resp = self
            .client
            .get(self.url(port, &self.settings.capabilities_path))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let v: serde_json::Value = resp.json().await.ok()?;
        let items = match &v {
            serde_json::Value::Array(a) => a,
            serde_json::Value::Object(m) => m.get("capabilities")?.as_array()?,
            _ => return None,
        };
        Some(
            items
                .iter()
                .filter_map(|i| match i {
                    serde_json::Value::String(s) => Some(s.clone()),
                    serde_json::Value::Object(o) => {
                        o.get("name").and_then(|n| n.as_str()).map(|s| s.to_string())
                    }
                    _ => None,
                })
                .collect(),
        )
    }

    /// Polls at a fixed short interval until healthy or `timeout` elapses.
    pub async fn wait_for_healthy(
        &self,
        id: &ComponentId,
        port: u16,
        paths: &[String],
        timeout: Duration,
        progress: Option<&mpsc::UnboundedSender<HealthProgress>>,
    ) -> HealthStatus {
        let started = tokio::time::Instant::now();
        let deadline = started + timeout;
        let mut next_progress = started + self.settings.progress_interval;
        let mut polls: u32 = 0;

        loop {
            let mut status = self.probe(port, paths).await;
            polls = polls.saturating_add(1);
            status.attempts = polls;
            if status.state.is_healthy() {
                return status;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                if status.last_error.is_none() {
                    status.last_error = Some(format!(
                        "not healthy within {}ms",
                        timeout.as_millis()
                    ));
                }
                return status;
            }

            if now >= next_progress {
                let elapsed = now.duration_since(started);
                tracing::info!(
                    component = %id,
                    port,
                    elapsed_s = elapsed.as_secs(),
                    timeout_s = timeout.as_secs(),
                    state = ?status.state,
                    "waiting for health"
                );
                if let Some(tx) = progress {
                    let _ = tx.send(HealthProgress {
                        component_id: id.clone(),
                        elapsed,
                        timeout,
                        state: status.state,
                    });
                }
                next_progress = now + self.settings.progress_interval;
            }

            let remaining = deadline.saturating_duration_since(now);
            tokio::time::sleep(self.settings.poll_interval.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use axum::{Json, Router, http::StatusCode as AxumStatus, routing::get, routing::post};
    use serde_json::json;

    use super::*;
    use crate::test_support::{closed_port, fast_settings, serve};

    fn checker() -> HealthChecker {
        HealthChecker::new(fast_settings().health).unwrap()
    }

    fn id() -> ComponentId {
        ComponentId::from("vector-store")
    }

    #[tokio::test]
    async fn falls_back_from_404_to_status_endpoint() {
        let app = Router::new().route("/status", get(|| async { Json(json!({"status": "ok", "version": "1.4.0"})) }));
        let port = serve(app).await;

        let st = checker().check_health(&id(), port).await;
        assert_eq!(st.state, HealthState::Healthy);
        assert_eq!(st.endpoint.as_deref(), Some("/status"));
        assert_eq!(st.version.as_deref(), Some("1.4.0"));
        assert!(st.response_time_ms.is_some());
    }

    #[tokio::test]
    async fn method_not_allowed_moves_to_next_candidate() {
        let app = Router::new()
            .route("/health", post(|| async { "nope" }))
            .route("/healthz", get(|| async { "ok" }));
        let port = serve(app).await;

        let st = checker().check_health(&id(), port).await;
        assert_eq!(st.state, HealthState::Healthy);
        assert_eq!(st.endpoint.as_deref(), Some("/healthz"));
    }

    #[tokio::test]
    async fn server_error_is_recorded_after_final_attempt() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/health",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::INTERNAL_SERVER_ERROR
                }
            }),
        );
        let port = serve(app).await;

        let c = checker();
        let st = c.check_health(&id(), port).await;
        assert_eq!(st.state, HealthState::Unhealthy);
        assert_eq!(st.attempts, c.settings().attempts);
        assert_eq!(hits.load(Ordering::SeqCst), c.settings().attempts as usize);
        assert!(st.last_error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn server_error_on_first_candidate_still_tries_the_rest() {
        let app = Router::new()
            .route("/health", get(|| async { AxumStatus::SERVICE_UNAVAILABLE }))
            .route("/status", get(|| async { "ok" }));
        let port = serve(app).await;

        let st = checker().check_health(&id(), port).await;
        assert_eq!(st.state, HealthState::Healthy);
        assert_eq!(st.endpoint.as_deref(), Some("/status"));
    }

    #[tokio::test]
    async fn body_status_can_downgrade_a_2xx() {
        let app = Router::new().route("/health", get(|| async { Json(json!({"status": "degraded-but-up"})) }))
            .route("/healthz", get(|| async { Json(json!({"status": "unhealthy"})) }));
        let port = serve(app).await;

        let c = checker();
        let st = c.probe(port, &["/healthz".to_string()]).await;
        assert_eq!(st.state, HealthState::Unhealthy);
        let st = c.probe(port, &["/health".to_string()]).await;
        assert_eq!(st.state, HealthState::Healthy);
    }

    #[tokio::test]
    async fn refused_connection_is_not_running() {
        let port = closed_port().await;
        let st = checker().check_health(&id(), port).await;
        assert_eq!(st.state, HealthState::NotRunning);
        assert!(st.last_error.is_some());
    }

    #[tokio::test]
    async fn readiness_parses_structured_checks() {
        let app = Router::new().route(
            "/ready",
            get(|| async {
                Json(json!({
                    "ready": "ok",
                    "version": "2.0.1",
                    "checks": {"db": {"status": "pass"}, "cache": {"status": "pass"}}
                }))
            }),
        );
        let port = serve(app).await;

        let r = checker().check_readiness(&id(), port).await;
        assert!(r.ready);
        assert_eq!(r.version.as_deref(), Some("2.0.1"));
        assert_eq!(r.checks.len(), 2);
        assert!(r.error.is_none());
    }

    #[tokio::test]
    async fn readiness_503_is_not_ready() {
        let app = Router::new().route(
            "/ready",
            get(|| async { (AxumStatus::SERVICE_UNAVAILABLE, Json(json!({"ready": true}))) }),
        );
        let port = serve(app).await;

        let r = checker().check_readiness(&id(), port).await;
        assert!(!r.ready);
        assert!(r.error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn capabilities_accept_both_shapes() {
        let app = Router::new().route(
            "/capabilities",
            get(|| async { Json(json!({"capabilities": ["embed", {"name": "search"}, 7]})) }),
        );
        let port = serve(app).await;
        let caps = checker().fetch_capabilities(port).await.unwrap();
        assert_eq!(caps, vec!["embed".to_string(), "search".to_string()]);
    }

    #[tokio::test]
    async fn wait_for_healthy_returns_once_component_comes_up() {
        let up = Arc::new(AtomicBool::new(false));
        let flag = up.clone();
        let app = Router::new().route(
            "/health",
            get(move || {
                let flag = flag.clone();
                async move {
                    if flag.load(Ordering::SeqCst) {
                        AxumStatus::OK
                    } else {
                        AxumStatus::SERVICE_UNAVAILABLE
                    }
                }
            }),
        );
        let port = serve(app).await;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            up.store(true, Ordering::SeqCst);
        });

        let c = checker();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let st = c
            .wait_for_healthy(&id(), port, &["/health".to_string()], Duration::from_secs(5), Some(&tx))
            .await;
        assert!(st.state.is_healthy());
        assert!(st.attempts > 1);
        // Progress interval in test settings is 100ms, so at least one update was sent.
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn wait_for_healthy_gives_up_at_timeout() {
        let port = closed_port().await;
        let started = tokio::time::Instant::now();
        let st = checker()
            .wait_for_healthy(&id(), port, &["/health".to_string()], Duration::from_millis(400), None)
            .await;
        assert!(!st.state.is_healthy());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn truthy_values() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!("READY")));
        assert!(truthy(&json!(1)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("no")));
        assert!(!truthy(&json!(null)));
    }
}
