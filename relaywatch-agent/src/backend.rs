//! HTTP gateway toward the central backend
//!
//! Owns the authenticated session and the level-triggered connectivity flag.
//! Every business call goes through [`HttpBackend::call`], which recovers a
//! `TOKEN_EXPIRED` rejection with exactly one re-authentication followed by
//! one replay. A second expiry on the replay surfaces as an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use crate::models::{
    AuthResponse, ConfigResponse, Device, PostReadingsResponse, ReadingRecord, Session, TestResult,
};
use crate::notify::{LogLevel, Notification, Notifier};
use crate::state::{new_state, Shared};

/// Seam between the executor/scheduler and the HTTP layer. Production uses
/// [`HttpBackend`]; tests plug in a recording stub.
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn get_config(&self) -> AgentResult<Vec<Device>>;
    async fn post_readings(&self, readings: &[ReadingRecord]) -> AgentResult<u64>;
    async fn post_test_result(&self, test_id: &str, result: &TestResult) -> AgentResult<()>;
}

pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
    secret: String,
    request_timeout: Duration,
    session: Shared<Option<Session>>,
    connected: AtomicBool,
    notifier: Notifier,
}

impl HttpBackend {
    pub fn new(config: &AgentConfig, notifier: Notifier) -> Self {
        // Pas de timeout global: il tuerait le flux d'événements. Chaque
        // requête JSON porte son propre timeout.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: config.base_url(),
            secret: config.secret_key.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            session: new_state(None),
            connected: AtomicBool::new(false),
            notifier,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    pub fn clear_session(&self) {
        *self.session.lock() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn token(&self) -> AgentResult<String> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.token.clone())
            .ok_or(AgentError::NotAuthenticated)
    }

    /// Level-triggered flag: a notification fires only on an actual flip.
    fn mark_connected(&self) {
        if !self.connected.swap(true, Ordering::Relaxed) {
            self.notifier.send(Notification::Connected(true));
            self.notifier.log(LogLevel::Success, "backend joignable");
        }
    }

    fn mark_disconnected(&self, reason: &str) {
        if self.connected.swap(false, Ordering::Relaxed) {
            self.notifier.send(Notification::Connected(false));
            self.notifier
                .log(LogLevel::Error, format!("backend injoignable: {reason}"));
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> AgentError {
        let msg = err.to_string();
        if err.is_connect() || err.is_timeout() || err.is_request() {
            self.mark_disconnected(&msg);
            AgentError::Transport(msg)
        } else {
            AgentError::Backend(msg)
        }
    }

    /// One authenticated request, no recovery. Distinguishes transport
    /// failures, token expiry and plain backend rejections.
    async fn send_once(&self, method: reqwest::Method, path: &str, body: Option<&Value>) -> AgentResult<Response> {
        let token = self.token()?;
        let mut req = self
            .http
            .request(method, self.url(path))
            .bearer_auth(token)
            .timeout(self.request_timeout);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(|e| self.transport_error(e))?;
        self.mark_connected();

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            if body["code"] == "TOKEN_EXPIRED" {
                return Err(AgentError::SessionExpired);
            }
            let msg = body["error"].as_str().unwrap_or("non autorisé").to_string();
            return Err(AgentError::Backend(msg));
        }
        if !status.is_success() {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            let msg = body["error"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(AgentError::Backend(msg));
        }
        Ok(resp)
    }

    /// Business call wrapper: on token expiry, re-authenticate once and
    /// replay the request once.
    async fn call(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> AgentResult<Response> {
        match self.send_once(method.clone(), path, body.as_ref()).await {
            Err(AgentError::SessionExpired) => {
                self.notifier
                    .log(LogLevel::Warning, "session expirée, ré-authentification");
                self.clear_session();
                self.authenticate().await?;
                self.send_once(method, path, body.as_ref()).await
            }
            other => other,
        }
    }

    /// `POST /api/agente/auth` with the shared secret. On success the
    /// session replaces any previous one.
    pub async fn authenticate(&self) -> AgentResult<Session> {
        let resp = self
            .http
            .post(self.url("/api/agente/auth"))
            .timeout(self.request_timeout)
            .json(&json!({ "claveSecreta": self.secret }))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.mark_connected();

        let status = resp.status();
        let auth: AuthResponse = resp
            .json()
            .await
            .map_err(|e| AgentError::Backend(format!("réponse auth invalide: {e}")))?;

        if !status.is_success() || !auth.success {
            let msg = auth.error.unwrap_or_else(|| format!("HTTP {status}"));
            return Err(AgentError::AuthFailed(msg));
        }
        let (Some(token), Some(agent)) = (auth.token, auth.agent) else {
            return Err(AgentError::AuthFailed("réponse auth incomplète".into()));
        };
        if let Some(warning) = auth.warning {
            self.notifier.log(LogLevel::Warning, warning);
        }
        let session = Session {
            token,
            agent,
            workspaces: auth.workspaces,
        };
        *self.session.lock() = Some(session.clone());
        Ok(session)
    }

    /// `POST /api/agente/heartbeat`, every 30s while connected.
    pub async fn heartbeat(&self) -> AgentResult<()> {
        let body = json!({ "version": env!("CARGO_PKG_VERSION") });
        self.call(reqwest::Method::POST, "/api/agente/heartbeat", Some(body))
            .await?;
        Ok(())
    }

    /// Forward one presentation log line to the backend. Quiet by design:
    /// a failure here must never generate another log line, or the agent
    /// would feed its own error loop.
    pub async fn post_log(&self, level: &'static str, message: &str) {
        let Ok(token) = self.token() else { return };
        let body = json!({ "nivel": level, "mensaje": message });
        let result = self
            .http
            .post(self.url("/api/agente/log"))
            .bearer_auth(token)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await;
        if let Err(e) = result {
            debug!("post_log échoué: {e}");
        }
    }

    /// `GET /api/agente/eventos`: open the push stream. The caller owns the
    /// response body and its lifetime.
    pub async fn open_event_stream(&self) -> AgentResult<Response> {
        let token = self.token()?;
        let resp = self
            .http
            .get(self.url("/api/agente/eventos"))
            .bearer_auth(token)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(AgentError::SessionExpired);
        }
        if !status.is_success() {
            return Err(AgentError::Stream(format!("HTTP {status}")));
        }
        self.mark_connected();
        Ok(resp)
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn get_config(&self) -> AgentResult<Vec<Device>> {
        let resp = self
            .call(reqwest::Method::GET, "/api/agente/config", None)
            .await?;
        let config: ConfigResponse = resp
            .json()
            .await
            .map_err(|e| AgentError::Backend(format!("config invalide: {e}")))?;
        Ok(config.devices.into_iter().map(Device::from).collect())
    }

    async fn post_readings(&self, readings: &[ReadingRecord]) -> AgentResult<u64> {
        let body = json!({ "lecturas": readings });
        let resp = self
            .call(reqwest::Method::POST, "/api/agente/lecturas", Some(body))
            .await?;
        let reply: PostReadingsResponse = resp
            .json()
            .await
            .map_err(|e| AgentError::Backend(format!("réponse lecturas invalide: {e}")))?;
        // Le backend peut répondre 200 avec ok=false (lot rejeté): le cycle
        // compte alors comme un échec.
        if !reply.ok {
            return Err(AgentError::Backend("lot de lecturas refusé".into()));
        }
        Ok(reply.inserted)
    }

    async fn post_test_result(&self, test_id: &str, result: &TestResult) -> AgentResult<()> {
        let body = serde_json::to_value(result)
            .map_err(|e| AgentError::Backend(format!("sérialisation résultat: {e}")))?;
        let path = format!("/api/agente/tests/{test_id}/resultado");
        self.call(reqwest::Method::POST, &path, Some(body)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> HttpBackend {
        let (notifier, rx) = Notifier::channel();
        std::mem::forget(rx);
        let config = AgentConfig {
            backend_url: "http://127.0.0.1:9".into(),
            secret_key: "agt_test".into(),
            ..AgentConfig::default()
        };
        HttpBackend::new(&config, notifier)
    }

    #[test]
    fn starts_unauthenticated_and_disconnected() {
        let backend = backend();
        assert!(!backend.is_authenticated());
        assert!(!backend.is_connected());
    }

    #[test]
    fn token_without_session_is_an_error() {
        let backend = backend();
        assert!(matches!(
            backend.token(),
            Err(AgentError::NotAuthenticated)
        ));
    }

    #[test]
    fn connectivity_flag_is_level_triggered() {
        let (notifier, mut rx) = Notifier::channel();
        let config = AgentConfig {
            secret_key: "agt_test".into(),
            ..AgentConfig::default()
        };
        let backend = HttpBackend::new(&config, notifier);

        backend.mark_connected();
        backend.mark_connected();
        backend.mark_disconnected("test");
        backend.mark_disconnected("test");

        let mut flips = Vec::new();
        while let Ok(n) = rx.try_recv() {
            if let Notification::Connected(up) = n {
                flips.push(up);
            }
        }
        assert_eq!(flips, vec![true, false]);
    }

    #[test]
    fn url_concatenation() {
        let backend = backend();
        assert_eq!(
            backend.url("/api/agente/auth"),
            "http://127.0.0.1:9/api/agente/auth"
        );
    }
}
