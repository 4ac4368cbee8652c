//! Backend push channel (server-sent events)
//!
//! The decoder is pure and incremental: bytes in, complete events out,
//! partial records kept across pushes. The client layers the watchdog and
//! the reconnect policy on top and dispatches decoded events to the
//! scheduler and the executor.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::backend::{BackendApi, HttpBackend};
use crate::error::AgentError;
use crate::executor::ReadExecutor;
use crate::models::{TestKind, TestRequestDto};
use crate::notify::{LogLevel, Notifier};
use crate::scheduler::PollingScheduler;

/// One complete server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental SSE decoder. Feed it raw chunks in any split; it yields only
/// complete records (terminated by a blank line) and keeps the rest buffered.
#[derive(Default)]
pub struct SseDecoder {
    buf: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');
            if line.is_empty() {
                if let Some(event) = self.flush() {
                    out.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue; // commentaire keep-alive
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {} // id, retry: ignorés
            }
        }
        out
    }

    /// End of record: emit if there is data, drop the empty shells. A record
    /// whose `data:` lines are all empty counts as empty too.
    fn flush(&mut self) -> Option<SseEvent> {
        let event = self.event.take().unwrap_or_else(|| "message".to_string());
        let data = std::mem::take(&mut self.data).join("\n");
        if data.trim().is_empty() {
            return None;
        }
        Some(SseEvent { event, data })
    }
}

/// How a consume pass ended.
#[derive(Debug)]
pub enum StreamEnd {
    /// Server closed the body cleanly.
    Closed,
    /// Transport or protocol failure.
    Errored(String),
    /// No bytes for longer than the silence limit.
    Silent,
}

/// Reconnect policy: any ending gets one retry after the fixed delay, but
/// only while a session exists. Teardown clears the session first, so a
/// deliberate shutdown never reconnects.
pub fn reconnect_after(_end: &StreamEnd, authenticated: bool, delay: Duration) -> Option<Duration> {
    authenticated.then_some(delay)
}

/// Watchdog decision, sampled every 10s: the stream is declared silent once
/// no byte has arrived for strictly longer than the limit.
pub fn silence_exceeded(since_last_byte: Duration, limit: Duration) -> bool {
    since_last_byte > limit
}

pub struct EventStreamClient {
    backend: Arc<HttpBackend>,
    scheduler: Arc<PollingScheduler>,
    executor: Arc<ReadExecutor>,
    notifier: Notifier,
    reconnect_delay: Duration,
    silence_limit: Duration,
}

impl EventStreamClient {
    pub fn new(
        backend: Arc<HttpBackend>,
        scheduler: Arc<PollingScheduler>,
        executor: Arc<ReadExecutor>,
        notifier: Notifier,
        reconnect_delay_secs: u64,
        silence_limit_secs: u64,
    ) -> Self {
        Self {
            backend,
            scheduler,
            executor,
            notifier,
            reconnect_delay: Duration::from_secs(reconnect_delay_secs),
            silence_limit: Duration::from_secs(silence_limit_secs),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        loop {
            let end = self.consume_stream().await;
            debug!("flux d'événements terminé: {end:?}");
            match reconnect_after(&end, self.backend.is_authenticated(), self.reconnect_delay) {
                Some(delay) => {
                    self.notifier.log(
                        LogLevel::Warning,
                        format!("flux interrompu, reconnexion dans {}s", delay.as_secs()),
                    );
                    tokio::time::sleep(delay).await;
                    // La session a pu être détruite pendant l'attente.
                    if !self.backend.is_authenticated() {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    async fn consume_stream(&self) -> StreamEnd {
        let resp = match self.backend.open_event_stream().await {
            Ok(resp) => resp,
            Err(AgentError::SessionExpired) => {
                if let Err(e) = self.backend.authenticate().await {
                    return StreamEnd::Errored(e.to_string());
                }
                match self.backend.open_event_stream().await {
                    Ok(resp) => resp,
                    Err(e) => return StreamEnd::Errored(e.to_string()),
                }
            }
            Err(e) => return StreamEnd::Errored(e.to_string()),
        };

        self.notifier.log(LogLevel::Info, "flux d'événements ouvert");
        let mut body = resp.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut last_byte = Instant::now();
        // Le chien de garde échantillonne toutes les 10s; le flux est déclaré
        // muet après silence_limit sans octet (les heartbeats arrivent bien
        // avant).
        let mut watchdog = tokio::time::interval(Duration::from_secs(10));
        watchdog.tick().await;

        loop {
            tokio::select! {
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        last_byte = Instant::now();
                        for event in decoder.push(&bytes) {
                            self.dispatch(event).await;
                        }
                    }
                    Some(Err(e)) => return StreamEnd::Errored(e.to_string()),
                    None => return StreamEnd::Closed,
                },
                _ = watchdog.tick() => {
                    if silence_exceeded(last_byte.elapsed(), self.silence_limit) {
                        return StreamEnd::Silent;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, event: SseEvent) {
        match event.event.as_str() {
            "connected" => {
                self.notifier.log(LogLevel::Info, "canal temps réel confirmé");
            }
            "heartbeat" => {} // garde le flux vivant, rien à faire
            "test-registrador" => self.launch_test(&event.data, TestKind::Registers),
            "test-coils" => self.launch_test(&event.data, TestKind::Coils),
            "config-actualizada" => {
                self.notifier
                    .log(LogLevel::Info, "configuration modifiée, resynchronisation");
                match self.backend.get_config().await {
                    Ok(devices) => {
                        self.scheduler.reconcile(devices).await;
                        // Relance le cycle si l'agent avait démarré sans
                        // registrador actif (no-op sinon).
                        self.scheduler.start();
                    }
                    Err(e) => self
                        .notifier
                        .log(LogLevel::Error, format!("rechargement config: {e}")),
                }
            }
            other => debug!("événement inconnu ignoré: {other}"),
        }
    }

    /// Tests run detached so a slow device never blocks the stream loop.
    fn launch_test(&self, data: &str, kind: TestKind) {
        let dto: TestRequestDto = match serde_json::from_str(data) {
            Ok(dto) => dto,
            Err(e) => {
                self.notifier
                    .log(LogLevel::Error, format!("demande de test invalide: {e}"));
                return;
            }
        };
        let executor = Arc::clone(&self.executor);
        let request = dto.into_request(kind);
        tokio::spawn(async move {
            executor.execute_test(request).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_complete_record() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b"event: heartbeat\ndata: {\"ts\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "heartbeat");
        assert_eq!(events[0].data, "{\"ts\":1}");
    }

    #[test]
    fn reassembles_records_split_across_chunks() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"event: test-regis").is_empty());
        assert!(dec.push(b"trador\ndata: {\"id\":").is_empty());
        let events = dec.push(b"\"t1\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "test-registrador");
        assert_eq!(events[0].data, "{\"id\":\"t1\"}");
    }

    #[test]
    fn event_without_data_is_dropped() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b"event: connected\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn event_with_empty_data_value_is_dropped() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"event: test-registrador\ndata:\n\n").is_empty());
        assert!(dec.push(b"event: heartbeat\ndata: \n\n").is_empty());
        // le décodeur repart proprement sur l'enregistrement suivant
        let events = dec.push(b"data: ok\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "ok");
    }

    #[test]
    fn data_only_record_defaults_to_message() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b"data: hola\n\n");
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "hola");
    }

    #[test]
    fn multiline_data_is_joined() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b"data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn comments_and_crlf_are_handled() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b": keep-alive\r\nevent: heartbeat\r\ndata: {}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "heartbeat");
    }

    #[test]
    fn silent_stream_is_abandoned_then_reconnected_once() {
        let limit = Duration::from_secs(60);
        // 60s pile n'est pas encore un silence, 61s oui
        assert!(!silence_exceeded(Duration::from_secs(59), limit));
        assert!(!silence_exceeded(Duration::from_secs(60), limit));
        assert!(silence_exceeded(Duration::from_secs(61), limit));

        // un flux muet obtient exactement une reconnexion planifiée à 3s
        assert_eq!(
            reconnect_after(&StreamEnd::Silent, true, Duration::from_secs(3)),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn reconnect_only_while_authenticated() {
        let delay = Duration::from_secs(3);
        assert_eq!(
            reconnect_after(&StreamEnd::Closed, true, delay),
            Some(delay)
        );
        assert_eq!(
            reconnect_after(&StreamEnd::Silent, true, delay),
            Some(delay)
        );
        assert_eq!(reconnect_after(&StreamEnd::Closed, false, delay), None);
        assert_eq!(
            reconnect_after(&StreamEnd::Errored("x".into()), false, delay),
            None
        );
    }
}
