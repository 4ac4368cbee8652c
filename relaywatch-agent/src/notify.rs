//! Typed notification channel toward the presentation layer
//!
//! The core never renders anything: status deltas, countdown ticks,
//! connectivity flips and free-text log lines all flow through one
//! [`Notifier`] so the consumer (tray, window, plain stdout) stays outside
//! the engine. Every log line is also mirrored to the tracing subscriber.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::models::{AgentIdentity, Device, DeviceStatus, Workspace};

/// Severity of a presentation log line (original: info/exito/advertencia/
/// error/ciclo).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
    Cycle,
}

impl LogLevel {
    /// Wire name used by `POST /api/agente/log`.
    pub fn wire_name(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Success => "exito",
            LogLevel::Warning => "advertencia",
            LogLevel::Error => "error",
            LogLevel::Cycle => "ciclo",
        }
    }

    /// Whether a line of this severity is forwarded to the backend log.
    /// Info/success/cycle lines stay local, they would flood the backend.
    pub fn is_relayed(&self) -> bool {
        matches!(self, LogLevel::Warning | LogLevel::Error)
    }
}

/// Per-device status delta pushed after every transition.
#[derive(Debug, Clone, Serialize)]
pub struct StatusDelta {
    pub id: String,
    pub status: DeviceStatus,
    pub countdown: Option<u32>,
    pub success_count: u64,
    pub fail_count: u64,
}

impl StatusDelta {
    pub fn of(device: &Device) -> Self {
        Self {
            id: device.id.clone(),
            status: device.status,
            countdown: device.next_read_in,
            success_count: device.success_count,
            fail_count: device.fail_count,
        }
    }
}

/// A free-text log line tagged by severity, optionally bound to a device.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
    pub device_id: Option<String>,
}

/// Everything the presentation layer can receive from the core.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Level-triggered connectivity flag of the backend gateway.
    Connected(bool),
    Authenticated(AgentIdentity),
    WorkspaceLinked(Workspace),
    /// Full immutable snapshot of the live device set.
    DeviceSet(Vec<Device>),
    DeviceDelta(StatusDelta),
    /// One entry per armed device, emitted by the shared 1s ticker.
    Countdowns(HashMap<String, u32>),
    PollingActive(bool),
    Log(LogLine),
}

/// Cloneable sender half handed to every component of the core.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, notification: Notification) {
        // A dropped receiver just means nobody is watching.
        let _ = self.tx.send(notification);
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.log_line(level, message, None);
    }

    pub fn device_log(&self, level: LogLevel, device_id: &str, message: impl Into<String>) {
        self.log_line(level, message, Some(device_id.to_string()));
    }

    fn log_line(&self, level: LogLevel, message: impl Into<String>, device_id: Option<String>) {
        let message = message.into();
        match level {
            LogLevel::Warning => warn!("{message}"),
            LogLevel::Error => error!("{message}"),
            _ => info!("{message}"),
        }
        self.send(Notification::Log(LogLine {
            level,
            message,
            device_id,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_lines_reach_the_receiver() {
        let (notifier, mut rx) = Notifier::channel();
        notifier.device_log(LogLevel::Cycle, "reg-1", "first read in 8s");

        match rx.recv().await.unwrap() {
            Notification::Log(line) => {
                assert_eq!(line.level, LogLevel::Cycle);
                assert_eq!(line.device_id.as_deref(), Some("reg-1"));
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[test]
    fn send_without_receiver_is_silent() {
        let (notifier, rx) = Notifier::channel();
        drop(rx);
        notifier.log(LogLevel::Info, "nobody listening");
    }

    #[test]
    fn wire_names_match_backend_contract() {
        assert_eq!(LogLevel::Success.wire_name(), "exito");
        assert_eq!(LogLevel::Warning.wire_name(), "advertencia");
        assert_eq!(LogLevel::Cycle.wire_name(), "ciclo");
    }

    #[test]
    fn only_severe_levels_are_relayed() {
        assert!(LogLevel::Warning.is_relayed());
        assert!(LogLevel::Error.is_relayed());
        assert!(!LogLevel::Info.is_relayed());
        assert!(!LogLevel::Success.is_relayed());
        assert!(!LogLevel::Cycle.is_relayed());
    }
}
