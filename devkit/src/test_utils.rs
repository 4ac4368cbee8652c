/*!
Utilitaires de test pour l'agent RelayWatch

Fabrique de registradores et collecteur de notifications pour écrire des
assertions sur ce que le cœur publie.
*/

use relaywatch_agent::models::{BusTarget, Device, DeviceStatus};
use relaywatch_agent::notify::Notification;
use tokio::sync::mpsc;

/// Fabrique un registrador actif prêt pour les tests.
pub fn device(id: &str, interval_seconds: u32) -> Device {
    Device {
        id: id.to_string(),
        name: format!("registrador {id}"),
        target: BusTarget {
            host: format!("host-{id}"),
            port: 502,
            unit_id: 1,
        },
        start_index: 0,
        count: 4,
        timeout_ms: 1000,
        interval_seconds,
        active: true,
        status: DeviceStatus::Active,
        next_read_in: None,
        success_count: 0,
        fail_count: 0,
    }
}

/// Draine le canal de notifications et garde tout pour les assertions.
pub struct NotificationCollector {
    rx: mpsc::UnboundedReceiver<Notification>,
    seen: Vec<Notification>,
}

impl NotificationCollector {
    pub fn new(rx: mpsc::UnboundedReceiver<Notification>) -> Self {
        Self {
            rx,
            seen: Vec::new(),
        }
    }

    /// Vide ce qui est en attente sans bloquer.
    pub fn drain(&mut self) -> &[Notification] {
        while let Ok(n) = self.rx.try_recv() {
            self.seen.push(n);
        }
        &self.seen
    }

    /// Dernier état connu du drapeau de connectivité, s'il a bougé.
    pub fn last_connected(&mut self) -> Option<bool> {
        self.drain()
            .iter()
            .rev()
            .find_map(|n| match n {
                Notification::Connected(up) => Some(*up),
                _ => None,
            })
    }

    /// Dernier état connu du drapeau de cycle.
    pub fn last_polling_active(&mut self) -> Option<bool> {
        self.drain()
            .iter()
            .rev()
            .find_map(|n| match n {
                Notification::PollingActive(active) => Some(*active),
                _ => None,
            })
    }

    /// Messages de log collectés, dans l'ordre.
    pub fn log_messages(&mut self) -> Vec<String> {
        self.drain()
            .iter()
            .filter_map(|n| match n {
                Notification::Log(line) => Some(line.message.clone()),
                _ => None,
            })
            .collect()
    }
}
