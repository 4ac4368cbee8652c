/*!
Stub du bus Modbus pour tests sans automate

Sert des valeurs scriptées par hôte, journalise chaque appel et peut
simuler la latence d'un appareil lent (pour exercer le saut de cycle).
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relaywatch_agent::bus::BusClient;
use relaywatch_agent::error::{AgentError, AgentResult};
use relaywatch_agent::models::BusTarget;

/// Une entrée du journal d'appels.
#[derive(Debug, Clone)]
pub struct BusCall {
    pub host: String,
    pub start: u16,
    pub count: u16,
}

#[derive(Default)]
struct StubBusState {
    values: HashMap<String, Vec<u16>>,
    bits: HashMap<String, Vec<bool>>,
    failures: HashMap<String, String>,
    latency: Option<Duration>,
    calls: Vec<BusCall>,
}

#[derive(Clone, Default)]
pub struct StubBus {
    state: Arc<Mutex<StubBusState>>,
}

impl StubBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Les lectures de registres sur `host` renverront ces valeurs.
    pub fn script_values(&self, host: &str, values: Vec<u16>) {
        self.state.lock().values.insert(host.to_string(), values);
    }

    /// Les lectures de bobines sur `host` renverront ces bits.
    pub fn script_bits(&self, host: &str, bits: Vec<bool>) {
        self.state.lock().bits.insert(host.to_string(), bits);
    }

    /// Toute lecture sur `host` échouera avec ce message.
    pub fn script_failure(&self, host: &str, message: &str) {
        self.state
            .lock()
            .failures
            .insert(host.to_string(), message.to_string());
    }

    /// Chaque lecture attendra `latency` avant de répondre.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    /// Journal complet des appels, dans l'ordre.
    pub fn calls(&self) -> Vec<BusCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, host: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.host == host)
            .count()
    }

    async fn before_read(&self, target: &BusTarget, start: u16, count: u16) -> AgentResult<()> {
        let latency = {
            let mut state = self.state.lock();
            state.calls.push(BusCall {
                host: target.host.clone(),
                start,
                count,
            });
            if let Some(msg) = state.failures.get(&target.host) {
                return Err(AgentError::Protocol(msg.clone()));
            }
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl BusClient for StubBus {
    async fn read_values(
        &self,
        target: &BusTarget,
        start: u16,
        count: u16,
        _timeout_ms: u64,
    ) -> AgentResult<Vec<u16>> {
        self.before_read(target, start, count).await?;
        let state = self.state.lock();
        Ok(state
            .values
            .get(&target.host)
            .cloned()
            .unwrap_or_else(|| vec![0; count as usize]))
    }

    async fn read_bits(
        &self,
        target: &BusTarget,
        start: u16,
        count: u16,
        _timeout_ms: u64,
    ) -> AgentResult<Vec<bool>> {
        self.before_read(target, start, count).await?;
        let state = self.state.lock();
        Ok(state
            .bits
            .get(&target.host)
            .cloned()
            .unwrap_or_else(|| vec![false; count as usize]))
    }
}
