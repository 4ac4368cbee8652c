/*!
Stub du backend RelayWatch pour tests sans serveur

Enregistre tout ce que l'agent lui envoie (lectures, résultats de test) et
sert une configuration scriptée. Chaque opération peut être forcée en échec
pour exercer les chemins d'erreur.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use relaywatch_agent::backend::BackendApi;
use relaywatch_agent::error::{AgentError, AgentResult};
use relaywatch_agent::models::{Device, ReadingRecord, TestResult};

#[derive(Default)]
struct StubState {
    config: Vec<Device>,
    readings: Vec<ReadingRecord>,
    test_results: Vec<(String, TestResult)>,
    fail_readings: bool,
    fail_config: bool,
}

/// Backend en mémoire, partageable entre le test et l'agent.
#[derive(Clone, Default)]
pub struct StubBackend {
    state: Arc<Mutex<StubState>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixe la configuration que `get_config` servira.
    pub fn set_config(&self, devices: Vec<Device>) {
        self.state.lock().config = devices;
    }

    /// Force l'échec des prochains `post_readings`.
    pub fn fail_readings(&self, fail: bool) {
        self.state.lock().fail_readings = fail;
    }

    /// Force l'échec des prochains `get_config`.
    pub fn fail_config(&self, fail: bool) {
        self.state.lock().fail_config = fail;
    }

    /// Toutes les lectures reçues, dans l'ordre d'arrivée.
    pub fn readings(&self) -> Vec<ReadingRecord> {
        self.state.lock().readings.clone()
    }

    /// Lectures reçues pour un registrador donné.
    pub fn readings_for(&self, device_id: &str) -> Vec<ReadingRecord> {
        self.state
            .lock()
            .readings
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect()
    }

    /// Résultats de test reçus, avec leur id.
    pub fn test_results(&self) -> Vec<(String, TestResult)> {
        self.state.lock().test_results.clone()
    }
}

#[async_trait]
impl BackendApi for StubBackend {
    async fn get_config(&self) -> AgentResult<Vec<Device>> {
        let state = self.state.lock();
        if state.fail_config {
            return Err(AgentError::Transport("stub: config indisponible".into()));
        }
        Ok(state.config.clone())
    }

    async fn post_readings(&self, readings: &[ReadingRecord]) -> AgentResult<u64> {
        let mut state = self.state.lock();
        if state.fail_readings {
            return Err(AgentError::Transport("stub: envoi refusé".into()));
        }
        state.readings.extend_from_slice(readings);
        Ok(readings.len() as u64)
    }

    async fn post_test_result(&self, test_id: &str, result: &TestResult) -> AgentResult<()> {
        self.state
            .lock()
            .test_results
            .push((test_id.to_string(), result.clone()));
        Ok(())
    }
}
