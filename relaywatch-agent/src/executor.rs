//! Read and test execution
//!
//! One scheduled read = one bus exchange + one forward + exactly one counter
//! bump. Ad-hoc tests are deduplicated by id while in flight, and report
//! their outcome to the backend without ever touching device state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::backend::BackendApi;
use crate::bus::BusClient;
use crate::models::{Device, DeviceStatus, ReadingRecord, TestKind, TestRequest, TestResult};
use crate::notify::{LogLevel, Notifier};
use crate::registry::DeviceRegistry;
use crate::state::{new_state, Shared};

pub struct ReadExecutor {
    backend: Arc<dyn BackendApi>,
    bus: Arc<dyn BusClient>,
    registry: DeviceRegistry,
    notifier: Notifier,
    tests_in_flight: Shared<HashSet<String>>,
}

impl ReadExecutor {
    pub fn new(
        backend: Arc<dyn BackendApi>,
        bus: Arc<dyn BusClient>,
        registry: DeviceRegistry,
        notifier: Notifier,
    ) -> Self {
        Self {
            backend,
            bus,
            registry,
            notifier,
            tests_in_flight: new_state(HashSet::new()),
        }
    }

    /// One full polling cycle for one device. The counter moves exactly
    /// once, after the forward settled, and reflects the whole chain: a
    /// reading that the backend refused is a failed cycle.
    pub async fn execute_read(&self, device: &Device) {
        self.registry.set_status(&device.id, DeviceStatus::Reading);
        let started = Instant::now();
        let outcome = self
            .bus
            .read_values(
                &device.target,
                device.start_index,
                device.count,
                device.timeout_ms,
            )
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(values) => {
                let record = ReadingRecord::success(&device.id, values, elapsed_ms);
                match self.backend.post_readings(std::slice::from_ref(&record)).await {
                    Ok(inserted) => {
                        self.registry.record_read_outcome(&device.id, true);
                        self.notifier.device_log(
                            LogLevel::Success,
                            &device.id,
                            format!(
                                "{}: {} valeurs en {elapsed_ms}ms ({inserted} insérées)",
                                device.name, record.values.len()
                            ),
                        );
                    }
                    Err(e) => {
                        self.registry.record_read_outcome(&device.id, false);
                        self.notifier.device_log(
                            LogLevel::Error,
                            &device.id,
                            format!("{}: lecture perdue, envoi échoué: {e}", device.name),
                        );
                    }
                }
            }
            Err(e) => {
                // L'échec est aussi remonté au backend, sans bloquer le cycle.
                let record = ReadingRecord::failure(&device.id, elapsed_ms, e.to_string());
                if let Err(post_err) = self.backend.post_readings(std::slice::from_ref(&record)).await {
                    debug!("envoi de l'échec impossible: {post_err}");
                }
                self.registry.record_read_outcome(&device.id, false);
                self.notifier.device_log(
                    LogLevel::Error,
                    &device.id,
                    format!("{}: lecture échouée: {e}", device.name),
                );
            }
        }
    }

    /// One ad-hoc connectivity test. A duplicate id while the first run is
    /// still in flight is dropped silently.
    pub async fn execute_test(&self, request: TestRequest) {
        let Some(_guard) = InFlightGuard::acquire(&self.tests_in_flight, &request.id) else {
            debug!("test {} déjà en cours, doublon ignoré", request.id);
            return;
        };

        self.notifier.log(
            LogLevel::Info,
            format!(
                "test {}: {}:{} unité {}",
                request.id, request.target.host, request.target.port, request.target.unit_id
            ),
        );
        let started = Instant::now();
        let result = match request.kind {
            TestKind::Registers => self
                .bus
                .read_values(
                    &request.target,
                    request.start_index,
                    request.count,
                    request.timeout_ms,
                )
                .await
                .map(|values| TestResult {
                    success: true,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    values: Some(values),
                    bits: None,
                    error: None,
                }),
            TestKind::Coils => self
                .bus
                .read_bits(
                    &request.target,
                    request.start_index,
                    request.count,
                    request.timeout_ms,
                )
                .await
                .map(|bits| TestResult {
                    success: true,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    values: None,
                    bits: Some(bits),
                    error: None,
                }),
        };

        let result = result.unwrap_or_else(|e| TestResult {
            success: false,
            elapsed_ms: started.elapsed().as_millis() as u64,
            values: None,
            bits: None,
            error: Some(e.to_string()),
        });

        let level = if result.success {
            LogLevel::Success
        } else {
            LogLevel::Warning
        };
        self.notifier.log(
            level,
            format!(
                "test {} {} en {}ms",
                request.id,
                if result.success { "réussi" } else { "échoué" },
                result.elapsed_ms
            ),
        );

        if let Err(e) = self.backend.post_test_result(&request.id, &result).await {
            self.notifier
                .log(LogLevel::Error, format!("envoi résultat test {}: {e}", request.id));
        }
    }
}

/// Holds one test id in the in-flight set, released on drop even if the
/// test path panics or returns early.
struct InFlightGuard {
    set: Shared<HashSet<String>>,
    id: String,
}

impl InFlightGuard {
    fn acquire(set: &Shared<HashSet<String>>, id: &str) -> Option<Self> {
        if !set.lock().insert(id.to_string()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            id: id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}
