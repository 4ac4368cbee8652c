//! Polling scheduler
//!
//! One timer task per active device, offset by a stagger computed from the
//! mean interval so a cold start does not fire every device at once. A
//! shared 1s ticker drives the countdown display. `reconcile` adjusts the
//! live set without restarting the timers that did not change.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::executor::ReadExecutor;
use crate::models::{Device, DeviceStatus};
use crate::notify::{LogLevel, Notification, Notifier};
use crate::registry::DeviceRegistry;

/// Initial offset between device starts: ceil(mean interval / device count),
/// i.e. ceil(sum / n²). Two devices at 10s and 20s start 8s apart.
pub fn stagger_seconds(intervals: &[u32]) -> u32 {
    let n = intervals.len() as u64;
    if n == 0 {
        return 0;
    }
    let sum: u64 = intervals.iter().map(|&i| i as u64).sum();
    ((sum + n * n - 1) / (n * n)) as u32
}

#[derive(Default)]
struct SchedulerInner {
    running: bool,
    timers: HashMap<String, JoinHandle<()>>,
    // Un drapeau occupé par registrador, détenu ici et non par le timer: il
    // survit aux réarmements (stop/start, désactivation) tant qu'une lecture
    // en vol n'est pas terminée. Retiré seulement quand le registrador
    // disparaît de la configuration.
    busy: HashMap<String, Arc<AtomicBool>>,
    ticker: Option<JoinHandle<()>>,
}

pub struct PollingScheduler {
    registry: DeviceRegistry,
    executor: Arc<ReadExecutor>,
    notifier: Notifier,
    inner: Mutex<SchedulerInner>,
}

impl PollingScheduler {
    pub fn new(registry: DeviceRegistry, executor: Arc<ReadExecutor>, notifier: Notifier) -> Self {
        Self {
            registry,
            executor,
            notifier,
            inner: Mutex::new(SchedulerInner::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Load a fresh device set into the registry. Does not start anything.
    pub fn load(&self, devices: Vec<Device>) {
        self.registry.replace_all(devices);
    }

    /// Start polling every active device, staggered. No-op when already
    /// running or when no device is active.
    pub fn start(self: &Arc<Self>) {
        let actives = self.registry.active_devices();
        {
            let mut inner = self.inner.lock();
            if inner.running || actives.is_empty() {
                return;
            }
            inner.running = true;
        }

        let intervals: Vec<u32> = actives.iter().map(|d| d.interval_seconds).collect();
        let stagger = stagger_seconds(&intervals);
        self.notifier.log(
            LogLevel::Cycle,
            format!(
                "démarrage du cycle: {} registradores, décalage {stagger}s",
                actives.len()
            ),
        );

        for (i, device) in actives.iter().enumerate() {
            self.arm_device(device, i as u32 * stagger);
        }
        self.ensure_ticker();
        self.notifier.send(Notification::PollingActive(true));
    }

    /// Spawn the timer loop of one device. `initial_delay` covers the
    /// stagger (0 = first read right away); after that the loop re-reads the
    /// interval from the registry before each wait, so an interval change
    /// applies at the next fire.
    fn arm_device(self: &Arc<Self>, device: &Device, initial_delay: u32) {
        self.registry.arm_countdown(&device.id, initial_delay);
        self.notifier.device_log(
            LogLevel::Cycle,
            &device.id,
            format!("{}: première lecture dans {initial_delay}s", device.name),
        );

        let id = device.id.clone();
        let busy = {
            let mut inner = self.inner.lock();
            Arc::clone(inner.busy.entry(id.clone()).or_default())
        };
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut wait = initial_delay;
            loop {
                tokio::time::sleep(Duration::from_secs(wait as u64)).await;
                if !scheduler.is_running() {
                    return;
                }
                let Some(device) = scheduler.registry.get(&id) else {
                    return;
                };
                if !device.active {
                    return;
                }

                if busy.swap(true, Ordering::Acquire) {
                    // La lecture précédente dure encore: on saute ce tir,
                    // le compte reste à zéro jusqu'à la prochaine échéance.
                    scheduler.notifier.device_log(
                        LogLevel::Cycle,
                        &id,
                        format!("{}: lecture encore en cours, cycle sauté", device.name),
                    );
                } else {
                    scheduler
                        .registry
                        .arm_countdown(&id, device.interval_seconds);
                    let executor = Arc::clone(&scheduler.executor);
                    let busy_read = Arc::clone(&busy);
                    let snapshot = device.clone();
                    tokio::spawn(async move {
                        executor.execute_read(&snapshot).await;
                        busy_read.store(false, Ordering::Release);
                    });
                }

                wait = scheduler
                    .registry
                    .get(&id)
                    .map(|d| d.interval_seconds)
                    .unwrap_or(device.interval_seconds)
                    .max(1);
            }
        });

        self.inner.lock().timers.insert(device.id.clone(), handle);
    }

    /// Shared 1s ticker feeding the countdown display. Lazily spawned once.
    fn ensure_ticker(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.ticker.is_some() {
            return;
        }
        let scheduler = Arc::clone(self);
        inner.ticker = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.tick().await; // le premier tick est immédiat
            loop {
                tick.tick().await;
                if !scheduler.is_running() {
                    return;
                }
                scheduler.registry.tick_countdowns();
            }
        }));
    }

    /// Stop every timer. Counters and statuses survive; countdowns are
    /// cleared. Idempotent.
    pub fn stop(&self) {
        let (timers, ticker) = {
            let mut inner = self.inner.lock();
            if !inner.running && inner.timers.is_empty() {
                return;
            }
            inner.running = false;
            (
                std::mem::take(&mut inner.timers),
                inner.ticker.take(),
            )
        };
        for (_, handle) in timers {
            handle.abort();
        }
        if let Some(ticker) = ticker {
            ticker.abort();
        }
        self.registry.clear_all_countdowns();
        self.notifier.send(Notification::PollingActive(false));
        self.notifier.log(LogLevel::Cycle, "cycle de lecture arrêté");
    }

    /// Three-way merge of a fresh backend set into the live one, by id:
    /// disappeared devices are cancelled and dropped, new ones inserted and
    /// armed, kept ones updated in place with counters preserved.
    pub async fn reconcile(self: &Arc<Self>, incoming: Vec<Device>) {
        let running = self.is_running();
        let incoming_ids: HashSet<String> = incoming.iter().map(|d| d.id.clone()).collect();
        let current = self.registry.snapshot();

        for device in &current {
            if !incoming_ids.contains(&device.id) {
                self.cancel_timer(&device.id);
                self.inner.lock().busy.remove(&device.id);
                self.registry.remove(&device.id);
                self.notifier.device_log(
                    LogLevel::Warning,
                    &device.id,
                    format!("{}: retiré de la configuration", device.name),
                );
            }
        }

        let current_ids: HashSet<String> = current.iter().map(|d| d.id.clone()).collect();
        for device in incoming {
            if !current_ids.contains(&device.id) {
                self.notifier.device_log(
                    LogLevel::Info,
                    &device.id,
                    format!("{}: nouveau registrador", device.name),
                );
                let should_arm = running && device.active;
                self.registry.insert(device.clone());
                if should_arm {
                    self.arm_device(&device, 0);
                }
                continue;
            }

            let was = current.iter().find(|d| d.id == device.id).cloned();
            let Some(merged) = self.registry.apply_update(device) else {
                continue;
            };
            let was_active = was.map(|d| d.active).unwrap_or(false);
            match (was_active, merged.active) {
                (true, false) => {
                    self.cancel_timer(&merged.id);
                    self.registry.clear_countdown(&merged.id);
                    self.registry.set_status(&merged.id, DeviceStatus::Inactive);
                    self.notifier.device_log(
                        LogLevel::Info,
                        &merged.id,
                        format!("{}: désactivé", merged.name),
                    );
                }
                (false, true) => {
                    if running {
                        self.arm_device(&merged, 0);
                    } else {
                        self.registry.set_status(&merged.id, DeviceStatus::Active);
                    }
                    self.notifier.device_log(
                        LogLevel::Info,
                        &merged.id,
                        format!("{}: réactivé", merged.name),
                    );
                }
                _ => {
                    // Un changement d'intervalle prend effet au prochain tir,
                    // sans redémarrer le timer.
                    self.notifier.device_log(
                        LogLevel::Info,
                        &merged.id,
                        format!("{}: configuration mise à jour", merged.name),
                    );
                }
            }
        }

        self.registry.notify_set();
    }

    fn cancel_timer(&self, id: &str) {
        if let Some(handle) = self.inner.lock().timers.remove(id) {
            handle.abort();
        }
    }
}
