//! Agent lifecycle facade
//!
//! `connect` wires the whole chain in order: authentication, heartbeat,
//! event stream, initial config, polling. `teardown` unwinds it and clears
//! the session so the stream task never reconnects afterwards.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::backend::{BackendApi, HttpBackend};
use crate::bus::ModbusBus;
use crate::config::AgentConfig;
use crate::executor::ReadExecutor;
use crate::models::Device;
use crate::notify::{LogLevel, Notification, Notifier};
use crate::registry::DeviceRegistry;
use crate::scheduler::PollingScheduler;
use crate::stream::EventStreamClient;

#[derive(Default)]
struct AgentTasks {
    heartbeat: Option<JoinHandle<()>>,
    stream: Option<JoinHandle<()>>,
}

/// Point-in-time view of the agent, for status commands and the
/// presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub connected: bool,
    pub authenticated: bool,
    pub agent_name: Option<String>,
    pub workspace: Option<String>,
    pub polling_active: bool,
    pub devices: Vec<Device>,
    pub uptime_seconds: u64,
}

pub struct FieldAgent {
    config: AgentConfig,
    backend: Arc<HttpBackend>,
    registry: DeviceRegistry,
    executor: Arc<ReadExecutor>,
    scheduler: Arc<PollingScheduler>,
    notifier: Notifier,
    started: Instant,
    tasks: Mutex<AgentTasks>,
}

impl FieldAgent {
    pub fn new(config: AgentConfig, notifier: Notifier) -> Arc<Self> {
        let backend = Arc::new(HttpBackend::new(&config, notifier.clone()));
        let registry = DeviceRegistry::new(notifier.clone());
        let executor = Arc::new(ReadExecutor::new(
            Arc::clone(&backend) as Arc<dyn BackendApi>,
            Arc::new(ModbusBus::new()),
            registry.clone(),
            notifier.clone(),
        ));
        let scheduler = Arc::new(PollingScheduler::new(
            registry.clone(),
            Arc::clone(&executor),
            notifier.clone(),
        ));
        Arc::new(Self {
            config,
            backend,
            registry,
            executor,
            scheduler,
            notifier,
            started: Instant::now(),
            tasks: Mutex::new(AgentTasks::default()),
        })
    }

    pub fn backend(&self) -> Arc<HttpBackend> {
        Arc::clone(&self.backend)
    }

    /// Full startup sequence. An authentication rejection is fatal;
    /// everything after it degrades gracefully.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let session = self
            .backend
            .authenticate()
            .await
            .context("authentification auprès du backend")?;

        self.notifier
            .send(Notification::Authenticated(session.agent.clone()));
        self.notifier.log(
            LogLevel::Success,
            format!("authentifié: {}", session.agent.name),
        );
        if let Some(workspace) = session.workspaces.first() {
            self.notifier
                .send(Notification::WorkspaceLinked(workspace.clone()));
            self.notifier
                .log(LogLevel::Info, format!("espace de travail: {}", workspace.name));
        }

        self.spawn_heartbeat();
        self.spawn_stream();

        match self.backend.get_config().await {
            Ok(devices) => {
                self.notifier.log(
                    LogLevel::Info,
                    format!("configuration reçue: {} registradores", devices.len()),
                );
                self.scheduler.load(devices);
                self.scheduler.start();
            }
            Err(e) => {
                // L'agent reste en vie avec un jeu vide; un événement
                // config-actualizada ultérieur resynchronisera.
                self.notifier.log(
                    LogLevel::Error,
                    format!("configuration initiale indisponible: {e}"),
                );
                self.scheduler.load(Vec::new());
            }
        }
        Ok(())
    }

    /// 30s heartbeat. The first beat fires immediately; failures are logged
    /// and never fatal, the next beat retries anyway.
    fn spawn_heartbeat(self: &Arc<Self>) {
        let agent = Arc::clone(self);
        let period = Duration::from_secs(self.config.heartbeat_secs);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                if let Err(e) = agent.backend.heartbeat().await {
                    agent
                        .notifier
                        .log(LogLevel::Warning, format!("heartbeat échoué: {e}"));
                }
            }
        });
        if let Some(old) = self.tasks.lock().heartbeat.replace(handle) {
            old.abort();
        }
    }

    fn spawn_stream(self: &Arc<Self>) {
        let client = EventStreamClient::new(
            self.backend(),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.executor),
            self.notifier.clone(),
            self.config.reconnect_delay_secs,
            self.config.silence_limit_secs,
        );
        if let Some(old) = self.tasks.lock().stream.replace(client.spawn()) {
            old.abort();
        }
    }

    /// Stop polling without disconnecting.
    pub fn stop_polling(&self) {
        self.scheduler.stop();
    }

    pub fn start_polling(self: &Arc<Self>) {
        self.scheduler.start();
    }

    /// Drop the current device set and rebuild it from the backend.
    pub async fn reload(self: &Arc<Self>) -> Result<()> {
        self.scheduler.stop();
        let devices = self
            .backend
            .get_config()
            .await
            .context("rechargement de la configuration")?;
        self.scheduler.load(devices);
        self.scheduler.start();
        Ok(())
    }

    /// Orderly shutdown: timers first, then the background tasks, then the
    /// session (its absence is what stops the stream from reconnecting).
    pub fn teardown(&self) {
        self.scheduler.stop();
        let mut tasks = self.tasks.lock();
        if let Some(stream) = tasks.stream.take() {
            stream.abort();
        }
        if let Some(heartbeat) = tasks.heartbeat.take() {
            heartbeat.abort();
        }
        drop(tasks);
        self.backend.clear_session();
        self.notifier.log(LogLevel::Info, "agent arrêté");
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let session = self.backend.session();
        AgentSnapshot {
            connected: self.backend.is_connected(),
            authenticated: session.is_some(),
            agent_name: session.as_ref().map(|s| s.agent.name.clone()),
            workspace: session
                .as_ref()
                .and_then(|s| s.workspaces.first())
                .map(|w| w.name.clone()),
            polling_active: self.scheduler.is_running(),
            devices: self.registry.snapshot(),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}
