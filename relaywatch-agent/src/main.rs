/**
 * RELAYWATCH AGENT - Point d'entrée du démon de terrain
 *
 * RÔLE : Bootstrap complet : config, authentification, heartbeat, flux
 * d'événements, cycle de lecture Modbus. Tourne jusqu'à Ctrl-C.
 *
 * ARCHITECTURE : Un cœur asynchrone (tokio) piloté par le backend via SSE,
 * notifications typées vers la sortie standard, logs relayés au backend.
 */

use anyhow::{Context, Result};
use relaywatch_agent::notify::{Notification, Notifier};
use relaywatch_agent::{AgentConfig, FieldAgent};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Ok si .env n'existe pas
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relaywatch_agent=info".into()),
        )
        .init();

    let config = AgentConfig::load().context("chargement de la configuration")?;
    let (notifier, mut notifications) = Notifier::channel();
    let agent = FieldAgent::new(config, notifier);

    // Les lignes de log sévères (advertencia, error) sont relayées au
    // backend; le reste est déjà sorti par le subscriber tracing.
    let backend = agent.backend();
    let drain = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            if let Notification::Log(line) = notification {
                if line.level.is_relayed() {
                    backend.post_log(line.level.wire_name(), &line.message).await;
                }
            }
        }
    });

    agent.connect().await?;

    tokio::signal::ctrl_c()
        .await
        .context("attente du signal d'arrêt")?;
    agent.teardown();
    drain.abort();
    Ok(())
}
