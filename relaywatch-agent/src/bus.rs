//! Modbus TCP access
//!
//! One connection per read: connect, read, disconnect. Devices in the field
//! are single-client PLC gateways, so holding sessions open starves other
//! tools; the polling intervals are long enough that reconnecting per cycle
//! costs nothing.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tokio_modbus::client::{tcp, Client, Reader};
use tokio_modbus::slave::Slave;

use crate::error::{AgentError, AgentResult};
use crate::models::BusTarget;

/// Seam between the executor and the wire. Production uses [`ModbusBus`];
/// tests plug in a scripted stub.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Read `count` holding registers starting at `start`.
    async fn read_values(
        &self,
        target: &BusTarget,
        start: u16,
        count: u16,
        timeout_ms: u64,
    ) -> AgentResult<Vec<u16>>;

    /// Read `count` coils starting at `start`.
    async fn read_bits(
        &self,
        target: &BusTarget,
        start: u16,
        count: u16,
        timeout_ms: u64,
    ) -> AgentResult<Vec<bool>>;
}

pub struct ModbusBus;

impl ModbusBus {
    pub fn new() -> Self {
        Self
    }

    async fn resolve(target: &BusTarget) -> AgentResult<SocketAddr> {
        let mut addrs = lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(|e| AgentError::Protocol(format!("résolution {}: {e}", target.host)))?;
        addrs
            .next()
            .ok_or_else(|| AgentError::Protocol(format!("adresse introuvable: {}", target.host)))
    }
}

impl Default for ModbusBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps the whole connect+read exchange in a single deadline so a hung TCP
/// handshake counts against the same budget as a slow reply.
async fn with_deadline<T, F>(timeout_ms: u64, fut: F) -> AgentResult<T>
where
    F: std::future::Future<Output = AgentResult<T>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Protocol(format!(
            "timeout après {timeout_ms}ms"
        ))),
    }
}

#[async_trait]
impl BusClient for ModbusBus {
    async fn read_values(
        &self,
        target: &BusTarget,
        start: u16,
        count: u16,
        timeout_ms: u64,
    ) -> AgentResult<Vec<u16>> {
        let target = target.clone();
        with_deadline(timeout_ms, async move {
            let addr = Self::resolve(&target).await?;
            let mut ctx = tcp::connect_slave(addr, Slave(target.unit_id))
                .await
                .map_err(|e| AgentError::Protocol(format!("connexion {addr}: {e}")))?;
            let values = ctx
                .read_holding_registers(start, count)
                .await
                .map_err(|e| AgentError::Protocol(e.to_string()))?
                .map_err(|e| AgentError::Protocol(e.to_string()))?;
            let _ = ctx.disconnect().await;
            Ok(values)
        })
        .await
    }

    async fn read_bits(
        &self,
        target: &BusTarget,
        start: u16,
        count: u16,
        timeout_ms: u64,
    ) -> AgentResult<Vec<bool>> {
        let target = target.clone();
        with_deadline(timeout_ms, async move {
            let addr = Self::resolve(&target).await?;
            let mut ctx = tcp::connect_slave(addr, Slave(target.unit_id))
                .await
                .map_err(|e| AgentError::Protocol(format!("connexion {addr}: {e}")))?;
            let bits = ctx
                .read_coils(start, count)
                .await
                .map_err(|e| AgentError::Protocol(e.to_string()))?
                .map_err(|e| AgentError::Protocol(e.to_string()))?;
            let _ = ctx.disconnect().await;
            Ok(bits)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_converts_timeout_to_protocol_error() {
        let result: AgentResult<()> = with_deadline(10, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        match result {
            Err(AgentError::Protocol(msg)) => assert!(msg.contains("10ms")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_host_is_a_protocol_error() {
        let bus = ModbusBus::new();
        let target = BusTarget {
            host: "host.invalid".into(),
            port: 502,
            unit_id: 1,
        };
        let result = bus.read_values(&target, 0, 2, 2000).await;
        assert!(matches!(result, Err(AgentError::Protocol(_))));
    }
}
