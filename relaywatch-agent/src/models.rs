//! Domain types and backend wire contracts
//!
//! The backend speaks the original Spanish field names (registradores,
//! claveSecreta, exito, ...); the serde renames keep the wire format intact
//! while the Rust side stays in English.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a device as shown to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Inactive,
    Active,
    Reading,
    Error,
}

/// Connection target of one Modbus TCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusTarget {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

/// One remote endpoint polled for values (the "registrador").
///
/// Owned exclusively by the [`DeviceRegistry`](crate::registry::DeviceRegistry);
/// everything outside receives clones.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub target: BusTarget,
    pub start_index: u16,
    pub count: u16,
    pub timeout_ms: u64,
    pub interval_seconds: u32,
    pub active: bool,

    // Mutable runtime fields
    pub status: DeviceStatus,
    pub next_read_in: Option<u32>,
    pub success_count: u64,
    pub fail_count: u64,
}

fn default_unit_id() -> u8 {
    1
}

fn default_interval() -> u32 {
    60
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_active() -> bool {
    true
}

fn default_test_count() -> u16 {
    10
}

/// Device entry as delivered by `GET /api/agente/config`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfigDto {
    pub id: String,
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "ip")]
    pub host: String,
    #[serde(rename = "puerto")]
    pub port: u16,
    #[serde(rename = "unitId", default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(rename = "indiceInicial")]
    pub start_index: u16,
    #[serde(rename = "cantidadRegistros")]
    pub count: u16,
    #[serde(rename = "intervaloSegundos", default = "default_interval")]
    pub interval_seconds: u32,
    #[serde(rename = "timeoutMs", default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(rename = "activo", default = "default_active")]
    pub active: bool,
}

impl From<DeviceConfigDto> for Device {
    fn from(dto: DeviceConfigDto) -> Self {
        let status = if dto.active {
            DeviceStatus::Active
        } else {
            DeviceStatus::Inactive
        };
        Device {
            id: dto.id,
            name: dto.name,
            target: BusTarget {
                host: dto.host,
                port: dto.port,
                unit_id: dto.unit_id,
            },
            start_index: dto.start_index,
            count: dto.count,
            timeout_ms: dto.timeout_ms,
            interval_seconds: dto.interval_seconds,
            active: dto.active,
            status,
            next_read_in: None,
            success_count: 0,
            fail_count: 0,
        }
    }
}

/// Agent identity returned by the auth endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentIdentity {
    pub id: String,
    #[serde(rename = "nombre")]
    pub name: String,
}

/// Workspace the agent is linked to (at most one active, first of the list).
#[derive(Debug, Clone, Deserialize)]
pub struct Workspace {
    pub id: String,
    #[serde(rename = "nombre")]
    pub name: String,
}

/// Authenticated session. Owned by the backend gateway, destroyed on
/// teardown, recreated transparently on token expiry.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub agent: AgentIdentity,
    pub workspaces: Vec<Workspace>,
}

/// Reply of `POST /api/agente/auth`.
#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    #[serde(rename = "exito", default)]
    pub success: bool,
    pub token: Option<String>,
    #[serde(rename = "agente")]
    pub agent: Option<AgentIdentity>,
    #[serde(default)]
    pub workspaces: Vec<Workspace>,
    pub error: Option<String>,
    #[serde(rename = "advertencia")]
    pub warning: Option<String>,
}

/// Reply of `GET /api/agente/config`.
#[derive(Debug, Deserialize)]
pub struct ConfigResponse {
    #[serde(rename = "registradores", default)]
    pub devices: Vec<DeviceConfigDto>,
}

/// One reading forwarded to `POST /api/agente/lecturas`.
#[derive(Debug, Clone, Serialize)]
pub struct ReadingRecord {
    #[serde(rename = "registradorId")]
    pub device_id: String,
    #[serde(rename = "valores")]
    pub values: Vec<u16>,
    #[serde(rename = "tiempoMs")]
    pub elapsed_ms: u64,
    #[serde(rename = "exito")]
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl ReadingRecord {
    pub fn success(device_id: &str, values: Vec<u16>, elapsed_ms: u64) -> Self {
        Self {
            device_id: device_id.to_string(),
            values,
            elapsed_ms,
            success: true,
            error: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn failure(device_id: &str, elapsed_ms: u64, error: String) -> Self {
        Self {
            device_id: device_id.to_string(),
            values: Vec::new(),
            elapsed_ms,
            success: false,
            error: Some(error),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Reply of `POST /api/agente/lecturas`.
#[derive(Debug, Deserialize)]
pub struct PostReadingsResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(rename = "insertadas", default)]
    pub inserted: u64,
}

/// Which addressing space a connectivity test reads. Registers and coils are
/// separate spaces, never mixed in one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    Registers,
    Coils,
}

/// An ad-hoc one-shot connectivity check, distinct from scheduled polling.
/// Created by a stream event, consumed once by the executor, never persisted.
#[derive(Debug, Clone)]
pub struct TestRequest {
    pub id: String,
    pub target: BusTarget,
    pub start_index: u16,
    pub count: u16,
    pub timeout_ms: u64,
    pub kind: TestKind,
}

/// Test payload as pushed over the event stream (`test-registrador` /
/// `test-coils`). Coil tests carry the bit count in `cantidadBits`.
#[derive(Debug, Deserialize)]
pub struct TestRequestDto {
    pub id: String,
    #[serde(rename = "ip")]
    pub host: String,
    #[serde(rename = "puerto")]
    pub port: u16,
    #[serde(rename = "unitId", default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(rename = "indiceInicial", default)]
    pub start_index: u16,
    #[serde(rename = "cantidadRegistros", default = "default_test_count")]
    pub count: u16,
    #[serde(rename = "cantidadBits")]
    pub bit_count: Option<u16>,
    #[serde(rename = "timeoutMs", default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl TestRequestDto {
    pub fn into_request(self, kind: TestKind) -> TestRequest {
        let count = match kind {
            TestKind::Registers => self.count,
            TestKind::Coils => self.bit_count.unwrap_or(self.count),
        };
        TestRequest {
            id: self.id,
            target: BusTarget {
                host: self.host,
                port: self.port,
                unit_id: self.unit_id,
            },
            start_index: self.start_index,
            count,
            timeout_ms: self.timeout_ms,
            kind,
        }
    }
}

/// Outcome reported to `POST /api/agente/tests/{id}/resultado`.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    #[serde(rename = "exito")]
    pub success: bool,
    #[serde(rename = "tiempoRespuestaMs")]
    pub elapsed_ms: u64,
    #[serde(rename = "valores", skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<u16>>,
    #[serde(rename = "bits", skip_serializing_if = "Option::is_none")]
    pub bits: Option<Vec<bool>>,
    #[serde(rename = "errorMensaje", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_config_dto_maps_wire_names() {
        let json = r#"{
            "id": "reg-1",
            "nombre": "Alimentador Norte",
            "ip": "10.0.0.5",
            "puerto": 502,
            "unitId": 3,
            "indiceInicial": 100,
            "cantidadRegistros": 12,
            "intervaloSegundos": 30,
            "timeoutMs": 2500,
            "activo": true
        }"#;
        let dto: DeviceConfigDto = serde_json::from_str(json).unwrap();
        let device: Device = dto.into();
        assert_eq!(device.id, "reg-1");
        assert_eq!(device.target.host, "10.0.0.5");
        assert_eq!(device.target.unit_id, 3);
        assert_eq!(device.start_index, 100);
        assert_eq!(device.count, 12);
        assert_eq!(device.interval_seconds, 30);
        assert_eq!(device.status, DeviceStatus::Active);
        assert_eq!(device.success_count, 0);
    }

    #[test]
    fn device_config_dto_defaults() {
        let json = r#"{
            "id": "reg-2",
            "nombre": "Sur",
            "ip": "10.0.0.6",
            "puerto": 502,
            "indiceInicial": 0,
            "cantidadRegistros": 4
        }"#;
        let dto: DeviceConfigDto = serde_json::from_str(json).unwrap();
        assert_eq!(dto.unit_id, 1);
        assert_eq!(dto.interval_seconds, 60);
        assert_eq!(dto.timeout_ms, 5000);
        assert!(dto.active);
    }

    #[test]
    fn inactive_device_starts_inactive() {
        let json = r#"{
            "id": "reg-3",
            "nombre": "Este",
            "ip": "10.0.0.7",
            "puerto": 502,
            "indiceInicial": 0,
            "cantidadRegistros": 4,
            "activo": false
        }"#;
        let device: Device = serde_json::from_str::<DeviceConfigDto>(json).unwrap().into();
        assert_eq!(device.status, DeviceStatus::Inactive);
    }

    #[test]
    fn coil_test_request_uses_bit_count() {
        let json = r#"{
            "id": "t-9",
            "ip": "10.0.0.8",
            "puerto": 502,
            "indiceInicial": 16,
            "cantidadBits": 8
        }"#;
        let dto: TestRequestDto = serde_json::from_str(json).unwrap();
        let req = dto.into_request(TestKind::Coils);
        assert_eq!(req.kind, TestKind::Coils);
        assert_eq!(req.count, 8);
        assert_eq!(req.start_index, 16);
    }

    #[test]
    fn reading_record_serializes_wire_names() {
        let record = ReadingRecord::success("reg-1", vec![1, 2, 3], 42);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["registradorId"], "reg-1");
        assert_eq!(json["exito"], true);
        assert_eq!(json["tiempoMs"], 42);
        assert!(json.get("error").is_none());
    }
}
