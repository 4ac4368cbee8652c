//! RelayWatch field agent
//!
//! Polls Modbus TCP devices on a staggered schedule and relays the readings
//! to the central RelayWatch backend over HTTP, driven by a server-sent
//! event stream for live reconfiguration and ad-hoc connectivity tests.

pub mod agent;
pub mod backend;
pub mod bus;
pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod notify;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod stream;

pub use agent::{AgentSnapshot, FieldAgent};
pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};
