//! Polling agent for Mercury / SET-4TM energy meters behind a TCP gateway
//!
//! Meters are read one request at a time over a single connection, the decoded
//! values are forwarded to MQTT.

pub mod config;
pub mod mqtt;
pub mod metering_mercury;

// Re-export common types for easier access
pub use config::{ConfigHolder, ConfigBases};
pub use mqtt::{MqttManager, Sample, Transmission};
pub use metering_mercury::{AgentCommand, AgentError, MercuryAgent};

/// Milliseconds since the Unix epoch
pub fn get_unix_ts_ms() -> i64 {
    return chrono::Utc::now().timestamp_millis();
}
