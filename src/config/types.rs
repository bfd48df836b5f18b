use std::fmt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{
    default_notify_characteristics, COMMAND_CHARACTERISTIC_UUID, DEVICE_NAME, HISTORY_CAPACITY, MAX_HISTORY_CAPACITY,
    RECONNECT_DELAY, SERVICE_UUID, WRITE_DEADLINE,
};
use crate::error::ConfigError;

/// What happens after the link to a connected device drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum ReconnectPolicy {
    /// Forget the peripheral and scan for it again.
    Rescan,
    /// Connect straight to the last known peripheral.
    Direct,
    /// Stay disconnected and alert the user, who may start a new scan.
    Manual,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Rescan
    }
}

impl fmt::Display for ReconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            ReconnectPolicy::Rescan => "rescan",
            ReconnectPolicy::Direct => "direct",
            ReconnectPolicy::Manual => "manual",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub device_name: String,
    pub service_uuid: Uuid,
    pub command_characteristic_uuid: Uuid,
    pub notify_characteristic_uuids: Vec<Uuid>,
    pub reconnect_policy: ReconnectPolicy,
    pub reconnect_delay_ms: u64,
    pub write_deadline_ms: u64,
    pub history_capacity: usize,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.is_empty() {
            return Err(ConfigError::Invalid { field: "deviceName", reason: "must not be empty".to_string() });
        }

        if self.notify_characteristic_uuids.is_empty() {
            return Err(ConfigError::Invalid {
                field: "notifyCharacteristicUuids",
                reason: "at least one characteristic is required".to_string(),
            });
        }

        if self.notify_characteristic_uuids.contains(&self.command_characteristic_uuid) {
            return Err(ConfigError::Invalid {
                field: "notifyCharacteristicUuids",
                reason: "must not contain the command characteristic".to_string(),
            });
        }

        if self.write_deadline_ms == 0 {
            return Err(ConfigError::Invalid { field: "writeDeadlineMs", reason: "must be positive".to_string() });
        }

        if !(1..=MAX_HISTORY_CAPACITY).contains(&self.history_capacity) {
            return Err(ConfigError::Invalid {
                field: "historyCapacity",
                reason: format!("must be between 1 and {}", MAX_HISTORY_CAPACITY),
            });
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_name: DEVICE_NAME.to_string(),
            service_uuid: SERVICE_UUID,
            command_characteristic_uuid: COMMAND_CHARACTERISTIC_UUID,
            notify_characteristic_uuids: default_notify_characteristics(),
            reconnect_policy: ReconnectPolicy::default(),
            reconnect_delay_ms: RECONNECT_DELAY,
            write_deadline_ms: WRITE_DEADLINE,
            history_capacity: HISTORY_CAPACITY,
        }
    }
}
