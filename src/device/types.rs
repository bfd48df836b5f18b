use std::fmt;
use uuid::Uuid;

use crate::device::codec::{FramedValue, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Searching,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

impl SessionStatus {
    /// Whether a scan or connection sequence currently owns the radio.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SessionStatus::Searching | SessionStatus::Connecting | SessionStatus::Reconnecting | SessionStatus::Connected
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            SessionStatus::Searching => "Searching...",
            SessionStatus::Connecting => "Connecting...",
            SessionStatus::Connected => "Connected",
            SessionStatus::Disconnected => "Disconnected",
            SessionStatus::Reconnecting => "Reconnecting...",
            SessionStatus::Error => "Error in Connection",
        };

        write!(f, "{}", result)
    }
}

/// Opaque identifier of a peripheral, as reported by the radio.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// A value pushed by the peripheral on a notify characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: FramedValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Advertisement {
        id: DeviceId,
        local_name: Option<String>,
    },
    Disconnected(DeviceId),
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    StateChange(SessionStatus),
    Reading {
        characteristic: Uuid,
        payload: Payload,
    },
    // messages the user has to acknowledge
    Alert(String),
}
