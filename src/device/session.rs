use indexmap::IndexSet;
use uuid::Uuid;

use crate::device::types::{DeviceId, SessionStatus};

/// Identifies one connection attempt. Anything tagged with an older token is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(u64);

impl SessionToken {
    pub fn generation(&self) -> u64 {
        self.0
    }
}

/// Where outbound commands are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandChannel {
    pub device: DeviceId,
    pub service: Uuid,
    pub characteristic: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub device: DeviceId,
    pub service: Uuid,
    pub characteristic: Uuid,
}

/// What a teardown left behind for the radio to release.
#[derive(Debug, Default)]
pub struct Released {
    pub device: Option<DeviceId>,
    pub subscriptions: Vec<SubscriptionHandle>,
}

/// The relationship with the one peripheral this application talks to.
///
/// All mutations that move the status away from `Connected` drain the subscriptions and the
/// command channel in the same call, so no caller can observe one without the other.
#[derive(Debug)]
pub struct DeviceSession {
    status: SessionStatus,
    device_id: Option<DeviceId>,
    // peripheral of an attempt that has not finished connecting yet
    target: Option<DeviceId>,
    command_channel: Option<CommandChannel>,
    subscriptions: IndexSet<SubscriptionHandle>,
    generation: u64,
    last_error: Option<String>,
}

impl Default for DeviceSession {
    fn default() -> Self {
        DeviceSession::new()
    }
}

impl DeviceSession {
    pub fn new() -> Self {
        DeviceSession {
            status: SessionStatus::Disconnected,
            device_id: None,
            target: None,
            command_channel: None,
            subscriptions: IndexSet::new(),
            generation: 0,
            last_error: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn device_id(&self) -> Option<&DeviceId> {
        self.device_id.as_ref()
    }

    pub fn command_channel(&self) -> Option<&CommandChannel> {
        self.command_channel.as_ref()
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &SubscriptionHandle> {
        self.subscriptions.iter()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_current(&self, token: SessionToken) -> bool {
        token.0 == self.generation
    }

    fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        // a new search may find a different peripheral
        if status == SessionStatus::Searching {
            self.device_id = None;
        }
    }

    fn release(&mut self) -> Released {
        self.command_channel = None;
        Released {
            device: None,
            subscriptions: self.subscriptions.drain(..).collect(),
        }
    }

    /// Starts a new attempt, superseding every earlier token.
    pub fn begin_attempt(&mut self, status: SessionStatus) -> (SessionToken, Released) {
        debug_assert!(status != SessionStatus::Connected);
        self.generation += 1;
        self.set_status(status);
        self.target = None;
        self.last_error = None;
        (SessionToken(self.generation), self.release())
    }

    /// Moves to `status` if `token` is still current. Returns `None` for stale tokens.
    pub fn transition(&mut self, token: SessionToken, status: SessionStatus) -> Option<Released> {
        if !self.is_current(token) || status == SessionStatus::Connected {
            return None;
        }
        self.set_status(status);
        Some(self.release())
    }

    pub fn connecting(&mut self, token: SessionToken, device: &DeviceId) -> Option<Released> {
        let released = self.transition(token, SessionStatus::Connecting)?;
        self.target = Some(device.clone());
        Some(released)
    }

    /// Completes an attempt. Returns false if the attempt was superseded meanwhile.
    pub fn establish(
        &mut self,
        token: SessionToken,
        channel: CommandChannel,
        subscriptions: Vec<SubscriptionHandle>,
    ) -> bool {
        if !self.is_current(token) || self.status != SessionStatus::Connecting {
            return false;
        }
        self.status = SessionStatus::Connected;
        self.target = None;
        self.device_id = Some(channel.device.clone());
        self.command_channel = Some(channel);
        self.subscriptions = subscriptions.into_iter().collect();
        true
    }

    pub fn fail(&mut self, token: SessionToken, error: String) -> Option<Released> {
        let mut released = self.transition(token, SessionStatus::Error)?;
        released.device = self.target.take();
        self.last_error = Some(error);
        Some(released)
    }

    /// Handles a link drop reported for `device`. Only the current, connected attempt reacts.
    pub fn link_dropped(&mut self, token: SessionToken, device: &DeviceId) -> Option<Released> {
        if self.status != SessionStatus::Connected || self.device_id.as_ref() != Some(device) {
            return None;
        }
        self.transition(token, SessionStatus::Disconnected)
    }

    /// Ends the session for good: invalidates all tokens and hands back everything to release.
    pub fn teardown(&mut self) -> Released {
        self.generation += 1;
        self.status = SessionStatus::Disconnected;
        let mut released = self.release();
        released.device = self.device_id.take().or_else(|| self.target.take());
        self.target = None;
        released
    }
}
