//! Security adapter
//!
//! Before a channel is opened, or an incoming one accepted, AVCTP asks the
//! GAP security manager whether the link meets the requirements of the
//! AVRCP service. The answer comes back asynchronously through a one-shot
//! callback.

use std::fmt;

use crate::error::AvctResult;
use crate::types::{BdAddr, ChannelId, ChannelKind, LocalRole};

/// Service the security check is made for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceId {
    AvrcpController,
    AvrcpTarget,
    AvrcpControllerBrowsing,
    AvrcpTargetBrowsing,
}

impl ServiceId {
    pub fn for_channel(role: LocalRole, kind: ChannelKind) -> Self {
        match (role, kind) {
            (LocalRole::Controller, ChannelKind::Control) => ServiceId::AvrcpController,
            (LocalRole::Target, ChannelKind::Control) => ServiceId::AvrcpTarget,
            (LocalRole::Controller, ChannelKind::Browsing) => ServiceId::AvrcpControllerBrowsing,
            (LocalRole::Target, ChannelKind::Browsing) => ServiceId::AvrcpTargetBrowsing,
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceId::AvrcpController => write!(f, "controller"),
            ServiceId::AvrcpTarget => write!(f, "target"),
            ServiceId::AvrcpControllerBrowsing => write!(f, "controller browsing"),
            ServiceId::AvrcpTargetBrowsing => write!(f, "target browsing"),
        }
    }
}

/// Direction of the connection being secured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    /// An incoming connection waiting for our response
    Incoming { lcid: ChannelId, identifier: u8 },
}

/// A security check request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityRequest {
    pub peer: BdAddr,
    pub service: ServiceId,
    pub psm: u16,
    pub direction: Direction,
}

/// Receives the security result, 0 meaning success
pub type SecurityCallback = Box<dyn FnOnce(u16) + Send + 'static>;

/// GAP security manager as seen by AVCTP
pub trait SecurityService: Send + Sync {
    /// Start a security check; `on_result` is called exactly once unless an error is returned
    fn request_security(&self, request: SecurityRequest, on_result: SecurityCallback) -> AvctResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_id_selection() {
        assert_eq!(
            ServiceId::for_channel(LocalRole::Target, ChannelKind::Control),
            ServiceId::AvrcpTarget
        );
        assert_eq!(
            ServiceId::for_channel(LocalRole::Controller, ChannelKind::Browsing),
            ServiceId::AvrcpControllerBrowsing
        );
        assert_eq!(ServiceId::AvrcpController.to_string(), "controller");
    }
}
