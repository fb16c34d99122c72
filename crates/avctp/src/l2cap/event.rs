//! Notifications reported by the L2CAP layer

use crate::types::{BdAddr, ChannelId};

/// Asynchronous L2CAP notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L2capEvent {
    /// A peer asked to open a channel on one of our PSMs
    ConnectInd {
        peer: BdAddr,
        psm: u16,
        lcid: ChannelId,
        identifier: u8,
    },
    /// The peer answered our connection request
    ConnectRsp { lcid: ChannelId, result: u16 },
    /// The peer sent its configuration, `mtu` is what it can receive
    ConfigReq {
        lcid: ChannelId,
        identifier: u8,
        mtu: u16,
    },
    /// The peer answered our configuration request
    ConfigRsp { lcid: ChannelId, result: u16 },
    /// The peer is closing the channel
    DisconnectInd { lcid: ChannelId, identifier: u8 },
    /// The peer confirmed our disconnection request
    DisconnectRsp { lcid: ChannelId },
    /// The channel was lost without a disconnection handshake
    DisconnectAbnormal { lcid: ChannelId, reason: u8 },
    /// Data arrived on the channel
    Data { lcid: ChannelId, payload: Vec<u8> },
    /// The peer entered or left the busy condition
    RemoteBusy { lcid: ChannelId, busy: bool },
}

impl L2capEvent {
    /// Local channel id the event refers to
    pub fn lcid(&self) -> ChannelId {
        match self {
            L2capEvent::ConnectInd { lcid, .. }
            | L2capEvent::ConnectRsp { lcid, .. }
            | L2capEvent::ConfigReq { lcid, .. }
            | L2capEvent::ConfigRsp { lcid, .. }
            | L2capEvent::DisconnectInd { lcid, .. }
            | L2capEvent::DisconnectRsp { lcid }
            | L2capEvent::DisconnectAbnormal { lcid, .. }
            | L2capEvent::Data { lcid, .. }
            | L2capEvent::RemoteBusy { lcid, .. } => *lcid,
        }
    }
}
