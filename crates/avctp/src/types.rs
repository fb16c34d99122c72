//! Type definitions shared across the AVCTP core
//!
//! This module contains the device address, role and channel enums, the
//! event structures handed to upper-layer callbacks and the parameters a
//! profile supplies when it asks for a connection.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::constants::*;
use crate::error::{AvctResult, ResultCode};

/// Handle identifying a logical connection
pub type ConnectionId = u8;

/// Local L2CAP channel identifier
pub type ChannelId = u16;

/// Bluetooth device address, stored little-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    /// Address used by acceptors to accept from any peer
    pub const ANY: BdAddr = BdAddr { bytes: [0x00; 6] };
    pub const BROADCAST: BdAddr = BdAddr { bytes: [0xFF; 6] };

    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    /// True when the address can be the target of an outgoing connection
    pub fn is_unicast(&self) -> bool {
        *self != Self::ANY && *self != Self::BROADCAST
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

/// Which side opens the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// AVRCP role of the local device, fixed at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalRole {
    #[default]
    Controller,
    Target,
}

/// The two L2CAP channels AVCTP can open per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Control,
    Browsing,
}

impl ChannelKind {
    pub fn psm(&self) -> u16 {
        match self {
            ChannelKind::Control => AVCTP_PSM,
            ChannelKind::Browsing => AVCTP_BROWSING_PSM,
        }
    }

    pub fn from_psm(psm: u16) -> Option<Self> {
        match psm {
            AVCTP_PSM => Some(ChannelKind::Control),
            AVCTP_BROWSING_PSM => Some(ChannelKind::Browsing),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Control => write!(f, "control"),
            ChannelKind::Browsing => write!(f, "browsing"),
        }
    }
}

/// Command/response field of the AVCTP header
///
/// `Reject` is a response with the invalid profile id bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandResponse {
    Command = 0,
    Response = 2,
    Reject = 3,
}

impl CommandResponse {
    /// Low two bits of the header byte
    pub fn bits(&self) -> u8 {
        *self as u8
    }

    pub fn from_header(byte: u8) -> Self {
        match (byte & CR_MASK != 0, byte & IPID_MASK != 0) {
            (false, _) => CommandResponse::Command,
            (true, false) => CommandResponse::Response,
            (true, true) => CommandResponse::Reject,
        }
    }
}

/// Kinds of channel events reported to the upper layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEventKind {
    ConnectConfirm,
    ConnectIndication,
    DisconnectConfirm,
    DisconnectIndication,
    BrowsingConnectConfirm,
    BrowsingConnectIndication,
    BrowsingDisconnectConfirm,
    BrowsingDisconnectIndication,
    ChannelBusy,
    ChannelUnbusy,
    BrowsingChannelBusy,
    BrowsingChannelUnbusy,
}

/// A channel event for one logical connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub connection_id: ConnectionId,
    pub kind: ChannelEventKind,
    pub result: ResultCode,
    /// Raw L2CAP or security status behind a failure, 0 on success
    pub detail: u16,
    pub peer: BdAddr,
}

/// A complete inbound message routed to a logical connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub connection_id: ConnectionId,
    pub label: u8,
    pub cr: CommandResponse,
    pub channel: ChannelKind,
    pub payload: Vec<u8>,
}

/// Callback for channel events like connect, disconnect, busy
pub type ChannelEventCallback =
    Arc<Mutex<dyn FnMut(ChannelEvent) -> AvctResult<()> + Send + 'static>>;

/// Callback for received messages
pub type MessageCallback = Arc<Mutex<dyn FnMut(Message) -> AvctResult<()> + Send + 'static>>;

/// Parameters supplied by a profile when requesting a connection
#[derive(Clone)]
pub struct ConnectParams {
    /// Profile id routing messages to this connection
    pub pid: u16,
    pub role: Role,
    pub event_callback: ChannelEventCallback,
    pub message_callback: MessageCallback,
}

impl ConnectParams {
    pub fn new<E, M>(pid: u16, role: Role, on_event: E, on_message: M) -> Self
    where
        E: FnMut(ChannelEvent) -> AvctResult<()> + Send + 'static,
        M: FnMut(Message) -> AvctResult<()> + Send + 'static,
    {
        Self {
            pid,
            role,
            event_callback: Arc::new(Mutex::new(on_event)),
            message_callback: Arc::new(Mutex::new(on_message)),
        }
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("pid", &format_args!("0x{:04X}", self.pid))
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// Run a channel event callback, tolerating a poisoned lock
pub(crate) fn invoke_event_callback(callback: &ChannelEventCallback, event: ChannelEvent) -> AvctResult<()> {
    let mut callback = callback.lock().unwrap_or_else(PoisonError::into_inner);
    (&mut *callback)(event)
}

/// Run a message callback, tolerating a poisoned lock
pub(crate) fn invoke_message_callback(callback: &MessageCallback, message: Message) -> AvctResult<()> {
    let mut callback = callback.lock().unwrap_or_else(PoisonError::into_inner);
    (&mut *callback)(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bdaddr_display() {
        let addr = BdAddr::new([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(addr.to_string(), "11:22:33:44:55:66");
        assert!(addr.is_unicast());
        assert!(!BdAddr::ANY.is_unicast());
        assert!(!BdAddr::BROADCAST.is_unicast());
        assert!(BdAddr::default().is_any());
    }

    #[test]
    fn test_command_response_bits() {
        assert_eq!(CommandResponse::from_header(0x30), CommandResponse::Command);
        assert_eq!(CommandResponse::from_header(0x32), CommandResponse::Response);
        assert_eq!(CommandResponse::from_header(0x33), CommandResponse::Reject);
        assert_eq!(CommandResponse::Reject.bits(), 3);
    }

    #[test]
    fn test_channel_kind_psm() {
        assert_eq!(ChannelKind::from_psm(0x0017), Some(ChannelKind::Control));
        assert_eq!(ChannelKind::from_psm(0x001B), Some(ChannelKind::Browsing));
        assert_eq!(ChannelKind::from_psm(0x0019), None);
        assert_eq!(ChannelKind::Browsing.psm(), AVCTP_BROWSING_PSM);
    }
}
