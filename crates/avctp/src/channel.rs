//! AVCTP channel block
//!
//! A channel block holds the per-L2CAP-channel state of one control or
//! browsing channel on a peer device.

use bitflags::bitflags;
use std::fmt;

use crate::packet::Reassembler;
use crate::state::State;
use crate::types::{ChannelId, ChannelKind, Role};

bitflags! {
    /// Progress of the two-phase L2CAP configuration handshake
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConfigStatus: u8 {
        /// Our configuration request was accepted by the peer
        const LOCAL_DONE = 0x01;
        /// We accepted the peer's configuration request
        const REMOTE_DONE = 0x02;
    }
}

/// L2CAP handshake state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Idle,
    Connecting,
    Configuring,
    Opened,
    Busy,
}

/// Per-channel state
pub struct ChannelBlock {
    kind: ChannelKind,
    role: Role,
    /// Local channel id, 0 until L2CAP assigns one
    lcid: ChannelId,
    peer_mtu: u16,
    link_state: LinkState,
    config: ConfigStatus,
    fsm_state: State,
    reassembler: Reassembler,
    /// Set once a state collision has been retried on this block
    collision_retried: bool,
}

impl ChannelBlock {
    pub fn new(kind: ChannelKind, role: Role) -> Self {
        Self {
            kind,
            role,
            lcid: 0,
            peer_mtu: 0,
            link_state: LinkState::Idle,
            config: ConfigStatus::empty(),
            fsm_state: State::Idle,
            reassembler: Reassembler::new(),
            collision_retried: false,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn lcid(&self) -> ChannelId {
        self.lcid
    }

    pub fn has_lcid(&self) -> bool {
        self.lcid != 0
    }

    pub fn set_lcid(&mut self, lcid: ChannelId) {
        self.lcid = lcid;
    }

    pub fn peer_mtu(&self) -> u16 {
        self.peer_mtu
    }

    pub fn set_peer_mtu(&mut self, mtu: u16) {
        self.peer_mtu = mtu;
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    pub fn set_link_state(&mut self, state: LinkState) {
        self.link_state = state;
    }

    pub fn config_status(&self) -> ConfigStatus {
        self.config
    }

    /// Record a completed half of the configuration handshake
    ///
    /// Returns true when this call completed the handshake.
    pub fn complete_config(&mut self, half: ConfigStatus) -> bool {
        let was_done = self.is_configured();
        self.config.insert(half);
        !was_done && self.is_configured()
    }

    pub fn is_configured(&self) -> bool {
        self.config.contains(ConfigStatus::LOCAL_DONE | ConfigStatus::REMOTE_DONE)
    }

    pub fn fsm_state(&self) -> State {
        self.fsm_state
    }

    pub fn set_fsm_state(&mut self, state: State) {
        self.fsm_state = state;
    }

    pub fn reassembler_mut(&mut self) -> &mut Reassembler {
        &mut self.reassembler
    }

    pub fn collision_retried(&self) -> bool {
        self.collision_retried
    }

    /// Return the handshake to its initial state for a collision retry
    pub fn reset_for_retry(&mut self) {
        self.lcid = 0;
        self.peer_mtu = 0;
        self.link_state = LinkState::Idle;
        self.config = ConfigStatus::empty();
        self.fsm_state = State::Idle;
        self.reassembler.reset();
        self.collision_retried = true;
    }

    /// Whether messages can be exchanged on the channel
    pub fn is_open(&self) -> bool {
        matches!(self.fsm_state, State::Opened | State::Busy)
    }
}

impl fmt::Debug for ChannelBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBlock")
            .field("kind", &self.kind)
            .field("role", &self.role)
            .field("lcid", &format_args!("0x{:04X}", self.lcid))
            .field("peer_mtu", &self.peer_mtu)
            .field("link_state", &self.link_state)
            .field("config", &self.config)
            .field("fsm_state", &self.fsm_state)
            .field("reassembling", &self.reassembler.in_progress())
            .finish()
    }
}
