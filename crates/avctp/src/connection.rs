//! Logical connection blocks and their registry
//!
//! Every profile instance using AVCTP owns one connection block. Several
//! blocks share the physical channels of a device; the profile id keeps
//! inbound traffic apart.

use log::{debug, warn};
use std::fmt;

use crate::arena::SlotTable;
use crate::constants::MAX_CONNECTIONS;
use crate::device::DeviceId;
use crate::error::{AvctError, AvctResult, ResultCode};
use crate::types::{
    invoke_event_callback, invoke_message_callback, BdAddr, ChannelEvent, ChannelEventCallback,
    ChannelEventKind, ConnectParams, ConnectionId, Message, MessageCallback, Role,
};

/// Binding status of a connection slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Unallocated,
    /// Handed out but not yet linked to a channel
    Allocated,
    /// Linked to a device's control channel
    Bound,
}

/// Per-connection state
pub struct ConnectionBlock {
    id: ConnectionId,
    pid: u16,
    role: Role,
    event_callback: ChannelEventCallback,
    message_callback: MessageCallback,
    status: ConnectionStatus,
    device: Option<DeviceId>,
    /// Peer an initiator connects to, `BdAddr::ANY` for acceptors
    peer: BdAddr,
    /// Role requested through BrowsingConnect
    browsing_role: Option<Role>,
    browsing_bound: bool,
}

impl ConnectionBlock {
    fn new(id: ConnectionId, params: &ConnectParams, peer: BdAddr) -> Self {
        Self {
            id,
            pid: params.pid,
            role: params.role,
            event_callback: params.event_callback.clone(),
            message_callback: params.message_callback.clone(),
            status: ConnectionStatus::Allocated,
            device: None,
            peer,
            browsing_role: None,
            browsing_bound: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_bound(&self) -> bool {
        self.status == ConnectionStatus::Bound
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    pub fn peer(&self) -> BdAddr {
        self.peer
    }

    pub fn browsing_role(&self) -> Option<Role> {
        self.browsing_role
    }

    pub fn set_browsing_role(&mut self, role: Option<Role>) {
        self.browsing_role = role;
    }

    pub fn is_browsing_bound(&self) -> bool {
        self.browsing_bound
    }

    pub fn set_browsing_bound(&mut self, bound: bool) {
        self.browsing_bound = bound;
    }

    /// Link this block to a device's control channel
    pub fn bind(&mut self, device: DeviceId, peer: BdAddr) {
        self.status = ConnectionStatus::Bound;
        self.device = Some(device);
        self.peer = peer;
    }

    /// Deliver a channel event to the owner
    pub fn notify(&self, kind: ChannelEventKind, result: ResultCode, detail: u16) {
        let event = ChannelEvent {
            connection_id: self.id,
            kind,
            result,
            detail,
            peer: self.peer,
        };
        debug!("Connection {} event {:?} result {:?}", self.id, kind, result);
        if let Err(e) = invoke_event_callback(&self.event_callback, event) {
            warn!("Channel event callback for connection {} failed: {}", self.id, e);
        }
    }

    /// Deliver an inbound message to the owner
    pub fn deliver(&self, message: Message) {
        if let Err(e) = invoke_message_callback(&self.message_callback, message) {
            warn!("Message callback for connection {} failed: {}", self.id, e);
        }
    }
}

impl fmt::Debug for ConnectionBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBlock")
            .field("id", &self.id)
            .field("pid", &format_args!("0x{:04X}", self.pid))
            .field("role", &self.role)
            .field("status", &self.status)
            .field("device", &self.device)
            .field("peer", &format_args!("{}", self.peer))
            .field("browsing_role", &self.browsing_role)
            .field("browsing_bound", &self.browsing_bound)
            .finish()
    }
}

/// Registry of connection blocks
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: SlotTable<ConnectionBlock>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::with_capacity(MAX_CONNECTIONS)
    }
}

impl ConnectionRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(ConnectionId::MAX as usize + 1);
        Self {
            connections: SlotTable::with_capacity(capacity),
        }
    }

    /// Take a free slot for a new connection
    pub fn allocate(&mut self, params: &ConnectParams, peer: BdAddr) -> AvctResult<ConnectionId> {
        let index = self
            .connections
            .insert(ConnectionBlock::new(0, params, peer))
            .map_err(|_| AvctError::NoResources("connection block"))?;

        let id = index as ConnectionId;
        if let Some(conn) = self.connections.get_mut(index) {
            conn.id = id;
        }
        debug!(
            "Allocated connection {} (pid 0x{:04X}, {:?})",
            id, params.pid, params.role
        );
        Ok(id)
    }

    /// Release a connection after it has been unbound
    ///
    /// Acceptor blocks go back to Allocated so the next incoming channel can
    /// bind them again. Initiator blocks free their slot.
    pub fn deallocate(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(id as usize) else {
            return;
        };

        match conn.role {
            Role::Acceptor => {
                conn.status = ConnectionStatus::Allocated;
                conn.device = None;
                conn.peer = BdAddr::ANY;
                conn.browsing_bound = false;
                debug!("Connection {} reset for reuse", id);
            }
            Role::Initiator => {
                self.connections.remove(id as usize);
                debug!("Connection {} freed", id);
            }
        }
    }

    /// Free the slot whatever the role
    pub fn release(&mut self, id: ConnectionId) -> Option<ConnectionBlock> {
        self.connections.remove(id as usize)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionBlock> {
        self.connections.get(id as usize)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionBlock> {
        self.connections.get_mut(id as usize)
    }

    pub fn find_by_id(&self, id: ConnectionId) -> AvctResult<&ConnectionBlock> {
        self.get(id).ok_or(AvctError::BadConnection(id))
    }

    pub fn status(&self, id: ConnectionId) -> ConnectionStatus {
        self.get(id)
            .map_or(ConnectionStatus::Unallocated, |conn| conn.status)
    }

    /// The bound connection on `device` owning `pid`
    pub fn find_by_profile_on_device(&self, device: DeviceId, pid: u16) -> Option<ConnectionId> {
        self.connections
            .iter()
            .find(|(_, conn)| conn.is_bound() && conn.device == Some(device) && conn.pid == pid)
            .map(|(_, conn)| conn.id)
    }

    /// Connections bound to `device`
    pub fn bound_to(&self, device: DeviceId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.is_bound() && conn.device == Some(device))
            .map(|(_, conn)| conn.id)
            .collect()
    }

    /// Initiators still waiting for a channel to `peer`
    pub fn pending_for(&self, peer: &BdAddr) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|(_, conn)| {
                conn.status == ConnectionStatus::Allocated
                    && conn.role == Role::Initiator
                    && conn.peer == *peer
            })
            .map(|(_, conn)| conn.id)
            .collect()
    }

    /// Acceptors waiting for an incoming channel
    pub fn waiting_acceptors(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.status == ConnectionStatus::Allocated && conn.role == Role::Acceptor)
            .map(|(_, conn)| conn.id)
            .collect()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .map(|(_, conn)| conn.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
