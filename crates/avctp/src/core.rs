//! AVCTP core
//!
//! `AvctCore` owns the registration state, the device and connection
//! registries and the handles of the L2CAP and security collaborators. It
//! handles:
//! - the bodies of the public operations
//! - L2CAP notifications and security results, translated into state machine events
//! - the channel configuration handshake
//! - channel and device cleanup
//!
//! The core is not thread safe by itself; the dispatcher runs every call on
//! a single task.

use log::{debug, error, info, warn};
use std::sync::Arc;

use crate::actions;
use crate::channel::{ChannelBlock, ConfigStatus, LinkState};
use crate::config::AvctConfig;
use crate::connection::{ConnectionRegistry, ConnectionStatus};
use crate::constants::*;
use crate::device::{DeviceId, DeviceRegistry};
use crate::dispatcher::EventSender;
use crate::error::{AvctError, AvctResult, ResultCode};
use crate::l2cap::{L2capEvent, L2capService};
use crate::security::{Direction, SecurityRequest, SecurityService, ServiceId};
use crate::state::{self, Action, ActionSink, Event, EventData, OutboundMessage, State};
use crate::types::{
    BdAddr, ChannelEventKind, ChannelId, ChannelKind, CommandResponse, ConnectParams, ConnectionId,
    Role,
};

/// Result of a security check, posted back to the AVCTP task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SecurityOutcome {
    pub peer: BdAddr,
    pub kind: ChannelKind,
    pub direction: Direction,
    pub result: u16,
}

/// Notifications from the collaborators
#[derive(Debug)]
pub(crate) enum TransportEvent {
    L2cap(L2capEvent),
    Security(SecurityOutcome),
}

/// The AVCTP protocol instance
pub struct AvctCore {
    l2cap: Arc<dyn L2capService>,
    security: Arc<dyn SecurityService>,
    events: EventSender,
    registration: Option<AvctConfig>,
    pub(crate) devices: DeviceRegistry,
    pub(crate) connections: ConnectionRegistry,
}

/// Binds the state machine to the channels of one device
struct DeviceContext<'a> {
    core: &'a mut AvctCore,
    device: DeviceId,
}

impl ActionSink for DeviceContext<'_> {
    fn fsm_state(&self, kind: ChannelKind) -> Option<State> {
        self.core
            .devices
            .channel(self.device, kind)
            .map(|channel| channel.fsm_state())
    }

    fn set_fsm_state(&mut self, kind: ChannelKind, state: State) {
        if let Some(channel) = self.core.devices.channel_mut(self.device, kind) {
            channel.set_fsm_state(state);
        }
    }

    fn perform(&mut self, kind: ChannelKind, action: Action, data: EventData) -> AvctResult<()> {
        let handler = actions::handler(kind, action);
        handler(self.core, self.device, data)
    }
}

impl AvctCore {
    pub(crate) fn new(
        l2cap: Arc<dyn L2capService>,
        security: Arc<dyn SecurityService>,
        events: EventSender,
    ) -> Self {
        Self {
            l2cap,
            security,
            events,
            registration: None,
            devices: DeviceRegistry::default(),
            connections: ConnectionRegistry::default(),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    fn ensure_registered(&self) -> AvctResult<AvctConfig> {
        self.registration.ok_or(AvctError::NotRegistered)
    }

    pub(crate) fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    pub(crate) fn l2cap(&self) -> &dyn L2capService {
        self.l2cap.as_ref()
    }

    /// Feed an event into the state machine of one channel
    pub(crate) fn dispatch(
        &mut self,
        device: DeviceId,
        kind: ChannelKind,
        event: Event,
        data: EventData,
    ) -> AvctResult<()> {
        let mut context = DeviceContext { core: self, device };
        state::dispatch(&mut context, kind, event, data)
    }

    /// Report a channel failure or loss to the state machine
    pub(crate) fn fail_channel(&mut self, device: DeviceId, kind: ChannelKind, result: ResultCode, detail: u16) {
        let data = EventData::Result { result, detail };
        if let Err(e) = self.dispatch(device, kind, Event::PeerDisconnected, data) {
            warn!("Failed to tear down {} channel: {}", kind, e);
        }
    }

    // Registration

    pub fn register(&mut self, config: AvctConfig) -> AvctResult<()> {
        if self.registration.is_some() {
            debug!("AVCTP already registered");
            return Ok(());
        }
        config.validate()?;

        self.l2cap.register_service(AVCTP_PSM, self.events.clone())?;
        if let Err(e) = self
            .l2cap
            .register_service(AVCTP_BROWSING_PSM, self.events.clone())
        {
            self.l2cap.deregister_service(AVCTP_PSM);
            return Err(e);
        }

        info!(
            "AVCTP registered as {:?} (control mtu {}, browsing mtu {})",
            config.role, config.control_mtu, config.browsing_mtu
        );
        self.registration = Some(config);
        Ok(())
    }

    pub fn deregister(&mut self) -> AvctResult<()> {
        if self.registration.is_none() {
            return Ok(());
        }

        for id in self.connections.ids() {
            if let Err(e) = self.disconnect(id) {
                warn!("Failed to disconnect connection {} during deregistration: {}", id, e);
            }
        }

        self.l2cap.deregister_service(AVCTP_BROWSING_PSM);
        self.l2cap.deregister_service(AVCTP_PSM);
        self.registration = None;

        // Acceptors only kept for reuse are dropped with the registration
        for id in self.connections.waiting_acceptors() {
            self.connections.release(id);
        }
        info!("AVCTP deregistered");
        Ok(())
    }

    // Connections

    pub fn connect(&mut self, params: ConnectParams, peer: BdAddr) -> AvctResult<ConnectionId> {
        self.ensure_registered()?;

        if params.role == Role::Acceptor {
            let id = self.connections.allocate(&params, BdAddr::ANY)?;
            info!("Connection {} waiting for pid 0x{:04X}", id, params.pid);
            return Ok(id);
        }

        if !peer.is_unicast() {
            return Err(AvctError::InvalidParameter(format!(
                "cannot connect to {}",
                peer
            )));
        }

        if let Some(device) = self.devices.find_by_address(&peer) {
            if self
                .connections
                .find_by_profile_on_device(device, params.pid)
                .is_some()
            {
                return Err(AvctError::PidInUse(params.pid));
            }
        }
        let pending_same_pid = self
            .connections
            .pending_for(&peer)
            .into_iter()
            .any(|id| self.connections.get(id).is_some_and(|conn| conn.pid() == params.pid));
        if pending_same_pid {
            return Err(AvctError::PidInUse(params.pid));
        }

        let id = self.connections.allocate(&params, peer)?;
        let device = match self.devices.find_or_allocate(peer) {
            Ok(device) => device,
            Err(e) => {
                self.connections.release(id);
                return Err(e);
            }
        };

        match self.devices.channel(device, ChannelKind::Control) {
            None => {
                if let Some(block) = self.devices.get_mut(device) {
                    block.set_channel(ChannelBlock::new(ChannelKind::Control, Role::Initiator));
                }
            }
            Some(channel) if channel.role() == Role::Acceptor && channel.fsm_state() == State::Idle => {
                // An incoming channel from this peer binds us once it opens
                debug!("Connection {} waits for the incoming channel from {}", id, peer);
                return Ok(id);
            }
            Some(_) => {}
        }

        info!("Connection {} to {} for pid 0x{:04X}", id, peer, params.pid);
        self.dispatch(device, ChannelKind::Control, Event::Bind, EventData::Connection(id))?;
        Ok(id)
    }

    pub fn disconnect(&mut self, id: ConnectionId) -> AvctResult<()> {
        self.ensure_registered()?;
        let conn = self.connections.find_by_id(id)?;
        let (status, device, role, peer) = (conn.status(), conn.device(), conn.role(), conn.peer());
        let browsing_bound = conn.is_browsing_bound();

        match (status, device) {
            (ConnectionStatus::Bound, Some(device)) => {
                if browsing_bound && self.devices.channel(device, ChannelKind::Browsing).is_some() {
                    self.dispatch(device, ChannelKind::Browsing, Event::Unbind, EventData::Connection(id))?;
                }
                self.dispatch(device, ChannelKind::Control, Event::Unbind, EventData::Connection(id))
            }
            _ if role == Role::Acceptor => {
                self.connections.release(id);
                debug!("Released waiting acceptor {}", id);
                Ok(())
            }
            _ => {
                let device = self
                    .devices
                    .find_by_address(&peer)
                    .filter(|device| self.devices.channel(*device, ChannelKind::Control).is_some());
                match device {
                    Some(device) => {
                        self.dispatch(device, ChannelKind::Control, Event::Unbind, EventData::Connection(id))
                    }
                    None => {
                        self.connections.release(id);
                        Ok(())
                    }
                }
            }
        }
    }

    /// Device a connection is bound to
    fn bound_device(&self, id: ConnectionId) -> AvctResult<DeviceId> {
        let conn = self.connections.find_by_id(id)?;
        match (conn.status(), conn.device()) {
            (ConnectionStatus::Bound, Some(device)) => Ok(device),
            _ => Err(AvctError::ChannelNotOpen),
        }
    }

    fn validate_message(label: u8, cr: CommandResponse) -> AvctResult<()> {
        if label > MAX_LABEL {
            return Err(AvctError::InvalidParameter(format!("label {} exceeds 4 bits", label)));
        }
        if cr == CommandResponse::Reject {
            return Err(AvctError::InvalidParameter(
                "rejects are generated by AVCTP itself".to_string(),
            ));
        }
        Ok(())
    }

    pub fn send_message(
        &mut self,
        id: ConnectionId,
        label: u8,
        cr: CommandResponse,
        payload: Vec<u8>,
    ) -> AvctResult<()> {
        self.ensure_registered()?;
        Self::validate_message(label, cr)?;
        let device = self.bound_device(id)?;

        let message = OutboundMessage {
            connection: id,
            label,
            cr,
            payload,
        };
        self.dispatch(device, ChannelKind::Control, Event::SendMessage, EventData::Outbound(message))
    }

    pub fn peer_mtu(&self, id: ConnectionId) -> AvctResult<u16> {
        let device = self.bound_device(id)?;
        self.devices
            .channel(device, ChannelKind::Control)
            .map(|channel| channel.peer_mtu())
            .ok_or(AvctError::ChannelNotOpen)
    }

    // Browsing

    pub fn browsing_connect(&mut self, id: ConnectionId, role: Role) -> AvctResult<()> {
        self.ensure_registered()?;
        let device = self.bound_device(id)?;
        let control_open = self
            .devices
            .channel(device, ChannelKind::Control)
            .is_some_and(|channel| channel.is_open());
        if !control_open {
            return Err(AvctError::ChannelNotOpen);
        }

        if let Some(conn) = self.connections.get_mut(id) {
            conn.set_browsing_role(Some(role));
        }
        if role == Role::Acceptor {
            debug!("Connection {} accepts browsing", id);
            return Ok(());
        }

        match self.devices.channel(device, ChannelKind::Browsing) {
            None => {
                if let Some(block) = self.devices.get_mut(device) {
                    block.set_channel(ChannelBlock::new(ChannelKind::Browsing, Role::Initiator));
                }
            }
            Some(channel) if channel.role() == Role::Acceptor && channel.fsm_state() == State::Idle => {
                return Ok(());
            }
            Some(_) => {}
        }

        self.dispatch(device, ChannelKind::Browsing, Event::Bind, EventData::Connection(id))
    }

    pub fn browsing_disconnect(&mut self, id: ConnectionId) -> AvctResult<()> {
        self.ensure_registered()?;
        let device = self.bound_device(id)?;
        if self.devices.channel(device, ChannelKind::Browsing).is_none() {
            return Err(AvctError::ChannelNotOpen);
        }
        self.dispatch(device, ChannelKind::Browsing, Event::Unbind, EventData::Connection(id))
    }

    pub fn browsing_send_message(
        &mut self,
        id: ConnectionId,
        label: u8,
        cr: CommandResponse,
        payload: Vec<u8>,
    ) -> AvctResult<()> {
        self.ensure_registered()?;
        Self::validate_message(label, cr)?;
        let device = self.bound_device(id)?;
        let browsing_bound = self
            .connections
            .get(id)
            .is_some_and(|conn| conn.is_browsing_bound());
        if !browsing_bound {
            return Err(AvctError::ChannelNotOpen);
        }

        let message = OutboundMessage {
            connection: id,
            label,
            cr,
            payload,
        };
        self.dispatch(device, ChannelKind::Browsing, Event::SendMessage, EventData::Outbound(message))
    }

    pub fn browsing_peer_mtu(&self, id: ConnectionId) -> AvctResult<u16> {
        let device = self.bound_device(id)?;
        self.devices
            .channel(device, ChannelKind::Browsing)
            .map(|channel| channel.peer_mtu())
            .ok_or(AvctError::ChannelNotOpen)
    }

    // Security

    fn service_id(&self, kind: ChannelKind) -> ServiceId {
        let role = self.registration.map(|config| config.role).unwrap_or_default();
        ServiceId::for_channel(role, kind)
    }

    fn local_mtu(&self, kind: ChannelKind) -> u16 {
        let config = self.registration.unwrap_or_default();
        match kind {
            ChannelKind::Control => config.control_mtu,
            ChannelKind::Browsing => config.browsing_mtu,
        }
    }

    /// Ask the security manager to clear a connection on `kind`
    pub(crate) fn request_security(
        &self,
        device: DeviceId,
        kind: ChannelKind,
        direction: Direction,
    ) -> AvctResult<()> {
        let peer = self
            .devices
            .get(device)
            .map(|block| block.peer())
            .ok_or(AvctError::ChannelNotOpen)?;
        let request = SecurityRequest {
            peer,
            service: self.service_id(kind),
            psm: kind.psm(),
            direction,
        };
        debug!("Requesting {} security for {}", request.service, peer);

        let events = self.events.clone();
        let callback = Box::new(move |result: u16| {
            let outcome = SecurityOutcome {
                peer,
                kind,
                direction,
                result,
            };
            if let Err(e) = events.post_completion(TransportEvent::Security(outcome)) {
                error!("Dropping security result for {}: {}", peer, e);
            }
        });
        self.security.request_security(request, callback)
    }

    // Transport events

    pub(crate) fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::L2cap(event) => self.handle_l2cap(event),
            TransportEvent::Security(outcome) => self.handle_security(outcome),
        }
    }

    fn handle_security(&mut self, outcome: SecurityOutcome) {
        let SecurityOutcome {
            peer,
            kind,
            direction,
            result,
        } = outcome;

        match direction {
            Direction::Outgoing => {
                let Some(device) = self.devices.find_by_address(&peer) else {
                    debug!("Security result for {} arrived after cleanup", peer);
                    return;
                };
                let waiting = self.devices.channel(device, kind).is_some_and(|channel| {
                    channel.fsm_state() == State::Opening && !channel.has_lcid()
                });
                if !waiting {
                    debug!("Ignoring stale security result for {} {} channel", peer, kind);
                    return;
                }

                if result != SECURITY_SUCCESS {
                    warn!("Security check for {} {} channel failed: 0x{:04X}", peer, kind, result);
                    self.fail_channel(device, kind, ResultCode::SecurityFailed, result);
                    return;
                }

                match self.l2cap.connect_req(&peer, kind.psm()) {
                    Ok(lcid) => {
                        if let Some(channel) = self.devices.channel_mut(device, kind) {
                            channel.set_lcid(lcid);
                            channel.set_link_state(LinkState::Connecting);
                        }
                        debug!("L2CAP connect request to {} on lcid 0x{:04X}", peer, lcid);
                    }
                    Err(e) => {
                        error!("L2CAP connect request to {} failed: {}", peer, e);
                        self.fail_channel(device, kind, ResultCode::Failed, 0);
                    }
                }
            }
            Direction::Incoming { lcid, identifier } => {
                let Some((device, found_kind)) = self.devices.find_by_channel_id(lcid) else {
                    debug!("Incoming channel 0x{:04X} vanished before security completed", lcid);
                    let _ = self.l2cap.connect_rsp(lcid, identifier, L2CAP_NO_RESOURCES);
                    return;
                };

                if result != SECURITY_SUCCESS {
                    warn!("Rejecting incoming {} channel from {}: security 0x{:04X}", kind, peer, result);
                    let _ = self.l2cap.connect_rsp(lcid, identifier, L2CAP_SECURITY_BLOCK);
                    self.fail_channel(device, found_kind, ResultCode::SecurityFailed, result);
                    return;
                }

                let accepted = self
                    .l2cap
                    .connect_rsp(lcid, identifier, L2CAP_CONNECTION_SUCCESSFUL)
                    .and_then(|_| self.start_configuration(device, found_kind, lcid));
                if let Err(e) = accepted {
                    error!("Failed to accept {} channel from {}: {}", found_kind, peer, e);
                    self.fail_channel(device, found_kind, ResultCode::Failed, 0);
                }
            }
        }
    }

    fn start_configuration(&mut self, device: DeviceId, kind: ChannelKind, lcid: ChannelId) -> AvctResult<()> {
        if let Some(channel) = self.devices.channel_mut(device, kind) {
            channel.set_link_state(LinkState::Configuring);
        }
        self.l2cap.config_req(lcid, self.local_mtu(kind))
    }

    fn channel_opened(&mut self, device: DeviceId, kind: ChannelKind) {
        if let Some(channel) = self.devices.channel_mut(device, kind) {
            channel.set_link_state(LinkState::Opened);
            info!(
                "AVCTP {} channel 0x{:04X} open, peer mtu {}",
                kind,
                channel.lcid(),
                channel.peer_mtu()
            );
        }
        let data = EventData::Result {
            result: ResultCode::Success,
            detail: 0,
        };
        if let Err(e) = self.dispatch(device, kind, Event::PeerConnected, data) {
            warn!("Failed to bind {} channel: {}", kind, e);
        }
    }

    fn handle_l2cap(&mut self, event: L2capEvent) {
        debug!("L2CAP event {:?}", event);

        if let L2capEvent::ConnectInd {
            peer,
            psm,
            lcid,
            identifier,
        } = event
        {
            self.incoming_connection(peer, psm, lcid, identifier);
            return;
        }

        let lcid = event.lcid();
        let Some((device, kind)) = self.devices.find_by_channel_id(lcid) else {
            warn!("L2CAP event for unknown channel 0x{:04X}", lcid);
            return;
        };

        match event {
            L2capEvent::ConnectInd { .. } => {}
            L2capEvent::ConnectRsp { result, .. } => match result {
                L2CAP_CONNECTION_PENDING => debug!("Connection 0x{:04X} pending", lcid),
                L2CAP_CONNECTION_SUCCESSFUL => {
                    if let Err(e) = self.start_configuration(device, kind, lcid) {
                        error!("Failed to configure channel 0x{:04X}: {}", lcid, e);
                        self.fail_channel(device, kind, ResultCode::Failed, 0);
                    }
                }
                _ => {
                    warn!("Peer refused {} channel: 0x{:04X}", kind, result);
                    self.fail_channel(device, kind, ResultCode::PeerRejected, result);
                }
            },
            L2capEvent::ConfigReq { identifier, mtu, .. } => {
                if let Some(channel) = self.devices.channel_mut(device, kind) {
                    channel.set_peer_mtu(mtu);
                }
                if let Err(e) = self.l2cap.config_rsp(lcid, identifier, L2CAP_CONFIG_SUCCESS) {
                    error!("Failed to answer configuration on 0x{:04X}: {}", lcid, e);
                    let _ = self.l2cap.disconnect_req(lcid);
                    self.fail_channel(device, kind, ResultCode::Failed, 0);
                    return;
                }
                let completed = self
                    .devices
                    .channel_mut(device, kind)
                    .is_some_and(|channel| channel.complete_config(ConfigStatus::REMOTE_DONE));
                if completed {
                    self.channel_opened(device, kind);
                }
            }
            L2capEvent::ConfigRsp { result, .. } => {
                if result != L2CAP_CONFIG_SUCCESS {
                    warn!("Peer rejected configuration of 0x{:04X}: 0x{:04X}", lcid, result);
                    let _ = self.l2cap.disconnect_req(lcid);
                    self.fail_channel(device, kind, ResultCode::Failed, result);
                    return;
                }
                let completed = self
                    .devices
                    .channel_mut(device, kind)
                    .is_some_and(|channel| channel.complete_config(ConfigStatus::LOCAL_DONE));
                if completed {
                    self.channel_opened(device, kind);
                }
            }
            L2capEvent::DisconnectInd { identifier, .. } => {
                if let Err(e) = self.l2cap.disconnect_rsp(lcid, identifier) {
                    warn!("Failed to answer disconnection of 0x{:04X}: {}", lcid, e);
                }
                self.fail_channel(device, kind, ResultCode::Success, 0);
            }
            L2capEvent::DisconnectRsp { .. } => {
                self.fail_channel(device, kind, ResultCode::Success, 0);
            }
            L2capEvent::DisconnectAbnormal { reason, .. } => {
                self.abnormal_disconnect(device, kind, reason);
            }
            L2capEvent::Data { payload, .. } => {
                if let Err(e) = self.dispatch(device, kind, Event::MessageReceived, EventData::Inbound(payload)) {
                    debug!("Inbound data on 0x{:04X} not delivered: {}", lcid, e);
                }
            }
            L2capEvent::RemoteBusy { busy, .. } => {
                if let Err(e) = self.dispatch(device, kind, Event::PeerBusyChanged, EventData::Busy(busy)) {
                    warn!("Failed to apply busy state on 0x{:04X}: {}", lcid, e);
                }
            }
        }
    }

    fn incoming_connection(&mut self, peer: BdAddr, psm: u16, lcid: ChannelId, identifier: u8) {
        let Some(kind) = ChannelKind::from_psm(psm) else {
            warn!("Incoming connection on unexpected PSM 0x{:04X}", psm);
            let _ = self.l2cap.connect_rsp(lcid, identifier, L2CAP_PSM_NOT_SUPPORTED);
            return;
        };
        if self.registration.is_none() {
            warn!("Refusing {} channel from {}: not registered", kind, peer);
            let _ = self.l2cap.connect_rsp(lcid, identifier, L2CAP_NO_RESOURCES);
            return;
        }

        if kind == ChannelKind::Browsing {
            let control_open = self
                .devices
                .find_by_address(&peer)
                .and_then(|device| self.devices.channel(device, ChannelKind::Control))
                .is_some_and(|channel| channel.is_open());
            if !control_open {
                warn!("Refusing browsing channel from {} without a control channel", peer);
                let _ = self.l2cap.connect_rsp(lcid, identifier, L2CAP_NO_RESOURCES);
                return;
            }
        }

        let device = match self.devices.find_or_allocate(peer) {
            Ok(device) => device,
            Err(e) => {
                warn!("Refusing {} channel from {}: {}", kind, peer, e);
                let _ = self.l2cap.connect_rsp(lcid, identifier, L2CAP_NO_RESOURCES);
                return;
            }
        };

        if self.devices.channel(device, kind).is_some() {
            warn!("Refusing {} channel from {}: channel already exists", kind, peer);
            let _ = self.l2cap.connect_rsp(lcid, identifier, L2CAP_NO_RESOURCES);
            return;
        }

        let mut channel = ChannelBlock::new(kind, Role::Acceptor);
        channel.set_lcid(lcid);
        channel.set_link_state(LinkState::Connecting);
        if let Some(block) = self.devices.get_mut(device) {
            block.set_channel(channel);
        }
        info!("Incoming {} channel 0x{:04X} from {}", kind, lcid, peer);

        if let Err(e) = self.request_security(device, kind, Direction::Incoming { lcid, identifier }) {
            error!("Security request for incoming {} channel failed: {}", kind, e);
            let _ = self.l2cap.connect_rsp(lcid, identifier, L2CAP_SECURITY_BLOCK);
            self.fail_channel(device, kind, ResultCode::SecurityFailed, 0);
        }
    }

    fn abnormal_disconnect(&mut self, device: DeviceId, kind: ChannelKind, reason: u8) {
        let retry = self.devices.channel(device, kind).is_some_and(|channel| {
            reason == L2CAP_STATE_COLLISION
                && channel.role() == Role::Initiator
                && channel.fsm_state() == State::Opening
                && !channel.collision_retried()
        });

        if !retry {
            warn!("{} channel lost abnormally: 0x{:02X}", kind, reason);
            self.fail_channel(device, kind, ResultCode::Failed, reason as u16);
            return;
        }

        let peer = self.devices.get(device).map(|block| block.peer()).unwrap_or_default();
        warn!("L2CAP state collision on {} channel to {}, retrying once", kind, peer);
        if let Some(channel) = self.devices.channel_mut(device, kind) {
            channel.reset_for_retry();
        }

        let waiting = match kind {
            ChannelKind::Control => self.connections.pending_for(&peer).first().copied(),
            ChannelKind::Browsing => self.connections.bound_to(device).into_iter().find(|id| {
                self.connections.get(*id).is_some_and(|conn| {
                    conn.browsing_role() == Some(Role::Initiator) && !conn.is_browsing_bound()
                })
            }),
        };

        match waiting {
            Some(id) => {
                if let Err(e) = self.dispatch(device, kind, Event::Bind, EventData::Connection(id)) {
                    warn!("Collision retry on {} channel failed: {}", kind, e);
                }
            }
            None => self.release_channel(device, kind),
        }
    }

    // Cleanup

    /// Return an unbound connection to the registry
    pub(crate) fn retire_connection(&mut self, id: ConnectionId) {
        if self.registration.is_some() {
            self.connections.deallocate(id);
        } else {
            self.connections.release(id);
        }
    }

    /// Free a channel block once its state machine is back to Idle
    ///
    /// Losing the control channel takes the browsing channel with it. The
    /// device is freed when nothing is left on it.
    pub(crate) fn release_channel(&mut self, device: DeviceId, kind: ChannelKind) {
        if kind == ChannelKind::Control {
            self.teardown_browsing(device);
        }
        let Some(block) = self.devices.get_mut(device) else {
            return;
        };
        if let Some(channel) = block.take_channel(kind) {
            debug!("Released {:?}", channel);
        }

        if block.is_unused() {
            self.devices.deallocate(device);
        }
    }

    /// Drop the browsing channel of a device that is losing its control channel
    pub(crate) fn teardown_browsing(&mut self, device: DeviceId) {
        let Some(browsing) = self
            .devices
            .get_mut(device)
            .and_then(|block| block.take_channel(ChannelKind::Browsing))
        else {
            return;
        };

        if browsing.has_lcid() && browsing.fsm_state() != State::Closing {
            if let Err(e) = self.l2cap.disconnect_req(browsing.lcid()) {
                warn!("Failed to close browsing channel 0x{:04X}: {}", browsing.lcid(), e);
            }
        }
        for id in self.connections.bound_to(device) {
            if let Some(conn) = self.connections.get_mut(id) {
                conn.set_browsing_role(None);
                if conn.is_browsing_bound() {
                    conn.set_browsing_bound(false);
                    conn.notify(ChannelEventKind::BrowsingDisconnectIndication, ResultCode::Success, 0);
                }
            }
        }
    }

    // Inspection

    /// State machine state of a peer's channel
    pub fn channel_state(&self, peer: &BdAddr, kind: ChannelKind) -> Option<State> {
        let device = self.devices.find_by_address(peer)?;
        self.devices
            .channel(device, kind)
            .map(|channel| channel.fsm_state())
    }

    /// Number of connections bound to a peer's control channel
    pub fn bound_count(&self, peer: &BdAddr) -> usize {
        self.devices
            .find_by_address(peer)
            .and_then(|device| self.devices.get(device))
            .map_or(0, |block| block.bound_count())
    }

    pub fn connection_status(&self, id: ConnectionId) -> ConnectionStatus {
        self.connections.status(id)
    }
}
