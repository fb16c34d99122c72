//! State machine action handlers
//!
//! Control and browsing channels each have their own handler set. Handlers
//! run on the AVCTP task with the next state already stored on the channel.

mod browsing;
mod control;

use log::{debug, trace, warn};

use crate::core::AvctCore;
use crate::device::DeviceId;
use crate::error::{AvctError, AvctResult, ResultCode};
use crate::packet::MessageHeader;
use crate::security::Direction;
use crate::state::{Action, EventData, State};
use crate::types::{ChannelEventKind, ChannelId, ChannelKind, CommandResponse, ConnectionId, Message};
use crate::constants::SINGLE_HEADER_SIZE;

/// An action handler
pub(crate) type ActionFn = fn(&mut AvctCore, DeviceId, EventData) -> AvctResult<()>;

/// Handler bound to `action` for channels of `kind`
pub(crate) fn handler(kind: ChannelKind, action: Action) -> ActionFn {
    match kind {
        ChannelKind::Control => control::handler(action),
        ChannelKind::Browsing => browsing::handler(action),
    }
}

fn ignore(_core: &mut AvctCore, _device: DeviceId, _data: EventData) -> AvctResult<()> {
    Ok(())
}

fn connection_of(data: &EventData) -> AvctResult<ConnectionId> {
    match data {
        EventData::Connection(id) => Ok(*id),
        other => Err(AvctError::InvalidParameter(format!(
            "expected a connection, got {:?}",
            other
        ))),
    }
}

fn result_of(data: &EventData) -> (ResultCode, u16) {
    match data {
        EventData::Result { result, detail } => (*result, *detail),
        _ => (ResultCode::Success, 0),
    }
}

/// Start the security check that precedes an outgoing channel
fn open_channel(core: &mut AvctCore, device: DeviceId, kind: ChannelKind) -> AvctResult<()> {
    if let Err(e) = core.request_security(device, kind, Direction::Outgoing) {
        warn!("Could not start security for {} channel: {}", kind, e);
        core.fail_channel(device, kind, ResultCode::SecurityFailed, 0);
    }
    Ok(())
}

fn close_channel(core: &mut AvctCore, device: DeviceId, kind: ChannelKind) -> AvctResult<()> {
    let lcid = core
        .devices
        .channel(device, kind)
        .filter(|channel| channel.has_lcid())
        .map(|channel| channel.lcid());

    match lcid {
        Some(lcid) => {
            debug!("Closing {} channel 0x{:04X}", kind, lcid);
            if let Err(e) = core.l2cap().disconnect_req(lcid) {
                warn!("L2CAP disconnect of 0x{:04X} failed: {}", lcid, e);
                core.fail_channel(device, kind, ResultCode::Failed, 0);
            }
        }
        // Nothing was opened at the L2CAP level yet
        None => core.fail_channel(device, kind, ResultCode::Success, 0),
    }
    Ok(())
}

fn discard(core: &mut AvctCore, device: DeviceId, kind: ChannelKind) -> AvctResult<()> {
    let state = core.devices.channel(device, kind).map(|channel| channel.fsm_state());
    debug!("Discarding outbound message on {} channel in {:?}", kind, state);
    match state {
        Some(State::Busy) => Err(AvctError::ChannelBusy),
        _ => Err(AvctError::ChannelNotOpen),
    }
}

fn discard_inbound(kind: ChannelKind, data: &EventData) -> AvctResult<()> {
    if let EventData::Inbound(packet) = data {
        debug!("Discarding {} byte packet on {} channel that is not open", packet.len(), kind);
    }
    Ok(())
}

fn channel_lcid(core: &AvctCore, device: DeviceId, kind: ChannelKind) -> AvctResult<ChannelId> {
    core.devices
        .channel(device, kind)
        .map(|channel| channel.lcid())
        .ok_or(AvctError::ChannelNotOpen)
}

fn send_packet(core: &AvctCore, lcid: ChannelId, packet: Vec<u8>) -> AvctResult<()> {
    trace!("AVCTP tx 0x{:04X}: {}", lcid, hex::encode(&packet));
    core.l2cap().send_data(lcid, packet)
}

/// Hand a complete message to the connection owning its profile id
///
/// Commands for an unknown profile id are answered with a reject. Messages
/// carrying the invalid profile id flag are never rejected.
fn route_message(core: &mut AvctCore, device: DeviceId, kind: ChannelKind, message: Vec<u8>) -> AvctResult<()> {
    let Some(header) = MessageHeader::parse(&message) else {
        warn!("Dropping malformed message on {} channel", kind);
        return Ok(());
    };

    // Browsing messages only reach connections that joined the browsing channel
    let owner = core
        .connections
        .find_by_profile_on_device(device, header.pid)
        .filter(|id| {
            kind == ChannelKind::Control
                || core
                    .connections
                    .get(*id)
                    .is_some_and(|conn| conn.is_browsing_bound())
        });

    match owner {
        Some(id) => {
            if let Some(conn) = core.connections.get(id) {
                conn.deliver(Message {
                    connection_id: id,
                    label: header.label,
                    cr: header.cr,
                    channel: kind,
                    payload: message[SINGLE_HEADER_SIZE..].to_vec(),
                });
            }
            Ok(())
        }
        None if header.ipid => {
            debug!("Dropping message for pid 0x{:04X} with invalid profile flag", header.pid);
            Ok(())
        }
        None if header.cr == CommandResponse::Command => {
            debug!(
                "Rejecting command for unknown pid 0x{:04X}, label {}",
                header.pid, header.label
            );
            let lcid = channel_lcid(core, device, kind)?;
            send_packet(core, lcid, MessageHeader::reject(header.label, header.pid).to_bytes())
        }
        None => {
            debug!("Dropping response for unknown pid 0x{:04X}", header.pid);
            Ok(())
        }
    }
}

/// Fail every initiator still waiting for a control channel to this device
fn fail_pending(core: &mut AvctCore, device: DeviceId, result: ResultCode, detail: u16) {
    let Some(peer) = core.devices.get(device).map(|block| block.peer()) else {
        return;
    };
    let result = if result.is_success() {
        ResultCode::Failed
    } else {
        result
    };

    for id in core.connections.pending_for(&peer) {
        if let Some(conn) = core.connections.get(id) {
            conn.notify(ChannelEventKind::ConnectConfirm, result, detail);
        }
        core.retire_connection(id);
    }
}
