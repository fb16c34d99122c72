//! Control channel handlers

use log::{debug, info, trace};

use super::{
    close_channel, connection_of, discard, discard_inbound, fail_pending, ignore, open_channel,
    result_of, route_message, send_packet, ActionFn,
};
use crate::channel::LinkState;
use crate::core::AvctCore;
use crate::device::DeviceId;
use crate::error::{AvctError, AvctResult, ResultCode};
use crate::packet;
use crate::state::{Action, Event, EventData, State};
use crate::types::{ChannelEventKind, ChannelKind, ConnectionId, Role};

const KIND: ChannelKind = ChannelKind::Control;

pub(super) fn handler(action: Action) -> ActionFn {
    match action {
        Action::Ignore => ignore,
        Action::OpenChannel => open,
        Action::UnbindNoop => unbind_noop,
        Action::Discard => discard_outbound,
        Action::BindOnConnect => bind_on_connect,
        Action::NotifyDisconnectInd => notify_disconnect_ind,
        Action::DiscardInbound => drop_inbound,
        Action::CloseChannel => close,
        Action::NotifyConnectFail => notify_connect_fail,
        Action::BindExisting => bind_existing,
        Action::CheckLastUnbind => check_last_unbind,
        Action::SendFramed => send_framed,
        Action::Deliver => deliver,
        Action::NotifyBusy => notify_busy,
        Action::BindFailNotify => bind_fail_notify,
        Action::NotifyDisconnectCfm => notify_disconnect_cfm,
    }
}

fn open(core: &mut AvctCore, device: DeviceId, _data: EventData) -> AvctResult<()> {
    open_channel(core, device, KIND)
}

fn close(core: &mut AvctCore, device: DeviceId, _data: EventData) -> AvctResult<()> {
    close_channel(core, device, KIND)
}

fn discard_outbound(core: &mut AvctCore, device: DeviceId, _data: EventData) -> AvctResult<()> {
    discard(core, device, KIND)
}

fn drop_inbound(_core: &mut AvctCore, _device: DeviceId, data: EventData) -> AvctResult<()> {
    discard_inbound(KIND, &data)
}

/// Link a connection to the device's control channel and confirm it
fn bind_connection(core: &mut AvctCore, device: DeviceId, id: ConnectionId, event: ChannelEventKind) {
    let Some(peer) = core.devices.get(device).map(|block| block.peer()) else {
        return;
    };
    let Some(conn) = core.connections.get_mut(id) else {
        return;
    };

    conn.bind(device, peer);
    conn.notify(event, ResultCode::Success, 0);
    if let Some(block) = core.devices.get_mut(device) {
        block.increment_bound();
    }
    info!("Connection {} bound to {}", id, peer);
}

/// Unlink one connection, leaving the channel up
fn unbind_connection(core: &mut AvctCore, device: DeviceId, id: ConnectionId, result: ResultCode, detail: u16) {
    if let Some(conn) = core.connections.get(id) {
        conn.notify(ChannelEventKind::DisconnectConfirm, result, detail);
    }
    if let Some(block) = core.devices.get_mut(device) {
        block.decrement_bound();
    }
    core.retire_connection(id);
    info!("Connection {} unbound", id);
}

/// Unlink every connection bound to the device with `event`
fn unbind_all(core: &mut AvctCore, device: DeviceId, event: ChannelEventKind, result: ResultCode, detail: u16) {
    for id in core.connections.bound_to(device) {
        if let Some(conn) = core.connections.get(id) {
            conn.notify(event, result, detail);
        }
        core.retire_connection(id);
    }
    if let Some(block) = core.devices.get_mut(device) {
        block.clear_bound();
    }
}

fn unbind_noop(core: &mut AvctCore, _device: DeviceId, data: EventData) -> AvctResult<()> {
    let id = connection_of(&data)?;
    if let Some(conn) = core.connections.get(id) {
        conn.notify(ChannelEventKind::DisconnectConfirm, ResultCode::Success, 0);
    }
    core.retire_connection(id);
    Ok(())
}

fn bind_on_connect(core: &mut AvctCore, device: DeviceId, _data: EventData) -> AvctResult<()> {
    let Some(peer) = core.devices.get(device).map(|block| block.peer()) else {
        return Ok(());
    };
    let role = core
        .devices
        .channel(device, KIND)
        .map_or(Role::Initiator, |channel| channel.role());

    let mut bound = 0;
    for id in core.connections.pending_for(&peer) {
        let Some(pid) = core.connections.get(id).map(|conn| conn.pid()) else {
            continue;
        };
        if core.connections.find_by_profile_on_device(device, pid).is_some() {
            if let Some(conn) = core.connections.get(id) {
                conn.notify(ChannelEventKind::ConnectConfirm, ResultCode::PidInUse, 0);
            }
            core.retire_connection(id);
            continue;
        }
        bind_connection(core, device, id, ChannelEventKind::ConnectConfirm);
        bound += 1;
    }

    if role == Role::Acceptor {
        for id in core.connections.waiting_acceptors() {
            let Some(pid) = core.connections.get(id).map(|conn| conn.pid()) else {
                continue;
            };
            if core.connections.find_by_profile_on_device(device, pid).is_some() {
                continue;
            }
            bind_connection(core, device, id, ChannelEventKind::ConnectIndication);
            bound += 1;
        }
    }

    if bound == 0 {
        info!("No connection wants the control channel to {}, closing it", peer);
        return core.dispatch(device, KIND, Event::Disconnect, EventData::None);
    }
    Ok(())
}

fn bind_existing(core: &mut AvctCore, device: DeviceId, data: EventData) -> AvctResult<()> {
    let id = connection_of(&data)?;
    let pid = core.connections.find_by_id(id)?.pid();
    if core.connections.find_by_profile_on_device(device, pid).is_some() {
        core.retire_connection(id);
        return Err(AvctError::PidInUse(pid));
    }
    bind_connection(core, device, id, ChannelEventKind::ConnectConfirm);
    Ok(())
}

fn bind_fail_notify(core: &mut AvctCore, _device: DeviceId, data: EventData) -> AvctResult<()> {
    let id = connection_of(&data)?;
    if let Some(conn) = core.connections.get(id) {
        conn.notify(ChannelEventKind::ConnectConfirm, ResultCode::Failed, 0);
    }
    core.retire_connection(id);
    Ok(())
}

/// Unbind one connection; the last one out closes the channels
fn check_last_unbind(core: &mut AvctCore, device: DeviceId, data: EventData) -> AvctResult<()> {
    let id = connection_of(&data)?;
    let conn = core.connections.find_by_id(id)?;
    if conn.device() != Some(device) {
        return Err(AvctError::BadConnection(id));
    }

    let remaining = core.devices.get(device).map_or(0, |block| block.bound_count());
    if remaining > 1 {
        unbind_connection(core, device, id, ResultCode::Success, 0);
        return Ok(());
    }

    debug!("Last connection {} leaving, closing channels", id);
    if core.devices.channel(device, ChannelKind::Browsing).is_some() {
        core.dispatch(device, ChannelKind::Browsing, Event::Disconnect, EventData::None)?;
    }
    core.dispatch(device, KIND, Event::Disconnect, EventData::None)
}

fn send_framed(core: &mut AvctCore, device: DeviceId, data: EventData) -> AvctResult<()> {
    let EventData::Outbound(message) = data else {
        return Ok(());
    };
    let pid = core.connections.find_by_id(message.connection)?.pid();
    let (lcid, mtu) = core
        .devices
        .channel(device, KIND)
        .map(|channel| (channel.lcid(), channel.peer_mtu()))
        .ok_or(AvctError::ChannelNotOpen)?;

    let packets = packet::fragment(&message.payload, mtu, message.label, message.cr, pid)?;
    for packet in packets {
        send_packet(core, lcid, packet)?;
    }
    Ok(())
}

fn deliver(core: &mut AvctCore, device: DeviceId, data: EventData) -> AvctResult<()> {
    let EventData::Inbound(packet) = data else {
        return Ok(());
    };
    let Some(channel) = core.devices.channel_mut(device, KIND) else {
        return Ok(());
    };
    trace!("AVCTP rx 0x{:04X}: {}", channel.lcid(), hex::encode(&packet));

    let complete = channel.reassembler_mut().push(&packet);
    match complete {
        Some(message) => route_message(core, device, KIND, message),
        None => Ok(()),
    }
}

fn notify_busy(core: &mut AvctCore, device: DeviceId, data: EventData) -> AvctResult<()> {
    let EventData::Busy(busy) = data else {
        return Ok(());
    };
    if let Some(channel) = core.devices.channel_mut(device, KIND) {
        if busy {
            channel.set_link_state(LinkState::Busy);
        } else {
            channel.set_link_state(LinkState::Opened);
            channel.set_fsm_state(State::Opened);
        }
    }

    let event = if busy {
        ChannelEventKind::ChannelBusy
    } else {
        ChannelEventKind::ChannelUnbusy
    };
    for id in core.connections.bound_to(device) {
        if let Some(conn) = core.connections.get(id) {
            conn.notify(event, ResultCode::Success, 0);
        }
    }
    Ok(())
}

fn notify_connect_fail(core: &mut AvctCore, device: DeviceId, data: EventData) -> AvctResult<()> {
    let (result, detail) = result_of(&data);
    core.teardown_browsing(device);
    fail_pending(core, device, result, detail);
    unbind_all(core, device, ChannelEventKind::DisconnectIndication, result, detail);
    core.release_channel(device, KIND);
    Ok(())
}

fn notify_disconnect_ind(core: &mut AvctCore, device: DeviceId, data: EventData) -> AvctResult<()> {
    let (result, detail) = result_of(&data);
    core.teardown_browsing(device);
    unbind_all(core, device, ChannelEventKind::DisconnectIndication, result, detail);
    fail_pending(core, device, result, detail);
    core.release_channel(device, KIND);
    Ok(())
}

fn notify_disconnect_cfm(core: &mut AvctCore, device: DeviceId, data: EventData) -> AvctResult<()> {
    let (result, detail) = result_of(&data);
    core.teardown_browsing(device);
    unbind_all(core, device, ChannelEventKind::DisconnectConfirm, result, detail);
    fail_pending(core, device, result, detail);
    core.release_channel(device, KIND);
    Ok(())
}
