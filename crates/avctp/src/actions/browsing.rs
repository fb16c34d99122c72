//! Browsing channel handlers
//!
//! Connections join the browsing channel through a per-connection flag
//! rather than the device's bound count. The browsing channel carries single
//! packets only.

use log::{debug, info, trace, warn};

use super::{
    close_channel, connection_of, discard, discard_inbound, ignore, open_channel, result_of,
    route_message, send_packet, ActionFn,
};
use crate::channel::LinkState;
use crate::constants::SINGLE_HEADER_SIZE;
use crate::core::AvctCore;
use crate::device::DeviceId;
use crate::error::{AvctError, AvctResult, ResultCode};
use crate::packet::{self, PacketType};
use crate::state::{Action, Event, EventData, State};
use crate::types::{ChannelEventKind, ChannelKind, ConnectionId, Role};

const KIND: ChannelKind = ChannelKind::Browsing;

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
        Action::SendFramed => send_single,
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

fn join(core: &mut AvctCore, id: ConnectionId, event: ChannelEventKind) {
    if let Some(conn) = core.connections.get_mut(id) {
        conn.set_browsing_bound(true);
        conn.notify(event, ResultCode::Success, 0);
        info!("Connection {} joined the browsing channel", id);
    }
}

fn leave(core: &mut AvctCore, id: ConnectionId, event: ChannelEventKind, result: ResultCode, detail: u16) {
    if let Some(conn) = core.connections.get_mut(id) {
        conn.set_browsing_bound(false);
        conn.set_browsing_role(None);
        conn.notify(event, result, detail);
    }
}

/// Connections of the device currently on the browsing channel
fn members(core: &AvctCore, device: DeviceId) -> Vec<ConnectionId> {
    core.connections
        .bound_to(device)
        .into_iter()
        .filter(|id| {
            core.connections
                .get(*id)
                .is_some_and(|conn| conn.is_browsing_bound())
        })
        .collect()
}

/// Connections that asked to open the browsing channel and are not on it yet
fn requesters(core: &AvctCore, device: DeviceId) -> Vec<ConnectionId> {
    core.connections
        .bound_to(device)
        .into_iter()
        .filter(|id| {
            core.connections.get(*id).is_some_and(|conn| {
                conn.browsing_role() == Some(Role::Initiator) && !conn.is_browsing_bound()
            })
        })
        .collect()
}

fn unbind_noop(core: &mut AvctCore, _device: DeviceId, data: EventData) -> AvctResult<()> {
    let id = connection_of(&data)?;
    leave(core, id, ChannelEventKind::BrowsingDisconnectConfirm, ResultCode::Success, 0);
    Ok(())
}

fn bind_on_connect(core: &mut AvctCore, device: DeviceId, _data: EventData) -> AvctResult<()> {
    let role = core
        .devices
        .channel(device, KIND)
        .map_or(Role::Initiator, |channel| channel.role());

    let joining = match role {
        Role::Initiator => requesters(core, device),
        Role::Acceptor => core.connections.bound_to(device),
    };
    let event = match role {
        Role::Initiator => ChannelEventKind::BrowsingConnectConfirm,
        Role::Acceptor => ChannelEventKind::BrowsingConnectIndication,
    };

    if joining.is_empty() {
        info!("No connection wants the browsing channel, closing it");
        return core.dispatch(device, KIND, Event::Disconnect, EventData::None);
    }
    for id in joining {
        join(core, id, event);
    }
    Ok(())
}

fn bind_existing(core: &mut AvctCore, _device: DeviceId, data: EventData) -> AvctResult<()> {
    let id = connection_of(&data)?;
    join(core, id, ChannelEventKind::BrowsingConnectConfirm);
    Ok(())
}

fn bind_fail_notify(core: &mut AvctCore, _device: DeviceId, data: EventData) -> AvctResult<()> {
    let id = connection_of(&data)?;
    leave(core, id, ChannelEventKind::BrowsingConnectConfirm, ResultCode::Failed, 0);
    Ok(())
}

fn check_last_unbind(core: &mut AvctCore, device: DeviceId, data: EventData) -> AvctResult<()> {
    let id = connection_of(&data)?;
    let on_channel = core
        .connections
        .find_by_id(id)?
        .is_browsing_bound();
    if !on_channel {
        return Err(AvctError::ChannelNotOpen);
    }

    if members(core, device).len() > 1 {
        leave(core, id, ChannelEventKind::BrowsingDisconnectConfirm, ResultCode::Success, 0);
        return Ok(());
    }

    debug!("Last browsing user {} leaving, closing browsing channel", id);
    core.dispatch(device, KIND, Event::Disconnect, EventData::None)
}

fn send_single(core: &mut AvctCore, device: DeviceId, data: EventData) -> AvctResult<()> {
    let EventData::Outbound(message) = data else {
        return Ok(());
    };
    let pid = core.connections.find_by_id(message.connection)?.pid();
    let (lcid, mtu) = core
        .devices
        .channel(device, KIND)
        .map(|channel| (channel.lcid(), channel.peer_mtu()))
        .ok_or(AvctError::ChannelNotOpen)?;

    if message.payload.len() + SINGLE_HEADER_SIZE > mtu as usize {
        return Err(AvctError::MessageTooLarge {
            size: message.payload.len(),
            mtu,
        });
    }
    let packet = packet::encode_single(message.label, message.cr, pid, &message.payload);
    send_packet(core, lcid, packet)
}

fn deliver(core: &mut AvctCore, device: DeviceId, data: EventData) -> AvctResult<()> {
    let EventData::Inbound(packet) = data else {
        return Ok(());
    };
    if let Some(channel) = core.devices.channel(device, KIND) {
        trace!("AVCTP browsing rx 0x{:04X}: {}", channel.lcid(), hex::encode(&packet));
    }

    let packet_type = packet.first().map(|first| PacketType::from_header(*first));
    if packet_type != Some(PacketType::Single) || packet.len() < SINGLE_HEADER_SIZE {
        warn!("Dropping non-single packet on the browsing channel");
        return Ok(());
    }
    route_message(core, device, KIND, packet)
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
        ChannelEventKind::BrowsingChannelBusy
    } else {
        ChannelEventKind::BrowsingChannelUnbusy
    };
    for id in members(core, device) {
        if let Some(conn) = core.connections.get(id) {
            conn.notify(event, ResultCode::Success, 0);
        }
    }
    Ok(())
}

fn notify_connect_fail(core: &mut AvctCore, device: DeviceId, data: EventData) -> AvctResult<()> {
    let (result, detail) = result_of(&data);
    let result = if result.is_success() {
        ResultCode::Failed
    } else {
        result
    };
    for id in requesters(core, device) {
        leave(core, id, ChannelEventKind::BrowsingConnectConfirm, result, detail);
    }
    core.release_channel(device, KIND);
    Ok(())
}

fn notify_disconnect_ind(core: &mut AvctCore, device: DeviceId, data: EventData) -> AvctResult<()> {
    let (result, detail) = result_of(&data);
    for id in members(core, device) {
        leave(core, id, ChannelEventKind::BrowsingDisconnectIndication, result, detail);
    }
    // Initiators parked behind an incoming channel that never opened
    let failed = if result.is_success() {
        ResultCode::Failed
    } else {
        result
    };
    for id in requesters(core, device) {
        leave(core, id, ChannelEventKind::BrowsingConnectConfirm, failed, detail);
    }
    core.release_channel(device, KIND);
    Ok(())
}

fn notify_disconnect_cfm(core: &mut AvctCore, device: DeviceId, data: EventData) -> AvctResult<()> {
    let (result, detail) = result_of(&data);
    for id in members(core, device) {
        leave(core, id, ChannelEventKind::BrowsingDisconnectConfirm, result, detail);
    }
    core.release_channel(device, KIND);
    Ok(())
}
