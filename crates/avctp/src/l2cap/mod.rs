//! L2CAP adapter
//!
//! AVCTP runs on top of an L2CAP implementation supplied by the embedding
//! stack. This module defines the commands AVCTP issues to it
//! (`L2capService`) and the asynchronous notifications it reports back
//! (`L2capEvent`). Notifications are posted through the `EventSender` handed
//! over at service registration and are processed on the AVCTP task.

pub mod event;

pub use self::event::L2capEvent;

use crate::dispatcher::EventSender;
use crate::error::AvctResult;
use crate::types::{BdAddr, ChannelId};

/// Commands AVCTP issues to the L2CAP layer
pub trait L2capService: Send + Sync {
    /// Start accepting connections on `psm`, reporting events through `events`
    fn register_service(&self, psm: u16, events: EventSender) -> AvctResult<()>;

    fn deregister_service(&self, psm: u16);

    /// Open a channel to `peer`, returning the local channel id
    ///
    /// The peer's answer arrives later as `L2capEvent::ConnectRsp`.
    fn connect_req(&self, peer: &BdAddr, psm: u16) -> AvctResult<ChannelId>;

    /// Answer an incoming `L2capEvent::ConnectInd`
    fn connect_rsp(&self, lcid: ChannelId, identifier: u8, result: u16) -> AvctResult<()>;

    /// Send our configuration request advertising `mtu`
    fn config_req(&self, lcid: ChannelId, mtu: u16) -> AvctResult<()>;

    /// Answer the peer's configuration request
    fn config_rsp(&self, lcid: ChannelId, identifier: u8, result: u16) -> AvctResult<()>;

    fn disconnect_req(&self, lcid: ChannelId) -> AvctResult<()>;

    fn disconnect_rsp(&self, lcid: ChannelId, identifier: u8) -> AvctResult<()>;

    fn send_data(&self, lcid: ChannelId, data: Vec<u8>) -> AvctResult<()>;
}
