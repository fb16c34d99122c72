//! AVCTP - Audio/Video Control Transport Protocol channel management
//!
//! This library implements the AVCTP layer that carries AVRCP traffic
//! between two Bluetooth devices. It multiplexes many logical connections,
//! one per profile user, onto one control channel and one optional browsing
//! channel per peer device, drives each channel with a table-driven state
//! machine, and fragments and reassembles control messages across the peer's
//! L2CAP MTU.
//!
//! The L2CAP layer and the GAP security manager are supplied by the embedding
//! stack through the `L2capService` and `SecurityService` traits. All work
//! runs serially on the thread started by `Avctp::start`.

mod actions;
pub mod arena;
pub mod channel;
pub mod config;
pub mod connection;
pub mod constants;
pub mod core;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod l2cap;
pub mod packet;
pub mod security;
pub mod state;
pub mod types;

// Re-export common types for convenience
pub use config::{AvctConfig, DispatcherConfig};
pub use connection::ConnectionStatus;
pub use dispatcher::{Avctp, EventSender};
pub use error::{AvctError, AvctResult, ResultCode};
pub use l2cap::{L2capEvent, L2capService};
pub use packet::{MessageHeader, PacketType, Reassembler};
pub use security::{Direction, SecurityCallback, SecurityRequest, SecurityService, ServiceId};
pub use state::State;
pub use types::{
    BdAddr, ChannelEvent, ChannelEventKind, ChannelId, ChannelKind, CommandResponse, ConnectParams,
    ConnectionId, LocalRole, Message, Role,
};
