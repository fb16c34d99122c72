//! Error types for the avctp library
//!
//! This module defines the error type returned by synchronous operations and
//! the numeric result codes carried in channel event callbacks.

use thiserror::Error;

use crate::types::ConnectionId;

/// Errors that can occur when working with AVCTP connections
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AvctError {
    #[error("AVCTP is not registered")]
    NotRegistered,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("No free {0} available")]
    NoResources(&'static str),

    #[error("Unknown connection id {0}")]
    BadConnection(ConnectionId),

    #[error("Profile id 0x{0:04X} is already bound on this device")]
    PidInUse(u16),

    #[error("Channel is not open")]
    ChannelNotOpen,

    #[error("Channel is busy")]
    ChannelBusy,

    #[error("Message of {size} bytes does not fit the peer MTU of {mtu}")]
    MessageTooLarge { size: usize, mtu: u16 },

    #[error("L2CAP error: {0}")]
    L2cap(String),

    #[error("Request timed out")]
    Timeout,

    #[error("AVCTP task is not running")]
    Shutdown,

    #[error("Failed to start AVCTP task: {0}")]
    Spawn(String),
}

impl AvctError {
    /// Status code reported to the upper layer for this error
    pub fn result_code(&self) -> ResultCode {
        match self {
            AvctError::NotRegistered => ResultCode::Failed,
            AvctError::InvalidParameter(_) => ResultCode::BadParameter,
            AvctError::NoResources(_) => ResultCode::NoResources,
            AvctError::BadConnection(_) => ResultCode::BadConnection,
            AvctError::PidInUse(_) => ResultCode::PidInUse,
            AvctError::ChannelNotOpen => ResultCode::NotOpen,
            AvctError::ChannelBusy => ResultCode::Busy,
            AvctError::MessageTooLarge { .. } => ResultCode::BadParameter,
            AvctError::L2cap(_) => ResultCode::Failed,
            AvctError::Timeout => ResultCode::Timeout,
            AvctError::Shutdown | AvctError::Spawn(_) => ResultCode::Failed,
        }
    }
}

/// Result type for AVCTP operations
pub type AvctResult<T> = std::result::Result<T, AvctError>;

/// Result codes delivered with channel events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ResultCode {
    Success = 0x0000,
    Failed = 0x0001,
    NoResources = 0x0002,
    BadParameter = 0x0003,
    BadConnection = 0x0004,
    NotOpen = 0x0005,
    PidInUse = 0x0006,
    Busy = 0x0007,
    Timeout = 0x0008,
    SecurityFailed = 0x0009,
    PeerRejected = 0x000A,
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        *self == ResultCode::Success
    }

    pub fn value(&self) -> u16 {
        *self as u16
    }
}

impl From<ResultCode> for u16 {
    fn from(code: ResultCode) -> Self {
        code as u16
    }
}
