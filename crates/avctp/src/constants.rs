//! AVCTP and L2CAP constants

/// Maximum number of peer devices tracked at once
pub const MAX_DEVICES: usize = 6;
/// Maximum number of logical connections allocated at once
pub const MAX_CONNECTIONS: usize = 14;

// Protocol/Service Multiplexers
pub const AVCTP_PSM: u16 = 0x0017;
pub const AVCTP_BROWSING_PSM: u16 = 0x001B;

// Header sizes
pub const SINGLE_HEADER_SIZE: usize = 3;
pub const START_HEADER_SIZE: usize = 4;
pub const CONTINUE_HEADER_SIZE: usize = 1;
pub const END_HEADER_SIZE: usize = 1;

/// Smallest peer MTU that can carry a fragmented message
pub const MIN_FRAGMENT_MTU: u16 = 5;
/// Largest fragment count a start packet can announce
pub const MAX_FRAGMENTS: usize = 255;

// Transaction labels are four bits wide
pub const MAX_LABEL: u8 = 0x0F;

// Header byte layout
pub const LABEL_SHIFT: u8 = 4;
pub const PACKET_TYPE_SHIFT: u8 = 2;
pub const PACKET_TYPE_MASK: u8 = 0x0C;
pub const CR_MASK: u8 = 0x02;
pub const IPID_MASK: u8 = 0x01;

// MTU defaults and minimums
pub const L2CAP_MIN_MTU: u16 = 48;
pub const BROWSING_MIN_MTU: u16 = 335;
pub const DEFAULT_CONTROL_MTU: u16 = 672;
pub const DEFAULT_BROWSING_MTU: u16 = 1008;

// L2CAP connection response results
pub const L2CAP_CONNECTION_SUCCESSFUL: u16 = 0x0000;
pub const L2CAP_CONNECTION_PENDING: u16 = 0x0001;
pub const L2CAP_PSM_NOT_SUPPORTED: u16 = 0x0002;
pub const L2CAP_SECURITY_BLOCK: u16 = 0x0003;
pub const L2CAP_NO_RESOURCES: u16 = 0x0004;

// L2CAP configuration response results
pub const L2CAP_CONFIG_SUCCESS: u16 = 0x0000;
pub const L2CAP_CONFIG_UNACCEPTABLE: u16 = 0x0001;

/// Abnormal disconnect reason reported when both sides opened the same channel
pub const L2CAP_STATE_COLLISION: u8 = 0x55;

// Security results
pub const SECURITY_SUCCESS: u16 = 0x0000;
