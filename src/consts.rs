pub const NULL_START_CODE: u8 = 0x00;
pub const SC_RDM: u8 = 0xCC;
pub const SC_SUB_MESSAGE: u8 = 0x01;

/// start code + 512 slots
pub const DMX_MAX_FRAME_SIZE: usize = 513;
pub const DMX_MAX_SLOT_COUNT: usize = 512;

pub const DMX_BAUD: u32 = 250_000;

pub const PREAMBLE_BYTE: u8 = 0xFE;
pub const PREAMBLE_LENGTH: usize = 7;
pub const SEPARATOR_BYTE: u8 = 0xAA;

pub const UID_LENGTH: usize = 6;
pub const BROADCAST_UID: u64 = 0xFFFF_FFFF_FFFF;

pub const RDM_HEADER_SIZE: usize = 24;
/// Header, 231 bytes of parameter data and the checksum.
pub const RDM_MAX_FRAME_SIZE: usize = 257;
pub const RDM_MAX_PARAMETER_DATA_LENGTH: usize = 231;
pub const RDM_CHECKSUM_LENGTH: usize = 2;
/// The smallest valid RDM frame: a bare header plus checksum.
pub const RDM_MIN_FRAME_SIZE: usize = RDM_HEADER_SIZE + RDM_CHECKSUM_LENGTH;

/// Preamble + separator + 12 encoded uid bytes + 4 encoded checksum bytes.
pub const DUB_RESPONSE_LENGTH: usize = 24;

pub const RDM_PROTOCOL_VERSION: u16 = 0x0100;

pub const SUB_DEVICE_ROOT: u16 = 0x0000;
pub const SUB_DEVICE_ALL: u16 = 0xFFFF;

pub const MAX_DMX_START_ADDRESS: u16 = 512;
/// Reported when the current personality has a footprint of 0.
pub const INVALID_DMX_START_ADDRESS: u16 = 0xFFFF;

pub const RDM_DEFAULT_STRING_SIZE: usize = 32;
pub const MAX_PRODUCT_DETAILS: usize = 6;
pub const MAX_SENSOR_COUNT: usize = 16;
pub const ALL_SENSORS: u8 = 0xFF;
pub const SENSOR_VALUE_UNSUPPORTED: i16 = 0;

/// SLOT_INFO entries that fit a single response frame.
pub const MAX_SLOT_INFO_PER_FRAME: usize = 46;
/// DEFAULT_SLOT_VALUE entries that fit a single response frame.
pub const MAX_DEFAULT_SLOT_VALUE_PER_FRAME: usize = 77;
