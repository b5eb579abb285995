//! Parameter ids from Table A-3 of ANSI E1.20.

pub const DISC_UNIQUE_BRANCH: u16 = 0x0001;
pub const DISC_MUTE: u16 = 0x0002;
pub const DISC_UN_MUTE: u16 = 0x0003;

pub const COMMS_STATUS: u16 = 0x0015;

pub const QUEUED_MESSAGE: u16 = 0x0020;
pub const STATUS_MESSAGES: u16 = 0x0030;

pub const SUPPORTED_PARAMETERS: u16 = 0x0050;
pub const PARAMETER_DESCRIPTION: u16 = 0x0051;

pub const DEVICE_INFO: u16 = 0x0060;
pub const PRODUCT_DETAIL_ID_LIST: u16 = 0x0070;
pub const DEVICE_MODEL_DESCRIPTION: u16 = 0x0080;
pub const MANUFACTURER_LABEL: u16 = 0x0081;
pub const DEVICE_LABEL: u16 = 0x0082;
pub const FACTORY_DEFAULTS: u16 = 0x0090;
pub const SOFTWARE_VERSION_LABEL: u16 = 0x00C0;
pub const BOOT_SOFTWARE_VERSION_ID: u16 = 0x00C1;
pub const BOOT_SOFTWARE_VERSION_LABEL: u16 = 0x00C2;

pub const DMX_PERSONALITY: u16 = 0x00E0;
pub const DMX_PERSONALITY_DESCRIPTION: u16 = 0x00E1;
pub const DMX_START_ADDRESS: u16 = 0x00F0;

pub const SLOT_INFO: u16 = 0x0120;
pub const SLOT_DESCRIPTION: u16 = 0x0121;
pub const DEFAULT_SLOT_VALUE: u16 = 0x0122;

pub const SENSOR_DEFINITION: u16 = 0x0200;
pub const SENSOR_VALUE: u16 = 0x0201;
pub const RECORD_SENSORS: u16 = 0x0202;

pub const IDENTIFY_DEVICE: u16 = 0x1000;
