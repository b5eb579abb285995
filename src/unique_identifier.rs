use crate::consts::{BROADCAST_UID, UID_LENGTH};

/// A 48-bit unique identifier: 16 bits of ESTA manufacturer id followed by a
/// 32-bit device id. Comparison is lexicographic over the big-endian wire
/// form, which the derived ordering on (manufacturer, device) matches.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Uid {
    manufacturer_id: u16,
    device_id: u32,
}

/// Raised when a uid would collide with one of the broadcast encodings.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidUid;

impl core::fmt::Display for InvalidUid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "uid is a broadcast address")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for InvalidUid {}

impl Uid {
    pub const fn new(manufacturer_id: u16, device_id: u32) -> Result<Self, InvalidUid> {
        if device_id == u32::MAX {
            return Err(InvalidUid);
        }

        Ok(Uid {
            manufacturer_id,
            device_id,
        })
    }

    pub fn manufacturer_id(&self) -> u16 {
        self.manufacturer_id
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn to_bytes(&self) -> [u8; UID_LENGTH] {
        let mut buffer = [0u8; UID_LENGTH];
        buffer[..2].copy_from_slice(&self.manufacturer_id.to_be_bytes());
        buffer[2..].copy_from_slice(&self.device_id.to_be_bytes());
        buffer
    }
}

impl core::fmt::Display for Uid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:04X}:{:08X}", self.manufacturer_id, self.device_id)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Uid {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{:04X}:{:08X}", self.manufacturer_id, self.device_id);
    }
}

impl From<Uid> for u64 {
    fn from(uid: Uid) -> Self {
        ((uid.manufacturer_id as u64) << u32::BITS) | uid.device_id as u64
    }
}

impl TryFrom<u64> for Uid {
    type Error = InvalidUid;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Uid::new((value >> u32::BITS) as u16, (value & u32::MAX as u64) as u32)
    }
}

/// The destination of an RDM frame. A device id of all-ones broadcasts to a
/// manufacturer's devices; all 48 bits set broadcasts to every device.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Destination {
    Broadcast,
    VendorBroadcast(u16),
    Device(Uid),
}

impl Destination {
    pub fn from_bytes(buffer: &[u8; UID_LENGTH]) -> Self {
        let manufacturer_id = u16::from_be_bytes([buffer[0], buffer[1]]);
        let device_id = u32::from_be_bytes([buffer[2], buffer[3], buffer[4], buffer[5]]);

        if device_id == u32::MAX {
            if manufacturer_id == u16::MAX {
                Self::Broadcast
            } else {
                Self::VendorBroadcast(manufacturer_id)
            }
        } else {
            Self::Device(Uid {
                manufacturer_id,
                device_id,
            })
        }
    }

    pub fn to_bytes(&self) -> [u8; UID_LENGTH] {
        match self {
            Self::Broadcast => [0xFFu8; UID_LENGTH],
            Self::VendorBroadcast(manufacturer_id) => {
                let mut buffer = [0xFFu8; UID_LENGTH];
                buffer[..2].copy_from_slice(&manufacturer_id.to_be_bytes());
                buffer
            },
            Self::Device(uid) => uid.to_bytes(),
        }
    }

    pub fn is_unicast(&self) -> bool {
        matches!(self, Destination::Device(_))
    }

    /// Whether a responder with the given uid is addressed by this
    /// destination.
    pub fn addresses(&self, uid: Uid) -> bool {
        match self {
            Destination::Broadcast => true,
            Destination::VendorBroadcast(manufacturer_id) => {
                *manufacturer_id == uid.manufacturer_id()
            },
            Destination::Device(dest) => *dest == uid,
        }
    }
}

impl From<Destination> for u64 {
    fn from(value: Destination) -> Self {
        match value {
            Destination::Broadcast => BROADCAST_UID,
            Destination::VendorBroadcast(manufacturer_id) => {
                ((manufacturer_id as u64) << u32::BITS) | u32::MAX as u64
            },
            Destination::Device(uid) => uid.into(),
        }
    }
}
