use modular_bitfield::bitfield;
use modular_bitfield::prelude::B13;

/// Response status of an RDM reply.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ResponseType {
    Ack = 0x00,
    /// Acknowledged, the result will be queued and ready later.
    AckTimer = 0x01,
    /// Not acknowledged; the parameter data carries a [NackReason].
    NackReason = 0x02,
    /// Acknowledged, but the response spans multiple frames.
    AckOverflow = 0x03,
}

impl TryFrom<u8> for ResponseType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Ack),
            0x01 => Ok(Self::AckTimer),
            0x02 => Ok(Self::NackReason),
            0x03 => Ok(Self::AckOverflow),
            _ => Err(()),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum NackReason {
    UnknownPid = 0x0000,
    FormatError = 0x0001,
    HardwareFault = 0x0002,
    ProxyReject = 0x0003,
    WriteProtect = 0x0004,
    UnsupportedCommandClass = 0x0005,
    DataOutOfRange = 0x0006,
    BufferFull = 0x0007,
    PacketSizeUnsupported = 0x0008,
    SubDeviceOutOfRange = 0x0009,
    ProxyBufferFull = 0x000A,
}

impl TryFrom<u16> for NackReason {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Self::UnknownPid),
            0x0001 => Ok(Self::FormatError),
            0x0002 => Ok(Self::HardwareFault),
            0x0003 => Ok(Self::ProxyReject),
            0x0004 => Ok(Self::WriteProtect),
            0x0005 => Ok(Self::UnsupportedCommandClass),
            0x0006 => Ok(Self::DataOutOfRange),
            0x0007 => Ok(Self::BufferFull),
            0x0008 => Ok(Self::PacketSizeUnsupported),
            0x0009 => Ok(Self::SubDeviceOutOfRange),
            0x000A => Ok(Self::ProxyBufferFull),
            _ => Err(()),
        }
    }
}

/// The control field carried in DISC_MUTE / DISC_UN_MUTE replies.
///
/// Bit 0 is set when the responder manages sub-devices, bit 1 when it is a
/// managed proxy and bit 2 when a proxy answered on its behalf.
#[bitfield]
#[derive(Copy, Clone)]
pub struct MuteControlField {
    pub has_sub_devices: bool,
    pub managed_proxy: bool,
    pub proxied_device: bool,
    #[skip]
    reserved: B13,
}

impl MuteControlField {
    /// The field encoded in wire order, ready to push into a reply.
    pub fn to_wire(self) -> u16 {
        u16::from_le_bytes(self.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_type_from_wire() {
        assert_eq!(ResponseType::try_from(0x00), Ok(ResponseType::Ack));
        assert_eq!(ResponseType::try_from(0x03), Ok(ResponseType::AckOverflow));
        assert!(ResponseType::try_from(0x04).is_err());
    }

    #[test]
    fn nack_reason_round_trip() {
        for value in 0u16..=0x000A {
            let reason = NackReason::try_from(value).unwrap();
            assert_eq!(reason as u16, value);
        }
        assert!(NackReason::try_from(0x000B).is_err());
    }

    #[test]
    fn control_field_bits() {
        let field = MuteControlField::new().with_has_sub_devices(true);
        assert_eq!(field.to_wire(), 0x0001);

        let field = MuteControlField::new()
            .with_managed_proxy(true)
            .with_proxied_device(true);
        assert_eq!(field.to_wire(), 0x0006);

        assert_eq!(MuteControlField::new().to_wire(), 0x0000);
    }
}
