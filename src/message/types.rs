use std::fmt::{Debug, Formatter};
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::util::buf_ext::BufExt;

/// Length of the fixed, NUL-padded name fields in payloads
pub const NAME_FIELD_LEN: usize = 64;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct BtAddress(pub [u8; 6]);

impl BtAddress {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<BtAddress> {
        Ok(BtAddress(buf.try_read_array()?))
    }
}

impl Debug for BtAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let a = &self.0;
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}", a[0], a[1], a[2], a[3], a[4], a[5])
    }
}

/// 128 bit UUID. 16 and 32 bit UUIDs are expanded with the Bluetooth base UUID before they go
///  on the wire.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct BtUuid(pub [u8; 16]);

impl BtUuid {
    const BASE: [u8; 16] = [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB];

    pub fn from_u16(short: u16) -> BtUuid {
        BtUuid::from_u32(short as u32)
    }

    pub fn from_u32(short: u32) -> BtUuid {
        let mut result = Self::BASE;
        result[..4].copy_from_slice(&short.to_be_bytes());
        BtUuid(result)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<BtUuid> {
        Ok(BtUuid(buf.try_read_array()?))
    }
}

impl Debug for BtUuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AdapterState {
    Off = 0,
    BleTurningOn = 1,
    BleOn = 2,
    TurningOn = 3,
    On = 4,
    TurningOff = 5,
    BleTurningOff = 6,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DiscoveryState {
    Stopped = 0,
    Started = 1,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProfileConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SppPortType {
    Tty = 0,
    RpmsgUart = 1,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum HidAppState {
    NotRegistered = 0,
    Registered = 1,
}

/// Read a single-byte enum field, rejecting values outside the enum's range
pub fn try_read_enum<T: TryFromPrimitive<Primitive = u8>>(buf: &mut impl Buf) -> anyhow::Result<T> {
    let raw = buf.try_read_u8()?;
    T::try_from_primitive(raw)
        .map_err(|_| anyhow::anyhow!("invalid {} value {}", T::NAME, raw))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_debug() {
        let addr = BtAddress([0x00, 0x1b, 0xdc, 0x0f, 0xa0, 0x09]);
        assert_eq!(format!("{:?}", addr), "00:1B:DC:0F:A0:09");
    }

    #[test]
    fn test_uuid_from_short() {
        let uuid = BtUuid::from_u16(0x1101);
        assert_eq!(format!("{:?}", uuid), "00001101-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_read_enum() {
        let mut buf: &[u8] = &[4, 9];
        assert_eq!(try_read_enum::<AdapterState>(&mut buf).unwrap(), AdapterState::On);
        assert!(try_read_enum::<AdapterState>(&mut buf).is_err());
    }
}
