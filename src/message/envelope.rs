use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bytes::BufMut;
use crate::message::MessageCode;
use crate::status::BtStatus;

pub const RESULT_SIZE: usize = 8;
/// large enough for the biggest payload arm (HID device `SEND_REPORT`)
pub const PAYLOAD_SIZE: usize = 268;

/// Every packet on a connection has exactly this size, so there is no length prefix:
///
/// ```ascii
/// 0:  code     u32 LE
/// 4:  result   [u8; 8]
/// 12: payload  [u8; 268]
/// ```
pub const ENVELOPE_SIZE: usize = 4 + RESULT_SIZE + PAYLOAD_SIZE;

/// The `result` union of an envelope. Depending on the command it holds a status byte, a
///  `u32` or a `u64` value, all little endian and starting at offset 0.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct ResultWord(pub [u8; RESULT_SIZE]);

impl ResultWord {
    pub fn from_status(status: BtStatus) -> ResultWord {
        let mut result = [0u8; RESULT_SIZE];
        result[0] = status.into();
        ResultWord(result)
    }

    pub fn status(&self) -> BtStatus {
        BtStatus::from_wire(self.0[0])
    }

    pub fn from_u32(value: u32) -> ResultWord {
        ResultWord::from_u64(value as u64)
    }

    pub fn as_u32(&self) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.0[..4]);
        u32::from_le_bytes(b)
    }

    pub fn from_u64(value: u64) -> ResultWord {
        ResultWord(value.to_le_bytes())
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_le_bytes(self.0)
    }

    pub fn from_bool(value: bool) -> ResultWord {
        ResultWord::from_u64(if value { 1 } else { 0 })
    }

    pub fn as_bool(&self) -> bool {
        self.0[0] != 0
    }
}

impl Debug for ResultWord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResultWord({:#x})", self.as_u64())
    }
}

/// The single fixed-size packet type for commands, their replies and events
#[derive(Clone, Eq, PartialEq)]
pub struct Envelope {
    pub code: MessageCode,
    pub result: ResultWord,
    pub payload: [u8; PAYLOAD_SIZE],
}

impl Envelope {
    pub fn new(code: impl Into<MessageCode>) -> Envelope {
        Envelope {
            code: code.into(),
            result: ResultWord::default(),
            payload: [0u8; PAYLOAD_SIZE],
        }
    }

    /// Create an envelope whose payload starts with `payload`; the rest is zero-filled
    pub fn with_payload(code: impl Into<MessageCode>, payload: &[u8]) -> anyhow::Result<Envelope> {
        if payload.len() > PAYLOAD_SIZE {
            bail!("payload of {} bytes exceeds the envelope's {} bytes", payload.len(), PAYLOAD_SIZE);
        }
        let mut result = Envelope::new(code);
        result.payload[..payload.len()].copy_from_slice(payload);
        Ok(result)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.code.0);
        buf.put_slice(&self.result.0);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> [u8; ENVELOPE_SIZE] {
        let mut result = [0u8; ENVELOPE_SIZE];
        let mut buf: &mut [u8] = &mut result;
        self.ser(&mut buf);
        result
    }

    pub fn from_bytes(bytes: &[u8; ENVELOPE_SIZE]) -> Envelope {
        let mut code = [0u8; 4];
        code.copy_from_slice(&bytes[..4]);
        let mut result = [0u8; RESULT_SIZE];
        result.copy_from_slice(&bytes[4..4 + RESULT_SIZE]);
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&bytes[4 + RESULT_SIZE..]);

        Envelope {
            code: MessageCode(u32::from_le_bytes(code)),
            result: ResultWord(result),
            payload,
        }
    }
}

impl Debug for Envelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let used = self.payload.iter()
            .rposition(|&b| b != 0)
            .map(|n| n + 1)
            .unwrap_or(0);
        f.debug_struct("Envelope")
            .field("code", &self.code)
            .field("result", &self.result)
            .field("payload", &&self.payload[..used])
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::AdapterCommandCode;

    #[test]
    fn test_size() {
        assert_eq!(ENVELOPE_SIZE, 280);
        assert_eq!(ENVELOPE_SIZE % 4, 0);
    }

    #[test]
    fn test_layout() {
        let mut env = Envelope::with_payload(AdapterCommandCode::SetName, b"abc").unwrap();
        env.result = ResultWord::from_u32(0x01020304);

        let bytes = env.to_bytes();
        assert_eq!(&bytes[..4], &[14, 0, 0, 0]);
        assert_eq!(&bytes[4..12], &[4, 3, 2, 1, 0, 0, 0, 0]);
        assert_eq!(&bytes[12..15], b"abc");
        assert!(bytes[15..].iter().all(|&b| b == 0));

        assert_eq!(Envelope::from_bytes(&bytes), env);
    }

    #[test]
    fn test_payload_too_big() {
        assert!(Envelope::with_payload(MessageCode(9), &[1u8; PAYLOAD_SIZE]).is_ok());
        assert!(Envelope::with_payload(MessageCode(9), &[1u8; PAYLOAD_SIZE + 1]).is_err());
    }

    #[test]
    fn test_result_word() {
        assert_eq!(ResultWord::from_status(BtStatus::Busy).status(), BtStatus::Busy);
        assert_eq!(ResultWord::default().status(), BtStatus::Success);
        assert_eq!(ResultWord::from_u64(u64::MAX - 1).as_u64(), u64::MAX - 1);
        assert_eq!(ResultWord::from_u32(77).as_u64(), 77);
        assert!(ResultWord::from_bool(true).as_bool());
        assert!(!ResultWord::from_bool(false).as_bool());
    }
}
