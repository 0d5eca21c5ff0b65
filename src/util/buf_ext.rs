use anyhow::bail;


macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                return Err(anyhow::anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}

/// Checked reads for the fixed-layout payload structs. Every read fails with an error instead of
///  panicking if the buffer is too short.
pub trait BufExt: bytes::Buf {
    get_try_impl!(try_read_u8, u8, get_u8);
    get_try_impl!(try_read_u16_le, u16, get_u16_le);
    get_try_impl!(try_read_u32_le, u32, get_u32_le);
    get_try_impl!(try_read_u64_le, u64, get_u64_le);
    get_try_impl!(try_read_i16_le, i16, get_i16_le);

    fn try_read_bool(&mut self) -> anyhow::Result<bool> {
        match self.try_read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => bail!("invalid bool {}", b),
        }
    }

    fn try_read_array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        if self.remaining() < N {
            bail!("buffer underflow");
        }
        let mut result = [0u8; N];
        self.copy_to_slice(&mut result);
        Ok(result)
    }

    fn try_skip(&mut self, n: usize) -> anyhow::Result<()> {
        if self.remaining() < n {
            bail!("buffer underflow");
        }
        self.advance(n);
        Ok(())
    }

    /// Read a NUL-padded string field of exactly `n` bytes
    fn try_read_fixed_str(&mut self, n: usize) -> anyhow::Result<String> {
        if self.remaining() < n {
            bail!("buffer underflow");
        }
        let mut buf = vec![0u8; n];
        self.copy_to_slice(&mut buf);

        let len = buf.iter()
            .position(|&b| b == 0)
            .unwrap_or(n);
        buf.truncate(len);
        Ok(String::from_utf8(buf)?)
    }
}

pub trait BufMutExt: bytes::BufMut {
    fn put_bool(&mut self, v: bool) {
        self.put_u8(if v { 1 } else { 0 });
    }

    /// Write `s` as a NUL-padded field of exactly `n` bytes. At least one NUL is always
    ///  written, so `s` must be shorter than `n`.
    fn put_fixed_str(&mut self, s: &str, n: usize) -> anyhow::Result<()> {
        if s.len() >= n {
            bail!("string of {} bytes does not fit a field of {} bytes", s.len(), n);
        }
        self.put_slice(s.as_bytes());
        self.put_bytes(0, n - s.len());
        Ok(())
    }
}


impl <T: bytes::Buf> BufExt for T {
}

impl <T: bytes::BufMut> BufMutExt for T {
}


#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use rstest::rstest;

    #[test]
    fn test_underflow() {
        let mut buf: &[u8] = &[1, 2, 3];
        assert!(buf.try_read_u32_le().is_err());
        assert_eq!(buf.try_read_u16_le().unwrap(), 0x0201);
        assert!(buf.try_read_u16_le().is_err());
        assert_eq!(buf.try_read_u8().unwrap(), 3);
    }

    #[rstest]
    #[case::empty("", 8)]
    #[case::short("abc", 8)]
    #[case::max("abcdefg", 8)]
    #[case::utf8("grüße", 16)]
    fn test_fixed_str(#[case] s: &str, #[case] n: usize) {
        let mut buf = Vec::new();
        buf.put_fixed_str(s, n).unwrap();
        assert_eq!(buf.len(), n);

        let mut b: &[u8] = &buf;
        assert_eq!(b.try_read_fixed_str(n).unwrap(), s);
        assert!(b.is_empty());
    }

    #[test]
    fn test_fixed_str_too_long() {
        let mut buf = Vec::new();
        assert!(buf.put_fixed_str("abcdefgh", 8).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bool() {
        let mut buf = Vec::new();
        buf.put_bool(true);
        buf.put_bool(false);
        buf.put_u8(7);

        let mut b: &[u8] = &buf;
        assert!(b.try_read_bool().unwrap());
        assert!(!b.try_read_bool().unwrap());
        assert!(b.try_read_bool().is_err());
    }

    #[test]
    fn test_array() {
        let mut b: &[u8] = &[1, 2, 3, 4, 5, 6, 7];
        let a: [u8; 6] = b.try_read_array().unwrap();
        assert_eq!(a, [1, 2, 3, 4, 5, 6]);
        assert!(b.try_read_array::<6>().is_err());
    }
}
