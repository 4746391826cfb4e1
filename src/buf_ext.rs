use anyhow::anyhow;

macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked reads of fixed-width values, for parsing packets that arrived from the network
pub trait BufExt: bytes::Buf {
    get_checked_impl!(get_checked_u8, u8, get_u8);
    get_checked_impl!(get_checked_u16, u16, get_u16);
    get_checked_impl!(get_checked_u32, u32, get_u32);
    get_checked_impl!(get_checked_u64, u64, get_u64);
}

impl <T: bytes::Buf> BufExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_underflow() {
        let mut buf: &[u8] = &[1, 2, 3];
        assert_eq!(buf.get_checked_u16().unwrap(), 0x0102);
        assert!(buf.get_checked_u16().is_err());
        assert_eq!(buf.get_checked_u8().unwrap(), 3);
        assert!(buf.get_checked_u8().is_err());
    }
}
