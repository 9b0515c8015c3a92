use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

macro_rules! checked_get_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}

/// Reads that fail with an error instead of panicking when the buffer is too short. Wire data
///  comes from an untrusted transport, so decoding must never rely on `Buf`'s panicking getters.
pub trait BufExt: Buf + Sized {
    checked_get_impl!(checked_get_u8, u8, get_u8);
    checked_get_impl!(checked_get_u16, u16, get_u16);
    checked_get_impl!(checked_get_u32, u32, get_u32);

    fn checked_get_len_varint(&mut self) -> anyhow::Result<usize> {
        let len = self.try_get_u64_varint()
            .map_err(|e| anyhow!("invalid length prefix: {:?}", e))?;
        Ok(usize::try_from(len)?)
    }

    /// a varint length followed by that many bytes
    fn checked_get_bytes(&mut self) -> anyhow::Result<Bytes> {
        let len = self.checked_get_len_varint()?;
        if self.remaining() < len {
            return Err(anyhow!("buffer underflow: length prefix {} with only {} bytes remaining", len, self.remaining()));
        }
        Ok(self.copy_to_bytes(len))
    }
}
impl <T: Buf> BufExt for T {}

pub trait BufMutExt: BufMut + Sized {
    fn put_bytes_with_len(&mut self, data: &[u8]) {
        self.put_u64_varint(data.len() as u64);
        self.put_slice(data);
    }
}
impl <T: BufMut> BufMutExt for T {}
