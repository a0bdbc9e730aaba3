use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Trait for bus-width memory primitives: [`u8`], [`u16`], [`u32`] or
/// [`u64`]. All guest memory is big-endian; this trait forbids reading a
/// multi-byte value out of a guest buffer without going through an explicit
/// endianness conversion.
pub trait Primitive:
    std::fmt::Debug + std::fmt::UpperHex + Copy + Immutable + FromBytes + IntoBytes + Default
{
    /// Reads a value of this primitive from a buffer in big-endian order. If
    /// `buf` does not contain enough bytes, missing bytes are treated as zero.
    fn read_be_bytes(buf: &[u8]) -> Self;

    /// Writes this primitive to `buf` in big-endian order. If `buf` is
    /// shorter than the primitive, trailing bytes are silently dropped.
    fn write_be_bytes(self, buf: &mut [u8]);
}

macro_rules! impl_primitive {
    ($($type:ty),*) => {
        $(
            impl Primitive for $type {
                #[inline(always)]
                fn read_be_bytes(buf: &[u8]) -> Self {
                    const SELF_SIZE: usize = size_of::<$type>();

                    #[cold]
                    #[inline(never)]
                    fn read_unhappy(buf: &[u8]) -> $type {
                        let mut padded = [0u8; SELF_SIZE];
                        padded[..buf.len()].copy_from_slice(buf);
                        <$type>::from_be_bytes(padded)
                    }

                    match buf.get(..SELF_SIZE) {
                        Some(bytes) => <$type>::from_be_bytes(bytes.try_into().unwrap()),
                        None => read_unhappy(buf),
                    }
                }

                #[inline]
                fn write_be_bytes(self, buf: &mut [u8]) {
                    const SELF_SIZE: usize = size_of::<$type>();

                    #[cold]
                    #[inline(never)]
                    fn write_unhappy(bytes: [u8; SELF_SIZE], buf: &mut [u8]) {
                        buf.copy_from_slice(&bytes[..buf.len()]);
                    }

                    let bytes = self.to_be_bytes();
                    match buf.get_mut(..SELF_SIZE) {
                        Some(dst) => dst.copy_from_slice(&bytes),
                        None => write_unhappy(bytes, buf),
                    }
                }
            }
        )*
    };
}

impl_primitive!(u8, u16, u32, u64);
