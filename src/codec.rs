//! Key and value encodings.
//!
//! The engine stores opaque bytes; a [`Codec`] turns a typed key or value
//! into those bytes and back, and declares the largest encoding it can
//! produce so slots can be sized up front.

use std::error::Error;
use std::marker::PhantomData;

pub type CodecError = Box<dyn Error + Send + Sync>;

/// Encoding of one key or value type.
pub trait Codec<T>: Send + Sync {
    /// Largest encoded size, or `None` if unbounded (the map configuration
    /// must then supply one).
    fn max_size(&self) -> Option<u32>;

    /// Size of every encoding, for fixed-layout types.
    fn fixed_size(&self) -> Option<u32> {
        None
    }

    /// Byte offset of a named numeric field inside the encoding.
    fn field_offset(&self, _name: &str) -> Option<usize> {
        None
    }

    /// Append the encoding of `value` to `out`.
    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<(), CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;

    /// Decode into existing storage, reusing its allocation where possible.
    fn decode_into(&self, bytes: &[u8], target: &mut T) -> Result<(), CodecError> {
        *target = self.decode(bytes)?;
        Ok(())
    }
}

/// UTF-8 strings up to `max_len` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrCodec {
    pub max_len: u32,
}

impl StrCodec {
    pub fn new(max_len: u32) -> Self {
        StrCodec { max_len }
    }
}

impl Codec<String> for StrCodec {
    fn max_size(&self) -> Option<u32> {
        Some(self.max_len)
    }

    fn encode(&self, value: &String, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, CodecError> {
        Ok(std::str::from_utf8(bytes)?.to_owned())
    }

    fn decode_into(&self, bytes: &[u8], target: &mut String) -> Result<(), CodecError> {
        let s = std::str::from_utf8(bytes)?;
        target.clear();
        target.push_str(s);
        Ok(())
    }
}

/// Raw byte strings up to `max_len` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BytesCodec {
    pub max_len: u32,
}

impl BytesCodec {
    pub fn new(max_len: u32) -> Self {
        BytesCodec { max_len }
    }
}

impl Codec<Vec<u8>> for BytesCodec {
    fn max_size(&self) -> Option<u32> {
        Some(self.max_len)
    }

    fn encode(&self, value: &Vec<u8>, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.extend_from_slice(value);
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }

    fn decode_into(&self, bytes: &[u8], target: &mut Vec<u8>) -> Result<(), CodecError> {
        target.clear();
        target.extend_from_slice(bytes);
        Ok(())
    }
}

/// Plain-old-data types stored as their in-memory bytes.
///
/// Implementors may name fields for the atomic value view; primitives
/// expose themselves as `"value"`.
pub trait FixedLayout: bytemuck::Pod + Send + Sync {
    fn field_offset(_name: &str) -> Option<usize> {
        None
    }
}

macro_rules! impl_fixed_layout_primitive {
    ($($t:ty),*) => {
        $(
            impl FixedLayout for $t {
                fn field_offset(name: &str) -> Option<usize> {
                    (name == "value").then_some(0)
                }
            }
        )*
    };
}

impl_fixed_layout_primitive!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// Codec for [`FixedLayout`] types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Native<T>(PhantomData<fn() -> T>);

impl<T> Native<T> {
    pub fn new() -> Self {
        Native(PhantomData)
    }
}

impl<T> Default for Native<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: FixedLayout> Codec<T> for Native<T> {
    fn max_size(&self) -> Option<u32> {
        Some(std::mem::size_of::<T>() as u32)
    }

    fn fixed_size(&self) -> Option<u32> {
        Some(std::mem::size_of::<T>() as u32)
    }

    fn field_offset(&self, name: &str) -> Option<usize> {
        T::field_offset(name)
    }

    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.extend_from_slice(bytemuck::bytes_of(value));
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        if bytes.len() != std::mem::size_of::<T>() {
            return Err(format!(
                "expected {} bytes, found {}",
                std::mem::size_of::<T>(),
                bytes.len()
            )
            .into());
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::{Pod, Zeroable};

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    struct Pair {
        left: u64,
        right: u32,
        _pad: u32,
    }

    impl FixedLayout for Pair {
        fn field_offset(name: &str) -> Option<usize> {
            match name {
                "left" => Some(std::mem::offset_of!(Pair, left)),
                "right" => Some(std::mem::offset_of!(Pair, right)),
                _ => None,
            }
        }
    }

    #[test]
    fn str_decode_into_reuses_buffer() {
        let codec = StrCodec::new(32);
        let mut out = Vec::new();
        codec.encode(&"héllo".to_string(), &mut out).unwrap();

        let mut target = String::with_capacity(64);
        target.push_str("previous contents");
        let cap = target.capacity();
        codec.decode_into(&out, &mut target).unwrap();
        assert_eq!(target, "héllo");
        assert_eq!(target.capacity(), cap);
    }

    #[test]
    fn str_rejects_invalid_utf8() {
        assert!(StrCodec::new(8).decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn native_fields_and_size() {
        let codec = Native::<Pair>::new();
        assert_eq!(codec.fixed_size(), Some(16));
        assert_eq!(codec.field_offset("left"), Some(0));
        assert_eq!(codec.field_offset("right"), Some(8));
        assert_eq!(codec.field_offset("missing"), None);

        let pair = Pair { left: 7, right: 9, _pad: 0 };
        let mut out = Vec::new();
        codec.encode(&pair, &mut out).unwrap();
        assert_eq!(codec.decode(&out).unwrap(), pair);
        assert!(codec.decode(&out[..8]).is_err());
    }

    #[test]
    fn primitives_expose_value_field() {
        assert_eq!(Native::<u64>::new().field_offset("value"), Some(0));
        assert_eq!(Native::<i32>::new().field_offset("count"), None);
    }
}
