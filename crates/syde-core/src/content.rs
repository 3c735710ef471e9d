//! Typed element values and their wire representation

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Byte order for multi-byte values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Least significant byte first (Intel)
    Little,
    /// Most significant byte first (Motorola)
    Big,
}

/// A typed scalar value held by a data pool element
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Content {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

macro_rules! to_bytes {
    ($v:expr, $order:expr) => {
        match $order {
            ByteOrder::Little => $v.to_le_bytes().to_vec(),
            ByteOrder::Big => $v.to_be_bytes().to_vec(),
        }
    };
}

macro_rules! from_bytes {
    ($variant:ident, $ty:ty, $bytes:expr, $order:expr) => {{
        let raw: [u8; std::mem::size_of::<$ty>()] =
            $bytes.try_into().map_err(|_| CoreError::InvalidContent {
                expected: std::mem::size_of::<$ty>(),
                actual: $bytes.len(),
            })?;
        Content::$variant(match $order {
            ByteOrder::Little => <$ty>::from_le_bytes(raw),
            ByteOrder::Big => <$ty>::from_be_bytes(raw),
        })
    }};
}

impl Content {
    /// Size of the serialized value in bytes (1 to 8)
    pub fn size(&self) -> usize {
        match self {
            Content::U8(_) | Content::I8(_) => 1,
            Content::U16(_) | Content::I16(_) => 2,
            Content::U32(_) | Content::I32(_) | Content::F32(_) => 4,
            Content::U64(_) | Content::I64(_) | Content::F64(_) => 8,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            Content::I8(_) | Content::I16(_) | Content::I32(_) | Content::I64(_)
        )
    }

    /// Serialize the value using the given byte order
    pub fn to_bytes(&self, order: ByteOrder) -> Vec<u8> {
        match *self {
            Content::U8(v) => vec![v],
            Content::I8(v) => v.to_le_bytes().to_vec(),
            Content::U16(v) => to_bytes!(v, order),
            Content::U32(v) => to_bytes!(v, order),
            Content::U64(v) => to_bytes!(v, order),
            Content::I16(v) => to_bytes!(v, order),
            Content::I32(v) => to_bytes!(v, order),
            Content::I64(v) => to_bytes!(v, order),
            Content::F32(v) => to_bytes!(v, order),
            Content::F64(v) => to_bytes!(v, order),
        }
    }

    /// Decode `bytes` into a value of the same type as `self`
    ///
    /// `bytes` must be exactly [`Content::size`] long.
    pub fn decode(&self, bytes: &[u8], order: ByteOrder) -> CoreResult<Content> {
        let decoded = match self {
            Content::U8(_) => from_bytes!(U8, u8, bytes, order),
            Content::I8(_) => from_bytes!(I8, i8, bytes, order),
            Content::U16(_) => from_bytes!(U16, u16, bytes, order),
            Content::U32(_) => from_bytes!(U32, u32, bytes, order),
            Content::U64(_) => from_bytes!(U64, u64, bytes, order),
            Content::I16(_) => from_bytes!(I16, i16, bytes, order),
            Content::I32(_) => from_bytes!(I32, i32, bytes, order),
            Content::I64(_) => from_bytes!(I64, i64, bytes, order),
            Content::F32(_) => from_bytes!(F32, f32, bytes, order),
            Content::F64(_) => from_bytes!(F64, f64, bytes, order),
        };
        Ok(decoded)
    }

    /// A zero value of the same type
    pub fn zeroed(&self) -> Content {
        match self {
            Content::U8(_) => Content::U8(0),
            Content::U16(_) => Content::U16(0),
            Content::U32(_) => Content::U32(0),
            Content::U64(_) => Content::U64(0),
            Content::I8(_) => Content::I8(0),
            Content::I16(_) => Content::I16(0),
            Content::I32(_) => Content::I32(0),
            Content::I64(_) => Content::I64(0),
            Content::F32(_) => Content::F32(0.0),
            Content::F64(_) => Content::F64(0.0),
        }
    }

    /// Build a value of the same type from the raw bits of a bus signal
    ///
    /// Signed types are sign-extended from `bit_length`; floats reinterpret
    /// the raw bits.
    pub fn from_raw(&self, raw: u64, bit_length: u16) -> Content {
        let bits = u32::from(bit_length.clamp(1, 64));
        let signed = {
            let shift = 64 - bits;
            ((raw << shift) as i64) >> shift
        };
        match self {
            Content::U8(_) => Content::U8(raw as u8),
            Content::U16(_) => Content::U16(raw as u16),
            Content::U32(_) => Content::U32(raw as u32),
            Content::U64(_) => Content::U64(raw),
            Content::I8(_) => Content::I8(signed as i8),
            Content::I16(_) => Content::I16(signed as i16),
            Content::I32(_) => Content::I32(signed as i32),
            Content::I64(_) => Content::I64(signed),
            Content::F32(_) => Content::F32(f32::from_bits(raw as u32)),
            Content::F64(_) => Content::F64(f64::from_bits(raw)),
        }
    }

    /// Value as a float, for display and logging
    pub fn as_f64(&self) -> f64 {
        match *self {
            Content::U8(v) => f64::from(v),
            Content::U16(v) => f64::from(v),
            Content::U32(v) => f64::from(v),
            Content::U64(v) => v as f64,
            Content::I8(v) => f64::from(v),
            Content::I16(v) => f64::from(v),
            Content::I32(v) => f64::from(v),
            Content::I64(v) => v as f64,
            Content::F32(v) => f64::from(v),
            Content::F64(v) => v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(Content::U8(0), 1)]
    #[case(Content::I16(0), 2)]
    #[case(Content::F32(0.0), 4)]
    #[case(Content::U64(0), 8)]
    fn test_size(#[case] content: Content, #[case] size: usize) {
        assert_eq!(content.size(), size);
        assert_eq!(content.to_bytes(ByteOrder::Little).len(), size);
    }

    #[test]
    fn test_to_bytes_respects_order() {
        let value = Content::U32(0x4455_6677);
        assert_eq!(value.to_bytes(ByteOrder::Little), vec![0x77, 0x66, 0x55, 0x44]);
        assert_eq!(value.to_bytes(ByteOrder::Big), vec![0x44, 0x55, 0x66, 0x77]);
    }

    #[test]
    fn test_decode_keeps_type() {
        let template = Content::I16(0);
        let decoded = template.decode(&[0xFE, 0xFF], ByteOrder::Little).unwrap();
        assert_eq!(decoded, Content::I16(-2));
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let err = Content::U16(0)
            .decode(&[0x01], ByteOrder::Big)
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidContent {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_from_raw_sign_extends() {
        assert_eq!(Content::I8(0).from_raw(0b1111, 4), Content::I8(-1));
        assert_eq!(Content::I16(0).from_raw(0x7, 4), Content::I16(7));
        assert_eq!(Content::U8(0).from_raw(0x1FF, 9), Content::U8(0xFF));
    }

    #[test]
    fn test_float_bits() {
        let raw = u64::from(1.5f32.to_bits());
        assert_eq!(Content::F32(0.0).from_raw(raw, 32), Content::F32(1.5));
    }
}
