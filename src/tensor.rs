// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// Typed tensor values at the shared-memory boundary.
//
// A tensor blob is a 40-byte header (dtype, ndim, shape, byte strides)
// followed by raw element data. TensorView borrows straight out of the
// mapping (zero-copy); Tensor owns its bytes and is what models produce.

use crate::error::{BridgeError, Result};

pub const TENSOR_HEADER_SIZE: usize = 40;
pub const TENSOR_MAX_NDIM: usize = 4;

/// Element type tag. Values are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DType {
    F32 = 0,
    F16 = 1,
    I32 = 2,
    I16 = 3,
    I8 = 4,
    U8 = 5,
}

impl DType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::F32),
            1 => Some(Self::F16),
            2 => Some(Self::I32),
            3 => Some(Self::I16),
            4 => Some(Self::I8),
            5 => Some(Self::U8),
            _ => None,
        }
    }

    /// Element size in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F16 | Self::I16 => 2,
            Self::I8 | Self::U8 => 1,
        }
    }
}

/// Decoded tensor header. Strides are byte strides; the host always writes
/// row-major contiguous strides derived from the shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorHeader {
    pub dtype: DType,
    pub ndim: u8,
    pub shape: [u32; 4],
    pub strides: [u32; 4],
}

impl TensorHeader {
    /// Build a contiguous header for `shape`.
    pub fn contiguous(dtype: DType, shape: &[u32]) -> Result<Self> {
        if shape.is_empty() || shape.len() > TENSOR_MAX_NDIM {
            return Err(BridgeError::Decode(format!(
                "tensor rank {} out of range",
                shape.len()
            )));
        }
        let mut shape4 = [0u32; 4];
        shape4[..shape.len()].copy_from_slice(shape);

        let mut strides = [0u32; 4];
        let mut stride = dtype.size() as u32;
        for i in (0..shape.len()).rev() {
            strides[i] = stride;
            stride = stride.saturating_mul(shape4[i].max(1));
        }

        Ok(Self {
            dtype,
            ndim: shape.len() as u8,
            shape: shape4,
            strides,
        })
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TENSOR_HEADER_SIZE {
            return Err(BridgeError::Decode("tensor header truncated".into()));
        }
        let dtype = DType::from_u8(buf[0])
            .ok_or_else(|| BridgeError::Decode(format!("unknown tensor dtype {}", buf[0])))?;
        let ndim = buf[1];
        if ndim == 0 || ndim as usize > TENSOR_MAX_NDIM {
            return Err(BridgeError::Decode(format!("tensor ndim {ndim} out of range")));
        }
        let mut shape = [0u32; 4];
        let mut strides = [0u32; 4];
        for i in 0..4 {
            shape[i] = u32::from_le_bytes(buf[4 + i * 4..8 + i * 4].try_into().unwrap_or([0; 4]));
            strides[i] =
                u32::from_le_bytes(buf[20 + i * 4..24 + i * 4].try_into().unwrap_or([0; 4]));
        }
        Ok(Self {
            dtype,
            ndim,
            shape,
            strides,
        })
    }

    pub fn encode(&self) -> [u8; TENSOR_HEADER_SIZE] {
        let mut buf = [0u8; TENSOR_HEADER_SIZE];
        buf[0] = self.dtype as u8;
        buf[1] = self.ndim;
        // buf[2..4] reserved, buf[36..40] trailing pad
        for i in 0..4 {
            buf[4 + i * 4..8 + i * 4].copy_from_slice(&self.shape[i].to_le_bytes());
            buf[20 + i * 4..24 + i * 4].copy_from_slice(&self.strides[i].to_le_bytes());
        }
        buf
    }

    /// The meaningful dimensions.
    pub fn dims(&self) -> &[u32] {
        &self.shape[..self.ndim as usize]
    }

    pub fn num_elements(&self) -> usize {
        self.dims().iter().map(|&d| d as usize).product()
    }

    /// Payload bytes implied by dtype and shape.
    pub fn data_size(&self) -> usize {
        self.num_elements() * self.dtype.size()
    }
}

// ---------------------------------------------------------------------------
// Borrowed view (zero-copy read out of the mapping)
// ---------------------------------------------------------------------------

/// A tensor view sharing memory with the shared region. Must be dropped
/// before the underlying blob is freed.
pub struct TensorView<'a> {
    pub header: TensorHeader,
    pub data: &'a [u8],
}

impl<'a> TensorView<'a> {
    pub fn new(header: TensorHeader, data: &'a [u8]) -> Result<Self> {
        if data.len() < header.data_size() {
            return Err(BridgeError::SizeMismatch {
                len: header.data_size(),
                capacity: data.len(),
            });
        }
        Ok(Self { header, data })
    }

    pub fn dims(&self) -> &[u32] {
        self.header.dims()
    }

    /// Borrow the elements as f32 without copying. Only possible for F32
    /// data whose backing bytes are 4-byte aligned (blob payloads are).
    pub fn as_f32(&self) -> Option<&'a [f32]> {
        if self.header.dtype != DType::F32 {
            return None;
        }
        let n = self.header.num_elements();
        let ptr = self.data.as_ptr();
        if ptr as usize % std::mem::align_of::<f32>() != 0 {
            return None;
        }
        // Safety: length and alignment checked above; the bytes live as
        // long as 'a and any bit pattern is a valid f32.
        Some(unsafe { std::slice::from_raw_parts(ptr as *const f32, n) })
    }

    /// Copy the elements out as f32, coercing from the stored dtype.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let n = self.header.num_elements();
        let es = self.header.dtype.size();
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let b = &self.data[i * es..(i + 1) * es];
            let v = match self.header.dtype {
                DType::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                DType::F16 => f16_to_f32(u16::from_le_bytes([b[0], b[1]])),
                DType::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32,
                DType::I16 => i16::from_le_bytes([b[0], b[1]]) as f32,
                DType::I8 => b[0] as i8 as f32,
                DType::U8 => b[0] as f32,
            };
            out.push(v);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Owned tensor
// ---------------------------------------------------------------------------

/// An owned tensor, the result type of model inference.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub header: TensorHeader,
    pub data: Vec<u8>,
}

impl Tensor {
    pub fn from_f32(shape: &[u32], values: &[f32]) -> Result<Self> {
        let header = TensorHeader::contiguous(DType::F32, shape)?;
        if header.num_elements() != values.len() {
            return Err(BridgeError::SizeMismatch {
                len: values.len() * 4,
                capacity: header.data_size(),
            });
        }
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Ok(Self { header, data })
    }

    pub fn dims(&self) -> &[u32] {
        self.header.dims()
    }

    pub fn as_f32_vec(&self) -> Vec<f32> {
        self.data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}

/// IEEE 754 binary16 to binary32.
fn f16_to_f32(bits: u16) -> f32 {
    let sign = (bits >> 15) as u32;
    let exp = ((bits >> 10) & 0x1F) as u32;
    let frac = (bits & 0x3FF) as u32;
    let out = match (exp, frac) {
        (0, 0) => sign << 31,
        (0, _) => {
            // subnormal: renormalise
            let mut e = 127 - 15 + 1;
            let mut f = frac;
            while f & 0x400 == 0 {
                f <<= 1;
                e -= 1;
            }
            (sign << 31) | ((e as u32) << 23) | ((f & 0x3FF) << 13)
        }
        (0x1F, 0) => (sign << 31) | 0x7F80_0000,
        (0x1F, _) => (sign << 31) | 0x7FC0_0000,
        _ => (sign << 31) | ((exp + 127 - 15) << 23) | (frac << 13),
    };
    f32::from_bits(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn contiguous_strides_are_byte_strides() {
        let h = TensorHeader::contiguous(DType::F32, &[2, 3]).unwrap();
        assert_eq!(h.strides[0], 12);
        assert_eq!(h.strides[1], 4);
        assert_eq!(h.data_size(), 24);
    }

    #[test]
    fn header_is_forty_bytes_with_zero_tail() {
        let h = TensorHeader::contiguous(DType::I16, &[5]).unwrap();
        let enc = h.encode();
        assert_eq!(enc.len(), TENSOR_HEADER_SIZE);
        assert_eq!(&enc[36..40], &[0, 0, 0, 0]);
    }

    #[test]
    fn f16_conversion_basics() {
        assert_eq!(f16_to_f32(0x3C00), 1.0);
        assert_eq!(f16_to_f32(0xC000), -2.0);
        assert_eq!(f16_to_f32(0x0000), 0.0);
        assert!(f16_to_f32(0x7C00).is_infinite());
        assert!(f16_to_f32(0x7E00).is_nan());
    }

    #[test]
    fn view_coerces_i8() {
        let h = TensorHeader::contiguous(DType::I8, &[3]).unwrap();
        let data = [0xFFu8, 0x01, 0x80]; // -1, 1, -128
        let v = TensorView::new(h, &data).unwrap();
        assert_eq!(v.to_f32_vec(), vec![-1.0, 1.0, -128.0]);
    }

    proptest! {
        // P3: encode/decode round-trips dtype and the meaningful dims.
        #[test]
        fn header_round_trip(
            dtype_tag in 0u8..6,
            shape in proptest::collection::vec(1u32..64, 1..=4),
        ) {
            let dtype = DType::from_u8(dtype_tag).unwrap();
            let h = TensorHeader::contiguous(dtype, &shape).unwrap();
            let decoded = TensorHeader::decode(&h.encode()).unwrap();
            prop_assert_eq!(decoded, h);
        }
    }
}
