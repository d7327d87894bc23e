//! Dense tensors exchanged with runners.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CartonError, Result};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Float64,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    String,
}

impl DataType {
    pub const ALL: [DataType; 11] = [
        DataType::Float32,
        DataType::Float64,
        DataType::Int8,
        DataType::Int16,
        DataType::Int32,
        DataType::Int64,
        DataType::Uint8,
        DataType::Uint16,
        DataType::Uint32,
        DataType::Uint64,
        DataType::String,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Uint8 => "uint8",
            DataType::Uint16 => "uint16",
            DataType::Uint32 => "uint32",
            DataType::Uint64 => "uint64",
            DataType::String => "string",
        }
    }

    /// Size of one element in bytes; `None` for strings.
    pub fn byte_width(&self) -> Option<usize> {
        match self {
            DataType::Int8 | DataType::Uint8 => Some(1),
            DataType::Int16 | DataType::Uint16 => Some(2),
            DataType::Float32 | DataType::Int32 | DataType::Uint32 => Some(4),
            DataType::Float64 | DataType::Int64 | DataType::Uint64 => Some(8),
            DataType::String => None,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = CartonError;

    fn from_str(s: &str) -> Result<Self> {
        DataType::ALL
            .iter()
            .copied()
            .find(|dt| dt.as_str() == s)
            .ok_or_else(|| CartonError::Validation(format!("unknown dtype '{s}'")))
    }
}

/// Typed element buffer, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Uint8(Vec<u8>),
    Uint16(Vec<u16>),
    Uint32(Vec<u32>),
    Uint64(Vec<u64>),
    String(Vec<String>),
}

macro_rules! impl_from_vec {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<Vec<$ty>> for TensorData {
                fn from(v: Vec<$ty>) -> Self {
                    TensorData::$variant(v)
                }
            }
        )*
    };
}

impl_from_vec! {
    Float32 => f32,
    Float64 => f64,
    Int8 => i8,
    Int16 => i16,
    Int32 => i32,
    Int64 => i64,
    Uint8 => u8,
    Uint16 => u16,
    Uint32 => u32,
    Uint64 => u64,
    String => String,
}

macro_rules! le_encode {
    ($v:expr) => {
        $v.iter().flat_map(|x| x.to_le_bytes()).collect()
    };
}

fn le_decode<const N: usize, T>(bytes: &[u8], f: fn([u8; N]) -> T) -> Result<Vec<T>> {
    if bytes.len() % N != 0 {
        return Err(CartonError::Validation(format!(
            "tensor buffer of {} bytes is not a multiple of element size {N}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut buf = [0u8; N];
            buf.copy_from_slice(chunk);
            f(buf)
        })
        .collect())
}

impl TensorData {
    pub fn dtype(&self) -> DataType {
        match self {
            TensorData::Float32(_) => DataType::Float32,
            TensorData::Float64(_) => DataType::Float64,
            TensorData::Int8(_) => DataType::Int8,
            TensorData::Int16(_) => DataType::Int16,
            TensorData::Int32(_) => DataType::Int32,
            TensorData::Int64(_) => DataType::Int64,
            TensorData::Uint8(_) => DataType::Uint8,
            TensorData::Uint16(_) => DataType::Uint16,
            TensorData::Uint32(_) => DataType::Uint32,
            TensorData::Uint64(_) => DataType::Uint64,
            TensorData::String(_) => DataType::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::Float32(v) => v.len(),
            TensorData::Float64(v) => v.len(),
            TensorData::Int8(v) => v.len(),
            TensorData::Int16(v) => v.len(),
            TensorData::Int32(v) => v.len(),
            TensorData::Int64(v) => v.len(),
            TensorData::Uint8(v) => v.len(),
            TensorData::Uint16(v) => v.len(),
            TensorData::Uint32(v) => v.len(),
            TensorData::Uint64(v) => v.len(),
            TensorData::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Little-endian bytes of a numeric buffer; `None` for strings.
    pub fn to_le_bytes(&self) -> Option<Vec<u8>> {
        Some(match self {
            TensorData::Float32(v) => le_encode!(v),
            TensorData::Float64(v) => le_encode!(v),
            TensorData::Int8(v) => le_encode!(v),
            TensorData::Int16(v) => le_encode!(v),
            TensorData::Int32(v) => le_encode!(v),
            TensorData::Int64(v) => le_encode!(v),
            TensorData::Uint8(v) => v.clone(),
            TensorData::Uint16(v) => le_encode!(v),
            TensorData::Uint32(v) => le_encode!(v),
            TensorData::Uint64(v) => le_encode!(v),
            TensorData::String(_) => return None,
        })
    }

    /// Decode little-endian bytes into a numeric buffer.
    pub fn from_le_bytes(dtype: DataType, bytes: &[u8]) -> Result<Self> {
        Ok(match dtype {
            DataType::Float32 => TensorData::Float32(le_decode(bytes, f32::from_le_bytes)?),
            DataType::Float64 => TensorData::Float64(le_decode(bytes, f64::from_le_bytes)?),
            DataType::Int8 => TensorData::Int8(le_decode(bytes, i8::from_le_bytes)?),
            DataType::Int16 => TensorData::Int16(le_decode(bytes, i16::from_le_bytes)?),
            DataType::Int32 => TensorData::Int32(le_decode(bytes, i32::from_le_bytes)?),
            DataType::Int64 => TensorData::Int64(le_decode(bytes, i64::from_le_bytes)?),
            DataType::Uint8 => TensorData::Uint8(bytes.to_vec()),
            DataType::Uint16 => TensorData::Uint16(le_decode(bytes, u16::from_le_bytes)?),
            DataType::Uint32 => TensorData::Uint32(le_decode(bytes, u32::from_le_bytes)?),
            DataType::Uint64 => TensorData::Uint64(le_decode(bytes, u64::from_le_bytes)?),
            DataType::String => {
                return Err(CartonError::Validation(
                    "string tensors have no binary encoding".into(),
                ))
            }
        })
    }

    /// Float elements widened to f64; `None` for non-float buffers.
    pub fn as_f64(&self) -> Option<Vec<f64>> {
        match self {
            TensorData::Float32(v) => Some(v.iter().map(|x| *x as f64).collect()),
            TensorData::Float64(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// A dense, row-major tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<u64>,
    pub data: TensorData,
}

impl Tensor {
    /// Build a tensor, checking that the buffer length matches the shape.
    pub fn new(shape: Vec<u64>, data: impl Into<TensorData>) -> Result<Self> {
        let tensor = Tensor {
            shape,
            data: data.into(),
        };
        tensor.check_len()?;
        Ok(tensor)
    }

    /// A uint8 tensor of shape `[len]` wrapping raw bytes.
    pub fn bytes(bytes: Vec<u8>) -> Self {
        Tensor {
            shape: vec![bytes.len() as u64],
            data: TensorData::Uint8(bytes),
        }
    }

    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    /// Number of elements implied by the shape. Scalars have one.
    pub fn numel(&self) -> Result<u64> {
        self.shape
            .iter()
            .try_fold(1u64, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| {
                CartonError::Validation(format!("tensor shape {:?} overflows", self.shape))
            })
    }

    pub fn check_len(&self) -> Result<()> {
        let numel = self.numel()?;
        if numel != self.data.len() as u64 {
            return Err(CartonError::Validation(format!(
                "tensor of shape {:?} needs {} elements but has {}",
                self.shape,
                numel,
                self.data.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_names_roundtrip() {
        for dt in DataType::ALL {
            assert_eq!(dt.as_str().parse::<DataType>().unwrap(), dt);
        }
        assert!("bfloat16".parse::<DataType>().is_err());
    }

    #[test]
    fn test_new_checks_element_count() {
        assert!(Tensor::new(vec![2, 3], vec![0f32; 6]).is_ok());
        assert!(Tensor::new(vec![2, 3], vec![0f32; 5]).is_err());
        let scalar = Tensor::new(vec![], vec![7i64]).unwrap();
        assert_eq!(scalar.numel().unwrap(), 1);
    }

    #[test]
    fn test_overflowing_shape_is_rejected() {
        let err = Tensor::new(vec![u64::MAX, 2], vec![0u8]).unwrap_err();
        assert!(matches!(err, CartonError::Validation(ref m) if m.contains("overflows")), "{err}");

        // A caller-built tensor takes the same path through check_len.
        let built = Tensor {
            shape: vec![1 << 32, 1 << 32],
            data: TensorData::Uint8(vec![]),
        };
        assert!(built.check_len().is_err());
        let empty = Tensor {
            shape: vec![0, u64::MAX],
            data: TensorData::Uint8(vec![]),
        };
        assert_eq!(empty.numel().unwrap(), 0);
    }

    #[test]
    fn test_le_bytes_layout() {
        let data = TensorData::Uint16(vec![1, 0x0203]);
        assert_eq!(data.to_le_bytes().unwrap(), vec![1, 0, 3, 2]);
        let back = TensorData::from_le_bytes(DataType::Uint16, &[1, 0, 3, 2]).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_le_decode_rejects_ragged_buffer() {
        assert!(TensorData::from_le_bytes(DataType::Float32, &[0, 0, 0]).is_err());
        assert!(TensorData::from_le_bytes(DataType::String, &[]).is_err());
    }

    #[test]
    fn test_bytes_tensor_shape() {
        let t = Tensor::bytes(b"RIFF".to_vec());
        assert_eq!(t.shape, vec![4]);
        assert_eq!(t.dtype(), DataType::Uint8);
    }
}
