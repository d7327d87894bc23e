//! `tensor_data/`: tensors referenced from self-tests and examples.
//!
//! Numeric tensors are raw little-endian `.bin` files; string tensors are
//! TOML lists. `index.toml` records name, dtype, shape and file.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CartonError, Result};
use crate::types::{DataType, Tensor, TensorData};

use super::TENSOR_DATA_PREFIX;

pub(crate) const TENSOR_REF_PREFIX: &str = "@tensor_data/";
const INDEX: &str = "tensor_data/index.toml";

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexToml {
    #[serde(default)]
    tensor: Vec<TensorEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TensorEntry {
    name: String,
    dtype: DataType,
    shape: Vec<u64>,
    file: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StringsToml {
    data: Vec<String>,
}

/// Collects tensors and assigns each a stable reference.
#[derive(Default)]
pub(crate) struct TensorDataWriter {
    index: IndexToml,
    files: Vec<(String, Vec<u8>)>,
}

impl TensorDataWriter {
    /// Store `tensor` and return its `@tensor_data/...` reference.
    pub(crate) fn add(&mut self, tensor: &Tensor) -> Result<String> {
        tensor.check_len()?;
        let name = format!("_tensor_{}", self.index.tensor.len());
        let (file, bytes) = match &tensor.data {
            TensorData::String(strings) => {
                let body = toml::to_string(&StringsToml {
                    data: strings.clone(),
                })?;
                (format!("{name}.toml"), body.into_bytes())
            }
            numeric => {
                let bytes = numeric.to_le_bytes().ok_or_else(|| {
                    CartonError::Internal("numeric tensor without byte encoding".into())
                })?;
                (format!("{name}.bin"), bytes)
            }
        };
        self.files.push((format!("{TENSOR_DATA_PREFIX}{file}"), bytes));
        self.index.tensor.push(TensorEntry {
            name: name.clone(),
            dtype: tensor.dtype(),
            shape: tensor.shape.clone(),
            file,
        });
        Ok(format!("{TENSOR_REF_PREFIX}{name}"))
    }

    /// Archive entries to write. Empty when no tensors were added.
    pub(crate) fn finish(mut self) -> Result<Vec<(String, Vec<u8>)>> {
        if self.index.tensor.is_empty() {
            return Ok(Vec::new());
        }
        let index = toml::to_string_pretty(&self.index)?;
        self.files.push((INDEX.to_string(), index.into_bytes()));
        Ok(self.files)
    }
}

/// Read every tensor, keyed by its `@tensor_data/...` reference.
pub(crate) fn read_tensor_data<F>(mut read: F) -> Result<HashMap<String, Tensor>>
where
    F: FnMut(&str) -> Result<Option<Vec<u8>>>,
{
    let Some(index) = read(INDEX)? else {
        return Ok(HashMap::new());
    };
    let index: IndexToml = toml::from_str(&String::from_utf8_lossy(&index))?;

    let mut out = HashMap::new();
    for entry in index.tensor {
        if entry.file.contains("..") || entry.file.starts_with('/') {
            return Err(CartonError::Validation(format!(
                "tensor '{}' points outside tensor_data: {}",
                entry.name, entry.file
            )));
        }
        let path = format!("{TENSOR_DATA_PREFIX}{}", entry.file);
        let bytes = read(&path)?.ok_or_else(|| {
            CartonError::Validation(format!("tensor '{}' is missing file {path}", entry.name))
        })?;
        let data = match entry.dtype {
            DataType::String => {
                let strings: StringsToml = toml::from_str(&String::from_utf8_lossy(&bytes))?;
                TensorData::String(strings.data)
            }
            dtype => TensorData::from_le_bytes(dtype, &bytes)?,
        };
        let tensor = Tensor::new(entry.shape, data)?;
        out.insert(format!("{TENSOR_REF_PREFIX}{}", entry.name), tensor);
    }
    Ok(out)
}
