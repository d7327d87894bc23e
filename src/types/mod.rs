//! Core data model.

mod device;
mod info;
mod tensor;

pub use device::{Device, MAX_GPU_INDEX};
pub use info::{
    parse_link_arg, CartonInfo, CartonInfoWithExtras, Dimension, Example, ExampleValue,
    LinkedFile, LoadOpts, PackOpts, RunnerInfo, RunnerOpt, RunnerOpts, SelfTest, Shape,
    TensorSpec,
};
pub use tensor::{DataType, Tensor, TensorData};

use std::collections::BTreeMap;

/// Named tensors passed to and returned from a model.
pub type TensorMap = BTreeMap<String, Tensor>;
