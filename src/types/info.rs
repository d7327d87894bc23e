//! Model metadata: tensor specs, runner requirements, tests and examples.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use semver::VersionReq;
use serde::{Deserialize, Serialize};

use super::device::Device;
use super::tensor::{DataType, Tensor};
use crate::error::{CartonError, Result};

/// One dimension of a declared shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dimension {
    Value(u64),
    Symbol(String),
    Any,
}

/// Declared shape of an input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ShapeRepr", into = "ShapeRepr")]
pub enum Shape {
    /// Any rank, any size.
    Any,
    /// The whole shape is bound to a symbol.
    Symbol(String),
    Dims(Vec<Dimension>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ShapeRepr {
    Str(String),
    Dims(Vec<DimRepr>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum DimRepr {
    Value(u64),
    Str(String),
}

impl TryFrom<ShapeRepr> for Shape {
    type Error = String;

    fn try_from(value: ShapeRepr) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            ShapeRepr::Str(s) if s == "*" => Shape::Any,
            ShapeRepr::Str(s) => Shape::Symbol(s),
            ShapeRepr::Dims(dims) => Shape::Dims(
                dims.into_iter()
                    .map(|d| match d {
                        DimRepr::Value(v) => Dimension::Value(v),
                        DimRepr::Str(s) if s == "*" => Dimension::Any,
                        DimRepr::Str(s) => Dimension::Symbol(s),
                    })
                    .collect(),
            ),
        })
    }
}

impl From<Shape> for ShapeRepr {
    fn from(value: Shape) -> Self {
        match value {
            Shape::Any => ShapeRepr::Str("*".into()),
            Shape::Symbol(s) => ShapeRepr::Str(s),
            Shape::Dims(dims) => ShapeRepr::Dims(
                dims.into_iter()
                    .map(|d| match d {
                        Dimension::Value(v) => DimRepr::Value(v),
                        Dimension::Symbol(s) => DimRepr::Str(s),
                        Dimension::Any => DimRepr::Str("*".into()),
                    })
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Any => f.write_str("*"),
            Shape::Symbol(s) => f.write_str(s),
            Shape::Dims(dims) => {
                f.write_str("[")?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    match d {
                        Dimension::Value(v) => write!(f, "{v}")?,
                        Dimension::Symbol(s) => f.write_str(s)?,
                        Dimension::Any => f.write_str("*")?,
                    }
                }
                f.write_str("]")
            }
        }
    }
}

impl Shape {
    /// Symbol names used anywhere in this shape.
    pub fn symbols(&self) -> Vec<&str> {
        match self {
            Shape::Any => vec![],
            Shape::Symbol(s) => vec![s.as_str()],
            Shape::Dims(dims) => dims
                .iter()
                .filter_map(|d| match d {
                    Dimension::Symbol(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Check `actual` against this shape.
    ///
    /// Symbolic dimensions are bound in `bindings` on first use and must
    /// agree afterwards. Whole-shape symbols bind in `shape_bindings`.
    pub fn check(
        &self,
        actual: &[u64],
        bindings: &mut HashMap<String, u64>,
        shape_bindings: &mut HashMap<String, Vec<u64>>,
    ) -> std::result::Result<(), String> {
        match self {
            Shape::Any => Ok(()),
            Shape::Symbol(name) => match shape_bindings.get(name) {
                Some(bound) if bound.as_slice() != actual => Err(format!(
                    "shape symbol '{name}' is {bound:?} elsewhere but {actual:?} here"
                )),
                Some(_) => Ok(()),
                None => {
                    shape_bindings.insert(name.clone(), actual.to_vec());
                    Ok(())
                }
            },
            Shape::Dims(dims) => {
                if dims.len() != actual.len() {
                    return Err(format!(
                        "expected rank {} ({self}) but got shape {actual:?}",
                        dims.len()
                    ));
                }
                for (dim, &size) in dims.iter().zip(actual) {
                    match dim {
                        Dimension::Any => {}
                        Dimension::Value(v) if *v == size => {}
                        Dimension::Value(v) => {
                            return Err(format!(
                                "expected {self} but got {actual:?} (dimension {v} != {size})"
                            ))
                        }
                        Dimension::Symbol(name) => match bindings.get(name) {
                            Some(&bound) if bound != size => {
                                return Err(format!(
                                    "symbol '{name}' is {bound} elsewhere but {size} here"
                                ))
                            }
                            Some(_) => {}
                            None => {
                                bindings.insert(name.clone(), size);
                            }
                        },
                    }
                }
                Ok(())
            }
        }
    }
}

/// Declared input or output of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: DataType,
    pub shape: Shape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Framework-side name, passed through to the runner untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_name: Option<String>,
}

/// An opaque runner option value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunnerOpt {
    Integer(i64),
    Double(f64),
    String(String),
    Boolean(bool),
}

impl fmt::Display for RunnerOpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerOpt::Integer(v) => write!(f, "{v}"),
            RunnerOpt::Double(v) => write!(f, "{v}"),
            RunnerOpt::String(v) => write!(f, "{v:?}"),
            RunnerOpt::Boolean(v) => write!(f, "{v}"),
        }
    }
}

pub type RunnerOpts = BTreeMap<String, RunnerOpt>;

/// Which runner a model needs and how to configure it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunnerInfo {
    pub runner_name: String,
    pub required_framework_version: VersionReq,
    /// Filled in at pack time when not supplied.
    pub runner_compat_version: Option<u64>,
    pub opts: Option<RunnerOpts>,
}

impl RunnerInfo {
    pub fn new(runner_name: impl Into<String>, required_framework_version: VersionReq) -> Self {
        Self {
            runner_name: runner_name.into(),
            required_framework_version,
            runner_compat_version: None,
            opts: None,
        }
    }

    /// Apply load-time overrides. Option overrides merge key by key.
    pub fn apply_overrides(&mut self, opts: &LoadOpts) {
        if let Some(name) = &opts.override_runner_name {
            self.runner_name = name.clone();
        }
        if let Some(req) = &opts.override_required_framework_version {
            self.required_framework_version = req.clone();
        }
        if let Some(overrides) = &opts.override_runner_opts {
            let merged = self.opts.get_or_insert_with(BTreeMap::new);
            for (k, v) in overrides {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
}

/// A value in an example: a tensor, or an opaque blob such as an audio file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ExampleValue {
    Tensor(Tensor),
    Bytes(Vec<u8>),
}

/// Documentation-only example of a model call.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Example {
    pub name: Option<String>,
    pub description: Option<String>,
    pub inputs: BTreeMap<String, ExampleValue>,
    pub sample_out: BTreeMap<String, ExampleValue>,
}

/// A call with optional expected outputs, run by the self-test runner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelfTest {
    pub name: String,
    pub description: Option<String>,
    pub inputs: BTreeMap<String, Tensor>,
    pub expected_out: Option<BTreeMap<String, Tensor>>,
}

/// Everything an archive records about a model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CartonInfo {
    pub model_name: Option<String>,
    /// At most 100 characters.
    pub short_description: Option<String>,
    pub model_description: Option<String>,
    /// Preferably an SPDX expression.
    pub license: Option<String>,
    pub repository: Option<String>,
    pub homepage: Option<String>,
    /// Target triples the model runs on. Empty or `None` means any.
    pub required_platforms: Option<Vec<String>>,
    pub inputs: Option<Vec<TensorSpec>>,
    pub outputs: Option<Vec<TensorSpec>>,
    pub self_tests: Option<Vec<SelfTest>>,
    pub examples: Option<Vec<Example>>,
    pub runner: RunnerInfo,
    /// Keyed by normalized relative path.
    #[serde(skip)]
    pub misc_files: Option<BTreeMap<String, Vec<u8>>>,
}

impl CartonInfo {
    /// Metadata with only the runner set.
    pub fn new(runner: RunnerInfo) -> Self {
        Self {
            model_name: None,
            short_description: None,
            model_description: None,
            license: None,
            repository: None,
            homepage: None,
            required_platforms: None,
            inputs: None,
            outputs: None,
            self_tests: None,
            examples: None,
            runner,
            misc_files: None,
        }
    }
}

/// A payload file stored by reference.
///
/// Content at every URL must hash to `sha256`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedFile {
    pub sha256: String,
    pub urls: Vec<String>,
}

/// Input to [`crate::pack`].
#[derive(Debug, Clone)]
pub struct PackOpts {
    pub info: CartonInfo,
    pub linked_files: Option<Vec<LinkedFile>>,
    /// Destination; a persisted temp file when `None`.
    pub output_path: Option<PathBuf>,
}

impl From<CartonInfo> for PackOpts {
    fn from(info: CartonInfo) -> Self {
        Self {
            info,
            linked_files: None,
            output_path: None,
        }
    }
}

/// Options for [`crate::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadOpts {
    pub override_runner_name: Option<String>,
    pub override_required_framework_version: Option<VersionReq>,
    /// Merged over the options declared in the archive.
    pub override_runner_opts: Option<RunnerOpts>,
    pub visible_device: Device,
}

/// Metadata plus facts about the container it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct CartonInfoWithExtras {
    pub info: CartonInfo,
    /// sha256 of `MANIFEST`; `None` for unpacked directories without one.
    pub manifest_sha256: Option<String>,
}

/// Parse a `SHA=URL` pair as accepted on the command line.
pub fn parse_link_arg(arg: &str) -> Result<(String, String)> {
    match arg.split_once('=') {
        Some((sha, url)) if !sha.is_empty() && !url.is_empty() => {
            Ok((sha.to_ascii_lowercase(), url.to_string()))
        }
        _ => Err(CartonError::Validation(format!(
            "expected SHA256=URL, got '{arg}'"
        ))),
    }
}
