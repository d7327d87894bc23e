//! `carton.toml`, the metadata entry.

use std::collections::{BTreeMap, HashMap};

use semver::VersionReq;
use serde::{Deserialize, Serialize};

use crate::error::{CartonError, Result};
use crate::types::{
    CartonInfo, Example, ExampleValue, RunnerInfo, RunnerOpt, SelfTest, Tensor, TensorSpec,
};

use super::tensor_data::{TensorDataWriter, TENSOR_REF_PREFIX};
use super::{MISC_PREFIX, SPEC_VERSION};

pub(crate) const MISC_REF_PREFIX: &str = "@misc/";
/// Misc names generated for example blobs. Reserved.
pub(crate) const EXAMPLE_BLOB_PREFIX: &str = "_carton_example_";

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CartonToml {
    pub spec_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_platforms: Option<Vec<String>>,
    pub runner: RunnerToml,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Vec<TensorSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<TensorSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_test: Option<Vec<SelfTestToml>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<Vec<ExampleToml>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RunnerToml {
    pub runner_name: String,
    pub required_framework_version: VersionReq,
    pub runner_compat_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<BTreeMap<String, OptToml>>,
}

/// TOML form of a runner option: the value's own type picks the variant.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum OptToml {
    Integer(i64),
    Double(f64),
    Boolean(bool),
    String(String),
}

impl From<&RunnerOpt> for OptToml {
    fn from(value: &RunnerOpt) -> Self {
        match value {
            RunnerOpt::Integer(v) => OptToml::Integer(*v),
            RunnerOpt::Double(v) => OptToml::Double(*v),
            RunnerOpt::String(v) => OptToml::String(v.clone()),
            RunnerOpt::Boolean(v) => OptToml::Boolean(*v),
        }
    }
}

impl From<OptToml> for RunnerOpt {
    fn from(value: OptToml) -> Self {
        match value {
            OptToml::Integer(v) => RunnerOpt::Integer(v),
            OptToml::Double(v) => RunnerOpt::Double(v),
            OptToml::String(v) => RunnerOpt::String(v),
            OptToml::Boolean(v) => RunnerOpt::Boolean(v),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SelfTestToml {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub inputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_out: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ExampleToml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub inputs: BTreeMap<String, String>,
    pub sample_out: BTreeMap<String, String>,
}

/// Serialized metadata plus the tensor and blob entries it references.
pub(crate) struct EncodedInfo {
    pub carton_toml: String,
    pub extra_files: Vec<(String, Vec<u8>)>,
}

fn encode_tensors(
    map: &BTreeMap<String, Tensor>,
    writer: &mut TensorDataWriter,
) -> Result<BTreeMap<String, String>> {
    map.iter()
        .map(|(k, t)| Ok((k.clone(), writer.add(t)?)))
        .collect()
}

fn encode_example_values(
    map: &BTreeMap<String, ExampleValue>,
    writer: &mut TensorDataWriter,
    blobs: &mut Vec<(String, Vec<u8>)>,
    blob_tag: &str,
) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (idx, (key, value)) in map.iter().enumerate() {
        let reference = match value {
            ExampleValue::Tensor(t) => writer.add(t)?,
            ExampleValue::Bytes(bytes) => {
                let name = format!("{EXAMPLE_BLOB_PREFIX}{blob_tag}_{idx}");
                blobs.push((format!("{MISC_PREFIX}{name}"), bytes.clone()));
                format!("{MISC_REF_PREFIX}{name}")
            }
        };
        out.insert(key.clone(), reference);
    }
    Ok(out)
}

/// Serialize `info`, recording `runner_compat_version` as resolved at pack time.
pub(crate) fn encode(info: &CartonInfo, runner_compat_version: u64) -> Result<EncodedInfo> {
    let mut writer = TensorDataWriter::default();
    let mut blobs = Vec::new();

    let self_test = info
        .self_tests
        .as_ref()
        .map(|tests| {
            tests
                .iter()
                .map(|t| {
                    Ok(SelfTestToml {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        inputs: encode_tensors(&t.inputs, &mut writer)?,
                        expected_out: t
                            .expected_out
                            .as_ref()
                            .map(|m| encode_tensors(m, &mut writer))
                            .transpose()?,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;

    let example = info
        .examples
        .as_ref()
        .map(|examples| {
            examples
                .iter()
                .enumerate()
                .map(|(i, e)| {
                    Ok(ExampleToml {
                        name: e.name.clone(),
                        description: e.description.clone(),
                        inputs: encode_example_values(
                            &e.inputs,
                            &mut writer,
                            &mut blobs,
                            &format!("{i}_in"),
                        )?,
                        sample_out: encode_example_values(
                            &e.sample_out,
                            &mut writer,
                            &mut blobs,
                            &format!("{i}_out"),
                        )?,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;

    let doc = CartonToml {
        spec_version: SPEC_VERSION,
        model_name: info.model_name.clone(),
        short_description: info.short_description.clone(),
        model_description: info.model_description.clone(),
        license: info.license.clone(),
        repository: info.repository.clone(),
        homepage: info.homepage.clone(),
        required_platforms: info.required_platforms.clone(),
        runner: RunnerToml {
            runner_name: info.runner.runner_name.clone(),
            required_framework_version: info.runner.required_framework_version.clone(),
            runner_compat_version,
            opts: info
                .runner
                .opts
                .as_ref()
                .map(|opts| opts.iter().map(|(k, v)| (k.clone(), v.into())).collect()),
        },
        input: info.inputs.clone(),
        output: info.outputs.clone(),
        self_test,
        example,
    };

    let mut extra_files = writer.finish()?;
    extra_files.extend(blobs);
    Ok(EncodedInfo {
        carton_toml: toml::to_string_pretty(&doc)?,
        extra_files,
    })
}

pub(crate) fn parse(text: &str) -> Result<CartonToml> {
    let doc: CartonToml = toml::from_str(text)?;
    if doc.spec_version != SPEC_VERSION {
        return Err(CartonError::Validation(format!(
            "unsupported carton spec_version {} (this build reads {SPEC_VERSION})",
            doc.spec_version
        )));
    }
    Ok(doc)
}

fn resolve_tensor(reference: &str, tensors: &HashMap<String, Tensor>) -> Result<Tensor> {
    if !reference.starts_with(TENSOR_REF_PREFIX) {
        return Err(CartonError::Validation(format!(
            "expected a {TENSOR_REF_PREFIX} reference, got '{reference}'"
        )));
    }
    tensors
        .get(reference)
        .cloned()
        .ok_or_else(|| CartonError::Validation(format!("dangling tensor reference '{reference}'")))
}

fn resolve_tensors(
    refs: BTreeMap<String, String>,
    tensors: &HashMap<String, Tensor>,
) -> Result<BTreeMap<String, Tensor>> {
    refs.into_iter()
        .map(|(k, r)| Ok((k, resolve_tensor(&r, tensors)?)))
        .collect()
}

fn resolve_example_values(
    refs: BTreeMap<String, String>,
    tensors: &HashMap<String, Tensor>,
    misc: &BTreeMap<String, Vec<u8>>,
) -> Result<BTreeMap<String, ExampleValue>> {
    refs.into_iter()
        .map(|(k, r)| {
            let value = if let Some(name) = r.strip_prefix(MISC_REF_PREFIX) {
                let bytes = misc.get(name).ok_or_else(|| {
                    CartonError::Validation(format!("dangling misc reference '{r}'"))
                })?;
                ExampleValue::Bytes(bytes.clone())
            } else {
                ExampleValue::Tensor(resolve_tensor(&r, tensors)?)
            };
            Ok((k, value))
        })
        .collect()
}

/// Rebuild [`CartonInfo`] from parsed TOML plus the referenced data.
///
/// `misc` holds every misc entry; generated example blobs are not
/// reported back in `misc_files`.
pub(crate) fn decode(
    doc: CartonToml,
    tensors: &HashMap<String, Tensor>,
    misc: &BTreeMap<String, Vec<u8>>,
) -> Result<CartonInfo> {
    let self_tests = doc
        .self_test
        .map(|tests| {
            tests
                .into_iter()
                .map(|t| {
                    Ok(SelfTest {
                        name: t.name,
                        description: t.description,
                        inputs: resolve_tensors(t.inputs, tensors)?,
                        expected_out: t
                            .expected_out
                            .map(|m| resolve_tensors(m, tensors))
                            .transpose()?,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;

    let examples = doc
        .example
        .map(|examples| {
            examples
                .into_iter()
                .map(|e| {
                    Ok(Example {
                        name: e.name,
                        description: e.description,
                        inputs: resolve_example_values(e.inputs, tensors, misc)?,
                        sample_out: resolve_example_values(e.sample_out, tensors, misc)?,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;

    let user_misc: BTreeMap<String, Vec<u8>> = misc
        .iter()
        .filter(|(k, _)| !k.starts_with(EXAMPLE_BLOB_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(CartonInfo {
        model_name: doc.model_name,
        short_description: doc.short_description,
        model_description: doc.model_description,
        license: doc.license,
        repository: doc.repository,
        homepage: doc.homepage,
        required_platforms: doc.required_platforms,
        inputs: doc.input,
        outputs: doc.output,
        self_tests,
        examples,
        runner: RunnerInfo {
            runner_name: doc.runner.runner_name,
            required_framework_version: doc.runner.required_framework_version,
            runner_compat_version: Some(doc.runner.runner_compat_version),
            opts: doc
                .runner
                .opts
                .map(|opts| opts.into_iter().map(|(k, v)| (k, v.into())).collect()),
        },
        misc_files: (!user_misc.is_empty()).then_some(user_misc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Dimension, Shape};

    const SAMPLE: &str = r#"
spec_version = 1
model_name = "resnet"
required_platforms = ["x86_64-unknown-linux-gnu"]

[runner]
runner_name = "torchscript"
required_framework_version = ">=2.0.0"
runner_compat_version = 1

[runner.opts]
threads = 4
scale = 0.5
jit = true
mode = "eval"

[[input]]
name = "image"
dtype = "float32"
shape = ["batch", 3, 224, 224]

[[output]]
name = "logits"
dtype = "float32"
shape = "*"
"#;

    #[test]
    fn test_parse_sample_document() {
        let doc = parse(SAMPLE).unwrap();
        let info = decode(doc, &HashMap::new(), &BTreeMap::new()).unwrap();
        assert_eq!(info.model_name.as_deref(), Some("resnet"));
        assert_eq!(info.runner.runner_compat_version, Some(1));
        let opts = info.runner.opts.unwrap();
        assert_eq!(opts["threads"], RunnerOpt::Integer(4));
        assert_eq!(opts["scale"], RunnerOpt::Double(0.5));
        assert_eq!(opts["jit"], RunnerOpt::Boolean(true));
        assert_eq!(opts["mode"], RunnerOpt::String("eval".into()));
        let input = &info.inputs.unwrap()[0];
        assert_eq!(input.dtype, DataType::Float32);
        assert_eq!(
            input.shape,
            Shape::Dims(vec![
                Dimension::Symbol("batch".into()),
                Dimension::Value(3),
                Dimension::Value(224),
                Dimension::Value(224),
            ])
        );
        assert_eq!(info.outputs.unwrap()[0].shape, Shape::Any);
    }

    #[test]
    fn test_rejects_other_spec_versions() {
        let text = SAMPLE.replace("spec_version = 1", "spec_version = 2");
        assert!(matches!(parse(&text), Err(CartonError::Validation(_))));
    }

    #[test]
    fn test_dangling_tensor_reference() {
        let text = format!(
            "{SAMPLE}\n[[self_test]]\nname = \"t\"\n[self_test.inputs]\nimage = \"@tensor_data/nope\"\n"
        );
        let doc = parse(&text).unwrap();
        assert!(decode(doc, &HashMap::new(), &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_encode_decode_keeps_examples_and_blobs() {
        let mut info = CartonInfo::new(RunnerInfo::new(
            "python",
            VersionReq::parse("^3.10").unwrap(),
        ));
        info.examples = Some(vec![Example {
            name: Some("clip".into()),
            description: None,
            inputs: BTreeMap::from([("audio".to_string(), ExampleValue::Bytes(b"RIFF".to_vec()))]),
            sample_out: BTreeMap::from([(
                "text".to_string(),
                ExampleValue::Tensor(Tensor::new(vec![1], vec!["hi".to_string()]).unwrap()),
            )]),
        }]);

        let encoded = encode(&info, 1).unwrap();
        let files: HashMap<String, Vec<u8>> = encoded.extra_files.into_iter().collect();
        let tensors =
            super::super::tensor_data::read_tensor_data(|p| Ok(files.get(p).cloned())).unwrap();
        let misc: BTreeMap<String, Vec<u8>> = files
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(MISC_PREFIX).map(|n| (n.to_string(), v.clone())))
            .collect();

        let decoded = decode(parse(&encoded.carton_toml).unwrap(), &tensors, &misc).unwrap();
        assert_eq!(decoded.examples, info.examples);
        assert!(decoded.misc_files.is_none());
        assert_eq!(decoded.runner.runner_compat_version, Some(1));
    }
}
