//! Metadata validation run before anything is written.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{CartonError, Result};
use crate::types::{CartonInfo, LinkedFile, TensorSpec};

use super::carton_toml::EXAMPLE_BLOB_PREFIX;

const MAX_SHORT_DESCRIPTION: usize = 100;

fn symbol_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("symbol pattern compiles"))
}

pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn validate_specs(kind: &str, specs: &[TensorSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for spec in specs {
        if spec.name.is_empty() {
            return Err(CartonError::Validation(format!("{kind} with an empty name")));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(CartonError::Validation(format!(
                "duplicate {kind} name '{}'",
                spec.name
            )));
        }
        for symbol in spec.shape.symbols() {
            if !symbol_regex().is_match(symbol) {
                return Err(CartonError::Validation(format!(
                    "{kind} '{}' uses malformed shape symbol '{symbol}'",
                    spec.name
                )));
            }
        }
    }
    Ok(())
}

fn check_subset<'a>(
    what: &str,
    names: impl Iterator<Item = &'a String>,
    declared: Option<&Vec<TensorSpec>>,
) -> Result<()> {
    let Some(declared) = declared else {
        return Ok(());
    };
    for name in names {
        if !declared.iter().any(|s| &s.name == name) {
            return Err(CartonError::Validation(format!(
                "{what} '{name}' is not a declared tensor"
            )));
        }
    }
    Ok(())
}

/// Normalized relative path: no root, no `..`, no empty or `.` segments.
fn validate_misc_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && !name.starts_with('/')
        && !name.contains('\\')
        && name
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..");
    if !ok {
        return Err(CartonError::Validation(format!(
            "misc file name '{name}' must be a normalized relative path"
        )));
    }
    if name.starts_with(EXAMPLE_BLOB_PREFIX) {
        return Err(CartonError::Validation(format!(
            "misc file names starting with '{EXAMPLE_BLOB_PREFIX}' are reserved"
        )));
    }
    Ok(())
}

/// Check everything a writer must reject before producing an archive.
pub fn validate_info(info: &CartonInfo) -> Result<()> {
    if info.runner.runner_name.trim().is_empty() {
        return Err(CartonError::Validation("runner_name is empty".into()));
    }
    if let Some(desc) = &info.short_description {
        let len = desc.chars().count();
        if len > MAX_SHORT_DESCRIPTION {
            return Err(CartonError::Validation(format!(
                "short_description is {len} characters (max {MAX_SHORT_DESCRIPTION})"
            )));
        }
    }
    if let Some(platforms) = &info.required_platforms {
        if platforms.iter().any(|p| p.trim().is_empty()) {
            return Err(CartonError::Validation(
                "required_platforms contains an empty target".into(),
            ));
        }
    }
    if let Some(inputs) = &info.inputs {
        validate_specs("input", inputs)?;
    }
    if let Some(outputs) = &info.outputs {
        validate_specs("output", outputs)?;
    }

    let mut test_names = HashSet::new();
    for test in info.self_tests.iter().flatten() {
        if !test_names.insert(test.name.as_str()) {
            return Err(CartonError::Validation(format!(
                "duplicate self-test name '{}'",
                test.name
            )));
        }
        check_subset(
            &format!("self-test '{}' input", test.name),
            test.inputs.keys(),
            info.inputs.as_ref(),
        )?;
        if let Some(expected) = &test.expected_out {
            check_subset(
                &format!("self-test '{}' expected output", test.name),
                expected.keys(),
                info.outputs.as_ref(),
            )?;
        }
        for tensor in test.inputs.values().chain(test.expected_out.iter().flatten().map(|(_, t)| t)) {
            tensor.check_len()?;
        }
    }

    for name in info.misc_files.iter().flatten().map(|(k, _)| k) {
        validate_misc_name(name)?;
    }
    Ok(())
}

pub fn validate_linked_files(files: &[LinkedFile]) -> Result<()> {
    for file in files {
        if !is_sha256_hex(&file.sha256) {
            return Err(CartonError::Validation(format!(
                "linked file key '{}' is not a lowercase sha256 hex digest",
                file.sha256
            )));
        }
        if file.urls.is_empty() || file.urls.iter().any(|u| u.trim().is_empty()) {
            return Err(CartonError::Validation(format!(
                "linked file {} needs at least one non-empty URL",
                file.sha256
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Dimension, RunnerInfo, SelfTest, Shape, Tensor};
    use semver::VersionReq;
    use std::collections::BTreeMap;

    fn base() -> CartonInfo {
        CartonInfo::new(RunnerInfo::new("python", VersionReq::STAR))
    }

    fn spec(name: &str, shape: Shape) -> TensorSpec {
        TensorSpec {
            name: name.into(),
            dtype: DataType::Float32,
            shape,
            description: None,
            internal_name: None,
        }
    }

    #[test]
    fn test_duplicate_input_names_rejected() {
        let mut info = base();
        info.inputs = Some(vec![spec("x", Shape::Any), spec("x", Shape::Any)]);
        assert!(matches!(validate_info(&info), Err(CartonError::Validation(_))));
    }

    #[test]
    fn test_same_name_in_input_and_output_is_fine() {
        let mut info = base();
        info.inputs = Some(vec![spec("x", Shape::Any)]);
        info.outputs = Some(vec![spec("x", Shape::Any)]);
        assert!(validate_info(&info).is_ok());
    }

    #[test]
    fn test_malformed_symbol_rejected() {
        let mut info = base();
        info.inputs = Some(vec![spec(
            "x",
            Shape::Dims(vec![Dimension::Symbol("bad-symbol".into())]),
        )]);
        assert!(validate_info(&info).is_err());
    }

    #[test]
    fn test_self_test_inputs_must_be_declared() {
        let mut info = base();
        info.inputs = Some(vec![spec("x", Shape::Any)]);
        info.self_tests = Some(vec![SelfTest {
            name: "t".into(),
            description: None,
            inputs: BTreeMap::from([("y".to_string(), Tensor::bytes(vec![1]))]),
            expected_out: None,
        }]);
        assert!(validate_info(&info).is_err());

        info.inputs = None;
        assert!(validate_info(&info).is_ok(), "undeclared inputs are unchecked");
    }

    #[test]
    fn test_short_description_limit() {
        let mut info = base();
        info.short_description = Some("a".repeat(100));
        assert!(validate_info(&info).is_ok());
        info.short_description = Some("a".repeat(101));
        assert!(validate_info(&info).is_err());
    }

    #[test]
    fn test_misc_names_normalized() {
        for bad in ["", "/abs", "a/../b", "a//b", "./a", "_carton_example_0"] {
            let mut info = base();
            info.misc_files = Some(BTreeMap::from([(bad.to_string(), vec![])]));
            assert!(validate_info(&info).is_err(), "{bad:?} should be rejected");
        }
        let mut info = base();
        info.misc_files = Some(BTreeMap::from([("docs/readme.md".to_string(), vec![])]));
        assert!(validate_info(&info).is_ok());
    }

    #[test]
    fn test_linked_file_keys() {
        let good = "a".repeat(64);
        assert!(validate_linked_files(&[LinkedFile {
            sha256: good.clone(),
            urls: vec!["https://x".into()]
        }])
        .is_ok());
        assert!(validate_linked_files(&[LinkedFile {
            sha256: good.to_uppercase(),
            urls: vec!["https://x".into()]
        }])
        .is_err());
        assert!(validate_linked_files(&[LinkedFile {
            sha256: good,
            urls: vec![]
        }])
        .is_err());
    }
}
