//! Running the self-tests declared in an archive.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::model::Model;
use crate::types::{Tensor, TensorMap};

/// Float comparison: `|a - b| <= atol + rtol * |b|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub rtol: f64,
    pub atol: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            rtol: 1e-5,
            atol: 1e-8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelfTestOutcome {
    Passed,
    /// Outputs did not match `expected_out`.
    Failed(String),
    /// The call itself failed.
    Error(String),
}

#[derive(Debug, Clone)]
pub struct SelfTestResult {
    pub name: String,
    pub outcome: SelfTestOutcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct SelfTestReport {
    pub results: Vec<SelfTestResult>,
}

impl SelfTestReport {
    pub fn passed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == SelfTestOutcome::Passed)
            .count()
    }

    pub fn all_passed(&self) -> bool {
        self.passed() == self.results.len()
    }
}

fn compare_tensor(name: &str, actual: &Tensor, expected: &Tensor, tol: Tolerance) -> Result<(), String> {
    if actual.dtype() != expected.dtype() {
        return Err(format!(
            "output '{name}' is {} but {} was expected",
            actual.dtype(),
            expected.dtype()
        ));
    }
    if actual.shape != expected.shape {
        return Err(format!(
            "output '{name}' has shape {:?} but {:?} was expected",
            actual.shape, expected.shape
        ));
    }
    match (actual.data.as_f64(), expected.data.as_f64()) {
        (Some(a), Some(b)) => {
            for (i, (x, y)) in a.iter().zip(&b).enumerate() {
                let close = if x.is_nan() || y.is_nan() {
                    x.is_nan() && y.is_nan()
                } else {
                    (x - y).abs() <= tol.atol + tol.rtol * y.abs()
                };
                if !close {
                    return Err(format!(
                        "output '{name}' differs at element {i}: {x} vs expected {y}"
                    ));
                }
            }
            Ok(())
        }
        _ => {
            if actual.data == expected.data {
                Ok(())
            } else {
                Err(format!("output '{name}' does not match exactly"))
            }
        }
    }
}

/// Compare outputs with expectations. Extra outputs are ignored; every
/// expected key must be present.
pub fn compare_outputs(actual: &TensorMap, expected: &TensorMap, tol: Tolerance) -> Result<(), String> {
    for (name, want) in expected {
        let got = actual
            .get(name)
            .ok_or_else(|| format!("missing output '{name}'"))?;
        compare_tensor(name, got, want, tol)?;
    }
    Ok(())
}

/// Run every self-test of `model`. Failures do not stop the batch.
pub async fn run_self_tests(model: &Model, tol: Tolerance) -> SelfTestReport {
    let mut report = SelfTestReport::default();
    for (i, test) in model.info().self_tests.iter().flatten().enumerate() {
        let name = if test.name.is_empty() {
            format!("self_test_{i}")
        } else {
            test.name.clone()
        };
        let start = Instant::now();
        let outcome = match model.infer(test.inputs.clone()).await {
            Ok(outputs) => match &test.expected_out {
                Some(expected) => match compare_outputs(&outputs, expected, tol) {
                    Ok(()) => SelfTestOutcome::Passed,
                    Err(reason) => SelfTestOutcome::Failed(reason),
                },
                None => SelfTestOutcome::Passed,
            },
            Err(e) => SelfTestOutcome::Error(e.to_string()),
        };
        match &outcome {
            SelfTestOutcome::Passed => info!(test = %name, "Self-test passed"),
            SelfTestOutcome::Failed(reason) => warn!(test = %name, reason = %reason, "Self-test failed"),
            SelfTestOutcome::Error(reason) => warn!(test = %name, error = %reason, "Self-test errored"),
        }
        report.results.push(SelfTestResult {
            name,
            outcome,
            elapsed: start.elapsed(),
        });
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn map(name: &str, t: Tensor) -> TensorMap {
        BTreeMap::from([(name.to_string(), t)])
    }

    #[test]
    fn test_float_within_tolerance() {
        let actual = map("y", Tensor::new(vec![2], vec![1.0f32, 2.000001]).unwrap());
        let expected = map("y", Tensor::new(vec![2], vec![1.0f32, 2.0]).unwrap());
        assert!(compare_outputs(&actual, &expected, Tolerance::default()).is_ok());
    }

    #[test]
    fn test_float_outside_tolerance() {
        let actual = map("y", Tensor::new(vec![1], vec![1.1f64]).unwrap());
        let expected = map("y", Tensor::new(vec![1], vec![1.0f64]).unwrap());
        let err = compare_outputs(&actual, &expected, Tolerance::default()).unwrap_err();
        assert!(err.contains("element 0"));
    }

    #[test]
    fn test_nan_only_matches_nan() {
        let nan = map("y", Tensor::new(vec![1], vec![f32::NAN]).unwrap());
        let one = map("y", Tensor::new(vec![1], vec![1.0f32]).unwrap());
        assert!(compare_outputs(&nan, &nan, Tolerance::default()).is_ok());
        assert!(compare_outputs(&one, &nan, Tolerance::default()).is_err());
        assert!(compare_outputs(&nan, &one, Tolerance::default()).is_err());
    }

    #[test]
    fn test_integers_and_strings_exact() {
        let a = map("y", Tensor::new(vec![2], vec![1i64, 2]).unwrap());
        let b = map("y", Tensor::new(vec![2], vec![1i64, 3]).unwrap());
        assert!(compare_outputs(&a, &b, Tolerance { rtol: 1.0, atol: 1.0 }).is_err());

        let s = map("y", Tensor::new(vec![], vec!["hi".to_string()]).unwrap());
        assert!(compare_outputs(&s, &s, Tolerance::default()).is_ok());
    }

    #[test]
    fn test_dtype_shape_and_missing_key() {
        let f = map("y", Tensor::new(vec![1], vec![1.0f32]).unwrap());
        let d = map("y", Tensor::new(vec![1], vec![1.0f64]).unwrap());
        assert!(compare_outputs(&f, &d, Tolerance::default()).is_err());

        let wide = map("y", Tensor::new(vec![1, 1], vec![1.0f32]).unwrap());
        assert!(compare_outputs(&wide, &f, Tolerance::default()).is_err());

        let other = map("z", Tensor::new(vec![1], vec![1.0f32]).unwrap());
        assert!(compare_outputs(&other, &f, Tolerance::default())
            .unwrap_err()
            .contains("missing output"));
    }
}
