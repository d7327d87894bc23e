//! Runner selection and loading.

mod common;

use std::sync::Arc;

use carton::runner::ModelBackend;
use carton::types::RunnerOpt;
use carton::{CartonError, DataType, Device, LoadOpts, PackOpts};
use common::{
    echo_info, floats, opts, prompt, req, runner_entry, tts_info, InProcessLauncher, TestEnv,
    TtsBackend,
};
use semver::Version;

#[tokio::test]
async fn test_tts_prompt_produces_float_audio() {
    let env = TestEnv::new(vec![runner_entry("tts", "3.10.1", 1)]);
    let dir = env.model_dir(&[("weights.bin", b"w")]);
    let path = env
        .runtime
        .pack(&dir, PackOpts::from(tts_info("=3.10")))
        .await
        .unwrap();

    let model = env.runtime.load(&path, LoadOpts::default()).await.unwrap();
    assert_eq!(model.name(), Some("tiny-tts"));
    assert_eq!(model.runner_identity().framework_version.to_string(), "3.10.1");

    let out = model.infer(prompt("hi")).await.unwrap();
    let audio = &out["audio"];
    assert_eq!(audio.dtype(), DataType::Float32);
    assert_eq!(audio.shape, vec![20]);

    model.unload().await.unwrap();
    assert!(!model.is_alive());
    std::fs::remove_file(path).unwrap();
}

#[tokio::test]
async fn test_version_mismatch() {
    let env = TestEnv::new(vec![runner_entry("tts", "3.11.0", 1)]);
    let dir = env.model_dir(&[("weights.bin", b"w")]);
    let path = env
        .runtime
        .pack(&dir, PackOpts::from(tts_info("=3.10")))
        .await
        .unwrap();

    let err = env
        .runtime
        .load(&path, LoadOpts::default())
        .await
        .unwrap_err();
    match err {
        CartonError::VersionMismatch { name, available, .. } => {
            assert_eq!(name, "tts");
            assert_eq!(available.len(), 1);
            assert!(available[0].starts_with("3.11.0"), "{available:?}");
        }
        other => panic!("expected VersionMismatch, got {other}"),
    }
    assert!(env.launcher.launches().is_empty());
    std::fs::remove_file(path).unwrap();
}

#[tokio::test]
async fn test_runner_not_found() {
    let env = TestEnv::new(vec![]);
    let dir = env.model_dir(&[("weights.bin", b"w")]);
    let err = env
        .runtime
        .load_unpacked(&dir, PackOpts::from(tts_info("=3.10")), LoadOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CartonError::RunnerNotFound { .. }), "{err}");
}

#[tokio::test]
async fn test_highest_matching_version_wins() {
    let env = TestEnv::new(vec![
        runner_entry("tts", "3.9.0", 1),
        runner_entry("tts", "3.10.0", 1),
        runner_entry("tts", "3.10.4", 1),
        runner_entry("tts", "3.11.0", 1),
    ]);
    let dir = env.model_dir(&[("weights.bin", b"w")]);
    let model = env
        .runtime
        .load_unpacked(&dir, PackOpts::from(tts_info("=3.10")), LoadOpts::default())
        .await
        .unwrap();
    assert_eq!(model.runner_identity().framework_version.to_string(), "3.10.4");
}

#[tokio::test]
async fn test_load_overrides() {
    let env = TestEnv::new(vec![
        runner_entry("tts", "3.10.0", 1),
        runner_entry("echo", "2.1.0", 1),
    ]);
    let dir = env.model_dir(&[("weights.bin", b"w")]);

    let load_opts = LoadOpts {
        override_runner_name: Some("echo".into()),
        override_required_framework_version: Some(req("^2")),
        visible_device: Device::Gpu(1),
        ..LoadOpts::default()
    };
    let mut info = echo_info("=1.0");
    info.runner.runner_compat_version = Some(9);
    let model = env
        .runtime
        .load_unpacked(&dir, PackOpts::from(tts_info("=3.10")), load_opts)
        .await
        .unwrap();
    assert_eq!(model.runner_identity().runner_name, "echo");
    assert_eq!(model.device(), Device::Gpu(1));
    assert_eq!(env.launcher.launches(), vec![("echo".to_string(), Device::Gpu(1))]);

    // The renamed runner is not held to the original compat version.
    let load_opts = LoadOpts {
        override_runner_name: Some("echo".into()),
        override_required_framework_version: Some(req("^2")),
        ..LoadOpts::default()
    };
    assert!(env
        .runtime
        .load_unpacked(&dir, PackOpts::from(info), load_opts)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_runner_load_failure_is_handshake_error() {
    let env = TestEnv::new(vec![runner_entry("echo", "1.0.0", 1)]);
    let dir = env.model_dir(&[("weights.bin", b"w")]);
    let load_opts = LoadOpts {
        override_runner_opts: Some(opts(&[("fail_load", RunnerOpt::Boolean(true))])),
        ..LoadOpts::default()
    };
    let err = env
        .runtime
        .load_unpacked(&dir, PackOpts::from(echo_info("=1.0")), load_opts)
        .await
        .unwrap_err();
    match err {
        CartonError::Handshake { runner, reason } => {
            assert_eq!(runner, "echo");
            assert!(reason.contains("fail_load"), "{reason}");
        }
        other => panic!("expected Handshake, got {other}"),
    }
}

#[tokio::test]
async fn test_runner_reporting_other_version_fails_handshake() {
    // Installed as 3.10.0 but the process answers as 3.11.0.
    let launcher = InProcessLauncher::new(|_| -> Arc<dyn ModelBackend> {
        Arc::new(TtsBackend::new(Version::new(3, 11, 0)))
    });
    let env = TestEnv::with_launcher(vec![runner_entry("tts", "3.10.0", 1)], launcher);
    let dir = env.model_dir(&[("weights.bin", b"w")]);
    let err = env
        .runtime
        .load_unpacked(&dir, PackOpts::from(tts_info("=3.10")), LoadOpts::default())
        .await
        .unwrap_err();
    match err {
        CartonError::Handshake { runner, reason } => {
            assert_eq!(runner, "tts");
            assert!(reason.contains("3.11.0"), "{reason}");
        }
        other => panic!("expected Handshake, got {other}"),
    }
}

#[tokio::test]
async fn test_unsupported_platform() {
    let env = TestEnv::new(vec![runner_entry("echo", "1.0.0", 1)]);
    let dir = env.model_dir(&[("weights.bin", b"w")]);
    let mut info = echo_info("=1.0");
    info.required_platforms = Some(vec!["riscv64gc-unknown-none-elf".into()]);
    let err = env
        .runtime
        .load_unpacked(&dir, PackOpts::from(info), LoadOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CartonError::UnsupportedPlatform { .. }), "{err}");
}

#[tokio::test]
async fn test_input_validation_rejects_before_runner() {
    let env = TestEnv::new(vec![runner_entry("tts", "3.10.0", 1)]);
    let dir = env.model_dir(&[("weights.bin", b"w")]);
    let model = env
        .runtime
        .load_unpacked(&dir, PackOpts::from(tts_info("=3.10")), LoadOpts::default())
        .await
        .unwrap();

    let wrong_dtype = floats("prompt", vec![1.0]);
    assert!(matches!(
        model.infer(wrong_dtype).await,
        Err(CartonError::Validation(_))
    ));
    let unknown = floats("text", vec![1.0]);
    assert!(matches!(
        model.infer(unknown).await,
        Err(CartonError::Validation(_))
    ));
    // Still usable afterwards.
    assert!(model.infer(prompt("ok")).await.is_ok());
}
