//! Runners as real child processes, found through `runner.toml`.

#![cfg(unix)]

mod common;

use std::path::PathBuf;

use carton::runner::{write_runner_toml, RunnerRegistry};
use carton::{CartonError, LoadOpts, PackOpts, Runtime};
use common::{echo_info, floats, runner_entry, test_config};

fn install_echo_runner(runner_dir: &std::path::Path, version: &str) {
    let mut entry = runner_entry("echo", version, 1);
    entry.runner_path = PathBuf::from(env!("CARGO_BIN_EXE_carton-echo-runner"));
    write_runner_toml(&runner_dir.join(format!("echo-{version}")), &[entry]).unwrap();
}

#[tokio::test]
async fn test_discovery_reads_runner_toml() {
    let dir = tempfile::tempdir().unwrap();
    install_echo_runner(dir.path(), "1.0.0");
    std::fs::create_dir_all(dir.path().join("broken")).unwrap();
    std::fs::write(dir.path().join("broken/runner.toml"), "not = [valid").unwrap();

    let registry = RunnerRegistry::discover(dir.path()).await.unwrap();
    let runners = registry.runners();
    assert_eq!(runners.len(), 1);
    assert_eq!(runners[0].runner_name, "echo");
    assert!(runners[0].runner_path.is_absolute());
}

#[tokio::test]
async fn test_echo_runner_process_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    install_echo_runner(&config.runner_dir, "1.0.0");

    let payload = dir.path().join("payload");
    std::fs::create_dir_all(&payload).unwrap();
    std::fs::write(payload.join("weights.bin"), b"w").unwrap();

    let runtime = Runtime::new(config).await.unwrap();
    let path = runtime
        .pack(&payload, PackOpts::from(echo_info("=1.0")))
        .await
        .unwrap();
    let model = runtime.load(&path, LoadOpts::default()).await.unwrap();
    assert_eq!(model.runner_identity().runner_name, "echo");

    let inputs = floats("x", vec![1.0, 2.0]);
    assert_eq!(model.infer(inputs.clone()).await.unwrap(), inputs);
    let handle = model.seal(inputs.clone()).await.unwrap();
    assert_eq!(model.infer_with_handle(handle).await.unwrap(), inputs);

    model.unload().await.unwrap();
    assert!(matches!(
        model.infer(inputs).await,
        Err(CartonError::ModelDead(_))
    ));
    std::fs::remove_file(path).unwrap();
}

#[tokio::test]
async fn test_missing_runner_executable() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let mut entry = runner_entry("echo", "1.0.0", 1);
    entry.runner_path = PathBuf::from("does-not-exist");
    write_runner_toml(&config.runner_dir, &[entry]).unwrap();

    let payload = dir.path().join("payload");
    std::fs::create_dir_all(&payload).unwrap();

    let runtime = Runtime::new(config).await.unwrap();
    let err = runtime
        .load_unpacked(&payload, PackOpts::from(echo_info("=1.0")), LoadOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CartonError::Handshake { .. }), "{err}");
}
