//! A runner that answers every inference with its inputs.

use std::process::ExitCode;
use std::sync::Arc;

use carton::runner::echo::EchoBackend;
use carton::runner::server::run_runner;

#[tokio::main]
async fn main() -> ExitCode {
    run_runner(Arc::new(EchoBackend::from_env())).await
}
