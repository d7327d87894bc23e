//! `carton` command line entry point.
//!
//! ## CLI Subcommands
//!
//! - `carton info <path>` - Show archive metadata
//! - `carton pack <dir> ...` - Pack a model directory
//! - `carton shrink <path> ...` - Replace payload files with URL references
//! - `carton selftest <path>` - Load a model and run its self-tests
//! - `carton runners` - List installed runners
//! - `carton config show` - Show effective configuration

use std::process::ExitCode;

use carton::cli::{archive_cmd, config_cmd, runners_cmd};
use carton::telemetry::{init_logging, init_metrics, LogConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");
    let rest = args.get(2..).unwrap_or_default();

    if let Err(e) = init_logging(&LogConfig::from_env()) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::from(2u8);
    }
    init_metrics();

    match command {
        "info" => exit(archive_cmd::run_info(rest).await),
        "pack" => exit(archive_cmd::run_pack(rest).await),
        "shrink" => exit(archive_cmd::run_shrink(rest).await),
        "selftest" | "self-test" => exit(runners_cmd::run_selftest(rest).await),
        "runners" => exit(runners_cmd::run_runners().await),
        "config" => {
            let subcommand = rest.first().map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => {
                    config_cmd::run_show();
                    ExitCode::SUCCESS
                }
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = rest.first() {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("carton {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(code.clamp(0, 255) as u8)
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "carton - portable ML model archives v{}

USAGE:
    carton <COMMAND> [OPTIONS]

COMMANDS:
    info       Show the metadata of an archive
    pack       Pack a model directory into an archive
    shrink     Store payload files by URL instead of embedding them
    selftest   Load a model and run the self-tests stored in it
    runners    List installed runners
    config     Show configuration
    version    Show version information
    help       Show this help message

EXAMPLES:
    carton info model.carton
    carton pack ./model --runner torchscript --framework-version '=2.0.1'
    carton shrink model.carton --link <SHA256>=https://example.com/weights.bin
    carton selftest model.carton --device gpu0
    carton runners

ENVIRONMENT:
    CARTON_RUNNER_DIR     Where runners are discovered (default: ~/.carton/runners)
    CARTON_CACHE_DIR      Linked file cache (default: ~/.carton/cache)
    CARTON_CONFIG_PATH    Config file (default: ~/.carton/config.toml)
    CARTON_LOG            Log filter (default: info)
    CARTON_LOG_FORMAT     json or pretty (default: pretty)
    CARTON_LOG_FILE       Write logs to this file instead of stderr

EXIT CODES:
    0  Success
    1  Failure (including failed self-tests)
    2  Usage error
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "info" => {
            eprintln!(
                "carton info - Show archive metadata

USAGE:
    carton info <PATH> [--json]

OPTIONS:
    --json    Print the full metadata as JSON

DESCRIPTION:
    Reads carton.toml, MANIFEST, and LINKS without extracting the payload
    or starting a runner. PATH may be a packed archive, an unpacked
    directory, or an http(s) URL (downloaded into the cache first).
"
            );
        }
        "pack" => {
            eprintln!(
                "carton pack - Pack a model directory

USAGE:
    carton pack <DIR> --runner <NAME> --framework-version <REQ> [OPTIONS]

OPTIONS:
    --runner NAME              Runner that serves the model
    --framework-version REQ    Semver requirement, e.g. '=2.0.1' or '>=1.12'
    --name NAME                Model name
    --description TEXT         Short description (at most 100 characters)
    --license SPDX             License expression
    --repository URL           Source repository
    --homepage URL             Homepage
    --platform TRIPLE          Required platform (repeatable)
    --link SHA256=URL          Store files with this hash by reference (repeatable)
    --output PATH              Where to write the archive

DESCRIPTION:
    Prints the path of the written archive.
"
            );
        }
        "shrink" => {
            eprintln!(
                "carton shrink - Replace embedded files with URL references

USAGE:
    carton shrink <PATH> --link SHA256=URL [--link ...] [--output PATH]

DESCRIPTION:
    Writes a new archive in which every payload file whose hash is given
    is dropped and listed in LINKS instead. The source is not modified.
    Fails without writing anything if a selected file does not match its
    recorded hash.
"
            );
        }
        "selftest" | "self-test" => {
            eprintln!(
                "carton selftest - Run stored self-tests

USAGE:
    carton selftest <PATH> [--device cpu|gpuN] [--rtol X] [--atol X]

DESCRIPTION:
    Loads the model, runs every self-test, and compares against expected
    outputs: exact for integers and strings, |a-b| <= atol + rtol*|b| for
    floats (defaults rtol=1e-5, atol=1e-8).

EXIT CODES:
    0  All self-tests passed
    1  A self-test failed or errored, or the model could not be loaded
"
            );
        }
        "runners" => {
            eprintln!(
                "carton runners - List installed runners

USAGE:
    carton runners

DESCRIPTION:
    Scans CARTON_RUNNER_DIR for runner.toml files and lists every runner
    found, newest version first.
"
            );
        }
        "config" => {
            eprintln!(
                "carton config - Show configuration

USAGE:
    carton config show
"
            );
        }
        _ => {
            eprintln!(
                "No detailed help available for '{}'. Use 'carton help' for general usage.",
                command
            );
        }
    }
}
