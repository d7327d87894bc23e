//! Runner CLI subcommands: runners, selftest.

use super::{truncate, ParsedArgs, EXIT_USAGE};
use crate::runner::RunnerEntry;
use crate::selftest::{SelfTestOutcome, SelfTestReport, Tolerance};
use crate::types::{Device, LoadOpts};
use crate::{config, Runtime};

/// Format and print installed runners to stdout.
pub fn print_runners(runners: &[RunnerEntry]) {
    if runners.is_empty() {
        println!("No runners installed.");
        return;
    }
    println!(
        "{:<20} {:<12} {:>6} {:<28} {:<12}",
        "NAME", "VERSION", "COMPAT", "PLATFORM", "RELEASED"
    );
    println!("{}", "-".repeat(82));
    for r in runners {
        println!(
            "{:<20} {:<12} {:>6} {:<28} {:<12}",
            truncate(&r.runner_name, 19),
            truncate(&r.framework_version.to_string(), 11),
            r.runner_compat_version,
            truncate(&r.platform, 27),
            r.runner_release_date.format("%Y-%m-%d"),
        );
    }
}

/// `carton runners`
pub async fn run_runners() -> i32 {
    let cfg = config::load();
    match Runtime::new(cfg).await {
        Ok(runtime) => {
            let mut runners = runtime.registry().runners();
            runners.sort_by(|a, b| {
                a.runner_name
                    .cmp(&b.runner_name)
                    .then(b.framework_version.cmp(&a.framework_version))
            });
            println!("Runner directory: {}", runtime.registry().runner_dir().display());
            print_runners(&runners);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

/// Print one line per self-test and a summary.
pub fn print_report(report: &SelfTestReport) {
    if report.results.is_empty() {
        println!("No self-tests declared.");
        return;
    }
    for result in &report.results {
        let (status, detail) = match &result.outcome {
            SelfTestOutcome::Passed => ("PASS", String::new()),
            SelfTestOutcome::Failed(reason) => ("FAIL", format!("  {}", reason)),
            SelfTestOutcome::Error(reason) => ("ERROR", format!("  {}", reason)),
        };
        println!(
            "{:<6} {:<30} {:>8.1} ms{}",
            status,
            truncate(&result.name, 29),
            result.elapsed.as_secs_f64() * 1000.0,
            detail
        );
    }
    println!(
        "{}/{} self-test(s) passed",
        report.passed(),
        report.results.len()
    );
}

/// `carton selftest <path> [--device D] [--rtol X] [--atol X]`
///
/// Returns 0 when every self-test passes, 1 otherwise.
pub async fn run_selftest(args: &[String]) -> i32 {
    let parsed = match ParsedArgs::parse(args, &["--device", "--rtol", "--atol"], &[]) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_USAGE;
        }
    };
    let [path] = parsed.positional.as_slice() else {
        eprintln!("Usage: carton selftest <PATH> [--device cpu|gpuN] [--rtol X] [--atol X]");
        return EXIT_USAGE;
    };
    let device = match parsed.get("--device").map(str::parse::<Device>).transpose() {
        Ok(d) => d.unwrap_or_default(),
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_USAGE;
        }
    };
    let defaults = Tolerance::default();
    let (Ok(rtol), Ok(atol)) = (
        parsed.get("--rtol").map_or(Ok(defaults.rtol), str::parse::<f64>),
        parsed.get("--atol").map_or(Ok(defaults.atol), str::parse::<f64>),
    ) else {
        eprintln!("--rtol and --atol take floating point values");
        return EXIT_USAGE;
    };

    let runtime = match Runtime::new(config::load()).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let opts = LoadOpts {
        visible_device: device,
        ..LoadOpts::default()
    };
    match runtime.self_test(path, opts, Tolerance { rtol, atol }).await {
        Ok(report) => {
            print_report(&report);
            if report.all_passed() {
                0
            } else {
                1
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}
