//! Archive CLI subcommands: info, pack, shrink.

use std::collections::BTreeMap;
use std::path::PathBuf;

use semver::VersionReq;

use super::{ParsedArgs, EXIT_USAGE};
use crate::types::{parse_link_arg, CartonInfo, CartonInfoWithExtras, LinkedFile, PackOpts, RunnerInfo, TensorSpec};
use crate::{config, Runtime};

/// Group repeated `--link SHA=URL` arguments by hash, keeping URL order.
pub fn parse_links(args: &[String]) -> crate::Result<Vec<LinkedFile>> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for arg in args {
        let (sha, url) = parse_link_arg(arg)?;
        let urls = grouped.entry(sha).or_default();
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    Ok(grouped
        .into_iter()
        .map(|(sha256, urls)| LinkedFile { sha256, urls })
        .collect())
}

fn print_specs(title: &str, specs: Option<&[TensorSpec]>) {
    let Some(specs) = specs.filter(|s| !s.is_empty()) else {
        return;
    };
    println!("{}:", title);
    for spec in specs {
        print!("  {:<24} {:<8} {}", spec.name, spec.dtype, spec.shape);
        if let Some(desc) = &spec.description {
            print!("  {}", desc);
        }
        println!();
    }
}

/// Human-readable summary of an archive's metadata.
pub fn print_info(extras: &CartonInfoWithExtras) {
    let info = &extras.info;
    let runner = &info.runner;
    println!("Name:        {}", info.model_name.as_deref().unwrap_or("-"));
    if let Some(desc) = &info.short_description {
        println!("Description: {}", desc);
    }
    if let Some(license) = &info.license {
        println!("License:     {}", license);
    }
    if let Some(repo) = &info.repository {
        println!("Repository:  {}", repo);
    }
    if let Some(home) = &info.homepage {
        println!("Homepage:    {}", home);
    }
    println!(
        "Runner:      {} {} (compat {})",
        runner.runner_name,
        runner.required_framework_version,
        runner
            .runner_compat_version
            .map_or_else(|| "-".to_string(), |c| c.to_string())
    );
    if let Some(opts) = runner.opts.as_ref().filter(|o| !o.is_empty()) {
        for (key, value) in opts {
            println!("  opt {} = {}", key, value);
        }
    }
    if let Some(platforms) = info.required_platforms.as_ref().filter(|p| !p.is_empty()) {
        println!("Platforms:   {}", platforms.join(", "));
    }
    if let Some(sha) = &extras.manifest_sha256 {
        println!("Manifest:    {}", sha);
    }
    print_specs("Inputs", info.inputs.as_deref());
    print_specs("Outputs", info.outputs.as_deref());
    let tests = info.self_tests.as_ref().map_or(0, Vec::len);
    let examples = info.examples.as_ref().map_or(0, Vec::len);
    let misc = info.misc_files.as_ref().map_or(0, BTreeMap::len);
    println!(
        "Self-tests: {}  |  Examples: {}  |  Misc files: {}",
        tests, examples, misc
    );
}

/// `carton info <path> [--json]`
pub async fn run_info(args: &[String]) -> i32 {
    let parsed = match ParsedArgs::parse(args, &[], &["--json"]) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_USAGE;
        }
    };
    let [path] = parsed.positional.as_slice() else {
        eprintln!("Usage: carton info <PATH> [--json]");
        return EXIT_USAGE;
    };

    let runtime = match Runtime::new(config::load()).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    match runtime.get_model_info(path).await {
        Ok(extras) => {
            if parsed.has("--json") {
                match serde_json::to_string_pretty(&extras.info) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        return 1;
                    }
                }
            } else {
                print_info(&extras);
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

/// `carton pack <dir> --runner N --framework-version R [...]`
pub async fn run_pack(args: &[String]) -> i32 {
    let parsed = match ParsedArgs::parse(
        args,
        &[
            "--runner",
            "--framework-version",
            "--name",
            "--description",
            "--license",
            "--repository",
            "--homepage",
            "--platform",
            "--link",
            "--output",
        ],
        &[],
    ) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_USAGE;
        }
    };
    let ([dir], Some(runner_name), Some(version)) = (
        parsed.positional.as_slice(),
        parsed.get("--runner"),
        parsed.get("--framework-version"),
    ) else {
        eprintln!("Usage: carton pack <DIR> --runner <NAME> --framework-version <REQ> [OPTIONS]");
        return EXIT_USAGE;
    };
    let required = match VersionReq::parse(version) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Invalid --framework-version '{}': {}", version, e);
            return EXIT_USAGE;
        }
    };
    let linked_files = match parse_links(parsed.get_all("--link")) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_USAGE;
        }
    };

    let mut info = CartonInfo::new(RunnerInfo::new(runner_name, required));
    info.model_name = parsed.get("--name").map(str::to_string);
    info.short_description = parsed.get("--description").map(str::to_string);
    info.license = parsed.get("--license").map(str::to_string);
    info.repository = parsed.get("--repository").map(str::to_string);
    info.homepage = parsed.get("--homepage").map(str::to_string);
    let platforms = parsed.get_all("--platform");
    if !platforms.is_empty() {
        info.required_platforms = Some(platforms.to_vec());
    }

    let opts = PackOpts {
        info,
        linked_files: (!linked_files.is_empty()).then_some(linked_files),
        output_path: parsed.get("--output").map(PathBuf::from),
    };

    let runtime = match Runtime::new(config::load()).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    match runtime.pack(dir, opts).await {
        Ok(path) => {
            println!("{}", path.display());
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

/// `carton shrink <path> --link SHA=URL... [--output PATH]`
pub async fn run_shrink(args: &[String]) -> i32 {
    let parsed = match ParsedArgs::parse(args, &["--link", "--output"], &[]) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_USAGE;
        }
    };
    let [path] = parsed.positional.as_slice() else {
        eprintln!("Usage: carton shrink <PATH> --link SHA256=URL [--link ...] [--output PATH]");
        return EXIT_USAGE;
    };
    let linked_files = match parse_links(parsed.get_all("--link")) {
        Ok(l) if !l.is_empty() => l,
        Ok(_) => {
            eprintln!("shrink needs at least one --link SHA256=URL");
            return EXIT_USAGE;
        }
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_USAGE;
        }
    };

    let runtime = match Runtime::new(config::load()).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let output = parsed.get("--output").map(PathBuf::from);
    match runtime.shrink_to(path, linked_files, output).await {
        Ok(out) => {
            println!("{}", out.display());
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_links_groups_by_hash() {
        let a = "a".repeat(64);
        let args = vec![
            format!("{a}=https://one/x"),
            format!("{a}=https://two/x"),
            format!("{a}=https://one/x"),
        ];
        let links = parse_links(&args).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].urls, vec!["https://one/x", "https://two/x"]);
    }

    #[test]
    fn test_parse_links_rejects_malformed() {
        assert!(parse_links(&["no-equals-sign".to_string()]).is_err());
    }
}
