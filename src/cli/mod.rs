//! CLI subcommands for the `carton` binary.
//!
//! ## Usage
//!
//! ```bash
//! carton info model.carton            # Show metadata
//! carton pack ./model --runner echo --framework-version '>=1'
//! carton shrink model.carton --link SHA=URL
//! carton selftest model.carton        # Run stored self-tests
//! carton runners                      # List installed runners
//! ```

pub mod archive_cmd;
pub mod config_cmd;
pub mod runners_cmd;

use std::collections::BTreeMap;

/// Exit code for bad command lines.
pub const EXIT_USAGE: i32 = 2;

/// Command line split into positional arguments and `--flag value` pairs.
#[derive(Debug, Default)]
pub struct ParsedArgs {
    pub positional: Vec<String>,
    values: BTreeMap<String, Vec<String>>,
    switches: Vec<String>,
}

impl ParsedArgs {
    /// Parse `args`. Flags listed in `value_flags` take a value (either
    /// `--flag value` or `--flag=value`); `switch_flags` take none.
    pub fn parse(args: &[String], value_flags: &[&str], switch_flags: &[&str]) -> Result<Self, String> {
        let mut parsed = ParsedArgs::default();
        let mut i = 0;
        while i < args.len() {
            let arg = &args[i];
            if let Some((flag, value)) = arg.split_once('=').filter(|(f, _)| f.starts_with("--")) {
                if !value_flags.contains(&flag) {
                    return Err(format!("Unknown argument: {}", flag));
                }
                parsed.push(flag, value.to_string());
                i += 1;
            } else if value_flags.contains(&arg.as_str()) {
                match args.get(i + 1) {
                    Some(value) => parsed.push(arg, value.clone()),
                    None => return Err(format!("Missing value for {}", arg)),
                }
                i += 2;
            } else if switch_flags.contains(&arg.as_str()) {
                parsed.switches.push(arg.clone());
                i += 1;
            } else if arg.starts_with("--") {
                return Err(format!("Unknown argument: {}", arg));
            } else {
                parsed.positional.push(arg.clone());
                i += 1;
            }
        }
        Ok(parsed)
    }

    fn push(&mut self, flag: &str, value: String) {
        self.values.entry(flag.to_string()).or_default().push(value);
    }

    /// Last value given for `flag`.
    pub fn get(&self, flag: &str) -> Option<&str> {
        self.values
            .get(flag)
            .and_then(|v| v.last())
            .map(String::as_str)
    }

    pub fn get_all(&self, flag: &str) -> &[String] {
        self.values.get(flag).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn has(&self, switch: &str) -> bool {
        self.switches.iter().any(|s| s == switch)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
        out.push('~');
        out
    }
}
