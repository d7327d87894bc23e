//! Config CLI subcommand: show.
//!
//! Reads configuration the same way the library does, without loading
//! anything.

use crate::config;

/// Print the effective configuration as `VAR=value` lines.
pub fn run_show() {
    let cfg = config::load();
    println!("# config file: {}", config::config_path().display());
    for (key, value) in cfg.entries() {
        println!("{}={}", key, value);
    }
}
