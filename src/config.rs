//! Runtime configuration loading.
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! `CARTON_*` environment variables. Invalid values fall back to the
//! previous layer without failing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `CARTON_CONFIG_PATH` | `~/.carton/config.toml` | Optional config file |
//! | `CARTON_RUNNER_DIR` | `~/.carton/runners` | Runner discovery root |
//! | `CARTON_RUNNER_DATA_DIR` | `~/.carton/runner_data` | Data dir handed to runners |
//! | `CARTON_CACHE_DIR` | `~/.carton/cache` | Linked file cache root |
//! | `CARTON_FETCH_MAX_ATTEMPTS` | 3 | Rounds over the URL list |
//! | `CARTON_FETCH_BACKOFF_MS` | 200 | Initial backoff, doubled per round |
//! | `CARTON_FETCH_TIMEOUT` | 300 | Per-request timeout (secs) |
//! | `CARTON_HANDSHAKE_TIMEOUT` | 60 | Runner connect + load timeout (secs) |
//! | `CARTON_CALL_TIMEOUT` | 0 | Per-call timeout (secs, 0 = none) |
//! | `CARTON_IPC_FRAME_LIMIT` | 1073741824 | Max runner frame size (bytes) |
//! | `CARTON_INPUT_QUEUE_CAPACITY` | 32 | Pipeline input queue depth |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_FRAME_LIMIT: usize = 1024 * 1024 * 1024;
const MIN_FRAME_LIMIT: usize = 64 * 1024;

/// Retry policy for linked file downloads.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// All runtime configuration.
#[derive(Debug, Clone)]
pub struct CartonConfig {
    pub runner_dir: PathBuf,
    pub runner_data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub fetch: FetchConfig,
    pub handshake_timeout: Duration,
    /// `None` disables the per-call deadline.
    pub call_timeout: Option<Duration>,
    pub max_frame_size: usize,
    pub input_queue_capacity: usize,
}

impl Default for CartonConfig {
    fn default() -> Self {
        let home = carton_home();
        Self {
            runner_dir: home.join("runners"),
            runner_data_dir: home.join("runner_data"),
            cache_dir: home.join("cache"),
            fetch: FetchConfig::default(),
            handshake_timeout: Duration::from_secs(60),
            call_timeout: None,
            max_frame_size: DEFAULT_FRAME_LIMIT,
            input_queue_capacity: 32,
        }
    }
}

/// On-disk config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    runner_dir: Option<PathBuf>,
    runner_data_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    fetch_max_attempts: Option<u32>,
    fetch_backoff_ms: Option<u64>,
    fetch_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    call_timeout_secs: Option<u64>,
    ipc_frame_limit: Option<usize>,
    input_queue_capacity: Option<usize>,
}

/// `~/.carton`, or `./.carton` when no home directory is set.
pub fn carton_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".carton")
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_path(key: &str, default: PathBuf) -> PathBuf {
    match std::env::var_os(key) {
        Some(val) if !val.is_empty() => PathBuf::from(val),
        _ => default,
    }
}

/// Path of the config file consulted by [`load`].
pub fn config_path() -> PathBuf {
    parse_path("CARTON_CONFIG_PATH", carton_home().join("config.toml"))
}

fn read_config_file(path: &Path) -> ConfigFile {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return ConfigFile::default(),
    };
    match toml::from_str(&text) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring invalid config file");
            ConfigFile::default()
        }
    }
}

fn load_fetch_config(file: &ConfigFile) -> FetchConfig {
    let defaults = FetchConfig::default();
    let max_attempts = parse_u32(
        "CARTON_FETCH_MAX_ATTEMPTS",
        file.fetch_max_attempts.unwrap_or(defaults.max_attempts),
    );
    let backoff_ms = parse_u64(
        "CARTON_FETCH_BACKOFF_MS",
        file.fetch_backoff_ms
            .unwrap_or(defaults.initial_backoff.as_millis() as u64),
    );
    let timeout_secs = parse_u64(
        "CARTON_FETCH_TIMEOUT",
        file.fetch_timeout_secs
            .unwrap_or(defaults.request_timeout.as_secs()),
    );
    FetchConfig {
        max_attempts: max_attempts.clamp(1, 20),
        initial_backoff: Duration::from_millis(backoff_ms.min(60_000)),
        request_timeout: Duration::from_secs(timeout_secs.max(1)),
    }
}

/// Load configuration from the default file location and the environment.
pub fn load() -> CartonConfig {
    load_from(&config_path())
}

/// Load configuration from a specific file plus the environment.
pub fn load_from(path: &Path) -> CartonConfig {
    let file = read_config_file(path);
    let defaults = CartonConfig::default();

    let runner_dir = parse_path(
        "CARTON_RUNNER_DIR",
        file.runner_dir.clone().unwrap_or(defaults.runner_dir),
    );
    let runner_data_dir = parse_path(
        "CARTON_RUNNER_DATA_DIR",
        file.runner_data_dir.clone().unwrap_or(defaults.runner_data_dir),
    );
    let cache_dir = parse_path(
        "CARTON_CACHE_DIR",
        file.cache_dir.clone().unwrap_or(defaults.cache_dir),
    );

    let handshake_secs = parse_u64(
        "CARTON_HANDSHAKE_TIMEOUT",
        file.handshake_timeout_secs
            .unwrap_or(defaults.handshake_timeout.as_secs()),
    );
    let call_secs = parse_u64("CARTON_CALL_TIMEOUT", file.call_timeout_secs.unwrap_or(0));
    let max_frame_size = parse_usize(
        "CARTON_IPC_FRAME_LIMIT",
        file.ipc_frame_limit.unwrap_or(defaults.max_frame_size),
    );
    let input_queue_capacity = parse_usize(
        "CARTON_INPUT_QUEUE_CAPACITY",
        file.input_queue_capacity
            .unwrap_or(defaults.input_queue_capacity),
    );

    CartonConfig {
        runner_dir,
        runner_data_dir,
        cache_dir,
        fetch: load_fetch_config(&file),
        handshake_timeout: Duration::from_secs(handshake_secs.max(1)),
        call_timeout: (call_secs > 0).then(|| Duration::from_secs(call_secs)),
        max_frame_size: max_frame_size.max(MIN_FRAME_LIMIT),
        input_queue_capacity: input_queue_capacity.max(1),
    }
}

impl CartonConfig {
    /// Effective values as `(env var, value)` pairs, for display.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("CARTON_RUNNER_DIR", self.runner_dir.display().to_string()),
            ("CARTON_RUNNER_DATA_DIR", self.runner_data_dir.display().to_string()),
            ("CARTON_CACHE_DIR", self.cache_dir.display().to_string()),
            ("CARTON_FETCH_MAX_ATTEMPTS", self.fetch.max_attempts.to_string()),
            (
                "CARTON_FETCH_BACKOFF_MS",
                self.fetch.initial_backoff.as_millis().to_string(),
            ),
            (
                "CARTON_FETCH_TIMEOUT",
                self.fetch.request_timeout.as_secs().to_string(),
            ),
            (
                "CARTON_HANDSHAKE_TIMEOUT",
                self.handshake_timeout.as_secs().to_string(),
            ),
            (
                "CARTON_CALL_TIMEOUT",
                self.call_timeout.map_or(0, |d| d.as_secs()).to_string(),
            ),
            ("CARTON_IPC_FRAME_LIMIT", self.max_frame_size.to_string()),
            (
                "CARTON_INPUT_QUEUE_CAPACITY",
                self.input_queue_capacity.to_string(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "CARTON_CONFIG_PATH",
        "CARTON_RUNNER_DIR",
        "CARTON_RUNNER_DATA_DIR",
        "CARTON_CACHE_DIR",
        "CARTON_FETCH_MAX_ATTEMPTS",
        "CARTON_FETCH_BACKOFF_MS",
        "CARTON_FETCH_TIMEOUT",
        "CARTON_HANDSHAKE_TIMEOUT",
        "CARTON_CALL_TIMEOUT",
        "CARTON_IPC_FRAME_LIMIT",
        "CARTON_INPUT_QUEUE_CAPACITY",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    fn missing_file() -> PathBuf {
        PathBuf::from("/nonexistent/carton/config.toml")
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load_from(&missing_file());
        assert!(cfg.runner_dir.ends_with(".carton/runners"));
        assert!(cfg.cache_dir.ends_with(".carton/cache"));
        assert_eq!(cfg.fetch.max_attempts, 3);
        assert_eq!(cfg.fetch.initial_backoff, Duration::from_millis(200));
        assert_eq!(cfg.handshake_timeout.as_secs(), 60);
        assert!(cfg.call_timeout.is_none());
        assert_eq!(cfg.max_frame_size, DEFAULT_FRAME_LIMIT);
        assert_eq!(cfg.input_queue_capacity, 32);
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("CARTON_RUNNER_DIR", "/opt/carton/runners");
        std::env::set_var("CARTON_FETCH_MAX_ATTEMPTS", "5");
        std::env::set_var("CARTON_CALL_TIMEOUT", "10");
        std::env::set_var("CARTON_INPUT_QUEUE_CAPACITY", "8");
        let cfg = load_from(&missing_file());
        assert_eq!(cfg.runner_dir, PathBuf::from("/opt/carton/runners"));
        assert_eq!(cfg.fetch.max_attempts, 5);
        assert_eq!(cfg.call_timeout, Some(Duration::from_secs(10)));
        assert_eq!(cfg.input_queue_capacity, 8);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("CARTON_FETCH_MAX_ATTEMPTS", "many");
        std::env::set_var("CARTON_HANDSHAKE_TIMEOUT", "soon");
        let cfg = load_from(&missing_file());
        assert_eq!(cfg.fetch.max_attempts, 3);
        assert_eq!(cfg.handshake_timeout.as_secs(), 60);
        clear_env_vars();
    }

    #[test]
    fn test_floors_are_applied() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("CARTON_IPC_FRAME_LIMIT", "0");
        std::env::set_var("CARTON_INPUT_QUEUE_CAPACITY", "0");
        std::env::set_var("CARTON_FETCH_MAX_ATTEMPTS", "0");
        let cfg = load_from(&missing_file());
        assert!(cfg.max_frame_size >= MIN_FRAME_LIMIT);
        assert_eq!(cfg.input_queue_capacity, 1);
        assert_eq!(cfg.fetch.max_attempts, 1);
        clear_env_vars();
    }

    #[test]
    fn test_file_layer_then_env_layer() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "cache_dir = \"/srv/cache\"\nfetch_max_attempts = 7\ncall_timeout_secs = 3\n",
        )
        .unwrap();

        let cfg = load_from(&path);
        assert_eq!(cfg.cache_dir, PathBuf::from("/srv/cache"));
        assert_eq!(cfg.fetch.max_attempts, 7);
        assert_eq!(cfg.call_timeout, Some(Duration::from_secs(3)));

        std::env::set_var("CARTON_FETCH_MAX_ATTEMPTS", "2");
        let cfg = load_from(&path);
        assert_eq!(cfg.fetch.max_attempts, 2);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_file_is_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not_a_key = 1\n").unwrap();
        let cfg = load_from(&path);
        assert_eq!(cfg.fetch.max_attempts, 3);
    }

    #[test]
    fn test_entries_cover_every_variable() {
        let cfg = CartonConfig::default();
        let keys: Vec<_> = cfg.entries().into_iter().map(|(k, _)| k).collect();
        for k in &ENV_KEYS[1..] {
            assert!(keys.contains(k), "missing {k}");
        }
    }
}
