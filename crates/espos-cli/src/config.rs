//! Supervisor configuration – reads `~/.espos/config.toml`.
//!
//! ```toml
//! idle_stack_size = 1024
//!
//! [kernel]
//! max_tasks = 16
//! low_memory_threshold = 10240
//! monitor_interval_ms = 5000
//! ```
//!
//! Every key is optional.

use espos_kernel::KernelConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Contents of `~/.espos/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Stack size for the idle task registered at boot.
    #[serde(default = "default_idle_stack_size")]
    pub idle_stack_size: u32,

    #[serde(default)]
    pub kernel: KernelConfig,
}

fn default_idle_stack_size() -> u32 {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_stack_size: default_idle_stack_size(),
            kernel: KernelConfig::default(),
        }
    }
}

/// Return the path to `~/.espos/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".espos").join("config.toml")
}

/// Load the config from `path`, falling back to defaults when the file does
/// not exist.  Environment overrides are applied either way, then the kernel
/// settings are validated.
pub fn load_from(path: &Path) -> Result<Config, String> {
    let mut cfg = if path.exists() {
        let raw = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut cfg);
    cfg.kernel.validate().map_err(|e| e.to_string())?;
    Ok(cfg)
}

/// Apply `ESPOS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ESPOS_MAX_TASKS` | `kernel.max_tasks` |
/// | `ESPOS_MAX_MEMORY_BLOCKS` | `kernel.max_memory_blocks` |
/// | `ESPOS_LOW_MEMORY_THRESHOLD` | `kernel.low_memory_threshold` |
/// | `ESPOS_MONITOR_INTERVAL_MS` | `kernel.monitor_interval_ms` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(n) = env_number("ESPOS_MAX_TASKS") {
        cfg.kernel.max_tasks = n;
    }
    if let Some(n) = env_number("ESPOS_MAX_MEMORY_BLOCKS") {
        cfg.kernel.max_memory_blocks = n;
    }
    if let Some(n) = env_number("ESPOS_LOW_MEMORY_THRESHOLD") {
        cfg.kernel.low_memory_threshold = n;
    }
    if let Some(n) = env_number("ESPOS_MONITOR_INTERVAL_MS") {
        cfg.kernel.monitor_interval_ms = n;
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = config_path_for_home(&dir.path().to_string_lossy());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn config_path_points_to_espos_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".espos"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let cfg = load_from(&path).expect("defaults");
        assert_eq!(cfg.idle_stack_size, 1024);
        assert_eq!(cfg.kernel.max_tasks, 16);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write_config(
            &dir,
            r#"
                idle_stack_size = 512

                [kernel]
                max_memory_blocks = 128
                low_memory_threshold = 4096
            "#,
        );
        let cfg = load_from(&path).expect("load ok");
        assert_eq!(cfg.idle_stack_size, 512);
        assert_eq!(cfg.kernel.max_memory_blocks, 128);
        assert_eq!(cfg.kernel.low_memory_threshold, 4096);
        assert_eq!(cfg.kernel.memory_alignment, 4);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write_config(&dir, "[kernel\nmax_tasks = ");
        let err = load_from(&path).unwrap_err();
        assert!(err.contains("Failed to parse config"), "{err}");
    }

    #[test]
    fn invalid_kernel_settings_are_rejected() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write_config(&dir, "[kernel]\nlock_timeout_ms = 0\n");
        let err = load_from(&path).unwrap_err();
        assert!(err.contains("lock_timeout_ms"), "{err}");
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = Config::default();
        let raw = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&raw).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        // SAFETY: single-threaded test; no other test reads these variables.
        unsafe {
            std::env::set_var("ESPOS_MAX_TASKS", "8");
            std::env::set_var("ESPOS_LOW_MEMORY_THRESHOLD", "not-a-number");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.kernel.max_tasks, 8);
        assert_eq!(cfg.kernel.low_memory_threshold, 10_240);
        unsafe {
            std::env::remove_var("ESPOS_MAX_TASKS");
            std::env::remove_var("ESPOS_LOW_MEMORY_THRESHOLD");
        }
    }
}
