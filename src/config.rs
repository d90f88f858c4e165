//! Configuration management for revfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default timeout for acquiring the parent-commit lock
pub const DEFAULT_CHECKOUT_LOCK_TIMEOUT_MS: u64 = 500;

/// Default cap on concurrent tree prefetches
pub const DEFAULT_TREE_PREFETCH_CONCURRENCY: usize = 4;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Per-mount state directory (overlay tree, parent-commit record)
    pub state_dir: PathBuf,

    /// Mount configuration
    pub mount: MountConfig,

    /// Overlay configuration
    pub overlay: OverlayConfig,

    /// Checkout configuration
    pub checkout: CheckoutConfig,

    /// Prefetch configuration
    pub prefetch: PrefetchConfig,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// UID reported for files
    pub uid: u32,

    /// GID reported for files
    pub gid: u32,
}

/// Overlay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Compare names case-sensitively; disable for the opt-in
    /// case-insensitive mode
    pub case_sensitive: bool,
}

/// Checkout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutConfig {
    /// Parent-commit lock acquisition timeout in milliseconds
    pub lock_timeout_ms: u64,
}

/// Prefetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    /// Maximum concurrent tree prefetches
    pub max_concurrent_tree_prefetches: usize,
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("revfs");

        Config {
            state_dir,
            mount: MountConfig::default(),
            overlay: OverlayConfig::default(),
            checkout: CheckoutConfig::default(),
            prefetch: PrefetchConfig::default(),
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/revfs"),
            allow_other: false,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig {
            case_sensitive: true,
        }
    }
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        CheckoutConfig {
            lock_timeout_ms: DEFAULT_CHECKOUT_LOCK_TIMEOUT_MS,
        }
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        PrefetchConfig {
            max_concurrent_tree_prefetches: DEFAULT_TREE_PREFETCH_CONCURRENCY,
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config file: {}", e)))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("REVFS_STATE_DIR") {
            if !dir.trim().is_empty() {
                self.state_dir = PathBuf::from(dir.trim());
            }
        }

        if let Ok(timeout) = std::env::var("REVFS_CHECKOUT_LOCK_TIMEOUT_MS") {
            if let Ok(ms) = timeout.trim().parse::<u64>() {
                self.checkout.lock_timeout_ms = ms;
            }
        }

        if let Ok(n) = std::env::var("REVFS_TREE_PREFETCH_CONCURRENCY") {
            if let Ok(n) = n.trim().parse::<usize>() {
                self.prefetch.max_concurrent_tree_prefetches = n;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "state directory is required".to_string(),
            ));
        }

        if self.checkout.lock_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "checkout lock timeout must be greater than 0".to_string(),
            ));
        }

        if self.prefetch.max_concurrent_tree_prefetches == 0 {
            return Err(Error::InvalidConfig(
                "tree prefetch concurrency must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        Ok(())
    }

    /// Where the overlay tree lives
    pub fn overlay_dir(&self) -> PathBuf {
        self.state_dir.join("overlay")
    }

    /// Where the parent-commit record lives
    pub fn parents_file(&self) -> PathBuf {
        self.state_dir.join("parents")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.state_dir = dir.path().join("state");
        config.checkout.lock_timeout_ms = 750;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.state_dir, config.state_dir);
        assert_eq!(loaded.checkout.lock_timeout_ms, 750);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.checkout.lock_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_env_override() {
        let mut config = Config::default();
        std::env::set_var("REVFS_CHECKOUT_LOCK_TIMEOUT_MS", "900");
        config.apply_env_overrides();
        std::env::remove_var("REVFS_CHECKOUT_LOCK_TIMEOUT_MS");
        assert_eq!(config.checkout.lock_timeout_ms, 900);
    }
}
