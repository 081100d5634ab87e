//! Typed daemon configuration.
//!
//! Settings are assembled from built-in defaults, an optional TOML file and
//! `FA_`-prefixed environment variables, in increasing priority.  The daemon
//! CLI overlays its own flags on top of the loaded settings.

use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{FaError, Result};
use crate::frame::FA_FRAME_SIZE;

/// Environment variable prefix for configuration overrides, e.g.
/// `FA_ARCHIVE_SERVER`, `FA_DEVICE`, `FA_BUFFER_BLOCKS`.
pub const ENV_PREFIX: &str = "FA_";

/// Archiver daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverConfig {
    /// Path of the sniffer character device.
    pub device: PathBuf,
    /// Server address clients connect to, `host:port`.
    pub archive_server: String,
    /// TCP port the command server listens on.
    pub server_port: u16,
    /// Number of frames transferred per ring slot.
    pub input_frame_count: usize,
    /// Number of slots in the in-RAM ring buffer.  Sized to absorb one to
    /// two seconds of capture at 10 kHz.
    pub buffer_blocks: usize,
    /// Nominal sample frequency in Hz, used to seed the block duration.
    pub sample_frequency: f64,
    /// Historical-read buffer pool size.
    pub read_buffers: usize,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        ArchiverConfig {
            device: PathBuf::from("/dev/fa_sniffer0"),
            archive_server: "localhost:8888".to_string(),
            server_port: 8888,
            input_frame_count: 256,
            buffer_blocks: 64,
            sample_frequency: 10_072.0,
            read_buffers: 256,
        }
    }
}

impl ArchiverConfig {
    /// Loads settings from defaults, then `config_file` if given, then the
    /// environment.
    pub fn load(config_file: Option<&PathBuf>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(ArchiverConfig::default()));
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }
        let config: ArchiverConfig = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| FaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Bytes transferred per ring slot.
    pub fn input_block_size(&self) -> usize {
        self.input_frame_count * FA_FRAME_SIZE
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_blocks < 2 {
            return Err(FaError::Config(
                "buffer_blocks must be at least 2".to_string(),
            ));
        }
        if self.input_frame_count == 0 {
            return Err(FaError::Config(
                "input_frame_count must be non-zero".to_string(),
            ));
        }
        if self.sample_frequency <= 0.0 {
            return Err(FaError::Config(
                "sample_frequency must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = ArchiverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.input_block_size(), 256 * FA_FRAME_SIZE);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server_port = 9999\nbuffer_blocks = 8").unwrap();
        let path = file.path().to_path_buf();
        let config = ArchiverConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server_port, 9999);
        assert_eq!(config.buffer_blocks, 8);
        // Untouched fields keep their defaults.
        assert_eq!(config.input_frame_count, 256);
    }

    #[test]
    fn rejects_tiny_ring() {
        let config = ArchiverConfig {
            buffer_blocks: 1,
            ..ArchiverConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
