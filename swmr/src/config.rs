use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::errors::{Result, SwmrError};

/// Upper bound for the automatically chosen chunk height.
pub const MAX_AUTO_CHUNK_ROWS: usize = 16_384;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub filename: String,
    pub dataset_name: String,
    pub width: usize,
    /// Rows per chunk; derived from the batch size when absent.
    pub chunk_rows: Option<usize>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            filename: "default.h5".to_string(),
            dataset_name: "data".to_string(),
            width: 42,
            chunk_rows: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub length: usize,
    pub batch_size: usize,
    pub ready_timeout_ms: u64,
    pub observe_timeout_ms: u64,
    pub seed: Option<u64>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            length: 1_000_000,
            batch_size: 100_000,
            ready_timeout_ms: 10_000,
            observe_timeout_ms: 1_000,
            seed: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub data_dir: String,
    pub link_name: String,
}

impl Default for SignalConfig {
    fn default() -> Self {
        SignalConfig {
            data_dir: std::env::temp_dir().to_string_lossy().into_owned(),
            link_name: "swmr-signal".to_string(),
        }
    }
}

impl SignalConfig {
    pub fn link_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.link_name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwmrConfig {
    pub storage: StorageConfig,
    pub protocol: ProtocolConfig,
    pub signal: SignalConfig,
    pub log_level: String,
}

impl Default for SwmrConfig {
    fn default() -> Self {
        SwmrConfig {
            storage: StorageConfig::default(),
            protocol: ProtocolConfig::default(),
            signal: SignalConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Command-line values that take precedence over the loaded configuration.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub filename: Option<String>,
    pub dataset_name: Option<String>,
    pub length: Option<usize>,
    pub batch_size: Option<usize>,
    pub width: Option<usize>,
    pub seed: Option<u64>,
    pub ready_timeout_ms: Option<u64>,
    pub observe_timeout_ms: Option<u64>,
    pub data_dir: Option<String>,
    pub link_name: Option<String>,
    pub log_level: Option<String>,
}

impl SwmrConfig {
    pub fn builder() -> SwmrConfigBuilder {
        SwmrConfigBuilder::default()
    }

    /// Loads a TOML file, writing the defaults there first if it does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<SwmrConfig> {
        let cfg: SwmrConfig = confy::load_path(path.as_ref())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        confy::store_path(path.as_ref(), self)?;
        Ok(())
    }

    /// Loads `path` when given, otherwise starts from the defaults, then applies `overrides`.
    pub fn resolve(path: Option<&Path>, overrides: Overrides) -> Result<SwmrConfig> {
        let mut cfg = match path {
            Some(path) => confy::load_path(path)?,
            None => SwmrConfig::default(),
        };
        cfg.apply(overrides);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply(&mut self, o: Overrides) {
        if let Some(v) = o.filename {
            self.storage.filename = v;
        }
        if let Some(v) = o.dataset_name {
            self.storage.dataset_name = v;
        }
        if let Some(v) = o.width {
            self.storage.width = v;
        }
        if let Some(v) = o.length {
            self.protocol.length = v;
        }
        if let Some(v) = o.batch_size {
            self.protocol.batch_size = v;
        }
        if o.seed.is_some() {
            self.protocol.seed = o.seed;
        }
        if let Some(v) = o.ready_timeout_ms {
            self.protocol.ready_timeout_ms = v;
        }
        if let Some(v) = o.observe_timeout_ms {
            self.protocol.observe_timeout_ms = v;
        }
        if let Some(v) = o.data_dir {
            self.signal.data_dir = v;
        }
        if let Some(v) = o.link_name {
            self.signal.link_name = v;
        }
        if let Some(v) = o.log_level {
            self.log_level = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.dataset_name.is_empty() {
            return Err(SwmrError::Config("dataset name must not be empty".into()));
        }
        if self.storage.width == 0 {
            return Err(SwmrError::Config("width must be positive".into()));
        }
        if self.storage.chunk_rows == Some(0) {
            return Err(SwmrError::Config("chunk_rows must be positive".into()));
        }
        if self.protocol.batch_size == 0 {
            return Err(SwmrError::Config("batch size must be positive".into()));
        }
        if self.signal.link_name.is_empty() {
            return Err(SwmrError::Config("signal link name must not be empty".into()));
        }
        Ok(())
    }

    pub fn chunk_rows(&self) -> usize {
        self.storage
            .chunk_rows
            .unwrap_or_else(|| self.protocol.batch_size.min(MAX_AUTO_CHUNK_ROWS))
            .max(1)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.protocol.ready_timeout_ms)
    }

    pub fn observe_timeout(&self) -> Duration {
        Duration::from_millis(self.protocol.observe_timeout_ms)
    }
}

#[derive(Default)]
pub struct SwmrConfigBuilder {
    cfg: SwmrConfig,
}

impl SwmrConfigBuilder {
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.cfg.storage.filename = filename.into();
        self
    }

    pub fn dataset_name(mut self, name: impl Into<String>) -> Self {
        self.cfg.storage.dataset_name = name.into();
        self
    }

    pub fn width(mut self, width: usize) -> Self {
        self.cfg.storage.width = width;
        self
    }

    pub fn chunk_rows(mut self, rows: usize) -> Self {
        self.cfg.storage.chunk_rows = Some(rows);
        self
    }

    pub fn length(mut self, length: usize) -> Self {
        self.cfg.protocol.length = length;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.cfg.protocol.batch_size = batch_size;
        self
    }

    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.protocol.ready_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn observe_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.protocol.observe_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.cfg.protocol.seed = Some(seed);
        self
    }

    pub fn data_dir(mut self, dir: impl Into<String>) -> Self {
        self.cfg.signal.data_dir = dir.into();
        self
    }

    pub fn link_name(mut self, name: impl Into<String>) -> Self {
        self.cfg.signal.link_name = name.into();
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.cfg.log_level = level.into();
        self
    }

    pub fn build(self) -> Result<SwmrConfig> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}
