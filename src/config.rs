//! Cells service configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::{CELL_ITEM_SEPARATOR, DEFAULT_PATH_SEPARATOR, HOST_SEPARATOR};
use crate::error::{CellError, Result};

const DEFAULT_UPDATED_AT_THRESHOLD_SECS: u64 = 3600;
const DEFAULT_UPDATE_NUM_INSTANCES: usize = 1;
const DEFAULT_HEAL_INTERVAL_SECS: u64 = 60;
const DEFAULT_UPDATE_PARENTS_INTERVAL_SECS: u64 = 60;

fn default_updated_at_threshold() -> u64 {
    DEFAULT_UPDATED_AT_THRESHOLD_SECS
}

fn default_update_num_instances() -> usize {
    DEFAULT_UPDATE_NUM_INSTANCES
}

fn default_heal_interval_secs() -> u64 {
    DEFAULT_HEAL_INTERVAL_SECS
}

fn default_update_parents_interval_secs() -> u64 {
    DEFAULT_UPDATE_PARENTS_INTERVAL_SECS
}

fn default_compute_topic() -> String {
    "compute".to_string()
}

fn default_path_separator() -> char {
    DEFAULT_PATH_SEPARATOR
}

/// Inter-cell communication driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriverKind {
    /// In-process mailboxes, see [`crate::loopback`]
    #[default]
    Loopback,
}

/// Options recognized by the cells service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellsConfig {
    /// Cells communication driver to use
    #[serde(default)]
    pub driver: DriverKind,

    /// Seconds after a resource changed during which it is still re-published.
    /// Zero re-publishes everything.
    #[serde(default = "default_updated_at_threshold")]
    pub instance_updated_at_threshold: u64,

    /// Resources re-published per reconciliation run
    #[serde(default = "default_update_num_instances")]
    pub instance_update_num_instances: usize,

    /// Seconds between reconciliation runs
    #[serde(default = "default_heal_interval_secs")]
    pub heal_interval_secs: u64,

    /// Seconds between capability/capacity pushes to parents
    #[serde(default = "default_update_parents_interval_secs")]
    pub update_parents_interval_secs: u64,

    /// Topic prefix of proxied management RPCs
    #[serde(default = "default_compute_topic")]
    pub compute_topic: String,

    /// Joins the segments of a cell path
    #[serde(default = "default_path_separator")]
    pub path_separator: char,

    /// Deadline for calls that do not give their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_secs: Option<u64>,
}

impl Default for CellsConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::default(),
            instance_updated_at_threshold: default_updated_at_threshold(),
            instance_update_num_instances: default_update_num_instances(),
            heal_interval_secs: default_heal_interval_secs(),
            update_parents_interval_secs: default_update_parents_interval_secs(),
            compute_topic: default_compute_topic(),
            path_separator: default_path_separator(),
            call_timeout_secs: None,
        }
    }
}

/// File layout: options live under `[cells]`
#[derive(Deserialize)]
struct ConfigFile {
    cells: CellsConfig,
}

impl CellsConfig {
    /// Parse TOML. Accepts either a `[cells]` table or a bare document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let table: toml::Table = text
            .parse()
            .map_err(|e: toml::de::Error| CellError::Config(e.to_string()))?;
        let config = if table.contains_key("cells") {
            toml::from_str::<ConfigFile>(text).map(|f| f.cells)
        } else {
            toml::from_str::<CellsConfig>(text)
        }
        .map_err(|e| CellError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CellError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Reject option combinations the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if [CELL_ITEM_SEPARATOR, HOST_SEPARATOR].contains(&self.path_separator) {
            return Err(CellError::Config(format!(
                "path_separator '{}' is reserved for addresses",
                self.path_separator
            )));
        }
        if self.instance_update_num_instances == 0 {
            return Err(CellError::Config("instance_update_num_instances must be at least 1".into()));
        }
        if self.heal_interval_secs == 0 || self.update_parents_interval_secs == 0 {
            return Err(CellError::Config("periodic task intervals must be non-zero".into()));
        }
        if self.compute_topic.is_empty() {
            return Err(CellError::Config("compute_topic must not be empty".into()));
        }
        Ok(())
    }

    /// Staleness window, `None` when the filter is disabled
    pub fn updated_at_threshold(&self) -> Option<Duration> {
        match self.instance_updated_at_threshold {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn heal_interval(&self) -> Duration {
        Duration::from_secs(self.heal_interval_secs)
    }

    pub fn update_parents_interval(&self) -> Duration {
        Duration::from_secs(self.update_parents_interval_secs)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }
}
