//! Runtime configuration types.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the configuration file looked up next to the input.
pub const CONFIG_FILE: &str = "rill.toml";

/// Log filter used when neither `RUST_LOG` nor the config file sets one.
pub const DEFAULT_LOG_FILTER: &str = "rill=warn";

/// Log filter used instead of the default when `trace_exec` is on.
pub const TRACE_LOG_FILTER: &str = "rill=trace";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Runtime configuration for the VM and the driver around it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Log every executed instruction at trace level
    pub trace_exec: bool,
    /// Count executed instructions per opcode and report after the run
    pub profile_opcodes: bool,
    /// Print the disassembly before running (to stderr, or to this file)
    pub dump_bytecode: Option<DumpTarget>,
    /// `tracing` filter directives, e.g. `rill=debug`
    pub log_filter: Option<String>,
}

/// Where a bytecode listing goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DumpTarget {
    /// `true` in the file: write to stderr. `false` is treated as unset.
    Stderr(bool),
    File(PathBuf),
}

impl RuntimeConfig {
    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        if config.dump_bytecode == Some(DumpTarget::Stderr(false)) {
            config.dump_bytecode = None;
        }
        Ok(config)
    }

    /// Load `rill.toml` from `dir` if present, otherwise the defaults.
    pub fn discover(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        if path.is_file() {
            tracing::debug!(path = %path.display(), "loading config");
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Filter directives for the log subscriber. An explicit `log_filter`
    /// wins; otherwise `trace_exec` turns on trace-level events.
    pub fn log_filter(&self) -> &str {
        match &self.log_filter {
            Some(filter) => filter,
            None if self.trace_exec => TRACE_LOG_FILTER,
            None => DEFAULT_LOG_FILTER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(!config.trace_exec);
        assert!(!config.profile_opcodes);
        assert_eq!(config.dump_bytecode, None);
        assert_eq!(config.log_filter(), "rill=warn");
    }

    #[test]
    fn test_parse_partial() {
        let config = RuntimeConfig::parse("profile_opcodes = true\nlog_filter = \"rill=debug\"\n")
            .unwrap();
        assert!(config.profile_opcodes);
        assert!(!config.trace_exec);
        assert_eq!(config.log_filter(), "rill=debug");
    }

    #[test]
    fn test_trace_exec_raises_log_level() {
        let config = RuntimeConfig::parse("trace_exec = true").unwrap();
        assert_eq!(config.log_filter(), "rill=trace");

        let config =
            RuntimeConfig::parse("trace_exec = true\nlog_filter = \"rill=info\"").unwrap();
        assert_eq!(config.log_filter(), "rill=info");
    }

    #[test]
    fn test_dump_target() {
        let config = RuntimeConfig::parse("dump_bytecode = true").unwrap();
        assert_eq!(config.dump_bytecode, Some(DumpTarget::Stderr(true)));

        let config = RuntimeConfig::parse("dump_bytecode = false").unwrap();
        assert_eq!(config.dump_bytecode, None);

        let config = RuntimeConfig::parse("dump_bytecode = \"out.txt\"").unwrap();
        assert_eq!(
            config.dump_bytecode,
            Some(DumpTarget::File(PathBuf::from("out.txt")))
        );
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(RuntimeConfig::parse("jit = true").is_err());
    }

    #[test]
    fn test_discover() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            RuntimeConfig::discover(dir.path()).unwrap(),
            RuntimeConfig::default()
        );

        fs::write(dir.path().join(CONFIG_FILE), "trace_exec = true").unwrap();
        assert!(RuntimeConfig::discover(dir.path()).unwrap().trace_exec);

        fs::write(dir.path().join(CONFIG_FILE), "trace_exec = 3").unwrap();
        let err = RuntimeConfig::discover(dir.path()).unwrap_err();
        assert!(err.to_string().starts_with("failed to parse"));
    }
}
