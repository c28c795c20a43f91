use crate::compression::{Codec, CompressionSettings};
use crate::error::{AgentError, Result};
use crate::failure::ErrorPolicy;
use crate::pipes;
use crate::plugin::PluginConfig;
use std::path::{Path, PathBuf};

/// Level used when a codec is named without `--compression-level`. Level 0
/// would make gzip store the data uncompressed.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
    Backup,
    Restore,
}

/// Everything one agent run needs, validated.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub mode: Mode,
    pub toc_file: PathBuf,
    pub oid_file: PathBuf,
    pub pipe_prefix: PathBuf,
    pub content: i32,
    pub data_file: PathBuf,
    pub compression: CompressionSettings,
    pub on_error: ErrorPolicy,
    pub plugin: Option<PluginConfig>,
}

/// Raw option values as they come off the command line.
#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    pub backup: bool,
    pub restore: bool,
    pub toc_file: PathBuf,
    pub oid_file: PathBuf,
    pub pipe_file: PathBuf,
    pub content: i32,
    pub data_file: PathBuf,
    pub compression_type: Option<Codec>,
    pub compression_level: Option<i32>,
    pub on_error_continue: bool,
    pub plugin_config: Option<PathBuf>,
}

impl AgentConfig {
    pub fn from_options(opts: AgentOptions) -> Result<Self> {
        let mode = match (opts.backup, opts.restore) {
            (true, false) => Mode::Backup,
            (false, true) => Mode::Restore,
            _ => {
                return Err(AgentError::Config(
                    "exactly one of --backup-agent and --restore-agent is required".into(),
                ));
            }
        };

        for (flag, value) in [
            ("--toc-file", &opts.toc_file),
            ("--oid-file", &opts.oid_file),
            ("--pipe-file", &opts.pipe_file),
            ("--data-file", &opts.data_file),
        ] {
            if value.as_os_str().is_empty() {
                return Err(AgentError::Config(format!("{flag} is required")));
            }
        }

        let compression = match (mode, opts.compression_type) {
            (_, Some(codec)) => CompressionSettings::new(
                codec,
                opts.compression_level.unwrap_or(DEFAULT_COMPRESSION_LEVEL),
            )?,
            (Mode::Backup, None) => {
                if let Some(level) = opts.compression_level {
                    tracing::warn!(
                        level,
                        "--compression-level given without --compression-type; writing uncompressed"
                    );
                }
                CompressionSettings::none()
            }
            // the level doesn't matter for reading
            (Mode::Restore, None) => CompressionSettings {
                codec: Codec::from_extension(&opts.data_file),
                level: 0,
            },
        };

        let plugin = opts
            .plugin_config
            .as_deref()
            .map(PluginConfig::load)
            .transpose()?;

        Ok(Self {
            mode,
            toc_file: opts.toc_file,
            oid_file: opts.oid_file,
            pipe_prefix: opts.pipe_file,
            content: opts.content,
            data_file: opts.data_file,
            compression,
            on_error: if opts.on_error_continue {
                ErrorPolicy::Continue
            } else {
                ErrorPolicy::Abort
            },
            plugin,
        })
    }

    pub fn sentinel_path(&self) -> PathBuf {
        pipes::sentinel_path(&self.pipe_prefix)
    }

    pub fn pipe_path(&self, oid: crate::Oid) -> PathBuf {
        pipes::pipe_path(&self.pipe_prefix, oid)
    }

    pub fn prefix(&self) -> &Path {
        &self.pipe_prefix
    }
}
