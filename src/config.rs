use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Prefix of command line options understood by [`Config::apply_args`].
pub const OPTION_PREFIX: &str = "-SRM:";

/// Size units accepted in byte-valued options ("32MB", "8K", "128").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteUnit {
    B,
    K,
    KB,
    M,
    MB,
    G,
    GB,
}

impl ByteUnit {
    pub fn value(self) -> u64 {
        match self {
            ByteUnit::B => 1,
            ByteUnit::K | ByteUnit::KB => 1024,
            ByteUnit::M | ByteUnit::MB => 1024 * 1024,
            ByteUnit::G | ByteUnit::GB => 1024 * 1024 * 1024,
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix.to_ascii_uppercase().as_str() {
            "B" => Some(ByteUnit::B),
            "K" => Some(ByteUnit::K),
            "KB" => Some(ByteUnit::KB),
            "M" => Some(ByteUnit::M),
            "MB" => Some(ByteUnit::MB),
            "G" => Some(ByteUnit::G),
            "GB" => Some(ByteUnit::GB),
            _ => None,
        }
    }

    /// Parse an integer followed by an optional unit. Bare numbers are bytes.
    pub fn parse(s: &str) -> Result<u64> {
        Self::parse_with_default(s, ByteUnit::B)
    }

    pub fn parse_with_default(s: &str, default_unit: ByteUnit) -> Result<u64> {
        let trimmed = s.trim();
        let digits_end = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        if digits_end == 0 {
            return Err(Error::InvalidSize(s.to_string()));
        }

        let number: u64 = trimmed[..digits_end]
            .parse()
            .map_err(|_| Error::InvalidSize(s.to_string()))?;

        let suffix = trimmed[digits_end..].trim();
        let unit = if suffix.is_empty() {
            default_unit
        } else {
            ByteUnit::from_suffix(suffix).ok_or_else(|| Error::InvalidSize(s.to_string()))?
        };

        number
            .checked_mul(unit.value())
            .ok_or_else(|| Error::InvalidSize(s.to_string()))
    }
}

/// Job configuration.
///
/// A value of this type is created by the master, handed to every collection
/// and scheduler it builds, and shipped to workers in the registration message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Number of threads per process
    pub threads: usize,
    /// Directory where intermediate external maps are written
    pub local_dir: PathBuf,
    /// Directory visible to every worker; final external maps go here when set
    pub shared_dir: Option<PathBuf>,
    /// Additional local directories used round-robin for intermediate files
    pub disks: Vec<PathBuf>,
    /// Byte span of one split when an external map is used as input
    pub block_size: u64,
    /// Bytes written between two index entries
    pub bytes_per_index: u64,
    /// Buffer size of map file readers and writers
    pub buffer_size: usize,
    /// Bytes written between two forced flushes of a map file writer
    pub bytes_per_reset: u64,
    /// Externalize partitions when free memory drops below this many bytes
    pub min_free: u64,
    /// Hand freed heap back to the OS after execution, merge and externalization
    pub garbage_collect: bool,
    /// Worker addresses as `host[:port]`
    pub workers: Vec<String>,
    /// Size collections for the whole cluster instead of a single process
    pub distribute: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: 2,
            local_dir: PathBuf::from("."),
            shared_dir: None,
            disks: Vec::new(),
            block_size: 32 * 1024 * 1024,
            bytes_per_index: 8 * 1024,
            buffer_size: 8 * 1024,
            bytes_per_reset: 128 * 1024,
            min_free: 4 * 1024 * 1024 * 1024,
            garbage_collect: false,
            workers: Vec::new(),
            distribute: true,
        }
    }
}

impl Config {
    /// Build a configuration from defaults and `-SRM:Key=value` arguments.
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Config::default();
        config.apply_args(args)?;
        Ok(config)
    }

    /// Apply every `-SRM:Key=value` argument; other arguments are ignored.
    pub fn apply_args<I, S>(&mut self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            let arg = arg.as_ref();
            let Some(option) = arg.strip_prefix(OPTION_PREFIX) else {
                continue;
            };
            let Some((key, value)) = option.split_once('=') else {
                continue;
            };
            self.set_option(key, value)?;
        }
        Ok(())
    }

    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key.to_ascii_lowercase().as_str() {
            "threads" => {
                let threads: usize = value
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid thread count {:?}", value)))?;
                if threads == 0 {
                    return Err(Error::Config("threads must be at least 1".into()));
                }
                self.threads = threads;
            }
            "localdir" => self.local_dir = PathBuf::from(value),
            "shareddir" => {
                self.shared_dir = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "disks" => self.disks = split_list(value).map(PathBuf::from).collect(),
            "blocksize" => self.block_size = ByteUnit::parse(value)?,
            "index" => self.bytes_per_index = ByteUnit::parse(value)?,
            "buffer" => self.buffer_size = ByteUnit::parse(value)? as usize,
            "reset" => self.bytes_per_reset = ByteUnit::parse(value)?,
            "minfree" => self.min_free = ByteUnit::parse(value)?,
            "garbage" => self.garbage_collect = parse_bool(value),
            "workers" => self.workers = split_list(value).map(str::to_string).collect(),
            "distribute" => self.distribute = parse_bool(value),
            other => warn!("ignoring unknown option {}", other),
        }
        Ok(())
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_local_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.local_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_shared_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.shared_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_block_size(mut self, bytes: u64) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn with_bytes_per_index(mut self, bytes: u64) -> Self {
        self.bytes_per_index = bytes;
        self
    }

    pub fn with_min_free(mut self, bytes: u64) -> Self {
        self.min_free = bytes;
        self
    }

    pub fn with_workers<I, S>(mut self, workers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.workers = workers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_distribute(mut self, distribute: bool) -> Self {
        self.distribute = distribute;
        self
    }

    /// Master plus one process per configured worker.
    pub fn num_workers(&self) -> usize {
        self.workers.len() + 1
    }

    /// Partition count of collections created under this configuration.
    pub fn partitions(&self) -> usize {
        if self.distribute {
            self.num_workers() * self.threads
        } else {
            self.threads
        }
    }

    /// Directories used for intermediate files: `disks` when given, else `local_dir`.
    pub fn local_dirs(&self) -> Vec<PathBuf> {
        if self.disks.is_empty() {
            vec![self.local_dir.clone()]
        } else {
            self.disks.clone()
        }
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_bool(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}
