use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::config::Config;

// Process-wide sequence so two storages never hand out the same name
static FILE_SEQ: AtomicU64 = AtomicU64::new(0);

/// What a new file is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Spilled partition awaiting compaction; always on local disks
    Intermediate,
    /// Merged result; on shared storage when configured
    Final,
}

impl FileKind {
    fn suffix(self) -> &'static str {
        match self {
            FileKind::Intermediate => "tmp",
            FileKind::Final => "final",
        }
    }
}

/// Placement of external map files.
///
/// Intermediate files rotate round-robin over the local directories. Final files
/// go to the shared directory when one is configured so that other ranks can
/// open them after a partition exchange.
#[derive(Debug)]
pub struct Storage {
    local: Vec<PathBuf>,
    shared: Option<PathBuf>,
    next_local: AtomicUsize,
    stamp: u128,
}

impl Storage {
    pub fn new(config: &Config) -> Self {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self {
            local: config.local_dirs(),
            shared: config.shared_dir.clone(),
            next_local: AtomicUsize::new(0),
            stamp,
        }
    }

    pub fn shared_dir(&self) -> Option<&Path> {
        self.shared.as_deref()
    }

    fn next_local_dir(&self) -> &Path {
        let i = self.next_local.fetch_add(1, Ordering::Relaxed) % self.local.len();
        &self.local[i]
    }

    /// Reserve a fresh path; the directory is created, the file is not.
    pub fn create_file(&self, kind: FileKind) -> io::Result<PathBuf> {
        let dir = match (kind, &self.shared) {
            (FileKind::Final, Some(shared)) => shared.as_path(),
            _ => self.next_local_dir(),
        };
        std::fs::create_dir_all(dir)?;

        let seq = FILE_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!(
            "srm_{}_{}_{}.{}",
            std::process::id(),
            self.stamp,
            seq,
            kind.suffix()
        ));
        debug!("reserved {:?} file {}", kind, path.display());
        Ok(path)
    }
}
