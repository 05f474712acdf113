#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Once};

use srm::builtin;
use srm::{Config, JobRegistry};
use tempfile::TempDir;

static INIT: Once = Once::new();

pub fn test_dir() -> PathBuf {
    INIT.call_once(|| {
        let dir = PathBuf::from("./test_runs");
        std::fs::create_dir_all(&dir).expect("Failed to create test directory");
    });
    PathBuf::from("./test_runs")
}

/// Fresh directory under the test root, removed when dropped
pub fn scratch() -> TempDir {
    tempfile::Builder::new()
        .prefix("srm")
        .tempdir_in(test_dir())
        .expect("Failed to create scratch directory")
}

/// Small blocks and a dense index so that spilled maps split into many pieces
pub fn config(dir: &TempDir, threads: usize) -> Config {
    Config::default()
        .with_local_dir(dir.path())
        .with_threads(threads)
        .with_bytes_per_index(256)
        .with_block_size(2048)
        .with_min_free(0)
}

/// Same as `config`, but every merge externalizes all partitions
pub fn spilling_config(dir: &TempDir, threads: usize) -> Config {
    config(dir, threads).with_min_free(u64::MAX)
}

pub fn registry() -> Arc<JobRegistry> {
    let mut registry = JobRegistry::new();
    builtin::register_builtins(&mut registry).expect("Failed to register builtin jobs");
    Arc::new(registry)
}

/// 0..count, every number `repeat` times
pub fn numbers(count: u64, repeat: u64) -> Vec<u64> {
    (0..repeat).flat_map(|_| 0..count).collect()
}
