//! Engine parameters for a shared map file.

use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::shm::lock::LockPolicy;

/// Default requested entry count when none is given.
pub const DEFAULT_ENTRIES: u64 = 1 << 16;

/// How long an opener waits for a concurrent creator to publish the header.
pub const DEFAULT_INIT_WAIT: Duration = Duration::from_secs(2);

/// Parameters consumed when creating or opening a map file.
///
/// `max_key_size` / `max_value_size` override the sizes declared by the
/// codecs; they are required when a codec has no natural bound.
/// `entry_size` is the key + value payload per slot and is derived from the
/// two maxima when absent.
#[derive(Debug, Clone)]
pub struct MapConfig {
    pub path: PathBuf,
    pub entries: u64,
    pub min_segments: u32,
    pub entry_size: Option<u32>,
    pub max_key_size: Option<u32>,
    pub max_value_size: Option<u32>,
    pub lock: LockPolicy,
    pub init_wait: Duration,
}

impl MapConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        MapConfig {
            path: path.as_ref().to_path_buf(),
            entries: DEFAULT_ENTRIES,
            min_segments: 1,
            entry_size: None,
            max_key_size: None,
            max_value_size: None,
            lock: LockPolicy::default(),
            init_wait: DEFAULT_INIT_WAIT,
        }
    }

    pub fn entries(mut self, entries: u64) -> Self {
        self.entries = entries;
        self
    }

    pub fn min_segments(mut self, min_segments: u32) -> Self {
        self.min_segments = min_segments;
        self
    }

    pub fn entry_size(mut self, entry_size: u32) -> Self {
        self.entry_size = Some(entry_size);
        self
    }

    pub fn max_key_size(mut self, max_key_size: u32) -> Self {
        self.max_key_size = Some(max_key_size);
        self
    }

    pub fn max_value_size(mut self, max_value_size: u32) -> Self {
        self.max_value_size = Some(max_value_size);
        self
    }

    pub fn lock_policy(mut self, lock: LockPolicy) -> Self {
        self.lock = lock;
        self
    }

    pub fn init_wait(mut self, init_wait: Duration) -> Self {
        self.init_wait = init_wait;
        self
    }
}
