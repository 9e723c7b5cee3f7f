//! Concurrent key-value map stored in a memory-mapped file.
//!
//! Entries live in fixed-size slots inside the file, so threads of one
//! process and separate processes that map the same path share a single
//! data set with no copying. The file is divided into segments, each guarded
//! by its own lock word in the mapping.
//!
//! ```no_run
//! use warp_map::{MapConfig, Native, SharedHashMap, StrCodec};
//!
//! let config = MapConfig::new("/tmp/counters.map").entries(10_000);
//! let map = SharedHashMap::open_or_create(&config, StrCodec::new(64), Native::<u64>::new())?;
//! map.put(&"requests".to_string(), &0)?;
//! if let Some(r) = map.get_ref(&"requests".to_string())? {
//!     r.field_u64("value")?.add(1)?;
//! }
//! # Ok::<(), warp_map::MapError>(())
//! ```

pub mod atomic;
pub mod codec;
pub mod config;
pub mod error;
pub mod map;
pub(crate) mod shm;

pub use atomic::{AtomicField, ValueRef};
pub use codec::{BytesCodec, Codec, CodecError, FixedLayout, Native, StrCodec};
pub use config::{LockPolicy, MapConfig};
pub use error::{MapError, Result};
pub use map::SharedHashMap;
pub use shm::layout::Layout;
pub use shm::SlotRef;
