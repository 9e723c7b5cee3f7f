//! Typed map over a shared mapped file.
//!
//! `SharedHashMap` encodes keys and values through its codecs and hands the
//! bytes to the mapped-file engine. Each handle maps the file once; other
//! handles in this or other processes map it independently and see the same
//! entries.

use std::hash::{BuildHasher, Hasher};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxBuildHasher;

use crate::atomic::ValueRef;
use crate::codec::{Codec, CodecError};
use crate::config::{LockPolicy, MapConfig, DEFAULT_INIT_WAIT};
use crate::error::{MapError, Result};
use crate::shm::layout::{Layout, LayoutRequest};
use crate::shm::{PutMode, ShmTable};

/// Concurrent hash map whose entries live in a memory-mapped file.
///
/// All processes sharing a file must use the same codecs and hasher.
pub struct SharedHashMap<K, V, KC, VC, S = FxBuildHasher> {
    table: RwLock<Option<Arc<ShmTable>>>,
    key_codec: KC,
    value_codec: VC,
    hasher: S,
    path: PathBuf,
    _types: PhantomData<fn(K, V) -> (K, V)>,
}

fn key_err(e: CodecError) -> MapError {
    MapError::KeyEncoding(e.to_string())
}

fn value_err(e: CodecError) -> MapError {
    MapError::ValueEncoding(e.to_string())
}

fn resolve_size(configured: Option<u32>, declared: Option<u32>, what: &str) -> Result<u32> {
    configured.or(declared).ok_or_else(|| {
        MapError::Capacity(format!(
            "{what} codec declares no maximum size and none is configured"
        ))
    })
}

impl<K, V, KC, VC> SharedHashMap<K, V, KC, VC, FxBuildHasher>
where
    KC: Codec<K>,
    VC: Codec<V>,
{
    /// Create the file described by `config`, or open it if it already
    /// exists with the same layout.
    pub fn open_or_create(config: &MapConfig, key_codec: KC, value_codec: VC) -> Result<Self> {
        Self::open_or_create_with_hasher(config, key_codec, value_codec, FxBuildHasher)
    }

    /// Open an existing file, taking its layout from the header.
    pub fn open<P: AsRef<Path>>(
        path: P,
        key_codec: KC,
        value_codec: VC,
        lock: LockPolicy,
    ) -> Result<Self> {
        Self::open_with_hasher(path, key_codec, value_codec, lock, FxBuildHasher)
    }
}

impl<K, V, KC, VC, S> SharedHashMap<K, V, KC, VC, S>
where
    KC: Codec<K>,
    VC: Codec<V>,
    S: BuildHasher,
{
    pub fn open_or_create_with_hasher(
        config: &MapConfig,
        key_codec: KC,
        value_codec: VC,
        hasher: S,
    ) -> Result<Self> {
        let layout = Layout::plan(&LayoutRequest {
            entries: config.entries,
            min_segments: config.min_segments,
            max_key_size: resolve_size(config.max_key_size, key_codec.max_size(), "key")?,
            max_value_size: resolve_size(config.max_value_size, value_codec.max_size(), "value")?,
            entry_size: config.entry_size,
        })?;
        let table = ShmTable::open_or_create(&config.path, &layout, config.lock, config.init_wait)?;
        Ok(Self::from_table(table, key_codec, value_codec, hasher))
    }

    pub fn open_with_hasher<P: AsRef<Path>>(
        path: P,
        key_codec: KC,
        value_codec: VC,
        lock: LockPolicy,
        hasher: S,
    ) -> Result<Self> {
        let table = ShmTable::open(path.as_ref(), lock, DEFAULT_INIT_WAIT)?;
        let layout = table.layout();
        for (declared, capacity, what) in [
            (key_codec.max_size(), layout.key_capacity, "key"),
            (value_codec.max_size(), layout.value_capacity, "value"),
        ] {
            if let Some(max) = declared {
                if max > capacity {
                    return Err(MapError::FormatMismatch(format!(
                        "{what} codec max size {max} exceeds the file's {what} capacity {capacity}"
                    )));
                }
            }
        }
        Ok(Self::from_table(table, key_codec, value_codec, hasher))
    }

    fn from_table(table: ShmTable, key_codec: KC, value_codec: VC, hasher: S) -> Self {
        SharedHashMap {
            path: table.path().to_path_buf(),
            table: RwLock::new(Some(Arc::new(table))),
            key_codec,
            value_codec,
            hasher,
            _types: PhantomData,
        }
    }

    /// Hash of an encoded key. Computed over the bytes so every process
    /// derives the same value.
    pub fn hash_key(&self, key_bytes: &[u8]) -> u64 {
        let mut h = self.hasher.build_hasher();
        h.write(key_bytes);
        h.finish()
    }

    fn encode_key(&self, key: &K) -> Result<(u64, Vec<u8>)> {
        let mut buf = Vec::new();
        self.key_codec.encode(key, &mut buf).map_err(key_err)?;
        Ok((self.hash_key(&buf), buf))
    }

    fn encode_value(&self, value: &V) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.value_codec.encode(value, &mut buf).map_err(value_err)?;
        Ok(buf)
    }

    /// The open table. The handle lock is held only long enough to clone
    /// the `Arc`, so `close` never waits on an operation or a `ValueRef`.
    fn table(&self) -> Result<Arc<ShmTable>> {
        self.table
            .read_recursive()
            .as_ref()
            .cloned()
            .ok_or(MapError::Closed)
    }

    fn with_table<R>(&self, f: impl FnOnce(&ShmTable) -> Result<R>) -> Result<R> {
        let table = self.table()?;
        f(&table)
    }

    fn decode(&self, bytes: &[u8]) -> std::result::Result<V, CodecError> {
        self.value_codec.decode(bytes)
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let (hash, kb) = self.encode_key(key)?;
        let found = self.with_table(|t| t.get(hash, &kb, |b| self.decode(b)))?;
        found.transpose().map_err(value_err)
    }

    /// Decode the value for `key` into `target`. Returns whether the key was
    /// found; `target` is untouched otherwise.
    pub fn get_using(&self, key: &K, target: &mut V) -> Result<bool> {
        let (hash, kb) = self.encode_key(key)?;
        let found =
            self.with_table(|t| t.get(hash, &kb, |b| self.value_codec.decode_into(b, target)))?;
        match found {
            Some(r) => r.map(|_| true).map_err(value_err),
            None => Ok(false),
        }
    }

    /// Insert or overwrite, returning the previous value.
    pub fn put(&self, key: &K, value: &V) -> Result<Option<V>> {
        self.put_with(key, value, PutMode::Upsert)
    }

    /// Insert only if absent. Returns the current value when present.
    pub fn put_if_absent(&self, key: &K, value: &V) -> Result<Option<V>> {
        self.put_with(key, value, PutMode::IfAbsent)
    }

    /// Overwrite only if present. Returns the previous value when present.
    pub fn replace(&self, key: &K, value: &V) -> Result<Option<V>> {
        self.put_with(key, value, PutMode::IfPresent)
    }

    fn put_with(&self, key: &K, value: &V, mode: PutMode) -> Result<Option<V>> {
        let (hash, kb) = self.encode_key(key)?;
        let vb = self.encode_value(value)?;
        let prev = self.with_table(|t| t.put(hash, &kb, &vb, mode, |b| self.decode(b)))?;
        prev.transpose().map_err(value_err)
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let (hash, kb) = self.encode_key(key)?;
        let removed = self.with_table(|t| t.remove(hash, &kb, |b| self.decode(b)))?;
        removed.transpose().map_err(value_err)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        let (hash, kb) = self.encode_key(key)?;
        self.with_table(|t| Ok(t.get(hash, &kb, |_| ())?.is_some()))
    }

    /// Entry count summed over segments without locking them. Approximate
    /// while other threads or processes are mutating the map.
    pub fn size(&self) -> Result<usize> {
        self.with_table(|t| Ok(t.len()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.with_table(|t| Ok(t.is_empty()))
    }

    /// Entry count with all segments locked at once.
    pub fn exact_size(&self) -> Result<usize> {
        self.with_table(|t| t.exact_len())
    }

    pub fn clear(&self) -> Result<()> {
        self.with_table(|t| t.clear())
    }

    /// Visit every entry.
    ///
    /// Each segment is decoded under its lock and visited after the lock is
    /// released, so `f` may call back into the map. Entries changed
    /// concurrently in segments not yet visited may or may not be seen.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(K, V),
    {
        let segments = self.with_table(|t| Ok(t.layout().segment_count as usize))?;
        for index in 0..segments {
            let batch = self.with_table(|t| {
                let mut batch = Vec::with_capacity(t.segment(index).used() as usize);
                let mut failure = None;
                t.scan_segment(index, |kb, vb| {
                    if failure.is_some() {
                        return;
                    }
                    let decoded = self
                        .key_codec
                        .decode(kb)
                        .map_err(key_err)
                        .and_then(|k| Ok((k, self.decode(vb).map_err(value_err)?)));
                    match decoded {
                        Ok(kv) => batch.push(kv),
                        Err(e) => failure = Some(e),
                    }
                })?;
                match failure {
                    Some(e) => Err(e),
                    None => Ok(batch),
                }
            })?;
            for (k, v) in batch {
                f(k, v);
            }
        }
        Ok(())
    }

    /// Live reference to the slot holding `key`, for in-place reads and
    /// atomic field updates.
    ///
    /// The reference keeps the mapping alive: after `close` it stays
    /// usable, and the file is unmapped once the last reference is dropped.
    pub fn get_ref(&self, key: &K) -> Result<Option<ValueRef<'_, V, VC>>> {
        let (hash, kb) = self.encode_key(key)?;
        let table = self.table()?;
        let slot = table.locate(hash, &kb)?;
        Ok(slot.map(|slot| ValueRef::new(table, slot, &self.value_codec)))
    }

    /// Flush dirty pages of the mapping to the file.
    pub fn flush(&self) -> Result<()> {
        self.with_table(|t| t.flush())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> Result<Layout> {
        self.with_table(|t| Ok(*t.layout()))
    }

    pub fn is_closed(&self) -> bool {
        self.table.read_recursive().is_none()
    }

    /// Release this handle's mapping. The file and other handles to it are
    /// unaffected. Later calls are no-ops, and every other operation fails
    /// with [`MapError::Closed`]. The mapping itself goes away when the last
    /// outstanding [`ValueRef`] is dropped; `close` does not wait for them.
    pub fn close(&self) {
        let Some(table) = self.table.write().take() else {
            return;
        };
        if let Err(e) = table.flush() {
            tracing::warn!(path = %self.path.display(), error = %e, "flush on close failed");
        }
        let outstanding = Arc::strong_count(&table) - 1;
        drop(table);
        tracing::debug!(path = %self.path.display(), outstanding, "closed shared map");
    }
}
