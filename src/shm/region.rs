//! The memory-mapped file holding the whole map: header + segments.
//!
//! Creation uses `create_new`, so of several processes racing to create the
//! same path exactly one initialises it; the others open it and wait for the
//! header's `ready` word. Openers validate the header (read with plain file
//! IO) before mapping the rest of the file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use memmap2::MmapMut;

use super::layout::{Header, Layout, HEADER_SIZE, MAGIC, READY_OFFSET, SLOT_NONE};
use crate::error::{MapError, Result};

const INIT_POLL: Duration = Duration::from_millis(1);

/// Owns the mapping for one process. Other processes map the same file
/// independently; dropping this only unmaps it here.
pub struct MappedFile {
    mmap: MmapMut,
    base: NonNull<u8>,
    path: PathBuf,
    layout: Layout,
}

// The mapping is only mutated through the segment locks and atomics.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Create and initialise a new file. Fails with `AlreadyExists` if the
    /// path is taken.
    pub fn create(path: &Path, layout: &Layout) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        match Self::init(file, path, layout) {
            Ok(region) => Ok(region),
            Err(e) => {
                // Leave nothing half-initialised behind for openers to wait on.
                let _ = fs::remove_file(path);
                Err(e)
            }
        }
    }

    fn init(file: File, path: &Path, layout: &Layout) -> Result<Self> {
        file.set_len(layout.file_size)?;

        // Safety: we just created this file; no other process has a valid
        // header to act on until `ready` is published below.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        // A fresh file reads as zeros: lock words, used counts and bitsets
        // start out correct. Only the header and bucket heads need writing.
        mmap[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&layout.to_header()));
        for seg in 0..layout.segment_count as usize {
            let start = layout.segment_offset(seg) + layout.buckets_offset();
            let end = start + layout.buckets_per_segment as usize * 4;
            let heads: &mut [u32] = bytemuck::cast_slice_mut(&mut mmap[start..end]);
            heads.fill(SLOT_NONE);
        }
        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "null mapping"))?;

        let region = MappedFile {
            mmap,
            base,
            path: path.to_path_buf(),
            layout: *layout,
        };
        region.ready_flag().store(1, Ordering::Release);

        tracing::info!(
            path = %path.display(),
            segments = layout.segment_count,
            entries_per_segment = layout.entries_per_segment,
            entry_stride = layout.entry_stride,
            file_size = layout.file_size,
            "created shared map file"
        );
        Ok(region)
    }

    /// Open an existing file, taking the layout from its header.
    ///
    /// Waits up to `init_wait` for a concurrent creator to publish the header.
    pub fn open(path: &Path, init_wait: Duration) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let header = wait_for_header(&mut file, init_wait)?;
        let layout = Layout::from_header(&header)?;

        let len = file.metadata()?.len();
        if len < layout.file_size {
            return Err(MapError::FormatMismatch(format!(
                "file is {len} bytes, header describes {}",
                layout.file_size
            )));
        }

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "null mapping"))?;
        let region = MappedFile {
            mmap,
            base,
            path: path.to_path_buf(),
            layout,
        };
        // Pairs with the creator's release store.
        if region.ready_flag().load(Ordering::Acquire) == 0 {
            return Err(MapError::FormatMismatch("file is not initialised".into()));
        }

        tracing::info!(
            path = %path.display(),
            segments = layout.segment_count,
            entries_per_segment = layout.entries_per_segment,
            "opened shared map file"
        );
        Ok(region)
    }

    /// Create if absent, otherwise open and require the same layout.
    pub fn open_or_create(path: &Path, layout: &Layout, init_wait: Duration) -> Result<Self> {
        match Self::create(path, layout) {
            Err(MapError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                let region = Self::open(path, init_wait)?;
                if region.layout != *layout {
                    return Err(MapError::FormatMismatch(format!(
                        "existing file layout {:?} differs from requested {:?}",
                        region.layout, layout
                    )));
                }
                Ok(region)
            }
            other => other,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub fn header(&self) -> &Header {
        unsafe { &*(self.base.as_ptr() as *const Header) }
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }

    fn ready_flag(&self) -> &AtomicU32 {
        unsafe { &*(self.base.as_ptr().add(READY_OFFSET) as *const AtomicU32) }
    }
}

/// Read the header with plain file IO until the creator has published it.
fn wait_for_header(file: &mut File, init_wait: Duration) -> Result<Header> {
    let deadline = Instant::now() + init_wait;
    let mut buf = [0u8; HEADER_SIZE];

    loop {
        if file.metadata()?.len() >= HEADER_SIZE as u64 {
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            let header: Header = bytemuck::pod_read_unaligned(&buf);
            if header.magic != MAGIC && header.magic != [0; 8] {
                return Err(MapError::FormatMismatch("bad magic".into()));
            }
            if header.magic == MAGIC && header.ready != 0 {
                return Ok(header);
            }
        }
        if Instant::now() >= deadline {
            return Err(MapError::FormatMismatch(format!(
                "file was not initialised within {init_wait:?}"
            )));
        }
        std::thread::sleep(INIT_POLL);
    }
}
