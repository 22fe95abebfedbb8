//! Memory-mapped file cache.
//!
//! Files are mapped read-only on first request and shared between every
//! connection serving them through `Arc<CacheEntry>`. The mapping is released
//! when the last `Arc` goes away, whether that is the cache table (after
//! eviction) or an in-flight response.
//!
//! ```text
//!   get_file(path)
//!       │
//!       ├─ hit ──► stat(path) == snapshot? ──yes──► move to MRU, return
//!       │                     │
//!       │                     no ──► drop stale entry ─┐
//!       │                                              ▼
//!       └─ miss ─────────────────────────────► open + fstat + mmap
//!                                                      │
//!                                  insert MRU, evict LRU while over limits
//! ```
//!
//! One mutex guards the whole operation; callers never observe a
//! half-updated table.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, Metadata};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

/// `S_IROTH`: only world-readable files are served.
const WORLD_READABLE: u32 = 0o004;

/// The parts of `stat(2)` that decide whether a cached mapping is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mtime: (i64, i64),
    pub atime: (i64, i64),
    pub ctime: (i64, i64),
}

impl FileStat {
    fn from_metadata(meta: &Metadata) -> Self {
        Self {
            size: meta.size(),
            mtime: (meta.mtime(), meta.mtime_nsec()),
            atime: (meta.atime(), meta.atime_nsec()),
            ctime: (meta.ctime(), meta.ctime_nsec()),
        }
    }
}

/// A read-only private mapping. Zero-length files have no mapping.
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the region is PROT_READ and never mutated after creation.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn map(file: &File, len: usize) -> Option<Self> {
        if len == 0 {
            return Some(Self {
                ptr: NonNull::dangling(),
                len: 0,
            });
        }
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(addr as *mut u8).map(|ptr| Self { ptr, len })
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        // Safety: ptr is valid for len bytes until drop (or dangling with len 0).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            }
        }
    }
}

/// One cached file. Immutable for its whole lifetime.
pub struct CacheEntry {
    path: PathBuf,
    stat: FileStat,
    map: Mapping,
}

impl CacheEntry {
    /// Open, stat and map `path`. `None` for anything that cannot be served.
    fn load(path: &Path) -> Option<Self> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                trace!(path = %path.display(), error = %e, "cache: open failed");
                return None;
            }
        };
        let meta = file.metadata().ok()?;
        if !meta.is_file() || meta.mode() & WORLD_READABLE == 0 {
            trace!(path = %path.display(), "cache: not a world-readable regular file");
            return None;
        }
        let len = usize::try_from(meta.len()).ok()?;
        let Some(map) = Mapping::map(&file, len) else {
            trace!(path = %path.display(), "cache: mmap failed");
            return None;
        };
        // mmap(2) may bump atime; snapshot what later freshness checks will see
        let stat = FileStat::from_metadata(&file.metadata().ok()?);
        if stat.size != meta.len() {
            trace!(path = %path.display(), "cache: file changed while mapping");
            return None;
        }
        Some(Self {
            path: path.to_path_buf(),
            stat,
            map,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file's bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.map.as_slice()
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.stat.size
    }

    pub fn stat(&self) -> &FileStat {
        &self.stat
    }

    /// Still matches what is on disk (size and all three timestamps).
    fn is_fresh(&self) -> bool {
        match std::fs::metadata(&self.path) {
            Ok(meta) => FileStat::from_metadata(&meta) == self.stat,
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("path", &self.path)
            .field("size", &self.stat.size)
            .finish()
    }
}

struct Resident {
    entry: Arc<CacheEntry>,
    stamp: u64,
}

#[derive(Default)]
struct CacheInner {
    table: HashMap<PathBuf, Resident>,
    /// stamp → path; smallest stamp is least recently used.
    order: BTreeMap<u64, PathBuf>,
    next_stamp: u64,
    current_bytes: u64,
}

impl CacheInner {
    fn stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    fn remove(&mut self, path: &Path) {
        if let Some(resident) = self.table.remove(path) {
            self.order.remove(&resident.stamp);
            self.current_bytes -= resident.entry.size();
        }
    }
}

/// LRU cache of mapped files bounded by total bytes and item count.
pub struct FileCache {
    max_bytes: u64,
    max_items: usize,
    inner: Mutex<CacheInner>,
}

impl FileCache {
    pub fn new(max_bytes: u64, max_items: usize) -> Self {
        Self {
            max_bytes,
            max_items,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Shared handle to the mapped contents of `path`, or `None` when the
    /// file is missing, unreadable, a directory, or cannot be mapped.
    pub fn get_file(&self, path: &Path) -> Option<Arc<CacheEntry>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(resident) = inner.table.get(path) {
            if resident.entry.is_fresh() {
                let entry = Arc::clone(&resident.entry);
                let old = resident.stamp;
                let stamp = inner.stamp();
                inner.order.remove(&old);
                inner.order.insert(stamp, path.to_path_buf());
                if let Some(resident) = inner.table.get_mut(path) {
                    resident.stamp = stamp;
                }
                return Some(entry);
            }
            trace!(path = %path.display(), "cache: stale entry, reloading");
            inner.remove(path);
        }

        let entry = Arc::new(CacheEntry::load(path)?);
        let stamp = inner.stamp();
        inner.current_bytes += entry.size();
        inner.order.insert(stamp, path.to_path_buf());
        inner.table.insert(
            path.to_path_buf(),
            Resident {
                entry: Arc::clone(&entry),
                stamp,
            },
        );
        self.evict(&mut inner);
        Some(entry)
    }

    fn evict(&self, inner: &mut CacheInner) {
        while inner.current_bytes > self.max_bytes || inner.table.len() > self.max_items {
            let Some((_, victim)) = inner.order.pop_first() else {
                break;
            };
            if let Some(resident) = inner.table.remove(&victim) {
                inner.current_bytes -= resident.entry.size();
                trace!(path = %victim.display(), "cache: evicted");
            }
        }
    }

    /// Resident bytes.
    pub fn current_size(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current_bytes
    }

    pub fn item_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .table
            .len()
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }
}
