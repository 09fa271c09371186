use std::ffi::CString;
use std::io;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use raw_sync::locks::{LockImpl, LockInit, Mutex};
use serde_derive::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, info};

use crate::errors::{ChatError, Result};

mod guard;

pub use guard::SegmentGuard;

pub const DEFAULT_SEGMENT_NAME: &str = "/shmem-chat";
pub const DEFAULT_CAPACITY: usize = 65_536;
pub const MAX_OBJECTS: usize = 16;
pub const MAX_KEY_LEN: usize = 32;

// Written last by the creator; joiners wait for it before touching the table lock.
const SEGMENT_READY: u32 = 0x6368_6174;
const HEADER_SIZE: usize = 64;
pub(crate) const ATTACH_ATTEMPTS: usize = 100;
pub(crate) const RETRY_DELAY: Duration = Duration::from_millis(10);
const READY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    pub name: String,
    pub capacity: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        SegmentConfig {
            name: DEFAULT_SEGMENT_NAME.to_string(),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ObjectEntry {
    key: [u8; MAX_KEY_LEN],
    key_len: usize,
    // Offset from the start of the segment.
    offset: usize,
    size: usize,
}

const EMPTY_ENTRY: ObjectEntry = ObjectEntry {
    key: [0; MAX_KEY_LEN],
    key_len: 0,
    offset: 0,
    size: 0,
};

impl ObjectEntry {
    #[inline]
    fn key(&self) -> &[u8] {
        &self.key[..self.key_len]
    }
}

/// Directory of named objects plus the bump pointer of the segment's free space.
/// Only ever touched through `Segment::with_table`.
#[repr(C)]
pub(crate) struct ObjectTable {
    pub(crate) removed: u32,
    len: usize,
    heap_top: usize,
    entries: [ObjectEntry; MAX_OBJECTS],
}

impl ObjectTable {
    fn find(&self, key: &[u8]) -> Option<&ObjectEntry> {
        self.entries[..self.len].iter().find(|e| e.key() == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    lock_offset: usize,
    table_offset: usize,
    heap_offset: usize,
}

impl Layout {
    fn of(base: *mut u8) -> Layout {
        let lock_offset = HEADER_SIZE;
        let lock_size = Mutex::size_of(Some(unsafe { base.add(lock_offset) }));
        let table_offset = align_up(lock_offset + lock_size, mem::align_of::<ObjectTable>());
        Layout {
            lock_offset,
            table_offset,
            heap_offset: table_offset + mem::size_of::<ObjectTable>(),
        }
    }
}

#[inline]
fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    // Someone else unlinked the name first.
    AlreadyGone,
}

/// Unlinks a named segment. Removing a name that no longer exists is not an error.
pub fn remove_segment(name: &str) -> Result<Removal> {
    let c_name = CString::new(name)
        .map_err(|_| ChatError::Logic(format!("segment name `{}` contains a NUL byte", name)))?;
    if unsafe { libc::shm_unlink(c_name.as_ptr()) } == 0 {
        debug!(segment = name, "segment unlinked");
        return Ok(Removal::Removed);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENOENT) {
        debug!(segment = name, "segment already unlinked");
        Ok(Removal::AlreadyGone)
    } else {
        Err(ChatError::Os {
            op: "shm_unlink",
            source: err,
        })
    }
}

fn unavailable(name: &str, reason: impl ToString) -> ChatError {
    ChatError::SegmentUnavailable {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// One mapping of the named chat segment.
pub struct Segment {
    // Declared before `shmem` so the lock handle goes away while the mapping is still there.
    table_lock: Box<dyn LockImpl>,
    shmem: Shmem,
    name: String,
    layout: Layout,
}

// The mapping is plain memory; every mutation of it goes through a process-shared lock.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Opens the named segment, creating and initializing it if it doesn't exist yet.
    pub fn open_or_create(cfg: &SegmentConfig) -> Result<Segment> {
        let mut last_error: Option<ShmemError> = None;
        for _ in 0..ATTACH_ATTEMPTS {
            match ShmemConf::new().os_id(&cfg.name).size(cfg.capacity).create() {
                Ok(shmem) => return Segment::initialize(&cfg.name, shmem),
                Err(ShmemError::MappingIdExists) => {}
                Err(e) => return Err(unavailable(&cfg.name, e)),
            }
            match ShmemConf::new().os_id(&cfg.name).open() {
                Ok(shmem) => return Segment::join(&cfg.name, shmem),
                // Either the creator hasn't sized it yet or it was unlinked in between.
                Err(e) => {
                    debug!(segment = %cfg.name, error = %e, "segment not ready, retrying");
                    last_error = Some(e);
                    thread::sleep(RETRY_DELAY);
                }
            }
        }
        Err(unavailable(
            &cfg.name,
            last_error.map_or_else(|| "gave up".to_string(), |e| e.to_string()),
        ))
    }

    fn initialize(name: &str, mut shmem: Shmem) -> Result<Segment> {
        let base = shmem.as_ptr();
        let layout = Layout::of(base);
        // Until `set_owner(false)` below, an early return drops `shmem` and unlinks the name.
        if shmem.len() < layout.heap_offset {
            return Err(ChatError::capacity("segment header", layout.heap_offset, shmem.len()));
        }
        let (table_lock, _) = unsafe {
            Mutex::new(base.add(layout.lock_offset), base.add(layout.table_offset))
        }
        .map_err(ChatError::lock)?;
        unsafe {
            ptr::write(
                base.add(layout.table_offset) as *mut ObjectTable,
                ObjectTable {
                    removed: 0,
                    len: 0,
                    heap_top: layout.heap_offset,
                    entries: [EMPTY_ENTRY; MAX_OBJECTS],
                },
            );
        }
        shmem.set_owner(false);
        ready_flag(base).store(SEGMENT_READY, Ordering::Release);
        info!(segment = name, size = shmem.len(), "created segment");
        Ok(Segment {
            table_lock,
            shmem,
            name: name.to_string(),
            layout,
        })
    }

    fn join(name: &str, mut shmem: Shmem) -> Result<Segment> {
        shmem.set_owner(false);
        let base = shmem.as_ptr();
        if shmem.len() < HEADER_SIZE {
            return Err(unavailable(name, "mapping is smaller than the segment header"));
        }
        let deadline = Instant::now() + READY_TIMEOUT;
        while ready_flag(base).load(Ordering::Acquire) != SEGMENT_READY {
            if Instant::now() > deadline {
                return Err(unavailable(name, "segment was never initialized"));
            }
            thread::sleep(Duration::from_millis(1));
        }
        let layout = Layout::of(base);
        if shmem.len() < layout.heap_offset {
            return Err(unavailable(name, "mapping is smaller than the segment header"));
        }
        let (table_lock, _) = unsafe {
            Mutex::from_existing(base.add(layout.lock_offset), base.add(layout.table_offset))
        }
        .map_err(ChatError::lock)?;
        debug!(segment = name, size = shmem.len(), "opened segment");
        Ok(Segment {
            table_lock,
            shmem,
            name: name.to_string(),
            layout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.shmem.len()
    }

    /// Bytes handed out so far, header included.
    pub fn used(&self) -> Result<usize> {
        self.with_table(|table| Ok(table.heap_top))
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    pub(crate) fn with_table<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut ObjectTable) -> Result<R>,
    {
        let guard = self.table_lock.lock().map_err(ChatError::lock)?;
        let table = unsafe { &mut *(*guard as *mut ObjectTable) };
        f(table)
    }

    /// Returns the object stored under `key`, constructing it with `initial` if it is absent.
    pub fn find_or_construct<T: Copy>(&self, key: &str, initial: T) -> Result<NonNull<T>> {
        self.find_or_construct_with(key, |ptr: *mut T| {
            unsafe { ptr.write(initial) };
            Ok(())
        })
    }

    /// Like `find_or_construct` for objects that have to be initialized in place.
    /// `init` runs at most once per segment, under the object-table lock.
    pub fn find_or_construct_with<T, F>(&self, key: &str, init: F) -> Result<NonNull<T>>
    where
        F: FnOnce(*mut T) -> Result<()>,
    {
        self.with_table(|table| self.construct_locked(table, key, init))
    }

    pub(crate) fn construct_locked<T, F>(
        &self,
        table: &mut ObjectTable,
        key: &str,
        init: F,
    ) -> Result<NonNull<T>>
    where
        F: FnOnce(*mut T) -> Result<()>,
    {
        let key_bytes = key.as_bytes();
        if key_bytes.is_empty() || key_bytes.len() > MAX_KEY_LEN {
            return Err(ChatError::Logic(format!(
                "object key `{}` must be 1 to {} bytes",
                key, MAX_KEY_LEN
            )));
        }
        let size = mem::size_of::<T>();
        if let Some(entry) = table.find(key_bytes) {
            if entry.size != size {
                return Err(ChatError::Logic(format!(
                    "object `{}` has size {}, expected {}",
                    key, entry.size, size
                )));
            }
            return self.object_at(entry.offset);
        }
        if table.len >= MAX_OBJECTS {
            return Err(ChatError::capacity(
                format!("object table entry for `{}`", key),
                mem::size_of::<ObjectEntry>(),
                0,
            ));
        }
        let offset = self.reserve(table, size, mem::align_of::<T>(), key)?;
        let object = self.object_at::<T>(offset)?;
        init(object.as_ptr())?;

        let mut entry = EMPTY_ENTRY;
        entry.key[..key_bytes.len()].copy_from_slice(key_bytes);
        entry.key_len = key_bytes.len();
        entry.offset = offset;
        entry.size = size;
        table.entries[table.len] = entry;
        table.len += 1;
        table.heap_top = offset + size;
        debug!(segment = %self.name, key, offset, size, "constructed shared object");
        Ok(object)
    }

    fn reserve(&self, table: &ObjectTable, size: usize, align: usize, what: &str) -> Result<usize> {
        let offset = align_up(table.heap_top, align);
        match offset.checked_add(size) {
            Some(end) if end <= self.shmem.len() => Ok(offset),
            _ => Err(ChatError::capacity(
                what,
                size,
                self.shmem.len().saturating_sub(table.heap_top),
            )),
        }
    }

    fn object_at<T>(&self, offset: usize) -> Result<NonNull<T>> {
        if offset < self.layout.heap_offset
            || offset + mem::size_of::<T>() > self.shmem.len()
            || offset % mem::align_of::<T>() != 0
        {
            return Err(ChatError::Logic(format!("object offset {} is out of bounds", offset)));
        }
        NonNull::new(unsafe { self.base().add(offset) } as *mut T)
            .ok_or_else(|| ChatError::Logic("null segment mapping".to_string()))
    }

    /// Copies `data` into fresh space at the end of the segment and returns its offset.
    pub(crate) fn store_bytes(&self, data: &[u8], what: &str) -> Result<usize> {
        self.with_table(|table| {
            let offset = self.reserve(table, data.len(), 1, what)?;
            unsafe {
                ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(offset), data.len());
            }
            table.heap_top = offset + data.len();
            Ok(offset)
        })
    }

    /// Bytes previously written by `store_bytes`; those are never modified again.
    pub(crate) fn load_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        match offset.checked_add(len) {
            Some(end) if offset >= self.layout.heap_offset && end <= self.shmem.len() => {
                Ok(unsafe { slice::from_raw_parts(self.base().add(offset), len) })
            }
            _ => Err(ChatError::Logic(format!(
                "byte range {}+{} is outside the segment",
                offset, len
            ))),
        }
    }
}

#[inline]
fn ready_flag<'a>(base: *mut u8) -> &'a AtomicU32 {
    unsafe { &*(base as *const AtomicU32) }
}
