use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{debug, info, warn};

use super::{remove_segment, Removal, Segment, SegmentConfig, ATTACH_ATTEMPTS, RETRY_DELAY};
use crate::errors::{ChatError, Result};

const REF_COUNT_KEY: &str = "ref_count";

/// Keeps one participant registered in the segment's reference count.
///
/// Attaching increments the count; `detach` (or dropping the guard) decrements it and
/// unlinks the segment once nobody is left. Both happen under the object-table lock, and a
/// segment that has been torn down is flagged so late openers retry with a fresh one.
pub struct SegmentGuard {
    segment: Segment,
    ref_count: NonNull<i32>,
    detached: AtomicBool,
}

// `ref_count` points into `segment` and is only dereferenced under the object-table lock.
unsafe impl Send for SegmentGuard {}
unsafe impl Sync for SegmentGuard {}

impl SegmentGuard {
    pub fn attach(cfg: &SegmentConfig) -> Result<SegmentGuard> {
        for _ in 0..ATTACH_ATTEMPTS {
            let segment = Segment::open_or_create(cfg)?;
            let registered = segment.with_table(|table| {
                if table.removed != 0 {
                    return Ok(None);
                }
                let ref_count = segment.construct_locked(table, REF_COUNT_KEY, |ptr: *mut i32| {
                    unsafe { ptr.write(0) };
                    Ok(())
                })?;
                let count = unsafe {
                    *ref_count.as_ptr() += 1;
                    *ref_count.as_ptr()
                };
                Ok(Some((ref_count, count)))
            })?;
            match registered {
                Some((ref_count, count)) => {
                    info!(segment = %cfg.name, ref_count = count, "attached");
                    return Ok(SegmentGuard {
                        segment,
                        ref_count,
                        detached: AtomicBool::new(false),
                    });
                }
                None => {
                    debug!(segment = %cfg.name, "segment is being torn down, retrying");
                    drop(segment);
                    thread::sleep(RETRY_DELAY);
                }
            }
        }
        Err(ChatError::SegmentUnavailable {
            name: cfg.name.clone(),
            reason: "segment kept being torn down while attaching".to_string(),
        })
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn ref_count(&self) -> Result<i32> {
        self.segment
            .with_table(|_| Ok(unsafe { *self.ref_count.as_ptr() }))
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Unregisters this participant. Returns how the segment was removed when this was the
    /// last participant, `None` otherwise. Only the first call has any effect.
    pub fn detach(&self) -> Result<Option<Removal>> {
        if self.detached.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }
        let name = self.segment.name();
        let (count, removal) = self.segment.with_table(|table| {
            let ref_count = unsafe { &mut *self.ref_count.as_ptr() };
            *ref_count -= 1;
            if *ref_count > 0 {
                return Ok((*ref_count, None));
            }
            table.removed = 1;
            Ok((*ref_count, Some(remove_segment(name)?)))
        })?;
        match removal {
            Some(removal) => info!(segment = name, ?removal, "last participant detached"),
            None => info!(segment = name, ref_count = count, "detached"),
        }
        Ok(removal)
    }
}

impl Drop for SegmentGuard {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!(segment = self.segment.name(), error = %e, "failed to detach");
        }
    }
}
