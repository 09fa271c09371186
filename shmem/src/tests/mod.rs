use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

use shared_memory::ShmemConf;

use crate::core::{SegmentConfig, DEFAULT_CAPACITY};


/// A segment name no other test (or test run) uses.
pub(crate) fn unique_config() -> SegmentConfig {
    static SEGMENT_COUNTER: AtomicUsize = AtomicUsize::new(0);
    SegmentConfig {
        name: format!(
            "/shmem-chat-test-{}-{}",
            process::id(),
            SEGMENT_COUNTER.fetch_add(1, Ordering::SeqCst)
        ),
        capacity: DEFAULT_CAPACITY,
    }
}

pub(crate) fn segment_exists(name: &str) -> bool {
    ShmemConf::new().os_id(name).open().is_ok()
}
