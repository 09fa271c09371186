use std::io;

use thiserror::Error;

use crate::store::MessageId;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("shared segment `{name}` is unavailable: {reason}")]
    SegmentUnavailable { name: String, reason: String },
    #[error("capacity exceeded: {what} needs {requested} bytes, {available} available")]
    CapacityExceeded {
        what: String,
        requested: usize,
        available: usize,
    },
    #[error("message {0} not found")]
    NotFound(MessageId),
    // raw_sync hands back `Box<dyn Error>` which is neither Send nor Sync.
    #[error("lock error: {0}")]
    Lock(String),
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("logic error: {0}")]
    Logic(String),
}

impl ChatError {
    pub(crate) fn lock(err: Box<dyn std::error::Error>) -> ChatError {
        ChatError::Lock(err.to_string())
    }

    /// Maps a pthread-style return code (0 on success, errno otherwise).
    pub(crate) fn check(op: &'static str, rc: libc::c_int) -> Result<()> {
        if rc == 0 {
            Ok(())
        } else {
            Err(ChatError::Os {
                op,
                source: io::Error::from_raw_os_error(rc),
            })
        }
    }

    pub(crate) fn capacity(what: impl Into<String>, requested: usize, available: usize) -> ChatError {
        ChatError::CapacityExceeded {
            what: what.into(),
            requested,
            available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_maps_errno() {
        assert!(ChatError::check("pthread_mutex_lock", 0).is_ok());
        match ChatError::check("pthread_mutex_lock", libc::EINVAL) {
            Err(ChatError::Os { op, source }) => {
                assert_eq!(op, "pthread_mutex_lock");
                assert_eq!(source.raw_os_error(), Some(libc::EINVAL));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn capacity_message_names_the_object() {
        let err = ChatError::capacity("message text", 10, 3);
        assert_eq!(
            err.to_string(),
            "capacity exceeded: message text needs 10 bytes, 3 available"
        );
    }
}
