use std::ptr;

use crate::core::Segment;
use crate::errors::{ChatError, Result};

pub type MessageId = u64;
pub type ParticipantId = u32;

pub const MAX_MESSAGES: usize = 512;

#[repr(C)]
#[derive(Default, Copy, Clone, Debug)]
struct Entry {
    id: MessageId,
    author: ParticipantId,
    len: u32,
    // Offset of the text bytes from the start of the segment.
    offset: u64,
}

/// Index of the message log, stored in the segment as one named object.
/// The text of each entry lives in the segment's free space.
#[repr(C)]
pub struct MessageLog {
    len: usize,
    entries: [Entry; MAX_MESSAGES],
}

impl MessageLog {
    /// # Safety
    /// `ptr` must be valid for writes of a `MessageLog`.
    pub(crate) unsafe fn init(ptr: *mut MessageLog) -> Result<()> {
        // all-zero is an empty log
        ptr::write_bytes(ptr, 0, 1);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub author: ParticipantId,
    pub text: String,
}

/// Append-only view of the log. Only handed out by `RoomGuard::store`, i.e. while the room
/// mutex is held.
pub struct MessageStore<'a> {
    log: &'a mut MessageLog,
    segment: &'a Segment,
}

impl<'a> MessageStore<'a> {
    pub(crate) fn new(log: &'a mut MessageLog, segment: &'a Segment) -> MessageStore<'a> {
        MessageStore { log, segment }
    }

    #[inline]
    fn entries(&self) -> &[Entry] {
        &self.log.entries[..self.log.len]
    }

    pub fn len(&self) -> usize {
        self.log.len
    }

    pub fn is_empty(&self) -> bool {
        self.log.len == 0
    }

    pub fn latest(&self) -> Option<MessageId> {
        self.entries().last().map(|e| e.id)
    }

    /// Appends `text` under `id`. Ids have to grow strictly; an existing entry is never
    /// overwritten.
    pub fn insert(&mut self, id: MessageId, author: ParticipantId, text: &str) -> Result<()> {
        if let Some(latest) = self.latest() {
            if id <= latest {
                return Err(ChatError::Logic(format!(
                    "message id {} does not follow the latest id {}",
                    id, latest
                )));
            }
        }
        if self.log.len >= MAX_MESSAGES {
            return Err(ChatError::capacity(
                "message index",
                std::mem::size_of::<Entry>(),
                0,
            ));
        }
        let offset = self.segment.store_bytes(text.as_bytes(), "message text")?;
        self.log.entries[self.log.len] = Entry {
            id,
            author,
            len: text.len() as u32,
            offset: offset as u64,
        };
        self.log.len += 1;
        Ok(())
    }

    pub fn lookup(&self, id: MessageId) -> Result<Message> {
        let entries = self.entries();
        let entry = entries
            .binary_search_by_key(&id, |e| e.id)
            .map(|i| entries[i])
            .map_err(|_| ChatError::NotFound(id))?;
        self.read(&entry)
    }

    /// Every message with an id greater than `after`, oldest first.
    pub fn since(&self, after: MessageId) -> Result<Vec<Message>> {
        let entries = self.entries();
        let start = entries.partition_point(|e| e.id <= after);
        entries[start..].iter().map(|e| self.read(e)).collect()
    }

    fn read(&self, entry: &Entry) -> Result<Message> {
        let bytes = self
            .segment
            .load_bytes(entry.offset as usize, entry.len as usize)?;
        Ok(Message {
            id: entry.id,
            author: entry.author,
            text: String::from_utf8_lossy(bytes).into_owned(),
        })
    }
}
