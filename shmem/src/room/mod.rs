use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::core::{Removal, Segment, SegmentConfig, SegmentGuard};
use crate::errors::{ChatError, Result};
use crate::store::{Message, MessageId, MessageLog, MessageStore, ParticipantId};
use crate::sync::{SharedCondvar, SharedMutex};

pub const MAX_MESSAGE_LEN: usize = 1024;

const PARTICIPANT_COUNTER_KEY: &str = "participant_counter";
const LAST_SPEAKER_KEY: &str = "last_speaker";
const MESSAGE_ID_KEY: &str = "message_id";
const MESSAGES_KEY: &str = "messages";
const SCRATCH_KEY: &str = "message";
const MUTEX_KEY: &str = "mutex";
const CONDITION_KEY: &str = "condition";

/// Buffer a message is composed in before it is appended to the log.
#[repr(C)]
struct Scratch {
    len: usize,
    bytes: [u8; MAX_MESSAGE_LEN],
}

struct SharedState {
    mutex: NonNull<SharedMutex>,
    condition: NonNull<SharedCondvar>,
    participant_counter: NonNull<ParticipantId>,
    last_speaker: NonNull<ParticipantId>,
    message_id: NonNull<MessageId>,
    messages: NonNull<MessageLog>,
    scratch: NonNull<Scratch>,
}

impl SharedState {
    fn locate(segment: &Segment) -> Result<SharedState> {
        Ok(SharedState {
            mutex: segment.find_or_construct_with(MUTEX_KEY, |ptr| unsafe { SharedMutex::init(ptr) })?,
            condition: segment
                .find_or_construct_with(CONDITION_KEY, |ptr| unsafe { SharedCondvar::init(ptr) })?,
            participant_counter: segment.find_or_construct(PARTICIPANT_COUNTER_KEY, 0)?,
            last_speaker: segment.find_or_construct(LAST_SPEAKER_KEY, 0)?,
            message_id: segment.find_or_construct(MESSAGE_ID_KEY, 0)?,
            messages: segment.find_or_construct_with(MESSAGES_KEY, |ptr| unsafe { MessageLog::init(ptr) })?,
            scratch: segment.find_or_construct_with(SCRATCH_KEY, |ptr: *mut Scratch| {
                unsafe { std::ptr::write_bytes(ptr, 0, 1) };
                Ok(())
            })?,
        })
    }
}

/// One participant's handle on the chat segment.
///
/// The shared values are only reachable through `lock()`, which returns a `RoomGuard`
/// holding the cross-process mutex. Dropping the room detaches from the segment.
pub struct ChatRoom {
    state: SharedState,
    me: ParticipantId,
    should_exit: AtomicBool,
    guard: SegmentGuard,
}

// All pointers in `state` target the segment owned by `guard` and are dereferenced only
// while the room mutex is held.
unsafe impl Send for ChatRoom {}
unsafe impl Sync for ChatRoom {}

impl ChatRoom {
    /// Attaches to the segment and takes the next participant id.
    pub fn join(cfg: &SegmentConfig) -> Result<ChatRoom> {
        let guard = SegmentGuard::attach(cfg)?;
        let state = SharedState::locate(guard.segment())?;
        let mut room = ChatRoom {
            state,
            me: 0,
            should_exit: AtomicBool::new(false),
            guard,
        };
        let me = room.lock()?.take_participant_id();
        room.me = me;
        debug!(segment = %cfg.name, participant = room.me, "joined room");
        Ok(room)
    }

    pub fn id(&self) -> ParticipantId {
        self.me
    }

    pub fn segment(&self) -> &Segment {
        self.guard.segment()
    }

    pub fn lock(&self) -> Result<RoomGuard<'_>> {
        unsafe { self.state.mutex.as_ref() }.lock()?;
        Ok(RoomGuard { room: self })
    }

    /// Set once this participant has left; never cleared.
    pub fn should_exit(&self) -> bool {
        self.should_exit.load(Ordering::Acquire)
    }

    pub fn history(&self) -> Result<Vec<Message>> {
        let mut guard = self.lock()?;
        // bound so the store borrow ends before `guard` is dropped
        let messages = guard.store().since(0);
        messages
    }

    pub fn ref_count(&self) -> Result<i32> {
        self.guard.ref_count()
    }

    /// See `SegmentGuard::detach`.
    pub fn detach(&self) -> Result<Option<Removal>> {
        self.guard.detach()
    }
}

/// Proof that the room mutex is held. Unlocks on drop.
pub struct RoomGuard<'a> {
    room: &'a ChatRoom,
}

impl<'a> RoomGuard<'a> {
    pub fn me(&self) -> ParticipantId {
        self.room.me
    }

    pub fn last_speaker(&self) -> ParticipantId {
        unsafe { *self.room.state.last_speaker.as_ptr() }
    }

    /// Id of the most recent insertion, 0 before the first one.
    pub fn latest_id(&self) -> MessageId {
        unsafe { *self.room.state.message_id.as_ptr() }
    }

    pub fn store(&mut self) -> MessageStore<'_> {
        let log = unsafe { &mut *self.room.state.messages.as_ptr() };
        MessageStore::new(log, self.room.segment())
    }

    pub fn should_exit(&self) -> bool {
        self.room.should_exit()
    }

    /// Marks the participant as leaving. Returns false if it already was.
    pub(crate) fn begin_exit(&mut self) -> bool {
        !self.room.should_exit.swap(true, Ordering::AcqRel)
    }

    fn take_participant_id(&mut self) -> ParticipantId {
        let counter = unsafe { &mut *self.room.state.participant_counter.as_ptr() };
        let id = *counter;
        *counter += 1;
        id
    }

    /// Appends `text` as this participant's message under the next id, records this
    /// participant as the last speaker and wakes every waiter.
    pub fn publish(&mut self, text: &str) -> Result<MessageId> {
        let draft = self.draft(text)?;
        let id = self.latest_id() + 1;
        let me = self.me();
        self.store().insert(id, me, draft)?;
        unsafe {
            *self.room.state.message_id.as_ptr() = id;
            *self.room.state.last_speaker.as_ptr() = me;
        }
        self.notify_all()?;
        Ok(id)
    }

    fn draft(&mut self, text: &str) -> Result<&'a str> {
        if text.len() > MAX_MESSAGE_LEN {
            return Err(ChatError::capacity("message", text.len(), MAX_MESSAGE_LEN));
        }
        let scratch = unsafe { &mut *self.room.state.scratch.as_ptr() };
        scratch.bytes[..text.len()].copy_from_slice(text.as_bytes());
        scratch.len = text.len();
        std::str::from_utf8(&scratch.bytes[..scratch.len])
            .map_err(|e| ChatError::Logic(format!("scratch buffer is not UTF-8: {}", e)))
    }

    pub fn notify_all(&self) -> Result<()> {
        unsafe { self.room.state.condition.as_ref() }.notify_all()
    }

    /// Releases the mutex until the next notification. Wakes may be spurious.
    pub fn wait(&mut self) -> Result<()> {
        let state = &self.room.state;
        unsafe { state.condition.as_ref().wait(state.mutex.as_ref()) }
    }
}

impl Drop for RoomGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.room.state.mutex.as_ref() }.unlock() {
            warn!(error = %e, "failed to release the room mutex");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::unique_config;

    #[test]
    fn participants_get_consecutive_ids() -> Result<()> {
        let cfg = unique_config();
        let a = ChatRoom::join(&cfg)?;
        let b = ChatRoom::join(&cfg)?;
        let c = ChatRoom::join(&cfg)?;
        assert_eq!((a.id(), b.id(), c.id()), (0, 1, 2));
        assert_eq!(c.ref_count()?, 3);
        Ok(())
    }

    #[test]
    fn publish_advances_id_and_last_speaker() -> Result<()> {
        let cfg = unique_config();
        let a = ChatRoom::join(&cfg)?;
        let b = ChatRoom::join(&cfg)?;
        assert_eq!(a.lock()?.publish("one")?, 1);
        assert_eq!(b.lock()?.publish("two")?, 2);

        let mut guard = a.lock()?;
        assert_eq!(guard.latest_id(), 2);
        assert_eq!(guard.last_speaker(), b.id());
        assert_eq!(guard.store().lookup(2)?.author, b.id());
        Ok(())
    }

    #[test]
    fn oversized_message_is_rejected_without_consuming_an_id() -> Result<()> {
        let cfg = unique_config();
        let a = ChatRoom::join(&cfg)?;
        let long = "x".repeat(MAX_MESSAGE_LEN + 1);
        let mut guard = a.lock()?;
        assert!(matches!(
            guard.publish(&long),
            Err(ChatError::CapacityExceeded { .. })
        ));
        assert_eq!(guard.latest_id(), 0);
        assert_eq!(guard.publish(&"x".repeat(MAX_MESSAGE_LEN))?, 1);
        Ok(())
    }

    #[test]
    fn dropping_the_last_room_removes_the_segment() -> Result<()> {
        let cfg = unique_config();
        let a = ChatRoom::join(&cfg)?;
        a.lock()?.publish("hello")?;
        drop(a);
        let b = ChatRoom::join(&cfg)?;
        assert_eq!(b.id(), 0);
        assert!(b.history()?.is_empty());
        Ok(())
    }
}
