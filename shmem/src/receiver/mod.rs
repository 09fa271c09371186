use std::io::Write;
use std::sync::Arc;

use tracing::debug;

use crate::errors::{ChatError, Result};
use crate::room::ChatRoom;
use crate::store::{Message, MessageId};

#[derive(Debug, Default)]
pub struct Batch {
    pub messages: Vec<Message>,
    pub exiting: bool,
}

/// Waits for insertions and collects the ones written by other participants.
///
/// The receiver remembers the last id it handled, so every wake yields exactly the ids
/// inserted since, even when several senders got the mutex before it woke up.
pub struct ChatReceiver {
    room: Arc<ChatRoom>,
    cursor: MessageId,
}

impl ChatReceiver {
    /// With `replay_history` the first batch also contains what was said before joining.
    pub fn new(room: Arc<ChatRoom>, replay_history: bool) -> Result<ChatReceiver> {
        let cursor = if replay_history {
            0
        } else {
            room.lock()?.latest_id()
        };
        Ok(ChatReceiver { room, cursor })
    }

    pub fn cursor(&self) -> MessageId {
        self.cursor
    }

    /// Blocks until something was inserted past the cursor or the participant is leaving.
    pub fn next_batch(&mut self) -> Result<Batch> {
        let mut guard = self.room.lock()?;
        while guard.latest_id() <= self.cursor && !guard.should_exit() {
            guard.wait()?;
        }
        let latest = guard.latest_id();
        let me = guard.me();
        let store = guard.store();
        let mut messages = Vec::new();
        for id in self.cursor + 1..=latest {
            match store.lookup(id) {
                Ok(message) if message.author != me => messages.push(message),
                Ok(_) => {}
                Err(ChatError::NotFound(id)) => debug!(message = id, "skipping missing message"),
                Err(e) => return Err(e),
            }
        }
        self.cursor = latest;
        Ok(Batch {
            messages,
            exiting: guard.should_exit(),
        })
    }

    /// Prints one line per message until the participant leaves.
    pub fn run<W: Write>(&mut self, mut out: W) -> Result<()> {
        loop {
            let batch = self.next_batch()?;
            for message in &batch.messages {
                writeln!(out, "{}", message.text)?;
            }
            out.flush()?;
            if batch.exiting {
                debug!(participant = self.room.id(), "receiver stopped");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::{leave, ChatSender, DEFAULT_EXIT_SENTINEL};
    use crate::tests::unique_config;
    use std::thread;

    fn texts(batch: &Batch) -> Vec<&str> {
        batch.messages.iter().map(|m| m.text.as_str()).collect()
    }

    #[test]
    fn own_messages_are_not_echoed() -> Result<()> {
        let cfg = unique_config();
        let a = Arc::new(ChatRoom::join(&cfg)?);
        let b = Arc::new(ChatRoom::join(&cfg)?);
        let mut a_receiver = ChatReceiver::new(Arc::clone(&a), false)?;

        a.lock()?.publish("from a")?;
        b.lock()?.publish("from b")?;

        let batch = a_receiver.next_batch()?;
        assert_eq!(texts(&batch), vec!["from b"]);
        assert!(!batch.exiting);
        assert_eq!(a_receiver.cursor(), 2);
        Ok(())
    }

    #[test]
    fn replay_includes_earlier_messages_from_others() -> Result<()> {
        let cfg = unique_config();
        let a = Arc::new(ChatRoom::join(&cfg)?);
        ChatSender::new(Arc::clone(&a), DEFAULT_EXIT_SENTINEL).announce()?;
        let b = Arc::new(ChatRoom::join(&cfg)?);
        ChatSender::new(Arc::clone(&b), DEFAULT_EXIT_SENTINEL).announce()?;

        let mut replaying = ChatReceiver::new(Arc::clone(&b), true)?;
        assert_eq!(texts(&replaying.next_batch()?), vec!["participant 0 joined"]);

        let fresh = ChatReceiver::new(Arc::clone(&b), false)?;
        assert_eq!(fresh.cursor(), 2);
        Ok(())
    }

    #[test]
    fn leaving_releases_a_waiting_receiver() -> Result<()> {
        let cfg = unique_config();
        let a = Arc::new(ChatRoom::join(&cfg)?);
        let mut receiver = ChatReceiver::new(Arc::clone(&a), false)?;
        let waiting = thread::spawn(move || receiver.next_batch());

        assert!(leave(&a)?);
        let batch = waiting.join().expect("receiver panicked")?;
        assert!(batch.exiting);
        // our own "left the chat" is not echoed
        assert!(batch.messages.is_empty());
        Ok(())
    }

    #[test]
    fn run_writes_one_line_per_message() -> Result<()> {
        let cfg = unique_config();
        let a = Arc::new(ChatRoom::join(&cfg)?);
        let b = Arc::new(ChatRoom::join(&cfg)?);
        let mut receiver = ChatReceiver::new(Arc::clone(&a), false)?;

        b.lock()?.publish("participant 1: one")?;
        b.lock()?.publish("participant 1: two")?;
        leave(&a)?;

        let mut out = Vec::new();
        receiver.run(&mut out)?;
        assert_eq!(
            String::from_utf8_lossy(&out),
            "participant 1: one\nparticipant 1: two\n"
        );
        Ok(())
    }
}
