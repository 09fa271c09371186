use std::io::BufRead;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::room::ChatRoom;
use crate::store::{MessageId, ParticipantId};

pub const DEFAULT_EXIT_SENTINEL: &str = "exit";

pub fn joined_text(id: ParticipantId) -> String {
    format!("participant {} joined", id)
}

pub fn left_text(id: ParticipantId) -> String {
    format!("participant {} left the chat", id)
}

pub fn line_text(id: ParticipantId, line: &str) -> String {
    format!("participant {}: {}", id, line)
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Publishes the "left the chat" message, sets the exit flag and wakes every waiter, all
/// under one acquisition of the room mutex. Returns false if the participant already left.
///
/// The receiver only looks at the exit flag between wakes, so the broadcast happens even if
/// the message could not be stored.
pub fn leave(room: &ChatRoom) -> Result<bool> {
    let mut guard = room.lock()?;
    if !guard.begin_exit() {
        return Ok(false);
    }
    match guard.publish(&left_text(room.id())) {
        Ok(id) => {
            info!(participant = room.id(), message = id, "left the chat");
            Ok(true)
        }
        Err(e) => {
            guard.notify_all()?;
            Err(e)
        }
    }
}

/// Turns input lines into messages for one participant.
pub struct ChatSender {
    room: Arc<ChatRoom>,
    exit_sentinel: String,
}

impl ChatSender {
    pub fn new(room: Arc<ChatRoom>, exit_sentinel: impl Into<String>) -> ChatSender {
        ChatSender {
            room,
            exit_sentinel: exit_sentinel.into(),
        }
    }

    pub fn announce(&self) -> Result<MessageId> {
        let id = self.room.lock()?.publish(&joined_text(self.room.id()))?;
        debug!(participant = self.room.id(), message = id, "announced");
        Ok(id)
    }

    /// Handles one input line. Nothing is published once the participant has left.
    pub fn send_line(&self, line: &str) -> Result<Flow> {
        if line == self.exit_sentinel {
            self.leave()?;
            return Ok(Flow::Exit);
        }
        let mut guard = self.room.lock()?;
        if guard.should_exit() {
            return Ok(Flow::Exit);
        }
        guard.publish(&line_text(self.room.id(), line))?;
        Ok(Flow::Continue)
    }

    pub fn leave(&self) -> Result<bool> {
        leave(&self.room)
    }

    /// Announces the participant, then publishes lines until the exit sentinel. The end of
    /// `input` counts as the sentinel. The mutex is never held while reading.
    ///
    /// Bytes that are not UTF-8 are replaced with U+FFFD rather than ending the input.
    pub fn run<R: BufRead>(&self, mut input: R) -> Result<()> {
        self.announce()?;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if input.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(trim_line_end(&buf));
            if self.send_line(&line)? == Flow::Exit {
                return Ok(());
            }
        }
        if self.leave()? {
            debug!(participant = self.room.id(), "input closed");
        } else {
            warn!(participant = self.room.id(), "input closed after leaving");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::unique_config;
    use std::io::Cursor;

    fn texts(room: &ChatRoom) -> Result<Vec<String>> {
        Ok(room.history()?.into_iter().map(|m| m.text).collect())
    }

    #[test]
    fn message_formats() {
        assert_eq!(joined_text(3), "participant 3 joined");
        assert_eq!(left_text(3), "participant 3 left the chat");
        assert_eq!(line_text(3, "hi"), "participant 3: hi");
    }

    #[test]
    fn run_frames_lines_with_join_and_leave() -> Result<()> {
        let room = Arc::new(ChatRoom::join(&unique_config())?);
        let sender = ChatSender::new(Arc::clone(&room), DEFAULT_EXIT_SENTINEL);
        sender.run(Cursor::new("hello\nworld\nexit\nignored\n"))?;
        assert_eq!(
            texts(&room)?,
            vec![
                "participant 0 joined",
                "participant 0: hello",
                "participant 0: world",
                "participant 0 left the chat",
            ]
        );
        assert!(room.should_exit());
        Ok(())
    }

    #[test]
    fn end_of_input_leaves_the_chat() -> Result<()> {
        let room = Arc::new(ChatRoom::join(&unique_config())?);
        let sender = ChatSender::new(Arc::clone(&room), DEFAULT_EXIT_SENTINEL);
        sender.run(Cursor::new("only line"))?;
        assert_eq!(
            texts(&room)?,
            vec![
                "participant 0 joined",
                "participant 0: only line",
                "participant 0 left the chat",
            ]
        );
        Ok(())
    }

    #[test]
    fn leaving_twice_publishes_once() -> Result<()> {
        let room = Arc::new(ChatRoom::join(&unique_config())?);
        let sender = ChatSender::new(Arc::clone(&room), "/quit");
        sender.announce()?;
        assert_eq!(sender.send_line("/quit")?, Flow::Exit);
        assert!(!sender.leave()?);
        assert_eq!(sender.send_line("too late")?, Flow::Exit);
        assert_eq!(
            texts(&room)?,
            vec!["participant 0 joined", "participant 0 left the chat"]
        );
        Ok(())
    }

    #[test]
    fn custom_sentinel_lets_exit_through() -> Result<()> {
        let room = Arc::new(ChatRoom::join(&unique_config())?);
        let sender = ChatSender::new(Arc::clone(&room), "/quit");
        sender.run(Cursor::new("exit\n/quit\n"))?;
        assert_eq!(
            texts(&room)?,
            vec![
                "participant 0 joined",
                "participant 0: exit",
                "participant 0 left the chat",
            ]
        );
        Ok(())
    }

    #[test]
    fn invalid_utf8_does_not_end_the_input() -> Result<()> {
        let room = Arc::new(ChatRoom::join(&unique_config())?);
        let sender = ChatSender::new(Arc::clone(&room), DEFAULT_EXIT_SENTINEL);
        sender.run(Cursor::new(&b"ok\n\xff\xfe bad\nafter\r\nexit\r\n"[..]))?;
        assert_eq!(
            texts(&room)?,
            vec![
                "participant 0 joined",
                "participant 0: ok",
                "participant 0: \u{fffd}\u{fffd} bad",
                "participant 0: after",
                "participant 0 left the chat",
            ]
        );
        Ok(())
    }
}
