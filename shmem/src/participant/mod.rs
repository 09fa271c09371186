use std::io::{BufRead, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, error, info, warn};

use crate::core::SegmentConfig;
use crate::errors::{ChatError, Result};
use crate::receiver::ChatReceiver;
use crate::room::ChatRoom;
use crate::sender::{self, ChatSender, DEFAULT_EXIT_SENTINEL};
use crate::store::ParticipantId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub segment: SegmentConfig,
    pub exit_sentinel: String,
    /// Print what was said before joining.
    pub replay_history: bool,
    /// Used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            segment: SegmentConfig::default(),
            exit_sentinel: DEFAULT_EXIT_SENTINEL.to_string(),
            replay_history: true,
            log_level: "warn".to_string(),
        }
    }
}

/// A process taking part in the chat: one room handle shared by a sender thread and a
/// receiver thread.
pub struct Participant {
    room: Arc<ChatRoom>,
    config: ChatConfig,
}

impl Participant {
    pub fn join(config: ChatConfig) -> Result<Participant> {
        let room = Arc::new(ChatRoom::join(&config.segment)?);
        info!(
            segment = %config.segment.name,
            participant = room.id(),
            "joined the chat"
        );
        Ok(Participant { room, config })
    }

    pub fn id(&self) -> ParticipantId {
        self.room.id()
    }

    pub fn room(&self) -> &Arc<ChatRoom> {
        &self.room
    }

    /// Runs the sender on `input` and the receiver on `output` until this participant leaves,
    /// either through the exit sentinel, the end of `input` or a termination signal. Then
    /// detaches from the segment.
    ///
    /// A sender still blocked on `input` after a signal is left behind; it cannot publish
    /// anything once the participant has left.
    pub fn run<R, W>(self, input: R, output: W) -> Result<()>
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        let mut receiver = ChatReceiver::new(Arc::clone(&self.room), self.config.replay_history)?;
        let sender = ChatSender::new(Arc::clone(&self.room), self.config.exit_sentinel.clone());

        let signals = Signals::new([SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
        let signals_handle = signals.handle();
        let signal_thread = spawn_signal_listener(signals, Arc::clone(&self.room))?;

        let receiver_thread = thread::Builder::new()
            .name("receiver".to_string())
            .spawn(move || receiver.run(output))?;
        let sender_thread = thread::Builder::new()
            .name("sender".to_string())
            .spawn(move || {
                let result = sender.run(input);
                if let Err(e) = &result {
                    error!(error = %e, "sender stopped");
                    if let Err(e) = sender.leave() {
                        warn!(error = %e, "failed to leave the chat");
                    }
                }
                result
            })?;

        let received = join(receiver_thread, "receiver");
        if let Err(e) = &received {
            error!(error = %e, "receiver stopped");
            if let Err(e) = sender::leave(&self.room) {
                warn!(error = %e, "failed to leave the chat");
            }
        }

        signals_handle.close();
        let signalled = join(signal_thread, "signal listener");
        if let Err(e) = &signalled {
            error!(error = %e, "signal listener stopped");
        }

        settle(&self.room, sender_thread, received, signalled)
    }
}

/// Returns `Ok(true)` if a signal made the participant leave.
fn spawn_signal_listener(mut signals: Signals, room: Arc<ChatRoom>) -> Result<JoinHandle<Result<bool>>> {
    let handle = thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || match signals.forever().next() {
            Some(signal) => {
                info!(signal, participant = room.id(), "signal received, leaving the chat");
                sender::leave(&room)
            }
            None => Ok(false),
        })?;
    Ok(handle)
}

/// Collects the sender's result, detaches, then reports the first failure.
///
/// Unless the receiver failed or a signal made the participant leave, the sender is the one
/// that left and is about to return, so it is joined. Otherwise it may be blocked on input
/// for good and is only joined if it already finished.
fn settle(
    room: &ChatRoom,
    sender_thread: JoinHandle<Result<()>>,
    received: Result<()>,
    signalled: Result<bool>,
) -> Result<()> {
    let sender_left = received.is_ok() && matches!(signalled, Ok(false));
    let sent = if sender_left || sender_thread.is_finished() {
        join(sender_thread, "sender")
    } else {
        debug!("sender is still blocked on input");
        Ok(())
    };

    let detached = room.detach();
    received?;
    sent?;
    signalled?;
    detached?;
    Ok(())
}

fn join<T>(handle: JoinHandle<Result<T>>, name: &str) -> Result<T> {
    handle
        .join()
        .map_err(|_| ChatError::Logic(format!("{} thread panicked", name)))?
}
