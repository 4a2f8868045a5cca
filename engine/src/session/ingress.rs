//! Cross-thread commands posted onto the session loop.

use super::Stats;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use std::time::Duration;

pub enum Message {
    Stop,
    Pause {
        reason: String,
    },
    Resume,
    Reconnect {
        after: Duration,
    },
    Credentials {
        username: String,
        password: String,
        response: Option<String>,
    },
    Stats {
        response: oneshot::Sender<Stats>,
    },
    SessionToken {
        response: oneshot::Sender<Option<String>>,
    },
}

/// Handle used by the host to drive a running session. All methods post a
/// message onto the session loop; the engine processes them at its next
/// turn.
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }

    /// Stop the session. Idempotent; later calls are ignored by a session
    /// that is already tearing down.
    pub async fn stop(&mut self) {
        let _ = self.sender.send(Message::Stop).await;
    }

    /// Quiesce: suppress retransmits and keepalives but keep all state.
    pub async fn pause(&mut self, reason: impl Into<String>) {
        let _ = self
            .sender
            .send(Message::Pause {
                reason: reason.into(),
            })
            .await;
    }

    /// Leave the quiescent state, restarting timers from now.
    pub async fn resume(&mut self) {
        let _ = self.sender.send(Message::Resume).await;
    }

    /// Tear down and start a fresh session after `after`.
    pub async fn reconnect(&mut self, after: Duration) {
        let _ = self.sender.send(Message::Reconnect { after }).await;
    }

    /// Provide (or replace) credentials used by the key-method-2 exchange.
    pub async fn credentials(
        &mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        response: Option<String>,
    ) {
        let _ = self
            .sender
            .send(Message::Credentials {
                username: username.into(),
                password: password.into(),
                response,
            })
            .await;
    }

    /// Snapshot of session counters and state. Returns None if the session
    /// is gone.
    pub async fn stats(&mut self) -> Option<Stats> {
        let (sender, receiver) = oneshot::channel();
        if self
            .sender
            .send(Message::Stats { response: sender })
            .await
            .is_err()
        {
            return None;
        }
        receiver.await.ok()
    }

    /// The server-issued session token, once one has been pushed.
    pub async fn session_token(&mut self) -> Option<String> {
        let (sender, receiver) = oneshot::channel();
        if self
            .sender
            .send(Message::SessionToken { response: sender })
            .await
            .is_err()
        {
            return None;
        }
        receiver.await.ok().flatten()
    }
}
