//! Peer sessions: a bidirectional, ordered stream of replication messages.
//!
//! The broker is written against [`PeerSession`]. Framing, encoding and
//! encryption belong to the implementation. [`ChannelSession`] is the
//! in-process implementation backed by tokio mpsc channels.

use crate::error::{BrokerError, Result};
use crate::message::ReplMessage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex, Notify};

/// A connection to one remote server.
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Send one message. Fails once the session is closed.
    async fn send(&self, msg: ReplMessage) -> Result<()>;

    /// Receive the next message, or `None` when the remote end closed.
    async fn recv(&self) -> Result<Option<ReplMessage>>;

    /// Close the session in both directions.
    async fn close(&self);

    /// Physical address of the remote end.
    fn remote_addr(&self) -> &str;
}

#[derive(Debug, Default)]
struct SessionStatsInner {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    send_errors: AtomicU64,
}

/// Counters for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Messages handed to the channel.
    pub messages_sent: u64,
    /// Messages taken from the channel.
    pub messages_received: u64,
    /// Sends that failed because the session was closed.
    pub send_errors: u64,
}

/// In-process session built on a pair of mpsc channels.
pub struct ChannelSession {
    remote_addr: String,
    sender: Mutex<Option<mpsc::Sender<ReplMessage>>>,
    receiver: Mutex<mpsc::Receiver<ReplMessage>>,
    closed: AtomicBool,
    close_notify: Notify,
    stats: SessionStatsInner,
}

impl ChannelSession {
    /// Create two connected endpoints.
    ///
    /// The first endpoint lives at `a_addr` and sees `b_addr` as its remote
    /// address, and the other way around.
    pub fn pair(a_addr: &str, b_addr: &str, capacity: usize) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(capacity.max(1));
        let (tx_b, rx_b) = mpsc::channel(capacity.max(1));

        let a = Self {
            remote_addr: b_addr.to_string(),
            sender: Mutex::new(Some(tx_a)),
            receiver: Mutex::new(rx_b),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            stats: SessionStatsInner::default(),
        };
        let b = Self {
            remote_addr: a_addr.to_string(),
            sender: Mutex::new(Some(tx_b)),
            receiver: Mutex::new(rx_a),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            stats: SessionStatsInner::default(),
        };
        (a, b)
    }

    /// Snapshot of the session counters.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            send_errors: self.stats.send_errors.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl PeerSession for ChannelSession {
    async fn send(&self, msg: ReplMessage) -> Result<()> {
        let sender = self.sender.lock().await.clone();
        let Some(sender) = sender else {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(BrokerError::session("session is closed"));
        };
        if sender.send(msg).await.is_err() {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(BrokerError::session(format!(
                "connection to {} lost",
                self.remote_addr
            )));
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn recv(&self) -> Result<Option<ReplMessage>> {
        let mut receiver = self.receiver.lock().await;
        let closed = self.close_notify.notified();
        if self.closed.load(Ordering::Acquire) {
            receiver.close();
            return Ok(None);
        }
        tokio::select! {
            msg = receiver.recv() => {
                if msg.is_some() {
                    self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                }
                Ok(msg)
            }
            _ = closed => {
                receiver.close();
                Ok(None)
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.sender.lock().await.take();
        if let Ok(mut receiver) = self.receiver.try_lock() {
            receiver.close();
        }
        self.close_notify.notify_waiters();
    }

    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }
}
