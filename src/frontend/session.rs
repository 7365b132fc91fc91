//! Per-connection session state.
//!
//! Each front-end connection gets a bounded outbound queue. Broadcasts
//! overflow by dropping the oldest queued broadcast (they are idempotent;
//! the next refresh recovers the state). Targeted responses are never
//! dropped: the producer waits for space instead.

use log::warn;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;
use uuid::Uuid;

/// Outbound frames buffered per session.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

struct QueuedFrame {
    broadcast: bool,
    text: String,
}

/// Bounded FIFO between the fan-out side and the socket writer.
pub struct OutboundQueue {
    frames: Mutex<VecDeque<QueuedFrame>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a broadcast. On overflow the oldest queued broadcast is
    /// dropped; when only responses are queued the incoming broadcast is
    /// dropped instead.
    pub fn push_broadcast(&self, text: String) {
        let mut frames = self.frames.lock();
        if frames.len() >= self.capacity {
            if let Some(oldest) = frames.iter().position(|f| f.broadcast) {
                frames.remove(oldest);
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        frames.push_back(QueuedFrame {
            broadcast: true,
            text,
        });
        drop(frames);
        self.readable.notify_one();
    }

    /// Enqueue a targeted response, waiting for space when the queue is
    /// full.
    pub async fn push_response(&self, text: String) {
        loop {
            {
                let mut frames = self.frames.lock();
                if frames.len() < self.capacity {
                    frames.push_back(QueuedFrame {
                        broadcast: false,
                        text,
                    });
                    drop(frames);
                    self.readable.notify_one();
                    return;
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            self.writable.notified().await;
        }
    }

    /// Dequeue the next frame; `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<String> {
        loop {
            {
                let mut frames = self.frames.lock();
                if let Some(frame) = frames.pop_front() {
                    drop(frames);
                    self.writable.notify_one();
                    return Some(frame.text);
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.readable.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// One connected front-end.
pub struct Session {
    pub id: Uuid,
    pub remote: String,
    authenticated: AtomicBool,
    queue: Arc<OutboundQueue>,
}

impl Session {
    pub fn new(remote: impl Into<String>, requires_auth: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote: remote.into(),
            authenticated: AtomicBool::new(!requires_auth),
            queue: Arc::new(OutboundQueue::new(OUTBOUND_QUEUE_DEPTH)),
        }
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Check a login attempt against the stored password hash. Success
    /// authenticates the session.
    pub fn authenticate(&self, attempt: &str, stored_hash: &str) -> bool {
        let ok = hash_password(attempt) == stored_hash;
        if ok {
            self.authenticated.store(true, Ordering::SeqCst);
        } else {
            warn!("[Frontend] Failed login from {}", self.remote);
        }
        ok
    }

    pub fn close(&self) {
        self.queue.close();
    }
}

/// Hash a control-plane password for storage and comparison.
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OutboundQueue::new(8);
        queue.push_broadcast("a".into());
        queue.push_response("b".into()).await;
        queue.push_broadcast("c".into());

        assert_eq!(queue.pop().await.as_deref(), Some("a"));
        assert_eq!(queue.pop().await.as_deref(), Some("b"));
        assert_eq!(queue.pop().await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_broadcast() {
        let queue = OutboundQueue::new(3);
        queue.push_broadcast("b1".into());
        queue.push_response("r1".into()).await;
        queue.push_broadcast("b2".into());
        queue.push_broadcast("b3".into()); // full: b1 goes

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().await.as_deref(), Some("r1"));
        assert_eq!(queue.pop().await.as_deref(), Some("b2"));
        assert_eq!(queue.pop().await.as_deref(), Some("b3"));
    }

    #[tokio::test]
    async fn test_overflow_never_drops_responses() {
        let queue = OutboundQueue::new(2);
        queue.push_response("r1".into()).await;
        queue.push_response("r2".into()).await;
        queue.push_broadcast("b1".into()); // only responses queued: b1 dropped

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().await.as_deref(), Some("r1"));
        assert_eq!(queue.pop().await.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_response_waits_for_space() {
        let queue = Arc::new(OutboundQueue::new(1));
        queue.push_response("r1".into()).await;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.push_response("r2".into()).await;
            })
        };

        tokio::task::yield_now().await;
        assert!(!producer.is_finished());

        assert_eq!(queue.pop().await.as_deref(), Some("r1"));
        producer.await.unwrap();
        assert_eq!(queue.pop().await.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_pop_returns_none_after_close() {
        let queue = OutboundQueue::new(4);
        queue.push_broadcast("last".into());
        queue.close();
        assert_eq!(queue.pop().await.as_deref(), Some("last"));
        assert_eq!(queue.pop().await, None);
    }

    #[test]
    fn test_password_hashing() {
        let hash = hash_password("hunter2");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_password("hunter2"));
        assert_ne!(hash, hash_password("hunter3"));
    }

    #[test]
    fn test_session_authentication() {
        let session = Session::new("127.0.0.1:1", true);
        assert!(!session.is_authenticated());
        let stored = hash_password("secret");
        assert!(!session.authenticate("wrong", &stored));
        assert!(!session.is_authenticated());
        assert!(session.authenticate("secret", &stored));
        assert!(session.is_authenticated());
    }

    #[test]
    fn test_session_without_password_is_open() {
        let session = Session::new("127.0.0.1:1", false);
        assert!(session.is_authenticated());
    }
}
