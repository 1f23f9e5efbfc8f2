//! Stream sessions
//!
//! Small in-memory registry behind the `/v1/stream/*` endpoints: create
//! a session, send requests into it, tail its events over SSE, delete
//! it. Stale sessions are swept opportunistically on create.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use futures_util::Stream;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::metrics;

/// Sessions idle longer than this are swept.
const SESSION_TTL: Duration = Duration::from_secs(3600);

pub struct StreamSession {
    pub id: String,
    created_at: Instant,
    events: Mutex<Vec<Bytes>>,
    notify: Notify,
    closed: AtomicBool,
}

impl StreamSession {
    fn new() -> Self {
        StreamSession {
            id: Uuid::new_v4().to_string(),
            created_at: Instant::now(),
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append one SSE frame and wake tailing readers.
    pub fn publish(&self, frame: Bytes) {
        self.events.lock().expect("session lock").push(frame);
        self.notify.notify_waiters();
    }

    /// Mark the session complete; tailing readers finish after draining.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn frame_at(&self, index: usize) -> Option<Bytes> {
        self.events.lock().expect("session lock").get(index).cloned()
    }

    /// Stream of buffered frames followed by live ones until the session
    /// closes.
    pub fn subscribe(self: Arc<Self>) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        futures_util::stream::unfold((self, 0usize), |(session, index)| async move {
            loop {
                if let Some(frame) = session.frame_at(index) {
                    return Some((Ok(frame), (session, index + 1)));
                }
                if session.is_closed() {
                    return None;
                }
                session.notify.notified().await;
            }
        })
    }
}

pub struct SessionRegistry {
    max_sessions: usize,
    sessions: Mutex<HashMap<String, Arc<StreamSession>>>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        SessionRegistry {
            max_sessions,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sweep(sessions: &mut HashMap<String, Arc<StreamSession>>) {
        sessions.retain(|_, s| !(s.is_closed() || s.created_at.elapsed() > SESSION_TTL));
    }

    /// Create a session, or `None` when the cap is reached even after
    /// sweeping stale entries.
    pub fn create(&self) -> Option<Arc<StreamSession>> {
        let mut sessions = self.sessions.lock().expect("registry lock");
        Self::sweep(&mut sessions);
        if self.max_sessions > 0 && sessions.len() >= self.max_sessions {
            return None;
        }
        let session = Arc::new(StreamSession::new());
        sessions.insert(session.id.clone(), session.clone());
        metrics::global()
            .stream_sessions_active
            .set(sessions.len() as u64);
        Some(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<StreamSession>> {
        self.sessions.lock().expect("registry lock").get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("registry lock");
        let removed = sessions.remove(id);
        if let Some(session) = &removed {
            session.close();
        }
        metrics::global()
            .stream_sessions_active
            .set(sessions.len() as u64);
        removed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn capacity_is_enforced() {
        let registry = SessionRegistry::new(2);
        let a = registry.create().unwrap();
        let _b = registry.create().unwrap();
        assert!(registry.create().is_none());
        // removing frees a slot
        assert!(registry.remove(&a.id));
        assert!(registry.create().is_some());
    }

    #[test]
    fn closed_sessions_are_swept_on_create() {
        let registry = SessionRegistry::new(1);
        let a = registry.create().unwrap();
        a.close();
        assert!(registry.create().is_some());
    }

    #[tokio::test]
    async fn subscribe_drains_buffered_then_live_frames() {
        let registry = SessionRegistry::new(4);
        let session = registry.create().unwrap();
        session.publish(Bytes::from_static(b"data: one\n\n"));

        let mut stream = Box::pin(session.clone().subscribe());
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Bytes::from_static(b"data: one\n\n")
        );

        let publisher = session.clone();
        tokio::spawn(async move {
            publisher.publish(Bytes::from_static(b"data: two\n\n"));
            publisher.close();
        });
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Bytes::from_static(b"data: two\n\n")
        );
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn remove_unknown_session_is_false() {
        let registry = SessionRegistry::new(4);
        assert!(!registry.remove("nope"));
    }
}
