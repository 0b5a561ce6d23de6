//! # Session Table
//!
//! Live sessions keyed by client address.
//!
//! ## Locking
//! - The table lock guards only the map and is never held across I/O
//! - Each session sits behind its own `tokio::sync::Mutex`, so datagrams for
//!   different clients are processed in parallel while datagrams for the same
//!   client are serialised
//!
//! ## Eviction
//! - **Idle**: [`SessionTable::evict_idle`] removes sessions whose last accepted
//!   datagram is older than the timeout. Sessions locked by an in-flight
//!   datagram are busy by definition and are skipped
//! - **Capacity**: inserting past `max_sessions` evicts the oldest session
//!
//! ## Usage
//! ```rust,no_run
//! # async fn demo() {
//! use map_router::core::blowfish::CipherKey;
//! use map_router::protocol::Session;
//! use map_router::transport::SessionTable;
//! use std::time::Duration;
//!
//! let table = SessionTable::new(1024);
//! let addr = "127.0.0.1:5000".parse().unwrap();
//! let (session, _) = table
//!     .insert(Session::new(addr, 1, CipherKey::from_str_key("key")))
//!     .await;
//! session.lock().await.touch();
//!
//! let evicted = table.evict_idle(Duration::from_secs(60)).await;
//! assert!(evicted.is_empty());
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::protocol::session::Session;

/// A session shared between the receive tasks and the flush loop.
pub type SharedSession = Arc<Mutex<Session>>;

struct SessionEntry {
    session: SharedSession,
    created_at: Instant,
}

struct SessionTableInner {
    sessions: HashMap<SocketAddr, SessionEntry>,
    total_created: u64,
    total_evicted: u64,
}

/// Thread-safe map from client address to session
#[derive(Clone)]
pub struct SessionTable {
    max_sessions: usize,
    inner: Arc<Mutex<SessionTableInner>>,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions: max_sessions.max(1),
            inner: Arc::new(Mutex::new(SessionTableInner {
                sessions: HashMap::new(),
                total_created: 0,
                total_evicted: 0,
            })),
        }
    }

    pub async fn get(&self, addr: &SocketAddr) -> Option<SharedSession> {
        let inner = self.inner.lock().await;
        inner.sessions.get(addr).map(|e| e.session.clone())
    }

    /// Insert a new session, replacing any previous one for the address.
    ///
    /// Returns the shared handle and the address evicted to make room, if any.
    pub async fn insert(&self, session: Session) -> (SharedSession, Option<SocketAddr>) {
        let mut inner = self.inner.lock().await;
        self.insert_locked(&mut inner, session)
    }

    /// Existing session for `addr`, or one built by `create`.
    ///
    /// Lookup and insert happen under one lock, so concurrent logins from the
    /// same address build at most one session. The boolean is true when a new
    /// session was inserted.
    pub async fn get_or_insert_with<F, E>(
        &self,
        addr: SocketAddr,
        create: F,
    ) -> Result<(SharedSession, bool, Option<SocketAddr>), E>
    where
        F: FnOnce() -> Result<Session, E>,
    {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.sessions.get(&addr) {
            return Ok((existing.session.clone(), false, None));
        }
        let (shared, evicted) = self.insert_locked(&mut inner, create()?);
        Ok((shared, true, evicted))
    }

    fn insert_locked(
        &self,
        inner: &mut SessionTableInner,
        session: Session,
    ) -> (SharedSession, Option<SocketAddr>) {
        let addr = session.addr();
        let shared = Arc::new(Mutex::new(session));

        inner.sessions.insert(
            addr,
            SessionEntry {
                session: shared.clone(),
                created_at: Instant::now(),
            },
        );
        inner.total_created += 1;

        let evicted = if inner.sessions.len() > self.max_sessions {
            Self::evict_oldest(inner, addr)
        } else {
            None
        };

        trace!(client = %addr, session_count = inner.sessions.len(), "Session stored");
        (shared, evicted)
    }

    pub async fn remove(&self, addr: &SocketAddr) -> Option<SharedSession> {
        let mut inner = self.inner.lock().await;
        inner.sessions.remove(addr).map(|e| e.session)
    }

    /// Handles of every live session, for the flush loop.
    pub async fn snapshot(&self) -> Vec<(SocketAddr, SharedSession)> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .iter()
            .map(|(addr, e)| (*addr, e.session.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove sessions idle for longer than `timeout`.
    pub async fn evict_idle(&self, timeout: Duration) -> Vec<SocketAddr> {
        let mut inner = self.inner.lock().await;

        let idle: Vec<SocketAddr> = inner
            .sessions
            .iter()
            .filter(|(_, entry)| {
                entry
                    .session
                    .try_lock()
                    .map(|s| s.idle_for() > timeout)
                    .unwrap_or(false)
            })
            .map(|(addr, _)| *addr)
            .collect();

        for addr in &idle {
            inner.sessions.remove(addr);
        }
        inner.total_evicted += idle.len() as u64;

        if !idle.is_empty() {
            debug!(
                removed_count = idle.len(),
                remaining_count = inner.sessions.len(),
                "Idle sessions evicted"
            );
        }
        idle
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        let count = inner.sessions.len();
        inner.sessions.clear();
        debug!(cleared_count = count, "Session table cleared");
    }

    pub async fn stats(&self) -> SessionTableStats {
        let inner = self.inner.lock().await;
        SessionTableStats {
            live_sessions: inner.sessions.len(),
            max_sessions: self.max_sessions,
            total_created: inner.total_created,
            total_evicted: inner.total_evicted,
        }
    }

    /// Called with the lock held. Never evicts `keep`.
    fn evict_oldest(inner: &mut SessionTableInner, keep: SocketAddr) -> Option<SocketAddr> {
        let oldest = inner
            .sessions
            .iter()
            .filter(|(addr, _)| **addr != keep)
            .min_by_key(|(_, entry)| entry.created_at)
            .map(|(addr, _)| *addr)?;

        inner.sessions.remove(&oldest);
        inner.total_evicted += 1;
        debug!(client = %oldest, "Oldest session evicted to make room");
        Some(oldest)
    }
}

/// Statistics about the session table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTableStats {
    pub live_sessions: usize,
    pub max_sessions: usize,
    pub total_created: u64,
    pub total_evicted: u64,
}
