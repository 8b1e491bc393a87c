//! Pooled sessions, partitioned by acknowledgement mode.
//!
//! A pool slot exists per acknowledgement mode, each holding a FIFO of
//! idle sessions created lazily against the shared connection. Checkout
//! marks a session busy; return asserts it is idle again — no in-flight
//! work, no unacknowledged deliveries — detaches any listener, and
//! re-enqueues it. Nothing is closed at the broker on return: pooled
//! sessions live until the resource lifecycle manager sweeps them.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::connection::Connection;
use crate::error::{MessagingError, Result};
use crate::lifecycle::ResourceLifecycleManager;
use crate::session::{AckMode, Session};

/// A session checked out of a pool.
///
/// Dereferences to the underlying [`Session`]. The holder is the only
/// user of the session until it is handed back.
pub struct PooledSession {
    entry: Arc<PoolEntry>,
}

impl PooledSession {
    /// The session borrowed from the pool.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.entry.session
    }

    /// True from checkout until the session is returned.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.entry.busy.load(Ordering::SeqCst)
    }
}

impl Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.entry.session
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.entry.session.id().to_string())
            .field("busy", &self.is_busy())
            .finish()
    }
}

struct PoolEntry {
    session: Session,
    busy: AtomicBool,
}

/// Pool of idle sessions for one acknowledgement mode.
pub struct SessionPool {
    connection: Connection,
    ack_mode: AckMode,
    idle: Mutex<VecDeque<Arc<PoolEntry>>>,
    lifecycle: Arc<ResourceLifecycleManager>,
}

impl SessionPool {
    /// Create an empty pool backed by `connection`.
    ///
    /// Sessions created by the pool are registered with `lifecycle` so
    /// they are closed exactly once when the manager sweeps.
    #[must_use]
    pub fn new(
        connection: Connection,
        ack_mode: AckMode,
        lifecycle: Arc<ResourceLifecycleManager>,
    ) -> Self {
        Self {
            connection,
            ack_mode,
            idle: Mutex::new(VecDeque::new()),
            lifecycle,
        }
    }

    /// The acknowledgement mode every session in this pool carries.
    #[must_use]
    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Check a session out, creating one lazily when the pool is empty.
    pub async fn take(&self) -> Result<PooledSession> {
        let reused = self.idle.lock().expect("idle queue poisoned").pop_front();
        let entry = match reused {
            Some(entry) => entry,
            None => {
                let session = self.connection.create_session(self.ack_mode).await?;
                self.lifecycle.register_session(session.clone());
                session.attach_lifecycle(&self.lifecycle);
                Arc::new(PoolEntry {
                    session,
                    busy: AtomicBool::new(false),
                })
            }
        };
        if entry.busy.swap(true, Ordering::SeqCst) {
            return Err(MessagingError::illegal_state(
                "pooled session was already checked out",
            ));
        }
        Ok(PooledSession { entry })
    }

    /// Hand a session back.
    ///
    /// # Errors
    ///
    /// [`MessagingError::IllegalState`] when the session still holds
    /// unacknowledged deliveries or an open transaction in client or
    /// transacted mode — callers must acknowledge or commit before
    /// returning. The session is discarded from the pool in that case;
    /// the lifecycle manager still closes it.
    pub async fn give_back(&self, pooled: PooledSession) -> Result<()> {
        let entry = pooled.entry;
        let held_work = matches!(self.ack_mode, AckMode::Client | AckMode::Transacted)
            && (entry.session.has_unacked() || entry.session.has_open_transaction());
        if held_work {
            entry.busy.store(false, Ordering::SeqCst);
            return Err(MessagingError::illegal_state(
                "session returned to pool with unfinished acknowledgement work",
            ));
        }
        entry.session.clear_listeners();
        entry.busy.store(false, Ordering::SeqCst);
        self.idle
            .lock()
            .expect("idle queue poisoned")
            .push_back(entry);
        Ok(())
    }

    /// Number of idle sessions currently pooled.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().expect("idle queue poisoned").len()
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("ack_mode", &self.ack_mode)
            .field("idle", &self.idle_count())
            .finish_non_exhaustive()
    }
}

/// One pool per acknowledgement mode, indexed by [`AckMode::index`].
pub(crate) struct SessionPools {
    pools: [SessionPool; 4],
}

impl SessionPools {
    pub(crate) fn new(connection: &Connection, lifecycle: &Arc<ResourceLifecycleManager>) -> Self {
        Self {
            pools: AckMode::ALL.map(|ack_mode| {
                SessionPool::new(connection.clone(), ack_mode, Arc::clone(lifecycle))
            }),
        }
    }

    pub(crate) fn pool(&self, ack_mode: AckMode) -> &SessionPool {
        &self.pools[ack_mode.index()]
    }
}
