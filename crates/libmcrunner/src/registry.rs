use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use mc_runner_protocol::SessionId;

use crate::error::ConsoleError;
use crate::output::OutputLine;
use crate::session::RemoteSession;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Live remote sessions keyed by id.
///
/// Every session owns a bounded outbound queue drained by its own writer
/// task. [`ConsoleRegistry::broadcast`] never waits on the network: a session
/// whose queue is full is evicted on the spot, and a session whose write fails
/// or exceeds the write timeout is evicted by its writer.
pub struct ConsoleRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: Mutex<HashMap<SessionId, Entry>>,
    write_timeout: Duration,
    queue_capacity: usize,
}

struct Entry {
    session: Arc<dyn RemoteSession>,
    outbound: mpsc::Sender<Arc<OutputLine>>,
}

/// Outcome of one [`ConsoleRegistry::broadcast`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub queued: usize,
    pub evicted: Vec<SessionId>,
}

impl ConsoleRegistry {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_WRITE_TIMEOUT, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_write_timeout(write_timeout: Duration) -> Self {
        Self::with_limits(write_timeout, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_limits(write_timeout: Duration, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                write_timeout,
                queue_capacity: queue_capacity.max(1),
            }),
        }
    }

    /// Add `session` and start its writer task. Must be called from within a
    /// tokio runtime.
    pub fn register(&self, session: Arc<dyn RemoteSession>) -> SessionId {
        let id = session.id();
        let (outbound, queue) = mpsc::channel(self.inner.queue_capacity);
        tokio::spawn(write_queued(
            Arc::downgrade(&self.inner),
            session.clone(),
            queue,
            self.inner.write_timeout,
        ));
        self.inner.lock().insert(id, Entry { session, outbound });
        id
    }

    /// Remove the session. Lines already queued for it are still written.
    pub fn unregister(&self, id: &SessionId) -> Option<Arc<dyn RemoteSession>> {
        self.inner.lock().remove(id).map(|entry| entry.session)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn RemoteSession>> {
        self.inner
            .lock()
            .values()
            .map(|entry| entry.session.clone())
            .collect()
    }

    /// Queue `line` for every registered session without waiting for any of
    /// them. Sessions that cannot take the line are unregistered and closed.
    pub fn broadcast(&self, line: &OutputLine) -> BroadcastReport {
        let line = Arc::new(line.clone());
        let mut report = BroadcastReport::default();
        let mut dropped = Vec::new();

        self.inner.lock().retain(|id, entry| {
            let reason = match entry.outbound.try_send(line.clone()) {
                Ok(()) => {
                    report.queued += 1;
                    return true;
                }
                Err(TrySendError::Full(_)) => "outbound queue is full",
                Err(TrySendError::Closed(_)) => "session writer has stopped",
            };
            warn!(session_id = %id, kind = entry.session.kind(), "dropping console session: {reason}");
            report.evicted.push(*id);
            dropped.push(entry.session.clone());
            false
        });

        for session in dropped {
            tokio::spawn(async move { session.close().await });
        }
        report
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Entry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ConsoleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain one session's queue until it is unregistered or a write fails.
async fn write_queued(
    registry: Weak<Inner>,
    session: Arc<dyn RemoteSession>,
    mut queue: mpsc::Receiver<Arc<OutputLine>>,
    write_timeout: Duration,
) {
    let id = session.id();
    while let Some(line) = queue.recv().await {
        let written = match tokio::time::timeout(write_timeout, session.send_output(&line)).await {
            Ok(result) => result,
            Err(_) => Err(ConsoleError::WriteTimeout(id)),
        };
        let Err(err) = written else { continue };

        warn!(session_id = %id, kind = session.kind(), "dropping console session: {err}");
        // Whoever removes the entry closes the session, so it is closed once.
        let removed_here = match registry.upgrade() {
            Some(inner) => inner.lock().remove(&id).is_some(),
            None => true,
        };
        if removed_here {
            session.close().await;
        }
        return;
    }
    debug!(session_id = %id, "session writer finished");
}
