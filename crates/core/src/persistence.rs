//! Persistence Gateway
//!
//! Storage of final turns is best effort: the live path hands writes to a
//! [`Recorder`], which applies them in order on a background task, retries a
//! failed write once and then logs it.

use crate::turn::Turn;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Stored record is corrupt: {0}")]
    Corrupt(String),
}

/// Append/read/delete storage of turns keyed by session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Stores a final turn. Storing the same turn id twice is a no-op.
    async fn append(&self, session_id: &str, turn: &Turn) -> Result<(), PersistenceError>;

    /// All stored turns of a session, oldest first.
    async fn read_all(&self, session_id: &str) -> Result<Vec<Turn>, PersistenceError>;

    /// Deletes every turn of a session, returning the number removed.
    async fn clear(&self, session_id: &str) -> Result<u64, PersistenceError>;
}

/// Process-local gateway, used in tests and when no database is configured.
#[derive(Default)]
pub struct InMemoryGateway {
    sessions: Mutex<HashMap<String, Vec<Turn>>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn append(&self, session_id: &str, turn: &Turn) -> Result<(), PersistenceError> {
        let mut sessions = self.sessions.lock().await;
        let turns = sessions.entry(session_id.to_string()).or_default();
        if !turns.iter().any(|t| t.id == turn.id) {
            turns.push(turn.clone());
        }
        Ok(())
    }

    async fn read_all(&self, session_id: &str) -> Result<Vec<Turn>, PersistenceError> {
        Ok(self
            .sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self, session_id: &str) -> Result<u64, PersistenceError> {
        Ok(self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .map(|turns| turns.len() as u64)
            .unwrap_or(0))
    }
}

#[derive(Debug)]
enum Write {
    Append { session_id: String, turn: Turn },
    Clear { session_id: String },
    /// Answered once every earlier write has been applied.
    Barrier(oneshot::Sender<()>),
}

const RETRY_DELAY: Duration = Duration::from_millis(250);

/// Fire-and-forget handle for persisting turns.
#[derive(Clone)]
pub struct Recorder {
    tx: mpsc::Sender<Write>,
}

impl Recorder {
    /// Starts the writer task. It stops once every `Recorder` clone is dropped.
    pub fn spawn(gateway: Arc<dyn PersistenceGateway>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(run_writer(gateway, rx));
        (Self { tx }, handle)
    }

    /// Queues a turn for storage without waiting.
    pub fn record(&self, session_id: &str, turn: &Turn) {
        self.enqueue(Write::Append {
            session_id: session_id.to_string(),
            turn: turn.clone(),
        });
    }

    /// Queues deletion of a session's stored turns behind any pending appends.
    pub fn clear(&self, session_id: &str) {
        self.enqueue(Write::Clear {
            session_id: session_id.to_string(),
        });
    }

    /// Waits until every write queued before this call has been applied or
    /// given up on. Returns at once if the writer has stopped.
    pub async fn flush(&self) {
        let (done, applied) = oneshot::channel();
        if self.tx.send(Write::Barrier(done)).await.is_ok() {
            let _ = applied.await;
        }
    }

    fn enqueue(&self, write: Write) {
        if let Err(e) = self.tx.try_send(write) {
            warn!(error = %e, "Persistence queue unavailable, dropping write");
        }
    }
}

async fn run_writer(gateway: Arc<dyn PersistenceGateway>, mut rx: mpsc::Receiver<Write>) {
    while let Some(write) = rx.recv().await {
        if let Write::Barrier(done) = write {
            let _ = done.send(());
            continue;
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match &write {
                Write::Append { session_id, turn } => gateway.append(session_id, turn).await,
                Write::Clear { session_id } => gateway.clear(session_id).await.map(|_| ()),
                Write::Barrier(_) => Ok(()),
            };
            match result {
                Ok(()) => {
                    debug!(?write, "Persisted");
                    break;
                }
                Err(e) if attempt < 2 => {
                    warn!(error = %e, "Persistence write failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(error = %e, ?write, "Persistence write dropped after retry");
                    break;
                }
            }
        }
    }
    debug!("Persistence writer stopped");
}
