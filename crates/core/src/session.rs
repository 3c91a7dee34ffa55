//! Session Manager
//!
//! The registry of sessions. Each session owns one [`ContextAccumulator`] and
//! at most one live [`Pipeline`]. The registry map is locked only to find,
//! insert or remove a session; everything else is serialized per session.
//!
//! Reads never register a session. Sessions nobody is talking to are served
//! straight from storage, and clearing an idle session releases it.

use crate::{
    context::ContextAccumulator,
    persistence::{PersistenceGateway, Recorder},
    pipeline::{Pipeline, PipelineConfig, PipelineExit, PipelineParts, PipelineState},
    stage::{StageError, StageKind, StageSet, with_single_retry},
    transport::{Answer, NegotiationError, Offer, TransportNegotiator},
    turn::Turn,
};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tokio::{
    sync::{Mutex, OnceCell, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, instrument, warn};

/// Reply recorded when the responder produced no text.
pub const FALLBACK_REPLY: &str = "I couldn't generate a response.";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Unknown session: {0}")]
    UnknownSession(String),
    #[error("Session {0} already has a live call")]
    Busy(String),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("Message content cannot be empty")]
    EmptyMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Absent,
    Negotiating,
    Live,
    Ending,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub pipeline: PipelineConfig,
    /// Upper bound on concurrent calls across all sessions.
    pub max_live_sessions: Option<usize>,
    /// Capacity of the persistence write queue.
    pub persistence_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            max_live_sessions: None,
            persistence_queue: 256,
        }
    }
}

enum Live {
    Idle(SessionStatus),
    Negotiating,
    Running(Pipeline),
    Ending,
}

impl Live {
    fn status(&self) -> SessionStatus {
        match self {
            Live::Idle(status) => *status,
            Live::Negotiating => SessionStatus::Negotiating,
            Live::Running(_) => SessionStatus::Live,
            Live::Ending => SessionStatus::Ending,
        }
    }
}

struct Session {
    live: Mutex<Live>,
    context: OnceCell<Arc<ContextAccumulator>>,
    /// Set under the registry and live locks when the session is removed.
    retired: AtomicBool,
}

impl Session {
    fn new() -> Self {
        Self {
            live: Mutex::new(Live::Idle(SessionStatus::Absent)),
            context: OnceCell::new(),
            retired: AtomicBool::new(false),
        }
    }
}

struct Inner {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    negotiator: Arc<dyn TransportNegotiator>,
    stages: StageSet,
    gateway: Arc<dyn PersistenceGateway>,
    recorder: Recorder,
    config: SessionConfig,
    live_count: AtomicUsize,
    exits: mpsc::UnboundedSender<PipelineExit>,
}

/// Process-wide session registry. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Creates the manager and its background tasks. Must be called inside a
    /// Tokio runtime.
    pub fn new(
        negotiator: Arc<dyn TransportNegotiator>,
        stages: StageSet,
        gateway: Arc<dyn PersistenceGateway>,
        config: SessionConfig,
    ) -> Self {
        let (recorder, _writer) = Recorder::spawn(gateway.clone(), config.persistence_queue);
        let (exits, exit_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            sessions: Mutex::new(HashMap::new()),
            negotiator,
            stages,
            gateway,
            recorder,
            config,
            live_count: AtomicUsize::new(0),
            exits,
        });
        spawn_reaper(Arc::downgrade(&inner), exit_rx);
        Self { inner }
    }

    /// Negotiates a transport for `session_id` and starts a pipeline on it.
    ///
    /// A session that is already negotiating, live or ending is busy. The
    /// answer is returned once the media channel accepts frames; the pipeline
    /// keeps building in the background.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn begin(&self, session_id: &str, offer: &Offer) -> Result<Answer, SessionError> {
        let (session, previous) = loop {
            let session = self.session(session_id).await;
            if let Some(previous) = self.claim(&session, session_id).await? {
                break (session, previous);
            }
        };

        let negotiated = self.inner.negotiator.negotiate(session_id, offer).await;
        let (answer, channel) = match negotiated {
            Ok(negotiated) => negotiated,
            Err(e) => {
                warn!(error = %e, "Negotiation failed");
                {
                    let mut live = session.live.lock().await;
                    if matches!(*live, Live::Negotiating | Live::Ending) {
                        *live = Live::Idle(previous);
                    }
                }
                self.release();
                if previous == SessionStatus::Absent && session.context.get().is_none() {
                    self.retire(session_id, &session).await;
                }
                return Err(e.into());
            }
        };

        let context = self.context_of(&session, session_id).await;
        let mut live = session.live.lock().await;
        if !matches!(*live, Live::Negotiating) {
            // Ended while negotiating.
            channel.closed.cancel();
            *live = Live::Idle(SessionStatus::Closed);
            self.release();
            return Err(NegotiationError::Rejected("session ended during negotiation".into()).into());
        }
        let pipeline = Pipeline::spawn(
            session_id,
            channel,
            PipelineParts {
                stages: self.inner.stages.clone(),
                context,
                recorder: self.inner.recorder.clone(),
                config: self.inner.config.pipeline.clone(),
            },
            Some(self.inner.exits.clone()),
        );
        info!(pipeline_id = %pipeline.id(), "Call started");
        *live = Live::Running(pipeline);
        Ok(answer)
    }

    /// Reserves a call slot on `session`. `None` means the session was retired
    /// before its lock was taken and the caller should look it up again.
    async fn claim(
        &self,
        session: &Session,
        session_id: &str,
    ) -> Result<Option<SessionStatus>, SessionError> {
        let mut live = session.live.lock().await;
        if session.retired.load(Ordering::Acquire) {
            return Ok(None);
        }
        let unreaped = match &*live {
            Live::Negotiating | Live::Ending => {
                return Err(SessionError::Busy(session_id.to_string()));
            }
            Live::Running(pipeline) if !pipeline.is_finished() => {
                return Err(SessionError::Busy(session_id.to_string()));
            }
            Live::Running(_) => true,
            Live::Idle(_) => false,
        };
        if unreaped {
            // Finished but its exit notice is still queued; its slot is
            // still counted.
            *live = Live::Idle(SessionStatus::Closed);
            self.release();
        }
        self.reserve()?;
        Ok(Some(std::mem::replace(&mut *live, Live::Negotiating).status()))
    }

    /// Text-chat path: records the user turn, asks the responder for a full
    /// reply and records that as the agent turn.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn send_text(&self, session_id: &str, content: &str) -> Result<Turn, SessionError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let context = self.context(session_id).await;
        let history = context.recent(self.inner.config.pipeline.history_window).await;
        self.commit(session_id, &context, Turn::user(content)).await;

        let responder = &self.inner.stages.responder;
        let reply = with_single_retry(StageKind::Responder, || {
            responder.complete(&history, content)
        })
        .await?;
        let reply = match reply.trim() {
            "" => FALLBACK_REPLY,
            text => text,
        };
        let turn = Turn::agent(reply);
        Ok(self
            .commit(session_id, &context, turn.clone())
            .await
            .unwrap_or(turn))
    }

    /// Ordered turns of a session; empty for a session never seen.
    pub async fn history(&self, session_id: &str) -> Vec<Turn> {
        self.recent_history(session_id, None).await
    }

    /// The most recent `limit` turns, or all of them.
    pub async fn recent_history(&self, session_id: &str, limit: Option<usize>) -> Vec<Turn> {
        let loaded = match self.existing(session_id).await {
            Some(session) => session.context.get().cloned(),
            None => None,
        };
        if let Some(context) = loaded {
            return context.recent(limit).await;
        }
        let mut turns = self.stored_turns(session_id).await;
        if let Some(limit) = limit {
            let excess = turns.len().saturating_sub(limit);
            turns.drain(..excess);
        }
        turns
    }

    /// Drops every turn of the session, in memory and in storage. A live call
    /// keeps running on the emptied context; an idle session is released.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn clear(&self, session_id: &str) -> usize {
        let session = self.existing(session_id).await;
        let context = session.as_ref().and_then(|s| s.context.get().cloned());
        let removed = match context {
            Some(context) => {
                let removed = context.clear().await;
                self.inner.recorder.clear(session_id);
                removed
            }
            None => {
                self.inner.recorder.flush().await;
                match self.inner.gateway.clear(session_id).await {
                    Ok(removed) => removed as usize,
                    Err(e) => {
                        warn!(error = %e, "Could not clear stored turns");
                        0
                    }
                }
            }
        };
        if let Some(session) = session {
            self.retire(session_id, &session).await;
        }
        info!(removed, "History cleared");
        removed
    }

    /// Drains and closes the live call, if any. History is kept.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn end(&self, session_id: &str) -> Result<(), SessionError> {
        let Some(session) = self.existing(session_id).await else {
            debug!("No such session, nothing to end");
            return Ok(());
        };
        let pipeline = {
            let mut live = session.live.lock().await;
            match std::mem::replace(&mut *live, Live::Ending) {
                Live::Running(pipeline) => pipeline,
                // `begin` sees `Ending` once negotiation returns and backs out.
                Live::Negotiating => return Ok(()),
                other => {
                    *live = other;
                    return Ok(());
                }
            }
        };
        let outcome = pipeline.drain().await;
        info!(state = ?outcome.state, "Call ended");
        *session.live.lock().await = Live::Idle(SessionStatus::Closed);
        self.release();
        Ok(())
    }

    pub async fn status(&self, session_id: &str) -> SessionStatus {
        match self.existing(session_id).await {
            Some(session) => session.live.lock().await.status(),
            None => SessionStatus::Absent,
        }
    }

    /// State updates of the session's live pipeline.
    pub async fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<watch::Receiver<PipelineState>, SessionError> {
        let unknown = || SessionError::UnknownSession(session_id.to_string());
        let session = self.existing(session_id).await.ok_or_else(unknown)?;
        match &*session.live.lock().await {
            Live::Running(pipeline) => Ok(pipeline.subscribe()),
            _ => Err(unknown()),
        }
    }

    /// Number of sessions currently held in memory.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Number of calls currently negotiating or live.
    pub fn active_count(&self) -> usize {
        self.inner.live_count.load(Ordering::SeqCst)
    }

    /// Ends every live call.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.inner.sessions.lock().await.keys().cloned().collect();
        info!(sessions = ids.len(), "Ending all calls");
        for id in ids {
            if let Err(e) = self.end(&id).await {
                warn!(session_id = %id, error = %e, "Failed to end call");
            }
        }
    }

    async fn session(&self, session_id: &str) -> Arc<Session> {
        self.inner
            .sessions
            .lock()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Session::new()))
            .clone()
    }

    async fn existing(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.lock().await.get(session_id).cloned()
    }

    /// Removes an idle session from the registry. Its turns stay in storage
    /// and are loaded again on next use.
    async fn retire(&self, session_id: &str, session: &Arc<Session>) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        let live = session.live.lock().await;
        let registered = sessions
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if !registered || !matches!(*live, Live::Idle(_)) {
            return false;
        }
        session.retired.store(true, Ordering::Release);
        sessions.remove(session_id);
        debug!("Session released from memory");
        true
    }

    /// Turns of a session that is not in memory. Queued writes are applied
    /// first so the read sees them.
    async fn stored_turns(&self, session_id: &str) -> Vec<Turn> {
        self.inner.recorder.flush().await;
        match self.inner.gateway.read_all(session_id).await {
            Ok(turns) => turns,
            Err(e) => {
                warn!(error = %e, "Could not load stored turns");
                Vec::new()
            }
        }
    }

    async fn context(&self, session_id: &str) -> Arc<ContextAccumulator> {
        let session = self.session(session_id).await;
        self.context_of(&session, session_id).await
    }

    /// The session's context, seeded from storage on first use.
    async fn context_of(&self, session: &Session, session_id: &str) -> Arc<ContextAccumulator> {
        session
            .context
            .get_or_init(|| async {
                self.inner.recorder.flush().await;
                match self.inner.gateway.read_all(session_id).await {
                    Ok(turns) => {
                        debug!(turns = turns.len(), "Context seeded from storage");
                        Arc::new(ContextAccumulator::with_turns(turns))
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not load stored turns, starting empty");
                        Arc::new(ContextAccumulator::new())
                    }
                }
            })
            .await
            .clone()
    }

    async fn commit(
        &self,
        session_id: &str,
        context: &ContextAccumulator,
        turn: Turn,
    ) -> Option<Turn> {
        match context.append(turn).await {
            Ok(Some(stored)) => {
                self.inner.recorder.record(session_id, &stored);
                Some(stored)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Turn rejected by context");
                None
            }
        }
    }

    fn reserve(&self) -> Result<(), NegotiationError> {
        let max = self.inner.config.max_live_sessions;
        self.inner
            .live_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match max {
                Some(max) if n >= max => None,
                _ => Some(n + 1),
            })
            .map(|_| ())
            .map_err(|_| NegotiationError::NoCapacity)
    }

    fn release(&self) {
        self.inner.live_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Clears a session's live slot when its pipeline stops on its own.
fn spawn_reaper(
    inner: Weak<Inner>,
    mut exits: mpsc::UnboundedReceiver<PipelineExit>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(exit) = exits.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let session = inner.sessions.lock().await.get(&exit.session_id).cloned();
            let Some(session) = session else {
                continue;
            };
            let mut live = session.live.lock().await;
            if matches!(&*live, Live::Running(p) if p.id() == exit.pipeline_id) {
                *live = Live::Idle(SessionStatus::Closed);
                inner.live_count.fetch_sub(1, Ordering::SeqCst);
                match &exit.outcome.error {
                    Some(error) => warn!(
                        session_id = %exit.session_id,
                        %error,
                        "Call ended with an error; a new call may be started"
                    ),
                    None => info!(session_id = %exit.session_id, "Call closed by transport"),
                }
            }
        }
    })
}
