// dedupe-coordinator: index session state machine
//
// Mirrors the target/actual split the teacher uses for its own connection
// state (compare `knhk-sidecar`'s upstream-health state machine): a
// requested `index_target` drives a single `drive()` loop toward it, and
// every external entry point just updates the target and kicks the loop.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::engine::{EngineError, IndexConfig, IndexEngine, Session};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::queue::IndexQueueHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexState {
    Closed,
    Changing,
    Opened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetState {
    Closed,
    Opened,
}

/// Shared, lock-protected session state. Read by the dispatcher to decide
/// whether a request may be issued at all.
pub(crate) struct StateInner {
    pub(crate) index_state: IndexState,
    index_target: TargetState,
    changing: bool,
    create_flag: bool,
    dedupe_flag: bool,
    pub(crate) deduping: bool,
    error_flag: bool,
    pub(crate) session: Option<Session>,
}

impl Default for StateInner {
    fn default() -> Self {
        Self {
            index_state: IndexState::Closed,
            index_target: TargetState::Closed,
            changing: false,
            create_flag: false,
            dedupe_flag: false,
            deduping: false,
            error_flag: false,
            session: None,
        }
    }
}

pub(crate) type StateLock = Arc<Mutex<StateInner>>;

enum OpenOutcome {
    Opened(Session),
    RetryAsCreate,
    Fatal(EngineError),
}

/// Drives the index between closed and opened, one target change at a
/// time, entirely on the index queue worker.
pub(crate) struct SessionMachine {
    state: StateLock,
    queue: IndexQueueHandle,
    engine: Arc<dyn IndexEngine>,
    index_name: String,
    configured_nonce: u64,
}

impl SessionMachine {
    pub(crate) fn new(
        queue: IndexQueueHandle,
        engine: Arc<dyn IndexEngine>,
        index_name: String,
        configured_nonce: u64,
    ) -> Arc<Self> {
        Arc::new(Self { state: Arc::new(Mutex::new(StateInner::default())), queue, engine, index_name, configured_nonce })
    }

    pub(crate) fn state_lock(&self) -> StateLock {
        Arc::clone(&self.state)
    }

    /// Update the requested target and, if the index isn't already moving
    /// toward it, kick off `drive()` on the queue.
    pub(crate) fn set_target_state(self: &Arc<Self>, target: TargetState, change_dedupe: Option<bool>, set_create: bool) {
        let should_drive = {
            let mut state = self.state.lock();

            if state.index_target != target {
                info!(from = target_name(state.index_target), to = target_name(target), "index target state change");
            }
            state.index_target = target;
            if let Some(dedupe) = change_dedupe {
                state.dedupe_flag = dedupe;
            }
            if set_create {
                state.create_flag = true;
            }

            if state.changing {
                false
            } else {
                state.changing = true;
                true
            }
        };

        if should_drive {
            let this = Arc::clone(self);
            self.queue.submit(move || this.drive());
        }
    }

    async fn drive(self: Arc<Self>) {
        loop {
            let (target, current) = {
                let state = self.state.lock();
                (state.index_target, state.index_state)
            };

            match (target, current) {
                (TargetState::Opened, IndexState::Closed) => {
                    self.state.lock().index_state = IndexState::Changing;
                    self.open_session().await;
                }
                (TargetState::Closed, IndexState::Opened) => {
                    self.state.lock().index_state = IndexState::Changing;
                    self.close_session().await;
                }
                _ => {}
            }

            let mut state = self.state.lock();
            let still_pending = (state.index_target == TargetState::Opened && state.index_state != IndexState::Opened)
                || (state.index_target == TargetState::Closed && state.index_state != IndexState::Closed);
            if still_pending {
                continue;
            }

            state.deduping = state.index_state == IndexState::Opened && state.dedupe_flag && !state.error_flag;
            state.changing = false;
            break;
        }
    }

    async fn open_session(self: &Arc<Self>) {
        let create = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.create_flag)
        };

        let outcome = if create {
            self.create_index().await
        } else {
            self.rebuild_index().await
        };

        match outcome {
            OpenOutcome::Opened(session) => {
                let mut state = self.state.lock();
                state.session = Some(session);
                state.index_state = IndexState::Opened;
                state.error_flag = false;
            }
            OpenOutcome::RetryAsCreate => {
                match self.create_index().await {
                    OpenOutcome::Opened(session) => {
                        let mut state = self.state.lock();
                        state.session = Some(session);
                        state.index_state = IndexState::Opened;
                        state.error_flag = false;
                    }
                    _ => {
                        // No further retries until an external command
                        // arrives: pin the target to `Closed` too, or
                        // `drive()` would see `index_target` still `Opened`
                        // and spin retrying the engine forever.
                        let mut state = self.state.lock();
                        state.index_state = IndexState::Closed;
                        state.index_target = TargetState::Closed;
                        state.error_flag = true;
                    }
                }
            }
            OpenOutcome::Fatal(error) => {
                warn!(%error, "failed to open dedupe index");
                let mut state = self.state.lock();
                state.index_state = IndexState::Closed;
                state.index_target = TargetState::Closed;
                state.error_flag = true;
            }
        }
    }

    async fn create_index(&self) -> OpenOutcome {
        let config = IndexConfig { nonce: self.configured_nonce };
        match self.engine.create_local_index(&self.index_name, &config).await {
            Ok(session) => OpenOutcome::Opened(session),
            Err(error) => OpenOutcome::Fatal(error),
        }
    }

    async fn rebuild_index(&self) -> OpenOutcome {
        match self.engine.rebuild_local_index(&self.index_name).await {
            Ok(session) => match self.engine.get_index_configuration(session).await {
                Ok(config) if config.nonce == self.configured_nonce => OpenOutcome::Opened(session),
                Ok(_) => {
                    warn!("index nonce mismatch; recreating");
                    let _ = self.engine.close_index_session(session).await;
                    OpenOutcome::RetryAsCreate
                }
                Err(error) => OpenOutcome::Fatal(error),
            },
            Err(EngineError::CorruptComponent) | Err(EngineError::NoIndex) => OpenOutcome::RetryAsCreate,
            Err(error) => OpenOutcome::Fatal(error),
        }
    }

    async fn close_session(&self) {
        let session = self.state.lock().session.take();
        if let Some(session) = session {
            if let Err(error) = self.engine.close_index_session(session).await {
                warn!(%error, "error closing dedupe index session");
            }
        }
        let mut state = self.state.lock();
        state.index_state = IndexState::Closed;
    }

    /// Human-readable status word, matching the vocabulary a monitoring
    /// tool expects from this kind of coordinator.
    pub(crate) fn status(&self) -> &'static str {
        let state = self.state.lock();
        match (state.index_state, state.error_flag) {
            (_, true) => "error",
            (IndexState::Closed, false) => "closed",
            (IndexState::Changing, false) if state.index_target == TargetState::Opened => "opening",
            (IndexState::Changing, false) => "closing",
            (IndexState::Opened, false) if state.deduping => "online",
            (IndexState::Opened, false) => "offline",
        }
    }

    /// Handle one of the textual sysfs-style control messages.
    pub(crate) fn handle_message(self: &Arc<Self>, message: &str) -> CoordinatorResult<()> {
        match message.to_ascii_lowercase().as_str() {
            "index-close" => {
                self.set_target_state(TargetState::Closed, None, false);
                Ok(())
            }
            "index-create" => {
                self.set_target_state(TargetState::Opened, None, true);
                Ok(())
            }
            "index-disable" => {
                self.set_target_state(TargetState::Opened, Some(false), false);
                Ok(())
            }
            "index-enable" => {
                self.set_target_state(TargetState::Opened, Some(true), false);
                Ok(())
            }
            other => Err(CoordinatorError::InvalidMessage(other.to_string())),
        }
    }

    /// Save, and optionally checkpoint, the index in place without closing
    /// the session.
    pub(crate) async fn suspend(self: &Arc<Self>, save: bool) {
        let this = Arc::clone(self);
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.queue.submit(move || async move {
            let session = this.state.lock().session;
            if let Some(session) = session {
                if save {
                    if let Err(error) = this.engine.save_index(session).await {
                        warn!(%error, "error saving dedupe index during suspend");
                    }
                }
                if let Err(error) = this.engine.flush_index_session(session).await {
                    warn!(%error, "error flushing dedupe index during suspend");
                }
            }
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}

fn target_name(target: TargetState) -> &'static str {
    match target {
        TargetState::Closed => "closed",
        TargetState::Opened => "opened",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ChunkRequest, IndexStats, SessionStats};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct StubEngine {
        sessions_opened: AtomicU64,
        fail_create: bool,
    }

    #[async_trait]
    impl IndexEngine for StubEngine {
        async fn create_local_index(&self, _name: &str, _config: &IndexConfig) -> Result<Session, EngineError> {
            if self.fail_create {
                return Err(EngineError::Transient("boom".into()));
            }
            let n = self.sessions_opened.fetch_add(1, Ordering::SeqCst);
            Ok(Session(n))
        }
        async fn rebuild_local_index(&self, _name: &str) -> Result<Session, EngineError> {
            Err(EngineError::NoIndex)
        }
        async fn get_index_configuration(&self, _session: Session) -> Result<IndexConfig, EngineError> {
            Ok(IndexConfig { nonce: 0 })
        }
        async fn close_index_session(&self, _session: Session) -> Result<(), EngineError> {
            Ok(())
        }
        async fn save_index(&self, _session: Session) -> Result<(), EngineError> {
            Ok(())
        }
        async fn flush_index_session(&self, _session: Session) -> Result<(), EngineError> {
            Ok(())
        }
        async fn start_chunk_operation(&self, _request: ChunkRequest) -> Result<(), EngineError> {
            Ok(())
        }
        async fn get_index_stats(&self, _session: Session) -> Result<IndexStats, EngineError> {
            Ok(IndexStats::default())
        }
        async fn get_session_stats(&self, _session: Session) -> Result<SessionStats, EngineError> {
            Ok(SessionStats::default())
        }
    }

    #[tokio::test]
    async fn create_then_close_transitions_through_the_expected_statuses() {
        let (queue, _join) = crate::queue::spawn();
        let engine = Arc::new(StubEngine { sessions_opened: AtomicU64::new(0), fail_create: false });
        let session = SessionMachine::new(queue, engine, "dev=test offset=4096 size=4096".to_string(), 0);

        assert_eq!(session.status(), "closed");
        session.set_target_state(TargetState::Opened, Some(true), true);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(session.status(), "online");

        session.set_target_state(TargetState::Closed, None, false);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(session.status(), "closed");
    }

    #[tokio::test]
    async fn failed_create_reports_error_status() {
        let (queue, _join) = crate::queue::spawn();
        let engine = Arc::new(StubEngine { sessions_opened: AtomicU64::new(0), fail_create: true });
        let session = SessionMachine::new(queue, engine, "dev=test offset=4096 size=4096".to_string(), 0);

        session.set_target_state(TargetState::Opened, Some(true), true);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(session.status(), "error");
    }

    #[tokio::test]
    async fn unknown_message_is_rejected() {
        let (queue, _join) = crate::queue::spawn();
        let engine = Arc::new(StubEngine { sessions_opened: AtomicU64::new(0), fail_create: false });
        let session = SessionMachine::new(queue, engine, "dev=test offset=4096 size=4096".to_string(), 0);
        assert!(session.handle_message("not-a-real-message").is_err());
    }
}
