// Standalone demo driving the coordinator against an in-memory fake index
// engine. Not part of the public API; useful for eyeballing `status()` and
// `stats()` under synthetic concurrent load.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dedupe_coordinator::{
    Advice, ChunkOutcome, ChunkRequest, ChunkName, Coordinator, CoordinatorConfig, EngineError, IndexConfig,
    IndexEngine, IndexStats, OperationType, RequestHandle, Session, SessionStats,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

const WORKER_COUNT: u64 = 4;
const CHUNK_SPACE: u64 = 8;

/// An in-memory stand-in for the real content-address index. Every chunk
/// it has previously seen is "found" on a later lookup.
struct FakeEngine {
    seen: AsyncMutex<std::collections::HashSet<ChunkName>>,
    next_session: AtomicU64,
}

impl FakeEngine {
    fn new() -> Arc<Self> {
        Arc::new(Self { seen: AsyncMutex::new(std::collections::HashSet::new()), next_session: AtomicU64::new(0) })
    }
}

#[async_trait]
impl IndexEngine for FakeEngine {
    async fn create_local_index(&self, name: &str, config: &IndexConfig) -> Result<Session, EngineError> {
        info!(name, nonce = config.nonce, "creating index");
        Ok(Session(self.next_session.fetch_add(1, Ordering::SeqCst)))
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

    async fn start_chunk_operation(&self, request: ChunkRequest) -> Result<(), EngineError> {
        let mut seen = self.seen.lock().await;
        let found = seen.contains(&request.chunk_name);
        if matches!(request.operation, OperationType::Post) {
            seen.insert(request.chunk_name);
        }
        drop(seen);

        let metadata = request.outbound.unwrap_or([0u8; dedupe_coordinator::ADVICE_RECORD_LEN]);
        request.completion.complete(request.request_id, Ok(ChunkOutcome { found, metadata })).await;
        Ok(())
    }

    async fn get_index_stats(&self, _session: Session) -> Result<IndexStats, EngineError> {
        Ok(IndexStats { entries_indexed: self.seen.lock().await.len() as u64 })
    }

    async fn get_session_stats(&self, _session: Session) -> Result<SessionStats, EngineError> {
        Ok(SessionStats::default())
    }
}

fn env_duration_ms(var: &str, default_ms: u64) -> Duration {
    let millis = std::env::var(var).ok().and_then(|value| value.parse().ok()).unwrap_or(default_ms);
    Duration::from_millis(millis)
}

/// One simulated data-path client: reuses a single request handle across a
/// burst of posts and queries, the way a real caller would pool one handle
/// per concurrent submission it wants outstanding.
async fn run_worker(coordinator: Arc<Coordinator>, worker: u64, burst: u64) {
    let handle = RequestHandle::new();
    for round in 0..burst {
        let mut name = [0u8; 32];
        name[0] = ((worker * burst + round) % CHUNK_SPACE) as u8;
        let chunk_name = ChunkName(name);

        let (tx, rx) = tokio::sync::oneshot::channel();
        coordinator.post(
            &handle,
            chunk_name,
            Advice { state: 0, pbn: round },
            Arc::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        match rx.await {
            Ok(outcome) => info!(worker, round, status = ?outcome.status, "post completed"),
            Err(_) => info!(worker, round, "post dropped before completion"),
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let timeout_interval = env_duration_ms("DEDUPE_TIMEOUT_INTERVAL_MS", 5000);
    let reporting_interval = env_duration_ms("DEDUPE_REPORTING_INTERVAL_MS", 1000);
    let config = CoordinatorConfig {
        timeout_interval_ms: timeout_interval.as_millis() as u64,
        reporting_interval_ms: reporting_interval.as_millis() as u64,
        ..CoordinatorConfig::default()
    };

    let engine = FakeEngine::new();
    let coordinator = Coordinator::make(config, engine);
    coordinator.start(true);

    while coordinator.status() != "online" {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    info!("index is online");

    for worker in 0..WORKER_COUNT {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(run_worker(coordinator, worker, 20));
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                coordinator.refresh_index_stats().await;
                info!(status = coordinator.status(), stats = ?coordinator.stats(), "coordinator snapshot");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down on ctrl-c");
                break;
            }
        }
    }

    coordinator.stop().await;
    coordinator.finish().await;
}
