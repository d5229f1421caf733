mod payload;
mod scheduler;
mod state;
mod worker;


pub use payload::{channel_id_from_topic, decode_payload, DecodedPayload};
pub use scheduler::EngineTasks;
pub use worker::{LineCommand, WorkerHandle};

use crate::config::EngineConfig;
use crate::fusion::FusionBuffer;
use crate::publisher::SnapshotPublisher;
use crate::stats::EngineStats;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};

/// A pull-style source polled on the scheduler's REST interval.
pub trait AnalyzerSource: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn poll(&self) -> BoxFuture<'_, anyhow::Result<Bytes>>;
}

/// Ingestion scheduler and owner of the shared engine state.
///
/// Cloned freely into collaborator tasks; all clones feed the same fusion
/// buffer and the same state machine worker.
#[derive(Clone)]
pub struct LineEngine {
    config: Arc<EngineConfig>,
    buffer: Arc<FusionBuffer>,
    worker: WorkerHandle,
    pending_worker: Arc<Mutex<Option<worker::LineWorker>>>,
    state: Arc<Mutex<state::IngestState>>,
    publisher: Arc<SnapshotPublisher>,
    stats: Arc<EngineStats>,
}
