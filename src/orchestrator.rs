use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cache::FsBlobCache;
use crate::config::CutoutConfig;
use crate::errors::{CutoutError, Result};
use crate::fetcher::HttpTransport;
use crate::model::OrtSessionFactory;
use crate::protocol::{Request, Response};
use crate::traits::{BlobCache, ModelTransport, SessionFactory};
use crate::types::{BackendTag, Image, ProgressEvent, Stage};
use crate::worker::WorkerHandle;

/// A matting result and how it was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct MattingOutcome {
    pub image: Image,
    pub backend: BackendTag,
    /// The model path failed and the heuristic produced `image` instead.
    pub degraded: bool,
    pub fallback_reason: Option<String>,
}

/// Full event history of one session build, shared by everyone waiting on it.
type Flight = watch::Receiver<Vec<ProgressEvent>>;

/// Caller-facing API over the worker thread.
///
/// All methods take `&self`; the orchestrator can be shared between tasks.
/// See [`WorkerHandle`] for what dropping it does.
pub struct Orchestrator {
    worker: WorkerHandle,
    flight: Mutex<Option<Flight>>,
    next_job_id: AtomicU64,
}

impl Orchestrator {
    pub fn spawn<T, C, F>(config: CutoutConfig, transport: T, cache: C, factory: F) -> Result<Self>
    where
        T: ModelTransport + 'static,
        C: BlobCache + 'static,
        F: SessionFactory + 'static,
    {
        Ok(Self {
            worker: WorkerHandle::spawn(config, transport, cache, factory)?,
            flight: Mutex::new(None),
            next_job_id: AtomicU64::new(1),
        })
    }

    /// HTTP downloads, on-disk cache under `config.cache_dir`, ONNX Runtime sessions.
    pub fn with_defaults(config: CutoutConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.download_timeout())?;
        let cache = FsBlobCache::new(config.cache_dir.clone());
        let factory = OrtSessionFactory::new(&config);
        Self::spawn(config, transport, cache, factory)
    }

    /// Resolves once the session is ready, replaying every progress event of
    /// the build to `on_progress` in order.
    ///
    /// Calls made while a build is in flight attach to it instead of starting
    /// another one. When the session is already ready a single `ready` event
    /// is delivered.
    ///
    /// Must be awaited inside a Tokio runtime: the build's progress is
    /// recorded by a spawned task so late joiners can replay it.
    pub async fn ensure_ready(&self, mut on_progress: impl FnMut(ProgressEvent)) -> Result<()> {
        let mut flight = self.join_flight()?;
        let mut seen = 0;
        loop {
            let (fresh, terminal) = {
                let events = flight.borrow_and_update();
                let fresh = events.get(seen..).unwrap_or_default().to_vec();
                let terminal = events.last().filter(|e| e.stage.is_terminal()).cloned();
                (fresh, terminal)
            };
            seen += fresh.len();
            fresh.into_iter().for_each(&mut on_progress);

            if let Some(last) = terminal {
                return match last.stage {
                    Stage::Ready => Ok(()),
                    _ => Err(CutoutError::Initialization {
                        message: last
                            .error_message
                            .unwrap_or_else(|| "initialization failed".to_string()),
                    }),
                };
            }
            if flight.changed().await.is_err() {
                return Err(CutoutError::worker_unavailable("init progress stream closed"));
            }
        }
    }

    fn join_flight(&self) -> Result<Flight> {
        let mut current = self.flight.lock();
        if let Some(flight) = current.as_ref() {
            let last = flight.borrow().last().map(|e| e.stage);
            match last {
                Some(Stage::Ready) => {
                    let (_, ready) = watch::channel(vec![ProgressEvent::ready()]);
                    return Ok(ready);
                }
                // failed builds are retried
                Some(Stage::Error) => {}
                _ => {
                    debug!("joining in-flight initialization");
                    return Ok(flight.clone());
                }
            }
        }

        let responses = self.worker.submit(Request::Init)?;
        let (history, flight) = watch::channel(Vec::new());
        tokio::spawn(record_flight(responses, history));
        *current = Some(flight.clone());
        Ok(flight)
    }

    /// Model-based matting, falling back to the heuristic on any failure.
    pub async fn run_precise_matting(&self, image: Image) -> Result<MattingOutcome> {
        self.run_precise_matting_with(image, |_| {}).await
    }

    /// Like [`run_precise_matting`](Self::run_precise_matting), reporting the
    /// progress of a session build the job triggers.
    pub async fn run_precise_matting_with(
        &self,
        image: Image,
        mut on_progress: impl FnMut(ProgressEvent),
    ) -> Result<MattingOutcome> {
        let job_id = self.next_job_id();
        let mut responses = self.worker.submit(Request::PreciseMatting { job_id, image })?;

        while let Some(response) = responses.recv().await {
            match response {
                Response::Progress(event) => on_progress(event),
                Response::Result { image, backend, .. } => {
                    return Ok(MattingOutcome {
                        image,
                        backend,
                        degraded: false,
                        fallback_reason: None,
                    });
                }
                Response::Error {
                    message,
                    image: Some(image),
                    ..
                } => {
                    warn!(job_id, reason = %message, "precise matting failed, using fast preview");
                    let image = self.run_fast_preview(image).await.map_err(|e| {
                        CutoutError::Job {
                            job_id,
                            message: format!("{message}; fallback failed: {e}"),
                        }
                    })?;
                    return Ok(MattingOutcome {
                        image,
                        backend: BackendTag::Heuristic,
                        degraded: true,
                        fallback_reason: Some(message),
                    });
                }
                Response::Error { message, .. } => return Err(CutoutError::Job { job_id, message }),
            }
        }
        Err(CutoutError::worker_unavailable("precise matting response stream closed"))
    }

    /// Heuristic matting; needs no model.
    pub async fn run_fast_preview(&self, image: Image) -> Result<Image> {
        let job_id = self.next_job_id();
        let mut responses = self.worker.submit(Request::FastPreview { job_id, image })?;

        while let Some(response) = responses.recv().await {
            match response {
                Response::Progress(_) => {}
                Response::Result { image, .. } => return Ok(image),
                Response::Error { message, .. } => return Err(CutoutError::Job { job_id, message }),
            }
        }
        Err(CutoutError::worker_unavailable("fast preview response stream closed"))
    }

    /// Drops the session; the next build starts again from `downloading`.
    pub fn reset(&self) {
        self.flight.lock().take();
        match self.worker.submit(Request::Reset) {
            Ok(_) => info!("session reset requested"),
            Err(e) => warn!(error = %e, "reset not delivered"),
        }
    }

    /// Stops the worker after its current job and waits for its thread.
    ///
    /// This blocks; from async code wrap it in `spawn_blocking`, or just drop
    /// the orchestrator, which detaches the worker instead of waiting.
    pub fn shutdown(self) {
        self.worker.shutdown();
    }

    fn next_job_id(&self) -> u64 {
        self.next_job_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Appends the progress of one `init` request to its shared history.
async fn record_flight(
    mut responses: mpsc::UnboundedReceiver<Response>,
    history: watch::Sender<Vec<ProgressEvent>>,
) {
    while let Some(response) = responses.recv().await {
        if let Response::Progress(event) = response {
            let terminal = event.stage.is_terminal();
            history.send_modify(|events| events.push(event));
            if terminal {
                return;
            }
        }
    }
    history.send_modify(|events| {
        events.push(ProgressEvent::error("worker exited during initialization"))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryBlobCache;
    use crate::config::ModelVariant;
    use crate::mocks::{MockSessionFactory, MockTransport, SourceBehavior};

    fn orchestrator(transport: MockTransport) -> Result<Orchestrator> {
        let config = CutoutConfig::new(ModelVariant {
            sources: vec!["mem://model".to_string()],
            target_size: 32,
            ..ModelVariant::u2netp()
        });
        Orchestrator::spawn(
            config,
            transport,
            InMemoryBlobCache::new(),
            MockSessionFactory::default(),
        )
    }

    #[tokio::test]
    async fn test_ready_twice_reuses_session() -> Result<()> {
        let transport =
            MockTransport::new().with_source("mem://model", SourceBehavior::Serve(vec![1; 32]));
        let orchestrator = orchestrator(transport.clone())?;

        orchestrator.ensure_ready(|_| {}).await?;
        let mut events = Vec::new();
        orchestrator.ensure_ready(|e| events.push(e)).await?;

        assert_eq!(events, vec![ProgressEvent::ready()]);
        assert_eq!(transport.calls().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_init_is_retried() -> Result<()> {
        let transport = MockTransport::new();
        let orchestrator = orchestrator(transport.clone())?;

        let first = orchestrator.ensure_ready(|_| {}).await;
        assert!(matches!(first, Err(CutoutError::Initialization { .. })));
        let second = orchestrator.ensure_ready(|_| {}).await;
        assert!(second.is_err());
        // one init per call, each trying the single source
        assert_eq!(transport.calls().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_job_ids_increase() -> Result<()> {
        let orchestrator = orchestrator(MockTransport::new())?;
        let a = orchestrator.next_job_id();
        let b = orchestrator.next_job_id();
        assert!(b > a);
        Ok(())
    }
}
