use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::CutoutConfig;
use crate::errors::{CutoutError, Result};
use crate::fetcher::ModelFetcher;
use crate::heuristic::fast_matte;
use crate::inference::run_inference;
use crate::postprocess::decode_mask;
use crate::preprocess::to_tensor;
use crate::protocol::{Envelope, JobKind, Request, Response};
use crate::session::SessionLifecycle;
use crate::traits::{BlobCache, ModelTransport, SessionFactory};
use crate::types::{BackendTag, Image};

const THREAD_NAME: &str = "cutout-worker";

/// State owned by the worker thread: the model fetcher and the one session.
///
/// Requests are handled one at a time, in arrival order.
pub struct WorkerHost<T: ModelTransport, C: BlobCache, F: SessionFactory> {
    config: CutoutConfig,
    fetcher: ModelFetcher<T, C>,
    lifecycle: SessionLifecycle<F>,
    cancel: CancellationToken,
}

impl<T, C, F> WorkerHost<T, C, F>
where
    T: ModelTransport,
    C: BlobCache,
    F: SessionFactory,
{
    pub fn new(
        config: CutoutConfig,
        transport: T,
        cache: C,
        factory: F,
        cancel: CancellationToken,
    ) -> Self {
        let fetcher = ModelFetcher::new(transport, cache, config.download_timeout());
        Self {
            config,
            fetcher,
            lifecycle: SessionLifecycle::new(factory),
            cancel,
        }
    }

    /// Receives envelopes until the sender is dropped or the token is cancelled.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        info!("worker started");
        loop {
            let envelope = tokio::select! {
                _ = self.cancel.cancelled() => break,
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            self.handle(envelope).await;
        }
        info!("worker stopped");
    }

    pub async fn handle(&mut self, envelope: Envelope) {
        let Envelope { request, reply } = envelope;
        let kind = request.kind().map_or("reset", JobKind::as_str);
        let span = info_span!("job", kind, job_id = ?request.job_id());

        async {
            match request {
                Request::Init => self.init(&reply).await,
                Request::PreciseMatting { job_id, image } => {
                    let response = self.precise_matting(job_id, image, &reply).await;
                    let _ = reply.send(response);
                }
                Request::FastPreview { job_id, image } => {
                    let _ = reply.send(self.fast_preview(job_id, image));
                }
                Request::Reset => {
                    debug!("dropping session");
                    self.lifecycle.reset();
                }
            }
        }
        .instrument(span)
        .await;
    }

    async fn init(&mut self, reply: &mpsc::UnboundedSender<Response>) {
        let mut forward = |event| {
            let _ = reply.send(Response::Progress(event));
        };
        // failures are reported through the terminal error event
        let _ = self
            .lifecycle
            .ensure_ready(&self.fetcher, &self.config.model, &self.cancel, &mut forward)
            .await;
    }

    async fn precise_matting(
        &mut self,
        job_id: u64,
        image: Image,
        reply: &mpsc::UnboundedSender<Response>,
    ) -> Response {
        if self.lifecycle.ready_mut().is_none() {
            let mut forward = |event| {
                let _ = reply.send(Response::Progress(event));
            };
            if let Err(e) = self
                .lifecycle
                .ensure_ready(&self.fetcher, &self.config.model, &self.cancel, &mut forward)
                .await
            {
                return job_error(job_id, e.to_string(), image);
            }
        }

        match guarded(|| self.infer(&image)) {
            Ok((output, backend)) => {
                info!(%backend, "precise matting finished");
                Response::Result {
                    job_id,
                    image: output,
                    backend,
                }
            }
            Err(e) => job_error(job_id, e.to_string(), image),
        }
    }

    fn infer(&mut self, image: &Image) -> Result<(Image, BackendTag)> {
        let variant = &self.config.model;
        let ready = self
            .lifecycle
            .ready_mut()
            .ok_or(CutoutError::SessionNotReady)?;
        let backend = ready.backend();
        // a model with fixed spatial axes overrides the configured size
        let target_size = ready
            .session_mut()
            .fixed_input_size()
            .unwrap_or(variant.target_size);

        let (tensor, geometry) =
            to_tensor(image, target_size, &variant.normalization, variant.pad_color)?;
        let raw = run_inference(
            Some(ready),
            tensor.view(),
            &geometry,
            &variant.output_candidates,
        )?;
        let output = decode_mask(
            &raw,
            &geometry,
            image,
            &self.config.contrast,
            self.config.precise_refine,
        )?;
        Ok((output, backend))
    }

    fn fast_preview(&self, job_id: u64, image: Image) -> Response {
        let result = guarded(|| {
            fast_matte(&image, &self.config.heuristic, self.config.preview_refine)
        });
        match result {
            Ok(output) => Response::Result {
                job_id,
                image: output,
                backend: BackendTag::Heuristic,
            },
            Err(e) => job_error(job_id, e.to_string(), image),
        }
    }
}

fn job_error(job_id: u64, message: String, image: Image) -> Response {
    warn!(job_id, error = %message, "job failed");
    Response::Error {
        job_id,
        message,
        image: Some(image),
    }
}

/// Runs `f`, turning a panic into a model error so the worker survives it.
fn guarded<R>(f: impl FnOnce() -> Result<R>) -> Result<R> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(CutoutError::model(
            "inference",
            std::io::Error::other(format!("panicked: {message}")),
        ))
    })
}

/// Caller-side handle to the dedicated worker thread.
///
/// Dropping the handle stops the worker. Outside an async runtime the drop
/// waits for the thread to exit; inside one the thread is detached and exits
/// on its own after the current job, so an executor thread is never blocked.
/// Use [`shutdown`](Self::shutdown) to always wait.
pub struct WorkerHandle {
    sender: Option<mpsc::UnboundedSender<Envelope>>,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Validates `config` and starts the worker thread with its own
    /// single-threaded runtime.
    pub fn spawn<T, C, F>(config: CutoutConfig, transport: T, cache: C, factory: F) -> Result<Self>
    where
        T: ModelTransport + 'static,
        C: BlobCache + 'static,
        F: SessionFactory + 'static,
    {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CutoutError::worker_unavailable(format!("runtime creation: {e}")))?;

        let cancel = CancellationToken::new();
        let (sender, inbox) = mpsc::unbounded_channel();
        let host = WorkerHost::new(config, transport, cache, factory, cancel.clone());

        let thread = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || runtime.block_on(host.run(inbox)))
            .map_err(|e| CutoutError::worker_unavailable(format!("thread spawn: {e}")))?;

        Ok(Self {
            sender: Some(sender),
            cancel,
            thread: Some(thread),
        })
    }

    /// Queues `request` and returns the stream of its responses.
    pub fn submit(&self, request: Request) -> Result<mpsc::UnboundedReceiver<Response>> {
        let (envelope, responses) = Envelope::new(request);
        self.sender
            .as_ref()
            .ok_or_else(|| CutoutError::worker_unavailable("submit after shutdown"))?
            .send(envelope)
            .map_err(|_| CutoutError::worker_unavailable("worker thread has exited"))?;
        Ok(responses)
    }

    /// Cancels downloads in progress, lets the current job finish and joins
    /// the thread.
    ///
    /// Blocks the calling thread until the worker exits; from async code run
    /// it under `tokio::task::spawn_blocking`.
    pub fn shutdown(mut self) {
        self.stop();
        self.join();
    }

    fn stop(&mut self) {
        self.cancel.cancel();
        self.sender.take();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
        if tokio::runtime::Handle::try_current().is_ok() {
            if self.thread.take().is_some() {
                debug!("worker detached on drop inside a runtime");
            }
        } else {
            self.join();
        }
    }
}
