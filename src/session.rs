use ndarray::Array4;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ModelVariant;
use crate::errors::{CutoutError, Result};
use crate::fetcher::ModelFetcher;
use crate::traits::{BlobCache, InferenceSession, ModelTransport, SessionFactory};
use crate::types::{BackendTag, ModelBytes, ProgressEvent, Stage};

/// Spatial size of the self-test input when the model leaves it dynamic.
const SELF_TEST_SIZE: u32 = 32;

/// A session that passed its self-test, together with the backend it runs on.
pub struct ReadySession {
    session: Box<dyn InferenceSession>,
    backend: BackendTag,
}

impl ReadySession {
    pub const fn backend(&self) -> BackendTag {
        self.backend
    }

    pub fn session_mut(&mut self) -> &mut dyn InferenceSession {
        self.session.as_mut()
    }
}

enum State {
    Uninitialized,
    Downloading,
    Loading,
    Ready(ReadySession),
    Error(String),
}

/// Owns the one inference session of a worker and the steps that build it:
/// `uninitialized → downloading → loading → ready | error`.
///
/// `ready` persists until [`reset`](Self::reset). `error` does not; the next
/// [`ensure_ready`](Self::ensure_ready) starts over from `downloading`.
pub struct SessionLifecycle<F: SessionFactory> {
    factory: F,
    state: State,
}

impl<F: SessionFactory> SessionLifecycle<F> {
    pub const fn new(factory: F) -> Self {
        Self {
            factory,
            state: State::Uninitialized,
        }
    }

    /// Current stage, `None` before the first build.
    pub fn stage(&self) -> Option<Stage> {
        match self.state {
            State::Uninitialized => None,
            State::Downloading => Some(Stage::Downloading),
            State::Loading => Some(Stage::Loading),
            State::Ready(_) => Some(Stage::Ready),
            State::Error(_) => Some(Stage::Error),
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match &self.state {
            State::Error(message) => Some(message),
            _ => None,
        }
    }

    pub fn ready_mut(&mut self) -> Option<&mut ReadySession> {
        match &mut self.state {
            State::Ready(ready) => Some(ready),
            _ => None,
        }
    }

    /// Drops the session; the next build starts from `downloading`.
    pub fn reset(&mut self) {
        if matches!(self.state, State::Ready(_)) {
            info!("dropping inference session");
        }
        self.state = State::Uninitialized;
    }

    /// Builds the session unless one is already ready.
    ///
    /// Emits `downloading` (starting at 0), any download fractions, `loading`,
    /// then exactly one terminal `ready` or `error` event. When a session is
    /// already ready only the `ready` event is emitted.
    pub async fn ensure_ready<T, C>(
        &mut self,
        fetcher: &ModelFetcher<T, C>,
        variant: &ModelVariant,
        cancel: &CancellationToken,
        on_progress: &mut (dyn FnMut(ProgressEvent) + Send),
    ) -> Result<BackendTag>
    where
        T: ModelTransport,
        C: BlobCache,
    {
        if let State::Ready(ready) = &self.state {
            on_progress(ProgressEvent::ready());
            return Ok(ready.backend);
        }

        self.state = State::Downloading;
        on_progress(ProgressEvent::downloading(Some(0.0)));
        let bytes = match fetcher.get_model_bytes(variant, cancel, on_progress).await {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.fail(e, on_progress)),
        };

        self.state = State::Loading;
        on_progress(ProgressEvent::loading());
        match self.build(&bytes) {
            Ok(ready) => {
                let backend = ready.backend;
                info!(key = %bytes.key(), %backend, "inference session ready");
                self.state = State::Ready(ready);
                on_progress(ProgressEvent::ready());
                Ok(backend)
            }
            Err(e) => Err(self.fail(e, on_progress)),
        }
    }

    fn fail(
        &mut self,
        error: CutoutError,
        on_progress: &mut (dyn FnMut(ProgressEvent) + Send),
    ) -> CutoutError {
        let message = error.to_string();
        warn!(error = %message, "session initialization failed");
        self.state = State::Error(message.clone());
        on_progress(ProgressEvent::error(message));
        error
    }

    /// Tries each backend in priority order; only the last failure surfaces.
    fn build(&self, bytes: &ModelBytes) -> Result<ReadySession> {
        let hardware = match self.factory.hardware_acceleration_supported() {
            Ok(supported) => supported,
            Err(e) => {
                debug!(error = %e, "hardware capability probe failed");
                false
            }
        };

        let mut last_error = None;
        for backend in BackendTag::PRIORITY {
            if backend == BackendTag::HardwareAccelerated && !hardware {
                continue;
            }
            let attempt = self.factory.create(bytes, backend).and_then(|mut session| {
                self_test(session.as_mut())?;
                Ok(session)
            });
            match attempt {
                Ok(session) => return Ok(ReadySession { session, backend }),
                Err(e) => {
                    debug!(%backend, error = %e, "backend unavailable");
                    last_error = Some(e);
                }
            }
        }

        Err(CutoutError::Unsupported {
            message: last_error.map_or_else(|| "no backend attempted".to_string(), |e| e.to_string()),
        })
    }
}

/// One forward pass over zeros to catch sessions that build but cannot run.
fn self_test(session: &mut dyn InferenceSession) -> Result<()> {
    let side = session.fixed_input_size().unwrap_or(SELF_TEST_SIZE) as usize;
    let input = Array4::<f32>::zeros((1, 3, side, side));
    let outputs = session.run(input.view())?;
    if outputs.is_empty() {
        return Err(CutoutError::model(
            "self-test",
            std::io::Error::other("session produced no outputs"),
        ));
    }
    Ok(())
}
