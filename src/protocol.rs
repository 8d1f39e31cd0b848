//! Messages exchanged with the worker thread.
//!
//! Images travel by value in both directions: a request moves the caller's
//! buffer into the worker and a response moves it back out.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{BackendTag, Image, ProgressEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Init,
    PreciseMatting,
    FastPreview,
}

impl JobKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobKind::Init => "init",
            JobKind::PreciseMatting => "precise-matting",
            JobKind::FastPreview => "fast-preview",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum Request {
    /// Build the session if needed; answered with progress events only.
    Init,
    PreciseMatting { job_id: u64, image: Image },
    FastPreview { job_id: u64, image: Image },
    /// Drop the session so the next job rebuilds it.
    Reset,
}

impl Request {
    pub const fn kind(&self) -> Option<JobKind> {
        match self {
            Request::Init => Some(JobKind::Init),
            Request::PreciseMatting { .. } => Some(JobKind::PreciseMatting),
            Request::FastPreview { .. } => Some(JobKind::FastPreview),
            Request::Reset => None,
        }
    }

    pub const fn job_id(&self) -> Option<u64> {
        match self {
            Request::PreciseMatting { job_id, .. } | Request::FastPreview { job_id, .. } => {
                Some(*job_id)
            }
            Request::Init | Request::Reset => None,
        }
    }
}

#[derive(Debug)]
pub enum Response {
    Progress(ProgressEvent),
    Result {
        job_id: u64,
        image: Image,
        backend: BackendTag,
    },
    /// `image` returns the untouched input when the job had one.
    Error {
        job_id: u64,
        message: String,
        image: Option<Image>,
    },
}

impl Response {
    /// Whether this is the last message of a request of the given kind.
    ///
    /// `init` ends on a `ready` or `error` progress event; matting jobs may
    /// stream a whole session build before their `result` or `error`.
    pub fn is_terminal_for(&self, kind: JobKind) -> bool {
        match (self, kind) {
            (Response::Progress(event), JobKind::Init) => event.stage.is_terminal(),
            (Response::Progress(_), _) => false,
            (Response::Result { .. } | Response::Error { .. }, _) => true,
        }
    }
}

/// A request plus the channel its responses go to.
#[derive(Debug)]
pub struct Envelope {
    pub request: Request,
    pub reply: mpsc::UnboundedSender<Response>,
}

impl Envelope {
    /// Wraps `request` and returns the receiving half for its responses.
    pub fn new(request: Request) -> (Self, mpsc::UnboundedReceiver<Response>) {
        let (reply, rx) = mpsc::unbounded_channel();
        (Self { request, reply }, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_metadata() -> crate::errors::Result<()> {
        let image = Image::from_pixel(1, 1, [0, 0, 0, 255])?;
        let request = Request::FastPreview { job_id: 7, image };
        assert_eq!(request.kind(), Some(JobKind::FastPreview));
        assert_eq!(request.job_id(), Some(7));
        assert_eq!(Request::Reset.kind(), None);
        assert_eq!(JobKind::PreciseMatting.to_string(), "precise-matting");
        Ok(())
    }

    #[test]
    fn test_terminal_responses() {
        let loading = Response::Progress(ProgressEvent::loading());
        let ready = Response::Progress(ProgressEvent::ready());
        assert!(!loading.is_terminal_for(JobKind::Init));
        assert!(ready.is_terminal_for(JobKind::Init));
        assert!(!ready.is_terminal_for(JobKind::PreciseMatting));

        let error = Response::Error {
            job_id: 1,
            message: "boom".to_string(),
            image: None,
        };
        assert!(error.is_terminal_for(JobKind::FastPreview));
    }
}
