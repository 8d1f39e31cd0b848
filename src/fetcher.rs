use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ModelVariant;
use crate::errors::{CutoutError, Result};
use crate::traits::{BlobCache, ModelTransport};
use crate::types::{ModelBytes, ProgressEvent};

/// Upper bound on the buffer reserved from a `Content-Length` header.
const MAX_PREALLOCATION: u64 = 64 << 20;

/// HTTP(S) transport with a whole-request timeout and chunked reads.
///
/// The declared length is only a hint: the buffer grows with the bytes that
/// actually arrive, and a body that over- or under-runs it is rejected.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CutoutError::configuration(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ModelTransport for HttpTransport {
    async fn fetch(
        &self,
        url: &str,
        on_chunk: &mut (dyn FnMut(u64, Option<u64>) + Send),
    ) -> Result<Vec<u8>> {
        let download_error = |reason: String| CutoutError::Download {
            url: url.to_string(),
            reason,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| download_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(download_error(format!("http_{}", response.status().as_u16())));
        }

        let total = response.content_length().filter(|n| *n > 0);
        let mut buf = Vec::with_capacity(total.map_or(0, |n| n.min(MAX_PREALLOCATION)) as usize);
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| download_error(e.to_string()))?
        {
            buf.extend_from_slice(&chunk);
            if let Some(total) = total.filter(|total| buf.len() as u64 > *total) {
                return Err(download_error(format!(
                    "body exceeds declared length of {total} bytes"
                )));
            }
            on_chunk(buf.len() as u64, total);
        }

        if let Some(total) = total {
            if buf.len() as u64 != total {
                return Err(download_error(format!(
                    "truncated body: {} of {} bytes",
                    buf.len(),
                    total
                )));
            }
        }
        Ok(buf)
    }
}

/// Cache-first model acquisition over an ordered list of sources.
pub struct ModelFetcher<T: ModelTransport, C: BlobCache> {
    transport: T,
    cache: C,
    timeout: Duration,
}

impl<T: ModelTransport, C: BlobCache> ModelFetcher<T, C> {
    pub const fn new(transport: T, cache: C, timeout: Duration) -> Self {
        Self {
            transport,
            cache,
            timeout,
        }
    }

    pub const fn cache(&self) -> &C {
        &self.cache
    }

    /// Returns the model bytes, from the cache when present.
    ///
    /// On a miss every source is tried in order; the first one that completes
    /// is written to the cache and returned. Per-source failures (including
    /// timeouts) are logged and skipped. `downloading` events with a fraction
    /// are emitted only when the source reports its total size.
    pub async fn get_model_bytes(
        &self,
        variant: &ModelVariant,
        cancel: &CancellationToken,
        on_progress: &mut (dyn FnMut(ProgressEvent) + Send),
    ) -> Result<ModelBytes> {
        match self.cache.get(&variant.key) {
            Ok(Some(bytes)) => {
                info!(key = %variant.key, bytes = bytes.len(), "model cache hit");
                return Ok(ModelBytes::new(&variant.key, bytes));
            }
            Ok(None) => debug!(key = %variant.key, "model cache miss"),
            Err(e) => warn!(key = %variant.key, error = %e, "model cache unreadable, downloading"),
        }

        let mut attempted = 0;
        for url in &variant.sources {
            attempted += 1;
            match self.download(url, cancel, on_progress).await {
                Ok(bytes) => {
                    info!(key = %variant.key, %url, bytes = bytes.len(), "model downloaded");
                    if let Err(e) = self.cache.put(&variant.key, &bytes) {
                        warn!(key = %variant.key, error = %e, "failed to cache model bytes");
                    }
                    return Ok(ModelBytes::new(&variant.key, bytes));
                }
                Err(e) => debug!(%url, error = %e, "model source failed"),
            }
            if cancel.is_cancelled() {
                break;
            }
        }

        Err(CutoutError::ModelNotFound {
            key: variant.key.clone(),
            attempts: attempted,
        })
    }

    async fn download(
        &self,
        url: &str,
        cancel: &CancellationToken,
        on_progress: &mut (dyn FnMut(ProgressEvent) + Send),
    ) -> Result<Vec<u8>> {
        let mut last_percent = 0u32;
        let mut on_chunk = |received: u64, total: Option<u64>| {
            let Some(total) = total else { return };
            let fraction = (received as f64 / total as f64).min(1.0);
            let percent = (fraction * 100.0).floor() as u32;
            if percent > last_percent {
                last_percent = percent;
                on_progress(ProgressEvent::downloading(Some(fraction as f32)));
            }
        };

        let fetch = tokio::time::timeout(self.timeout, self.transport.fetch(url, &mut on_chunk));
        tokio::select! {
            _ = cancel.cancelled() => Err(CutoutError::Download {
                url: url.to_string(),
                reason: "cancelled".to_string(),
            }),
            result = fetch => match result {
                Ok(bytes) => bytes,
                Err(_) => Err(CutoutError::Download {
                    url: url.to_string(),
                    reason: format!("timed out after {:?}", self.timeout),
                }),
            },
        }
    }
}
