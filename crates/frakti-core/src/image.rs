//! Image Manager (C7, spec §4.7): `imageRef` parsing and the stall-timeout
//! wrapper around a backend's streaming `PullImage`. Grounded in the
//! teacher's `image.rs` `pull()` progress-callback shape, repurposed here as
//! the trigger for a stall timer instead of a download-progress bar.

use crate::backend::{ImageBackend, ImageInfo, PullProgress};
use crate::error::{FraktiError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

/// No-progress window after which a pull is declared stalled (spec §4.7, §5).
pub const STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Split `imageRef` into `(repo, tag_or_digest)` per spec §4.7: digest form
/// splits on the first `@`; tag form splits on the last `:` whose right-hand
/// side contains no `/` (so a registry port like `host:5000/repo` is not
/// mistaken for a tag); otherwise defaults to `:latest`.
pub fn parse_image_ref(image_ref: &str) -> (String, String) {
    if let Some(idx) = image_ref.find('@') {
        return (image_ref[..idx].to_string(), image_ref[idx + 1..].to_string());
    }
    if let Some(idx) = image_ref.rfind(':') {
        if !image_ref[idx + 1..].contains('/') {
            return (image_ref[..idx].to_string(), image_ref[idx + 1..].to_string());
        }
    }
    (image_ref.to_string(), "latest".to_string())
}

pub struct ImageManager {
    backend: Arc<dyn ImageBackend>,
}

impl ImageManager {
    pub fn new(backend: Arc<dyn ImageBackend>) -> Self {
        Self { backend }
    }

    pub async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        self.backend.list_images().await
    }

    /// ImageStatus, spec §4.7: "not found" is `Ok(None)`, not an error.
    pub async fn image_status(&self, image_ref: &str) -> Result<Option<ImageInfo>> {
        self.backend.image_status(image_ref).await
    }

    pub async fn remove_image(&self, image_ref: &str) -> Result<()> {
        self.backend.remove_image(image_ref).await
    }

    /// PullImage, spec §4.7: drives the backend's progress channel, resetting
    /// a deadline on every message; fails `PULL_STALLED` if 60s pass with no
    /// progress. On success, fetches the canonical image id via `ImageStatus`.
    pub async fn pull_image(&self, image_ref: &str) -> Result<String> {
        let (_repo, _tag_or_digest) = parse_image_ref(image_ref);

        let (tx, mut rx) = mpsc::channel::<PullProgress>(16);
        let backend = Arc::clone(&self.backend);
        let image_ref_owned = image_ref.to_string();
        let pull_task = tokio::spawn(async move { backend.pull_image(&image_ref_owned, tx).await });

        let mut deadline = Instant::now() + STALL_TIMEOUT;
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(PullProgress::Progress { .. }) => {
                            deadline = Instant::now() + STALL_TIMEOUT;
                        }
                        Some(PullProgress::Done) => break,
                        None => break,
                    }
                }
                _ = time::sleep_until(deadline) => {
                    pull_task.abort();
                    return Err(FraktiError::pull_stalled(image_ref, STALL_TIMEOUT.as_secs()));
                }
            }
        }

        pull_task
            .await
            .map_err(|e| FraktiError::backend_unavailable("image", e.to_string()))??;

        let info = self
            .backend
            .image_status(image_ref)
            .await?
            .ok_or_else(|| FraktiError::not_found(image_ref))?;
        Ok(info.id)
    }
}
