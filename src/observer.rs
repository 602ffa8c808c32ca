//! Frame observers: live preview and screenshot archive.
//!
//! The session publishes every captured frame on a [`FrameBus`]. Observers
//! run on their own blocking tasks and never feed anything back into the
//! capture loop; an observer that falls behind simply misses frames.

use crate::types::Frame;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors raised by an observer while handling a frame
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Broadcast channel carrying captured frames
#[derive(Debug, Clone)]
pub struct FrameBus {
    tx: broadcast::Sender<Arc<Frame>>,
}

impl FrameBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send a frame to every subscriber; never blocks
    pub fn publish(&self, frame: Arc<Frame>) {
        // No subscribers is fine
        let _ = self.tx.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.tx.subscribe()
    }
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Side-effect-only consumer of frames
pub trait FrameObserver: Send + 'static {
    fn name(&self) -> &str;

    fn observe(&mut self, frame: &Frame) -> Result<(), ObserverError>;
}

/// Run `observer` on a blocking task until the bus is dropped
pub fn spawn_observer<O: FrameObserver>(bus: &FrameBus, mut observer: O) -> JoinHandle<()> {
    let mut rx = bus.subscribe();

    tokio::task::spawn_blocking(move || loop {
        match rx.blocking_recv() {
            Ok(frame) => {
                if let Err(e) = observer.observe(&frame) {
                    warn!("{} failed on frame {}: {}", observer.name(), frame.seq, e);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!("{} lagging, skipped {} frames", observer.name(), skipped);
            }
            Err(RecvError::Closed) => {
                debug!("{} stopped", observer.name());
                break;
            }
        }
    })
}

fn save_png_atomic(image: &image::DynamicImage, path: &Path) -> Result<(), ObserverError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("png.tmp");
    image.save_with_format(&tmp, image::ImageFormat::Png)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Saves every frame as `screenshot_<seq>_<timestamp>.png`
pub struct FrameArchive {
    dir: PathBuf,
    saved: usize,
}

impl FrameArchive {
    /// Create the archive, removing screenshots left by an earlier session
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ObserverError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let removed = clear_screenshots(&dir)?;
        if removed > 0 {
            info!("Cleared {} old screenshots from {}", removed, dir.display());
        }

        Ok(Self { dir, saved: 0 })
    }

    pub fn saved(&self) -> usize {
        self.saved
    }

    pub fn file_name(frame: &Frame) -> String {
        format!(
            "screenshot_{:04}_{}.png",
            frame.seq,
            frame.captured_at.format("%Y%m%d_%H%M%S")
        )
    }
}

/// Delete `screenshot_*.png` files in `dir`, returning how many were removed
pub fn clear_screenshots(dir: &Path) -> Result<usize, ObserverError> {
    let pattern = format!(
        "{}/screenshot_*.png",
        glob::Pattern::escape(&dir.to_string_lossy())
    );

    let mut removed = 0;
    let entries = glob::glob(&pattern).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;
    for path in entries.flatten() {
        fs::remove_file(&path)?;
        removed += 1;
    }
    Ok(removed)
}

impl FrameObserver for FrameArchive {
    fn name(&self) -> &str {
        "frame archive"
    }

    fn observe(&mut self, frame: &Frame) -> Result<(), ObserverError> {
        let path = self.dir.join(Self::file_name(frame));
        save_png_atomic(&frame.image, &path)?;
        self.saved += 1;
        debug!("📸 Saved {}", path.display());
        Ok(())
    }
}

/// Keeps a downscaled copy of the latest frame on disk
pub struct PreviewWriter {
    path: PathBuf,
    max_dim: u32,
}

impl PreviewWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_dim: 800,
        }
    }

    pub fn with_max_dim(mut self, max_dim: u32) -> Self {
        self.max_dim = max_dim.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameObserver for PreviewWriter {
    fn name(&self) -> &str {
        "preview"
    }

    fn observe(&mut self, frame: &Frame) -> Result<(), ObserverError> {
        let image = &frame.image;
        let preview = if image.width() > self.max_dim || image.height() > self.max_dim {
            image.thumbnail(self.max_dim, self.max_dim)
        } else {
            image.clone()
        };

        save_png_atomic(&preview, &self.path)?;
        debug!(
            "Preview updated ({}x{}) for frame {}",
            preview.width(),
            preview.height(),
            frame.seq
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CaptureTarget;
    use image::{DynamicImage, RgbImage};

    fn frame(seq: u64, width: u32, height: u32) -> Frame {
        Frame::new(
            seq,
            DynamicImage::ImageRgb8(RgbImage::new(width, height)),
            CaptureTarget::FullDisplay,
        )
    }

    #[test]
    fn test_archive_file_name() {
        let name = FrameArchive::file_name(&frame(7, 2, 2));
        assert!(name.starts_with("screenshot_0007_"));
        assert!(name.ends_with(".png"));
    }

    #[test]
    fn test_archive_clears_old_screenshots_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("screenshot_0001_20240101_000000.png"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

        let mut archive = FrameArchive::new(dir.path()).unwrap();
        assert!(!dir.path().join("screenshot_0001_20240101_000000.png").exists());
        assert!(dir.path().join("notes.txt").exists());

        let f = frame(1, 4, 4);
        archive.observe(&f).unwrap();
        assert_eq!(archive.saved(), 1);
        assert!(dir.path().join(FrameArchive::file_name(&f)).exists());
    }

    #[test]
    fn test_preview_is_downscaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.png");
        let mut preview = PreviewWriter::new(&path).with_max_dim(50);

        preview.observe(&frame(1, 200, 100)).unwrap();

        let written = image::open(&path).unwrap();
        assert_eq!(written.width(), 50);
        assert_eq!(written.height(), 25);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_observer_sees_published_frames() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FrameBus::new(8);
        let archive = FrameArchive::new(dir.path()).unwrap();
        let handle = spawn_observer(&bus, archive);

        bus.publish(Arc::new(frame(1, 4, 4)));
        bus.publish(Arc::new(frame(2, 4, 4)));
        drop(bus);
        handle.await.unwrap();

        let count = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 2);
    }
}
