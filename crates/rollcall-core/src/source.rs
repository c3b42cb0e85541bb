//! Frame sources and cooperative cancellation.

use image::GrayImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
    #[error("capture failed: {0}")]
    Failed(String),
}

/// A lazy, non-restartable sequence of grayscale frames.
///
/// `Ok(None)` means the source is exhausted. Callers treat both exhaustion
/// and a mid-stream error as the end of their loop.
pub trait CaptureSource {
    fn next_frame(&mut self) -> Result<Option<GrayImage>, CaptureError>;
}

/// A finite, pre-recorded sequence of frames.
pub struct Replay<I> {
    frames: I,
}

impl<I> Replay<I>
where
    I: Iterator<Item = GrayImage>,
{
    pub fn new(frames: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            frames: frames.into_iter(),
        }
    }
}

impl<I> CaptureSource for Replay<I>
where
    I: Iterator<Item = GrayImage>,
{
    fn next_frame(&mut self) -> Result<Option<GrayImage>, CaptureError> {
        Ok(self.frames.next())
    }
}

/// Shared abort flag, checked once per frame by the blocking loops.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn test_replay_exhausts() {
        let mut source = Replay::new(vec![GrayImage::new(2, 2)]);
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());
    }
}
