//! Test doubles shared by the daemon's unit tests.

use crate::extractor::{DescriptorExtractor, ExtractError};
use rollcall_core::Descriptor;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("rollcalld-test-{}", uuid::Uuid::new_v4()))
}

type Answer = Result<Option<Descriptor>, ExtractError>;

/// Extractor answering from a script, then repeating a fallback answer.
pub struct FakeExtractor {
    script: Mutex<VecDeque<Answer>>,
    fallback: Answer,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Counts a call as active until its future completes or is dropped.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeExtractor {
    pub fn always(values: Vec<f32>) -> Self {
        Self::new(VecDeque::new(), Ok(Some(Descriptor::new(values))))
    }

    pub fn scripted(answers: Vec<Answer>) -> Self {
        Self::new(answers.into(), Ok(None))
    }

    fn new(script: VecDeque<Answer>, fallback: Answer) -> Self {
        Self {
            script: Mutex::new(script),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most calls ever running at the same time.
    pub fn peak_concurrent(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl DescriptorExtractor for FakeExtractor {
    async fn extract(&self, _image: Vec<u8>) -> Result<Option<Descriptor>, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);
        let answer = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        answer
    }
}
