//! 进度上报

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

use crate::core::error::ErrorKind;

/// 任务上报边界（由调用方实现）
pub trait ProgressReporter: Send + Sync {
    fn on_progress(&self, percent: u8);
    fn on_complete(&self, output_path: &Path, remux_error: Option<&str>);
    fn on_failure(&self, kind: ErrorKind, message: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn on_progress(&self, _percent: u8) {}
    fn on_complete(&self, _output_path: &Path, _remux_error: Option<&str>) {}
    fn on_failure(&self, _kind: ErrorKind, _message: &str) {}
}

/// 记录所有回调，便于断言
#[derive(Debug, Default)]
pub struct RecordingReporter {
    progress: Mutex<Vec<u8>>,
    completed: Mutex<Option<(PathBuf, Option<String>)>>,
    failure: Mutex<Option<(ErrorKind, String)>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress_values(&self) -> Vec<u8> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn completed(&self) -> Option<(PathBuf, Option<String>)> {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn failure(&self) -> Option<(ErrorKind, String)> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ProgressReporter for RecordingReporter {
    fn on_progress(&self, percent: u8) {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(percent);
    }

    fn on_complete(&self, output_path: &Path, remux_error: Option<&str>) {
        *self.completed.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((output_path.to_path_buf(), remux_error.map(str::to_string)));
    }

    fn on_failure(&self, kind: ErrorKind, message: &str) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((kind, message.to_string()));
    }
}

/// 进度跟踪：单调不减，处理阶段最多到 99，成功后才到 100
pub struct ProgressTracker {
    total_frames: u64,
    interval: u64,
    current: AtomicU8,
    reporter: Arc<dyn ProgressReporter>,
}

impl ProgressTracker {
    pub fn new(total_frames: u64, interval: u64, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            total_frames,
            interval: interval.max(1),
            current: AtomicU8::new(0),
            reporter,
        }
    }

    pub fn percent_for(written: u64, total: u64) -> u8 {
        if total == 0 {
            return 0;
        }
        (written.saturating_mul(100) / total).min(100) as u8
    }

    /// 每写出一帧调用一次，按 interval 节流
    pub fn frames_written(&self, written: u64) {
        if written % self.interval != 0 && written != self.total_frames {
            return;
        }
        let percent = Self::percent_for(written, self.total_frames).min(99);
        self.advance(percent);
    }

    pub fn complete(&self) {
        self.advance(100);
    }

    pub fn current(&self) -> u8 {
        self.current.load(Ordering::Acquire)
    }

    fn advance(&self, percent: u8) {
        let previous = self.current.fetch_max(percent, Ordering::AcqRel);
        if percent > previous {
            debug!("Progress {}%", percent);
            self.reporter.on_progress(percent);
        }
    }
}
