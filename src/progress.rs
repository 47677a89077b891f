//! Coarse job progress reporting.

use std::fmt;
use std::sync::Mutex;
use tracing::info;

/// Lifecycle stage of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extracting,
    Analyzing,
    Rendering,
    Combining,
    Complete,
    Error,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Extracting => "extracting",
            Stage::Analyzing => "analyzing",
            Stage::Rendering => "rendering",
            Stage::Combining => "combining",
            Stage::Complete => "complete",
            Stage::Error => "error",
        };
        f.write_str(name)
    }
}

/// One progress report.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub stage: Stage,
    pub message: String,
    pub detail: String,
    /// `(frames done, total frames)` while rendering.
    pub frames: Option<(usize, usize)>,
}

/// Receiver of progress updates. Implementations must not block for long.
pub trait ProgressSink: Send + Sync {
    fn update(&self, update: ProgressUpdate);
}

/// Forwards updates to a sink, keeping the percentage non-decreasing.
///
/// The only exception is the terminal error update, which always reports 0.
pub struct ProgressReporter<'a> {
    sink: Option<&'a dyn ProgressSink>,
    last: u8,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(sink: Option<&'a dyn ProgressSink>) -> Self {
        Self { sink, last: 0 }
    }

    pub fn report(&mut self, percent: u8, stage: Stage, message: impl Into<String>, detail: impl Into<String>) {
        self.send(percent, stage, message.into(), detail.into(), None);
    }

    /// Rendering progress mapped into the 25..85 band.
    pub fn frames(&mut self, done: usize, total: usize) {
        let percent = rendering_percent(done, total);
        self.send(
            percent,
            Stage::Rendering,
            format!("Rendering frame {}/{}", done, total),
            String::new(),
            Some((done, total)),
        );
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        if let Some(sink) = self.sink {
            sink.update(ProgressUpdate {
                percent: 0,
                stage: Stage::Error,
                message: "Processing failed".to_string(),
                detail: message,
                frames: None,
            });
        }
    }

    fn send(&mut self, percent: u8, stage: Stage, message: String, detail: String, frames: Option<(usize, usize)>) {
        let percent = percent.min(100).max(self.last);
        self.last = percent;
        if let Some(sink) = self.sink {
            sink.update(ProgressUpdate { percent, stage, message, detail, frames });
        }
    }
}

/// Maps `done / total` frames onto 25..85 percent.
pub fn rendering_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 25;
    }
    let fraction = done.min(total) as f64 / total as f64;
    (25.0 + 60.0 * fraction).floor() as u8
}

/// Logs updates, rate-limited to every 20 percentage points while rendering.
#[derive(Default)]
pub struct LogProgress {
    last_logged: Mutex<Option<u8>>,
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for LogProgress {
    fn update(&self, update: ProgressUpdate) {
        let Ok(mut last) = self.last_logged.lock() else {
            return;
        };
        if update.stage == Stage::Rendering {
            if let Some(previous) = *last {
                if update.percent < previous.saturating_add(20) && update.percent < 85 {
                    return;
                }
            }
        }
        *last = Some(update.percent);
        match update.frames {
            Some((done, total)) => info!("[{:>3}%] {}: {}/{} frames", update.percent, update.stage, done, total),
            None if update.detail.is_empty() => info!("[{:>3}%] {}: {}", update.percent, update.stage, update.message),
            None => info!("[{:>3}%] {}: {} ({})", update.percent, update.stage, update.message, update.detail),
        }
    }
}

/// Records every update; used by tests and embedding hosts.
#[derive(Default)]
pub struct RecordingProgress {
    updates: Mutex<Vec<ProgressUpdate>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<ProgressUpdate> {
        self.updates.lock().map(|u| u.clone()).unwrap_or_default()
    }

    pub fn last(&self) -> Option<ProgressUpdate> {
        self.updates().pop()
    }
}

impl ProgressSink for RecordingProgress {
    fn update(&self, update: ProgressUpdate) {
        if let Ok(mut updates) = self.updates.lock() {
            updates.push(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendering_band_is_25_to_85() {
        assert_eq!(rendering_percent(0, 100), 25);
        assert_eq!(rendering_percent(50, 100), 55);
        assert_eq!(rendering_percent(100, 100), 85);
        assert_eq!(rendering_percent(150, 100), 85);
        assert_eq!(rendering_percent(0, 0), 25);
    }

    #[test]
    fn reporter_never_goes_backwards() {
        let sink = RecordingProgress::new();
        let mut reporter = ProgressReporter::new(Some(&sink));
        reporter.report(20, Stage::Analyzing, "Analyzing audio", "");
        reporter.report(10, Stage::Extracting, "late", "");
        reporter.frames(1, 10);
        let percents: Vec<u8> = sink.updates().iter().map(|u| u.percent).collect();
        assert_eq!(percents, vec![20, 20, 31]);
        assert_eq!(sink.last().unwrap().frames, Some((1, 10)));
    }

    #[test]
    fn error_reports_zero() {
        let sink = RecordingProgress::new();
        let mut reporter = ProgressReporter::new(Some(&sink));
        reporter.report(55, Stage::Rendering, "Rendering", "");
        reporter.error("GPU error: lost device");
        let last = sink.last().unwrap();
        assert_eq!((last.percent, last.stage), (0, Stage::Error));
        assert_eq!(last.detail, "GPU error: lost device");
    }

    #[test]
    fn reporter_without_sink_is_silent() {
        let mut reporter = ProgressReporter::new(None);
        reporter.report(100, Stage::Complete, "done", "");
        reporter.error("ignored");
    }
}
