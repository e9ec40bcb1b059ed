//! Progress and status reporting.
//!
//! Long-running operations receive a [`Reporter`], which pairs an optional
//! [`ProgressSink`] with the [`ProgressScope`] the current step owns. Codecs
//! only report a local `0.0..=1.0` fraction; the scope rescales it onto the
//! outer bar. Every message is also sent to the `log` facade.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Receiver for status lines and the overall progress fraction.
pub trait ProgressSink: Send + Sync {
    fn message(&self, level: LogLevel, text: &str);
    fn set_progress(&self, fraction: f32);

    /// Toggle a busy indicator for steps with no measurable progress.
    fn set_indeterminate(&self, _on: bool) {}

    /// Expect the bar to move from `from` by `span` over `expected`.
    fn show_progress(&self, _from: f32, _span: f32, _expected: Duration) {}
}

/// The portion `[start, start + size)` of an outer progress bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressScope {
    pub start: f32,
    pub size: f32,
}

impl ProgressScope {
    pub fn full() -> Self {
        Self {
            start: 0.0,
            size: 1.0,
        }
    }

    /// Map a local fraction into the outer bar.
    pub fn map(&self, local: f32) -> f32 {
        self.start + self.size * local.clamp(0.0, 1.0)
    }

    /// A sub-scope expressed in fractions of this scope.
    pub fn nest(&self, start: f32, size: f32) -> Self {
        Self {
            start: self.map(start),
            size: self.size * size.clamp(0.0, 1.0),
        }
    }
}

impl Default for ProgressScope {
    fn default() -> Self {
        Self::full()
    }
}

#[derive(Clone, Copy)]
pub struct Reporter<'a> {
    sink: Option<&'a dyn ProgressSink>,
    scope: ProgressScope,
}

impl<'a> Reporter<'a> {
    pub fn new(sink: Option<&'a dyn ProgressSink>) -> Self {
        Self {
            sink,
            scope: ProgressScope::full(),
        }
    }

    pub fn silent() -> Reporter<'static> {
        Reporter {
            sink: None,
            scope: ProgressScope::full(),
        }
    }

    pub fn scope(&self) -> ProgressScope {
        self.scope
    }

    pub fn with_scope(&self, scope: ProgressScope) -> Self {
        Self {
            sink: self.sink,
            scope,
        }
    }

    /// Narrow to a sub-range of the current scope.
    pub fn scoped(&self, start: f32, size: f32) -> Self {
        self.with_scope(self.scope.nest(start, size))
    }

    pub fn info(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        log::info!("{text}");
        self.emit(LogLevel::Info, text);
    }

    pub fn warn(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        log::warn!("{text}");
        self.emit(LogLevel::Warning, text);
    }

    pub fn error(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        log::error!("{text}");
        self.emit(LogLevel::Error, text);
    }

    pub fn progress(&self, local: f32) {
        if let Some(sink) = self.sink {
            sink.set_progress(self.scope.map(local));
        }
    }

    pub fn indeterminate(&self, on: bool) {
        if let Some(sink) = self.sink {
            sink.set_indeterminate(on);
        }
    }

    /// Let the bar creep across this whole scope over `expected` while a
    /// step that reports nothing runs.
    pub fn timed(&self, expected: Duration) {
        if let Some(sink) = self.sink {
            sink.show_progress(self.scope.start, self.scope.size, expected);
        }
    }

    fn emit(&self, level: LogLevel, text: &str) {
        if let Some(sink) = self.sink {
            sink.message(level, text);
        }
    }
}

/// A message queued for display.
#[derive(Debug, Clone, PartialEq)]
pub struct LogMessage {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
struct TimedAdvance {
    origin: Instant,
    duration: Duration,
    from: f32,
    span: f32,
}

/// Display state shared between the engine and a [`ProgressTicker`].
#[derive(Debug)]
pub struct ProgressState {
    pub fraction: f32,
    pub indeterminate: bool,
    pub animation_frame: u32,
    pub log_messages: VecDeque<LogMessage>,
    timed: Option<TimedAdvance>,
    ticking: bool,
}

impl ProgressState {
    fn new() -> Self {
        Self {
            fraction: 0.0,
            indeterminate: false,
            animation_frame: 0,
            log_messages: VecDeque::new(),
            timed: None,
            ticking: false,
        }
    }

    fn tick(&mut self, now: Instant) {
        if self.indeterminate {
            self.animation_frame = self.animation_frame.wrapping_add(1);
        }
        if let Some(t) = self.timed {
            let elapsed = now.saturating_duration_since(t.origin).as_secs_f32();
            let total = t.duration.as_secs_f32();
            let ratio = if total > 0.0 {
                (elapsed / total).min(1.0)
            } else {
                1.0
            };
            let target = t.from + t.span * ratio;
            if target > self.fraction {
                self.fraction = target;
            }
            if ratio >= 1.0 {
                self.timed = None;
            }
        }
    }
}

/// Mutex-guarded progress state, usable as a [`ProgressSink`].
#[derive(Clone)]
pub struct SharedProgress {
    inner: Arc<Mutex<ProgressState>>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProgressState::new())),
        }
    }

    pub fn fraction(&self) -> f32 {
        self.inner.lock().map(|s| s.fraction).unwrap_or(0.0)
    }

    pub fn animation_frame(&self) -> u32 {
        self.inner.lock().map(|s| s.animation_frame).unwrap_or(0)
    }

    pub fn drain_messages(&self) -> Vec<LogMessage> {
        self.inner
            .lock()
            .map(|mut s| s.log_messages.drain(..).collect())
            .unwrap_or_default()
    }

    /// Start the background tick. `on_tick` sees the state after every tick,
    /// under the lock. Stops when the returned ticker is dropped.
    pub fn start_ticker<F>(&self, interval: Duration, mut on_tick: F) -> ProgressTicker
    where
        F: FnMut(&mut ProgressState) + Send + 'static,
    {
        if let Ok(mut s) = self.inner.lock() {
            s.ticking = true;
        }
        let state = Arc::clone(&self.inner);
        let handle = thread::spawn(move || loop {
            thread::sleep(interval);
            match state.lock() {
                Ok(mut s) if s.ticking => {
                    s.tick(Instant::now());
                    on_tick(&mut s);
                }
                _ => break,
            }
        });
        ProgressTicker {
            state: Arc::clone(&self.inner),
            handle: Some(handle),
        }
    }
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for SharedProgress {
    fn message(&self, level: LogLevel, text: &str) {
        if let Ok(mut s) = self.inner.lock() {
            s.log_messages.push_back(LogMessage {
                level,
                message: text.to_string(),
            });
        }
    }

    fn set_progress(&self, fraction: f32) {
        if let Ok(mut s) = self.inner.lock() {
            s.fraction = fraction.clamp(0.0, 1.0);
            if s.timed.is_some_and(|t| s.fraction >= t.from + t.span) {
                s.timed = None;
            }
        }
    }

    fn set_indeterminate(&self, on: bool) {
        if let Ok(mut s) = self.inner.lock() {
            s.indeterminate = on;
        }
    }

    /// Explicit `set_progress` calls still win when they are further along.
    fn show_progress(&self, from: f32, span: f32, expected: Duration) {
        if let Ok(mut s) = self.inner.lock() {
            s.timed = Some(TimedAdvance {
                origin: Instant::now(),
                duration: expected,
                from,
                span,
            });
        }
    }
}

pub struct ProgressTicker {
    state: Arc<Mutex<ProgressState>>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        if let Ok(mut s) = self.state.lock() {
            s.ticking = false;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Human-readable byte size.
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}
