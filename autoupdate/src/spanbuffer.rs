//! A span processor that buffers ended spans emitted before the process has
//! a real exporter, then hands them off once one is installed.
//!
//! Early startup produces spans worth keeping (config resolution, library
//! lookup) at a point where no exporter can exist yet. This processor holds
//! a bounded buffer of those spans; installing a child drains the buffer to
//! it in insertion order and turns the processor into a plain pass-through
//! for the rest of the process lifetime.

use anyhow::Result;
use log::debug;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

/// Spans held before an exporter exists. Capacity beyond this is dropped
/// silently.
const DEFAULT_BUFFER_CAPACITY: usize = 500;

/// A finished span. Deliberately small: just what an exporter needs to
/// reconstruct the startup timeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanData {
    pub name: String,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    pub attributes: Vec<(String, String)>,
}

/// The processing seam between span producers and an exporter.
pub trait SpanProcessor: Send + Sync + std::fmt::Debug {
    fn on_start(&self, span: &SpanData);
    fn on_end(&self, span: SpanData);
    fn force_flush(&self) -> Result<()>;

    /// Tears the processor down. `cancel` is the caller's cancellation
    /// signal; implementations must return promptly once it reads true
    /// rather than blocking on a final flush.
    fn shutdown(&self, cancel: &AtomicBool) -> Result<()>;
}

#[derive(Debug)]
enum State {
    Buffering(Vec<SpanData>),
    Forwarding(Box<dyn SpanProcessor>),
}

#[derive(Debug)]
pub struct BufferedSpanProcessor {
    capacity: usize,
    state: Mutex<State>,
    is_shutdown: AtomicBool,
}

impl Default for BufferedSpanProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedSpanProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        BufferedSpanProcessor {
            capacity,
            state: Mutex::new(State::Buffering(Vec::new())),
            is_shutdown: AtomicBool::new(false),
        }
    }

    /// Installs the real downstream processor. Any previously installed child
    /// is shut down and discarded, the buffered spans are replayed to `child`
    /// in insertion order, and the buffer is cleared. Buffering never resumes
    /// after this call.
    pub fn set_child(&self, child: Box<dyn SpanProcessor>) {
        let mut state = self.state.lock().expect("span buffer lock poisoned");
        match std::mem::replace(&mut *state, State::Forwarding(child)) {
            State::Buffering(spans) => {
                debug!("replaying {} buffered spans to new span processor", spans.len());
                let State::Forwarding(child) = &*state else {
                    unreachable!("state was just set to Forwarding");
                };
                for span in spans {
                    child.on_end(span);
                }
            }
            State::Forwarding(previous) => {
                // Replacement is not a caller-driven shutdown, so there is
                // no signal to honor here.
                if let Err(e) = previous.shutdown(&AtomicBool::new(false)) {
                    debug!("error shutting down replaced span processor: {e}");
                }
            }
        }
    }

    /// The number of spans currently buffered. Zero once a child is
    /// installed.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        match &*self.state.lock().expect("span buffer lock poisoned") {
            State::Buffering(spans) => spans.len(),
            State::Forwarding(_) => 0,
        }
    }
}

impl SpanProcessor for BufferedSpanProcessor {
    fn on_start(&self, span: &SpanData) {
        // Starts are only interesting to a real processor; the buffer holds
        // ended spans.
        if let State::Forwarding(child) = &*self.state.lock().expect("span buffer lock poisoned") {
            child.on_start(span);
        }
    }

    fn on_end(&self, span: SpanData) {
        let mut state = self.state.lock().expect("span buffer lock poisoned");
        match &mut *state {
            State::Buffering(spans) => {
                if spans.len() < self.capacity {
                    spans.push(span);
                } else {
                    debug!("span buffer full, dropping span `{}`", span.name);
                }
            }
            State::Forwarding(child) => child.on_end(span),
        }
    }

    fn force_flush(&self) -> Result<()> {
        match &*self.state.lock().expect("span buffer lock poisoned") {
            State::Buffering(_) => Ok(()),
            State::Forwarding(child) => child.force_flush(),
        }
    }

    fn shutdown(&self, cancel: &AtomicBool) -> Result<()> {
        if self.is_shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        if cancel.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("span processor shutdown was cancelled"));
        }
        let result = match &*self.state.lock().expect("span buffer lock poisoned") {
            State::Buffering(_) => Ok(()),
            State::Forwarding(child) => child.shutdown(cancel),
        };
        // A cancelled or failed shutdown may be retried; only a completed
        // one latches.
        if result.is_ok() {
            self.is_shutdown.store(true, Ordering::SeqCst);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[derive(Debug, Default)]
    struct RecordingProcessor {
        ended: Mutex<Vec<SpanData>>,
        shutdowns: AtomicUsize,
    }

    impl SpanProcessor for Arc<RecordingProcessor> {
        fn on_start(&self, _span: &SpanData) {}

        fn on_end(&self, span: SpanData) {
            self.ended.lock().unwrap().push(span);
        }

        fn force_flush(&self) -> Result<()> {
            Ok(())
        }

        fn shutdown(&self, _cancel: &AtomicBool) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn span(name: &str) -> SpanData {
        SpanData {
            name: name.to_string(),
            start_time_unix_nano: 1,
            end_time_unix_nano: 2,
            attributes: vec![],
        }
    }

    #[test]
    fn replays_buffered_spans_in_order_then_passes_through() {
        let buffer = BufferedSpanProcessor::new();
        for i in 0..3 {
            buffer.on_end(span(&format!("span-{i}")));
        }
        assert_eq!(buffer.buffered_len(), 3);

        let child = Arc::new(RecordingProcessor::default());
        buffer.set_child(Box::new(Arc::clone(&child)));

        let names: Vec<String> = child.ended.lock().unwrap().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["span-0", "span-1", "span-2"]);
        assert_eq!(buffer.buffered_len(), 0);

        // Spans arriving after the handoff skip the buffer entirely.
        buffer.on_end(span("later"));
        assert_eq!(buffer.buffered_len(), 0);
        assert_eq!(child.ended.lock().unwrap().len(), 4);
    }

    #[test]
    fn drops_spans_beyond_capacity() {
        let buffer = BufferedSpanProcessor::with_capacity(500);
        for i in 0..501 {
            buffer.on_end(span(&format!("span-{i}")));
        }
        assert_eq!(buffer.buffered_len(), 500);

        let child = Arc::new(RecordingProcessor::default());
        buffer.set_child(Box::new(Arc::clone(&child)));
        let ended = child.ended.lock().unwrap();
        assert_eq!(ended.len(), 500);
        assert_eq!(ended.last().unwrap().name, "span-499");
    }

    #[test]
    fn replacing_a_child_shuts_down_the_previous_one() {
        let buffer = BufferedSpanProcessor::new();
        let first = Arc::new(RecordingProcessor::default());
        let second = Arc::new(RecordingProcessor::default());

        buffer.set_child(Box::new(Arc::clone(&first)));
        buffer.set_child(Box::new(Arc::clone(&second)));

        assert_eq!(first.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(second.shutdowns.load(Ordering::SeqCst), 0);

        buffer.on_end(span("post-swap"));
        assert!(first.ended.lock().unwrap().is_empty());
        assert_eq!(second.ended.lock().unwrap().len(), 1);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let buffer = BufferedSpanProcessor::new();
        let child = Arc::new(RecordingProcessor::default());
        buffer.set_child(Box::new(Arc::clone(&child)));

        let cancel = AtomicBool::new(false);
        buffer.shutdown(&cancel).unwrap();
        buffer.shutdown(&cancel).unwrap();
        assert_eq!(child.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_shutdown_returns_without_touching_the_child() {
        let buffer = BufferedSpanProcessor::new();
        let child = Arc::new(RecordingProcessor::default());
        buffer.set_child(Box::new(Arc::clone(&child)));

        let err = buffer.shutdown(&AtomicBool::new(true)).unwrap_err();
        assert!(err.to_string().contains("cancelled"), "{err}");
        assert_eq!(child.shutdowns.load(Ordering::SeqCst), 0);

        // A cancelled shutdown does not latch; a later uncancelled call
        // completes the teardown.
        buffer.shutdown(&AtomicBool::new(false)).unwrap();
        assert_eq!(child.shutdowns.load(Ordering::SeqCst), 1);
    }
}
