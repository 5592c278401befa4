use super::{StreamError, StreamEvent};

/// Receiver for everything a [`super::LineStreamParser`] produces.
///
/// Callbacks run synchronously inside `process_chunk`/`flush`, in line order.
pub trait EventSink {
    /// A validated event, forwarded in arrival order.
    fn on_event(&mut self, event: StreamEvent);

    /// A recoverable per-line or per-chunk failure.
    fn on_error(&mut self, _error: StreamError) {}

    /// The buffer exceeded its limit; `size` is the discarded byte count.
    fn on_overflow(&mut self, _size: usize) {}
}

/// Sink that keeps everything it receives.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub events: Vec<StreamEvent>,
    pub errors: Vec<StreamError>,
    pub overflows: Vec<usize>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventSink for CollectingSink {
    fn on_event(&mut self, event: StreamEvent) {
        self.events.push(event);
    }

    fn on_error(&mut self, error: StreamError) {
        self.errors.push(error);
    }

    fn on_overflow(&mut self, size: usize) {
        self.overflows.push(size);
    }
}
