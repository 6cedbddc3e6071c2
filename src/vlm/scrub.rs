//! Prefix scrubbing for prompt-echoing token streams.
//!
//! Some engines stream the decoded prompt before the answer. The scrubber
//! buffers chunks until the role marker that opens the assistant turn has been
//! seen, drops everything up to and including the last marker, and passes every
//! later chunk through untouched.

/// Role header that opens the assistant turn once special tokens are stripped.
pub const ASSISTANT_MARKER: &str = "assistant\n";

#[derive(Debug, Clone)]
pub struct MarkerScrubber {
    marker: String,
    /// Markers the echoed prompt contains; release waits until this many are buffered.
    expected: usize,
    prebuf: String,
    cleaned: bool,
}

impl Default for MarkerScrubber {
    fn default() -> Self {
        Self::new(ASSISTANT_MARKER)
    }
}

impl MarkerScrubber {
    pub fn new(marker: impl Into<String>) -> Self {
        Self { marker: marker.into(), expected: 1, prebuf: String::new(), cleaned: false }
    }

    /// Wait for `n` markers before trimming. History with assistant turns puts
    /// several markers in the echo; streaming it in pieces must not release on
    /// the first one. Values below 1 are treated as 1.
    pub fn with_expected_markers(mut self, n: usize) -> Self {
        self.expected = n.max(1);
        self
    }

    /// Feed one chunk; returns text to forward, if any.
    pub fn push(&mut self, chunk: &str) -> Option<String> {
        if chunk.is_empty() {
            return None;
        }
        if self.cleaned {
            return Some(chunk.to_string());
        }

        self.prebuf.push_str(chunk);
        if self.prebuf.matches(self.marker.as_str()).count() < self.expected {
            return None;
        }
        let idx = self.prebuf.rfind(self.marker.as_str())?;
        self.cleaned = true;
        let rest = self.prebuf.split_off(idx + self.marker.len());
        self.prebuf.clear();
        (!rest.is_empty()).then_some(rest)
    }

    /// End of stream. Returns the buffered prefix that was never released
    /// because the marker did not appear; that text is discarded.
    pub fn finish(&mut self) -> Option<String> {
        if self.cleaned || self.prebuf.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.prebuf))
    }
}
