//! Inline sanitizer for generation token streams.
//!
//! Consumes tokens as they arrive and decides, per push, what is safe to
//! show the caller. Control markers (`WEATHER:`, `GOOGLE:`, `[search_id:`,
//! ...) are captured on a side channel instead of being emitted, and a
//! knowledge-gap admission in the opening line aborts visible output so the
//! orchestrator can re-route to a search. Tokens are never reordered and
//! never emitted twice; one sanitizer serves exactly one stream.

use crate::analyze;

/// Marker labels the generation model may emit. A line starting with (or
/// containing) one of these is a tool command, not prose.
pub(crate) const MARKER_LABELS: [&str; 8] = [
    "SEARCH:",
    "GOOGLE:",
    "WEATHER:",
    "REDDIT:",
    "RECALL:",
    "WIKI:",
    "WIKIPEDIA:",
    "[search_id:",
];

/// Longest tail withheld while it could still grow into a marker label.
const MAX_HOLD: usize = 12;
/// The opening line is verified once this many tokens arrive, newline or not.
const FIRST_LINE_TOKEN_CAP: usize = 100;
/// Marker scan needs at least this many chars before it can match a label.
const MIN_MARKER_SCAN: usize = 7;
/// Cutoff scan waits for a complete line or this many chars.
const MIN_CUTOFF_SCAN: usize = 15;
/// Tokens allowed after a label before the marker line is forced complete.
const MARKER_TOKEN_CAP: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizerState {
    Normal,
    BufferingMarker,
    EmittingToolCall,
    CutoffDetected,
    Terminal,
}

/// Side-channel outcome of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// A complete marker line, label included, e.g. `WEATHER: Boston`.
    Marker(String),
    /// The opening line admits a knowledge gap.
    Cutoff,
}

/// What one push produced: text safe to emit now, plus at most one signal.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Push {
    pub emit: String,
    pub signal: Option<Signal>,
}

impl Push {
    fn text(emit: String) -> Self {
        Push { emit, signal: None }
    }

    fn signal(signal: Signal) -> Self {
        Push {
            emit: String::new(),
            signal: Some(signal),
        }
    }
}

pub struct StreamSanitizer {
    state: SanitizerState,
    /// Opening-line verification window. While held, nothing is emitted.
    hold_first_line: bool,
    detect_cutoff: bool,
    line: String,
    line_tokens: usize,
    /// Mid-stream tail that could still become a marker label.
    hold: String,
    /// Marker line under capture, label included.
    marker: String,
    marker_tokens: usize,
    marker_from_first_line: bool,
}

impl StreamSanitizer {
    /// Guarded mode for a direct-answer attempt: the opening line is
    /// withheld until verified, and a cutoff admission in it is signaled.
    pub fn new() -> Self {
        StreamSanitizer {
            state: SanitizerState::BufferingMarker,
            hold_first_line: true,
            detect_cutoff: true,
            line: String::new(),
            line_tokens: 0,
            hold: String::new(),
            marker: String::new(),
            marker_tokens: 0,
            marker_from_first_line: false,
        }
    }

    /// Strip-only mode for synthesis passes: markers are still removed and
    /// signaled, but nothing is withheld up front and cutoff phrasing is
    /// left alone.
    pub fn strip_only() -> Self {
        StreamSanitizer {
            state: SanitizerState::Normal,
            hold_first_line: false,
            detect_cutoff: false,
            ..StreamSanitizer::new()
        }
    }

    pub fn state(&self) -> SanitizerState {
        self.state
    }

    /// Feeds one token and returns what may be shown now.
    pub fn push(&mut self, token: &str) -> Push {
        match self.state {
            SanitizerState::Terminal | SanitizerState::CutoffDetected => Push::default(),
            SanitizerState::EmittingToolCall => self.capture_marker(token),
            SanitizerState::Normal | SanitizerState::BufferingMarker => {
                if self.hold_first_line {
                    self.feed_first_line(token)
                } else {
                    self.feed(token)
                }
            }
        }
    }

    /// Ends the stream: flushes whatever is still safe, signals an
    /// unfinished marker line, and parks the machine in `Terminal`.
    pub fn finish(&mut self) -> Push {
        let out = match self.state {
            SanitizerState::Terminal | SanitizerState::CutoffDetected => Push::default(),
            SanitizerState::EmittingToolCall => {
                Push::signal(Signal::Marker(self.marker.trim_end().to_string()))
            }
            SanitizerState::Normal | SanitizerState::BufferingMarker => {
                if self.hold_first_line {
                    self.release_first_line()
                } else {
                    Push::text(std::mem::take(&mut self.hold))
                }
            }
        };
        self.state = SanitizerState::Terminal;
        out
    }

    /// Restores the constructed mode for a fresh stream.
    pub fn reset(&mut self) {
        *self = if self.detect_cutoff {
            StreamSanitizer::new()
        } else {
            StreamSanitizer::strip_only()
        };
    }

    /// Opening-line window: everything is withheld until the line either
    /// carries a marker, admits a cutoff, or completes clean.
    fn feed_first_line(&mut self, token: &str) -> Push {
        self.line.push_str(token);
        self.line_tokens += 1;

        if self.line.len() >= MIN_MARKER_SCAN {
            if let Some((idx, _)) = find_label(&self.line, false) {
                // The withheld prefix is dropped with the line; a command
                // line is never partially shown.
                let marker = self.line.split_off(idx);
                self.line.clear();
                return self.begin_marker(marker, true);
            }
        }

        let line_complete = token.contains('\n') || self.line_tokens >= FIRST_LINE_TOKEN_CAP;
        if self.detect_cutoff
            && (line_complete || self.line.len() >= MIN_CUTOFF_SCAN)
            && analyze::admits_knowledge_gap(&self.line)
        {
            self.line.clear();
            self.state = SanitizerState::CutoffDetected;
            return Push::signal(Signal::Cutoff);
        }

        if line_complete {
            self.hold_first_line = false;
            self.state = SanitizerState::Normal;
            return Push::text(std::mem::take(&mut self.line));
        }
        Push::default()
    }

    /// Stream-end release of a still-held opening line, with one last
    /// marker and cutoff check so short streams are not under-inspected.
    fn release_first_line(&mut self) -> Push {
        let line = std::mem::take(&mut self.line);
        if let Some((idx, _)) = find_label(&line, false) {
            return Push::signal(Signal::Marker(line[idx..].trim_end().to_string()));
        }
        if self.detect_cutoff && analyze::admits_knowledge_gap(&line) {
            return Push::signal(Signal::Cutoff);
        }
        Push::text(line)
    }

    /// Pass-through with a marker hold: complete labels split the buffer,
    /// a tail that could still become a label is retained, everything else
    /// flows out unchanged.
    fn feed(&mut self, token: &str) -> Push {
        self.hold.push_str(token);

        if let Some((idx, _)) = find_label(&self.hold, true) {
            let marker = self.hold.split_off(idx);
            let clean = std::mem::take(&mut self.hold);
            let mut out = self.begin_marker(marker, false);
            out.emit.insert_str(0, &clean);
            return out;
        }

        match longest_label_prefix(&self.hold) {
            Some(0) => {
                if self.hold.len() > MAX_HOLD {
                    self.state = SanitizerState::Normal;
                    return Push::text(std::mem::take(&mut self.hold));
                }
                self.state = SanitizerState::BufferingMarker;
                Push::default()
            }
            Some(pos) => {
                let tail = self.hold.split_off(pos);
                let emit = std::mem::replace(&mut self.hold, tail);
                self.state = SanitizerState::BufferingMarker;
                Push::text(emit)
            }
            None => {
                self.state = SanitizerState::Normal;
                Push::text(std::mem::take(&mut self.hold))
            }
        }
    }

    fn begin_marker(&mut self, marker: String, from_first_line: bool) -> Push {
        self.state = SanitizerState::EmittingToolCall;
        self.marker = marker;
        self.marker_tokens = 0;
        self.marker_from_first_line = from_first_line;
        self.try_complete_marker(false)
    }

    /// Accumulates the marker line until a newline, a sentence break, or
    /// the token cap completes it.
    fn capture_marker(&mut self, token: &str) -> Push {
        self.marker.push_str(token);
        self.marker_tokens += 1;
        self.try_complete_marker(self.marker_tokens >= MARKER_TOKEN_CAP)
    }

    fn try_complete_marker(&mut self, force: bool) -> Push {
        let split = self
            .marker
            .find('\n')
            .map(|i| (i, 1))
            .or_else(|| self.marker.find(". ").map(|i| (i + 1, 1)));

        let (line, rest) = match split {
            Some((end, skip)) => {
                let rest = self.marker[end + skip..].to_string();
                self.marker.truncate(end);
                (std::mem::take(&mut self.marker), rest)
            }
            None if force => (std::mem::take(&mut self.marker), String::new()),
            None => return Push::default(),
        };

        let from_first_line = self.marker_from_first_line;
        self.hold_first_line = false;
        self.state = SanitizerState::Normal;

        let mut out = Push::signal(Signal::Marker(line.trim_end().to_string()));
        // Text after a first-line command is never shown; the stream is
        // about to be aborted anyway. Mid-stream the remainder is prose.
        if !from_first_line && !rest.is_empty() {
            let refed = self.feed(&rest);
            out.emit.push_str(&refed.emit);
            if out.signal.is_none() {
                out.signal = refed.signal;
            }
        }
        out
    }
}

impl Default for StreamSanitizer {
    fn default() -> Self {
        StreamSanitizer::new()
    }
}

/// Earliest occurrence of any marker label. The opening-line scan is
/// case-insensitive; mid-stream only verbatim labels count, so lowercase
/// prose like "google: it" survives.
fn find_label(text: &str, case_sensitive: bool) -> Option<(usize, &'static str)> {
    let bytes = text.as_bytes();
    let mut best: Option<(usize, &'static str)> = None;
    for label in MARKER_LABELS {
        let needle = label.as_bytes();
        if bytes.len() < needle.len() {
            continue;
        }
        for start in 0..=bytes.len() - needle.len() {
            let window = &bytes[start..start + needle.len()];
            let hit = if case_sensitive {
                window == needle
            } else {
                window.eq_ignore_ascii_case(needle)
            };
            if hit {
                if best.map_or(true, |(b, _)| start < b) {
                    best = Some((start, label));
                }
                break;
            }
        }
    }
    best
}

/// Byte position where the longest suffix that is still a prefix of some
/// label begins, if any. `Some(0)` means the whole buffer could be one.
fn longest_label_prefix(text: &str) -> Option<usize> {
    for (pos, _) in text.char_indices() {
        let suffix = &text[pos..];
        if MARKER_LABELS.iter().any(|l| l.starts_with(suffix)) {
            return Some(pos);
        }
    }
    None
}
