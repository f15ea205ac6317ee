//! Line-oriented output parsing.
//!
//! Raw bytes from a child process arrive in arbitrary chunks. [`LineParser`]
//! reassembles them into trimmed lines, and [`ProgressTracker`] scans each
//! line for a percentage and a filename so observers can show what is being
//! fetched and how far along it is. Both extracted values are sticky: a line
//! without a match leaves the previous value in place.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;

/// Extensions recognised as "the file currently being fetched".
pub const DEFAULT_FILE_EXTENSIONS: &[&str] = &[
    "gguf",
    "safetensors",
    "tar.gz",
    "tar.xz",
    "tgz",
    "zip",
    "dmg",
    "pkg",
    "whl",
    "bin",
];

/// An observational signal derived from tool output. Never mutates step state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A complete, trimmed, non-empty output line.
    Line(String),
    /// Completion fraction in `[0.0, 1.0]`.
    Percent(f64),
    /// Filename-like token seen in the output.
    File(String),
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line(line) => write!(f, "{}", line),
            Self::Percent(fraction) => write!(f, "{:.0}%", fraction * 100.0),
            Self::File(name) => write!(f, "fetching {}", name),
        }
    }
}

/// Incremental byte-to-line splitter.
///
/// Both `\n` and `\r` terminate a line, so carriage-return progress redraws
/// surface as separate lines. Lines that are empty after trimming are dropped,
/// which also makes a `\r\n` split across two chunks indistinguishable from
/// one delivered whole.
#[derive(Debug, Default)]
pub struct LineParser {
    pending: Vec<u8>,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if let Some(line) = take_line(&mut self.pending) {
                    lines.push(line);
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// End of stream: flush the trailing partial line, if any.
    pub fn finish(&mut self) -> Option<String> {
        take_line(&mut self.pending)
    }

    /// Bytes buffered since the last terminator.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// Decoding happens per complete line so a multi-byte character split across
// chunks is never mangled.
fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    let raw = std::mem::take(buf);
    let text = String::from_utf8_lossy(&raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn percent_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b(\d{1,3})%").expect("static regex"))
}

/// First `N%` token in `line`, as a fraction clamped to `[0.0, 1.0]`.
pub fn parse_percent(line: &str) -> Option<f64> {
    let caps = percent_pattern().captures(line)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some((value / 100.0).clamp(0.0, 1.0))
}

fn file_pattern_for(extensions: &[&str]) -> Regex {
    let mut exts: Vec<&str> = extensions.to_vec();
    // Longest first so `tar.gz` wins over `gz`.
    exts.sort_by_key(|e| std::cmp::Reverse(e.len()));
    let alternation = exts
        .iter()
        .map(|e| regex::escape(e))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b([A-Za-z0-9._-]+\.(?:{}))\b", alternation))
        .expect("escaped extension alternation is a valid regex")
}

/// Sticky latest-known progress state.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    percent: Option<f64>,
    file: Option<String>,
    file_pattern: Regex,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::with_extensions(DEFAULT_FILE_EXTENSIONS)
    }

    pub fn with_extensions(extensions: &[&str]) -> Self {
        Self {
            percent: None,
            file: None,
            file_pattern: file_pattern_for(extensions),
        }
    }

    /// Record a line and return the events it produced: always the line
    /// itself, then a `File` and/or `Percent` event if either matched.
    pub fn observe(&mut self, line: &str) -> Vec<ProgressEvent> {
        let mut events = vec![ProgressEvent::Line(line.to_string())];

        if let Some(name) = self.file_pattern.captures(line).and_then(|c| c.get(1)) {
            let name = name.as_str().to_string();
            self.file = Some(name.clone());
            events.push(ProgressEvent::File(name));
        }

        if let Some(fraction) = parse_percent(line) {
            self.percent = Some(fraction);
            events.push(ProgressEvent::Percent(fraction));
        }

        events
    }

    pub fn percent(&self) -> Option<f64> {
        self.percent
    }

    pub fn current_file(&self) -> Option<&str> {
        self.file.as_deref()
    }
}

/// [`LineParser`] and [`ProgressTracker`] combined: bytes in, events out.
#[derive(Debug, Default)]
pub struct OutputParser {
    lines: LineParser,
    tracker: ProgressTracker,
}

impl OutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tracker(tracker: ProgressTracker) -> Self {
        Self {
            lines: LineParser::new(),
            tracker,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ProgressEvent> {
        self.lines
            .feed(chunk)
            .iter()
            .flat_map(|line| self.tracker.observe(line))
            .collect()
    }

    pub fn finish(&mut self) -> Vec<ProgressEvent> {
        match self.lines.finish() {
            Some(line) => self.tracker.observe(&line),
            None => Vec::new(),
        }
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }
}
