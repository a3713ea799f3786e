//! Log file tailing and buffering for the log pane.
//!
//! Services write straight into their log files, so the TUI follows those files
//! instead of capturing pipes. `LogTail` reads whatever was appended since the
//! last poll and keeps the most recent lines in a `LogBuffer`.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use strip_ansi_escapes::strip;

/// How much of an existing log is read when tailing starts.
const INITIAL_TAIL_BYTES: u64 = 64 * 1024;
/// Upper bound for a single poll, so a runaway service cannot stall the UI.
const MAX_READ_BYTES: u64 = 1024 * 1024;
/// Longest run without a newline kept before it is flushed as a line.
const MAX_PARTIAL_BYTES: usize = 64 * 1024;

/// A fixed-capacity ring buffer of log lines.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: String) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.lines.iter()
    }
}

/// Follows a single log file.
#[derive(Debug, Clone)]
pub struct LogTail {
    path: Option<PathBuf>,
    offset: u64,
    partial: Vec<u8>,
    // Set when reading starts mid-file; the first fragment is discarded.
    skip_first_line: bool,
    buffer: LogBuffer,
}

impl LogTail {
    pub fn new(max_lines: usize) -> Self {
        Self {
            path: None,
            offset: 0,
            partial: Vec::new(),
            skip_first_line: false,
            buffer: LogBuffer::new(max_lines),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn lines(&self) -> &LogBuffer {
        &self.buffer
    }

    /// Switches to another file (or none) and loads its tail.
    ///
    /// Re-attaching to the current file is a no-op.
    pub fn attach(&mut self, path: Option<&Path>) -> usize {
        if self.path.as_deref() == path {
            return 0;
        }
        self.path = path.map(Path::to_path_buf);
        self.reset();
        let Some(path) = self.path.clone() else {
            return 0;
        };
        // Skip straight to the last chunk of large logs.
        if let Ok(len) = std::fs::metadata(&path).map(|m| m.len()) {
            if len > INITIAL_TAIL_BYTES {
                self.offset = len - INITIAL_TAIL_BYTES;
                self.skip_first_line = true;
            }
        }
        self.poll()
    }

    /// Reads newly appended data. Returns the number of complete lines added.
    ///
    /// A file that shrank was truncated or replaced and is re-read from the start.
    pub fn poll(&mut self) -> usize {
        let Some(path) = self.path.clone() else {
            return 0;
        };
        let Ok(mut file) = File::open(&path) else {
            return 0;
        };
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if len < self.offset {
            self.reset();
        }
        if len == self.offset {
            return 0;
        }
        if file.seek(SeekFrom::Start(self.offset)).is_err() {
            return 0;
        }
        let mut bytes = Vec::new();
        let read = match file.take(MAX_READ_BYTES).read_to_end(&mut bytes) {
            Ok(read) => read,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "log read failed");
                return 0;
            }
        };
        self.offset += read as u64;
        self.ingest(&bytes)
    }

    fn ingest(&mut self, bytes: &[u8]) -> usize {
        self.partial.extend_from_slice(bytes);
        let mut added = 0;
        let mut start = 0;
        while let Some(offset) = self.partial[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let raw = &self.partial[start..end];
            start = end + 1;
            if std::mem::take(&mut self.skip_first_line) {
                continue;
            }
            self.buffer.push(decode_line(raw));
            added += 1;
        }
        self.partial.drain(..start);

        // Progress bars and binary output may never send a newline.
        if self.partial.len() > MAX_PARTIAL_BYTES {
            let raw = std::mem::take(&mut self.partial);
            if !std::mem::take(&mut self.skip_first_line) {
                self.buffer.push(decode_line(&raw));
                added += 1;
            }
        }
        added
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.partial.clear();
        self.skip_first_line = false;
        self.buffer.clear();
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end_matches('\r').to_string()
}

/// Removes ANSI escape codes for display. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn collected(tail: &LogTail) -> Vec<String> {
        tail.lines().iter().cloned().collect()
    }

    #[test]
    fn log_buffer_drops_oldest() {
        let mut buffer = LogBuffer::new(2);
        buffer.push("a".into());
        buffer.push("b".into());
        assert!(buffer.push("c".into()));
        assert_eq!(buffer.iter().cloned().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn tail_follows_appends_and_holds_partial_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.log");
        append(&path, "one\r\ntwo\nthr");
        let mut tail = LogTail::new(100);
        assert_eq!(tail.attach(Some(&path)), 2);
        assert_eq!(collected(&tail), vec!["one", "two"]);

        append(&path, "ee\nfour\n");
        assert_eq!(tail.poll(), 2);
        assert_eq!(collected(&tail), vec!["one", "two", "three", "four"]);
        assert_eq!(tail.poll(), 0);
    }

    #[test]
    fn tail_restarts_after_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.log");
        append(&path, "old line that is long\n");
        let mut tail = LogTail::new(100);
        tail.attach(Some(&path));
        std::fs::write(&path, "new\n").unwrap();
        tail.poll();
        assert_eq!(collected(&tail), vec!["new"]);
    }

    #[test]
    fn tail_of_large_file_starts_at_a_line_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.log");
        let line = "x".repeat(99);
        let mut text = String::new();
        for _ in 0..2000 {
            text.push_str(&line);
            text.push('\n');
        }
        append(&path, &text);
        let mut tail = LogTail::new(10_000);
        let added = tail.attach(Some(&path));
        assert!(added > 0 && added < 2000);
        assert!(tail.lines().iter().all(|l| l.len() == 99));
    }

    #[test]
    fn missing_file_yields_nothing_until_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.log");
        let mut tail = LogTail::new(10);
        assert_eq!(tail.attach(Some(&path)), 0);
        append(&path, "hello\n");
        assert_eq!(tail.poll(), 1);
        assert_eq!(tail.attach(Some(&path)), 0);
        tail.attach(None);
        assert!(tail.lines().is_empty());
    }

    #[test]
    fn one_poll_ingests_many_short_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatty.log");
        let mut text = String::new();
        for i in 0..60_000 {
            text.push_str(&format!("line {:06}\n", i));
        }
        append(&path, &text);
        // Read from the start instead of the attach-time tail.
        let mut tail = LogTail::new(100_000);
        tail.path = Some(path.clone());
        assert_eq!(tail.poll(), 60_000);
        assert_eq!(tail.lines().iter().last().map(String::as_str), Some("line 059999"));
        assert!(tail.partial.is_empty());
    }

    #[test]
    fn output_without_newlines_stays_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.log");
        let mut tail = LogTail::new(100);
        tail.attach(Some(&path));
        let chunk = "progress 42%\r".repeat(8_000);
        for _ in 0..8 {
            append(&path, &chunk);
            tail.poll();
            assert!(tail.partial.len() <= MAX_PARTIAL_BYTES);
        }
        assert!(!tail.lines().is_empty());
        assert!(tail
            .lines()
            .iter()
            .all(|line| line.starts_with("progress 42%")));
    }

    #[test]
    fn sanitize_strips_ansi() {
        assert_eq!(sanitize_text("\u{1b}[31mred\u{1b}[0m"), "red");
        assert_eq!(sanitize_text("plain"), "plain");
    }
}
