//! # Frame Extraction
//!
//! Turns the raw location of a call frame into a [`StackFrame`]: a resolved
//! file, line and function together with a window of the surrounding source
//! and a flag telling whether the file belongs to a dependency rather than to
//! the application.
//!
//! The window covers the whole enclosing function when it is short, and is
//! otherwise centred on the frame's line:
//!
//! ```ascii
//!   fn short() {        <- start_line        fn long() {
//!       ...                                      ...
//!       boom()?;        <- line                  ...         <- line - max_window/2
//!       ...                                      boom()?;    <- line
//!   }                   <- end_line              ...         <- line + max_window/2
//!                                                ...
//!                                            }
//! ```
use crate::cache::{FrameKey, StackCache};
use crate::error::EnrichmentError;
use opentelemetry::otel_debug;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Function name used when the runtime could not resolve a frame.
pub const UNKNOWN_FUNCTION: &str = "<unknown>";

/// Default maximum number of lines a captured function body may have before
/// the window is centred on the frame's line instead.
pub(crate) const DEFAULT_MAX_WINDOW: usize = 20;
/// Default cap on the size of a source file read during extraction.
pub(crate) const DEFAULT_MAX_SOURCE_BYTES: u64 = 1024 * 1024;
/// How far above a frame's line the enclosing function is searched for.
const MAX_FUNCTION_SCAN: usize = 2_000;

/// Path segments that mark a file as dependency code.
const DEFAULT_DEPENDENCY_MARKERS: &[&str] = &[
    "/.cargo/registry/",
    "/.cargo/git/",
    "/rustc/",
    "/vendor/",
    "/site-packages/",
    "/dist-packages/",
];

/// Source location of a frame as reported by the host runtime.
///
/// Every field is optional because symbolication can fail partially.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawFrame {
    /// Source file, absolute or relative to the working directory.
    pub file: Option<String>,
    /// 1-based line number.
    pub line: Option<u32>,
    /// Function name.
    pub function: Option<String>,
    /// First and last line of the enclosing function, when the runtime knows
    /// them.
    pub function_span: Option<(u32, u32)>,
}

impl RawFrame {
    /// Create a fully resolved frame location.
    pub fn new(file: impl Into<String>, line: u32, function: impl Into<String>) -> Self {
        RawFrame {
            file: Some(file.into()),
            line: Some(line),
            function: Some(function.into()),
            function_span: None,
        }
    }

    /// Set the bounds of the enclosing function.
    pub fn with_function_span(mut self, start: u32, end: u32) -> Self {
        self.function_span = Some((start, end));
        self
    }
}

/// One line of captured source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLine {
    /// 1-based line number.
    pub number: u32,
    /// Line text without the trailing newline.
    pub text: String,
}

/// A resolved call frame. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackFrame {
    file_path: String,
    line_number: u32,
    function_name: String,
    source_window: Vec<SourceLine>,
    is_external: bool,
    start_line: Option<u32>,
    end_line: Option<u32>,
}

impl StackFrame {
    /// Frame whose source could not be read. Carries a single diagnostic line;
    /// `is_external` comes from the path alone.
    pub(crate) fn unresolved(
        file_path: String,
        line_number: u32,
        function_name: String,
        reason: &str,
        is_external: bool,
    ) -> Self {
        StackFrame {
            file_path,
            line_number,
            function_name,
            source_window: vec![SourceLine {
                number: line_number,
                text: format!("<source unavailable: {reason}>"),
            }],
            is_external,
            start_line: None,
            end_line: None,
        }
    }

    /// Sentinel for a frame the runtime could not resolve at all.
    pub(crate) fn unknown(raw: &RawFrame) -> Self {
        StackFrame {
            file_path: raw
                .file
                .clone()
                .unwrap_or_else(|| UNKNOWN_FUNCTION.to_string()),
            line_number: raw.line.unwrap_or(0),
            function_name: UNKNOWN_FUNCTION.to_string(),
            source_window: Vec::new(),
            is_external: true,
            start_line: None,
            end_line: None,
        }
    }

    /// Source file as reported by the runtime.
    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// 1-based line number.
    pub fn line_number(&self) -> u32 {
        self.line_number
    }

    /// Function name.
    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Captured source lines, in file order.
    pub fn source_window(&self) -> &[SourceLine] {
        &self.source_window
    }

    /// Whether the file belongs to a dependency.
    pub fn is_external(&self) -> bool {
        self.is_external
    }

    /// First line of the captured window.
    pub fn start_line(&self) -> Option<u32> {
        self.start_line
    }

    /// Last line of the captured window.
    pub fn end_line(&self) -> Option<u32> {
        self.end_line
    }

    /// The captured window as one newline separated string.
    pub fn function_body(&self) -> String {
        self.source_window
            .iter()
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Decides whether a source file belongs to a dependency.
pub trait ExternalClassifier: Send + Sync {
    /// Returns `true` for third-party or toolchain code.
    fn is_external(&self, path: &Path) -> bool;
}

impl<F> ExternalClassifier for F
where
    F: Fn(&Path) -> bool + Send + Sync,
{
    fn is_external(&self, path: &Path) -> bool {
        self(path)
    }
}

/// Classifies a file as external when its path contains one of a set of
/// dependency-root markers such as `/.cargo/registry/`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependencyRoots {
    markers: Vec<String>,
}

impl DependencyRoots {
    /// Use exactly the given markers. Markers are matched against the path
    /// with `/` separators.
    pub fn new<I, M>(markers: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        DependencyRoots {
            markers: markers.into_iter().map(Into::into).collect(),
        }
    }

    /// Add one more marker.
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.markers.push(marker.into());
        self
    }
}

impl Default for DependencyRoots {
    fn default() -> Self {
        DependencyRoots::new(DEFAULT_DEPENDENCY_MARKERS.iter().copied())
    }
}

impl ExternalClassifier for DependencyRoots {
    fn is_external(&self, path: &Path) -> bool {
        let normalized = path.to_string_lossy().replace('\\', "/");
        self.markers
            .iter()
            .any(|marker| normalized.contains(marker.as_str()))
    }
}

/// Resolves raw frames into [`StackFrame`]s, consulting a [`StackCache`]
/// first.
#[derive(Clone)]
pub struct FrameExtractor {
    working_directory: PathBuf,
    max_window: usize,
    max_source_bytes: u64,
    function_bodies: bool,
    classifier: Arc<dyn ExternalClassifier>,
}

impl fmt::Debug for FrameExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameExtractor")
            .field("working_directory", &self.working_directory)
            .field("max_window", &self.max_window)
            .field("max_source_bytes", &self.max_source_bytes)
            .field("function_bodies", &self.function_bodies)
            .finish_non_exhaustive()
    }
}

impl Default for FrameExtractor {
    fn default() -> Self {
        FrameExtractor::new(std::env::current_dir().unwrap_or_default())
    }
}

impl FrameExtractor {
    /// Create an extractor resolving relative paths against
    /// `working_directory`.
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        FrameExtractor {
            working_directory: working_directory.into(),
            max_window: DEFAULT_MAX_WINDOW,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            function_bodies: true,
            classifier: Arc::new(DependencyRoots::default()),
        }
    }

    /// Largest function body captured whole.
    pub fn with_max_window(mut self, max_window: usize) -> Self {
        self.max_window = max_window;
        self
    }

    /// Largest source file that will be read.
    pub fn with_max_source_bytes(mut self, max_source_bytes: u64) -> Self {
        self.max_source_bytes = max_source_bytes;
        self
    }

    /// When disabled, windows are always centred on the frame's line and
    /// function bounds are ignored.
    pub fn with_function_bodies(mut self, enabled: bool) -> Self {
        self.function_bodies = enabled;
        self
    }

    /// Replace the dependency classifier.
    pub fn with_classifier<C>(mut self, classifier: C) -> Self
    where
        C: ExternalClassifier + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Directory relative paths are resolved against.
    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Resolve one frame. Never fails: unreadable sources degrade to a
    /// diagnostic window and unresolvable frames to a sentinel.
    pub fn extract(&self, raw: &RawFrame, cache: &StackCache) -> Arc<StackFrame> {
        let (Some(file), Some(line)) = (raw.file.as_deref(), raw.line) else {
            return Arc::new(StackFrame::unknown(raw));
        };
        let function = raw.function.as_deref().unwrap_or(UNKNOWN_FUNCTION);
        let key = FrameKey::new(file, line, function);

        if let Some(frame) = cache.get(&key) {
            return frame;
        }

        let frame = Arc::new(self.resolve(&key, raw.function_span));
        cache.put(key, frame.clone());
        frame
    }

    fn resolve(&self, key: &FrameKey, function_span: Option<(u32, u32)>) -> StackFrame {
        let path = self.locate(&key.file_path);
        let source = match read_source(&path, self.max_source_bytes) {
            Ok(source) => source,
            Err(err) => {
                otel_debug!(
                    name: "FrameExtractor.SourceUnavailable",
                    file = key.file_path.as_str(),
                    reason = err.to_string()
                );
                return StackFrame::unresolved(
                    key.file_path.clone(),
                    key.line_number,
                    key.function_name.clone(),
                    &err.to_string(),
                    self.classifier.is_external(&path),
                );
            }
        };

        let lines: Vec<&str> = source.lines().collect();
        let span = if self.function_bodies {
            function_span.or_else(|| enclosing_function(&lines, key.line_number))
        } else {
            None
        };
        let window = source_window(lines.len(), key.line_number, span, self.max_window);

        let source_window = window
            .map(|(start, end)| {
                (start..=end)
                    .map(|number| SourceLine {
                        number,
                        text: lines[(number - 1) as usize].to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        StackFrame {
            file_path: key.file_path.clone(),
            line_number: key.line_number,
            function_name: key.function_name.clone(),
            source_window,
            is_external: self.classifier.is_external(&path),
            start_line: window.map(|(start, _)| start),
            end_line: window.map(|(_, end)| end),
        }
    }

    /// Absolute paths are used as is. Relative ones are tried against the
    /// working directory and then each of its ancestors, since debug info
    /// records paths relative to wherever the compiler was invoked.
    fn locate(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        self.working_directory
            .ancestors()
            .map(|dir| dir.join(path))
            .find(|candidate| candidate.is_file())
            .unwrap_or_else(|| self.working_directory.join(path))
    }
}

fn read_source(path: &Path, max_bytes: u64) -> Result<String, EnrichmentError> {
    let size = fs::metadata(path)?.len();
    if size > max_bytes {
        return Err(EnrichmentError::SourceTooLarge {
            size,
            limit: max_bytes,
        });
    }
    let bytes = fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Bounds (1-based, inclusive) of the lines to capture for `line` in a file
/// of `total_lines` lines, or `None` when the line lies outside the file.
///
/// A known function span containing `line` is captured whole when it has at
/// most `max_window` lines; otherwise `max_window / 2` lines either side of
/// `line` are taken, clipped to the file.
pub(crate) fn source_window(
    total_lines: usize,
    line: u32,
    function_span: Option<(u32, u32)>,
    max_window: usize,
) -> Option<(u32, u32)> {
    let total = u32::try_from(total_lines).unwrap_or(u32::MAX);
    if line == 0 || line > total {
        return None;
    }

    if let Some((start, end)) = function_span {
        let start = start.max(1);
        let end = end.min(total);
        if start <= line && line <= end && (end - start + 1) as usize <= max_window {
            return Some((start, end));
        }
    }

    let half = u32::try_from(max_window / 2).unwrap_or(u32::MAX);
    Some((
        line.saturating_sub(half).max(1),
        line.saturating_add(half).min(total),
    ))
}

/// Finds the `fn` item enclosing `line` by scanning upwards for a signature
/// and matching its braces. Returns 1-based inclusive bounds.
pub(crate) fn enclosing_function(lines: &[&str], line: u32) -> Option<(u32, u32)> {
    let target = line as usize;
    if target == 0 || target > lines.len() {
        return None;
    }

    let lowest = target.saturating_sub(MAX_FUNCTION_SCAN);
    for start in (lowest..target).rev() {
        if !is_fn_signature(lines[start]) {
            continue;
        }
        if let Some(end) = closing_brace(lines, start) {
            if end + 1 >= target {
                return Some((start as u32 + 1, end as u32 + 1));
            }
        }
    }
    None
}

fn is_fn_signature(line: &str) -> bool {
    for word in line.split_whitespace() {
        match word {
            "fn" => return true,
            "pub" | "async" | "const" | "unsafe" | "extern" | "default" | "\"C\"" => continue,
            w if w.starts_with("pub(") => continue,
            _ => return false,
        }
    }
    false
}

/// Index of the line holding the brace that closes the body opened at or
/// after `start`. String and char literals and comments are skipped.
fn closing_brace(lines: &[&str], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut opened = false;
    let mut in_string = false;
    let mut in_block_comment = false;

    for (idx, line) in lines.iter().enumerate().skip(start) {
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();

            if in_block_comment {
                if c == '*' && next == Some('/') {
                    in_block_comment = false;
                    i += 1;
                }
                i += 1;
                continue;
            }
            if in_string {
                match c {
                    '\\' => i += 1,
                    '"' => in_string = false,
                    _ => {}
                }
                i += 1;
                continue;
            }

            match c {
                '/' if next == Some('/') => break,
                '/' if next == Some('*') => {
                    in_block_comment = true;
                    i += 1;
                }
                '"' => in_string = true,
                '\'' => {
                    // char literal, as opposed to a lifetime
                    if next == Some('\\') {
                        if let Some(offset) = chars
                            .get(i + 2..)
                            .and_then(|rest| rest.iter().position(|&ch| ch == '\''))
                        {
                            i += offset + 2;
                        }
                    } else if chars.get(i + 2) == Some(&'\'') {
                        i += 2;
                    }
                }
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' => {
                    depth = depth.saturating_sub(1);
                    if opened && depth == 0 {
                        return Some(idx);
                    }
                }
                // a bodiless declaration, e.g. a trait method
                ';' if !opened => return None,
                _ => {}
            }
            i += 1;
        }
    }
    None
}
