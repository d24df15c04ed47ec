//! # Exception Attributes
//!
//! Names of the attributes carried by enriched `"exception"` span events and
//! by the live-stack span processors. The standard exception attributes are
//! re-exported from `opentelemetry-semantic-conventions`.

pub use opentelemetry_semantic_conventions::attribute::{
    EXCEPTION_MESSAGE, EXCEPTION_STACKTRACE, EXCEPTION_TYPE,
};

/// Name of the span event an exception is recorded as.
pub const EXCEPTION_EVENT_NAME: &str = "exception";

/// `true` if the exception was propagating out of the span's scope when it
/// was recorded.
pub const EXCEPTION_ESCAPED: &str = "exception.escaped";

/// JSON array of resolved frames, outermost caller first. Each element
/// carries the `exception.file` .. `exception.is_file_external` keys below.
///
/// # Examples
///
/// - `[{"exception.file":"src/main.rs","exception.line":10,"exception.function_name":"main",...}]`
pub const EXCEPTION_STACK_DETAILS: &str = "exception.stack_details";

/// Hex fingerprint of the resolved stack. Events sharing a signature on one
/// span are collapsed at span end.
///
/// # Examples
///
/// - `"5f0b1c2d3e4f5a6b7c8d9e0f1a2b3c4d"`
pub const EXCEPTION_STACK_SIGNATURE: &str = "exception.stack_signature";

/// Commit the running binary was built from.
pub const EXCEPTION_VCS_COMMIT_SHA: &str = "exception.vcs.commit_sha";

/// Repository the running binary was built from.
pub const EXCEPTION_VCS_REPOSITORY_URL: &str = "exception.vcs.repository_url";

/// Frame key: source file.
pub const FRAME_FILE: &str = "exception.file";
/// Frame key: 1-based line number.
pub const FRAME_LINE: &str = "exception.line";
/// Frame key: function name.
pub const FRAME_FUNCTION_NAME: &str = "exception.function_name";
/// Frame key: captured source window joined by newlines.
pub const FRAME_FUNCTION_BODY: &str = "exception.function_body";
/// Frame key: first line of the captured window, or `null`.
pub const FRAME_START_LINE: &str = "exception.start_line";
/// Frame key: last line of the captured window, or `null`.
pub const FRAME_END_LINE: &str = "exception.end_line";
/// Frame key: `true` if the file belongs to a dependency.
pub const FRAME_IS_FILE_EXTERNAL: &str = "exception.is_file_external";

/// Signature of the live stack at span start.
pub const PROFILING_STACK_ID: &str = "profiling.stack_id";
/// JSON array of the live stack's frames at span start.
pub const PROFILING_FRAMES: &str = "profiling.frames";
/// Per-frame ids (`file:function:line`) of the live stack at span start.
pub const PROFILING_FRAME_IDS: &str = "profiling.frame_ids";

/// Source surrounding the innermost application frame at span start.
///
/// # Examples
///
/// - `"path = src/main.rs at line 12\ncodeblock = 7: fn main() {\n8: ..."`
pub const CODE_SURROUNDING: &str = "code.surrounding";
