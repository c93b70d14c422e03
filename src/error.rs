//! Error types for the mlld interpreter

use std::path::PathBuf;
use thiserror::Error;

/// Source location information for error messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: Option<PathBuf>,
    pub line: u32,
    pub column: u32,
    pub offset: usize,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32, offset: usize) -> Self {
        Self {
            file: None,
            line,
            column,
            offset,
        }
    }

    pub fn in_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }
}

impl Default for SourceLocation {
    fn default() -> Self {
        Self {
            file: None,
            line: 1,
            column: 1,
            offset: 0,
        }
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{}:{}:{}", file.display(), self.line, self.column)
        } else {
            write!(f, "{}:{}", self.line, self.column)
        }
    }
}

/// How an error should be treated by the propagation policy.
///
/// Permissive mode continues past `Recoverable` and `Info` errors with a
/// placeholder; strict mode re-throws everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    Recoverable,
    Info,
}

/// Sub-code for import failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportErrorCode {
    CircularImport,
    ModuleNotFound,
    HashMismatch,
    ExportMissing,
}

impl ImportErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportErrorCode::CircularImport => "CIRCULAR_IMPORT",
            ImportErrorCode::ModuleNotFound => "MODULE_NOT_FOUND",
            ImportErrorCode::HashMismatch => "HASH_MISMATCH",
            ImportErrorCode::ExportMissing => "EXPORT_MISSING",
        }
    }
}

/// Sub-code for pipeline failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    RetryExhausted,
    Timeout,
    StageThrow,
}

impl PipelineErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineErrorKind::RetryExhausted => "PIPELINE_RETRY_EXHAUSTED",
            PipelineErrorKind::Timeout => "PIPELINE_TIMEOUT",
            PipelineErrorKind::StageThrow => "PIPELINE_STAGE_THROW",
        }
    }
}

/// Captured state of a failed shell or host-language execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionDetail {
    pub command: Option<String>,
    pub exit_code: Option<i32>,
    pub stderr: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub duration_ms: Option<u64>,
}

/// Main error type for the interpreter
///
/// `Clone` because the evaluator's memo cache preserves error outcomes
#[derive(Debug, Clone, Error)]
pub enum MlldError {
    #[error("ParseError: {message}{}", format_location(.location))]
    Parse {
        message: String,
        /// Summary of what the parser would have accepted at this point
        expected: Vec<String>,
        location: Option<SourceLocation>,
    },

    #[error("ResolutionError: {message}{}", format_location(.location))]
    Resolution {
        message: String,
        location: Option<SourceLocation>,
    },

    #[error("PathValidationError: {message}")]
    PathValidation { message: String, path: String },

    #[error("ImportError: {message}{}", format_location(.location))]
    Import {
        code: ImportErrorCode,
        message: String,
        path: String,
        location: Option<SourceLocation>,
    },

    #[error("DirectiveError: /{directive_kind} {message}{}", format_location(.location))]
    Directive {
        directive_kind: String,
        subtype: String,
        message: String,
        location: Option<SourceLocation>,
    },

    #[error("ExecutionError: {message}")]
    Execution {
        message: String,
        detail: ExecutionDetail,
        location: Option<SourceLocation>,
    },

    #[error("PipelineError: {message} (stage {stage})")]
    Pipeline {
        kind: PipelineErrorKind,
        message: String,
        /// 1-based user-visible stage index
        stage: usize,
    },

    #[error("SecurityError: {message}")]
    Security { message: String },

    /// Intentional early termination via `/bail`; exit code 2
    #[error("{message}")]
    Bail { message: String },

    /// Host requested cancellation; exit code 3
    #[error("cancelled")]
    Cancelled,

    /// A StructuredValue could not be coerced to parsed data
    #[error("StructuredCoerce: {message}")]
    StructuredCoerce { message: String },

    #[error("ExecutionOverflow: call depth exceeded {limit}")]
    ExecutionOverflow { limit: usize },

    /// Unexpected interpreter states; should never surface in correct code
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_location(location: &Option<SourceLocation>) -> String {
    match location {
        Some(loc) => format!(" at {}", loc),
        None => String::new(),
    }
}

impl MlldError {
    pub fn parse(message: impl Into<String>, location: SourceLocation) -> Self {
        MlldError::Parse {
            message: message.into(),
            expected: Vec::new(),
            location: Some(location),
        }
    }

    pub fn parse_expecting(
        message: impl Into<String>,
        expected: Vec<String>,
        location: SourceLocation,
    ) -> Self {
        MlldError::Parse {
            message: message.into(),
            expected,
            location: Some(location),
        }
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        MlldError::Resolution {
            message: message.into(),
            location: None,
        }
    }

    pub fn resolution_at(message: impl Into<String>, location: SourceLocation) -> Self {
        MlldError::Resolution {
            message: message.into(),
            location: Some(location),
        }
    }

    pub fn path_validation(message: impl Into<String>, path: impl Into<String>) -> Self {
        MlldError::PathValidation {
            message: message.into(),
            path: path.into(),
        }
    }

    pub fn import(
        code: ImportErrorCode,
        message: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        MlldError::Import {
            code,
            message: message.into(),
            path: path.into(),
            location: None,
        }
    }

    pub fn directive(
        kind: impl Into<String>,
        subtype: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        MlldError::Directive {
            directive_kind: kind.into(),
            subtype: subtype.into(),
            message: message.into(),
            location: None,
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        MlldError::Execution {
            message: message.into(),
            detail: ExecutionDetail::default(),
            location: None,
        }
    }

    pub fn pipeline(kind: PipelineErrorKind, message: impl Into<String>, stage: usize) -> Self {
        MlldError::Pipeline {
            kind,
            message: message.into(),
            stage,
        }
    }

    pub fn security(message: impl Into<String>) -> Self {
        MlldError::Security {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        MlldError::Internal(message.into())
    }

    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            MlldError::Parse { .. } => "PARSE_ERROR",
            MlldError::Resolution { .. } => "RESOLUTION_ERROR",
            MlldError::PathValidation { .. } => "PATH_VALIDATION",
            MlldError::Import { code, .. } => code.as_str(),
            MlldError::Directive { .. } => "DIRECTIVE_ERROR",
            MlldError::Execution { .. } => "EXECUTION_ERROR",
            MlldError::Pipeline { kind, .. } => kind.as_str(),
            MlldError::Security { .. } => "SECURITY_ERROR",
            MlldError::Bail { .. } => "BAIL",
            MlldError::Cancelled => "CANCELLED",
            MlldError::StructuredCoerce { .. } => "STRUCTURED_COERCE",
            MlldError::ExecutionOverflow { .. } => "EXECUTION_OVERFLOW",
            MlldError::Internal(_) => "INTERNAL",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            MlldError::Parse { .. }
            | MlldError::Security { .. }
            | MlldError::Bail { .. }
            | MlldError::Cancelled
            | MlldError::ExecutionOverflow { .. }
            | MlldError::Internal(_) => Severity::Fatal,
            MlldError::Resolution { .. }
            | MlldError::PathValidation { .. }
            | MlldError::Import { .. }
            | MlldError::Directive { .. }
            | MlldError::Execution { .. }
            | MlldError::Pipeline { .. }
            | MlldError::StructuredCoerce { .. } => Severity::Recoverable,
        }
    }

    pub fn location(&self) -> Option<&SourceLocation> {
        match self {
            MlldError::Parse { location, .. }
            | MlldError::Resolution { location, .. }
            | MlldError::Import { location, .. }
            | MlldError::Directive { location, .. }
            | MlldError::Execution { location, .. } => location.as_ref(),
            _ => None,
        }
    }

    /// Attach a source location if the error does not already carry one
    pub fn at(mut self, loc: SourceLocation) -> Self {
        match &mut self {
            MlldError::Parse { location, .. }
            | MlldError::Resolution { location, .. }
            | MlldError::Import { location, .. }
            | MlldError::Directive { location, .. }
            | MlldError::Execution { location, .. } => {
                if location.is_none() {
                    *location = Some(loc);
                }
            }
            _ => {}
        }
        self
    }

    /// Exit code for the CLI: 0 success, 1 fatal, 2 bail, 3 cancelled
    pub fn exit_code(&self) -> i32 {
        match self {
            MlldError::Bail { .. } => 2,
            MlldError::Cancelled => 3,
            _ => 1,
        }
    }

    /// Render this error with a caret into the offending source line,
    /// plus up to two context lines either side, when the source is cached.
    pub fn render_with_source(&self, source: Option<&str>) -> String {
        let mut out = self.to_string();
        let (Some(loc), Some(source)) = (self.location(), source) else {
            return out;
        };
        let lines: Vec<&str> = source.lines().collect();
        if loc.line == 0 || loc.line as usize > lines.len() {
            return out;
        }
        let target = loc.line as usize - 1;
        let first = target.saturating_sub(2);
        let last = (target + 2).min(lines.len() - 1);
        let width = (last + 1).to_string().len();
        out.push('\n');
        for (i, line) in lines.iter().enumerate().take(last + 1).skip(first) {
            out.push_str(&format!("  {:>width$} | {}\n", i + 1, line, width = width));
            if i == target {
                let pad = " ".repeat(width + 5 + loc.column.saturating_sub(1) as usize);
                out.push_str(&pad);
                out.push_str("^\n");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_error_codes_are_stable() {
        let err = MlldError::import(ImportErrorCode::CircularImport, "cycle via b.mld", "b.mld");
        assert_eq!(err.code(), "CIRCULAR_IMPORT");
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn bail_and_cancel_exit_codes() {
        let bail = MlldError::Bail {
            message: "stop".into(),
        };
        assert_eq!(bail.exit_code(), 2);
        assert_eq!(MlldError::Cancelled.exit_code(), 3);
    }

    #[test]
    fn caret_render_points_at_column() {
        let err = MlldError::resolution_at(
            "variable @missing is not defined",
            SourceLocation::new(2, 7, 12),
        );
        let rendered = err.render_with_source(Some("line one\n/show @missing\nline three"));
        assert!(rendered.contains("2 | /show @missing"));
        assert!(rendered.contains('^'));
    }
}
