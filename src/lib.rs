//! A document-embedded scripting language for embedding in applications.
//!
//! mlld documents are plain text interleaved with slash-directives (`/var`,
//! `/show`, `/run`, `/exe`, `/import`, `/output`, `/when`, `/for`, `/path`,
//! `/guard`) that evaluate to transformed output. This crate is the core
//! interpreter pipeline: lexer, parser, typed AST, the variable and
//! structured-value model, lexical environments, the directive evaluator,
//! executable invocation with pipelines and retries, imports with cycle
//! detection, and the alligator content loader.
//!
//! # Quick Start
//!
//! ```
//! use mlld::{Interpreter, InterpreterOptions};
//!
//! let mut interp = Interpreter::new(InterpreterOptions::default());
//! let output = interp
//!     .run_source("/var @user = {\"name\":\"Alice\",\"age\":30}\n/show `name=@user.name age=@user.age`\n", None)
//!     .unwrap();
//! assert_eq!(output, "name=Alice age=30\n");
//! ```
//!
//! # Platform Capabilities
//!
//! The interpreter never touches ambient I/O. Filesystem reads, HTTP
//! fetches, subprocess execution, and wall-clock time come from traits in
//! [`platform`]; hosts inject implementations and tests run against the
//! in-memory ones:
//!
//! ```
//! use std::rc::Rc;
//! use mlld::platform::{DeniedHttpClient, MemoryCommandRunner, MemoryFileSystem, StdClock};
//! use mlld::{Interpreter, InterpreterOptions};
//!
//! let fs = MemoryFileSystem::new().with_file("/docs/note.md", "remember the milk\n");
//! let mut options = InterpreterOptions::default();
//! options.base_path = "/".into();
//! let mut interp = Interpreter::with_platform(
//!     options,
//!     Rc::new(fs),
//!     Rc::new(DeniedHttpClient),
//!     Rc::new(MemoryCommandRunner::echoing("")),
//!     Rc::new(StdClock),
//! );
//! let output = interp
//!     .run_source("/var @note = <docs/note.md>\n/show @note\n", None)
//!     .unwrap();
//! assert_eq!(output, "remember the milk\n");
//! ```
//!
//! # Pipelines
//!
//! Values flow through `|` stages; a stage may return `retry` (optionally
//! with a hint), `skip`, or `done` to drive the retry state machine. Stage
//! frames see `@input`, `@ctx`, and the `@p` history record.
//!
//! # Errors
//!
//! Every failure is an [`MlldError`] carrying a severity, a stable machine
//! code, and usually a source location; [`MlldError::render_with_source`]
//! produces the caret display when the source is cached.

pub mod ast;
pub mod checkpoint;
pub mod env;
pub mod error;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod pathops;
pub mod platform;
pub mod resolver;
pub mod structured;
pub mod value;
pub mod variable;

pub use checkpoint::{CheckpointManager, ResumeTarget};
pub use env::{EnvRef, Environment};
pub use error::{ImportErrorCode, MlldError, PipelineErrorKind, Severity, SourceLocation};
pub use interpreter::{Interpreter, InterpreterOptions, OutputFormat, OutputStream};
pub use parser::{parse_document, parse_document_in};
pub use structured::{as_data, as_text, is_structured, keep, StructuredValue};
pub use value::Value;
pub use variable::{Variable, VariableKind};
