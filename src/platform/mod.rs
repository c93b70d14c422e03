//! Platform abstraction traits.
//!
//! The interpreter never touches ambient I/O directly: filesystem access,
//! HTTP fetches, shell and host-language execution, and wall-clock time all
//! go through these traits. Hosts inject implementations; tests use the
//! in-memory ones from [`memory`].

mod memory;
mod std_impl;

pub use memory::{MemoryCommandRunner, MemoryFileSystem, ScriptedHttpClient};
pub use std_impl::{StdClock, StdCommandRunner, StdFileSystem};

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::error::MlldError;

/// Filesystem capability for reads, writes, and glob expansion
pub trait FileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, MlldError>;

    fn write(&self, path: &Path, content: &str) -> Result<(), MlldError>;

    fn exists(&self, path: &Path) -> bool;

    fn is_file(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    /// Expand a glob pattern relative to `base`, returning matching files
    /// sorted lexicographically by path
    fn glob(&self, base: &Path, pattern: &str) -> Result<Vec<PathBuf>, MlldError>;
}

/// Response from an HTTP fetch
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: IndexMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.as_str())
    }
}

/// Network capability for URL loads and URL imports
pub trait HttpClient {
    fn fetch(&self, url: &str, timeout_ms: u64, max_size: usize) -> Result<HttpResponse, MlldError>;
}

/// An HTTP client that refuses every request. The default unless the host
/// enables URLs.
pub struct DeniedHttpClient;

impl HttpClient for DeniedHttpClient {
    fn fetch(&self, url: &str, _timeout_ms: u64, _max_size: usize) -> Result<HttpResponse, MlldError> {
        Err(MlldError::security(format!(
            "URL access is disabled; cannot fetch {url}"
        )))
    }
}

/// A request to run a shell command or host-language code block
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Shell command line, or source code when `language` is set
    pub input: String,
    /// `js`, `node`, `python`, ...; `None` means a plain shell command
    pub language: Option<String>,
    /// Serialized arguments exported as `MLLD_ARG_<NAME>` variables
    pub env: IndexMap<String, String>,
    pub working_directory: PathBuf,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Subprocess capability for `/run` and host-language `/exe` bodies
pub trait CommandRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, MlldError>;
}

/// Wall-clock capability; the `@TIME` resolver and checkpoint timestamps
/// use it so tests can pin time
pub trait Clock {
    fn now_millis(&self) -> i64;

    /// RFC 3339 timestamp for the current instant
    fn timestamp(&self) -> String;
}

/// Fixed clock for tests
pub struct FixedClock {
    pub millis: i64,
    pub stamp: String,
}

impl Clock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.millis
    }

    fn timestamp(&self) -> String {
        self.stamp.clone()
    }
}
