//! In-memory platform implementations for tests.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use super::{CommandOutput, CommandRequest, CommandRunner, FileSystem, HttpClient, HttpResponse};
use crate::error::MlldError;

/// A filesystem held entirely in memory. Paths are stored as given; globbing
/// uses `glob::Pattern` over the stored keys.
#[derive(Default)]
pub struct MemoryFileSystem {
    files: RefCell<BTreeMap<PathBuf, String>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.files.borrow_mut().insert(path.into(), content.into());
        self
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.files.borrow_mut().insert(path.into(), content.into());
    }

    pub fn written(&self, path: &Path) -> Option<String> {
        self.files.borrow().get(path).cloned()
    }
}

impl FileSystem for MemoryFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, MlldError> {
        self.files.borrow().get(path).cloned().ok_or_else(|| {
            MlldError::path_validation(
                format!("no such file: {}", path.display()),
                path.display().to_string(),
            )
        })
    }

    fn write(&self, path: &Path, content: &str) -> Result<(), MlldError> {
        self.files
            .borrow_mut()
            .insert(path.to_path_buf(), content.to_string());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let files = self.files.borrow();
        files.contains_key(path) || files.keys().any(|k| k.starts_with(path))
    }

    fn is_file(&self, path: &Path) -> bool {
        self.files.borrow().contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        let files = self.files.borrow();
        !files.contains_key(path) && files.keys().any(|k| k.starts_with(path))
    }

    fn glob(&self, base: &Path, pattern: &str) -> Result<Vec<PathBuf>, MlldError> {
        let full = if Path::new(pattern).is_absolute() {
            pattern.to_string()
        } else {
            base.join(pattern).display().to_string()
        };
        let matcher = glob::Pattern::new(&full)
            .map_err(|e| MlldError::path_validation(format!("invalid glob: {e}"), pattern))?;
        let mut out: Vec<PathBuf> = self
            .files
            .borrow()
            .keys()
            .filter(|p| matcher.matches_path(p))
            .cloned()
            .collect();
        out.sort();
        Ok(out)
    }
}

/// Scripted HTTP responses keyed by exact URL
#[derive(Default)]
pub struct ScriptedHttpClient {
    responses: RefCell<BTreeMap<String, HttpResponse>>,
}

impl ScriptedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(
        self,
        url: impl Into<String>,
        content_type: &str,
        body: impl Into<String>,
    ) -> Self {
        let mut headers = IndexMap::new();
        headers.insert("content-type".to_string(), content_type.to_string());
        self.responses.borrow_mut().insert(
            url.into(),
            HttpResponse {
                status: 200,
                headers,
                body: body.into(),
            },
        );
        self
    }
}

impl HttpClient for ScriptedHttpClient {
    fn fetch(&self, url: &str, _timeout_ms: u64, max_size: usize) -> Result<HttpResponse, MlldError> {
        let response = self
            .responses
            .borrow()
            .get(url)
            .cloned()
            .ok_or_else(|| MlldError::execution(format!("no scripted response for {url}")))?;
        if response.body.len() > max_size {
            return Err(MlldError::execution(format!(
                "response for {url} exceeds {max_size} bytes"
            )));
        }
        Ok(response)
    }
}

type CommandHandler = Box<dyn Fn(&CommandRequest) -> Result<CommandOutput, MlldError>>;

/// Command runner driven by a registered handler; records every request
pub struct MemoryCommandRunner {
    handler: CommandHandler,
    log: RefCell<Vec<CommandRequest>>,
}

impl MemoryCommandRunner {
    pub fn new(handler: impl Fn(&CommandRequest) -> Result<CommandOutput, MlldError> + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            log: RefCell::new(Vec::new()),
        }
    }

    /// Every request succeeds, echoing `output` on stdout
    pub fn echoing(output: impl Into<String>) -> Self {
        let output = output.into();
        Self::new(move |_| {
            Ok(CommandOutput {
                stdout: output.clone(),
                stderr: String::new(),
                exit_code: 0,
                duration_ms: 1,
            })
        })
    }

    pub fn calls(&self) -> usize {
        self.log.borrow().len()
    }

    pub fn requests(&self) -> Vec<CommandRequest> {
        self.log.borrow().clone()
    }
}

impl CommandRunner for MemoryCommandRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, MlldError> {
        self.log.borrow_mut().push(request.clone());
        (self.handler)(request)
    }
}
