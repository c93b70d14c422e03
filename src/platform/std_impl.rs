//! Standard implementations of the platform traits.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use super::{Clock, CommandOutput, CommandRequest, CommandRunner, FileSystem};
use crate::error::{ExecutionDetail, MlldError};

/// Real filesystem backed by `std::fs` and the `glob` crate
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, MlldError> {
        std::fs::read_to_string(path).map_err(|e| {
            MlldError::path_validation(
                format!("cannot read {}: {e}", path.display()),
                path.display().to_string(),
            )
        })
    }

    fn write(&self, path: &Path, content: &str) -> Result<(), MlldError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    MlldError::path_validation(
                        format!("cannot create {}: {e}", parent.display()),
                        parent.display().to_string(),
                    )
                })?;
            }
        }
        std::fs::write(path, content).map_err(|e| {
            MlldError::path_validation(
                format!("cannot write {}: {e}", path.display()),
                path.display().to_string(),
            )
        })
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn glob(&self, base: &Path, pattern: &str) -> Result<Vec<PathBuf>, MlldError> {
        let full = if Path::new(pattern).is_absolute() {
            pattern.to_string()
        } else {
            base.join(pattern).display().to_string()
        };
        let entries = glob::glob(&full)
            .map_err(|e| MlldError::path_validation(format!("invalid glob: {e}"), pattern))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        Ok(files)
    }
}

/// Runs shell commands and host-language blocks as subprocesses
pub struct StdCommandRunner;

impl StdCommandRunner {
    fn command_for(request: &CommandRequest) -> Result<Command, MlldError> {
        let mut command = match request.language.as_deref() {
            None | Some("sh") | Some("bash") => {
                let shell = request.language.as_deref().unwrap_or("sh");
                let mut c = Command::new(shell);
                c.arg("-c").arg(&request.input);
                c
            }
            Some("js") | Some("node") => {
                let mut c = Command::new("node");
                c.arg("-e")
                    .arg(format!("console.log((function() {{ {} }})() ?? '')", request.input));
                c
            }
            Some("python") | Some("py") => {
                let mut c = Command::new("python3");
                c.arg("-c").arg(&request.input);
                c
            }
            Some(other) => {
                return Err(MlldError::execution(format!(
                    "unsupported language '{other}'"
                )))
            }
        };
        command.current_dir(&request.working_directory);
        for (key, value) in &request.env {
            command.env(key, value);
        }
        Ok(command)
    }
}

impl CommandRunner for StdCommandRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, MlldError> {
        let started = Instant::now();
        let mut command = Self::command_for(request)?;
        let output = command.output().map_err(|e| MlldError::Execution {
            message: format!("failed to spawn: {e}"),
            detail: ExecutionDetail {
                command: Some(request.input.clone()),
                working_directory: Some(request.working_directory.clone()),
                ..ExecutionDetail::default()
            },
            location: None,
        })?;
        let duration_ms = started.elapsed().as_millis() as u64;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
            duration_ms,
        })
    }
}

/// Wall clock backed by `chrono`
pub struct StdClock;

impl Clock for StdClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn timestamp(&self) -> String {
        chrono::Utc::now().to_rfc3339()
    }
}
