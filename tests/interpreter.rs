//! Integration tests for the mlld interpreter
//!
//! Every test runs against the in-memory platform: a `MemoryFileSystem`
//! seeded per test, a scripted command runner, and scripted HTTP responses.
//! `Harness::eval` is the one-line path for documents that need no files.

#[path = "interpreter/basics.rs"]
mod basics;
#[path = "interpreter/checkpoints.rs"]
mod checkpoints;
#[path = "interpreter/errors.rs"]
mod errors;
#[path = "interpreter/exec.rs"]
mod exec;
#[path = "interpreter/imports.rs"]
mod imports;
#[path = "interpreter/loader.rs"]
mod loader;
#[path = "interpreter/output.rs"]
mod output;
#[path = "interpreter/pipelines.rs"]
mod pipelines;
#[path = "interpreter/when_for.rs"]
mod when_for;

use std::path::Path;
use std::rc::Rc;

use mlld::platform::{
    CommandOutput, CommandRequest, MemoryCommandRunner, MemoryFileSystem, ScriptedHttpClient,
    StdClock,
};
use mlld::{Interpreter, InterpreterOptions, MlldError};

pub struct Harness {
    pub fs: Rc<MemoryFileSystem>,
    pub runner: Rc<MemoryCommandRunner>,
    pub http: Rc<ScriptedHttpClient>,
    pub options: InterpreterOptions,
}

impl Harness {
    pub fn new() -> Self {
        let mut options = InterpreterOptions::default();
        options.base_path = "/".into();
        options.home_path = "/home/user".into();
        Self {
            fs: Rc::new(MemoryFileSystem::new()),
            runner: Rc::new(MemoryCommandRunner::echoing("")),
            http: Rc::new(ScriptedHttpClient::new()),
            options,
        }
    }

    pub fn file(self, path: &str, content: &str) -> Self {
        self.fs.add_file(path, content);
        self
    }

    pub fn runner(mut self, runner: MemoryCommandRunner) -> Self {
        self.runner = Rc::new(runner);
        self
    }

    pub fn http(mut self, http: ScriptedHttpClient) -> Self {
        self.http = Rc::new(http);
        self
    }

    pub fn strict(mut self) -> Self {
        self.options.strict = true;
        self
    }

    pub fn allow_urls(mut self) -> Self {
        self.options.allow_urls = true;
        self
    }

    pub fn interpreter(&self) -> Interpreter {
        Interpreter::with_platform(
            self.options.clone(),
            Rc::clone(&self.fs) as _,
            Rc::clone(&self.http) as _,
            Rc::clone(&self.runner) as _,
            Rc::new(StdClock),
        )
    }

    pub fn run(&self, source: &str) -> Result<String, MlldError> {
        self.interpreter()
            .run_source(source, Some(Path::new("/doc.mld")))
    }

    pub fn eval(&self, source: &str) -> String {
        match self.run(source) {
            Ok(output) => output,
            Err(err) => panic!("evaluation failed: {err}\nsource:\n{source}"),
        }
    }
}

/// Shorthand for documents that need no files or commands
pub fn eval(source: &str) -> String {
    Harness::new().eval(source)
}

/// A command runner for `js { ... }` bodies: each handler maps a code
/// fragment to its stdout
pub fn js_runner(cases: Vec<(&'static str, &'static str)>) -> MemoryCommandRunner {
    MemoryCommandRunner::new(move |request: &CommandRequest| {
        for (fragment, stdout) in &cases {
            if request.input.contains(fragment) {
                return Ok(CommandOutput {
                    stdout: format!("{stdout}\n"),
                    stderr: String::new(),
                    exit_code: 0,
                    duration_ms: 1,
                });
            }
        }
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: format!("no scripted output for: {}", request.input),
            exit_code: 1,
            duration_ms: 1,
        })
    })
}
