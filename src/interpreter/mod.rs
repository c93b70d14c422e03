//! The mlld evaluator
//!
//! `Interpreter` walks a parsed document, appending rendered text to the
//! output accumulator and mutating environments for the binding directives
//! (`/var`, `/exe`, `/path`, `/import`). Expression evaluation is a plain
//! recursive match over the AST. Executable invocation, pipelines, imports,
//! and the content loader live in sibling modules as further `impl` blocks.

pub mod access;
pub mod exec;
pub mod import;
pub mod loader;
pub mod pipeline;

use std::path::{Path, PathBuf};
use std::rc::Rc;

use indexmap::IndexMap;
use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::ast::{
    ActionNode, BinaryOp, ControlKind, DirectiveKind, DirectiveNode, Document, Expr, LiteralValue,
    Node, NodeId, OutputTarget, RunMode, RunNode, TemplateNode, TemplatePart, UnaryOp, WhenArm,
    WhenCondition, WhenModifier,
};
use crate::checkpoint::CheckpointManager;
use crate::env::{EnvRef, Environment, RuntimeDiagnostics};
use crate::error::{MlldError, Severity, SourceLocation};
use crate::parser;
use crate::pathops::{self, PathContext};
use crate::platform::{
    Clock, CommandRequest, CommandRunner, DeniedHttpClient, FileSystem, HttpClient, StdClock,
    StdCommandRunner, StdFileSystem,
};
use crate::resolver::ResolverRegistry;
use crate::structured::as_text;
use crate::value::{ControlValue, PathValue, Value};
use crate::variable::{Variable, VariableKind, VariableSource};

/// Rendered output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Markdown,
    Xml,
}

/// Where `/output ... to stdout|stderr` writes land; the host flushes them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct InterpreterOptions {
    pub strict: bool,
    pub pretty: bool,
    pub format: OutputFormat,
    pub allow_urls: bool,
    pub url_timeout_ms: u64,
    pub url_max_size: usize,
    pub url_allowed_domains: Vec<String>,
    pub url_blocked_domains: Vec<String>,
    /// Retry ceiling per pipeline stage
    pub max_retries: usize,
    /// Executable recursion ceiling
    pub max_call_depth: usize,
    pub base_path: PathBuf,
    pub home_path: PathBuf,
    pub error_dedup_disabled: bool,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            strict: false,
            pretty: false,
            format: OutputFormat::Markdown,
            allow_urls: false,
            url_timeout_ms: 30_000,
            url_max_size: 5 * 1024 * 1024,
            url_allowed_domains: Vec::new(),
            url_blocked_domains: Vec::new(),
            max_retries: 10,
            max_call_depth: 128,
            base_path: PathBuf::from("."),
            home_path: PathBuf::from("/"),
            error_dedup_disabled: false,
        }
    }
}

/// A `/guard` hook registered for an operation type
pub struct GuardDef {
    pub op_type: String,
    pub subtype: Option<String>,
    pub arms: Vec<WhenArm>,
    pub env: EnvRef,
}

/// What a guard decided about an operation
pub enum GuardDecision {
    Allow,
    Retry,
    Abort(String),
}

pub struct Interpreter {
    pub(crate) fs: Rc<dyn FileSystem>,
    pub(crate) http: Rc<dyn HttpClient>,
    pub(crate) runner: Rc<dyn CommandRunner>,
    pub(crate) clock: Rc<dyn Clock>,
    pub(crate) resolvers: ResolverRegistry,
    pub(crate) options: InterpreterOptions,
    pub(crate) diagnostics: RuntimeDiagnostics,

    root_env: EnvRef,
    output: String,
    pub(crate) stream_outputs: Vec<(OutputStream, String)>,
    pub(crate) env_outputs: IndexMap<String, String>,

    /// Ordered set of files currently being imported (cycle detection)
    pub(crate) import_stack: Vec<PathBuf>,
    /// Sources kept for error display
    pub(crate) source_cache: FxHashMap<PathBuf, String>,
    /// Memoized pure directive values, success and error alike
    memo: FxHashMap<NodeId, Result<Value, MlldError>>,

    pub(crate) checkpoint: Option<CheckpointManager>,
    pub(crate) guards: Vec<GuardDef>,
    /// Structured errors collected from parallel iterations (`@mx.errors`)
    pub(crate) mx_errors: Vec<Value>,
    /// Innermost for-loop frame (`@mx.for`)
    pub(crate) for_frames: Vec<(usize, usize)>,
    pub(crate) call_depth: usize,
    pub(crate) cancel: Option<Rc<dyn Fn() -> bool>>,

    /// Explicit `/export` manifest of the module being evaluated
    pub(crate) export_manifest: Option<Vec<(String, SourceLocation)>>,
    pub(crate) current_file: Option<PathBuf>,
    pub(crate) current_dir: PathBuf,
}

impl Interpreter {
    pub fn new(options: InterpreterOptions) -> Self {
        Self::with_platform(
            options,
            Rc::new(StdFileSystem),
            Rc::new(DeniedHttpClient),
            Rc::new(StdCommandRunner),
            Rc::new(StdClock),
        )
    }

    pub fn with_platform(
        options: InterpreterOptions,
        fs: Rc<dyn FileSystem>,
        http: Rc<dyn HttpClient>,
        runner: Rc<dyn CommandRunner>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        let current_dir = options.base_path.clone();
        let diagnostics = RuntimeDiagnostics::new(options.error_dedup_disabled);
        Self {
            fs,
            http,
            runner,
            clock,
            resolvers: ResolverRegistry::new(),
            options,
            diagnostics,
            root_env: Environment::new_root(),
            output: String::new(),
            stream_outputs: Vec::new(),
            env_outputs: IndexMap::new(),
            import_stack: Vec::new(),
            source_cache: FxHashMap::default(),
            memo: FxHashMap::default(),
            checkpoint: None,
            guards: Vec::new(),
            mx_errors: Vec::new(),
            for_frames: Vec::new(),
            call_depth: 0,
            cancel: None,
            export_manifest: None,
            current_file: None,
            current_dir,
        }
    }

    pub fn resolvers_mut(&mut self) -> &mut ResolverRegistry {
        &mut self.resolvers
    }

    pub fn set_checkpoint(&mut self, manager: CheckpointManager) {
        self.checkpoint = Some(manager);
    }

    pub fn checkpoint_mut(&mut self) -> Option<&mut CheckpointManager> {
        self.checkpoint.as_mut()
    }

    pub fn set_cancellation(&mut self, token: Rc<dyn Fn() -> bool>) {
        self.cancel = Some(token);
    }

    pub fn env(&self) -> EnvRef {
        Rc::clone(&self.root_env)
    }

    /// Accumulated document output so far; useful after a `/bail`
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Append one rendered line; content that already ends in a newline
    /// keeps it rather than gaining a second
    pub(crate) fn push_output_line(&mut self, text: &str) {
        self.output.push_str(text);
        if !text.ends_with('\n') {
            self.output.push('\n');
        }
    }

    pub(crate) fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    pub(crate) fn restore_output(&mut self, saved: String) {
        self.output = saved;
    }

    pub(crate) fn take_memo(&mut self) -> FxHashMap<NodeId, Result<Value, MlldError>> {
        std::mem::take(&mut self.memo)
    }

    pub(crate) fn restore_memo(&mut self, saved: FxHashMap<NodeId, Result<Value, MlldError>>) {
        self.memo = saved;
    }

    pub fn stream_outputs(&self) -> &[(OutputStream, String)] {
        &self.stream_outputs
    }

    pub fn env_outputs(&self) -> &IndexMap<String, String> {
        &self.env_outputs
    }

    pub fn cached_source(&self, path: &Path) -> Option<&str> {
        self.source_cache.get(path).map(String::as_str)
    }

    /// Evaluate a whole document and return the rendered output
    pub fn run_source(&mut self, source: &str, file: Option<&Path>) -> Result<String, MlldError> {
        if let Some(path) = file {
            self.source_cache
                .insert(path.to_path_buf(), source.to_string());
            self.current_file = Some(path.to_path_buf());
            if let Some(dir) = path.parent() {
                if !dir.as_os_str().is_empty() {
                    self.current_dir = dir.to_path_buf();
                }
            }
        }
        let document = parser::parse_document_in(source, file.and_then(Path::to_str))?;
        // Node ids restart for every parsed document
        self.memo.clear();
        let env = self.env();
        if let Some(path) = file {
            // The entry document participates in cycle detection too
            self.import_stack.push(path.to_path_buf());
        }
        let result = self.eval_document(&document, &env);
        if file.is_some() {
            self.import_stack.pop();
        }
        result?;
        Ok(self.rendered_output())
    }

    pub fn rendered_output(&self) -> String {
        match self.options.format {
            OutputFormat::Markdown => self.output.clone(),
            OutputFormat::Xml => {
                let escaped = self
                    .output
                    .replace('&', "&amp;")
                    .replace('<', "&lt;")
                    .replace('>', "&gt;");
                format!("<document>\n{escaped}</document>\n")
            }
        }
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), MlldError> {
        match &self.cancel {
            Some(token) if token() => Err(MlldError::Cancelled),
            _ => Ok(()),
        }
    }

    // ============ DOCUMENT MODE ============

    pub(crate) fn eval_document(
        &mut self,
        document: &Document,
        env: &EnvRef,
    ) -> Result<(), MlldError> {
        for node in &document.nodes {
            self.check_cancelled()?;
            self.eval_node(node, env)?;
        }
        Ok(())
    }

    fn eval_node(&mut self, node: &Node, env: &EnvRef) -> Result<(), MlldError> {
        match node {
            Node::Text(text) => {
                self.output.push_str(&text.content);
                self.output.push('\n');
                Ok(())
            }
            Node::Newline(_) => {
                self.output.push('\n');
                Ok(())
            }
            Node::CodeFence(fence) => {
                self.output.push_str(&fence.raw);
                Ok(())
            }
            Node::Frontmatter(fm) => {
                self.output.push_str("---\n");
                self.output.push_str(&fm.raw);
                self.output.push_str("---\n");
                Ok(())
            }
            Node::Comment(_) => Ok(()),
            Node::Directive(directive) => match self.eval_directive(directive, env) {
                Ok(()) => Ok(()),
                Err(err) => self.handle_directive_error(directive, err),
            },
        }
    }

    /// Permissive mode continues past recoverable directive failures with a
    /// placeholder; strict mode re-throws
    fn handle_directive_error(
        &mut self,
        directive: &DirectiveNode,
        err: MlldError,
    ) -> Result<(), MlldError> {
        if self.options.strict || err.severity() == Severity::Fatal {
            return Err(err.at(directive.location.clone()));
        }
        let source = self
            .current_file
            .as_ref()
            .and_then(|f| self.source_cache.get(f))
            .cloned();
        let rendered = err
            .at(directive.location.clone())
            .render_with_source(source.as_deref());
        if self.diagnostics.first_report(&rendered) {
            warn!("{rendered}");
        }
        if matches!(directive.kind, DirectiveKind::Show(_) | DirectiveKind::Run(_)) {
            self.output.push_str("[directive output placeholder]\n");
        }
        Ok(())
    }

    // ============ DIRECTIVES ============

    pub(crate) fn eval_directive(
        &mut self,
        directive: &DirectiveNode,
        env: &EnvRef,
    ) -> Result<(), MlldError> {
        debug!(
            "evaluating /{} at {}",
            directive.kind_name(),
            directive.location
        );
        match &directive.kind {
            DirectiveKind::Var(var) => self.eval_var_directive(directive, var, env),
            DirectiveKind::Path(path) => self.eval_path_directive(path, env, &directive.location),
            DirectiveKind::Show(show) => {
                let value = self.eval_expr(&show.value, env)?;
                let text = self.show_string(&value);
                self.push_output_line(&text);
                Ok(())
            }
            DirectiveKind::Run(run) => {
                let value = self.eval_run_directive(run, env)?;
                let text = self.show_string(&value);
                if !text.is_empty() {
                    self.push_output_line(&text);
                }
                Ok(())
            }
            DirectiveKind::Exe(exe) => self.eval_exe_directive(exe, env, &directive.location),
            DirectiveKind::Import(import) => {
                self.eval_import_directive(import, env, &directive.location)
            }
            DirectiveKind::Output(output) => self.eval_output_directive(output, env),
            DirectiveKind::When(when) => self.eval_when_directive(when, env),
            DirectiveKind::For(for_) => self.eval_for_directive(for_, env),
            DirectiveKind::Guard(guard) => {
                self.guards.push(GuardDef {
                    op_type: guard.op_type.clone(),
                    subtype: guard.subtype.clone(),
                    arms: guard.arms.clone(),
                    env: Rc::clone(env),
                });
                Ok(())
            }
            DirectiveKind::Bail(bail) => {
                let message = match &bail.message {
                    Some(expr) => {
                        let value = self.eval_expr(expr, env)?;
                        as_text(&value)
                    }
                    None => "bail".to_string(),
                };
                Err(MlldError::Bail { message })
            }
            DirectiveKind::Checkpoint(checkpoint) => {
                let value = self.eval_expr(&checkpoint.name, env)?;
                let name = as_text(&value);
                if let Some(manager) = self.checkpoint.as_mut() {
                    manager.name_latest(&name)?;
                }
                Ok(())
            }
            DirectiveKind::Export(export) => {
                let manifest = export
                    .names
                    .iter()
                    .map(|n| (n.clone(), directive.location.clone()))
                    .collect();
                self.export_manifest = Some(manifest);
                Ok(())
            }
        }
    }

    fn eval_var_directive(
        &mut self,
        directive: &DirectiveNode,
        var: &crate::ast::VarDirective,
        env: &EnvRef,
    ) -> Result<(), MlldError> {
        let value = if var.value.is_referentially_pure() && directive.node_id != 0 {
            match self.memo.get(&directive.node_id) {
                Some(Ok(value)) => value.clone(),
                Some(Err(err)) => return Err(err.clone()),
                None => {
                    let outcome = self.eval_expr(&var.value, env);
                    self.memo.insert(directive.node_id, outcome.clone());
                    outcome?
                }
            }
        } else {
            self.eval_expr(&var.value, env)?
        };

        let mut variable = Variable::inferred(&var.name, value);
        variable.kind = refine_kind(variable.kind, &var.value);
        if let (Expr::FileRef(file_ref), Value::Array(_)) = (&var.value, &variable.value) {
            variable.metadata.array_type = Some(if file_ref.rename.is_some() {
                crate::variable::ArrayType::RenamedContent
            } else {
                crate::variable::ArrayType::LoadContentResult
            });
        }
        variable = variable
            .at(directive.location.clone())
            .with_source(VariableSource {
                directive: "var".to_string(),
                syntax: syntax_of(&var.value).to_string(),
                has_interpolation: matches!(&var.value, Expr::Template(_)),
                is_multi_line: directive.raw.contains('\n'),
            })
            .with_labels(var.labels.clone());
        env.borrow_mut().define(variable)
    }

    fn eval_path_directive(
        &mut self,
        path: &crate::ast::PathDirective,
        env: &EnvRef,
        location: &SourceLocation,
    ) -> Result<(), MlldError> {
        let value = self.eval_expr(&path.value, env)?;
        let raw = as_text(&value);
        // A path built on a path-variable base may use dot segments
        let based_on_path_var = matches!(value, Value::Path(_))
            || matches!(&path.value, Expr::VarRef(v)
                if env.borrow().resolve(&v.identifier).is_some_and(|var| var.kind == VariableKind::Path));
        let ctx = self.path_context(based_on_path_var);
        let resolved = pathops::resolve_path(&raw, &ctx)?;
        if path.must_exist && !self.fs.exists(&resolved) {
            return Err(MlldError::path_validation(
                format!("path does not exist: {}", resolved.display()),
                raw,
            ));
        }
        let variable = Variable::new(
            VariableKind::Path,
            &path.name,
            Value::Path(PathValue { raw, resolved }),
        )
        .at(location.clone());
        env.borrow_mut().define(variable)
    }

    pub(crate) fn path_context(&self, allow_dot_segments: bool) -> PathContext {
        let mut ctx = PathContext::new(&self.options.home_path, &self.options.base_path)
            .in_dir(&self.current_dir);
        if allow_dot_segments {
            ctx = ctx.with_dot_segments();
        }
        ctx
    }

    fn eval_run_directive(
        &mut self,
        run: &crate::ast::RunDirective,
        env: &EnvRef,
    ) -> Result<Value, MlldError> {
        match &run.with {
            Some(with) => self.run_pipeline(
                pipeline::PipelineSource::Run(&run.run),
                &with.pipeline,
                with,
                env,
            ),
            None => self.eval_run_node(&run.run, env),
        }
    }

    fn eval_when_directive(
        &mut self,
        when: &crate::ast::WhenDirective,
        env: &EnvRef,
    ) -> Result<(), MlldError> {
        let mut matched = false;
        for arm in &when.arms {
            let fire = match &arm.condition {
                WhenCondition::Wildcard => true,
                WhenCondition::None => !matched,
                WhenCondition::Expr(expr) => self.eval_expr(expr, env)?.truthy(),
            };
            if !fire {
                continue;
            }
            if !matches!(arm.condition, WhenCondition::None) {
                matched = true;
            }
            self.run_action(&arm.action, env)?;
            if when.modifier == Some(WhenModifier::First) {
                break;
            }
            if when.modifier == Some(WhenModifier::Any) {
                // any: the first truthy condition answers the cascade
                break;
            }
        }
        Ok(())
    }

    fn eval_for_directive(
        &mut self,
        for_: &crate::ast::ForDirective,
        env: &EnvRef,
    ) -> Result<(), MlldError> {
        let iterable = self.eval_expr(&for_.iterable, env)?;
        let items = iteration_items(&iterable)?;
        let total = items.len();
        for (index, item) in items.into_iter().enumerate() {
            self.check_cancelled()?;
            self.for_frames.push((index, total));
            let iteration = if for_.parallel.is_some() {
                Environment::sealed_child_of(env)
            } else {
                Environment::child_of(env)
            };
            iteration
                .borrow_mut()
                .define_parameter(Variable::inferred(&for_.binding, item));
            let result = self.run_action(&for_.body, &iteration);
            self.for_frames.pop();
            match result {
                Ok(()) => {}
                Err(err) if for_.parallel.is_some() && err.severity() != Severity::Fatal => {
                    self.record_mx_error(index, &err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn run_action(&mut self, action: &ActionNode, env: &EnvRef) -> Result<(), MlldError> {
        match action {
            ActionNode::Directive(directive) => self.eval_directive(directive, env),
            ActionNode::Expr(expr) => {
                self.eval_expr(expr, env)?;
                Ok(())
            }
        }
    }

    pub(crate) fn record_mx_error(&mut self, index: usize, err: &MlldError) {
        let mut map = IndexMap::new();
        map.insert("iteration".to_string(), Value::Number(index as f64));
        map.insert("code".to_string(), Value::Text(err.code().to_string()));
        map.insert("message".to_string(), Value::Text(err.to_string()));
        self.mx_errors.push(Value::object(map));
    }

    fn eval_output_directive(
        &mut self,
        output: &crate::ast::OutputDirective,
        env: &EnvRef,
    ) -> Result<(), MlldError> {
        let value = self.eval_expr(&output.source, env)?;
        let rendered = self.format_output(&value, output.format.as_deref());
        match &output.target {
            OutputTarget::File(path_expr) => {
                let raw = as_text(&self.eval_expr(path_expr, env)?);
                let ctx = self.path_context(false);
                let resolved = pathops::resolve_path(&raw, &ctx)?;
                self.fs.write(&resolved, &rendered)
            }
            OutputTarget::Stdout => {
                self.stream_outputs.push((OutputStream::Stdout, rendered));
                Ok(())
            }
            OutputTarget::Stderr => {
                self.stream_outputs.push((OutputStream::Stderr, rendered));
                Ok(())
            }
            OutputTarget::Env(name) => {
                self.env_outputs.insert(format!("MLLD_{name}"), rendered);
                Ok(())
            }
            OutputTarget::Resolver(name) => {
                if self.resolvers.is_builtin(name) {
                    return Err(MlldError::directive(
                        "output",
                        "resolver",
                        format!("resolver @{name} does not accept output"),
                    ));
                }
                Err(MlldError::directive(
                    "output",
                    "resolver",
                    format!("unknown output resolver @{name}"),
                ))
            }
            OutputTarget::Document => Ok(()),
        }
    }

    /// Format coercion for `/output`: explicit hint wins, wrappers emit
    /// `.text` unless json/xml was requested, bare objects emit JSON
    fn format_output(&self, value: &Value, format: Option<&str>) -> String {
        match format {
            Some("json") => {
                let json = value.to_json();
                let out = if self.options.pretty {
                    serde_json::to_string_pretty(&json)
                } else {
                    serde_json::to_string(&json)
                };
                out.unwrap_or_else(|_| "null".to_string())
            }
            Some("xml") => {
                let body = as_text(value)
                    .replace('&', "&amp;")
                    .replace('<', "&lt;")
                    .replace('>', "&gt;");
                format!("<value>{body}</value>")
            }
            _ => self.show_string(value),
        }
    }

    pub(crate) fn show_string(&self, value: &Value) -> String {
        value.display_string(self.options.pretty)
    }

    // ============ EXPRESSIONS ============

    pub(crate) fn eval_expr(&mut self, expr: &Expr, env: &EnvRef) -> Result<Value, MlldError> {
        match expr {
            Expr::Literal(lit) => Ok(match &lit.value {
                LiteralValue::Null => Value::Null,
                LiteralValue::Bool(b) => Value::Bool(*b),
                LiteralValue::Number(n) => Value::Number(*n),
                LiteralValue::String(s) => Value::Text(s.clone()),
            }),
            Expr::Template(template) => {
                let text = self.interpolate(template, env)?;
                Ok(Value::Text(text))
            }
            Expr::VarRef(var) => self.eval_var_ref(var, env),
            Expr::Object(obj) => {
                let mut map = IndexMap::new();
                for (key, value_expr) in &obj.entries {
                    match self.eval_expr(value_expr, env) {
                        Ok(value) => {
                            map.insert(key.clone(), value);
                        }
                        Err(err) if err.severity() != Severity::Fatal => {
                            map.insert(key.clone(), Value::error_marker(key, &err));
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok(Value::object(map))
            }
            Expr::Array(arr) => {
                let mut items = Vec::new();
                for (index, element) in arr.elements.iter().enumerate() {
                    match self.eval_expr(element, env) {
                        Ok(value) => items.push(value),
                        Err(err) if err.severity() != Severity::Fatal => {
                            items.push(Value::error_marker(&index.to_string(), &err));
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok(Value::array(items))
            }
            Expr::Binary(binary) => self.eval_binary(binary, env),
            Expr::Unary(unary) => {
                let operand = self.eval_expr(&unary.operand, env)?;
                match unary.op {
                    UnaryOp::Not => Ok(Value::Bool(!operand.truthy())),
                    UnaryOp::Neg => match operand.as_number() {
                        Some(n) => Ok(Value::Number(-n)),
                        None => Err(MlldError::execution(format!(
                            "cannot negate a {}",
                            operand.type_name()
                        ))
                        .at(unary.location.clone())),
                    },
                }
            }
            Expr::Ternary(ternary) => {
                let condition = self.eval_expr(&ternary.condition, env)?;
                if condition.truthy() {
                    self.eval_expr(&ternary.then_branch, env)
                } else {
                    self.eval_expr(&ternary.else_branch, env)
                }
            }
            Expr::ExecInvocation(invocation) => self.eval_invocation(invocation, env),
            Expr::When(when) => self.eval_when_expr(when, env),
            Expr::For(for_) => self.eval_for_expr(for_, env),
            Expr::FileRef(file_ref) => self.load_content(file_ref, env),
            Expr::Run(run) => self.eval_run_node(run, env),
            Expr::Control(control) => {
                let control_value = match control.kind {
                    ControlKind::Skip => ControlValue::Skip,
                    ControlKind::Done => ControlValue::Done,
                    ControlKind::Retry => {
                        let hint = match &control.hint {
                            Some(expr) => Some(Rc::new(self.eval_expr(expr, env)?)),
                            None => None,
                        };
                        ControlValue::Retry(hint)
                    }
                };
                Ok(Value::Control(control_value))
            }
            Expr::Piped(piped) => {
                let with = crate::ast::WithClause::default();
                self.run_pipeline(
                    pipeline::PipelineSource::Expr(piped.head.as_ref()),
                    &piped.stages,
                    &with,
                    env,
                )
            }
        }
    }

    fn eval_var_ref(
        &mut self,
        var: &crate::ast::VarRefNode,
        env: &EnvRef,
    ) -> Result<Value, MlldError> {
        let base = self.resolve_name(&var.identifier, env, &var.location)?;
        let mut value = access::apply_fields(&base, &var.fields, &var.location)?;
        for pipe in &var.pipes {
            let mut args = vec![value];
            for arg in &pipe.args {
                args.push(self.eval_expr(arg, env)?);
            }
            value = self.invoke_by_name(&pipe.name, args, env, &pipe.location)?;
        }
        Ok(value)
    }

    /// Identifier resolution order: environment chain, builtin resolvers,
    /// then the ambient `@mx` record
    pub(crate) fn resolve_name(
        &mut self,
        name: &str,
        env: &EnvRef,
        location: &SourceLocation,
    ) -> Result<Variable, MlldError> {
        if let Some(variable) = env.borrow().resolve(name) {
            return Ok(variable);
        }
        if let Some(value) = self.resolvers.builtin(name, self.clock.as_ref()) {
            return Ok(Variable::system(name, value));
        }
        if name == "mx" {
            return Ok(Variable::system("mx", self.mx_value()));
        }
        Err(MlldError::resolution_at(
            format!("variable @{name} is not defined"),
            location.clone(),
        ))
    }

    pub(crate) fn mx_value(&self) -> Value {
        let mut map = IndexMap::new();
        map.insert(
            "errors".to_string(),
            Value::array(self.mx_errors.clone()),
        );
        if let Some((index, total)) = self.for_frames.last() {
            let mut frame = IndexMap::new();
            frame.insert("index".to_string(), Value::Number(*index as f64));
            frame.insert("total".to_string(), Value::Number(*total as f64));
            map.insert("for".to_string(), Value::object(frame));
        }
        Value::object(map)
    }

    pub(crate) fn interpolate(
        &mut self,
        template: &TemplateNode,
        env: &EnvRef,
    ) -> Result<String, MlldError> {
        let mut out = String::new();
        for part in &template.parts {
            match part {
                TemplatePart::Text(text) => out.push_str(text),
                TemplatePart::Var(var) => {
                    let value = self.eval_var_ref(var, env)?;
                    out.push_str(&as_text(&value));
                }
                TemplatePart::Exec(invocation) => {
                    let value = self.eval_invocation(invocation, env)?;
                    out.push_str(&as_text(&value));
                }
            }
        }
        Ok(out)
    }

    fn eval_binary(
        &mut self,
        binary: &crate::ast::BinaryNode,
        env: &EnvRef,
    ) -> Result<Value, MlldError> {
        match binary.op {
            BinaryOp::And => {
                let left = self.eval_expr(&binary.left, env)?;
                if left.truthy() {
                    self.eval_expr(&binary.right, env)
                } else {
                    Ok(left)
                }
            }
            BinaryOp::Or => {
                let left = self.eval_expr(&binary.left, env)?;
                if left.truthy() {
                    Ok(left)
                } else {
                    self.eval_expr(&binary.right, env)
                }
            }
            BinaryOp::Eq => {
                let (left, right) = self.eval_operands(binary, env)?;
                Ok(Value::Bool(left.loose_eq(&right)))
            }
            BinaryOp::NotEq => {
                let (left, right) = self.eval_operands(binary, env)?;
                Ok(Value::Bool(!left.loose_eq(&right)))
            }
            BinaryOp::Lt => self.eval_comparison(binary, env, std::cmp::Ordering::is_lt),
            BinaryOp::LtEq => self.eval_comparison(binary, env, std::cmp::Ordering::is_le),
            BinaryOp::Gt => self.eval_comparison(binary, env, std::cmp::Ordering::is_gt),
            BinaryOp::GtEq => self.eval_comparison(binary, env, std::cmp::Ordering::is_ge),
            BinaryOp::Add => {
                let (left, right) = self.eval_operands(binary, env)?;
                if let (Some(l), Some(r)) = (left.as_number(), right.as_number()) {
                    Ok(Value::Number(l + r))
                } else {
                    Ok(Value::Text(format!("{}{}", as_text(&left), as_text(&right))))
                }
            }
            BinaryOp::Sub => self.eval_arithmetic(binary, env, |l, r| Some(l - r)),
            BinaryOp::Mul => self.eval_arithmetic(binary, env, |l, r| Some(l * r)),
            BinaryOp::Div => self.eval_arithmetic(binary, env, |l, r| (r != 0.0).then(|| l / r)),
            BinaryOp::Mod => self.eval_arithmetic(binary, env, |l, r| (r != 0.0).then(|| l % r)),
        }
    }

    fn eval_operands(
        &mut self,
        binary: &crate::ast::BinaryNode,
        env: &EnvRef,
    ) -> Result<(Value, Value), MlldError> {
        let left = self.eval_expr(&binary.left, env)?;
        let right = self.eval_expr(&binary.right, env)?;
        Ok((left, right))
    }

    fn eval_comparison(
        &mut self,
        binary: &crate::ast::BinaryNode,
        env: &EnvRef,
        test: fn(std::cmp::Ordering) -> bool,
    ) -> Result<Value, MlldError> {
        let (left, right) = self.eval_operands(binary, env)?;
        let ordering = left.compare(&right).ok_or_else(|| {
            MlldError::execution(format!(
                "cannot compare {} with {}",
                left.type_name(),
                right.type_name()
            ))
            .at(binary.location.clone())
        })?;
        Ok(Value::Bool(test(ordering)))
    }

    /// Numeric arithmetic; `apply` returning `None` means division by zero
    fn eval_arithmetic(
        &mut self,
        binary: &crate::ast::BinaryNode,
        env: &EnvRef,
        apply: fn(f64, f64) -> Option<f64>,
    ) -> Result<Value, MlldError> {
        let (left, right) = self.eval_operands(binary, env)?;
        let (Some(l), Some(r)) = (left.as_number(), right.as_number()) else {
            return Err(MlldError::execution(format!(
                "arithmetic needs numbers, got {} and {}",
                left.type_name(),
                right.type_name()
            ))
            .at(binary.location.clone()));
        };
        match apply(l, r) {
            Some(result) => Ok(Value::Number(result)),
            None => Err(MlldError::execution("division by zero").at(binary.location.clone())),
        }
    }

    /// When-expression: `first` stops at the first truthy arm, `any`/`all`
    /// reduce to booleans (`any` short-circuits), the default cascade runs
    /// every truthy arm and yields the last action value
    pub(crate) fn eval_when_expr(
        &mut self,
        when: &crate::ast::WhenExprNode,
        env: &EnvRef,
    ) -> Result<Value, MlldError> {
        match when.modifier {
            Some(WhenModifier::First) | None => {
                let first_only = when.modifier == Some(WhenModifier::First);
                let mut matched = false;
                let mut result = Value::Null;
                for arm in &when.arms {
                    let fire = match &arm.condition {
                        WhenCondition::Wildcard => true,
                        WhenCondition::None => !matched,
                        WhenCondition::Expr(expr) => self.eval_expr(expr, env)?.truthy(),
                    };
                    if !fire {
                        continue;
                    }
                    if !matches!(arm.condition, WhenCondition::None) {
                        matched = true;
                    }
                    result = self.eval_expr(&arm.action, env)?;
                    if first_only {
                        return Ok(result);
                    }
                }
                Ok(result)
            }
            Some(WhenModifier::Any) => {
                let mut none_action = None;
                for arm in &when.arms {
                    match &arm.condition {
                        WhenCondition::None => none_action = Some(&arm.action),
                        WhenCondition::Wildcard => return Ok(Value::Bool(true)),
                        WhenCondition::Expr(expr) => {
                            if self.eval_expr(expr, env)?.truthy() {
                                return Ok(Value::Bool(true));
                            }
                        }
                    }
                }
                if let Some(action) = none_action {
                    self.eval_expr(action, env)?;
                }
                Ok(Value::Bool(false))
            }
            Some(WhenModifier::All) => {
                for arm in &when.arms {
                    if let WhenCondition::Expr(expr) = &arm.condition {
                        if !self.eval_expr(expr, env)?.truthy() {
                            return Ok(Value::Bool(false));
                        }
                    }
                }
                Ok(Value::Bool(true))
            }
        }
    }

    /// For-expression: result array preserves iteration order. Parallel
    /// blocks evaluate in sealed frames; their failures land in `@mx.errors`
    /// and the block still completes.
    fn eval_for_expr(
        &mut self,
        for_: &crate::ast::ForExprNode,
        env: &EnvRef,
    ) -> Result<Value, MlldError> {
        let iterable = self.eval_expr(&for_.iterable, env)?;
        let items = iteration_items(&iterable)?;
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            self.check_cancelled()?;
            self.for_frames.push((index, total));
            let iteration = if for_.parallel.is_some() {
                Environment::sealed_child_of(env)
            } else {
                Environment::child_of(env)
            };
            iteration
                .borrow_mut()
                .define_parameter(Variable::inferred(&for_.binding, item));
            let outcome = self.eval_expr(&for_.body, &iteration);
            self.for_frames.pop();
            match outcome {
                Ok(value) => results.push(value),
                Err(err) if for_.parallel.is_some() && err.severity() != Severity::Fatal => {
                    self.record_mx_error(index, &err);
                    results.push(Value::Null);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Value::array(results))
    }

    pub(crate) fn eval_run_node(&mut self, run: &RunNode, env: &EnvRef) -> Result<Value, MlldError> {
        let mut op = IndexMap::new();
        op.insert("type".to_string(), Value::Text("run".to_string()));
        let mut guard_ctx = IndexMap::new();
        guard_ctx.insert("op".to_string(), Value::object(op));
        match self.check_guards("run", None, Value::object(guard_ctx))? {
            GuardDecision::Abort(message) => return Err(MlldError::Bail { message }),
            GuardDecision::Allow | GuardDecision::Retry => {}
        }
        match &run.mode {
            RunMode::Command { command } => {
                let line = self.interpolate(command, env)?;
                self.run_shell(&line, None, IndexMap::new(), &run.location)
            }
            RunMode::Code { lang, code } => {
                self.run_shell(code, Some(lang.as_str()), IndexMap::new(), &run.location)
            }
        }
    }

    pub(crate) fn run_shell(
        &mut self,
        input: &str,
        language: Option<&str>,
        env_vars: IndexMap<String, String>,
        location: &SourceLocation,
    ) -> Result<Value, MlldError> {
        let request = CommandRequest {
            input: input.to_string(),
            language: language.map(str::to_string),
            env: env_vars,
            working_directory: self.current_dir.clone(),
            timeout_ms: None,
        };
        let output = self.runner.run(&request)?;
        if output.exit_code != 0 {
            return Err(MlldError::Execution {
                message: format!("command exited with status {}", output.exit_code),
                detail: crate::error::ExecutionDetail {
                    command: Some(input.to_string()),
                    exit_code: Some(output.exit_code),
                    stderr: Some(output.stderr),
                    working_directory: Some(self.current_dir.clone()),
                    duration_ms: Some(output.duration_ms),
                },
                location: Some(location.clone()),
            });
        }
        let mut text = output.stdout;
        while text.ends_with('\n') {
            text.pop();
        }
        Ok(Value::Text(text))
    }

    // ============ GUARDS ============

    /// Run any matching `/guard` hooks for an operation. The first truthy
    /// arm decides: `retry` re-runs the target, `allow`/truthy proceeds, a
    /// string aborts with that message.
    pub(crate) fn check_guards(
        &mut self,
        op_type: &str,
        subtype: Option<&str>,
        op_context: Value,
    ) -> Result<GuardDecision, MlldError> {
        let matching: Vec<usize> = self
            .guards
            .iter()
            .enumerate()
            .filter(|(_, g)| {
                g.op_type == op_type
                    && (g.subtype.is_none() || g.subtype.as_deref() == subtype)
            })
            .map(|(i, _)| i)
            .collect();
        for index in matching {
            let Some(guard) = self.guards.get(index) else {
                continue;
            };
            let (arms, guard_env) = (guard.arms.clone(), Rc::clone(&guard.env));
            let frame = Environment::child_of(&guard_env);
            frame
                .borrow_mut()
                .define_parameter(Variable::system("ctx", op_context.clone()));
            for arm in &arms {
                let fire = match &arm.condition {
                    WhenCondition::Wildcard => true,
                    WhenCondition::None => false,
                    WhenCondition::Expr(expr) => self.eval_expr(expr, &frame)?.truthy(),
                };
                if !fire {
                    continue;
                }
                let verdict = self.eval_expr(&arm.action, &frame)?;
                return Ok(match verdict {
                    Value::Control(ControlValue::Retry(_)) => GuardDecision::Retry,
                    Value::Bool(true) => GuardDecision::Allow,
                    Value::Text(s) if s == "allow" => GuardDecision::Allow,
                    Value::Text(message) => GuardDecision::Abort(message),
                    _ => GuardDecision::Allow,
                });
            }
        }
        Ok(GuardDecision::Allow)
    }
}

/// What a collection iterates as: arrays by element, objects by value
fn iteration_items(value: &Value) -> Result<Vec<Value>, MlldError> {
    match value.unwrapped() {
        Value::Array(items) => Ok(items.as_ref().clone()),
        Value::Object(map) => Ok(map.values().cloned().collect()),
        other => Err(MlldError::execution(format!(
            "cannot iterate over a {}",
            other.type_name()
        ))),
    }
}

/// Variable-kind refinement from the syntactic form of the right-hand side
fn refine_kind(inferred: VariableKind, expr: &Expr) -> VariableKind {
    match expr {
        Expr::Template(_) => VariableKind::InterpolatedText,
        Expr::Run(_) => VariableKind::CommandResult,
        Expr::Piped(p) if matches!(p.head.as_ref(), Expr::Run(_)) => VariableKind::CommandResult,
        Expr::FileRef(f) if f.section.is_some() => VariableKind::SectionContent,
        Expr::FileRef(_) => VariableKind::FileContent,
        Expr::When(_) | Expr::For(_) => VariableKind::Computed,
        _ => inferred,
    }
}

fn syntax_of(expr: &Expr) -> &'static str {
    match expr {
        Expr::Literal(_) => "literal",
        Expr::Template(_) => "template",
        Expr::VarRef(_) => "reference",
        Expr::Object(_) => "object",
        Expr::Array(_) => "array",
        Expr::Binary(_) | Expr::Unary(_) | Expr::Ternary(_) => "expression",
        Expr::ExecInvocation(_) => "invocation",
        Expr::When(_) => "when",
        Expr::For(_) => "for",
        Expr::FileRef(_) => "load",
        Expr::Run(_) => "run",
        Expr::Control(_) => "control",
        Expr::Piped(_) => "pipeline",
    }
}
