//! Executable invocation
//!
//! `/exe` bodies come in five shapes: template, shell command, host-language
//! code, reference to another executable, and template-returning when
//! cascades. Invocation builds a parameter frame over the definition
//! environment, evaluates the body, then applies any `with { pipeline }`.
//!
//! StructuredValue wrappers pass into mlld-native bodies intact. Crossing
//! into host-language code they are unwrapped to `.data` unless the
//! parameter was declared `.keep`, which serializes the whole wrapper.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::ast::{ExeBody, ExeDirective, ExecInvocationNode, RunMode};
use crate::env::{EnvRef, Environment};
use crate::error::{MlldError, SourceLocation};
use crate::structured::{as_text, unwrap_for_host};
use crate::value::Value;
use crate::variable::{ExecutableDef, Variable};

use super::{pipeline::PipelineSource, GuardDecision, Interpreter};

impl Interpreter {
    pub(crate) fn eval_exe_directive(
        &mut self,
        exe: &ExeDirective,
        env: &EnvRef,
        location: &SourceLocation,
    ) -> Result<(), MlldError> {
        let def = ExecutableDef {
            name: exe.name.clone(),
            params: exe.params.clone(),
            body: exe.body.clone(),
            captured: Some(Rc::clone(env)),
            location: location.clone(),
        };
        let variable = Variable::executable(&exe.name, Value::Executable(Rc::new(def)))
            .at(location.clone());
        env.borrow_mut().define(variable)
    }

    pub(crate) fn eval_invocation(
        &mut self,
        invocation: &ExecInvocationNode,
        env: &EnvRef,
    ) -> Result<Value, MlldError> {
        if let Some(with) = &invocation.with {
            if !with.pipeline.is_empty() {
                return self.run_pipeline(
                    PipelineSource::Invocation(invocation),
                    &with.pipeline,
                    with,
                    env,
                );
            }
        }
        self.invoke_plain(invocation, env)
    }

    /// Invocation without the with-clause pipeline (the pipeline engine
    /// re-enters here when it retries the source stage)
    pub(crate) fn invoke_plain(
        &mut self,
        invocation: &ExecInvocationNode,
        env: &EnvRef,
    ) -> Result<Value, MlldError> {
        let mut args = Vec::with_capacity(invocation.args.len());
        for arg in &invocation.args {
            args.push(self.eval_expr(arg, env)?);
        }
        let mut value = if invocation.callee_fields.is_empty() {
            self.invoke_by_name(&invocation.name, args, env, &invocation.location)?
        } else {
            // `@ns.fn(...)`: the callee is found through field access
            let base = self.resolve_name(&invocation.name, env, &invocation.location)?;
            let callee = super::access::apply_fields(
                &base,
                &invocation.callee_fields,
                &invocation.location,
            )?;
            let Value::Executable(def) = &callee else {
                return Err(MlldError::resolution_at(
                    format!("@{} does not select an executable", invocation.name),
                    invocation.location.clone(),
                ));
            };
            let def = std::rc::Rc::clone(def);
            self.invoke_def(&def, args, &invocation.location)?
        };
        if !invocation.fields.is_empty() {
            let holder = Variable::inferred("result", value);
            value = super::access::apply_fields(&holder, &invocation.fields, &invocation.location)?;
        }
        for pipe in &invocation.pipes {
            let mut pipe_args = vec![value];
            for arg in &pipe.args {
                pipe_args.push(self.eval_expr(arg, env)?);
            }
            value = self.invoke_by_name(&pipe.name, pipe_args, env, &pipe.location)?;
        }
        Ok(value)
    }

    /// Call an executable (or builtin transformer) by name with evaluated
    /// arguments
    pub(crate) fn invoke_by_name(
        &mut self,
        name: &str,
        args: Vec<Value>,
        env: &EnvRef,
        location: &SourceLocation,
    ) -> Result<Value, MlldError> {
        let resolved = env.borrow().resolve(name);
        let Some(variable) = resolved else {
            if let Some(value) = self.builtin_transform(name, &args) {
                return Ok(value);
            }
            return Err(MlldError::resolution_at(
                format!("executable @{name} is not defined"),
                location.clone(),
            ));
        };
        let Value::Executable(def) = &variable.value else {
            return Err(MlldError::resolution_at(
                format!("@{name} is not an executable"),
                location.clone(),
            ));
        };
        let def = Rc::clone(def);

        let mut ctx = IndexMap::new();
        let mut op = IndexMap::new();
        op.insert("type".to_string(), Value::Text("exe".to_string()));
        ctx.insert("op".to_string(), Value::object(op));
        ctx.insert("name".to_string(), Value::Text(name.to_string()));
        let ctx = Value::object(ctx);

        let mut attempts = 0usize;
        loop {
            match self.check_guards("exe", None, ctx.clone())? {
                GuardDecision::Abort(message) => return Err(MlldError::Bail { message }),
                GuardDecision::Retry => {
                    attempts += 1;
                    if attempts > self.options.max_retries {
                        return Err(MlldError::execution(format!(
                            "guard retried @{name} more than {} times",
                            self.options.max_retries
                        )));
                    }
                    continue;
                }
                GuardDecision::Allow => {}
            }
            return self.invoke_def(&def, args, location);
        }
    }

    pub(crate) fn invoke_def(
        &mut self,
        def: &ExecutableDef,
        args: Vec<Value>,
        location: &SourceLocation,
    ) -> Result<Value, MlldError> {
        if self.call_depth >= self.options.max_call_depth {
            return Err(MlldError::ExecutionOverflow {
                limit: self.options.max_call_depth,
            });
        }
        self.call_depth += 1;
        let result = self.invoke_def_inner(def, args, location);
        self.call_depth -= 1;
        result
    }

    fn invoke_def_inner(
        &mut self,
        def: &ExecutableDef,
        args: Vec<Value>,
        _location: &SourceLocation,
    ) -> Result<Value, MlldError> {
        // Checkpointing covers side-effectful bodies only; templates and
        // cascades are cheap to recompute and never cached
        let cacheable = matches!(def.body, ExeBody::Run(_)) && self.checkpoint.is_some();
        let canonical_args = canonical_arguments(&args);
        if cacheable {
            if let Some(manager) = &self.checkpoint {
                if let Some(cached) = manager.lookup(&def.name, &canonical_args) {
                    log::debug!("checkpoint hit for @{}({canonical_args})", def.name);
                    return Ok(Value::Text(cached));
                }
            }
        }

        let frame = match &def.captured {
            Some(captured) => Environment::child_of(captured),
            None => Environment::new_root(),
        };
        for (index, param) in def.params.iter().enumerate() {
            let value = args.get(index).cloned().unwrap_or(Value::Null);
            frame
                .borrow_mut()
                .define_parameter(Variable::inferred(&param.name, value));
        }

        let value = match &def.body {
            ExeBody::Template(template) => {
                let text = self.interpolate(template, &frame)?;
                Value::Text(text)
            }
            ExeBody::Run(run) => match &run.mode {
                RunMode::Command { command } => {
                    let line = self.interpolate(command, &frame)?;
                    self.run_shell(&line, None, self.host_env(def, &args), &run.location)?
                }
                RunMode::Code { lang, code } => self.run_shell(
                    code,
                    Some(lang.as_str()),
                    self.host_env(def, &args),
                    &run.location,
                )?,
            },
            ExeBody::Ref(target) => self.invoke_plain(target, &frame)?,
            ExeBody::When(when) => self.eval_when_expr(when, &frame)?,
        };

        if cacheable && !value.is_control() {
            let output = as_text(&value);
            let args_json =
                serde_json::Value::Array(args.iter().map(|a| unwrap_for_host(a).to_json()).collect());
            let created_at = self.clock.timestamp();
            if let Some(manager) = self.checkpoint.as_mut() {
                manager.store(&def.name, args_json, &canonical_args, &output, &created_at)?;
            }
        }
        Ok(value)
    }

    /// Environment variables carrying arguments across the host boundary.
    /// Values unwrap to `.data` JSON; `.keep` parameters serialize the whole
    /// wrapper as `{text, data, ctx}`.
    fn host_env(&self, def: &ExecutableDef, args: &[Value]) -> IndexMap<String, String> {
        let mut env = IndexMap::new();
        for (index, param) in def.params.iter().enumerate() {
            let value = args.get(index).cloned().unwrap_or(Value::Null);
            let serialized = if param.keep {
                keep_json(&value)
            } else {
                unwrap_for_host(&value).to_canonical_json()
            };
            env.insert(
                format!("MLLD_ARG_{}", param.name.to_uppercase()),
                serialized,
            );
        }
        env
    }

    /// Small transformer set available without definition, mostly for
    /// pipeline stages
    fn builtin_transform(&mut self, name: &str, args: &[Value]) -> Option<Value> {
        let input = args.first()?;
        match name {
            "upper" => Some(Value::Text(as_text(input).to_uppercase())),
            "lower" => Some(Value::Text(as_text(input).to_lowercase())),
            "trim" => Some(Value::Text(as_text(input).trim().to_string())),
            "json" => {
                let json = unwrap_for_host(input).to_json();
                let rendered = if self.options.pretty {
                    serde_json::to_string_pretty(&json)
                } else {
                    serde_json::to_string(&json)
                };
                Some(Value::Text(rendered.unwrap_or_else(|_| "null".to_string())))
            }
            "log" => {
                log::info!("{}", as_text(input));
                Some(input.clone())
            }
            _ => None,
        }
    }
}

/// Canonical JSON of arguments after structured-value unwrapping; the
/// checkpoint key input
pub(crate) fn canonical_arguments(args: &[Value]) -> String {
    let json =
        serde_json::Value::Array(args.iter().map(|a| unwrap_for_host(a).to_json()).collect());
    json.to_string()
}

fn keep_json(value: &Value) -> String {
    match value {
        Value::Structured(wrapper) => {
            let mut map = serde_json::Map::new();
            map.insert(
                "text".to_string(),
                serde_json::Value::String(wrapper.text.clone()),
            );
            map.insert("data".to_string(), wrapper.data.to_json());
            map.insert("ctx".to_string(), wrapper.ctx.to_value().to_json());
            serde_json::Value::Object(map).to_string()
        }
        other => other.to_canonical_json(),
    }
}
