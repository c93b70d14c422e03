//! Pipeline execution
//!
//! A pipeline is the source stage (synthetic stage 0, so user-visible
//! indices stay 1-based) followed by functional stages and interleaved
//! effect stages. Execution is an explicit state machine over a position
//! counter: `retry` rewinds the position to the nearest retryable stage and
//! replays everything from there, including effects; `skip` and `done` end
//! the pipeline with the last good output. Events are appended for
//! debugging and never consulted for control flow.

use std::time::Instant;

use indexmap::IndexMap;

use crate::ast::{Expr, ExecInvocationNode, RunNode, StageAst, WithClause};
use crate::env::{EnvRef, Environment};
use crate::error::{MlldError, PipelineErrorKind};
use crate::structured::{as_text, StructuredValue};
use crate::value::{ControlValue, Value};
use crate::variable::Variable;

use super::{GuardDecision, Interpreter};

/// Where a pipeline's initial input comes from. Sources that re-execute
/// (commands, invocations) are retryable; plain values are not.
pub(crate) enum PipelineSource<'a> {
    Fixed(Value),
    Expr(&'a Expr),
    Run(&'a RunNode),
    Invocation(&'a ExecInvocationNode),
}

impl PipelineSource<'_> {
    fn retryable(&self) -> bool {
        match self {
            PipelineSource::Fixed(_) => false,
            PipelineSource::Expr(expr) => {
                matches!(expr, Expr::ExecInvocation(_) | Expr::Run(_))
            }
            PipelineSource::Run(_) | PipelineSource::Invocation(_) => true,
        }
    }
}

#[derive(Debug)]
enum PipelineEvent {
    Start,
    StageOk(usize),
    StageRetry { stage: usize, target: usize },
    StageSkip(usize),
    StageDone(usize),
    StageFail(usize),
}

impl Interpreter {
    pub(crate) fn run_pipeline(
        &mut self,
        source: PipelineSource<'_>,
        stages: &[StageAst],
        with: &WithClause,
        env: &EnvRef,
    ) -> Result<Value, MlldError> {
        let source_retryable = source.retryable();

        // Plan positions: 0 is the source, position p >= 1 is stages[p-1].
        // func_positions[k] is the plan position of functional stage k.
        let mut func_positions: Vec<usize> = vec![0];
        for (i, stage) in stages.iter().enumerate() {
            if !stage.is_effect() {
                func_positions.push(i + 1);
            }
        }
        let func_count = func_positions.len() - 1;

        let mut events: Vec<PipelineEvent> = vec![PipelineEvent::Start];
        // outputs[k] is functional stage k's latest output (0 = source)
        let mut outputs: Vec<Value> = Vec::new();
        let mut attempts: Vec<usize> = vec![1; func_count + 1];
        let mut tries: Vec<Vec<Value>> = vec![Vec::new(); func_count + 1];
        let mut hint: Option<Value> = None;
        let mut hint_history: Vec<Value> = Vec::new();

        let started = Instant::now();
        let mut pos = 0usize;
        while pos <= stages.len() {
            self.check_cancelled()?;
            if let Some(timeout) = with.timeout_ms {
                let visible = functional_index_before(stages, pos);
                if started.elapsed().as_millis() as u64 > timeout {
                    return Err(MlldError::pipeline(
                        PipelineErrorKind::Timeout,
                        format!("pipeline exceeded {timeout}ms"),
                        visible,
                    ));
                }
            }

            if pos == 0 {
                let value = self.eval_pipeline_source(&source, env)?;
                outputs.clear();
                outputs.push(value);
                pos = 1;
                continue;
            }

            let Some(stage) = stages.get(pos - 1) else {
                break;
            };
            let done_funcs = stages
                .iter()
                .take(pos - 1)
                .filter(|s| !s.is_effect())
                .count();

            // Effects observe the upcoming stage's context and replay once
            // per attempt; only the third arm consumes a stage index
            match stage {
                StageAst::Show { template, .. } => {
                    let (_, frame) = self.effect_frame(
                        env,
                        done_funcs,
                        func_count,
                        &outputs,
                        &attempts,
                        &tries,
                        &hint,
                        with,
                    );
                    let text = self.interpolate(template, &frame)?;
                    self.push_output_line(&text);
                    pos += 1;
                }
                StageAst::Call { name, .. } if stage.is_effect() => {
                    // Effect calls (`@log`) see the input, not a slot
                    let (input, frame) = self.effect_frame(
                        env,
                        done_funcs,
                        func_count,
                        &outputs,
                        &attempts,
                        &tries,
                        &hint,
                        with,
                    );
                    self.invoke_by_name(name, vec![input], &frame, stage.location())?;
                    pos += 1;
                }
                StageAst::Call { name, args, .. } => {
                    let k = done_funcs + 1;
                    let input = outputs.get(k - 1).cloned().unwrap_or(Value::Null);

                    let frame = self.stage_frame(
                        env,
                        &input,
                        k,
                        &outputs,
                        &attempts,
                        &tries,
                        &hint,
                        with,
                    );

                    // Guards keyed on pipeline stages fire before the stage
                    let guard_ctx = stage_guard_context(name, k, &input);
                    match self.check_guards("pipeline", Some("stage"), guard_ctx)? {
                        GuardDecision::Abort(message) => {
                            return Err(MlldError::Bail { message })
                        }
                        GuardDecision::Retry => {
                            pos = self.rewind(
                                k,
                                source_retryable,
                                &mut attempts,
                                &mut tries,
                                &mut outputs,
                                &func_positions,
                                &mut events,
                                None,
                                &mut hint,
                                &mut hint_history,
                            )?;
                            continue;
                        }
                        GuardDecision::Allow => {}
                    }

                    let input_var = self.pipeline_input_value(&input, with.format.as_deref());
                    let mut call_args = vec![input_var];
                    for arg in args {
                        call_args.push(self.eval_expr(arg, &frame)?);
                    }
                    let result = self
                        .invoke_by_name(name, call_args, &frame, stage.location())
                        .map_err(|err| match err {
                            MlldError::Bail { .. } | MlldError::Cancelled => err,
                            other => {
                                log::debug!("pipeline stage {k} failed: {other}");
                                MlldError::pipeline(
                                    PipelineErrorKind::StageThrow,
                                    other.to_string(),
                                    k,
                                )
                            }
                        });
                    let value = match result {
                        Ok(value) => value,
                        Err(err) => {
                            events.push(PipelineEvent::StageFail(k));
                            self.log_events(&events);
                            return Err(err);
                        }
                    };

                    match value {
                        Value::Control(ControlValue::Retry(retry_hint)) => {
                            let hint_value = retry_hint.map(|h| normalize_hint(&h));
                            pos = self.rewind(
                                k,
                                source_retryable,
                                &mut attempts,
                                &mut tries,
                                &mut outputs,
                                &func_positions,
                                &mut events,
                                hint_value,
                                &mut hint,
                                &mut hint_history,
                            )?;
                        }
                        Value::Control(ControlValue::Skip) => {
                            events.push(PipelineEvent::StageSkip(k));
                            self.log_events(&events);
                            return Ok(input);
                        }
                        Value::Control(ControlValue::Done) => {
                            events.push(PipelineEvent::StageDone(k));
                            self.log_events(&events);
                            return Ok(input);
                        }
                        value => {
                            events.push(PipelineEvent::StageOk(k));
                            outputs.truncate(k);
                            outputs.push(value);
                            pos += 1;
                        }
                    }
                }
            }
        }

        self.log_events(&events);
        Ok(outputs.pop().unwrap_or(Value::Null))
    }

    fn eval_pipeline_source(
        &mut self,
        source: &PipelineSource<'_>,
        env: &EnvRef,
    ) -> Result<Value, MlldError> {
        match source {
            PipelineSource::Fixed(value) => Ok(value.clone()),
            PipelineSource::Expr(expr) => self.eval_expr(expr, env),
            PipelineSource::Run(run) => self.eval_run_node(run, env),
            PipelineSource::Invocation(invocation) => self.invoke_plain(invocation, env),
        }
    }

    /// Rewind to the nearest retryable stage before `k`: the previous
    /// functional stage, or the source when `k == 1` and the source
    /// re-executes. Returns the new plan position.
    #[allow(clippy::too_many_arguments)]
    fn rewind(
        &mut self,
        k: usize,
        source_retryable: bool,
        attempts: &mut [usize],
        tries: &mut [Vec<Value>],
        outputs: &mut Vec<Value>,
        func_positions: &[usize],
        events: &mut Vec<PipelineEvent>,
        new_hint: Option<Value>,
        hint: &mut Option<Value>,
        hint_history: &mut Vec<Value>,
    ) -> Result<usize, MlldError> {
        let target = k - 1;
        if target == 0 && !source_retryable {
            return Err(MlldError::pipeline(
                PipelineErrorKind::StageThrow,
                "retry requested but no preceding stage is retryable",
                k,
            ));
        }
        let attempt = attempts
            .get_mut(target)
            .ok_or_else(|| MlldError::internal("retry target outside the pipeline"))?;
        *attempt += 1;
        if *attempt > self.options.max_retries {
            return Err(MlldError::pipeline(
                PipelineErrorKind::RetryExhausted,
                format!(
                    "stage retried more than {} times",
                    self.options.max_retries
                ),
                k,
            ));
        }
        if let (Some(prior), Some(history)) = (outputs.get(target).cloned(), tries.get_mut(target))
        {
            history.push(prior);
        }
        if let Some(value) = new_hint {
            hint_history.push(value.clone());
            *hint = Some(value);
        }
        outputs.truncate(target);
        events.push(PipelineEvent::StageRetry { stage: k, target });
        func_positions
            .get(target)
            .copied()
            .ok_or_else(|| MlldError::internal("retry target outside the pipeline"))
    }

    /// Input and frame for an effect stage: effects see the upcoming
    /// stage's context
    #[allow(clippy::too_many_arguments)]
    fn effect_frame(
        &mut self,
        env: &EnvRef,
        done_funcs: usize,
        func_count: usize,
        outputs: &[Value],
        attempts: &[usize],
        tries: &[Vec<Value>],
        hint: &Option<Value>,
        with: &WithClause,
    ) -> (Value, EnvRef) {
        let upcoming = (done_funcs + 1).min(func_count.max(1));
        let input = outputs.get(done_funcs).cloned().unwrap_or(Value::Null);
        let frame = self.stage_frame(env, &input, upcoming, outputs, attempts, tries, hint, with);
        (input, frame)
    }

    /// Child frame binding `@input`, `@ctx`, and `@p`/`@pipeline` for one
    /// stage attempt
    #[allow(clippy::too_many_arguments)]
    fn stage_frame(
        &mut self,
        env: &EnvRef,
        input: &Value,
        k: usize,
        outputs: &[Value],
        attempts: &[usize],
        tries: &[Vec<Value>],
        hint: &Option<Value>,
        with: &WithClause,
    ) -> EnvRef {
        let frame = Environment::child_of(env);
        let input_value = self.pipeline_input_value(input, with.format.as_deref());
        let raw = as_text(input);
        {
            let mut borrowed = frame.borrow_mut();
            borrowed.define_parameter(Variable::pipeline_input(
                input_value,
                with.format.clone(),
                raw.clone(),
            ));

            // Retry context: what a retry from stage k would rewind to
            let target = k.saturating_sub(1);
            let try_number = attempts.get(target).copied().unwrap_or(1);
            let context_tries = tries.get(target).map(Vec::as_slice).unwrap_or(&[]);

            let p = pipeline_context_value(outputs, k, try_number, context_tries, tries, hint);
            borrowed.define_parameter(Variable::system("p", p.clone()));
            borrowed.define_parameter(Variable::system("pipeline", p));

            let mut ctx = IndexMap::new();
            ctx.insert("try".to_string(), Value::Number(try_number as f64));
            ctx.insert("stage".to_string(), Value::Number(k as f64));
            ctx.insert(
                "hint".to_string(),
                hint.clone().unwrap_or(Value::Null),
            );
            ctx.insert("input".to_string(), Value::Text(raw));
            ctx.insert(
                "lastOutput".to_string(),
                Value::Text(as_text(outputs.last().unwrap_or(&Value::Null))),
            );
            borrowed.define_parameter(Variable::system("ctx", Value::object(ctx)));
        }
        frame
    }

    /// Structured `@input` for a stage: `.text` stays raw, `.data` parses
    /// per the declared format hint (JSON is also sniffed when no hint is
    /// given)
    fn pipeline_input_value(&self, input: &Value, format: Option<&str>) -> Value {
        if let Value::Structured(_) = input {
            return input.clone();
        }
        if let Value::Array(items) = input {
            // Arrays of wrappers keep their element wrappers across stages
            if items.iter().any(|v| matches!(v, Value::Structured(_))) {
                return input.clone();
            }
        }
        let text = as_text(input);
        let mut wrapper = match format {
            Some("json") => StructuredValue::from_json_text(&text)
                .unwrap_or_else(|_| StructuredValue::from_text(&text)),
            Some(_) | None => {
                let trimmed = text.trim_start();
                if trimmed.starts_with('{') || trimmed.starts_with('[') {
                    StructuredValue::from_json_text(&text)
                        .unwrap_or_else(|_| StructuredValue::from_text(&text))
                } else {
                    StructuredValue::from_text(&text)
                }
            }
        };
        wrapper.ctx.source = Some("pipeline".to_string());
        wrapper.into_value()
    }

    fn log_events(&self, events: &[PipelineEvent]) {
        for event in events {
            log::debug!("pipeline event: {event:?}");
        }
    }
}

fn functional_index_before(stages: &[StageAst], pos: usize) -> usize {
    stages
        .iter()
        .take(pos.saturating_sub(1))
        .filter(|s| !s.is_effect())
        .count()
}

/// Build the `@p` record for a stage: attempt bookkeeping plus positional
/// access to prior outputs (`@p[0]`, `@p[-1]`)
fn pipeline_context_value(
    outputs: &[Value],
    k: usize,
    try_number: usize,
    context_tries: &[Value],
    all_tries: &[Vec<Value>],
    hint: &Option<Value>,
) -> Value {
    let mut map = IndexMap::new();
    map.insert("try".to_string(), Value::Number(try_number as f64));
    map.insert(
        "tries".to_string(),
        Value::array(context_tries.to_vec()),
    );
    map.insert("stage".to_string(), Value::Number(k as f64));
    map.insert("length".to_string(), Value::Number(outputs.len() as f64));
    if let Some(value) = hint {
        map.insert("hint".to_string(), value.clone());
    }
    for (i, output) in outputs.iter().enumerate() {
        map.insert(i.to_string(), output.clone());
    }
    for (back, output) in outputs.iter().rev().enumerate() {
        map.insert(format!("-{}", back + 1), output.clone());
    }
    let all: Vec<Value> = all_tries
        .iter()
        .filter(|t| !t.is_empty())
        .map(|t| Value::array(t.clone()))
        .collect();
    let mut retries = IndexMap::new();
    retries.insert("all".to_string(), Value::array(all));
    map.insert("retries".to_string(), Value::object(retries));
    Value::object(map)
}

fn stage_guard_context(name: &str, k: usize, input: &Value) -> Value {
    let mut op = IndexMap::new();
    op.insert("type".to_string(), Value::Text("pipeline".to_string()));
    op.insert("subtype".to_string(), Value::Text("stage".to_string()));
    let mut ctx = IndexMap::new();
    ctx.insert("op".to_string(), Value::object(op));
    ctx.insert("name".to_string(), Value::Text(name.to_string()));
    ctx.insert("stage".to_string(), Value::Number(k as f64));
    ctx.insert("input".to_string(), Value::Text(as_text(input)));
    Value::object(ctx)
}

fn normalize_hint(hint: &Value) -> Value {
    match hint.unwrapped() {
        Value::Object(map) => Value::Object(map.clone()),
        other => Value::Text(as_text(other)),
    }
}
