//! Script runtime: labeled step lists over one owned JSON state tree.
//!
//! A script is a linear sequence of steps. Each step may run a storage query,
//! an outbound HTTP request, a transformation of the whole state, a counter
//! increment, and a jump, in that order. Jumps move the program counter to a
//! label; everything else falls through. Execution is synchronous: queries,
//! requests and the configured inter-step delay are the only points where a
//! run blocks.
//!
//! Each script instance admits at most one activation at a time; a second
//! `run` rejects immediately instead of queueing.

use crate::ops;
use crate::pointer;
use crate::query::QueryErrors;
use crate::storage::Storage;
use crate::transform::{
    apply_spec, compare_values, loose_eq, run_chain, OpCtx, Operators, OperatorFn, TransformError,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MAX_STEPS: u64 = 1000;
const DEFAULT_RESULT_PROPERTY: &str = "/result";

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("script definition has no name")]
    MissingName,
    #[error("script '{0}' has no steps")]
    MissingSteps(String),
    #[error("script '{script}': duplicate label '{label}'")]
    DuplicateLabel { script: String, label: String },
    #[error("script '{script}': jump to unknown label '{label}'")]
    UnknownLabel { script: String, label: String },
    #[error("script '{script}': invalid schedule: {message}")]
    InvalidSchedule { script: String, message: String },
    #[error("script '{script}': {message}")]
    InvalidStep { script: String, message: String },
    #[error("script '{0}' is already running")]
    ConcurrentRun(String),
    #[error("script '{script}' exceeded its budget of {max_steps} steps")]
    StepBudgetExceeded { script: String, max_steps: u64 },
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Query(#[from] QueryErrors),
    #[error("http request failed: {0}")]
    Http(String),
}

/// Everything a running script needs from the outside world.
#[derive(Clone)]
pub struct ScriptEnv {
    pub storage: Arc<dyn Storage>,
    pub context: Option<crate::context::Context>,
}

impl ScriptEnv {
    /// Context-free environment (admin semantics for queries).
    pub fn admin(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            context: None,
        }
    }

    pub fn with_context(storage: Arc<dyn Storage>, context: crate::context::Context) -> Self {
        Self {
            storage,
            context: Some(context),
        }
    }
}

#[derive(Debug)]
struct QueryStep {
    text: String,
    arguments: Option<Value>,
    result_property: String,
    run_in_context: bool,
}

#[derive(Debug)]
struct RequestStep {
    url: Value,
    method: String,
    headers: Map<String, Value>,
    body: Option<Value>,
    result_property: String,
}

#[derive(Debug)]
enum Jump {
    Always(String),
    Cond {
        to: String,
        left: Value,
        right: Value,
        operator: String,
    },
}

impl Jump {
    fn target(&self) -> &str {
        match self {
            Jump::Always(to) => to,
            Jump::Cond { to, .. } => to,
        }
    }
}

#[derive(Debug)]
struct Step {
    raw: Value,
    label: Option<String>,
    query: Option<QueryStep>,
    request: Option<RequestStep>,
    transform: Option<Map<String, Value>>,
    increment: Option<String>,
    jump: Option<Jump>,
}

/// A validated script, ready to run any number of times (one at a time).
#[derive(Debug)]
pub struct Script {
    name: String,
    steps: Vec<Step>,
    labels: HashMap<String, usize>,
    max_steps: u64,
    delay: Option<Duration>,
    schedule: Option<cron::Schedule>,
    run_on_startup: bool,
    running: AtomicBool,
}

impl Script {
    /// Validate a script definition: name and steps present, labels unique,
    /// jump targets known, schedule parseable.
    pub fn new(definition: &Value) -> Result<Self, ScriptError> {
        let name = definition
            .get("name")
            .and_then(Value::as_str)
            .ok_or(ScriptError::MissingName)?
            .to_string();
        let raw_steps = definition
            .get("steps")
            .and_then(Value::as_array)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ScriptError::MissingSteps(name.clone()))?;

        let max_steps = match definition.get("maxSteps") {
            None => DEFAULT_MAX_STEPS,
            Some(v) => v.as_u64().filter(|&n| n > 0).ok_or_else(|| {
                ScriptError::InvalidStep {
                    script: name.clone(),
                    message: "maxSteps must be a positive integer".into(),
                }
            })?,
        };
        let delay = match definition.get("delay") {
            None => None,
            Some(v) => Some(Duration::from_millis(v.as_u64().ok_or_else(|| {
                ScriptError::InvalidStep {
                    script: name.clone(),
                    message: "delay must be non-negative milliseconds".into(),
                }
            })?)),
        };
        let schedule = match definition.get("schedule").and_then(Value::as_str) {
            None => None,
            Some(expr) => Some(expr.parse::<cron::Schedule>().map_err(|e| {
                ScriptError::InvalidSchedule {
                    script: name.clone(),
                    message: e.to_string(),
                }
            })?),
        };
        let run_on_startup = definition
            .get("runOnStartup")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut steps = Vec::with_capacity(raw_steps.len());
        let mut labels = HashMap::new();
        for (index, raw) in raw_steps.iter().enumerate() {
            let step = parse_step(&name, raw)?;
            if let Some(label) = &step.label {
                if labels.insert(label.clone(), index).is_some() {
                    return Err(ScriptError::DuplicateLabel {
                        script: name.clone(),
                        label: label.clone(),
                    });
                }
            }
            steps.push(step);
        }
        for step in &steps {
            if let Some(jump) = &step.jump {
                if !labels.contains_key(jump.target()) {
                    return Err(ScriptError::UnknownLabel {
                        script: name.clone(),
                        label: jump.target().to_string(),
                    });
                }
            }
        }

        Ok(Self {
            name,
            steps,
            labels,
            max_steps,
            delay,
            schedule,
            run_on_startup,
            running: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> Option<&cron::Schedule> {
        self.schedule.as_ref()
    }

    pub fn run_on_startup(&self) -> bool {
        self.run_on_startup
    }

    /// Execute with the given input as initial state. Returns the final state.
    pub fn run(&self, input: Value, env: &ScriptEnv) -> Result<Value, ScriptError> {
        self.activate(input, env, false).map(|(state, _)| state)
    }

    /// Execute with per-step tracing. Returns the final state and one
    /// `{definition, output, info, children}` node per executed step.
    pub fn run_debug(&self, input: Value, env: &ScriptEnv) -> Result<(Value, Value), ScriptError> {
        self.activate(input, env, true)
            .map(|(state, trace)| (state, Value::Array(trace)))
    }

    fn activate(
        &self,
        input: Value,
        env: &ScriptEnv,
        debug: bool,
    ) -> Result<(Value, Vec<Value>), ScriptError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ScriptError::ConcurrentRun(self.name.clone()));
        }
        let guard = RunGuard(&self.running);
        let result = self.step_loop(input, env, debug);
        drop(guard);
        result
    }

    fn step_loop(
        &self,
        input: Value,
        env: &ScriptEnv,
        debug: bool,
    ) -> Result<(Value, Vec<Value>), ScriptError> {
        let mut state = match input {
            Value::Null => json!({}),
            other => other,
        };
        let ops = script_operators();
        let mut trace = Vec::new();
        let mut executed = 0u64;
        let mut pc = 0usize;

        while pc < self.steps.len() {
            executed += 1;
            if executed > self.max_steps {
                return Err(ScriptError::StepBudgetExceeded {
                    script: self.name.clone(),
                    max_steps: self.max_steps,
                });
            }
            let step = &self.steps[pc];
            let mut info: Option<String> = None;

            if let Some(q) = &step.query {
                let arguments = resolve_arguments(q.arguments.as_ref(), &state, &ops, env)?;
                let context = if q.run_in_context {
                    env.context.as_ref()
                } else {
                    None
                };
                let response = env.storage.query(&q.text, context, arguments.as_ref())?;
                write_result(&mut state, &q.result_property, response);
            }

            if let Some(r) = &step.request {
                let response = perform_request(r, &state, &ops, env)?;
                write_result(&mut state, &r.result_property, response);
            }

            if let Some(template) = &step.transform {
                let mut ctx = OpCtx {
                    ops: &ops,
                    env: Some(env),
                };
                state = run_chain(template, &state, &mut ctx)?;
            }

            if let Some(ptr) = &step.increment {
                let current = pointer::get(&state, ptr);
                let next = if let Some(n) = current.as_i64() {
                    json!(n + 1)
                } else if let Some(f) = current.as_f64() {
                    json!(f + 1.0)
                } else {
                    json!(0)
                };
                pointer::set(&mut state, ptr, next);
            }

            let mut jumped = false;
            if let Some(jump) = &step.jump {
                if self.jump_taken(jump, &state, &ops, env)? {
                    let target = jump.target();
                    pc = self.labels[target];
                    jumped = true;
                    info = Some(format!("jump to '{target}'"));
                }
            }

            if debug {
                trace.push(json!({
                    "definition": step.raw,
                    "output": state,
                    "info": info,
                    "children": [],
                }));
            }

            if !jumped {
                pc += 1;
            }
            if let Some(delay) = self.delay {
                if pc < self.steps.len() {
                    std::thread::sleep(delay);
                }
            }
        }
        Ok((state, trace))
    }

    fn jump_taken(
        &self,
        jump: &Jump,
        state: &Value,
        ops: &Operators,
        env: &ScriptEnv,
    ) -> Result<bool, ScriptError> {
        let Jump::Cond {
            left,
            right,
            operator,
            ..
        } = jump
        else {
            return Ok(true);
        };
        let left = jump_operand(left, state, ops, env)?;
        let right = jump_operand(right, state, ops, env)?;
        let taken = match operator.as_str() {
            "==" => loose_eq(&left, &right),
            "===" => left == right,
            "!=" => !loose_eq(&left, &right),
            "!==" => left != right,
            "<" => compare_values(&left, &right) == Some(std::cmp::Ordering::Less),
            ">" => compare_values(&left, &right) == Some(std::cmp::Ordering::Greater),
            "<=" => matches!(
                compare_values(&left, &right),
                Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
            ),
            ">=" => matches!(
                compare_values(&left, &right),
                Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
            ),
            "in" => right
                .as_array()
                .map(|items| items.contains(&left))
                .unwrap_or(false),
            _ => false,
        };
        Ok(taken)
    }
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Pointer-dialect registry extended with the script-only `eval` operator.
fn script_operators() -> Operators {
    let mut ops = Operators::pointer();
    ops.register("eval", op_eval as OperatorFn);
    ops
}

/// Run a nested script against the same environment; the chain input becomes
/// the nested script's initial state.
fn op_eval(arg: &Value, input: &Value, ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let env = ctx
        .env
        .ok_or_else(|| TransformError::invalid("eval", "no script environment attached"))?;
    let definition = match arg {
        Value::Array(_) => json!({"name": "eval", "steps": arg}),
        Value::Object(map) if map.contains_key("steps") => {
            let mut def = map.clone();
            def.entry("name".to_string()).or_insert(json!("eval"));
            Value::Object(def)
        }
        _ => {
            return Err(TransformError::invalid(
                "eval",
                "expected a step list or script definition",
            ))
        }
    };
    let script =
        Script::new(&definition).map_err(|e| TransformError::invalid("eval", e.to_string()))?;
    script
        .run(input.clone(), env)
        .map_err(|e| TransformError::invalid("eval", e.to_string()))
}

fn parse_step(script: &str, raw: &Value) -> Result<Step, ScriptError> {
    let invalid = |message: String| ScriptError::InvalidStep {
        script: script.to_string(),
        message,
    };

    if let Some(label) = raw.as_str() {
        return Ok(Step {
            raw: raw.clone(),
            label: Some(label.to_string()),
            query: None,
            request: None,
            transform: None,
            increment: None,
            jump: None,
        });
    }
    let map = raw
        .as_object()
        .ok_or_else(|| invalid("step must be a label string or a mapping".into()))?;

    let result_property = map
        .get("resultProperty")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_RESULT_PROPERTY)
        .to_string();

    let mut step = Step {
        raw: raw.clone(),
        label: None,
        query: None,
        request: None,
        transform: None,
        increment: None,
        jump: None,
    };

    for (key, value) in map {
        match key.as_str() {
            "label" => {
                step.label = Some(
                    value
                        .as_str()
                        .ok_or_else(|| invalid("label must be a string".into()))?
                        .to_string(),
                );
            }
            "query" => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    Value::Array(parts) => parts
                        .iter()
                        .map(|p| p.as_str().unwrap_or_default())
                        .collect::<Vec<_>>()
                        .join(" "),
                    _ => return Err(invalid("query must be a string or list of strings".into())),
                };
                step.query = Some(QueryStep {
                    text,
                    arguments: map.get("arguments").cloned(),
                    result_property: result_property.clone(),
                    run_in_context: map
                        .get("runInContext")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                });
            }
            "request" => {
                step.request = Some(parse_request(value, &result_property, &invalid)?);
            }
            "transform" => {
                let template = value
                    .as_object()
                    .ok_or_else(|| invalid("transform must be a mapping".into()))?;
                step.transform
                    .get_or_insert_with(Map::new)
                    .extend(template.clone());
            }
            "increment" => {
                step.increment = Some(
                    value
                        .as_str()
                        .ok_or_else(|| invalid("increment must be a pointer string".into()))?
                        .to_string(),
                );
            }
            "jump" => {
                step.jump = Some(parse_jump(value, &invalid)?);
            }
            "arguments" | "resultProperty" | "runInContext" => {}
            _ => {
                // Inline operator shorthand: any other key extends the step's
                // transform template in encounter order.
                step.transform
                    .get_or_insert_with(Map::new)
                    .insert(key.clone(), value.clone());
            }
        }
    }
    Ok(step)
}

fn parse_request(
    value: &Value,
    result_property: &str,
    invalid: &impl Fn(String) -> ScriptError,
) -> Result<RequestStep, ScriptError> {
    match value {
        Value::String(url) => Ok(RequestStep {
            url: Value::String(url.clone()),
            method: "GET".to_string(),
            headers: Map::new(),
            body: None,
            result_property: result_property.to_string(),
        }),
        Value::Object(spec) => {
            let url = spec
                .get("url")
                .cloned()
                .ok_or_else(|| invalid("request mapping needs a 'url'".into()))?;
            Ok(RequestStep {
                url,
                method: spec
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or("GET")
                    .to_ascii_uppercase(),
                headers: spec
                    .get("headers")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
                body: spec.get("body").cloned(),
                result_property: result_property.to_string(),
            })
        }
        _ => Err(invalid("request must be a url or a mapping".into())),
    }
}

fn parse_jump(value: &Value, invalid: &impl Fn(String) -> ScriptError) -> Result<Jump, ScriptError> {
    match value {
        Value::String(to) => Ok(Jump::Always(to.clone())),
        Value::Object(spec) => {
            let to = spec
                .get("to")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("jump mapping needs a 'to' label".into()))?
                .to_string();
            Ok(Jump::Cond {
                to,
                left: spec.get("left").cloned().unwrap_or(Value::Bool(true)),
                right: spec.get("right").cloned().unwrap_or(Value::Bool(true)),
                operator: spec
                    .get("operator")
                    .and_then(Value::as_str)
                    .unwrap_or("==")
                    .to_string(),
            })
        }
        _ => Err(invalid("jump must be a label or a mapping".into())),
    }
}

/// Jump operands: mappings and arrays are transformation specs over the
/// state, strings with a leading `/` are state pointers, everything else is
/// literal.
fn jump_operand(
    operand: &Value,
    state: &Value,
    ops: &Operators,
    env: &ScriptEnv,
) -> Result<Value, TransformError> {
    match operand {
        Value::Object(_) | Value::Array(_) => {
            let mut ctx = OpCtx {
                ops,
                env: Some(env),
            };
            apply_spec(operand, state, &mut ctx)
        }
        Value::String(s) if s.starts_with('/') => Ok(pointer::get(state, s)),
        other => Ok(other.clone()),
    }
}

fn resolve_arguments(
    arguments: Option<&Value>,
    state: &Value,
    ops: &Operators,
    env: &ScriptEnv,
) -> Result<Option<Value>, TransformError> {
    let Some(arguments) = arguments else {
        return Ok(None);
    };
    let mut ctx = OpCtx {
        ops,
        env: Some(env),
    };
    let resolved = match arguments {
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for spec in items {
                out.push(apply_spec(spec, state, &mut ctx)?);
            }
            Value::Array(out)
        }
        Value::Object(entries) => {
            let mut out = Map::new();
            for (key, spec) in entries {
                out.insert(key.clone(), apply_spec(spec, state, &mut ctx)?);
            }
            Value::Object(out)
        }
        other => apply_spec(other, state, &mut ctx)?,
    };
    Ok(Some(resolved))
}

fn write_result(state: &mut Value, result_property: &str, value: Value) {
    pointer::set(state, result_property, value);
}

fn perform_request(
    request: &RequestStep,
    state: &Value,
    ops: &Operators,
    env: &ScriptEnv,
) -> Result<Value, ScriptError> {
    let url = match &request.url {
        Value::String(url) => url.clone(),
        spec => {
            let mut ctx = OpCtx {
                ops,
                env: Some(env),
            };
            apply_spec(spec, state, &mut ctx)?
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| ScriptError::Http("request url did not resolve to a string".into()))?
        }
    };

    let agent = ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(30))
        .build();
    let mut call = agent.request(&request.method, &url);
    for (name, value) in &request.headers {
        if let Some(v) = value.as_str() {
            call = call.set(name, v);
        }
    }

    let body = match &request.body {
        None => None,
        Some(spec) => {
            let mut ctx = OpCtx {
                ops,
                env: Some(env),
            };
            Some(apply_spec(spec, state, &mut ctx)?)
        }
    };

    let response = match body {
        None => call.call(),
        Some(Value::String(text)) => call.send_string(&text),
        Some(other) => call
            .set("content-type", "application/json")
            .send_string(&other.to_string()),
    };

    let response = match response {
        Ok(resp) => resp,
        Err(ureq::Error::Status(_code, resp)) => resp,
        Err(ureq::Error::Transport(err)) => {
            return Err(ScriptError::Http(format!(
                "{} {}: {err}",
                request.method, url
            )))
        }
    };
    Ok(response_to_value(response))
}

/// Shape the response as `{headers, body, cookies}`; the body is parsed by
/// content type (JSON and XML become mappings, anything else stays a string).
fn response_to_value(response: ureq::Response) -> Value {
    let mut headers = Map::new();
    let mut cookies = Map::new();
    for name in response.headers_names() {
        if name.eq_ignore_ascii_case("set-cookie") {
            for raw in response.all(&name) {
                if let Some((cookie_name, rest)) = raw.split_once('=') {
                    let value = rest.split(';').next().unwrap_or_default().trim();
                    cookies.insert(
                        cookie_name.trim().to_string(),
                        Value::String(value.to_string()),
                    );
                }
            }
            continue;
        }
        if let Some(value) = response.header(&name) {
            headers.insert(name.to_ascii_lowercase(), Value::String(value.to_string()));
        }
    }

    let content_type = response.content_type().to_ascii_lowercase();
    let text = response.into_string().unwrap_or_default();
    let body = if content_type.contains("json") {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    } else if content_type.contains("xml") {
        ops::xml_to_value(&text).unwrap_or(Value::String(text))
    } else {
        Value::String(text)
    };

    json!({
        "headers": headers,
        "body": body,
        "cookies": cookies,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::sync::Mutex;

    /// Records whether each query arrived with a caller context attached.
    struct StubStorage {
        response: Value,
        calls: Mutex<Vec<(String, bool, Option<Value>)>>,
    }

    impl StubStorage {
        fn new(response: Value) -> Arc<Self> {
            Arc::new(Self {
                response,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl Storage for StubStorage {
        fn query(
            &self,
            query: &str,
            context: Option<&Context>,
            arguments: Option<&Value>,
        ) -> Result<Value, QueryErrors> {
            self.calls.lock().unwrap().push((
                query.to_string(),
                context.is_some(),
                arguments.cloned(),
            ));
            Ok(self.response.clone())
        }
    }

    fn admin_env() -> ScriptEnv {
        ScriptEnv::admin(StubStorage::new(json!({})))
    }

    #[test]
    fn for_loop_counts_to_n() {
        let script = Script::new(&json!({
            "name": "loop",
            "steps": [
                "start",
                {"increment": "/i"},
                {"jump": {"left": "/i", "operator": ">=", "right": "/n", "to": "end"}},
                {"jump": "start"},
                "end"
            ]
        }))
        .unwrap();
        let out = script.run(json!({"n": 10}), &admin_env()).unwrap();
        assert_eq!(out, json!({"n": 10, "i": 10}));
    }

    #[test]
    fn unconditional_jump_skips_steps() {
        let script = Script::new(&json!({
            "name": "skip",
            "steps": [
                {"jump": {"to": "last"}},
                {"object": {"foo": "bar"}},
                "last",
                {"object": {"foo": "/foo", "bar": "baz"}}
            ]
        }))
        .unwrap();
        let out = script.run(json!({}), &admin_env()).unwrap();
        assert_eq!(out, json!({"foo": null, "bar": "baz"}));
    }

    #[test]
    fn infinite_loop_hits_step_budget() {
        let script = Script::new(&json!({
            "name": "spin",
            "steps": ["top", {"jump": "top"}]
        }))
        .unwrap();
        let err = script.run(json!({}), &admin_env()).unwrap_err();
        assert!(matches!(
            err,
            ScriptError::StepBudgetExceeded { max_steps: 1000, .. }
        ));
    }

    #[test]
    fn second_activation_rejects() {
        let script = Arc::new(
            Script::new(&json!({
                "name": "slow",
                "delay": 40,
                "steps": [{"object": {"a": 1}}, {"object": {"b": 2}}, {"object": {"c": 3}}]
            }))
            .unwrap(),
        );
        let env = admin_env();
        std::thread::scope(|scope| {
            let background = {
                let script = Arc::clone(&script);
                let env = env.clone();
                scope.spawn(move || script.run(json!({}), &env))
            };
            std::thread::sleep(Duration::from_millis(15));
            let err = script.run(json!({}), &env).unwrap_err();
            assert!(matches!(err, ScriptError::ConcurrentRun(_)));
            assert!(background.join().unwrap().is_ok());
        });
    }

    #[test]
    fn increment_starts_at_zero() {
        let script = Script::new(&json!({
            "name": "inc",
            "steps": [{"increment": "/count"}]
        }))
        .unwrap();
        assert_eq!(
            script.run(json!({}), &admin_env()).unwrap(),
            json!({"count": 0})
        );
        assert_eq!(
            script.run(json!({"count": 4}), &admin_env()).unwrap(),
            json!({"count": 5})
        );
    }

    #[test]
    fn query_defaults_to_admin_mode() {
        let storage = StubStorage::new(json!({"rows": []}));
        let env = ScriptEnv::with_context(
            Arc::clone(&storage) as Arc<dyn Storage>,
            Context::new(json!({"id": 1})),
        );
        let script = Script::new(&json!({
            "name": "q",
            "steps": [{"query": "{listItem}"}]
        }))
        .unwrap();
        let out = script.run(json!({}), &env).unwrap();
        assert_eq!(out, json!({"result": {"rows": []}}));
        let calls = storage.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].1, "context must not be forwarded by default");
    }

    #[test]
    fn run_in_context_forwards_caller() {
        let storage = StubStorage::new(json!({}));
        let env = ScriptEnv::with_context(
            Arc::clone(&storage) as Arc<dyn Storage>,
            Context::new(json!({"id": 1})),
        );
        let script = Script::new(&json!({
            "name": "q",
            "steps": [{"query": "{listItem}", "runInContext": true}]
        }))
        .unwrap();
        script.run(json!({}), &env).unwrap();
        assert!(storage.calls.lock().unwrap()[0].1);
    }

    #[test]
    fn query_arguments_resolve_against_state() {
        let storage = StubStorage::new(json!({}));
        let env = ScriptEnv::admin(Arc::clone(&storage) as Arc<dyn Storage>);
        let script = Script::new(&json!({
            "name": "q",
            "steps": [{
                "query": "{readUser(id: ?)}",
                "arguments": ["/userId", {"static": "fixed"}]
            }]
        }))
        .unwrap();
        script.run(json!({"userId": 42}), &env).unwrap();
        let calls = storage.calls.lock().unwrap();
        assert_eq!(calls[0].2, Some(json!([42, "fixed"])));
    }

    #[test]
    fn result_property_overrides_and_replaces_root() {
        let storage = StubStorage::new(json!({"x": 1}));
        let env = ScriptEnv::admin(Arc::clone(&storage) as Arc<dyn Storage>);
        let script = Script::new(&json!({
            "name": "q",
            "steps": [{"query": "{a}", "resultProperty": "/out/inner"}]
        }))
        .unwrap();
        assert_eq!(
            script.run(json!({}), &env).unwrap(),
            json!({"out": {"inner": {"x": 1}}})
        );

        let script = Script::new(&json!({
            "name": "q2",
            "steps": [{"query": "{a}", "resultProperty": ""}]
        }))
        .unwrap();
        assert_eq!(script.run(json!({"old": true}), &env).unwrap(), json!({"x": 1}));
    }

    #[test]
    fn jump_operators_loose_and_strict() {
        let run_jump = |operator: &str, left: Value, right: Value| -> bool {
            let script = Script::new(&json!({
                "name": "j",
                "steps": [
                    {"jump": {"left": left, "operator": operator, "right": right, "to": "yes"}},
                    {"object": {"taken": {"static": false}}},
                    {"jump": "end"},
                    "yes",
                    {"object": {"taken": {"static": true}}},
                    "end"
                ]
            }))
            .unwrap();
            script.run(json!({}), &admin_env()).unwrap()["taken"]
                .as_bool()
                .unwrap()
        };
        assert!(run_jump("==", json!(1), json!("1")));
        assert!(!run_jump("===", json!(1), json!("1")));
        assert!(run_jump("!==", json!(1), json!("1")));
        assert!(run_jump("<", json!(2), json!(10)));
        assert!(run_jump("in", json!("b"), json!(["a", "b"])));
        assert!(!run_jump("between", json!(1), json!(2)), "unknown operator is never taken");
    }

    #[test]
    fn eval_runs_nested_script() {
        let script = Script::new(&json!({
            "name": "outer",
            "steps": [{
                "eval": [
                    {"increment": "/nested"},
                    {"increment": "/nested"}
                ]
            }]
        }))
        .unwrap();
        let out = script.run(json!({}), &admin_env()).unwrap();
        assert_eq!(out, json!({"nested": 1}));
    }

    #[test]
    fn debug_trace_records_each_step() {
        let script = Script::new(&json!({
            "name": "t",
            "steps": [
                {"object": {"a": {"static": 1}}},
                {"jump": {"to": "end"}},
                "end"
            ]
        }))
        .unwrap();
        let (state, trace) = script.run_debug(json!({}), &admin_env()).unwrap();
        assert_eq!(state, json!({"a": 1}));
        let steps = trace.as_array().unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0]["output"], json!({"a": 1}));
        assert_eq!(steps[1]["info"], json!("jump to 'end'"));
        assert!(steps[2]["children"].as_array().unwrap().is_empty());
    }

    #[test]
    fn validation_errors() {
        assert!(matches!(
            Script::new(&json!({"steps": [{}]})).unwrap_err(),
            ScriptError::MissingName
        ));
        assert!(matches!(
            Script::new(&json!({"name": "x"})).unwrap_err(),
            ScriptError::MissingSteps(_)
        ));
        assert!(matches!(
            Script::new(&json!({"name": "x", "steps": ["a", "a"]})).unwrap_err(),
            ScriptError::DuplicateLabel { .. }
        ));
        assert!(matches!(
            Script::new(&json!({"name": "x", "steps": [{"jump": "nowhere"}]})).unwrap_err(),
            ScriptError::UnknownLabel { .. }
        ));
        assert!(matches!(
            Script::new(&json!({"name": "x", "steps": ["a"], "schedule": "bogus"})).unwrap_err(),
            ScriptError::InvalidSchedule { .. }
        ));
    }
}
