//! Transformation chains: the pure value-to-value half of the engine.
//!
//! A transformation is an ordered template mapping operator names to operator
//! arguments. Operators run in template order over a single current value.
//! `Null` is an in-band signal: a chain whose input is `Null`, or whose
//! operator yields `Null`, short-circuits to `Null` without error.
//!
//! Two dialects exist and are never merged:
//! - [`Dialect::Pointer`] — the current operator set (`get` + JSON pointers;
//!   string shorthands starting with `/` read the input, others are literal).
//! - [`Dialect::JsonPath`] — the legacy set (`single`/`multiple` JSONPath
//!   queries; string shorthands starting with `$` query the input).

use crate::ops;
use crate::pointer;
use crate::script::ScriptEnv;
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Operator function signature used by the registry.
///
/// `arg` is the template value for this operator, `input` the current chain
/// value. Operators never see `Null` input; the chain driver bails first.
pub type OperatorFn = fn(arg: &Value, input: &Value, ctx: &mut OpCtx) -> Result<Value, TransformError>;

/// Transformation-layer error. `Null` results are not errors.
#[derive(Error, Debug, Clone)]
pub enum TransformError {
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("invalid argument for '{op}': {message}")]
    InvalidArgument { op: String, message: String },
}

impl TransformError {
    pub(crate) fn invalid(op: &str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            op: op.to_string(),
            message: message.into(),
        }
    }
}

/// Operator-set selector. Decided at construction, never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Pointer,
    JsonPath,
}

/// Mutable evaluation context passed to every operator call.
///
/// `env` is only present when a chain runs inside a script; the `eval`
/// operator needs it to spawn nested scripts.
pub struct OpCtx<'a> {
    pub ops: &'a Operators,
    pub env: Option<&'a ScriptEnv>,
}

/// Operator registry for one dialect.
#[derive(Debug)]
pub struct Operators {
    dialect: Dialect,
    ops: HashMap<String, OperatorFn>,
}

impl Operators {
    /// Registry for the current dialect (`get` + JSON pointers).
    pub fn pointer() -> Self {
        let mut reg = Self::base(Dialect::Pointer);
        reg.ops.insert("get".into(), op_get as OperatorFn);
        reg
    }

    /// Registry for the legacy dialect (`single`/`multiple` JSONPath).
    pub fn jsonpath() -> Self {
        let mut reg = Self::base(Dialect::JsonPath);
        reg.ops.insert("single".into(), op_single as OperatorFn);
        reg.ops.insert("multiple".into(), op_multiple as OperatorFn);
        reg
    }

    fn base(dialect: Dialect) -> Self {
        let mut table: HashMap<String, OperatorFn> = HashMap::new();
        table.insert("static".into(), op_static as OperatorFn);
        table.insert("object".into(), op_object as OperatorFn);
        table.insert("map".into(), op_map as OperatorFn);
        table.insert("array".into(), op_array as OperatorFn);
        table.insert("filter".into(), op_filter as OperatorFn);
        table.insert("union".into(), op_union as OperatorFn);
        table.insert("slice".into(), op_slice as OperatorFn);
        table.insert("case".into(), op_case as OperatorFn);
        table.insert("keys".into(), op_keys as OperatorFn);
        table.insert("omit".into(), op_omit as OperatorFn);
        table.insert("pick".into(), op_pick as OperatorFn);
        table.insert("changed".into(), op_changed as OperatorFn);
        table.insert("change".into(), op_change as OperatorFn);
        table.insert("assert".into(), op_assert as OperatorFn);
        let mut reg = Self {
            dialect,
            ops: table,
        };
        ops::install(&mut reg);
        reg
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Lookup an operator by name.
    pub fn get(&self, name: &str) -> Option<OperatorFn> {
        self.ops.get(name).copied()
    }

    /// Register or replace an operator. Returns the previous handler.
    pub fn register(&mut self, name: impl Into<String>, op: OperatorFn) -> Option<OperatorFn> {
        self.ops.insert(name.into(), op)
    }
}

/// A validated transformation template bound to a dialect.
#[derive(Debug)]
pub struct Transformation {
    template: Map<String, Value>,
    ops: Operators,
}

impl Transformation {
    /// Build a transformation in the current (pointer) dialect.
    pub fn new(template: &Value) -> Result<Self, TransformError> {
        Self::with_operators(template, Operators::pointer())
    }

    /// Build a transformation in an explicit dialect.
    pub fn with_dialect(template: &Value, dialect: Dialect) -> Result<Self, TransformError> {
        let ops = match dialect {
            Dialect::Pointer => Operators::pointer(),
            Dialect::JsonPath => Operators::jsonpath(),
        };
        Self::with_operators(template, ops)
    }

    /// Build a transformation over a caller-extended registry.
    pub fn with_operators(template: &Value, ops: Operators) -> Result<Self, TransformError> {
        let template = template
            .as_object()
            .cloned()
            .ok_or_else(|| TransformError::invalid("transform", "template must be a mapping"))?;
        for name in template.keys() {
            if ops.get(name).is_none() {
                return Err(TransformError::UnknownOperator(name.clone()));
            }
        }
        Ok(Self { template, ops })
    }

    /// Run the chain over `value`.
    pub fn transform(&self, value: &Value) -> Result<Value, TransformError> {
        let mut ctx = OpCtx {
            ops: &self.ops,
            env: None,
        };
        run_chain(&self.template, value, &mut ctx)
    }

    /// Run the chain with a script environment attached (enables `eval`).
    pub fn transform_with_env(&self, value: &Value, env: &ScriptEnv) -> Result<Value, TransformError> {
        let mut ctx = OpCtx {
            ops: &self.ops,
            env: Some(env),
        };
        run_chain(&self.template, value, &mut ctx)
    }
}

/// Execute a template over `input` with chain-bail semantics.
pub fn run_chain(
    template: &Map<String, Value>,
    input: &Value,
    ctx: &mut OpCtx,
) -> Result<Value, TransformError> {
    let mut current = input.clone();
    for (name, arg) in template {
        if current.is_null() {
            return Ok(Value::Null);
        }
        let op = ctx
            .ops
            .get(name)
            .ok_or_else(|| TransformError::UnknownOperator(name.clone()))?;
        current = op(arg, &current, ctx)?;
    }
    Ok(current)
}

/// Evaluate a sub-transformation spec with shorthand coercion.
///
/// - string: dialect shorthand — pointer dialect reads `/…` pointers,
///   JSONPath dialect queries `$…` expressions; other strings are literal
/// - array: a chain of its own, each element a spec
/// - mapping: a transformation template
/// - any other scalar: literal
pub fn apply_spec(spec: &Value, input: &Value, ctx: &mut OpCtx) -> Result<Value, TransformError> {
    match spec {
        Value::String(s) => Ok(shorthand_string(s, input, ctx)),
        Value::Array(chain) => {
            let mut current = input.clone();
            for part in chain {
                if current.is_null() {
                    return Ok(Value::Null);
                }
                current = apply_spec(part, &current, ctx)?;
            }
            Ok(current)
        }
        Value::Object(map) => run_chain(map, input, ctx),
        other => Ok(other.clone()),
    }
}

fn shorthand_string(s: &str, input: &Value, ctx: &mut OpCtx) -> Value {
    match ctx.ops.dialect {
        Dialect::Pointer => {
            if s.is_empty() || s.starts_with('/') {
                pointer::get(input, s)
            } else {
                Value::String(s.to_string())
            }
        }
        Dialect::JsonPath => {
            if s.starts_with('$') {
                ops::jsonpath_single(s, input).unwrap_or(Value::Null)
            } else {
                Value::String(s.to_string())
            }
        }
    }
}

/// JavaScript-flavored truthiness used by `filter` and script jumps.
pub(crate) fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub(crate) fn coerce_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Loose equality: exact match, or scalar comparison after numeric coercion.
pub(crate) fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    matches!((coerce_f64(a), coerce_f64(b)), (Some(x), Some(y)) if x == y)
}

/// Ordering for `<`/`>` style comparisons: numeric when both sides coerce,
/// lexicographic when both are strings.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (coerce_f64(a), coerce_f64(b)) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    None
}

// ---- structural operators ----

fn op_get(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let ptr = arg
        .as_str()
        .ok_or_else(|| TransformError::invalid("get", "pointer must be a string"))?;
    Ok(pointer::get(input, ptr))
}

fn op_single(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let path = arg
        .as_str()
        .ok_or_else(|| TransformError::invalid("single", "path must be a string"))?;
    ops::jsonpath_single(path, input)
}

fn op_multiple(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let path = arg
        .as_str()
        .ok_or_else(|| TransformError::invalid("multiple", "path must be a string"))?;
    ops::jsonpath_all(path, input)
}

fn op_static(arg: &Value, _input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    Ok(arg.clone())
}

/// Build a fresh mapping. The special key `...` merges the subtree its
/// pointer addresses into the result.
fn op_object(arg: &Value, input: &Value, ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let spec = arg
        .as_object()
        .ok_or_else(|| TransformError::invalid("object", "spec must be a mapping"))?;
    let mut out = Map::new();
    for (key, sub) in spec {
        if key == "..." {
            let ptr = sub
                .as_str()
                .ok_or_else(|| TransformError::invalid("object", "'...' value must be a pointer"))?;
            if let Value::Object(subtree) = pointer::get(input, ptr) {
                for (k, v) in subtree {
                    out.insert(k, v);
                }
            }
            continue;
        }
        out.insert(key.clone(), apply_spec(sub, input, ctx)?);
    }
    Ok(Value::Object(out))
}

fn op_map(arg: &Value, input: &Value, ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let items = input
        .as_array()
        .ok_or_else(|| TransformError::invalid("map", "input must be an array"))?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(apply_spec(arg, item, ctx)?);
    }
    Ok(Value::Array(out))
}

fn op_array(arg: &Value, input: &Value, ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let specs = arg
        .as_array()
        .ok_or_else(|| TransformError::invalid("array", "spec must be an array"))?;
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        out.push(apply_spec(spec, input, ctx)?);
    }
    Ok(Value::Array(out))
}

/// Three forms: `{}` drops falsy elements; `{source, filter}` filters the
/// array a pointer addresses with the item exposed at `/item`; anything else
/// is a subscript applied to each element of the array input.
fn op_filter(arg: &Value, input: &Value, ctx: &mut OpCtx) -> Result<Value, TransformError> {
    if let Some(spec) = arg.as_object() {
        if spec.is_empty() {
            let items = input
                .as_array()
                .ok_or_else(|| TransformError::invalid("filter", "input must be an array"))?;
            return Ok(Value::Array(
                items.iter().filter(|v| truthy(v)).cloned().collect(),
            ));
        }
        if spec.contains_key("source") && spec.contains_key("filter") {
            let source = spec["source"]
                .as_str()
                .ok_or_else(|| TransformError::invalid("filter", "source must be a pointer"))?;
            let items = match pointer::get(input, source) {
                Value::Array(items) => items,
                Value::Null => return Ok(Value::Null),
                _ => return Err(TransformError::invalid("filter", "source must point at an array")),
            };
            let mut scope = input.clone();
            let mut out = Vec::new();
            for item in items {
                pointer::set(&mut scope, "/item", item.clone());
                if truthy(&apply_spec(&spec["filter"], &scope, ctx)?) {
                    out.push(item);
                }
            }
            return Ok(Value::Array(out));
        }
    }
    let items = input
        .as_array()
        .ok_or_else(|| TransformError::invalid("filter", "input must be an array"))?;
    let mut out = Vec::new();
    for item in items {
        if truthy(&apply_spec(arg, item, ctx)?) {
            out.push(item.clone());
        }
    }
    Ok(Value::Array(out))
}

/// Concatenate the arrays each sub-expression yields, dropping duplicates
/// while preserving first-occurrence order.
fn op_union(arg: &Value, input: &Value, ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let specs = arg
        .as_array()
        .ok_or_else(|| TransformError::invalid("union", "spec must be an array"))?;
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for spec in specs {
        let part = apply_spec(spec, input, ctx)?;
        let items = match part {
            Value::Array(items) => items,
            Value::Null => continue,
            other => vec![other],
        };
        for item in items {
            let key = item.to_string();
            if seen.insert(key) {
                out.push(item);
            }
        }
    }
    Ok(Value::Array(out))
}

fn op_slice(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let items = input
        .as_array()
        .ok_or_else(|| TransformError::invalid("slice", "input must be an array"))?;
    let from = arg.get("from").and_then(Value::as_i64).unwrap_or(0);
    let to = arg.get("to").and_then(Value::as_i64).unwrap_or(items.len() as i64);
    let len = items.len() as i64;
    let clamp = |i: i64| -> usize {
        let i = if i < 0 { len + i } else { i };
        i.clamp(0, len) as usize
    };
    let (from, to) = (clamp(from), clamp(to));
    if from >= to {
        return Ok(Value::Array(Vec::new()));
    }
    Ok(Value::Array(items[from..to].to_vec()))
}

/// Value lookup table with an optional `default` arm.
fn op_case(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let table = arg
        .as_object()
        .ok_or_else(|| TransformError::invalid("case", "spec must be a mapping"))?;
    let key = match input {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if let Some(v) = table.get(&key) {
        return Ok(v.clone());
    }
    Ok(table.get("default").cloned().unwrap_or(Value::Null))
}

fn op_keys(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    match input {
        Value::Object(map) => Ok(Value::Array(
            map.keys().map(|k| Value::String(k.clone())).collect(),
        )),
        _ => Ok(Value::Null),
    }
}

fn key_list(arg: &Value, op: &str) -> Result<Vec<String>, TransformError> {
    match arg {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| TransformError::invalid(op, "keys must be strings"))
            })
            .collect(),
        _ => Err(TransformError::invalid(op, "expected a key or list of keys")),
    }
}

fn op_omit(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let keys = key_list(arg, "omit")?;
    match input {
        Value::Object(map) => {
            let mut out = map.clone();
            for key in &keys {
                out.remove(key);
            }
            Ok(Value::Object(out))
        }
        _ => Ok(Value::Null),
    }
}

fn op_pick(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let keys = key_list(arg, "pick")?;
    match input {
        Value::Object(map) => {
            let mut out = Map::new();
            for key in &keys {
                if let Some(v) = map.get(key) {
                    out.insert(key.clone(), v.clone());
                }
            }
            Ok(Value::Object(out))
        }
        _ => Ok(Value::Null),
    }
}

/// Diff two mappings: keys new or changed in `right` keep their right-hand
/// value, keys deleted from `left` map to `Null`.
fn op_changed(arg: &Value, input: &Value, ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let left_spec = arg
        .get("left")
        .ok_or_else(|| TransformError::invalid("changed", "missing 'left'"))?;
    let right_spec = arg
        .get("right")
        .ok_or_else(|| TransformError::invalid("changed", "missing 'right'"))?;
    let left = as_object_or_empty(apply_spec(left_spec, input, ctx)?);
    let right = as_object_or_empty(apply_spec(right_spec, input, ctx)?);
    let mut diff = Map::new();
    for (key, value) in &right {
        if left.get(key) != Some(value) {
            diff.insert(key.clone(), value.clone());
        }
    }
    for key in left.keys() {
        if !right.contains_key(key) {
            diff.insert(key.clone(), Value::Null);
        }
    }
    Ok(Value::Object(diff))
}

/// Apply a diff produced by `changed`: `Null` deletes, anything else writes.
fn op_change(arg: &Value, input: &Value, ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let target_spec = arg
        .get("target")
        .ok_or_else(|| TransformError::invalid("change", "missing 'target'"))?;
    let changes_spec = arg
        .get("changes")
        .ok_or_else(|| TransformError::invalid("change", "missing 'changes'"))?;
    let mut target = as_object_or_empty(apply_spec(target_spec, input, ctx)?);
    let changes = as_object_or_empty(apply_spec(changes_spec, input, ctx)?);
    for (key, value) in changes {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
    Ok(Value::Object(target))
}

fn as_object_or_empty(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Validate the input against a JSON-Schema-like mapping; pass it through
/// unchanged on success.
fn op_assert(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    validate_schema(arg, input, "").map_err(|msg| TransformError::invalid("assert", msg))?;
    Ok(input.clone())
}

fn validate_schema(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let schema = match schema.as_object() {
        Some(s) => s,
        None => return Ok(()),
    };
    if let Some(expected) = schema.get("type") {
        let names: Vec<&str> = match expected {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => vec![],
        };
        if !names.is_empty() && !names.iter().any(|n| type_matches(n, value)) {
            return Err(format!("{path}: expected type {}", names.join("|")));
        }
    }
    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("{path}: value not in enum"));
        }
    }
    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(format!("{path}: {n} below minimum {min}"));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(format!("{path}: {n} above maximum {max}"));
            }
        }
    }
    if let Some(s) = value.as_str() {
        if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
            if (s.chars().count() as u64) < min {
                return Err(format!("{path}: shorter than minLength {min}"));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
            if (s.chars().count() as u64) > max {
                return Err(format!("{path}: longer than maxLength {max}"));
            }
        }
        if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
            let re = regex::Regex::new(pattern)
                .map_err(|e| format!("{path}: bad pattern: {e}"))?;
            if !re.is_match(s) {
                return Err(format!("{path}: does not match pattern"));
            }
        }
    }
    if let (Some(props), Some(obj)) = (
        schema.get("properties").and_then(Value::as_object),
        value.as_object(),
    ) {
        for (key, sub) in props {
            if let Some(v) = obj.get(key) {
                validate_schema(sub, v, &format!("{path}/{key}"))?;
            }
        }
    }
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let obj = value
            .as_object()
            .ok_or_else(|| format!("{path}: expected object"))?;
        for key in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(key) {
                return Err(format!("{path}: missing required '{key}'"));
            }
        }
    }
    if let (Some(items_schema), Some(items)) = (schema.get("items"), value.as_array()) {
        for (i, item) in items.iter().enumerate() {
            validate_schema(items_schema, item, &format!("{path}/{i}"))?;
        }
    }
    Ok(())
}

fn type_matches(name: &str, value: &Value) -> bool {
    match name {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "string" => value.is_string(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(template: Value, input: Value) -> Value {
        Transformation::new(&template)
            .expect("template should validate")
            .transform(&input)
            .expect("transform should succeed")
    }

    #[test]
    fn object_reads_pointers() {
        let out = run(json!({"object": {"baz": "/foo"}}), json!({"foo": "bar"}));
        assert_eq!(out, json!({"baz": "bar"}));
    }

    #[test]
    fn object_strings_without_slash_are_literal() {
        let out = run(
            json!({"object": {"foo": "/foo", "bar": "baz"}}),
            json!({}),
        );
        assert_eq!(out, json!({"foo": null, "bar": "baz"}));
    }

    #[test]
    fn chain_bails_on_null() {
        let out = run(
            json!({"get": "/unknown", "hash": {"algorithm": "md5"}}),
            json!({}),
        );
        assert_eq!(out, Value::Null);
    }

    #[test]
    fn null_input_short_circuits() {
        let out = run(json!({"static": "still here"}), Value::Null);
        assert_eq!(out, Value::Null);
    }

    #[test]
    fn unknown_operator_fails_at_construction() {
        let err = Transformation::new(&json!({"frobnicate": {}})).unwrap_err();
        assert!(matches!(err, TransformError::UnknownOperator(name) if name == "frobnicate"));
    }

    #[test]
    fn object_spread_merges_subtree() {
        let out = run(
            json!({"object": {"...": "/inner", "extra": "/top"}}),
            json!({"inner": {"a": 1, "b": 2}, "top": "t"}),
        );
        assert_eq!(out, json!({"a": 1, "b": 2, "extra": "t"}));
    }

    #[test]
    fn map_applies_subscript_per_element() {
        let out = run(
            json!({"get": "/items", "map": {"object": {"id": "/id"}}}),
            json!({"items": [{"id": 1, "x": 9}, {"id": 2}]}),
        );
        assert_eq!(out, json!([{"id": 1}, {"id": 2}]));
    }

    #[test]
    fn map_requires_array() {
        let t = Transformation::new(&json!({"map": "/x"})).unwrap();
        assert!(t.transform(&json!({"a": 1})).is_err());
    }

    #[test]
    fn array_evaluates_each_spec_against_input() {
        let out = run(
            json!({"array": ["/a", "/b", {"static": 3}]}),
            json!({"a": 1, "b": 2}),
        );
        assert_eq!(out, json!([1, 2, 3]));
    }

    #[test]
    fn filter_empty_drops_falsy() {
        let out = run(
            json!({"filter": {}}),
            json!([0, 1, "", "x", null, true, false]),
        );
        assert_eq!(out, json!([1, "x", true]));
    }

    #[test]
    fn filter_subscript_keeps_truthy() {
        let out = run(
            json!({"filter": {"get": "/keep"}}),
            json!([{"keep": true, "n": 1}, {"keep": false, "n": 2}]),
        );
        assert_eq!(out, json!([{"keep": true, "n": 1}]));
    }

    #[test]
    fn filter_source_exposes_item() {
        let out = run(
            json!({"filter": {"source": "/rows", "filter": {"get": "/item/active"}}}),
            json!({"rows": [{"active": true, "n": 1}, {"active": false, "n": 2}]}),
        );
        assert_eq!(out, json!([{"active": true, "n": 1}]));
    }

    #[test]
    fn union_concats_and_dedupes() {
        let out = run(
            json!({"union": ["/a", "/b"]}),
            json!({"a": [1, 2], "b": [2, 3]}),
        );
        assert_eq!(out, json!([1, 2, 3]));
    }

    #[test]
    fn slice_clamps_and_wraps_negatives() {
        let input = json!([0, 1, 2, 3, 4]);
        assert_eq!(run(json!({"slice": {"from": 1, "to": 3}}), input.clone()), json!([1, 2]));
        assert_eq!(run(json!({"slice": {"from": -2}}), input.clone()), json!([3, 4]));
        assert_eq!(run(json!({"slice": {"from": 7}}), input), json!([]));
    }

    #[test]
    fn case_lookup_with_default() {
        let table = json!({"case": {"a": 1, "b": 2, "default": 0}});
        assert_eq!(run(table.clone(), json!("a")), json!(1));
        assert_eq!(run(table, json!("zz")), json!(0));
        assert_eq!(run(json!({"case": {"a": 1}}), json!("zz")), Value::Null);
    }

    #[test]
    fn keys_pick_omit() {
        let input = json!({"a": 1, "b": 2, "c": 3});
        assert_eq!(run(json!({"keys": {}}), input.clone()), json!(["a", "b", "c"]));
        assert_eq!(run(json!({"pick": ["a", "c"]}), input.clone()), json!({"a": 1, "c": 3}));
        assert_eq!(run(json!({"omit": "b"}), input), json!({"a": 1, "c": 3}));
    }

    #[test]
    fn changed_then_change_roundtrips() {
        let input = json!({
            "old": {"keep": 1, "drop": 2, "edit": 3},
            "new": {"keep": 1, "edit": 4, "add": 5}
        });
        let diff = run(json!({"changed": {"left": "/old", "right": "/new"}}), input.clone());
        assert_eq!(diff, json!({"edit": 4, "add": 5, "drop": null}));

        let mut scope = input.as_object().unwrap().clone();
        scope.insert("diff".into(), diff);
        let applied = run(
            json!({"change": {"target": "/old", "changes": "/diff"}}),
            Value::Object(scope),
        );
        assert_eq!(applied, json!({"keep": 1, "edit": 4, "add": 5}));
    }

    #[test]
    fn assert_passes_and_fails() {
        let schema = json!({"assert": {
            "type": "object",
            "required": ["name"],
            "properties": {"name": {"type": "string", "minLength": 2}}
        }});
        assert_eq!(
            run(schema.clone(), json!({"name": "ok"})),
            json!({"name": "ok"})
        );
        let t = Transformation::new(&schema).unwrap();
        assert!(t.transform(&json!({"name": "x"})).is_err());
        assert!(t.transform(&json!({})).is_err());
    }

    #[test]
    fn jsonpath_dialect_single_and_multiple() {
        let t = Transformation::with_dialect(
            &json!({"single": "$.items[0].id"}),
            Dialect::JsonPath,
        )
        .unwrap();
        let input = json!({"items": [{"id": 7}, {"id": 8}]});
        assert_eq!(t.transform(&input).unwrap(), json!(7));

        let t = Transformation::with_dialect(
            &json!({"multiple": "$.items[*].id"}),
            Dialect::JsonPath,
        )
        .unwrap();
        assert_eq!(t.transform(&input).unwrap(), json!([7, 8]));
    }

    #[test]
    fn jsonpath_dialect_rejects_get() {
        let err = Transformation::with_dialect(&json!({"get": "/x"}), Dialect::JsonPath)
            .unwrap_err();
        assert!(matches!(err, TransformError::UnknownOperator(_)));
    }

    #[test]
    fn pointer_dialect_rejects_single() {
        let err = Transformation::new(&json!({"single": "$.x"})).unwrap_err();
        assert!(matches!(err, TransformError::UnknownOperator(_)));
    }
}
