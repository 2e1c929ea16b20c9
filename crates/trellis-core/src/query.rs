//! Compact GraphQL-like query language: parser and dispatcher.
//!
//! ```text
//! { alias: methodName(param: value, ...) { field alias2: otherField { nested } } }
//! ```
//!
//! Method names split as `(operation)(Entity)`: `listUser`, `createUser`,
//! `User` (bare = read). Values may be `?` placeholders bound positionally or
//! `$name` bindings bound from a mapping; both are resolved during parsing,
//! so a bound value can never be re-interpreted as query text.
//!
//! The [`Dispatcher`] routes each top-level field to a registered model,
//! gates it through the caller's access predicates, expands schema-declared
//! references, resolves plugin fields, and re-reads missing fields once.

use crate::context::Context;
use crate::script::{Script, ScriptEnv};
use crate::storage::{Model, Operation, Storage};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, Weak};
use thiserror::Error;

/// Error for one query alias.
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),
    #[error("operation '{operation}' is not supported by '{entity}'")]
    UnsupportedOperation { entity: String, operation: String },
    #[error("unknown field '{field}' on '{entity}'")]
    UnknownField { entity: String, field: String },
    #[error("permission denied")]
    PermissionDenied { field: Option<String> },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("script error: {0}")]
    Script(String),
}

/// Per-alias error entry surfaced as a single payload.
#[derive(Debug, Clone)]
pub struct AliasError {
    pub alias: String,
    pub field: Option<String>,
    pub message: String,
    pub denied: bool,
}

/// All alias failures of one query execution.
#[derive(Debug, Clone)]
pub struct QueryErrors {
    pub errors: Vec<AliasError>,
}

impl QueryErrors {
    fn single(alias: &str, error: QueryError) -> Self {
        Self {
            errors: vec![AliasError::new(alias, error)],
        }
    }

    /// True when any alias failed an access check (maps to HTTP 403).
    pub fn denied(&self) -> bool {
        self.errors.iter().any(|e| e.denied)
    }

    /// `{"errors": [{alias, field?, message}]}`
    pub fn payload(&self) -> Value {
        Value::Array(
            self.errors
                .iter()
                .map(|e| {
                    let mut entry = Map::new();
                    entry.insert("alias".into(), Value::String(e.alias.clone()));
                    if let Some(field) = &e.field {
                        entry.insert("field".into(), Value::String(field.clone()));
                    }
                    entry.insert("message".into(), Value::String(e.message.clone()));
                    Value::Object(entry)
                })
                .collect(),
        )
    }
}

impl AliasError {
    fn new(alias: &str, error: QueryError) -> Self {
        let (field, denied) = match &error {
            QueryError::PermissionDenied { field } => (field.clone(), true),
            QueryError::UnknownField { field, .. } => (Some(field.clone()), false),
            _ => (None, false),
        };
        Self {
            alias: alias.to_string(),
            field,
            message: error.to_string(),
            denied,
        }
    }
}

impl std::fmt::Display for QueryErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| {
                if e.alias.is_empty() {
                    e.message.clone()
                } else {
                    format!("{}: {}", e.alias, e.message)
                }
            })
            .collect();
        f.write_str(&parts.join("; "))
    }
}

impl std::error::Error for QueryErrors {}

/// Resolved method of a top-level query field.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    Entity { operation: Operation, entity: String },
    Script,
}

#[derive(Debug, Clone)]
pub struct QueryField {
    pub alias: String,
    pub method: Method,
    pub params: Map<String, Value>,
    pub selection: Vec<Selection>,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub alias: String,
    pub name: String,
    pub nested: Vec<Selection>,
}

/// Parse a query string, resolving placeholders from `arguments`
/// (array = positional `?`, mapping = named `$name`).
pub fn parse_query(query: &str, arguments: Option<&Value>) -> Result<Vec<QueryField>, QueryError> {
    let tokens = tokenize(query)?;
    let (positional, named) = match arguments {
        Some(Value::Array(items)) => (items.as_slice(), None),
        Some(Value::Object(map)) => ([].as_slice(), Some(map)),
        _ => ([].as_slice(), None),
    };
    let mut parser = Parser {
        tokens,
        pos: 0,
        positional,
        positional_index: 0,
        named,
    };
    let fields = parser.document()?;
    Ok(fields)
}

fn method_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^([a-z]+)?([A-Z]\w*)$").expect("static regex"))
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Colon,
    Ident(String),
    Literal(Value),
    Placeholder,
    Named(String),
}

fn tokenize(input: &str) -> Result<Vec<Tok>, QueryError> {
    let mut chars = input.chars().peekable();
    let mut out = Vec::new();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() || c == ',' => {
                chars.next();
            }
            '{' => {
                chars.next();
                out.push(Tok::LBrace);
            }
            '}' => {
                chars.next();
                out.push(Tok::RBrace);
            }
            '(' => {
                chars.next();
                out.push(Tok::LParen);
            }
            ')' => {
                chars.next();
                out.push(Tok::RParen);
            }
            '[' => {
                chars.next();
                out.push(Tok::LBracket);
            }
            ']' => {
                chars.next();
                out.push(Tok::RBracket);
            }
            ':' => {
                chars.next();
                out.push(Tok::Colon);
            }
            '?' => {
                chars.next();
                out.push(Tok::Placeholder);
            }
            '$' => {
                chars.next();
                let mut name = String::new();
                while let Some(&nc) = chars.peek() {
                    if nc.is_alphanumeric() || nc == '_' {
                        name.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    return Err(QueryError::Parse("'$' must be followed by a name".into()));
                }
                out.push(Tok::Named(name));
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(nc) if nc == quote => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some('r') => s.push('\r'),
                            Some(other) => s.push(other),
                            None => {
                                return Err(QueryError::Parse("unterminated string".into()))
                            }
                        },
                        Some(nc) => s.push(nc),
                        None => return Err(QueryError::Parse("unterminated string".into())),
                    }
                }
                out.push(Tok::Literal(Value::String(s)));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(&nc) = chars.peek() {
                    if nc.is_ascii_digit() || nc == '.' || nc == 'e' || nc == 'E' || nc == '+' || nc == '-'
                    {
                        s.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number: Value = serde_json::from_str(&s)
                    .map_err(|_| QueryError::Parse(format!("invalid number '{s}'")))?;
                out.push(Tok::Literal(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&nc) = chars.peek() {
                    if nc.is_alphanumeric() || nc == '_' {
                        s.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push(Tok::Ident(s));
            }
            other => {
                return Err(QueryError::Parse(format!("unexpected character '{other}'")))
            }
        }
    }
    Ok(out)
}

struct Parser<'a> {
    tokens: Vec<Tok>,
    pos: usize,
    positional: &'a [Value],
    positional_index: usize,
    named: Option<&'a Map<String, Value>>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: &Tok, what: &str) -> Result<(), QueryError> {
        match self.next() {
            Some(ref t) if t == expected => Ok(()),
            other => Err(QueryError::Parse(format!(
                "expected {what}, found {other:?}"
            ))),
        }
    }

    fn ident(&mut self, what: &str) -> Result<String, QueryError> {
        match self.next() {
            Some(Tok::Ident(s)) => Ok(s),
            other => Err(QueryError::Parse(format!(
                "expected {what}, found {other:?}"
            ))),
        }
    }

    fn document(&mut self) -> Result<Vec<QueryField>, QueryError> {
        self.expect(&Tok::LBrace, "'{'")?;
        let mut fields = Vec::new();
        loop {
            match self.peek() {
                Some(Tok::RBrace) => {
                    self.next();
                    break;
                }
                Some(_) => fields.push(self.field()?),
                None => return Err(QueryError::Parse("unterminated query".into())),
            }
        }
        if self.pos != self.tokens.len() {
            return Err(QueryError::Parse("trailing input after '}'".into()));
        }
        if fields.is_empty() {
            return Err(QueryError::Parse("query selects nothing".into()));
        }
        Ok(fields)
    }

    fn field(&mut self) -> Result<QueryField, QueryError> {
        let first = self.ident("method or alias")?;
        let (alias, method_name) = if self.peek() == Some(&Tok::Colon) {
            self.next();
            let method = self.ident("method name")?;
            (first, method)
        } else {
            (first.clone(), first)
        };

        let method = if method_name == "script" {
            Method::Script
        } else {
            let caps = method_regex().captures(&method_name).ok_or_else(|| {
                QueryError::Parse(format!("malformed method name '{method_name}'"))
            })?;
            let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            Method::Entity {
                operation: Operation::from_prefix(prefix),
                entity: caps[2].to_string(),
            }
        };

        let params = if self.peek() == Some(&Tok::LParen) {
            self.params()?
        } else {
            Map::new()
        };
        let selection = if self.peek() == Some(&Tok::LBrace) {
            self.selection()?
        } else {
            Vec::new()
        };

        Ok(QueryField {
            alias,
            method,
            params,
            selection,
        })
    }

    fn params(&mut self) -> Result<Map<String, Value>, QueryError> {
        self.expect(&Tok::LParen, "'('")?;
        let mut params = Map::new();
        loop {
            match self.peek() {
                Some(Tok::RParen) => {
                    self.next();
                    break;
                }
                Some(_) => {
                    let key = self.ident("parameter name")?;
                    self.expect(&Tok::Colon, "':'")?;
                    let value = self.value()?;
                    params.insert(key, value);
                }
                None => return Err(QueryError::Parse("unterminated parameter list".into())),
            }
        }
        Ok(params)
    }

    fn selection(&mut self) -> Result<Vec<Selection>, QueryError> {
        self.expect(&Tok::LBrace, "'{'")?;
        let mut selection = Vec::new();
        loop {
            match self.peek() {
                Some(Tok::RBrace) => {
                    self.next();
                    break;
                }
                Some(Tok::Ident(_)) => {
                    let first = self.ident("field name")?;
                    let (alias, name) = if self.peek() == Some(&Tok::Colon) {
                        self.next();
                        (first, self.ident("field name")?)
                    } else {
                        (first.clone(), first)
                    };
                    let nested = if self.peek() == Some(&Tok::LBrace) {
                        self.selection()?
                    } else {
                        Vec::new()
                    };
                    selection.push(Selection {
                        alias,
                        name,
                        nested,
                    });
                }
                other => {
                    return Err(QueryError::Parse(format!(
                        "expected field name, found {other:?}"
                    )))
                }
            }
        }
        Ok(selection)
    }

    fn value(&mut self) -> Result<Value, QueryError> {
        match self.next() {
            Some(Tok::Literal(v)) => Ok(v),
            Some(Tok::Placeholder) => {
                let value = self
                    .positional
                    .get(self.positional_index)
                    .cloned()
                    .ok_or_else(|| {
                        QueryError::Parse("not enough positional arguments for '?'".into())
                    })?;
                self.positional_index += 1;
                Ok(value)
            }
            Some(Tok::Named(name)) => self
                .named
                .and_then(|map| map.get(&name))
                .cloned()
                .ok_or_else(|| QueryError::Parse(format!("no binding for '${name}'"))),
            Some(Tok::Ident(word)) => match word.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::Null),
                other => Ok(Value::String(other.to_string())),
            },
            Some(Tok::LBrace) => {
                let mut out = Map::new();
                loop {
                    match self.next() {
                        Some(Tok::RBrace) => break,
                        Some(Tok::Ident(key)) | Some(Tok::Literal(Value::String(key))) => {
                            self.expect(&Tok::Colon, "':'")?;
                            out.insert(key, self.value()?);
                        }
                        other => {
                            return Err(QueryError::Parse(format!(
                                "expected object key, found {other:?}"
                            )))
                        }
                    }
                }
                Ok(Value::Object(out))
            }
            Some(Tok::LBracket) => {
                let mut out = Vec::new();
                loop {
                    match self.peek() {
                        Some(Tok::RBracket) => {
                            self.next();
                            break;
                        }
                        Some(_) => out.push(self.value()?),
                        None => return Err(QueryError::Parse("unterminated array".into())),
                    }
                }
                Ok(Value::Array(out))
            }
            other => Err(QueryError::Parse(format!(
                "expected value, found {other:?}"
            ))),
        }
    }
}

/// Per-field resolver for computed (plugin) fields.
pub type FieldPlugin =
    Arc<dyn Fn(&dyn Model, &str, &Value, Option<&Context>) -> Result<Value, QueryError> + Send + Sync>;

/// Routes parsed queries to models with access control and field shaping.
pub struct Dispatcher {
    models: HashMap<String, Arc<dyn Model>>,
    plugins: HashMap<String, FieldPlugin>,
    scripts: RwLock<HashMap<String, Arc<Script>>>,
    user_entity: String,
    weak_self: OnceLock<Weak<Dispatcher>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            models: HashMap::new(),
            plugins: HashMap::new(),
            scripts: RwLock::new(HashMap::new()),
            user_entity: "User".to_string(),
            weak_self: OnceLock::new(),
        }
    }

    /// Entity whose bare read auto-binds the caller's id.
    pub fn with_user_entity(mut self, entity: impl Into<String>) -> Self {
        self.user_entity = entity.into();
        self
    }

    pub fn register_model(&mut self, model: Arc<dyn Model>) {
        self.models.insert(model.name().to_string(), model);
    }

    pub fn register_plugin(
        &mut self,
        entity: impl Into<String>,
        field: impl Into<String>,
        plugin: FieldPlugin,
    ) {
        self.plugins
            .insert(format!("{}.{}", entity.into(), field.into()), plugin);
    }

    pub fn model(&self, entity: &str) -> Option<&Arc<dyn Model>> {
        self.models.get(entity)
    }

    /// Finish construction. Scripts invoked through the `script(...)` query
    /// method need a handle back to the dispatcher, hence the `Arc`.
    pub fn into_shared(self) -> Arc<Self> {
        let shared = Arc::new(self);
        let _ = shared.weak_self.set(Arc::downgrade(&shared));
        shared
    }

    /// Register a named script invocable via `script(name: ...)`.
    pub fn register_script(&self, script: Arc<Script>) {
        self.scripts
            .write()
            .expect("script registry lock")
            .insert(script.name().to_string(), script);
    }

    pub fn script(&self, name: &str) -> Option<Arc<Script>> {
        self.scripts
            .read()
            .expect("script registry lock")
            .get(name)
            .cloned()
    }

    pub fn script_names(&self) -> Vec<String> {
        self.scripts
            .read()
            .expect("script registry lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Execute a query. Results are keyed by alias; failures are collected
    /// per alias into one error payload.
    pub fn execute(
        &self,
        query: &str,
        context: Option<&Context>,
        arguments: Option<&Value>,
    ) -> Result<Value, QueryErrors> {
        let fields =
            parse_query(query, arguments).map_err(|e| QueryErrors::single("", e))?;
        let mut out = Map::new();
        let mut errors = Vec::new();
        for field in fields {
            match self.execute_field(&field, context) {
                Ok(value) => {
                    out.insert(field.alias.clone(), value);
                }
                Err(error) => errors.push(AliasError::new(&field.alias, error)),
            }
        }
        if errors.is_empty() {
            Ok(Value::Object(out))
        } else {
            Err(QueryErrors { errors })
        }
    }

    fn execute_field(
        &self,
        field: &QueryField,
        context: Option<&Context>,
    ) -> Result<Value, QueryError> {
        let (operation, entity) = match &field.method {
            Method::Script => return self.run_script_method(field, context),
            Method::Entity { operation, entity } => (operation, entity),
        };
        let model = self
            .models
            .get(entity)
            .ok_or_else(|| QueryError::UnknownEntity(entity.clone()))?;

        let mut params = field.params.clone();
        if *operation == Operation::Read
            && params.is_empty()
            && entity == &self.user_entity
        {
            if let Some(id) = context.and_then(|ctx| ctx.user_id()) {
                params.insert("id".to_string(), id.clone());
            }
        }

        if let Some(ctx) = context {
            let gate_data = match operation {
                Operation::List | Operation::Create => Value::Object(params.clone()),
                _ => json!({"id": params.get("id").cloned().unwrap_or(Value::Null)}),
            };
            if !ctx.access(model.as_ref(), operation, &gate_data, None) {
                return Err(QueryError::PermissionDenied { field: None });
            }
        }

        if !model.supports(operation) {
            return Err(QueryError::UnsupportedOperation {
                entity: entity.clone(),
                operation: operation.to_string(),
            });
        }

        let field_names: Vec<String> = field.selection.iter().map(|s| s.name.clone()).collect();
        let result = model.execute(operation, &Value::Object(params), &field_names)?;
        let result = self.postprocess(model.as_ref(), result)?;
        match result {
            Value::Array(items) => {
                let mut shaped = Vec::with_capacity(items.len());
                for item in &items {
                    shaped.push(self.shape_item(model.as_ref(), item, &field.selection, context)?);
                }
                Ok(Value::Array(shaped))
            }
            item @ Value::Object(_) => self.shape_item(model.as_ref(), &item, &field.selection, context),
            scalar => Ok(scalar),
        }
    }

    /// Run a model's declared `postprocess` step list over the raw result.
    /// The result enters at `/result` and is read back from there.
    fn postprocess(&self, model: &dyn Model, result: Value) -> Result<Value, QueryError> {
        let Some(steps) = model.json_schema().get("postprocess") else {
            return Ok(result);
        };
        let definition = json!({
            "name": format!("{}-postprocess", model.name()),
            "steps": steps,
        });
        let script = Script::new(&definition).map_err(|e| QueryError::Script(e.to_string()))?;
        let env = ScriptEnv::admin(self.shared_storage()?);
        let state = script
            .run(json!({"result": result}), &env)
            .map_err(|e| QueryError::Script(e.to_string()))?;
        Ok(crate::pointer::get(&state, "/result"))
    }

    /// Apply field-level access, plugin resolution, reference expansion and
    /// the single missing-field re-read to one returned item.
    fn shape_item(
        &self,
        model: &dyn Model,
        item: &Value,
        selection: &[Selection],
        context: Option<&Context>,
    ) -> Result<Value, QueryError> {
        if selection.is_empty() {
            return Ok(item.clone());
        }
        let properties = model
            .json_schema()
            .get("properties")
            .and_then(Value::as_object);

        let mut out = Map::new();
        let mut missing: Vec<&Selection> = Vec::new();
        for sel in selection {
            let plugin_key = format!("{}.{}", model.name(), sel.name);
            if let Some(plugin) = self.plugins.get(&plugin_key) {
                let id = item.get("id").cloned().unwrap_or(Value::Null);
                out.insert(sel.alias.clone(), plugin(model, &sel.name, &id, context)?);
                continue;
            }

            if let Some(ctx) = context {
                if !ctx.access(model, &Operation::Read, item, Some(&sel.name)) {
                    return Err(QueryError::PermissionDenied {
                        field: Some(sel.name.clone()),
                    });
                }
            }

            let property = properties.and_then(|p| p.get(&sel.name));
            if property.is_none() && sel.name != "id" {
                return Err(QueryError::UnknownField {
                    entity: model.name().to_string(),
                    field: sel.name.clone(),
                });
            }

            if let Some(target) = property
                .and_then(|p| p.get("references"))
                .and_then(Value::as_str)
            {
                let value = item.get(&sel.name).cloned().unwrap_or(Value::Null);
                let expanded = if value.is_null() {
                    Value::Null
                } else {
                    self.expand_reference(target, value, &sel.nested, context)?
                };
                out.insert(sel.alias.clone(), expanded);
                continue;
            }

            match item.get(&sel.name) {
                Some(v) => {
                    out.insert(sel.alias.clone(), v.clone());
                }
                None => missing.push(sel),
            }
        }

        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|s| s.name.clone()).collect();
            let reread = match item.get("id") {
                Some(id) => model.execute(&Operation::Read, &json!({"id": id}), &names)?,
                None => Value::Null,
            };
            for sel in missing {
                out.insert(
                    sel.alias.clone(),
                    reread.get(&sel.name).cloned().unwrap_or(Value::Null),
                );
            }
        }
        Ok(Value::Object(out))
    }

    /// Follow a `references: Target` declaration: read the target by id and
    /// shape it through the nested selection.
    fn expand_reference(
        &self,
        target: &str,
        id: Value,
        nested: &[Selection],
        context: Option<&Context>,
    ) -> Result<Value, QueryError> {
        let model = self
            .models
            .get(target)
            .ok_or_else(|| QueryError::UnknownEntity(target.to_string()))?;
        if let Some(ctx) = context {
            if !ctx.access(model.as_ref(), &Operation::Read, &json!({"id": id}), None) {
                return Err(QueryError::PermissionDenied { field: None });
            }
        }
        let names: Vec<String> = nested.iter().map(|s| s.name.clone()).collect();
        let item = model.execute(&Operation::Read, &json!({"id": id}), &names)?;
        if item.is_null() {
            return Ok(json!({"id": id}));
        }
        self.shape_item(model.as_ref(), &item, nested, context)
    }

    /// The `script(name, data?, debug?)` method: invoke a registered script.
    /// Context-free callers only.
    fn run_script_method(
        &self,
        field: &QueryField,
        context: Option<&Context>,
    ) -> Result<Value, QueryError> {
        if context.is_some() {
            return Err(QueryError::PermissionDenied { field: None });
        }
        let name = field
            .params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| QueryError::Parse("script method needs a 'name' parameter".into()))?;
        let script = self
            .script(name)
            .ok_or_else(|| QueryError::Script(format!("unknown script '{name}'")))?;
        let data = field.params.get("data").cloned().unwrap_or(json!({}));
        let debug = field
            .params
            .get("debug")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let storage = self.shared_storage()?;
        let env = ScriptEnv::admin(storage);
        if debug {
            let (state, trace) = script
                .run_debug(data, &env)
                .map_err(|e| QueryError::Script(e.to_string()))?;
            Ok(json!({"result": state, "trace": trace}))
        } else {
            script
                .run(data, &env)
                .map_err(|e| QueryError::Script(e.to_string()))
        }
    }

    fn shared_storage(&self) -> Result<Arc<dyn Storage>, QueryError> {
        self.weak_self
            .get()
            .and_then(Weak::upgrade)
            .map(|arc| arc as Arc<dyn Storage>)
            .ok_or_else(|| {
                QueryError::Script("dispatcher is not shared; script execution unavailable".into())
            })
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for Dispatcher {
    fn query(
        &self,
        query: &str,
        context: Option<&Context>,
        arguments: Option<&Value>,
    ) -> Result<Value, QueryErrors> {
        self.execute(query, context, arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryModel;

    #[test]
    fn parse_alias_params_selection() {
        let fields = parse_query(
            r#"{ mine: listMessage(authorId: "7", limit: 10) { id text who: authorId } }"#,
            None,
        )
        .unwrap();
        assert_eq!(fields.len(), 1);
        let f = &fields[0];
        assert_eq!(f.alias, "mine");
        assert_eq!(
            f.method,
            Method::Entity {
                operation: Operation::List,
                entity: "Message".into()
            }
        );
        assert_eq!(f.params["authorId"], json!("7"));
        assert_eq!(f.params["limit"], json!(10));
        assert_eq!(f.selection.len(), 3);
        assert_eq!(f.selection[2].alias, "who");
        assert_eq!(f.selection[2].name, "authorId");
    }

    #[test]
    fn method_name_split() {
        let op = |q: &str| match &parse_query(q, None).unwrap()[0].method {
            Method::Entity { operation, entity } => (operation.clone(), entity.clone()),
            Method::Script => panic!("unexpected script method"),
        };
        assert_eq!(op("{User}"), (Operation::Read, "User".into()));
        assert_eq!(op("{createUser}"), (Operation::Create, "User".into()));
        assert_eq!(op("{deleteUser}"), (Operation::Remove, "User".into()));
        assert_eq!(op("{countUser}"), (Operation::Count, "User".into()));
        assert_eq!(
            op("{approveOrder}"),
            (Operation::Custom("approve".into()), "Order".into())
        );
        assert!(matches!(
            parse_query("{lowercase}", None).unwrap_err(),
            QueryError::Parse(_)
        ));
    }

    #[test]
    fn placeholders_bind_during_parse() {
        let fields = parse_query(
            "{readUser(id: ?) {id} other: readUser(id: ?)}",
            Some(&json!(["a", "b"])),
        )
        .unwrap();
        assert_eq!(fields[0].params["id"], json!("a"));
        assert_eq!(fields[1].params["id"], json!("b"));

        let err = parse_query("{readUser(id: ?)}", None).unwrap_err();
        assert!(matches!(err, QueryError::Parse(_)));
    }

    #[test]
    fn named_bindings_and_structured_values() {
        let fields = parse_query(
            "{createDoc(meta: $meta, tags: [\"a\", ?])}",
            Some(&json!({"meta": {"k": 1}})),
        );
        // '?' has no positional source when bindings are named
        assert!(fields.is_err());

        let fields = parse_query(
            "{createDoc(meta: $meta, flag: true, nothing: null)}",
            Some(&json!({"meta": {"k": [1, 2]}})),
        )
        .unwrap();
        assert_eq!(fields[0].params["meta"], json!({"k": [1, 2]}));
        assert_eq!(fields[0].params["flag"], json!(true));
        assert_eq!(fields[0].params["nothing"], Value::Null);
    }

    #[test]
    fn bound_question_mark_is_not_rebound() {
        let fields = parse_query(
            "{listDoc(title: ?)}",
            Some(&json!(["what? ever?"])),
        )
        .unwrap();
        assert_eq!(fields[0].params["title"], json!("what? ever?"));
    }

    fn message_models() -> Arc<Dispatcher> {
        let user = MemoryModel::with_rows(
            "User",
            json!({
                "properties": {
                    "id": {"type": "string"},
                    "name": {"type": "string"},
                    "secret": {"type": "string", "access": {"read": "u.id == i.id"}}
                }
            }),
            vec![
                json!({"id": "u1", "name": "Alice", "secret": "a"}),
                json!({"id": "u2", "name": "Bob", "secret": "b"}),
            ],
        );
        let message = MemoryModel::with_rows(
            "Message",
            json!({
                "access": {"remove": "u.id == i.id"},
                "properties": {
                    "id": {"type": "string"},
                    "text": {"type": "string"},
                    "authorId": {"type": "string", "references": "User"},
                    "draft": {"type": "boolean"}
                }
            }),
            vec![json!({"id": "m1", "text": "hi", "authorId": "u1"})],
        );
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_model(Arc::new(user));
        dispatcher.register_model(Arc::new(message));
        dispatcher.into_shared()
    }

    #[test]
    fn admin_create_returns_id() {
        let dispatcher = message_models();
        let out = dispatcher
            .execute(
                r#"{createUser(name: "Carol") {id name}}"#,
                None,
                None,
            )
            .unwrap();
        assert!(out["createUser"]["id"].as_str().is_some());
        assert_eq!(out["createUser"]["name"], json!("Carol"));
    }

    #[test]
    fn unknown_entity_and_field() {
        let dispatcher = message_models();
        let err = dispatcher.execute("{listGhost}", None, None).unwrap_err();
        assert!(err.errors[0].message.contains("unknown entity"));

        let err = dispatcher
            .execute("{readUser(id: \"u1\") {id bogus}}", None, None)
            .unwrap_err();
        assert_eq!(err.errors[0].field.as_deref(), Some("bogus"));
        assert!(!err.denied());
    }

    #[test]
    fn field_access_denied_for_other_user() {
        let dispatcher = message_models();
        let me = Context::new(json!({"id": "u1"}));
        let out = dispatcher
            .execute("{readUser(id: \"u1\") {id secret}}", Some(&me), None)
            .unwrap();
        assert_eq!(out["readUser"]["secret"], json!("a"));

        let err = dispatcher
            .execute("{readUser(id: \"u2\") {id secret}}", Some(&me), None)
            .unwrap_err();
        assert!(err.denied());
        assert_eq!(err.errors[0].field.as_deref(), Some("secret"));
    }

    #[test]
    fn entity_access_gate() {
        let dispatcher = message_models();
        let stranger = Context::new(json!({"id": "u2"}));
        let err = dispatcher
            .execute("{deleteMessage(id: \"m1\")}", Some(&stranger), None)
            .unwrap_err();
        assert!(err.denied());

        // admin (no context) bypasses the same gate
        dispatcher
            .execute("{deleteMessage(id: \"m1\")}", None, None)
            .unwrap();
    }

    #[test]
    fn reference_expansion() {
        let dispatcher = message_models();
        let out = dispatcher
            .execute("{readMessage(id: \"m1\") {id authorId {id name}}}", None, None)
            .unwrap();
        assert_eq!(
            out["readMessage"]["authorId"],
            json!({"id": "u1", "name": "Alice"})
        );
    }

    #[test]
    fn bare_user_auto_binds_caller() {
        let dispatcher = message_models();
        let me = Context::new(json!({"id": "u2"}));
        let out = dispatcher.execute("{User {id name}}", Some(&me), None).unwrap();
        assert_eq!(out["User"], json!({"id": "u2", "name": "Bob"}));
    }

    #[test]
    fn plugin_field_resolution() {
        let user = MemoryModel::with_rows(
            "User",
            json!({"properties": {"id": {}, "name": {}}}),
            vec![json!({"id": "u1", "name": "Alice"})],
        );
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_model(Arc::new(user));
        dispatcher.register_plugin(
            "User",
            "avatarUrl",
            Arc::new(|_model, _field, id, _ctx| {
                Ok(json!(format!("https://img.example/{}", id.as_str().unwrap_or(""))))
            }),
        );
        let dispatcher = dispatcher.into_shared();
        let out = dispatcher
            .execute("{readUser(id: \"u1\") {id avatarUrl}}", None, None)
            .unwrap();
        assert_eq!(out["readUser"]["avatarUrl"], json!("https://img.example/u1"));
    }

    #[test]
    fn declared_but_unset_field_is_null_after_reread() {
        let dispatcher = message_models();
        let out = dispatcher
            .execute("{readMessage(id: \"m1\") {id draft}}", None, None)
            .unwrap();
        assert_eq!(out["readMessage"]["draft"], Value::Null);
    }

    #[test]
    fn count_returns_scalar() {
        let dispatcher = message_models();
        let out = dispatcher.execute("{countUser}", None, None).unwrap();
        assert_eq!(out["countUser"], json!(2));
    }

    #[test]
    fn script_method_context_free_only() {
        let dispatcher = message_models();
        dispatcher.register_script(Arc::new(
            Script::new(&json!({
                "name": "touch",
                "steps": [{"object": {"ok": {"static": true}}}]
            }))
            .unwrap(),
        ));
        let out = dispatcher
            .execute("{script(name: \"touch\")}", None, None)
            .unwrap();
        assert_eq!(out["script"], json!({"ok": true}));

        let ctx = Context::new(json!({"id": "u1"}));
        let err = dispatcher
            .execute("{script(name: \"touch\")}", Some(&ctx), None)
            .unwrap_err();
        assert!(err.denied());
    }

    #[test]
    fn postprocess_script_shapes_model_results() {
        let products = MemoryModel::with_rows(
            "Product",
            json!({
                "properties": {
                    "id": {"type": "string"},
                    "name": {"type": "string"},
                    "label": {"type": "string"}
                },
                "postprocess": [{
                    "object": {
                        "result": ["/result", {"map": {"object": {
                            "...": "",
                            "label": ["/id", {"upperCase": {}}]
                        }}}]
                    }
                }]
            }),
            vec![json!({"id": "p1", "name": "widget"})],
        );
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_model(Arc::new(products));
        let dispatcher = dispatcher.into_shared();
        let out = dispatcher
            .execute("{listProduct {id label}}", None, None)
            .unwrap();
        assert_eq!(
            out["listProduct"],
            json!([{"id": "p1", "label": "P1"}])
        );
    }

    #[test]
    fn errors_collected_per_alias() {
        let dispatcher = message_models();
        let err = dispatcher
            .execute("{a: listUser {id} b: listGhost}", None, None)
            .unwrap_err();
        assert_eq!(err.errors.len(), 1);
        assert_eq!(err.errors[0].alias, "b");
        let payload = err.payload();
        assert_eq!(payload[0]["alias"], json!("b"));
    }
}
