//! # trellis-core
//!
//! Core engine of **Trellis**: a declarative backend platform built around a
//! pair of coupled interpreters over JSON values. Pure transformation chains
//! do the data shaping; scripts compose chains with queries, HTTP requests
//! and control flow.
//!
//! ## Module Roles
//!
//! | Module | Responsibility | Public Entry Points |
//! |---|---|---|
//! | `pointer` | JSON-pointer get/set over value trees | [`pointer::get`], [`pointer::set`] |
//! | `transform` | Pure operator chains + dialect registries | [`Transformation`], [`Operators`], [`transform`] |
//! | `script` | Labeled-step runtime: query/request/transform/increment/jump | [`Script`], [`ScriptEnv`] |
//! | `schedule` | Cron + startup activation, skip-if-running | [`Scheduler`] |
//! | `query` | GraphQL-like parser and model dispatcher | [`Dispatcher`], [`parse_query`] |
//! | `context` | Caller identity + `u`/`i` access predicates | [`Context`] |
//! | `storage` | Model/storage traits + in-memory model | [`Model`], [`Storage`], [`MemoryModel`] |
//! | `auth` | Admin table, bearer tokens, password grant | [`Authenticator`] |
//! | `password` | PBKDF2 encode/verify | [`password::hash`], [`password::is_valid`] |
//!
//! ## Execution Contract
//!
//! 1. Validate once ([`Transformation::new`], [`Script::new`]).
//! 2. Execute many times; a script instance admits one activation at a time.
//! 3. `Null` short-circuits transformation chains — it is a signal, not an
//!    error.
//!
//! ## Hello World
//!
//! ```no_run
//! use serde_json::json;
//!
//! let out = trellis_core::transform(
//!     &json!({"object": {"baz": "/foo"}}),
//!     &json!({"foo": "bar"}),
//! )
//! .expect("transform");
//! assert_eq!(out, json!({"baz": "bar"}));
//! ```

use serde_json::Value;

pub mod auth;
pub mod context;
mod ops;
pub mod password;
pub mod pointer;
pub mod query;
pub mod schedule;
pub mod script;
pub mod storage;
pub mod transform;

pub use auth::{AuthConfig, AuthError, AuthOutcome, Authenticator, TokenResponse};
pub use context::Context;
pub use query::{
    parse_query, Dispatcher, FieldPlugin, Method, QueryError, QueryErrors, QueryField, Selection,
};
pub use schedule::Scheduler;
pub use script::{Script, ScriptEnv, ScriptError};
pub use storage::{MemoryModel, Model, Operation, Storage};
pub use transform::{Dialect, OpCtx, OperatorFn, Operators, TransformError, Transformation};

/// Run a one-off transformation in the current (pointer) dialect.
pub fn transform(template: &Value, value: &Value) -> Result<Value, TransformError> {
    Transformation::new(template)?.transform(value)
}

/// Run a one-off transformation in the legacy JSONPath dialect.
pub fn transform_legacy(template: &Value, value: &Value) -> Result<Value, TransformError> {
    Transformation::with_dialect(template, Dialect::JsonPath)?.transform(value)
}
