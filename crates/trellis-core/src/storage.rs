//! Storage seam: the traits the engine consumes, and an in-memory reference
//! model used by tests and the demo configuration.
//!
//! A [`Model`] answers one entity's operations; a [`Storage`] answers whole
//! query strings (the dispatcher is the canonical implementation). Both must
//! tolerate concurrent callers.

use crate::context::Context;
use crate::password;
use crate::query::{QueryError, QueryErrors};
use serde_json::{json, Map, Value};
use std::sync::RwLock;

/// The operations a query method name can resolve to. `Custom` covers model
/// extensions beyond the built-in set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Read,
    Create,
    Update,
    Remove,
    Count,
    Custom(String),
}

impl Operation {
    /// Resolve a method-name prefix. An empty prefix reads; `delete` is an
    /// alias for `remove`.
    pub fn from_prefix(prefix: &str) -> Self {
        match prefix {
            "" | "read" => Operation::Read,
            "list" => Operation::List,
            "create" => Operation::Create,
            "update" => Operation::Update,
            "delete" | "remove" => Operation::Remove,
            "count" => Operation::Count,
            other => Operation::Custom(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Operation::List => "list",
            Operation::Read => "read",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Remove => "remove",
            Operation::Count => "count",
            Operation::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One entity's storage operations.
///
/// Access rules live in the model's JSON schema: `access.<operation>` at the
/// entity level and `properties.<field>.access.<operation>` per field, each a
/// predicate over `u` and `i`. A missing rule allows the operation.
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    /// JSON schema of the entity. `properties.<field>.references` names the
    /// target entity for reference expansion.
    fn json_schema(&self) -> &Value;

    fn supports(&self, operation: &Operation) -> bool;

    fn execute(
        &self,
        operation: &Operation,
        params: &Value,
        fields: &[String],
    ) -> Result<Value, QueryError>;

    fn access_rule(&self, operation: &Operation, field: Option<&str>) -> Option<&str> {
        let schema = self.json_schema();
        match field {
            None => schema.get("access")?.get(operation.name())?.as_str(),
            Some(field) => schema
                .get("properties")?
                .get(field)?
                .get("access")?
                .get(operation.name())?
                .as_str(),
        }
    }
}

/// Whole-query surface consumed by scripts and the authentication facade.
pub trait Storage: Send + Sync {
    /// `arguments` binds `?` placeholders (array) or `$name` bindings
    /// (mapping) in the query string.
    fn query(
        &self,
        query: &str,
        context: Option<&Context>,
        arguments: Option<&Value>,
    ) -> Result<Value, QueryErrors>;
}

/// In-memory model: rows in a vector behind a lock.
///
/// Properties with `"format": "password"` are hashed on write, so plaintext
/// never reaches a row.
pub struct MemoryModel {
    name: String,
    schema: Value,
    rows: RwLock<Vec<Map<String, Value>>>,
}

impl MemoryModel {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
            rows: RwLock::new(Vec::new()),
        }
    }

    pub fn with_rows(name: impl Into<String>, schema: Value, rows: Vec<Value>) -> Self {
        let rows = rows
            .into_iter()
            .filter_map(|r| r.as_object().cloned())
            .collect();
        Self {
            name: name.into(),
            schema,
            rows: RwLock::new(rows),
        }
    }

    fn password_fields(&self) -> Vec<String> {
        self.schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .filter(|(_, spec)| {
                        spec.get("format").and_then(Value::as_str) == Some("password")
                    })
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn apply_password_hashing(&self, row: &mut Map<String, Value>) {
        for field in self.password_fields() {
            if let Some(Value::String(plain)) = row.get(&field) {
                if !plain.starts_with("pbkdf2$") {
                    let hashed = password::hash(plain);
                    row.insert(field, Value::String(hashed));
                }
            }
        }
    }

    fn matches(row: &Map<String, Value>, filter: &Map<String, Value>) -> bool {
        filter.iter().all(|(key, value)| row.get(key) == Some(value))
    }

    fn project(row: &Map<String, Value>, fields: &[String]) -> Value {
        if fields.is_empty() {
            return Value::Object(row.clone());
        }
        let mut out = Map::new();
        if let Some(id) = row.get("id") {
            out.insert("id".into(), id.clone());
        }
        for field in fields {
            if let Some(v) = row.get(field) {
                out.insert(field.clone(), v.clone());
            }
        }
        Value::Object(out)
    }
}

impl Model for MemoryModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn json_schema(&self) -> &Value {
        &self.schema
    }

    fn supports(&self, operation: &Operation) -> bool {
        !matches!(operation, Operation::Custom(_))
    }

    fn execute(
        &self,
        operation: &Operation,
        params: &Value,
        fields: &[String],
    ) -> Result<Value, QueryError> {
        let params = params.as_object().cloned().unwrap_or_default();
        match operation {
            Operation::List => {
                let rows = self.rows.read().expect("model lock");
                Ok(Value::Array(
                    rows.iter()
                        .filter(|row| Self::matches(row, &params))
                        .map(|row| Self::project(row, fields))
                        .collect(),
                ))
            }
            Operation::Count => {
                let rows = self.rows.read().expect("model lock");
                Ok(Value::from(
                    rows.iter().filter(|row| Self::matches(row, &params)).count(),
                ))
            }
            Operation::Read => {
                let id = params.get("id").cloned().unwrap_or(Value::Null);
                let rows = self.rows.read().expect("model lock");
                Ok(rows
                    .iter()
                    .find(|row| row.get("id") == Some(&id))
                    .map(|row| Self::project(row, fields))
                    .unwrap_or(Value::Null))
            }
            Operation::Create => {
                let mut row = params;
                row.entry("id".to_string())
                    .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
                self.apply_password_hashing(&mut row);
                let mut rows = self.rows.write().expect("model lock");
                rows.push(row.clone());
                Ok(Value::Object(row))
            }
            Operation::Update => {
                let id = params.get("id").cloned().unwrap_or(Value::Null);
                let mut rows = self.rows.write().expect("model lock");
                let Some(row) = rows.iter_mut().find(|row| row.get("id") == Some(&id)) else {
                    return Ok(Value::Null);
                };
                for (key, value) in params {
                    if key != "id" {
                        row.insert(key, value);
                    }
                }
                self.apply_password_hashing(row);
                Ok(Value::Object(row.clone()))
            }
            Operation::Remove => {
                let id = params.get("id").cloned().unwrap_or(Value::Null);
                let mut rows = self.rows.write().expect("model lock");
                let before = rows.len();
                rows.retain(|row| row.get("id") != Some(&id));
                Ok(json!({"id": id, "removed": before != rows.len()}))
            }
            Operation::Custom(name) => Err(QueryError::UnsupportedOperation {
                entity: self.name.clone(),
                operation: name.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_model() -> MemoryModel {
        MemoryModel::new(
            "User",
            json!({
                "properties": {
                    "id": {"type": "string"},
                    "name": {"type": "string"},
                    "mail": {"type": "string"},
                    "password": {"type": "string", "format": "password"}
                }
            }),
        )
    }

    #[test]
    fn create_assigns_id_and_hashes_password() {
        let model = user_model();
        let created = model
            .execute(
                &Operation::Create,
                &json!({"name": "Alice", "password": "Welcome!"}),
                &[],
            )
            .unwrap();
        assert!(created["id"].as_str().is_some());
        let stored = created["password"].as_str().unwrap();
        assert!(stored.starts_with("pbkdf2$"));
        assert!(crate::password::is_valid(stored, "Welcome!"));
    }

    #[test]
    fn list_filters_and_projects() {
        let model = user_model();
        model
            .execute(&Operation::Create, &json!({"id": "1", "name": "A", "mail": "a@x"}), &[])
            .unwrap();
        model
            .execute(&Operation::Create, &json!({"id": "2", "name": "B", "mail": "b@x"}), &[])
            .unwrap();
        let out = model
            .execute(&Operation::List, &json!({"name": "B"}), &["mail".to_string()])
            .unwrap();
        assert_eq!(out, json!([{"id": "2", "mail": "b@x"}]));
    }

    #[test]
    fn read_update_remove_cycle() {
        let model = user_model();
        model
            .execute(&Operation::Create, &json!({"id": "1", "name": "A"}), &[])
            .unwrap();
        let updated = model
            .execute(&Operation::Update, &json!({"id": "1", "name": "A2"}), &[])
            .unwrap();
        assert_eq!(updated["name"], json!("A2"));
        let read = model.execute(&Operation::Read, &json!({"id": "1"}), &[]).unwrap();
        assert_eq!(read["name"], json!("A2"));
        let removed = model
            .execute(&Operation::Remove, &json!({"id": "1"}), &[])
            .unwrap();
        assert_eq!(removed["removed"], json!(true));
        let gone = model.execute(&Operation::Read, &json!({"id": "1"}), &[]).unwrap();
        assert_eq!(gone, Value::Null);
        let count = model.execute(&Operation::Count, &json!({}), &[]).unwrap();
        assert_eq!(count, json!(0));
    }

    #[test]
    fn access_rules_come_from_schema() {
        let model = MemoryModel::new(
            "Doc",
            json!({
                "access": {"read": "u.id == i.ownerId"},
                "properties": {
                    "secret": {"access": {"read": "false"}}
                }
            }),
        );
        assert_eq!(
            model.access_rule(&Operation::Read, None),
            Some("u.id == i.ownerId")
        );
        assert_eq!(model.access_rule(&Operation::Read, Some("secret")), Some("false"));
        assert_eq!(model.access_rule(&Operation::List, None), None);
    }
}
