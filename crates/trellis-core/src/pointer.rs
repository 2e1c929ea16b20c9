//! RFC-6901-style JSON pointer access over `serde_json::Value`.
//!
//! Scripts and transformations address their state tree exclusively through
//! these two functions. Both are total: a lookup that falls off the document
//! yields `Null`, never an error.

use serde_json::{Map, Value};

/// Read the value a pointer addresses, or `Null`.
///
/// The empty pointer denotes the whole document. A missing segment, an
/// out-of-range array index, or descending into a non-container all yield
/// `Null`.
pub fn get(doc: &Value, pointer: &str) -> Value {
    if pointer.is_empty() {
        return doc.clone();
    }
    let mut current = doc;
    for segment in segments(pointer) {
        current = match current {
            Value::Object(map) => match map.get(&segment) {
                Some(v) => v,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

/// Write `value` at the pointed position, creating intermediate objects as
/// needed. The empty pointer replaces the whole document.
///
/// Intermediate segments that point at non-objects are overwritten with fresh
/// objects; numeric segments become object keys on write (only `get` honors
/// array indices).
pub fn set(doc: &mut Value, pointer: &str, value: Value) {
    if pointer.is_empty() {
        *doc = value;
        return;
    }
    let parts: Vec<String> = segments(pointer).collect();
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    let mut current = doc;
    for part in &parts[..parts.len() - 1] {
        let map = current.as_object_mut().expect("object ensured above");
        let entry = map
            .entry(part.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry;
    }
    let map = current.as_object_mut().expect("object ensured above");
    map.insert(parts[parts.len() - 1].clone(), value);
}

/// Pointer segments with `~1` and `~0` unescaped, leading `/` skipped.
fn segments(pointer: &str) -> impl Iterator<Item = String> + '_ {
    pointer
        .strip_prefix('/')
        .unwrap_or(pointer)
        .split('/')
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_descends_objects_and_arrays() {
        let doc = json!({"a": {"b": [10, {"c": "x"}]}});
        assert_eq!(get(&doc, "/a/b/0"), json!(10));
        assert_eq!(get(&doc, "/a/b/1/c"), json!("x"));
    }

    #[test]
    fn get_missing_is_null() {
        let doc = json!({"a": 1});
        assert_eq!(get(&doc, "/b"), Value::Null);
        assert_eq!(get(&doc, "/a/b/c"), Value::Null);
        assert_eq!(get(&doc, "/a/0"), Value::Null);
    }

    #[test]
    fn get_through_null_is_null() {
        let doc = json!({"a": null});
        assert_eq!(get(&doc, "/a/b"), Value::Null);
    }

    #[test]
    fn empty_pointer_is_root() {
        let doc = json!({"a": 1});
        assert_eq!(get(&doc, ""), doc);

        let mut doc = json!({"a": 1});
        set(&mut doc, "", json!([1, 2]));
        assert_eq!(doc, json!([1, 2]));
    }

    #[test]
    fn set_creates_intermediates() {
        let mut doc = json!({});
        set(&mut doc, "/a/b/c", json!(1));
        assert_eq!(doc, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn set_overwrites_scalar_intermediates() {
        let mut doc = json!({"a": 5});
        set(&mut doc, "/a/b", json!(true));
        assert_eq!(doc, json!({"a": {"b": true}}));
    }

    #[test]
    fn escaped_segments() {
        let doc = json!({"a/b": {"~x": 1}});
        assert_eq!(get(&doc, "/a~1b/~0x"), json!(1));
    }
}
