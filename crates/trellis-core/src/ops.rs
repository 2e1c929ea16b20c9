//! Scalar, string, codec, date and HTML operators.
//!
//! Structural operators (object/map/filter/...) live in `transform`; this
//! module holds everything that works on one value at a time. String-case
//! operators yield `Null` on non-string input instead of failing; type-strict
//! operators (`substring`, `length`, `join`, ...) return
//! [`TransformError::InvalidArgument`].

use crate::pointer;
use crate::transform::{OpCtx, OperatorFn, Operators, TransformError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Locale, NaiveDate, NaiveDateTime, TimeZone, Utc};
use heck::{ToKebabCase, ToLowerCamelCase, ToSnakeCase, ToTitleCase};
use regex::RegexBuilder;
use serde_json::{Map, Value};
use serde_json_path::JsonPath;

pub(crate) fn install(ops: &mut Operators) {
    ops.register("substring", op_substring as OperatorFn);
    ops.register("length", op_length as OperatorFn);
    ops.register("count", op_count as OperatorFn);
    ops.register("hash", op_hash as OperatorFn);
    ops.register("join", op_join as OperatorFn);
    ops.register("split", op_split as OperatorFn);
    ops.register("replace", op_replace as OperatorFn);
    ops.register("match", op_match as OperatorFn);
    ops.register("render", op_render as OperatorFn);
    ops.register("parseDate", op_parse_date as OperatorFn);
    ops.register("formatDate", op_format_date as OperatorFn);
    ops.register("now", op_now as OperatorFn);
    ops.register("fromJson", op_from_json as OperatorFn);
    ops.register("toJson", op_to_json as OperatorFn);
    ops.register("fromXml", op_from_xml as OperatorFn);
    ops.register("toXml", op_to_xml as OperatorFn);
    ops.register("fromBase64", op_from_base64 as OperatorFn);
    ops.register("toBase64", op_to_base64 as OperatorFn);
    ops.register("toFormData", op_to_form_data as OperatorFn);
    ops.register("fromFormData", op_from_form_data as OperatorFn);
    ops.register("lowerCase", op_lower_case as OperatorFn);
    ops.register("upperCase", op_upper_case as OperatorFn);
    ops.register("camelCase", op_camel_case as OperatorFn);
    ops.register("kebabCase", op_kebab_case as OperatorFn);
    ops.register("snakeCase", op_snake_case as OperatorFn);
    ops.register("nameCase", op_name_case as OperatorFn);
    ops.register("capitalize", op_capitalize as OperatorFn);
    ops.register("deburr", op_deburr as OperatorFn);
    ops.register("htmlTag", op_html_tag as OperatorFn);
    ops.register("htmlTags", op_html_tags as OperatorFn);
    ops.register("htmlTagText", op_html_tag_text as OperatorFn);
    ops.register("htmlTagsText", op_html_tags_text as OperatorFn);
    ops.register("htmlAttribute", op_html_attribute as OperatorFn);
    ops.register("htmlTable", op_html_table as OperatorFn);
}

// ---- JSONPath helpers (legacy dialect) ----

/// First match of a JSONPath expression, with a fast path for `$.prop`.
pub(crate) fn jsonpath_single(path: &str, input: &Value) -> Result<Value, TransformError> {
    if let Some(prop) = plain_property(path) {
        return Ok(input.get(prop).cloned().unwrap_or(Value::Null));
    }
    let compiled = JsonPath::parse(path)
        .map_err(|e| TransformError::invalid("single", format!("bad path '{path}': {e}")))?;
    Ok(compiled.query(input).first().cloned().unwrap_or(Value::Null))
}

/// All matches of a JSONPath expression.
pub(crate) fn jsonpath_all(path: &str, input: &Value) -> Result<Value, TransformError> {
    if let Some(prop) = plain_property(path) {
        return Ok(match input.get(prop) {
            Some(v) => Value::Array(vec![v.clone()]),
            None => Value::Array(Vec::new()),
        });
    }
    let compiled = JsonPath::parse(path)
        .map_err(|e| TransformError::invalid("multiple", format!("bad path '{path}': {e}")))?;
    Ok(Value::Array(
        compiled.query(input).all().into_iter().cloned().collect(),
    ))
}

fn plain_property(path: &str) -> Option<&str> {
    let prop = path.strip_prefix("$.")?;
    if !prop.is_empty() && prop.chars().all(|c| c.is_alphanumeric() || c == '_') {
        Some(prop)
    } else {
        None
    }
}

// ---- strings ----

fn op_substring(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let s = input
        .as_str()
        .ok_or_else(|| TransformError::invalid("substring", "input must be a string"))?;
    let start = arg.get("start").and_then(Value::as_u64).unwrap_or(0) as usize;
    let length = arg.get("length").and_then(Value::as_u64).map(|n| n as usize);
    let chars: Vec<char> = s.chars().collect();
    if start >= chars.len() {
        return Ok(Value::String(String::new()));
    }
    let end = match length {
        Some(len) => (start + len).min(chars.len()),
        None => chars.len(),
    };
    Ok(Value::String(chars[start..end].iter().collect()))
}

fn op_length(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    match input {
        Value::String(s) => Ok(Value::from(s.chars().count())),
        Value::Array(items) => Ok(Value::from(items.len())),
        _ => Err(TransformError::invalid(
            "length",
            "input must be a string or array",
        )),
    }
}

fn op_count(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    match input {
        Value::String(s) => Ok(Value::from(s.chars().count())),
        Value::Array(items) => Ok(Value::from(items.len())),
        _ => Ok(Value::from(0)),
    }
}

fn op_join(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let items = input
        .as_array()
        .ok_or_else(|| TransformError::invalid("join", "input must be an array"))?;
    let separator = arg.get("separator").and_then(Value::as_str).unwrap_or("");
    let parts: Vec<String> = items.iter().map(display_string).collect();
    Ok(Value::String(parts.join(separator)))
}

fn op_split(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let separator = arg
        .get("separator")
        .and_then(Value::as_str)
        .ok_or_else(|| TransformError::invalid("split", "missing 'separator'"))?;
    let source = match arg.get("input").and_then(Value::as_str) {
        Some(ptr) => pointer::get(input, ptr),
        None => input.clone(),
    };
    let s = match source.as_str() {
        Some(s) => s,
        None => return Ok(Value::Null),
    };
    let max_items = arg.get("maxItems").and_then(Value::as_u64).map(|n| n as usize);
    let add_remainder = arg
        .get("addRemainder")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let parts: Vec<&str> = match max_items {
        Some(0) => Vec::new(),
        Some(max) if add_remainder => s.splitn(max, separator).collect(),
        Some(max) => s.split(separator).take(max).collect(),
        None => s.split(separator).collect(),
    };
    Ok(Value::Array(
        parts.into_iter().map(|p| Value::String(p.to_string())).collect(),
    ))
}

/// `search` starting with `/…/flags` is a regex (`i`, `g` understood);
/// otherwise a plain first-occurrence replacement.
fn op_replace(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let s = match input.as_str() {
        Some(s) => s,
        None => return Ok(Value::Null),
    };
    let search = arg
        .get("search")
        .and_then(Value::as_str)
        .ok_or_else(|| TransformError::invalid("replace", "missing 'search'"))?;
    let replacement = arg.get("replace").and_then(Value::as_str).unwrap_or("");
    if let Some((pattern, flags)) = regex_literal(search) {
        let re = RegexBuilder::new(pattern)
            .case_insensitive(flags.contains('i'))
            .build()
            .map_err(|e| TransformError::invalid("replace", format!("bad regex: {e}")))?;
        let out = if flags.contains('g') {
            re.replace_all(s, replacement)
        } else {
            re.replace(s, replacement)
        };
        return Ok(Value::String(out.into_owned()));
    }
    Ok(Value::String(s.replacen(search, replacement, 1)))
}

fn op_match(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let (pattern_arg, source) = match arg {
        Value::Object(spec) => {
            let pattern = spec
                .get("pattern")
                .and_then(Value::as_str)
                .ok_or_else(|| TransformError::invalid("match", "missing 'pattern'"))?;
            let source = match spec.get("input").and_then(Value::as_str) {
                Some(ptr) => pointer::get(input, ptr),
                None => input.clone(),
            };
            (pattern.to_string(), source)
        }
        Value::String(pattern) => (pattern.clone(), input.clone()),
        _ => return Err(TransformError::invalid("match", "pattern must be a string")),
    };
    let s = match source.as_str() {
        Some(s) => s.to_string(),
        None => return Ok(Value::Bool(false)),
    };
    let (pattern, flags) = regex_literal(&pattern_arg).unwrap_or((pattern_arg.as_str(), ""));
    let re = RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .build()
        .map_err(|e| TransformError::invalid("match", format!("bad regex: {e}")))?;
    match re.captures(&s) {
        Some(caps) => Ok(Value::Array(
            caps.iter()
                .map(|group| match group {
                    Some(m) => Value::String(m.as_str().to_string()),
                    None => Value::Null,
                })
                .collect(),
        )),
        None => Ok(Value::Bool(false)),
    }
}

/// Split a `/pattern/flags` literal into its parts.
fn regex_literal(s: &str) -> Option<(&str, &str)> {
    let body = s.strip_prefix('/')?;
    let end = body.rfind('/')?;
    Some((&body[..end], &body[end + 1..]))
}

fn op_render(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let template = arg
        .as_str()
        .ok_or_else(|| TransformError::invalid("render", "template must be a string"))?;
    let registry = handlebars::Handlebars::new();
    let rendered = registry
        .render_template(template, input)
        .map_err(|e| TransformError::invalid("render", e.to_string()))?;
    Ok(Value::String(rendered))
}

// ---- dates ----

fn op_parse_date(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let s = match input.as_str() {
        Some(s) => s,
        None => return Ok(Value::Null),
    };
    let format = arg
        .get("format")
        .and_then(Value::as_str)
        .ok_or_else(|| TransformError::invalid("parseDate", "missing 'format'"))?;
    let parsed = NaiveDateTime::parse_from_str(s, format).or_else(|_| {
        NaiveDate::parse_from_str(s, format)
            .map(|d| d.and_hms_opt(0, 0, 0).expect("midnight is always valid"))
    });
    match parsed {
        Ok(naive) => Ok(Value::String(
            Utc.from_utc_datetime(&naive).to_rfc3339(),
        )),
        Err(_) => Ok(Value::Null),
    }
}

fn op_format_date(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let s = match input.as_str() {
        Some(s) => s,
        None => return Ok(Value::Null),
    };
    let format = arg
        .get("format")
        .and_then(Value::as_str)
        .ok_or_else(|| TransformError::invalid("formatDate", "missing 'format'"))?;
    let locale = arg
        .get("locale")
        .and_then(Value::as_str)
        .and_then(|name| Locale::try_from(name).ok())
        .unwrap_or(Locale::en_US);
    let parsed = DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map(|d| {
                Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).expect("midnight is always valid"))
            })
        });
    let dt = match parsed {
        Ok(dt) => dt,
        Err(_) => return Ok(Value::Null),
    };
    let items: Vec<Item> = StrftimeItems::new_with_locale(format, locale).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(TransformError::invalid("formatDate", "invalid format string"));
    }
    Ok(Value::String(dt.format_localized(format, locale).to_string()))
}

fn op_now(_arg: &Value, _input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    Ok(Value::from(Utc::now().timestamp()))
}

// ---- codecs ----

fn op_hash(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let algorithm = arg
        .get("algorithm")
        .and_then(Value::as_str)
        .unwrap_or("md5");
    let encoding = arg.get("encoding").and_then(Value::as_str).unwrap_or("hex");
    let data = match input {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let digest = digest_bytes(algorithm, data.as_bytes())
        .ok_or_else(|| TransformError::invalid("hash", format!("unknown algorithm '{algorithm}'")))?;
    match encoding {
        "hex" => Ok(Value::String(hex::encode(digest))),
        "base64" => Ok(Value::String(BASE64.encode(digest))),
        other => Err(TransformError::invalid(
            "hash",
            format!("unknown encoding '{other}'"),
        )),
    }
}

fn digest_bytes(algorithm: &str, data: &[u8]) -> Option<Vec<u8>> {
    use sha2::Digest;
    match algorithm {
        "md5" => Some(md5::Md5::digest(data).to_vec()),
        "sha1" => Some(sha1::Sha1::digest(data).to_vec()),
        "sha256" => Some(sha2::Sha256::digest(data).to_vec()),
        "sha512" => Some(sha2::Sha512::digest(data).to_vec()),
        _ => None,
    }
}

fn op_from_json(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let s = input
        .as_str()
        .ok_or_else(|| TransformError::invalid("fromJson", "input must be a string"))?;
    serde_json::from_str(s).map_err(|e| TransformError::invalid("fromJson", e.to_string()))
}

fn op_to_json(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    Ok(Value::String(input.to_string()))
}

fn op_from_base64(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let s = input
        .as_str()
        .ok_or_else(|| TransformError::invalid("fromBase64", "input must be a string"))?;
    let bytes = BASE64
        .decode(s.trim())
        .map_err(|e| TransformError::invalid("fromBase64", e.to_string()))?;
    Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
}

fn op_to_base64(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let data = match input {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Ok(Value::String(BASE64.encode(data.as_bytes())))
}

fn op_to_form_data(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let map = input
        .as_object()
        .ok_or_else(|| TransformError::invalid("toFormData", "input must be a mapping"))?;
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in map {
        serializer.append_pair(key, &display_string(value));
    }
    Ok(Value::String(serializer.finish()))
}

fn op_from_form_data(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let s = input
        .as_str()
        .ok_or_else(|| TransformError::invalid("fromFormData", "input must be a string"))?;
    let mut out = Map::new();
    for (key, value) in form_urlencoded::parse(s.as_bytes()) {
        out.insert(key.into_owned(), Value::String(value.into_owned()));
    }
    Ok(Value::Object(out))
}

fn display_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---- XML ----

/// Parse XML into a mapping: attributes keyed `@name`, text content `#text`,
/// repeated child elements promoted to arrays, text-only elements collapsed
/// to plain strings.
fn op_from_xml(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let s = input
        .as_str()
        .ok_or_else(|| TransformError::invalid("fromXml", "input must be a string"))?;
    xml_to_value(s)
}

/// XML → mapping conversion shared with the script runtime's HTTP step.
pub(crate) fn xml_to_value(s: &str) -> Result<Value, TransformError> {
    let mut reader = quick_xml::Reader::from_str(s);
    reader.trim_text(true);
    let mut stack: Vec<(String, Map<String, Value>)> = vec![(String::new(), Map::new())];
    loop {
        use quick_xml::events::Event;
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let mut node = Map::new();
                read_attributes(&e, &mut node)?;
                stack.push((name, node));
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let mut node = Map::new();
                read_attributes(&e, &mut node)?;
                let parent = &mut stack.last_mut().expect("root frame").1;
                insert_child(parent, name, collapse_node(node));
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| TransformError::invalid("fromXml", e.to_string()))?
                    .into_owned();
                if !text.is_empty() {
                    let node = &mut stack.last_mut().expect("root frame").1;
                    match node.get_mut("#text") {
                        Some(Value::String(existing)) => existing.push_str(&text),
                        _ => {
                            node.insert("#text".into(), Value::String(text));
                        }
                    }
                }
            }
            Ok(Event::End(_)) => {
                let (name, node) = stack.pop().expect("balanced document");
                let parent = &mut stack.last_mut().expect("root frame").1;
                insert_child(parent, name, collapse_node(node));
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(TransformError::invalid("fromXml", e.to_string())),
        }
    }
    let (_, root) = stack.pop().expect("root frame");
    Ok(Value::Object(root))
}

fn read_attributes(
    e: &quick_xml::events::BytesStart,
    node: &mut Map<String, Value>,
) -> Result<(), TransformError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| TransformError::invalid("fromXml", e.to_string()))?;
        let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
        let value = attr
            .unescape_value()
            .map_err(|e| TransformError::invalid("fromXml", e.to_string()))?
            .into_owned();
        node.insert(key, Value::String(value));
    }
    Ok(())
}

fn collapse_node(node: Map<String, Value>) -> Value {
    if node.len() == 1 {
        if let Some(Value::String(text)) = node.get("#text") {
            return Value::String(text.clone());
        }
    }
    Value::Object(node)
}

fn insert_child(parent: &mut Map<String, Value>, name: String, child: Value) {
    match parent.get_mut(&name) {
        Some(Value::Array(items)) => items.push(child),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, child]);
        }
        None => {
            parent.insert(name, child);
        }
    }
}

fn op_to_xml(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let map = input
        .as_object()
        .ok_or_else(|| TransformError::invalid("toXml", "input must be a mapping"))?;
    let mut out = String::new();
    for (name, value) in map {
        write_xml_element(&mut out, name, value);
    }
    Ok(Value::String(out))
}

fn write_xml_element(out: &mut String, name: &str, value: &Value) {
    match value {
        Value::Array(items) => {
            for item in items {
                write_xml_element(out, name, item);
            }
        }
        Value::Object(map) => {
            out.push('<');
            out.push_str(name);
            for (k, v) in map {
                if let Some(attr) = k.strip_prefix('@') {
                    out.push_str(&format!(" {}=\"{}\"", attr, xml_escape(&display_string(v))));
                }
            }
            out.push('>');
            if let Some(text) = map.get("#text") {
                out.push_str(&xml_escape(&display_string(text)));
            }
            for (k, v) in map {
                if !k.starts_with('@') && k != "#text" {
                    write_xml_element(out, k, v);
                }
            }
            out.push_str(&format!("</{name}>"));
        }
        other => {
            out.push_str(&format!(
                "<{name}>{}</{name}>",
                xml_escape(&display_string(other))
            ));
        }
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ---- string case ----

fn string_op(input: &Value, f: impl Fn(&str) -> String) -> Result<Value, TransformError> {
    match input.as_str() {
        Some(s) => Ok(Value::String(f(s))),
        None => Ok(Value::Null),
    }
}

fn op_lower_case(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    string_op(input, |s| s.to_lowercase())
}

fn op_upper_case(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    string_op(input, |s| s.to_uppercase())
}

fn op_camel_case(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    string_op(input, |s| s.to_lower_camel_case())
}

fn op_kebab_case(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    string_op(input, |s| s.to_kebab_case())
}

fn op_snake_case(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    string_op(input, |s| s.to_snake_case())
}

fn op_name_case(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    string_op(input, |s| s.to_title_case())
}

fn op_capitalize(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    string_op(input, |s| {
        let mut chars = s.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
            None => String::new(),
        }
    })
}

fn op_deburr(_arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    string_op(input, |s| deunicode::deunicode(s))
}

// ---- HTML ----

fn html_select(
    op: &str,
    input: &Value,
    selector: &str,
) -> Result<(scraper::Html, scraper::Selector), TransformError> {
    let s = input
        .as_str()
        .ok_or_else(|| TransformError::invalid(op, "input must be an HTML string"))?;
    let selector = scraper::Selector::parse(selector)
        .map_err(|e| TransformError::invalid(op, format!("bad selector: {e:?}")))?;
    Ok((scraper::Html::parse_document(s), selector))
}

fn selector_arg<'a>(op: &str, arg: &'a Value) -> Result<&'a str, TransformError> {
    arg.as_str()
        .or_else(|| arg.get("selector").and_then(Value::as_str))
        .ok_or_else(|| TransformError::invalid(op, "missing selector"))
}

fn op_html_tag(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let (doc, selector) = html_select("htmlTag", input, selector_arg("htmlTag", arg)?)?;
    Ok(doc
        .select(&selector)
        .next()
        .map(|el| Value::String(el.html()))
        .unwrap_or(Value::Null))
}

fn op_html_tags(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let (doc, selector) = html_select("htmlTags", input, selector_arg("htmlTags", arg)?)?;
    Ok(Value::Array(
        doc.select(&selector)
            .map(|el| Value::String(el.html()))
            .collect(),
    ))
}

fn op_html_tag_text(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let (doc, selector) = html_select("htmlTagText", input, selector_arg("htmlTagText", arg)?)?;
    Ok(doc
        .select(&selector)
        .next()
        .map(|el| Value::String(element_text(&el)))
        .unwrap_or(Value::Null))
}

fn op_html_tags_text(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let (doc, selector) = html_select("htmlTagsText", input, selector_arg("htmlTagsText", arg)?)?;
    Ok(Value::Array(
        doc.select(&selector)
            .map(|el| Value::String(element_text(&el)))
            .collect(),
    ))
}

fn op_html_attribute(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let selector = selector_arg("htmlAttribute", arg)?;
    let attribute = arg
        .get("attribute")
        .and_then(Value::as_str)
        .ok_or_else(|| TransformError::invalid("htmlAttribute", "missing 'attribute'"))?;
    let (doc, selector) = html_select("htmlAttribute", input, selector)?;
    Ok(doc
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr(attribute))
        .map(|v| Value::String(v.to_string()))
        .unwrap_or(Value::Null))
}

/// Locate the table row whose cell at index `cell` matches `text`
/// (trimmed, case-insensitive). With `returnCell`, yield that cell's text;
/// otherwise the matching row's outer HTML.
fn op_html_table(arg: &Value, input: &Value, _ctx: &mut OpCtx) -> Result<Value, TransformError> {
    let selector = arg
        .get("selector")
        .and_then(Value::as_str)
        .unwrap_or("table");
    let cell_index = arg
        .get("cell")
        .and_then(Value::as_u64)
        .ok_or_else(|| TransformError::invalid("htmlTable", "missing 'cell'"))? as usize;
    let needle = arg
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| TransformError::invalid("htmlTable", "missing 'text'"))?;
    let return_cell = arg.get("returnCell").and_then(Value::as_u64).map(|n| n as usize);

    let (doc, table_sel) = html_select("htmlTable", input, selector)?;
    let row_sel = scraper::Selector::parse("tr").expect("static selector");
    let cell_sel = scraper::Selector::parse("td, th").expect("static selector");

    for table in doc.select(&table_sel) {
        for row in table.select(&row_sel) {
            let cells: Vec<_> = row.select(&cell_sel).collect();
            let Some(candidate) = cells.get(cell_index) else {
                continue;
            };
            if !element_text(candidate).eq_ignore_ascii_case(needle.trim()) {
                continue;
            }
            return Ok(match return_cell {
                Some(i) => cells
                    .get(i)
                    .map(|c| Value::String(element_text(c)))
                    .unwrap_or(Value::Null),
                None => Value::String(row.html()),
            });
        }
    }
    Ok(Value::Null)
}

fn element_text(el: &scraper::ElementRef) -> String {
    el.text().collect::<String>().trim().to_string()
}
