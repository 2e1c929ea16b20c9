//! Axum adapter: the platform's HTTP surface.
//!
//! Routes: `POST /token` (password grant), `GET|POST /graphql`,
//! `POST|PUT /file/:entity` (multipart and raw upload), and
//! `GET /file/:entity/:id` (download with content headers).
//!
//! Status mapping: authentication failures 401, access denials 403,
//! validation and parse failures 400. Response shaping lives in plain
//! functions so the behavior is testable without a socket.

use crate::platform::Platform;
use axum::body::Bytes;
use axum::extract::{Multipart, Path as AxumPath, Query as AxumQuery, State as AxumState};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use trellis_core::{AuthError, AuthOutcome, Context};

const META_HEADER_PREFIX: &str = "x-meta-";

#[derive(Clone)]
pub struct AxumAdapter {
    platform: Arc<Platform>,
}

impl AxumAdapter {
    pub fn new(platform: Arc<Platform>) -> Self {
        Self { platform }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/token", post(post_token))
            .route("/graphql", get(get_graphql).post(post_graphql))
            .route("/file/:entity", post(post_file).put(put_file))
            .route("/file/:entity/:id", get(get_file))
            .with_state(self)
    }
}

/// Map an optional `Authorization` header to an execution context.
/// `None` result = admin (context-free); anonymous callers get an empty
/// context and run through every access predicate.
fn resolve_context(
    platform: &Platform,
    auth_header: Option<&str>,
) -> Result<Option<Context>, StatusCode> {
    match auth_header {
        None => Ok(Some(Context::anonymous())),
        Some(header) => match platform.authenticator().authenticate_header(header) {
            Ok(AuthOutcome::Admin) => Ok(None),
            Ok(AuthOutcome::User(context)) => Ok(Some(context)),
            Err(_) => Err(StatusCode::UNAUTHORIZED),
        },
    }
}

/// `POST /token` body handling. A `Null` payload means an empty body.
pub fn token_response(platform: &Platform, body: &Value) -> (StatusCode, Value) {
    let grant_type = body.get("grant_type").and_then(Value::as_str);
    let username = body.get("username").and_then(Value::as_str);
    let password = body.get("password").and_then(Value::as_str);
    let (Some(grant_type), Some(username), Some(password)) = (grant_type, username, password)
    else {
        return (
            StatusCode::BAD_REQUEST,
            json!({"error": "invalid_request"}),
        );
    };
    match platform
        .authenticator()
        .password_grant(grant_type, username, password)
    {
        Ok(token) => (
            StatusCode::OK,
            serde_json::to_value(token).unwrap_or(Value::Null),
        ),
        Err(AuthError::InvalidGrant(_)) => (
            StatusCode::BAD_REQUEST,
            json!({"error": "unsupported_grant_type"}),
        ),
        Err(AuthError::InvalidCredentials) => (StatusCode::UNAUTHORIZED, Value::Null),
        Err(AuthError::Storage(message)) => {
            tracing::error!(error = message, "token issuance failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Value::Null)
        }
    }
}

/// Execute a query under the caller's context and map failures to statuses.
pub fn graphql_response(
    platform: &Platform,
    query: &str,
    arguments: Option<&Value>,
    auth_header: Option<&str>,
) -> (StatusCode, Value) {
    let context = match resolve_context(platform, auth_header) {
        Ok(context) => context,
        Err(status) => return (status, Value::Null),
    };
    match platform
        .dispatcher()
        .execute(query, context.as_ref(), arguments)
    {
        Ok(value) => (StatusCode::OK, value),
        Err(errors) => {
            let status = if errors.denied() {
                StatusCode::FORBIDDEN
            } else {
                StatusCode::BAD_REQUEST
            };
            (status, json!({"errors": errors.payload()}))
        }
    }
}

/// One uploaded file plus declared-field metadata.
pub struct FileUpload {
    pub data: Vec<u8>,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    /// `(field, value)` pairs from `X-Meta-<Field>` headers; field names are
    /// matched case-insensitively against declared properties, unknown
    /// fields are silently ignored.
    pub meta: Vec<(String, Value)>,
}

/// Create a row for the upload; returns `{"id": ...}`.
pub fn store_file(
    platform: &Platform,
    entity: &str,
    auth_header: Option<&str>,
    upload: FileUpload,
) -> (StatusCode, Value) {
    let context = match resolve_context(platform, auth_header) {
        Ok(context) => context,
        Err(status) => return (status, Value::Null),
    };
    let Some(model) = platform.dispatcher().model(entity) else {
        return (
            StatusCode::NOT_FOUND,
            json!({"error": format!("unknown entity '{entity}'")}),
        );
    };
    let properties: Vec<String> = model
        .json_schema()
        .get("properties")
        .and_then(Value::as_object)
        .map(|p| p.keys().cloned().collect())
        .unwrap_or_default();

    let mut bindings = Map::new();
    if declared_field(&properties, "data").is_some() {
        bindings.insert("data".into(), Value::String(BASE64.encode(&upload.data)));
    }
    if declared_field(&properties, "size").is_some() {
        bindings.insert("size".into(), Value::from(upload.data.len()));
    }
    if let (Some(field), Some(name)) = (declared_field(&properties, "fileName"), &upload.file_name)
    {
        bindings.insert(field.clone(), Value::String(name.clone()));
    }
    if let (Some(field), Some(kind)) =
        (declared_field(&properties, "contentType"), &upload.content_type)
    {
        bindings.insert(field.clone(), Value::String(kind.clone()));
    }
    for (name, value) in &upload.meta {
        if let Some(field) = declared_field(&properties, name) {
            bindings.insert(field.clone(), value.clone());
        }
    }

    let params: Vec<String> = bindings.keys().map(|k| format!("{k}: ${k}")).collect();
    let query = format!("{{f: create{}({}) {{id}}}}", entity, params.join(", "));
    match platform.dispatcher().execute(
        &query,
        context.as_ref(),
        Some(&Value::Object(bindings)),
    ) {
        Ok(out) => (StatusCode::OK, json!({"id": out["f"]["id"]})),
        Err(errors) => {
            let status = if errors.denied() {
                StatusCode::FORBIDDEN
            } else {
                StatusCode::BAD_REQUEST
            };
            (status, json!({"errors": errors.payload()}))
        }
    }
}

#[derive(Debug)]
pub struct FileDownload {
    pub data: Vec<u8>,
    pub file_name: Option<String>,
    pub content_type: String,
}

/// Read a stored file row back into bytes plus content headers.
pub fn fetch_file(
    platform: &Platform,
    entity: &str,
    id: &str,
    auth_header: Option<&str>,
) -> Result<FileDownload, (StatusCode, Value)> {
    let context =
        resolve_context(platform, auth_header).map_err(|status| (status, Value::Null))?;
    if platform.dispatcher().model(entity).is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            json!({"error": format!("unknown entity '{entity}'")}),
        ));
    }
    let query = format!("{{f: read{entity}(id: $id)}}");
    let out = platform
        .dispatcher()
        .execute(&query, context.as_ref(), Some(&json!({"id": id})))
        .map_err(|errors| {
            let status = if errors.denied() {
                StatusCode::FORBIDDEN
            } else {
                StatusCode::BAD_REQUEST
            };
            (status, json!({"errors": errors.payload()}))
        })?;
    let item = &out["f"];
    if item.is_null() {
        return Err((StatusCode::NOT_FOUND, Value::Null));
    }
    let data = item
        .get("data")
        .and_then(Value::as_str)
        .and_then(|encoded| BASE64.decode(encoded).ok())
        .unwrap_or_default();
    Ok(FileDownload {
        data,
        file_name: item
            .get("fileName")
            .and_then(Value::as_str)
            .map(str::to_string),
        content_type: item
            .get("contentType")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream")
            .to_string(),
    })
}

fn declared_field<'a>(properties: &'a [String], name: &str) -> Option<&'a String> {
    properties.iter().find(|p| p.eq_ignore_ascii_case(name))
}

fn auth_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

fn meta_headers(headers: &HeaderMap) -> Vec<(String, Value)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let field = name.as_str().strip_prefix(META_HEADER_PREFIX)?;
            let raw = value.to_str().ok()?;
            let parsed =
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Some((field.to_string(), parsed))
        })
        .collect()
}

fn json_or_empty(status: StatusCode, value: Value) -> Response {
    if value.is_null() {
        status.into_response()
    } else {
        (status, Json(value)).into_response()
    }
}

async fn post_token(
    AxumState(adapter): AxumState<AxumAdapter>,
    Json(body): Json<Value>,
) -> Response {
    let (status, value) = token_response(&adapter.platform, &body);
    json_or_empty(status, value)
}

async fn get_graphql(
    AxumState(adapter): AxumState<AxumAdapter>,
    AxumQuery(params): AxumQuery<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let Some(query) = params.get("q") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing 'q' parameter"})),
        )
            .into_response();
    };
    let (status, value) =
        graphql_response(&adapter.platform, query, None, auth_header(&headers));
    json_or_empty(status, value)
}

async fn post_graphql(
    AxumState(adapter): AxumState<AxumAdapter>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let Some(query) = body.get("query").and_then(Value::as_str) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing 'query'"})),
        )
            .into_response();
    };
    let arguments = body.get("arguments").cloned();
    let (status, value) = graphql_response(
        &adapter.platform,
        query,
        arguments.as_ref(),
        auth_header(&headers),
    );
    json_or_empty(status, value)
}

async fn post_file(
    AxumState(adapter): AxumState<AxumAdapter>,
    AxumPath(entity): AxumPath<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let mut upload = FileUpload {
        data: Vec::new(),
        file_name: None,
        content_type: None,
        meta: meta_headers(&headers),
    };
    while let Ok(Some(field)) = multipart.next_field().await {
        upload.file_name = field.file_name().map(str::to_string);
        upload.content_type = field.content_type().map(str::to_string);
        match field.bytes().await {
            Ok(bytes) => upload.data = bytes.to_vec(),
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "unreadable multipart field"})),
                )
                    .into_response()
            }
        }
        break;
    }
    let (status, value) = store_file(&adapter.platform, &entity, auth_header(&headers), upload);
    json_or_empty(status, value)
}

async fn put_file(
    AxumState(adapter): AxumState<AxumAdapter>,
    AxumPath(entity): AxumPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let upload = FileUpload {
        data: body.to_vec(),
        file_name: None,
        content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        meta: meta_headers(&headers),
    };
    let (status, value) = store_file(&adapter.platform, &entity, auth_header(&headers), upload);
    json_or_empty(status, value)
}

async fn get_file(
    AxumState(adapter): AxumState<AxumAdapter>,
    AxumPath((entity, id)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    match fetch_file(&adapter.platform, &entity, &id, auth_header(&headers)) {
        Ok(file) => {
            let disposition = match &file.file_name {
                Some(name) => format!("attachment; filename=\"{name}\""),
                None => "attachment".to_string(),
            };
            let headers = [
                (header::CONTENT_TYPE, file.content_type.clone()),
                (header::CONTENT_DISPOSITION, disposition),
                (
                    HeaderName::from_static("content-length"),
                    file.data.len().to_string(),
                ),
            ];
            (headers, file.data).into_response()
        }
        Err((status, value)) => json_or_empty(status, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformConfig;
    use std::collections::HashMap as StdHashMap;
    use trellis_core::password;

    fn seeded_platform() -> Arc<Platform> {
        let mut admins = StdHashMap::new();
        admins.insert("admin".to_string(), password::hash("secret"));
        let platform = Platform::init(PlatformConfig::minimal(admins)).unwrap();
        platform
            .dispatcher()
            .execute(
                r#"{createUser(name: "Alice", mail: "alice@example.com", password: "Welcome!")}"#,
                None,
                None,
            )
            .unwrap();
        Arc::new(platform)
    }

    fn basic(user: &str, pass: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{user}:{pass}")))
    }

    #[test]
    fn token_exchange_success_and_failure() {
        let platform = seeded_platform();
        let (status, body) = token_response(
            &platform,
            &json!({"grant_type": "password", "username": "alice@example.com", "password": "Welcome!"}),
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["token_type"], json!("bearer"));
        assert!(body["access_token"].as_str().unwrap().len() >= 43);

        let (status, body) = token_response(
            &platform,
            &json!({"grant_type": "password", "username": "alice@example.com", "password": "wrong"}),
        );
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.is_null(), "401 carries an empty body");

        let (status, _) = token_response(&platform, &json!({"grant_type": "password"}));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = token_response(
            &platform,
            &json!({"grant_type": "token", "username": "a", "password": "b"}),
        );
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn issued_token_authenticates_graphql() {
        let platform = seeded_platform();
        let (_, body) = token_response(
            &platform,
            &json!({"grant_type": "password", "username": "alice@example.com", "password": "Welcome!"}),
        );
        let bearer = format!("Bearer {}", body["access_token"].as_str().unwrap());
        let (status, out) =
            graphql_response(&platform, "{User {id name}}", None, Some(&bearer));
        assert_eq!(status, StatusCode::OK);
        assert_eq!(out["User"]["name"], json!("Alice"));

        let (status, _) = graphql_response(
            &platform,
            "{User {id}}",
            None,
            Some("Bearer AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"),
        );
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn admin_basic_auth_creates_user() {
        let platform = seeded_platform();
        let (status, out) = graphql_response(
            &platform,
            r#"{createUser(name: "Bob", mail: "bob@example.com", password: "pw") {id}}"#,
            None,
            Some(&basic("admin", "secret")),
        );
        assert_eq!(status, StatusCode::OK);
        assert!(out["createUser"]["id"].as_str().is_some());

        let (status, _) = graphql_response(
            &platform,
            "{listUser}",
            None,
            Some(&basic("admin", "nope")),
        );
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn anonymous_denied_reading_protected_field() {
        let platform = seeded_platform();
        let users = platform
            .dispatcher()
            .execute("{listUser {id}}", None, None)
            .unwrap();
        let id = users["listUser"][0]["id"].as_str().unwrap().to_string();
        let (status, out) = graphql_response(
            &platform,
            &format!("{{readUser(id: \"{id}\") {{id password}}}}"),
            None,
            None,
        );
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(out["errors"][0]["field"], json!("password"));
    }

    #[test]
    fn parse_error_is_400() {
        let platform = seeded_platform();
        let (status, out) = graphql_response(&platform, "{listUser", None, None);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(out["errors"][0]["message"]
            .as_str()
            .unwrap()
            .contains("parse error"));
    }

    #[test]
    fn file_store_and_fetch_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("attachment.yaml"),
            "name: Attachment\nproperties:\n  id: {type: string}\n  fileName: {type: string}\n  contentType: {type: string}\n  size: {type: integer}\n  data: {type: string}\n  owner: {type: string}\n",
        )
        .unwrap();
        let platform = Platform::init(PlatformConfig {
            models_dir: Some(dir.path().to_path_buf()),
            ..PlatformConfig::default()
        })
        .unwrap();

        let upload = FileUpload {
            data: b"hello bytes".to_vec(),
            file_name: Some("hello.txt".to_string()),
            content_type: Some("text/plain".to_string()),
            meta: vec![
                ("owner".to_string(), json!("alice")),
                ("bogusfield".to_string(), json!("dropped")),
            ],
        };
        let (status, out) = store_file(&platform, "Attachment", None, upload);
        assert_eq!(status, StatusCode::OK);
        let id = out["id"].as_str().unwrap().to_string();

        let file = fetch_file(&platform, "Attachment", &id, None).unwrap();
        assert_eq!(file.data, b"hello bytes");
        assert_eq!(file.file_name.as_deref(), Some("hello.txt"));
        assert_eq!(file.content_type, "text/plain");

        let row = platform
            .dispatcher()
            .execute(
                &format!("{{readAttachment(id: \"{id}\") {{owner size}}}}"),
                None,
                None,
            )
            .unwrap();
        assert_eq!(row["readAttachment"]["owner"], json!("alice"));
        assert_eq!(row["readAttachment"]["size"], json!(11));

        let missing = fetch_file(&platform, "Attachment", "nope", None).unwrap_err();
        assert_eq!(missing.0, StatusCode::NOT_FOUND);
        let unknown = fetch_file(&platform, "Ghost", "x", None).unwrap_err();
        assert_eq!(unknown.0, StatusCode::NOT_FOUND);
    }
}
