//! Platform assembly: models, scripts, authentication and scheduling wired
//! into one shared unit.
//!
//! Model and script definitions are YAML or JSON documents loaded once at
//! init. A `User` and an `AuthnToken` model are provided when the
//! configuration does not declare them, so a minimal platform can issue
//! tokens out of the box.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use trellis_core::{
    AuthConfig, Authenticator, Dispatcher, MemoryModel, Scheduler, Script, ScriptEnv, ScriptError,
    Storage,
};

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("model document {path} has no 'name'")]
    UnnamedModel { path: PathBuf },
    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Static configuration consumed by [`Platform::init`].
#[derive(Debug, Clone, Default)]
pub struct PlatformConfig {
    pub models_dir: Option<PathBuf>,
    pub scripts_dir: Option<PathBuf>,
    /// Admin table: name to pre-hashed password.
    pub admins: HashMap<String, String>,
    pub auth: AuthConfig,
}

impl PlatformConfig {
    /// Smallest useful configuration: built-in models, no scripts, one admin.
    pub fn minimal(admins: HashMap<String, String>) -> Self {
        Self {
            admins,
            ..Self::default()
        }
    }
}

pub struct Platform {
    dispatcher: Arc<Dispatcher>,
    authenticator: Authenticator,
    scheduler: Mutex<Option<Scheduler>>,
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

impl Platform {
    pub fn init(config: PlatformConfig) -> Result<Self, PlatformError> {
        let mut dispatcher = Dispatcher::new().with_user_entity(config.auth.user_entity.clone());

        if let Some(dir) = &config.models_dir {
            for (path, doc) in load_documents(dir)? {
                let name = doc
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| PlatformError::UnnamedModel { path: path.clone() })?
                    .to_string();
                tracing::debug!(model = name, path = %path.display(), "registering model");
                dispatcher.register_model(Arc::new(MemoryModel::new(name, doc)));
            }
        }
        if dispatcher.model(&config.auth.user_entity).is_none() {
            dispatcher.register_model(Arc::new(MemoryModel::new(
                config.auth.user_entity.clone(),
                default_user_schema(&config.auth),
            )));
        }
        if dispatcher.model(&config.auth.token_entity).is_none() {
            dispatcher.register_model(Arc::new(MemoryModel::new(
                config.auth.token_entity.clone(),
                default_token_schema(&config.auth),
            )));
        }

        let dispatcher = dispatcher.into_shared();

        if let Some(dir) = &config.scripts_dir {
            for (path, doc) in load_documents(dir)? {
                let script = Script::new(&doc)?;
                tracing::info!(script = script.name(), path = %path.display(), "registering script");
                dispatcher.register_script(Arc::new(script));
            }
        }

        let storage = Arc::clone(&dispatcher) as Arc<dyn Storage>;
        let authenticator = Authenticator::new(storage, config.admins, config.auth);

        Ok(Self {
            dispatcher,
            authenticator,
            scheduler: Mutex::new(None),
        })
    }

    /// Start cron and startup timers for every registered script.
    pub fn start(&self) {
        let mut scheduler = Scheduler::new();
        let env = ScriptEnv::admin(self.storage());
        for name in self.dispatcher.script_names() {
            if let Some(script) = self.dispatcher.script(&name) {
                scheduler.add(script, env.clone());
            }
        }
        *self.scheduler.lock().expect("scheduler lock") = Some(scheduler);
    }

    /// Stop timers and wait for in-flight script runs.
    pub fn shutdown(&self) {
        if let Some(scheduler) = self.scheduler.lock().expect("scheduler lock").take() {
            scheduler.shutdown();
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.dispatcher) as Arc<dyn Storage>
    }
}

fn load_documents(dir: &Path) -> Result<Vec<(PathBuf, Value)>, PlatformError> {
    let entries = std::fs::read_dir(dir).map_err(|source| PlatformError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml") | Some("json")
            )
        })
        .collect();
    paths.sort();

    let mut docs = Vec::with_capacity(paths.len());
    for path in paths {
        let text = std::fs::read_to_string(&path).map_err(|source| PlatformError::Io {
            path: path.clone(),
            source,
        })?;
        let doc: Value =
            serde_yaml::from_str(&text).map_err(|e| PlatformError::Parse {
                path: path.clone(),
                message: e.to_string(),
            })?;
        docs.push((path, doc));
    }
    Ok(docs)
}

fn default_user_schema(auth: &AuthConfig) -> Value {
    json!({
        "properties": {
            "id": {"type": "string"},
            "name": {"type": "string"},
            (auth.username_field.clone()): {"type": "string"},
            (auth.password_field.clone()): {
                "type": "string",
                "format": "password",
                "access": {"read": "false"}
            }
        }
    })
}

fn default_token_schema(auth: &AuthConfig) -> Value {
    json!({
        "properties": {
            "id": {"type": "string"},
            "token": {"type": "string"},
            "userId": {"type": "string", "references": auth.user_entity.clone()},
            "issuedAt": {"type": "integer"}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn minimal_platform_has_builtin_models() {
        let platform = Platform::init(PlatformConfig::default()).unwrap();
        assert!(platform.dispatcher().model("User").is_some());
        assert!(platform.dispatcher().model("AuthnToken").is_some());
    }

    #[test]
    fn loads_models_and_scripts_from_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models");
        let scripts = dir.path().join("scripts");
        std::fs::create_dir_all(&models).unwrap();
        std::fs::create_dir_all(&scripts).unwrap();

        let mut model = std::fs::File::create(models.join("article.yaml")).unwrap();
        write!(
            model,
            "name: Article\nproperties:\n  id: {{type: string}}\n  title: {{type: string}}\n"
        )
        .unwrap();

        let mut script = std::fs::File::create(scripts.join("seed.yaml")).unwrap();
        write!(
            script,
            "name: seed\nsteps:\n  - query: '{{createArticle(title: \"hello\")}}'\n"
        )
        .unwrap();

        let platform = Platform::init(PlatformConfig {
            models_dir: Some(models),
            scripts_dir: Some(scripts),
            ..PlatformConfig::default()
        })
        .unwrap();

        assert!(platform.dispatcher().model("Article").is_some());
        let out = platform
            .dispatcher()
            .execute("{script(name: \"seed\")}", None, None)
            .unwrap();
        assert!(out["script"]["result"].is_object());

        let listed = platform
            .dispatcher()
            .execute("{listArticle {id title}}", None, None)
            .unwrap();
        assert_eq!(listed["listArticle"][0]["title"], json!("hello"));
    }

    #[test]
    fn bad_script_document_fails_init() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "name: broken\n").unwrap();
        let err = Platform::init(PlatformConfig {
            scripts_dir: Some(dir.path().to_path_buf()),
            ..PlatformConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, PlatformError::Script(_)));
    }

    #[test]
    fn start_and_shutdown_are_idempotent() {
        let platform = Platform::init(PlatformConfig::default()).unwrap();
        platform.start();
        platform.shutdown();
        platform.shutdown();
    }
}
