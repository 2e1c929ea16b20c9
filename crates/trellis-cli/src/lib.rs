//! Trellis command line.
//!
//! ```text
//! trellis serve [DIR] [--port N] [--config FILE]
//! trellis run FILE [--data JSON] [--models DIR] [--debug]
//! trellis hash-password PASSWORD
//! ```
//!
//! `serve` loads `DIR/trellis.yaml` (if present) plus the conventional
//! `models/` and `scripts/` subdirectories and exposes the HTTP surface.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use trellis_core::{password, AuthConfig, Script, ScriptEnv};
use trellis_web::{AxumAdapter, Platform, PlatformConfig};

#[derive(Debug, Clone)]
enum CliCommand {
    Serve {
        dir: PathBuf,
        port: Option<u16>,
        config: Option<PathBuf>,
    },
    Run {
        file: PathBuf,
        data: Option<String>,
        models: Option<PathBuf>,
        debug: bool,
    },
    HashPassword {
        plaintext: String,
    },
}

/// Optional `trellis.yaml` next to the served directory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigFile {
    port: Option<u16>,
    models_dir: Option<PathBuf>,
    scripts_dir: Option<PathBuf>,
    /// Admin name to pre-hashed password (see `trellis hash-password`).
    admins: HashMap<String, String>,
    auth: AuthSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AuthSection {
    user_entity: Option<String>,
    username_field: Option<String>,
    password_field: Option<String>,
    user_fields: Option<Vec<String>>,
    token_entity: Option<String>,
    token_ttl_secs: Option<u64>,
}

impl AuthSection {
    fn into_config(self) -> AuthConfig {
        let mut config = AuthConfig::default();
        if let Some(v) = self.user_entity {
            config.user_entity = v;
        }
        if let Some(v) = self.username_field {
            config.username_field = v;
        }
        if let Some(v) = self.password_field {
            config.password_field = v;
        }
        if let Some(v) = self.user_fields {
            config.user_fields = v;
        }
        if let Some(v) = self.token_entity {
            config.token_entity = v;
        }
        if let Some(secs) = self.token_ttl_secs {
            config.token_ttl = if secs == 0 {
                None
            } else {
                Some(Duration::from_secs(secs))
            };
        }
        config
    }
}

pub async fn run_from_env() -> Result<(), String> {
    run_from_args(env::args().skip(1).collect()).await
}

pub async fn run_from_args(args: Vec<String>) -> Result<(), String> {
    match parse_command(args)? {
        CliCommand::Serve { dir, port, config } => run_serve(dir, port, config).await,
        CliCommand::Run {
            file,
            data,
            models,
            debug,
        } => run_headless(file, data, models, debug),
        CliCommand::HashPassword { plaintext } => {
            println!("{}", password::hash(&plaintext));
            Ok(())
        }
    }
}

fn parse_command(args: Vec<String>) -> Result<CliCommand, String> {
    if args.is_empty() {
        return Err(help_text());
    }
    match args[0].as_str() {
        "serve" => parse_serve(args),
        "run" => parse_run(args),
        "hash-password" => {
            let plaintext = args
                .get(1)
                .cloned()
                .ok_or_else(|| "hash-password requires PASSWORD".to_string())?;
            Ok(CliCommand::HashPassword { plaintext })
        }
        "help" | "--help" | "-h" => Err(help_text()),
        other => Err(format!("unknown command: {other}\n\n{}", help_text())),
    }
}

fn parse_serve(args: Vec<String>) -> Result<CliCommand, String> {
    let mut dir: Option<PathBuf> = None;
    let mut port: Option<u16> = None;
    let mut config: Option<PathBuf> = None;

    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "--port requires a value".to_string())?;
                port = Some(
                    value
                        .parse::<u16>()
                        .map_err(|_| format!("invalid port: {value}"))?,
                );
            }
            "--config" => {
                i += 1;
                config = Some(PathBuf::from(
                    args.get(i)
                        .ok_or_else(|| "--config requires a value".to_string())?,
                ));
            }
            flag if flag.starts_with("--") => return Err(format!("unknown flag: {flag}")),
            positional => {
                if dir.is_some() {
                    return Err("only one DIR positional argument is allowed".to_string());
                }
                dir = Some(PathBuf::from(positional));
            }
        }
        i += 1;
    }
    Ok(CliCommand::Serve {
        dir: dir.unwrap_or_else(|| PathBuf::from(".")),
        port,
        config,
    })
}

fn parse_run(args: Vec<String>) -> Result<CliCommand, String> {
    let mut file: Option<PathBuf> = None;
    let mut data: Option<String> = None;
    let mut models: Option<PathBuf> = None;
    let mut debug = false;

    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--data" => {
                i += 1;
                data = Some(
                    args.get(i)
                        .ok_or_else(|| "--data requires a value".to_string())?
                        .clone(),
                );
            }
            "--models" => {
                i += 1;
                models = Some(PathBuf::from(
                    args.get(i)
                        .ok_or_else(|| "--models requires a value".to_string())?,
                ));
            }
            "--debug" => debug = true,
            flag if flag.starts_with("--") => return Err(format!("unknown flag: {flag}")),
            positional => {
                if file.is_some() {
                    return Err("only one FILE positional argument is allowed".to_string());
                }
                file = Some(PathBuf::from(positional));
            }
        }
        i += 1;
    }
    let file = file.ok_or_else(|| "run requires FILE".to_string())?;
    Ok(CliCommand::Run {
        file,
        data,
        models,
        debug,
    })
}

fn help_text() -> String {
    [
        "trellis - declarative backend platform",
        "",
        "USAGE:",
        "  trellis serve [DIR] [--port N] [--config FILE]",
        "  trellis run FILE [--data JSON] [--models DIR] [--debug]",
        "  trellis hash-password PASSWORD",
    ]
    .join("\n")
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn build_platform_config(dir: &PathBuf, config_path: Option<PathBuf>) -> Result<(PlatformConfig, Option<u16>), String> {
    let explicit = config_path.is_some();
    let path = config_path.unwrap_or_else(|| dir.join("trellis.yaml"));
    let file = if path.exists() {
        let text = fs::read_to_string(&path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        serde_yaml::from_str::<ConfigFile>(&text)
            .map_err(|e| format!("failed to parse {}: {e}", path.display()))?
    } else if explicit {
        return Err(format!("config file {} does not exist", path.display()));
    } else {
        ConfigFile::default()
    };

    let resolve = |p: PathBuf| if p.is_absolute() { p } else { dir.join(p) };
    let default_dir = |name: &str| {
        let candidate = dir.join(name);
        candidate.is_dir().then_some(candidate)
    };

    let models_dir = file.models_dir.map(resolve).or_else(|| default_dir("models"));
    let scripts_dir = file
        .scripts_dir
        .map(resolve)
        .or_else(|| default_dir("scripts"));

    Ok((
        PlatformConfig {
            models_dir,
            scripts_dir,
            admins: file.admins,
            auth: file.auth.into_config(),
        },
        file.port,
    ))
}

async fn run_serve(
    dir: PathBuf,
    port_flag: Option<u16>,
    config_path: Option<PathBuf>,
) -> Result<(), String> {
    init_tracing();
    let (platform_config, config_port) = build_platform_config(&dir, config_path)?;
    let port = port_flag.or(config_port).unwrap_or(8080);

    let platform = Platform::init(platform_config).map_err(|e| e.to_string())?;
    platform.start();
    let platform = Arc::new(platform);

    let app = AxumAdapter::new(Arc::clone(&platform)).router();
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| format!("failed to bind port {port}: {e}"))?;
    tracing::info!(port, dir = %dir.display(), "trellis listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("server error: {e}"))?;

    tracing::info!("shutting down; waiting for in-flight script runs");
    platform.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn run_headless(
    file: PathBuf,
    data: Option<String>,
    models: Option<PathBuf>,
    debug: bool,
) -> Result<(), String> {
    init_tracing();
    let text =
        fs::read_to_string(&file).map_err(|e| format!("failed to read {}: {e}", file.display()))?;
    let doc: Value = serde_yaml::from_str(&text)
        .map_err(|e| format!("failed to parse {}: {e}", file.display()))?;
    let script = Script::new(&doc).map_err(|e| e.to_string())?;

    let platform = Platform::init(PlatformConfig {
        models_dir: models,
        ..PlatformConfig::default()
    })
    .map_err(|e| e.to_string())?;
    let env = ScriptEnv::admin(platform.storage());

    let input: Value = match data {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| format!("invalid --data: {e}"))?,
        None => Value::Null,
    };

    if debug {
        let (state, trace) = script.run_debug(input, &env).map_err(|e| e.to_string())?;
        let report = serde_json::json!({"state": state, "trace": trace});
        println!(
            "{}",
            serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?
        );
    } else {
        let state = script.run(input, &env).map_err(|e| e.to_string())?;
        println!(
            "{}",
            serde_json::to_string_pretty(&state).map_err(|e| e.to_string())?
        );
    }
    Ok(())
}
