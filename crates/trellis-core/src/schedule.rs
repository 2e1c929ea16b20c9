//! Cron-driven and startup activation of scripts.
//!
//! One worker thread per scheduled script. Firings that land while the
//! previous activation is still running are skipped, never queued; the run
//! guard on the script enforces this. Shutdown waits for in-flight runs.

use crate::script::{Script, ScriptEnv, ScriptError};
use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const STARTUP_DELAY: Duration = Duration::from_millis(2000);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct Scheduler {
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    /// Register a script's timers: a cron worker if it declares a schedule,
    /// a one-shot startup runner if it asks for one.
    pub fn add(&mut self, script: Arc<Script>, env: ScriptEnv) {
        if script.schedule().is_some() {
            let stop = Arc::clone(&self.stop);
            let script = Arc::clone(&script);
            let env = env.clone();
            self.workers.push(std::thread::spawn(move || {
                cron_worker(&script, &env, &stop);
            }));
        }
        if script.run_on_startup() {
            let stop = Arc::clone(&self.stop);
            self.workers.push(std::thread::spawn(move || {
                startup_worker(&script, &env, &stop);
            }));
        }
    }

    /// Stop all timers and wait for in-flight runs to complete.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn cron_worker(script: &Script, env: &ScriptEnv, stop: &AtomicBool) {
    let schedule = script
        .schedule()
        .expect("cron worker spawned for scheduled script")
        .clone();
    while !stop.load(Ordering::SeqCst) {
        let Some(next) = schedule.upcoming(Utc).next() else {
            break;
        };
        while !stop.load(Ordering::SeqCst) {
            let now = Utc::now();
            if now >= next {
                break;
            }
            let remaining = (next - now)
                .to_std()
                .unwrap_or(POLL_INTERVAL)
                .min(POLL_INTERVAL);
            std::thread::sleep(remaining);
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }
        run_logged(script, env, "scheduled");
    }
}

fn startup_worker(script: &Script, env: &ScriptEnv, stop: &AtomicBool) {
    let mut waited = Duration::ZERO;
    while waited < STARTUP_DELAY {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let step = POLL_INTERVAL.min(STARTUP_DELAY - waited);
        std::thread::sleep(step);
        waited += step;
    }
    if !stop.load(Ordering::SeqCst) {
        run_logged(script, env, "startup");
    }
}

fn run_logged(script: &Script, env: &ScriptEnv, trigger: &str) {
    match script.run(json!({}), env) {
        Ok(_) => tracing::debug!(script = script.name(), trigger, "run finished"),
        Err(ScriptError::ConcurrentRun(_)) => {
            tracing::debug!(script = script.name(), trigger, "skipped; already running");
        }
        Err(err) => {
            tracing::warn!(script = script.name(), trigger, error = %err, "run failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::query::QueryErrors;
    use crate::storage::Storage;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    struct CountingStorage {
        calls: AtomicUsize,
    }

    impl Storage for CountingStorage {
        fn query(
            &self,
            _query: &str,
            _context: Option<&Context>,
            _arguments: Option<&Value>,
        ) -> Result<Value, QueryErrors> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({}))
        }
    }

    #[test]
    fn cron_fires_and_shutdown_joins() {
        let storage = Arc::new(CountingStorage {
            calls: AtomicUsize::new(0),
        });
        let script = Arc::new(
            Script::new(&json!({
                "name": "tick",
                "schedule": "* * * * * *",
                "steps": [{"query": "{countUser}"}]
            }))
            .unwrap(),
        );
        let mut scheduler = Scheduler::new();
        scheduler.add(script, ScriptEnv::admin(Arc::clone(&storage) as Arc<dyn Storage>));
        std::thread::sleep(Duration::from_millis(2500));
        scheduler.shutdown();
        let fired = storage.calls.load(Ordering::SeqCst);
        assert!(fired >= 1, "expected at least one firing, saw {fired}");
    }

    #[test]
    fn startup_run_waits_two_seconds() {
        let storage = Arc::new(CountingStorage {
            calls: AtomicUsize::new(0),
        });
        let script = Arc::new(
            Script::new(&json!({
                "name": "boot",
                "runOnStartup": true,
                "steps": [{"query": "{countUser}"}]
            }))
            .unwrap(),
        );
        let mut scheduler = Scheduler::new();
        scheduler.add(script, ScriptEnv::admin(Arc::clone(&storage) as Arc<dyn Storage>));
        std::thread::sleep(Duration::from_millis(1500));
        assert_eq!(storage.calls.load(Ordering::SeqCst), 0, "must not fire early");
        std::thread::sleep(Duration::from_millis(1000));
        assert_eq!(storage.calls.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }

    #[test]
    fn unscheduled_script_adds_no_workers() {
        let script = Arc::new(
            Script::new(&json!({"name": "plain", "steps": ["only"]})).unwrap(),
        );
        let storage = Arc::new(CountingStorage {
            calls: AtomicUsize::new(0),
        });
        let mut scheduler = Scheduler::new();
        scheduler.add(script, ScriptEnv::admin(storage as Arc<dyn Storage>));
        assert!(scheduler.workers.is_empty());
        scheduler.shutdown();
    }
}
