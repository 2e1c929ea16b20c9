//! Minimal end-to-end tour: an in-memory model, a dispatcher, and a script
//! that seeds rows then reads them back.
//!
//! Run with: `cargo run --example run_script -p trellis-core`

use serde_json::json;
use std::sync::Arc;
use trellis_core::{Dispatcher, MemoryModel, Script, ScriptEnv, Storage};

fn main() {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register_model(Arc::new(MemoryModel::new(
        "Task",
        json!({
            "properties": {
                "id": {"type": "string"},
                "title": {"type": "string"},
                "done": {"type": "boolean"}
            }
        }),
    )));
    let dispatcher = dispatcher.into_shared();

    let script = Script::new(&json!({
        "name": "seed-and-list",
        "steps": [
            {"query": "{createTask(title: \"write the docs\", done: false)}"},
            {"query": "{createTask(title: \"ship it\", done: false)}"},
            {"query": "{open: listTask(done: false) {id title}}", "resultProperty": "/tasks"},
            {"object": {"tasks": "/tasks/open", "total": {"get": "/tasks/open", "length": {}}}}
        ]
    }))
    .expect("script definition is valid");

    let env = ScriptEnv::admin(Arc::clone(&dispatcher) as Arc<dyn Storage>);
    let out = script.run(json!({}), &env).expect("script run succeeds");
    println!("{}", serde_json::to_string_pretty(&out).expect("state serializes"));
}
