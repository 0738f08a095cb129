use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Payload for an event about one task: `task_id` first, then the fields of
/// `fields` when it is a JSON object.
pub fn task_payload(task_id: &str, fields: Value) -> EventPayload {
    let mut payload = EventPayload::new();
    payload.insert("task_id".to_string(), Value::String(task_id.to_string()));
    payload.extend(object_fields(fields));
    payload
}

/// Fields of a JSON object; anything else yields an empty payload.
pub fn object_fields(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}

/// JSONL event log for one CLI run.
///
/// Every line carries `type`, `run_id`, a per-run `seq` and `ts`, followed by
/// the caller's fields. Poll sessions running on different threads share one
/// writer through clones; `seq` gives the order the lines were appended in.
#[derive(Debug, Clone)]
pub struct EventWriter {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    run_id: String,
    next_seq: Mutex<u64>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                path: path.into(),
                run_id: run_id.into(),
                next_seq: Mutex::new(1),
            }),
        }
    }

    pub fn for_new_run(path: impl Into<PathBuf>) -> Self {
        Self::new(path, format!("run-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn run_id(&self) -> &str {
        &self.shared.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        if let Some(dir) = self.shared.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        // seq is assigned and the line appended under one lock so seq order
        // matches file order.
        let mut next_seq = self
            .shared
            .next_seq
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut event = Map::new();
        event.insert("type".to_string(), Value::from(event_type));
        event.insert("run_id".to_string(), Value::from(self.shared.run_id.as_str()));
        event.insert("seq".to_string(), Value::from(*next_seq));
        event.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        event.extend(payload);

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.shared.path)
            .and_then(|mut file| file.write_all(&line))
            .with_context(|| format!("failed to append to {}", self.shared.path.display()))?;
        *next_seq += 1;

        Ok(Value::Object(event))
    }
}

/// Parses an events file back into one value per line, skipping blank lines.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<Value>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("invalid event on line {} of {}", idx + 1, path.display()))
        })
        .collect()
}
