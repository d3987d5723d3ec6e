//! Encoding and tolerant parsing of protocol lines.

use serde_json::{Value, json};

use super::types::*;
use crate::error::{Error, Result};
use crate::work::{FailureKind, WorkResult};

/// Parse a single line written by a worker.
pub fn parse_worker_line(line: &str) -> Result<WorkerMessage> {
    let raw: Value = serde_json::from_str(line)?;
    let msg_type = raw
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Protocol("Missing 'type' field".into()))?;

    match msg_type {
        "ready" => Ok(WorkerMessage::Ready(serde_json::from_value(raw.clone())?)),
        "result" => parse_result(&raw),
        _ => Ok(WorkerMessage::Unknown {
            msg_type: msg_type.to_string(),
            payload: raw.clone(),
        }),
    }
}

fn parse_result(raw: &Value) -> Result<WorkerMessage> {
    let id = raw
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Protocol("Result without 'id'".into()))?
        .to_string();

    // Workers can only report execution faults; protocol faults are the
    // host's judgement.
    let outcome = match raw.get("status").and_then(|v| v.as_str()) {
        Some("success") => WorkResult::success(raw.get("value").cloned().unwrap_or(Value::Null)),
        Some("failure") => WorkResult::execution_failure(
            raw.get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("worker reported a failure without a message"),
        ),
        Some(other) => {
            return Err(Error::Protocol(format!("Unknown result status '{other}'")));
        }
        None => return Err(Error::Protocol("Result without 'status'".into())),
    };

    Ok(WorkerMessage::Result(ExecuteResult { id, outcome }))
}

/// Parse a single line written by the host.
pub fn parse_host_line(line: &str) -> Result<HostMessage> {
    serde_json::from_str(line).map_err(|e| Error::Protocol(e.to_string()))
}

/// Encode a worker message as one line (without the trailing newline).
pub fn encode(message: &WorkerMessage) -> String {
    let value = match message {
        WorkerMessage::Ready(ready) => json!({
            "type": "ready",
            "pid": ready.pid,
            "kind": ready.kind,
        }),
        WorkerMessage::Result(ExecuteResult { id, outcome }) => match outcome {
            WorkResult::Success { value } => json!({
                "type": "result",
                "id": id,
                "status": "success",
                "value": value,
            }),
            WorkResult::Failure(failure) => {
                debug_assert_eq!(failure.kind, FailureKind::Execution);
                json!({
                    "type": "result",
                    "id": id,
                    "status": "failure",
                    "message": failure.message,
                })
            }
        },
        WorkerMessage::Unknown { payload, .. } => payload.clone(),
    };
    value.to_string()
}
