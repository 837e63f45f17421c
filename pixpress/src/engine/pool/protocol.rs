//! Messages exchanged with execution units.
//!
//! Process units carry these as newline-delimited JSON over stdin/stdout;
//! thread units pass them over channels unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::CodecRegistry;

/// One execution request, correlated by `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRequest {
    pub request_id: String,
    pub job_id: String,
    pub task_kind: String,
    pub payload: Value,
}

/// Message sent by a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitReply {
    /// The unit can accept requests.
    Ready,
    Progress {
        request_id: String,
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
    },
    Result {
        request_id: String,
        data: Value,
    },
    Error {
        request_id: String,
        message: String,
    },
}

impl UnitReply {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            UnitReply::Ready => None,
            UnitReply::Progress { request_id, .. }
            | UnitReply::Result { request_id, .. }
            | UnitReply::Error { request_id, .. } => Some(request_id),
        }
    }
}

/// Run one request against the registry inside a unit.
///
/// Progress is reported through `emit`; the returned reply is the final
/// `Result` or `Error` message.
pub fn execute_request(
    registry: &CodecRegistry,
    request: UnitRequest,
    mut emit: impl FnMut(UnitReply),
) -> UnitReply {
    let request_id = request.request_id;
    let outcome = registry.execute(&request.task_kind, &request.payload, &mut |stage, percent| {
        emit(UnitReply::Progress {
            request_id: request_id.clone(),
            stage: stage.to_string(),
            percent,
        })
    });

    match outcome {
        Ok(data) => UnitReply::Result { request_id, data },
        Err(e) => UnitReply::Error {
            request_id,
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_wire_format() {
        let ready = serde_json::to_string(&UnitReply::Ready).unwrap();
        assert_eq!(ready, r#"{"type":"ready"}"#);

        let parsed: UnitReply =
            serde_json::from_str(r#"{"type":"progress","request_id":"r1","stage":"reading"}"#)
                .unwrap();
        assert_eq!(
            parsed,
            UnitReply::Progress {
                request_id: "r1".into(),
                stage: "reading".into(),
                percent: None,
            }
        );
        assert_eq!(parsed.request_id(), Some("r1"));
    }

    #[test]
    fn test_execute_unknown_kind_replies_error() {
        let registry = CodecRegistry::new();
        let request = UnitRequest {
            request_id: "r1".into(),
            job_id: "j1".into(),
            task_kind: "gif".into(),
            payload: json!({}),
        };

        let reply = execute_request(&registry, request, |_| {});
        assert_eq!(
            reply,
            UnitReply::Error {
                request_id: "r1".into(),
                message: "Unsupported task kind: gif".into(),
            }
        );
    }
}
