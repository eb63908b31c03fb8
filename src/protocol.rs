use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{key::Key, payload::AgentTask};

/// Header carrying `Key::sign` of the raw request body.
pub const SIGNATURE_HEADER: &str = "X-Axis-Signature";

/// Requests sent from an agent to the master, one per endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub enum Request {
    Register {
        host: String,
        finger: Key,
    },
    Poll {
        host: String,
    },
    Report {
        host: String,
        task: Uuid,
        success: bool,
        result: String,
    },
}

impl Request {
    pub fn host(&self) -> &str {
        match self {
            Request::Register { host, .. } | Request::Poll { host } | Request::Report { host, .. } => {
                host
            }
        }
    }

    /// Path of the master endpoint handling this request.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Request::Register { .. } => "/api/register",
            Request::Poll { .. } => "/api/poll",
            Request::Report { .. } => "/api/report",
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Request::Register { host, finger } => {
                write!(f, "register {host} {}", finger.fingerprint())
            }
            Request::Poll { host } => write!(f, "poll {host}"),
            Request::Report {
                host, task, result, ..
            } => write!(f, "report {host}@{task}\n{result}"),
        }
    }
}

/// Answer to a poll. `task` is empty when nothing is queued for the agent.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PollResponse {
    pub task: Option<AgentTask>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Ack {
    pub code: u16,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;

    #[test]
    fn test_display() {
        let key = Key([0u8; 32]);
        let fingerprint = key.fingerprint();
        let req = Request::Register {
            host: "web-01".to_string(),
            finger: key,
        };
        // The key is a secret and only its fingerprint is shown.
        assert_that!(req.to_string()).is_equal_to(format!("register web-01 {fingerprint}"));
        assert_that!(req.to_string().contains(&"00".repeat(32))).is_false();

        let id = Uuid::nil();
        let req = Request::Report {
            host: "web-01".to_string(),
            task: id,
            success: true,
            result: "OK".to_string(),
        };
        assert_that!(req.to_string())
            .is_equal_to(format!("report web-01@{}\nOK", Uuid::nil()));
        assert_that!(req.endpoint()).is_equal_to("/api/report");
        assert_that!(req.host()).is_equal_to("web-01");
    }

    #[test]
    fn test_wire_format() {
        let req = Request::Poll {
            host: "db-01".to_string(),
        };
        assert_that!(serde_json::to_string(&req).unwrap())
            .is_equal_to(r#"{"poll":{"host":"db-01"}}"#.to_string());

        let empty: PollResponse = serde_json::from_str(r#"{"task":null}"#).unwrap();
        assert_that!(empty.task.is_none()).is_true();
    }
}
