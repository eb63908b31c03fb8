use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use crate::{error::Error, payload::AgentTask};

/// Lifecycle of a queued agent task. The numbers follow HTTP status classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum TaskStatusCode {
    Queued = 0,
    Dispatched = 100,
    Success = 200,
    Failed = 400,
    // The agent registered again before reporting back
    Lost = 500,
}

impl std::fmt::Display for TaskStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "Queued"),
            Self::Dispatched => write!(f, "Dispatched"),
            Self::Success => write!(f, "Success"),
            Self::Failed => write!(f, "Failed"),
            Self::Lost => write!(f, "Lost"),
        }
    }
}

use diesel::prelude::{Insertable, Queryable, QueryableByName, Selectable};
use std::time::SystemTime;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::db::schema::agents)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Agent {
    pub id: i32,
    pub sn: String,
    pub key: String,
    pub enabled: bool,
    pub last_seen: Option<SystemTime>,
    pub updated_at: SystemTime,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::db::schema::agents)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewAgent {
    pub sn: String,
    pub key: String,
    pub enabled: bool,
    pub updated_at: SystemTime,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = crate::db::schema::tasks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Task {
    pub id: i64,
    pub uuid: String,
    pub agent_id: i32,
    pub payload: String,
    pub status_code: i32,
    pub result: Option<String>,
    pub date_queued: SystemTime,
    pub date_dispatched: Option<SystemTime>,
    pub date_finished: Option<SystemTime>,
}

impl Task {
    pub fn status(&self) -> Option<TaskStatusCode> {
        TaskStatusCode::from_i32(self.status_code)
    }

    /// Decodes the stored payload back into the task sent to the agent.
    pub fn agent_task(&self) -> Result<AgentTask, Error> {
        serde_json::from_str(&self.payload).map_err(|e| {
            log::error!("Could not decode payload of task {}: {e}", self.id);
            Error::from(e)
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::db::schema::tasks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewTask {
    pub uuid: String,
    pub agent_id: i32,
    pub payload: String,
    pub status_code: i32,
    pub date_queued: SystemTime,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::db::schema::logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Log {
    pub id: i64,
    pub agent_id: i32,
    pub ip: String,
    pub task: String,
    pub message: String,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::db::schema::logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewLog {
    pub agent_id: i32,
    pub ip: String,
    pub task: String,
    pub message: String,
    pub created_at: SystemTime,
}
