// Connection, schema setup and the queries used by the master and the CLI

use diesel::{
    self, connection::SimpleConnection, Connection, ExpressionMethods, OptionalExtension,
    PgConnection, QueryDsl, RunQueryDsl, SelectableHelper,
};
use std::time::SystemTime;

use crate::{
    db::models::{Agent, Log, NewAgent, NewLog, NewTask, Task, TaskStatusCode},
    error::Error,
    key::Key,
    payload::AgentTask,
    settings::Settings,
};

const SCHEMA: &str = include_str!("schema.sql");

pub struct DatabaseConnection {
    pub conn: PgConnection,
}

impl DatabaseConnection {
    /// Connects to the database using the postgres settings
    pub fn connect(s: &Settings) -> Result<Self, Error> {
        log::debug!(
            "Connecting to postgres database {} at {}:{}",
            s.postgres.dbname,
            s.postgres.host,
            s.postgres.port
        );
        let conn = PgConnection::establish(&s.postgres_url()).map_err(|e| {
            log::error!("Failed to connect to database: {e}");
            Error::from(e)
        })?;

        log::debug!("Connection established.");
        Ok(DatabaseConnection { conn })
    }

    /// Creates missing tables. Safe to run against an initialized database.
    pub fn setup_schema(&mut self) -> Result<(), Error> {
        log::info!("Setting up database schema");
        self.conn.batch_execute(SCHEMA).map_err(|e| {
            log::error!("Could not set up database schema: {e}");
            Error::from(e)
        })
    }

    /// All agents, sorted by name.
    pub fn list_agents(&mut self) -> Result<Vec<Agent>, Error> {
        use crate::db::schema::agents::{self, sn};

        agents::table
            .select(Agent::as_select())
            .order(sn.asc())
            .load(&mut self.conn)
            .map_err(|e: diesel::result::Error| {
                log::error!("Could not get agents from database: {e}");
                Error::from(e)
            })
    }

    pub fn agent_by_sn(&mut self, agent_sn: &str) -> Result<Option<Agent>, Error> {
        use crate::db::schema::agents::{self, sn};

        agents::table
            .select(Agent::as_select())
            .filter(sn.eq(agent_sn))
            .first(&mut self.conn)
            .optional()
            .map_err(|e: diesel::result::Error| {
                log::error!("Could not get agent {agent_sn} from database: {e}");
                Error::from(e)
            })
    }

    /// Stores a newly registered agent. It stays disabled until an operator
    /// accepts it.
    pub fn add_agent(&mut self, agent_sn: &str, key: &Key) -> Result<Agent, Error> {
        use crate::db::schema::agents;

        let now = SystemTime::now();
        let agent = NewAgent {
            sn: agent_sn.to_string(),
            key: key.to_string(),
            enabled: false,
            updated_at: now,
            created_at: now,
        };
        diesel::insert_into(agents::table)
            .values(&agent)
            .returning(Agent::as_returning())
            .get_result(&mut self.conn)
            .map_err(|e: diesel::result::Error| {
                log::error!("Could not insert agent {agent_sn} into database: {e}");
                Error::from(e)
            })
    }

    /// Returns false if there is no agent with that name.
    pub fn set_agent_enabled(&mut self, agent_sn: &str, enable: bool) -> Result<bool, Error> {
        use crate::db::schema::agents;

        diesel::update(agents::table)
            .filter(agents::sn.eq(agent_sn))
            .set((
                agents::enabled.eq(enable),
                agents::updated_at.eq(SystemTime::now()),
            ))
            .execute(&mut self.conn)
            .map(|n| n > 0)
            .map_err(|e| {
                log::error!("Could not set enabled={enable} for agent {agent_sn}: {e}");
                Error::from(e)
            })
    }

    /// Removes an agent together with its tasks and logs. Returns false if
    /// there is no agent with that name.
    pub fn delete_agent(&mut self, agent_sn: &str) -> Result<bool, Error> {
        use crate::db::schema::agents;

        diesel::delete(agents::table.filter(agents::sn.eq(agent_sn)))
            .execute(&mut self.conn)
            .map(|n| n > 0)
            .map_err(|e| {
                log::error!("Could not delete agent {agent_sn}: {e}");
                Error::from(e)
            })
    }

    /// Records that the agent was heard from just now.
    pub fn touch_agent(&mut self, agent_id: i32) -> Result<(), Error> {
        use crate::db::schema::agents;

        diesel::update(agents::table)
            .filter(agents::id.eq(agent_id))
            .set(agents::last_seen.eq(SystemTime::now()))
            .execute(&mut self.conn)
            .map(|_| ())
            .map_err(|e| {
                log::error!("Could not update last_seen for agent {agent_id}: {e}");
                Error::from(e)
            })
    }

    /// Queues a copy of `task` for the agent. Returns the row id.
    pub fn queue_task(&mut self, agent_id: i32, task: &AgentTask) -> Result<i64, Error> {
        use crate::db::schema::tasks;

        let row = NewTask {
            uuid: task.id.to_string(),
            agent_id,
            payload: serde_json::to_string(task)?,
            status_code: TaskStatusCode::Queued as i32,
            date_queued: SystemTime::now(),
        };
        let ret: Task = diesel::insert_into(tasks::table)
            .values(&row)
            .returning(Task::as_returning())
            .get_result(&mut self.conn)
            .map_err(|e: diesel::result::Error| {
                log::error!("Could not queue task {} for agent {agent_id}: {e}", task.id);
                Error::from(e)
            })?;

        Ok(ret.id)
    }

    /// Claims the oldest queued task of the agent, marking it dispatched.
    ///
    /// Returns None if nothing is queued. Concurrent polls never receive the
    /// same row since locked rows are skipped.
    pub fn try_dispatch_task(&mut self, agent_id: i32) -> Result<Option<Task>, Error> {
        use diesel::sql_types::{Integer, Timestamp};

        // https://www.postgresql.org/docs/17/sql-select.html#SQL-FOR-UPDATE-SHARE
        let dispatched: Vec<Task> = diesel::sql_query(
            "
            WITH next_task AS (
                SELECT t2.id FROM tasks AS t2
                WHERE
                    t2.agent_id = $1
                AND
                    t2.status_code = $2
                ORDER BY t2.date_queued ASC, t2.id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks t
            SET status_code = $3, date_dispatched = $4
              FROM next_task AS nt
              WHERE t.id = nt.id

            RETURNING t.*;
            ",
        )
        .bind::<Integer, _>(agent_id)
        .bind::<Integer, _>(TaskStatusCode::Queued as i32)
        .bind::<Integer, _>(TaskStatusCode::Dispatched as i32)
        .bind::<Timestamp, _>(SystemTime::now())
        .get_results(&mut self.conn)
        .map_err(|e: diesel::result::Error| {
            log::error!("Could not dispatch a task for agent {agent_id}: {e}");
            Error::from(e)
        })?;

        Ok(dispatched.into_iter().next())
    }

    /// Stores the result of a dispatched task.
    ///
    /// Returns None if that agent has no dispatched task with this uuid.
    pub fn finish_task(
        &mut self,
        task_uuid: &str,
        agent_id: i32,
        success: bool,
        result: &str,
    ) -> Result<Option<Task>, Error> {
        use crate::db::schema::tasks;

        let status = if success {
            TaskStatusCode::Success
        } else {
            TaskStatusCode::Failed
        };
        diesel::update(tasks::table)
            .filter(tasks::uuid.eq(task_uuid))
            .filter(tasks::agent_id.eq(agent_id))
            .filter(tasks::status_code.eq(TaskStatusCode::Dispatched as i32))
            .set((
                tasks::status_code.eq(status as i32),
                tasks::result.eq(result),
                tasks::date_finished.eq(SystemTime::now()),
            ))
            .returning(Task::as_returning())
            .get_result(&mut self.conn)
            .optional()
            .map_err(|e| {
                log::error!("Could not finish task {task_uuid} of agent {agent_id}: {e}");
                Error::from(e)
            })
    }

    /// Marks tasks that were handed to the agent but never reported as lost.
    /// Called when an agent registers again. Returns the number of rows.
    pub fn requeue_lost(&mut self, agent_id: i32) -> Result<usize, Error> {
        use crate::db::schema::tasks;

        diesel::update(tasks::table)
            .filter(tasks::agent_id.eq(agent_id))
            .filter(tasks::status_code.eq(TaskStatusCode::Dispatched as i32))
            .set((
                tasks::status_code.eq(TaskStatusCode::Lost as i32),
                tasks::date_finished.eq(SystemTime::now()),
            ))
            .execute(&mut self.conn)
            .map_err(|e| {
                log::error!("Could not mark lost tasks of agent {agent_id}: {e}");
                Error::from(e)
            })
    }

    /// The latest queued tasks together with the name of their agent, newest
    /// first.
    pub fn recent_tasks(&mut self, limit: i64) -> Result<Vec<(Task, String)>, Error> {
        use crate::db::schema::{agents, tasks};

        tasks::table
            .inner_join(agents::table)
            .select((Task::as_select(), agents::sn))
            .order((tasks::date_queued.desc(), tasks::id.desc()))
            .limit(limit)
            .load(&mut self.conn)
            .map_err(|e: diesel::result::Error| {
                log::error!("Could not get recent tasks from database: {e}");
                Error::from(e)
            })
    }

    pub fn add_log(
        &mut self,
        agent_id: i32,
        ip: &str,
        task: &str,
        message: &str,
    ) -> Result<(), Error> {
        use crate::db::schema::logs;

        let row = NewLog {
            agent_id,
            ip: ip.to_string(),
            task: task.to_string(),
            message: message.to_string(),
            created_at: SystemTime::now(),
        };
        diesel::insert_into(logs::table)
            .values(&row)
            .execute(&mut self.conn)
            .map(|_| ())
            .map_err(|e| {
                log::error!("Could not insert log for agent {agent_id}: {e}");
                Error::from(e)
            })
    }

    /// Logs of the agent, newest first.
    pub fn logs_by_agent(&mut self, agent_id: i32, limit: Option<i64>) -> Result<Vec<Log>, Error> {
        use crate::db::schema::logs;

        let base_q = logs::table
            .select(Log::as_select())
            .filter(logs::agent_id.eq(agent_id))
            .order((logs::created_at.desc(), logs::id.desc()));

        let q_result = match limit {
            Some(l) => base_q.limit(l).load(&mut self.conn),
            None => base_q.load(&mut self.conn),
        };

        q_result.map_err(|e: diesel::result::Error| {
            log::error!("Could not get logs of agent {agent_id}: {e}");
            Error::from(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;

    #[test]
    fn test_schema_is_idempotent() {
        let creates = SCHEMA.matches("CREATE TABLE").count();
        assert_that!(creates).is_equal_to(3);
        assert_that!(SCHEMA.matches("CREATE TABLE IF NOT EXISTS").count()).is_equal_to(creates);
        assert_that!(SCHEMA.matches("CREATE INDEX IF NOT EXISTS").count())
            .is_equal_to(SCHEMA.matches("CREATE INDEX").count());
    }
}
