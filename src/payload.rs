// Units of work shipped from the master to agents.

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::Error,
    settings::ShellSettings,
    utils::{syscommand_timeout, SyscommandSettings},
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentTask {
    pub id: Uuid,
    pub payload: Vec<Payload>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Payload {
    Shell { user: String, script: String },
    File { path: String, body: Vec<u8> },
}

/// Outcome of an agent task, sent back in a report.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub success: bool,
    pub result: String,
}

impl Payload {
    /// Runs the payload and returns its output.
    pub fn execute(&self, shell: &ShellSettings) -> Result<String, Error> {
        match self {
            Payload::Shell { user, script } => {
                log::info!("run as {user}\n{script}");
                let out = syscommand_timeout(
                    ["su", "-", user.as_str(), "-c", script.as_str()],
                    SyscommandSettings::from_shell(shell),
                )?;
                if out.code != 0 {
                    return Error::err_string(format!(
                        "shell script return {}:\n{}",
                        out.code,
                        out.combined()
                    ));
                }
                Ok(out.combined())
            }
            Payload::File { path, body } => {
                log::info!("write to file {path}");
                if let Some(d) = Path::new(path).parent() {
                    if !d.as_os_str().is_empty() && !d.exists() {
                        log::info!("{} does not exist, creating it", d.display());
                        std::fs::create_dir_all(d)?;
                    }
                }
                let mut file = File::create(path)?;
                file.write_all(body)?;
                Ok("OK".to_string())
            }
        }
    }
}

impl AgentTask {
    pub fn new(payload: Vec<Payload>) -> Self {
        AgentTask {
            id: Uuid::new_v4(),
            payload,
        }
    }

    /// Runs every payload in order. A failing payload is recorded and the
    /// remaining ones still run.
    pub fn execute_all(&self, shell: &ShellSettings) -> TaskReport {
        let mut success = true;
        let mut steps: Vec<json::JsonValue> = vec![];
        for (i, it) in self.payload.iter().enumerate() {
            let mut step = json::object! {
                index: i,
                ok: true,
            };
            match it.execute(shell) {
                Ok(output) => {
                    step["output"] = output.into();
                }
                Err(e) => {
                    log::error!("payload {i} of task {} failed: {e}", self.id);
                    success = false;
                    step["ok"] = false.into();
                    step["output"] = e.to_string().into();
                }
            }
            steps.push(step);
        }

        let summary = json::object! {
            task: self.id.to_string(),
            success: success,
            steps: steps,
        };
        TaskReport {
            success,
            result: summary.dump(),
        }
    }
}

impl fmt::Display for AgentTask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "=== begin task {} ===", self.id)?;
        for it in self.payload.iter() {
            writeln!(f, "------")?;
            writeln!(f, "{it}")?;
        }
        write!(f, "=== end task ===")
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Payload::Shell { user, script } => write!(f, "shell {user}\n{script}"),
            Payload::File { path, body } => write!(f, "file {path}, {} bytes", body.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;

    #[test]
    fn test_display() {
        let task = AgentTask::new(vec![
            Payload::Shell {
                user: "root".to_string(),
                script: "uptime".to_string(),
            },
            Payload::File {
                path: "/etc/motd".to_string(),
                body: b"hello".to_vec(),
            },
        ]);
        let text = task.to_string();
        assert_that!(text.starts_with(&format!("=== begin task {} ===", task.id))).is_true();
        assert_that!(text.as_str()).contains("shell root\nuptime");
        assert_that!(text.as_str()).contains("file /etc/motd, 5 bytes");
        assert_that!(text.as_str()).ends_with("=== end task ===");
    }

    #[test]
    fn test_file_payload_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.txt");
        let payload = Payload::File {
            path: path.display().to_string(),
            body: b"first".to_vec(),
        };
        assert_that!(payload.execute(&ShellSettings::default())).has_value("OK".to_string());

        // An existing file is truncated.
        let payload = Payload::File {
            path: path.display().to_string(),
            body: b"2".to_vec(),
        };
        assert_that!(payload.execute(&ShellSettings::default())).is_ok();
        assert_that!(std::fs::read_to_string(&path).unwrap()).is_equal_to("2");
    }

    #[test]
    fn test_execute_all_continues_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.txt");
        let task = AgentTask::new(vec![
            // A directory cannot be opened as a file.
            Payload::File {
                path: dir.path().display().to_string(),
                body: vec![],
            },
            Payload::File {
                path: good.display().to_string(),
                body: b"ok".to_vec(),
            },
        ]);
        let report = task.execute_all(&ShellSettings::default());
        assert_that!(report.success).is_false();
        assert_that!(good.exists()).is_true();

        let parsed = json::parse(&report.result).unwrap();
        assert_that!(parsed["steps"].len()).is_equal_to(2);
        assert_that!(parsed["steps"][0]["ok"].as_bool()).is_equal_to(Some(false));
        assert_that!(parsed["steps"][1]["ok"].as_bool()).is_equal_to(Some(true));
    }

    #[test]
    fn test_json_shape() {
        let payload = Payload::Shell {
            user: "www".to_string(),
            script: "ls".to_string(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_that!(value["shell"]["user"].as_str()).is_equal_to(Some("www"));
    }
}
