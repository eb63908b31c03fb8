// Builds agent tasks from the task bundles under `<etc>/tasks` and queues
// them for the agents of a group.
//
// A bundle directory holds a `readme.json` listing its steps. The readme is
// itself rendered with the group environment before it is parsed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::{
    db::conn::DatabaseConnection,
    error::Error,
    payload::{AgentTask, Payload},
    settings::Settings,
    shell::shell_quote,
    template::{self, TEMPLATE_EXT},
};

pub const README: &str = "readme.json";
const ROOT: &str = "root";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Group {
    pub agents: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl Group {
    pub fn load(etc: &Path, name: &str) -> Result<Self, Error> {
        let path = etc.join("groups").join(format!("{name}.toml"));
        log::debug!("load group from {}", path.display());
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| Error::from(format!("Could not read group {}: {e}", path.display())))?;
        toml::from_str(&contents).map_err(Error::from)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub enum TaskSpec {
    Script {
        user: String,
        file: String,
    },
    Upload {
        source: String,
        target: String,
        owner: Option<String>,
        group: Option<String>,
        mode: Option<u32>,
    },
}

/// `<bundle>/<file>` if it exists, otherwise its rendered `.hbs` template.
fn read_or_render<V: Serialize>(path: &Path, env: &V) -> Result<Vec<u8>, Error> {
    if path.exists() {
        log::info!("read file {}", path.display());
        return Ok(std::fs::read(path)?);
    }
    let mut tpl = path.as_os_str().to_owned();
    tpl.push(format!(".{TEMPLATE_EXT}"));
    let tpl = PathBuf::from(tpl);
    log::info!("render file {}", tpl.display());
    Ok(template::render_file(&tpl, env)?.into_bytes())
}

/// Every regular file below `dir`, sorted.
fn walk(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn root_shell(script: String) -> Payload {
    Payload::Shell {
        user: ROOT.to_string(),
        script,
    }
}

impl TaskSpec {
    /// Expands one step of a bundle into payloads.
    pub fn payload<V: Serialize>(&self, bundle: &Path, env: &V) -> Result<Vec<Payload>, Error> {
        let mut items = Vec::new();
        match self {
            TaskSpec::Script { user, file } => {
                let script = String::from_utf8(read_or_render(&bundle.join(file), env)?)?;
                items.push(Payload::Shell {
                    user: user.to_string(),
                    script,
                });
            }
            TaskSpec::Upload {
                source,
                target,
                owner,
                group,
                mode,
            } => {
                let source = bundle.join(source);
                if source.is_dir() {
                    for file in walk(&source)? {
                        let rel = file.strip_prefix(&source).map_err(|e| {
                            Error::from(format!("{} outside {}: {e}", file.display(), source.display()))
                        })?;
                        items.push(Payload::File {
                            path: Path::new(target).join(rel).display().to_string(),
                            body: std::fs::read(&file)?,
                        });
                    }
                } else {
                    items.push(Payload::File {
                        path: target.to_string(),
                        body: read_or_render(&source, env)?,
                    });
                }

                // Ownership and mode apply to the target as a whole.
                let recursive = if source.is_dir() { "-R " } else { "" };
                let quoted = shell_quote(target);
                if let Some(owner) = owner {
                    let owner = shell_quote(owner);
                    items.push(root_shell(format!("chown {recursive}{owner} {quoted}")));
                }
                if let Some(group) = group {
                    let group = shell_quote(group);
                    items.push(root_shell(format!("chgrp {recursive}{group} {quoted}")));
                }
                if let Some(mode) = mode {
                    items.push(root_shell(format!("chmod {recursive}{mode:o} {quoted}")));
                }
            }
        }
        Ok(items)
    }
}

/// Builds the task of bundle `<etc>/tasks/<name>` for the given environment.
pub fn build_task<V: Serialize>(etc: &Path, name: &str, env: &V) -> Result<AgentTask, Error> {
    let bundle = etc.join("tasks").join(name);
    log::info!("load task from {}", bundle.display());

    let readme = template::render_file(bundle.join(README), env)?;
    let specs: Vec<TaskSpec> = serde_json::from_str(&readme).map_err(|e| {
        log::error!("Invalid {README} in {}: {e}", bundle.display());
        Error::from(e)
    })?;

    let mut payload = Vec::new();
    for it in specs.iter() {
        payload.extend(it.payload(&bundle, env)?);
    }
    Ok(AgentTask::new(payload))
}

/// Queues task bundle `task` for every enabled agent of `group`. Returns the
/// ids of the queued rows.
pub fn publish(
    settings: &Settings,
    conn: &mut DatabaseConnection,
    group: &str,
    task: &str,
) -> Result<Vec<i64>, Error> {
    let etc = Path::new(&settings.etc_dir);
    let group_cfg = Group::load(etc, group)?;
    let agent_task = build_task(etc, task, &group_cfg.environment)?;
    log::debug!("{agent_task}");

    let mut queued = Vec::new();
    for sn in group_cfg.agents.iter() {
        match conn.agent_by_sn(sn)? {
            Some(agent) if agent.enabled => {
                let id = conn.queue_task(agent.id, &agent_task)?;
                log::info!("queued task {} for agent {sn}", agent_task.id);
                queued.push(id);
            }
            Some(_) => log::warn!("agent {sn} isn't enabled"),
            None => log::warn!("agent {sn} isn't registered"),
        }
    }
    Ok(queued)
}
