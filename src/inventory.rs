// Push-mode jobs. An inventory directory holds three kinds of TOML files:
//
//   jobs/<name>.toml     a `jobs` array, each job naming groups, hosts and tasks
//   groups/<name>.toml   hosts of the group and their shared vars
//   hosts/<name>.toml    optional per-host vars
//
// Every task of a job runs on every resolved host, in order.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    settings::{Settings, ShellSettings},
    shell::{shell_quote, Auth, Command, Local, Ssh},
    template,
};

pub const CONFIG_EXT: &str = "toml";

pub type Vars = BTreeMap<String, String>;

fn config_path(inventory: &Path, kind: &str, name: &str) -> PathBuf {
    // Host names may contain dots, so the extension is appended, not set.
    inventory.join(kind).join(format!("{name}.{CONFIG_EXT}"))
}

fn read_config<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, Error> {
    log::debug!("load {}", path.display());
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::from(format!("Could not read {}: {e}", path.display())))?;
    toml::from_str(&contents).map_err(Error::from)
}

/// Returns `base` overlaid with `over`. Keys from `over` win.
fn merge(base: &Vars, over: &Vars) -> Vars {
    let mut vars = base.clone();
    vars.extend(over.iter().map(|(k, v)| (k.clone(), v.clone())));
    vars
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct JobFile {
    jobs: Vec<Job>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Job {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub vars: Vars,
}

impl Job {
    /// Loads every job in `jobs/<name>.toml`.
    pub fn load(inventory: &Path, name: &str) -> Result<Vec<Job>, Error> {
        let file: JobFile = read_config(&config_path(inventory, "jobs", name))?;
        Ok(file.jobs)
    }

    /// Hosts this job applies to together with their effective vars. Hosts
    /// from groups come first, then the ones listed directly.
    pub fn targets(&self, inventory: &Path) -> Result<Vec<(String, Vars)>, Error> {
        let mut targets = Vec::new();
        for group in &self.groups {
            targets.extend(Group::load(inventory, group, &self.vars)?);
        }
        for host in &self.hosts {
            targets.push(Host::load(inventory, host, &self.vars)?);
        }
        Ok(targets)
    }

    /// Runs every task on every host, stopping at the first error. Rendered
    /// templates are staged in `settings.temp_dir`.
    pub fn run(&self, inventory: &Path, settings: &Settings) -> Result<(), Error> {
        log::info!("run job {}", self.name);
        let temp_dir = Path::new(&settings.temp_dir);
        for (host, vars) in self.targets(inventory)? {
            let executor = executor(&host, &vars, &settings.shell)?;
            for task in &self.tasks {
                log::info!("{}: {}", executor, task);
                Host::run(executor.as_ref(), inventory, temp_dir, task, &vars)
                    .inspect_err(|e| log::error!("{} failed on {}: {}", task, executor, e))?;
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Group {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub vars: Vars,
}

impl Group {
    pub fn load(inventory: &Path, name: &str, parent: &Vars) -> Result<Vec<(String, Vars)>, Error> {
        let group: Group = read_config(&config_path(inventory, "groups", name))?;
        let vars = merge(parent, &group.vars);
        group
            .hosts
            .iter()
            .map(|host| Host::load(inventory, host, &vars))
            .collect()
    }
}

pub struct Host;

impl Host {
    /// The host file is optional. Without one the host inherits `parent`.
    /// When present it is a flat table of vars, e.g. `ssh_user = "deploy"`.
    pub fn load(inventory: &Path, name: &str, parent: &Vars) -> Result<(String, Vars), Error> {
        let path = config_path(inventory, "hosts", name);
        if !path.exists() {
            return Ok((name.to_string(), parent.clone()));
        }
        let vars: Vars = read_config(&path)?;
        Ok((name.to_string(), merge(parent, &vars)))
    }

    pub fn run(
        executor: &dyn Command,
        inventory: &Path,
        temp_dir: &Path,
        task: &Task,
        vars: &Vars,
    ) -> Result<(), Error> {
        match task {
            Task::Upload {
                remote,
                local,
                owner,
                group,
                mode,
            } => upload(executor, &inventory.join(local), remote, owner, group, mode),
            Task::Download {
                remote,
                local,
                owner,
                group,
                mode,
            } => {
                let local = inventory.join(local);
                executor.download(remote, &local)?;
                apply_local_permissions(&local, owner, group, mode)
            }
            Task::Template {
                remote,
                local,
                owner,
                group,
                mode,
            } => {
                let tmp = template::render_to_tempfile(inventory.join(local), vars, temp_dir)?;
                upload(executor, tmp.path(), remote, owner, group, mode)
            }
            Task::Shell { user, script } => executor.script(user.as_deref(), script),
        }
    }
}

fn upload(
    executor: &dyn Command,
    local: &Path,
    remote: &Path,
    owner: &Option<String>,
    group: &Option<String>,
    mode: &Option<String>,
) -> Result<(), Error> {
    executor.upload(local, remote)?;
    let remote = shell_quote(&remote.display().to_string());
    if let Some(owner) = owner {
        executor.script(None, &format!("chown {} {remote}", shell_quote(owner)))?;
    }
    if let Some(group) = group {
        executor.script(None, &format!("chgrp {} {remote}", shell_quote(group)))?;
    }
    if let Some(mode) = mode {
        executor.script(None, &format!("chmod {} {remote}", shell_quote(mode)))?;
    }
    Ok(())
}

#[cfg(unix)]
fn apply_local_permissions(
    local: &Path,
    owner: &Option<String>,
    group: &Option<String>,
    mode: &Option<String>,
) -> Result<(), Error> {
    use crate::utils::{syscommand_timeout, SyscommandSettings};
    use nix::unistd;
    use std::os::unix::fs::PermissionsExt;

    let uid = match owner {
        Some(name) => Some(
            unistd::User::from_name(name)
                .map_err(|e| Error::from(format!("Could not look up user {name}: {e}")))?
                .ok_or_else(|| Error::from(format!("No such user {name}")))?
                .uid,
        ),
        None => None,
    };
    let gid = match group {
        Some(name) => Some(
            unistd::Group::from_name(name)
                .map_err(|e| Error::from(format!("Could not look up group {name}: {e}")))?
                .ok_or_else(|| Error::from(format!("No such group {name}")))?
                .gid,
        ),
        None => None,
    };
    if uid.is_some() || gid.is_some() {
        unistd::chown(local, uid, gid)
            .map_err(|e| Error::from(format!("chown {}: {e}", local.display())))?;
    }
    if let Some(mode) = mode {
        match parse_octal_mode(mode) {
            Some(bits) => std::fs::set_permissions(local, std::fs::Permissions::from_mode(bits))?,
            // Symbolic modes are left to chmod(1)
            None => {
                let path = local.display().to_string();
                syscommand_timeout(
                    ["chmod", mode.as_str(), path.as_str()],
                    SyscommandSettings {
                        expected_code: Some(0),
                        ..Default::default()
                    },
                )?;
            }
        }
    }
    Ok(())
}

/// Parses `"644"` or `"0644"` style modes. Returns None for symbolic ones.
#[cfg(unix)]
fn parse_octal_mode(mode: &str) -> Option<u32> {
    if mode.is_empty() || !mode.chars().all(|c| ('0'..='7').contains(&c)) {
        return None;
    }
    u32::from_str_radix(mode, 8).ok().filter(|m| *m <= 0o7777)
}

#[cfg(not(unix))]
fn apply_local_permissions(
    _local: &Path,
    _owner: &Option<String>,
    _group: &Option<String>,
    _mode: &Option<String>,
) -> Result<(), Error> {
    Ok(())
}

/// Picks the executor for `host`. Loopback names run locally, everything
/// else goes over ssh using the `ssh_*` vars.
pub fn executor(host: &str, vars: &Vars, shell: &ShellSettings) -> Result<Box<dyn Command>, Error> {
    if host == "localhost" || host == "127.0.0.1" {
        return Ok(Box::new(Local::new(shell)));
    }

    let port = match vars.get("ssh_port") {
        Some(p) => Some(
            p.parse::<u16>()
                .map_err(|e| Error::from(format!("Invalid ssh_port \"{p}\" for {host}: {e}")))?,
        ),
        None => None,
    };
    let auth = match (vars.get("ssh_password"), vars.get("ssh_private_key")) {
        (Some(password), _) => Some(Auth::Password(password.clone())),
        (None, Some(key)) => Some(Auth::Key(PathBuf::from(key))),
        (None, None) => None,
    };
    Ok(Box::new(Ssh::new(
        host,
        port,
        vars.get("ssh_user").cloned(),
        auth,
        shell,
    )?))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Task {
    Upload {
        remote: PathBuf,
        local: PathBuf,
        owner: Option<String>,
        group: Option<String>,
        mode: Option<String>,
    },
    Download {
        remote: PathBuf,
        local: PathBuf,
        owner: Option<String>,
        group: Option<String>,
        mode: Option<String>,
    },
    Template {
        remote: PathBuf,
        local: PathBuf,
        owner: Option<String>,
        group: Option<String>,
        mode: Option<String>,
    },
    Shell {
        user: Option<String>,
        script: String,
    },
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Task::Upload { remote, local, .. } => {
                write!(f, "upload {} to {}", local.display(), remote.display())
            }
            Task::Download { remote, local, .. } => {
                write!(f, "download {} to {}", remote.display(), local.display())
            }
            Task::Template { remote, local, .. } => write!(
                f,
                "render template {} to {}",
                local.display(),
                remote.display()
            ),
            Task::Shell { user, script } => match user {
                Some(user) => write!(f, "run shell script {script} as user {user}"),
                None => write!(f, "run shell script {script}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;

    const JOBS: &str = r#"
[[jobs]]
name = "deploy"
groups = ["web"]
hosts = ["localhost"]

[jobs.vars]
env = "production"
port = "80"

[[jobs.tasks]]
type = "template"
local = "files/app.conf.hbs"
remote = "out/app.conf"
mode = "0640"

[[jobs.tasks]]
type = "shell"
script = "test -f out/app.conf"
"#;

    const WEB: &str = r#"
hosts = ["web-01", "web-02"]

[vars]
port = "8080"
"#;

    const WEB_01: &str = r#"
port = "9090"
ssh_user = "deploy"
"#;

    fn inventory() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["jobs", "groups", "hosts", "files"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        std::fs::write(dir.path().join("jobs/deploy.toml"), JOBS).unwrap();
        std::fs::write(dir.path().join("groups/web.toml"), WEB).unwrap();
        std::fs::write(dir.path().join("hosts/web-01.toml"), WEB_01).unwrap();
        dir
    }

    #[test]
    fn test_load_job() {
        let dir = inventory();
        let jobs = Job::load(dir.path(), "deploy").unwrap();
        assert_that!(jobs.len()).is_equal_to(1);
        assert_that!(jobs[0].tasks.len()).is_equal_to(2);
        assert_that!(jobs[0].tasks[0].to_string())
            .is_equal_to("render template files/app.conf.hbs to out/app.conf");
        assert_that!(jobs[0].tasks[1].to_string())
            .is_equal_to("run shell script test -f out/app.conf");
    }

    #[test]
    fn test_missing_job() {
        let dir = inventory();
        assert_that!(Job::load(dir.path(), "nope")).is_err();
    }

    #[test]
    fn test_vars_precedence() {
        let dir = inventory();
        let job = Job::load(dir.path(), "deploy").unwrap().remove(0);
        let targets = job.targets(dir.path()).unwrap();
        let hosts: Vec<&str> = targets.iter().map(|(h, _)| h.as_str()).collect();
        assert_that!(hosts).is_equal_to(vec!["web-01", "web-02", "localhost"]);

        // host file > group > job
        assert_that!(targets[0].1.get("port").unwrap().as_str()).is_equal_to("9090");
        assert_that!(targets[0].1.get("ssh_user").unwrap().as_str()).is_equal_to("deploy");
        assert_that!(targets[1].1.get("port").unwrap().as_str()).is_equal_to("8080");
        assert_that!(targets[2].1.get("port").unwrap().as_str()).is_equal_to("80");
        assert_that!(targets[1].1.get("env").unwrap().as_str()).is_equal_to("production");
    }

    #[test]
    fn test_flat_host_file_overrides_parent() {
        let dir = inventory();
        let parent = Vars::from([
            ("port".to_string(), "80".to_string()),
            ("env".to_string(), "production".to_string()),
        ]);
        let (name, vars) = Host::load(dir.path(), "web-01", &parent).unwrap();
        assert_that!(name.as_str()).is_equal_to("web-01");
        assert_that!(vars.get("port").map(String::as_str)).is_equal_to(Some("9090"));
        assert_that!(vars.get("ssh_user").map(String::as_str)).is_equal_to(Some("deploy"));
        assert_that!(vars.get("env").map(String::as_str)).is_equal_to(Some("production"));

        let (_, vars) = Host::load(dir.path(), "web-02", &parent).unwrap();
        assert_that!(vars == parent).is_true();
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_octal_mode() {
        assert_that!(parse_octal_mode("0644")).is_equal_to(Some(0o644));
        assert_that!(parse_octal_mode("755")).is_equal_to(Some(0o755));
        assert_that!(parse_octal_mode("u+x")).is_equal_to(None);
        assert_that!(parse_octal_mode("0999")).is_equal_to(None);
        assert_that!(parse_octal_mode("")).is_equal_to(None);
    }

    #[test]
    fn test_executor_selection() {
        let shell = ShellSettings::default();
        let local = executor("127.0.0.1", &Vars::new(), &shell).unwrap();
        assert_that!(local.to_string()).is_equal_to("localhost");

        let vars = Vars::from([("ssh_port".to_string(), "twenty-two".to_string())]);
        assert_that!(executor("10.0.0.5", &vars, &shell).is_err()).is_true();

        let key = tempfile::NamedTempFile::new().unwrap();
        let vars = Vars::from([
            ("ssh_port".to_string(), "2200".to_string()),
            ("ssh_user".to_string(), "ops".to_string()),
            (
                "ssh_private_key".to_string(),
                key.path().display().to_string(),
            ),
        ]);
        let ssh = executor("10.0.0.5", &vars, &shell).unwrap();
        assert_that!(ssh.to_string()).is_equal_to("ops@10.0.0.5:2200");
    }

    #[test]
    fn test_run_template_locally() {
        let dir = inventory();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        std::fs::write(
            dir.path().join("files/app.conf.hbs"),
            "env={{env}} port={{port}}\n",
        )
        .unwrap();

        let local = Local::new(&ShellSettings::default());
        let vars = Vars::from([
            ("env".to_string(), "staging".to_string()),
            ("port".to_string(), "81".to_string()),
        ]);
        let remote = dir.path().join("out/app.conf");
        let task = Task::Template {
            remote: remote.clone(),
            local: PathBuf::from("files/app.conf.hbs"),
            owner: None,
            group: None,
            mode: Some("600".to_string()),
        };
        assert_that!(Host::run(&local, dir.path(), dir.path(), &task, &vars)).is_ok();
        assert_that!(std::fs::read_to_string(&remote).unwrap())
            .is_equal_to("env=staging port=81\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&remote).unwrap().permissions().mode();
            assert_that!(mode & 0o777).is_equal_to(0o600);
        }
    }

    #[test]
    fn test_run_template_missing_var() {
        let dir = inventory();
        std::fs::write(dir.path().join("files/bad.hbs"), "{{undefined}}").unwrap();
        let task = Task::Template {
            remote: dir.path().join("out.conf"),
            local: PathBuf::from("files/bad.hbs"),
            owner: None,
            group: None,
            mode: None,
        };
        let local = Local::new(&ShellSettings::default());
        assert_that!(Host::run(&local, dir.path(), dir.path(), &task, &Vars::new())).is_err();
    }

    #[test]
    fn test_download_sets_mode() {
        let dir = inventory();
        let remote = dir.path().join("remote.txt");
        std::fs::write(&remote, "data").unwrap();
        let task = Task::Download {
            remote: remote.clone(),
            local: PathBuf::from("fetched.txt"),
            owner: None,
            group: None,
            mode: Some("0644".to_string()),
        };
        let local = Local::new(&ShellSettings::default());
        assert_that!(Host::run(&local, dir.path(), dir.path(), &task, &Vars::new())).is_ok();
        assert_that!(std::fs::read_to_string(dir.path().join("fetched.txt")).unwrap())
            .is_equal_to("data");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("fetched.txt"))
                .unwrap()
                .permissions()
                .mode();
            assert_that!(mode & 0o777).is_equal_to(0o644);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_download_symbolic_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = inventory();
        let remote = dir.path().join("run.sh");
        std::fs::write(&remote, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&remote, std::fs::Permissions::from_mode(0o600)).unwrap();
        let task = Task::Download {
            remote,
            local: PathBuf::from("run-local.sh"),
            owner: None,
            group: None,
            mode: Some("u+x".to_string()),
        };
        let local = Local::new(&ShellSettings::default());
        assert_that!(Host::run(&local, dir.path(), dir.path(), &task, &Vars::new())).is_ok();
        let mode = std::fs::metadata(dir.path().join("run-local.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_that!(mode & 0o100).is_equal_to(0o100);
    }

    #[test]
    fn test_shell_display_with_user() {
        let task = Task::Shell {
            user: Some("www".to_string()),
            script: "uptime".to_string(),
        };
        assert_that!(task.to_string()).is_equal_to("run shell script uptime as user www");
    }
}
