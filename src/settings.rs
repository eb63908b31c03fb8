use serde::Deserialize;
use toml;

use crate::error::Error;
use crate::utils::{path_absolute_join, path_absolute_parent, path_join};

#[derive(Deserialize, Debug, Clone)]
pub struct Settings {
    pub name: String,

    /// The directory in which we can put temporary files.
    pub temp_dir: String,

    /// Root directory of publishable groups (`groups/*.toml`) and task
    /// bundles (`tasks/<name>/readme.json`).
    pub etc_dir: String,

    pub log: LoggingSettings,
    pub postgres: PostgresSettings,
    pub master: MasterSettings,
    pub agent: AgentSettings,
    pub shell: ShellSettings,

    #[serde(skip)]
    pub reldir: String,
}

/// Logging settings
#[derive(Deserialize, Debug, Clone)]
pub struct LoggingSettings {
    /// Directory where to store log messages
    pub dir: String,

    /// Whether to output debug messages.
    pub verbose: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PostgresSettings {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub dbname: String,
}

/// Settings for the master HTTP server.
#[derive(Deserialize, Debug, Clone)]
pub struct MasterSettings {
    /// Address to bind the server to
    pub address: String,
    pub port: u16,

    /// Maximum size of a JSON request body
    pub max_payload: usize,

    /// URL under which agents reach the master, e.g. "http://10.0.0.1:8080"
    pub public_url: String,
}

/// Settings for agent processes
#[derive(Deserialize, Debug, Clone)]
pub struct AgentSettings {
    /// The name this agent registers under. Must be unique among agents.
    pub id: String,

    /// Path to the agent key. Generated on first start if absent.
    pub key_file: String,

    /// How often the agent asks the master for new tasks
    pub poll_interval_seconds: u16,
}

/// Limits applied to every spawned shell command, both for push-mode jobs
/// and for agent payloads.
#[derive(Deserialize, Debug, Clone)]
pub struct ShellSettings {
    pub timeout_seconds: u32,

    /// Maximum captured characters on stdout and stderr.
    pub max_output: usize,
}

impl Default for ShellSettings {
    fn default() -> Self {
        ShellSettings {
            timeout_seconds: 600,
            max_output: 1024 * 1024,
        }
    }
}

/// Parses the truthy strings accepted in environment overrides.
fn parse_truth(value: &str) -> bool {
    match value.to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => true,
        _ => false,
    }
}

impl Settings {
    /// Loads settings from the specified path
    pub fn load(path: &str) -> Result<Self, Error> {
        let contents: String = std::fs::read_to_string(path)
            .inspect_err(|e| eprintln!("Could not load settings from \"{path}\": {e}"))?;
        let mut s: Settings = toml::from_str(&contents)
            .inspect_err(|e| eprintln!("Error parsing settings from \"{path}\": {e}"))?;

        s.reldir = path_absolute_parent(&path)?;

        s.temp_dir = path_absolute_join(&s.reldir, &s.temp_dir)?;
        s.etc_dir = path_absolute_join(&s.reldir, &s.etc_dir)?;
        s.log.dir = path_absolute_join(&s.reldir, &s.log.dir)?;
        s.agent.key_file = path_absolute_join(&s.reldir, &s.agent.key_file)?;

        s.apply_env_overrides(|name| std::env::var(name).ok())?;
        s.validate()?;
        Ok(s)
    }

    /// Overrides values from `AXIS_*` variables, looked up through `var`.
    fn apply_env_overrides<F: Fn(&str) -> Option<String>>(&mut self, var: F) -> Result<(), Error> {
        if let Some(etc_dir) = var("AXIS_ETC_DIR") {
            self.etc_dir = etc_dir;
        }
        if let Some(log_dir) = var("AXIS_LOG_DIR") {
            self.log.dir = log_dir;
        }
        if let Some(truth_value) = var("AXIS_LOG_VERBOSE") {
            self.log.verbose = parse_truth(&truth_value);
        }

        // Postgres
        if let Some(user) = var("AXIS_POSTGRES_USER") {
            self.postgres.user = user;
        }
        if let Some(password) = var("AXIS_POSTGRES_PASSWORD") {
            self.postgres.password = password;
        }
        if let Some(host) = var("AXIS_POSTGRES_HOST") {
            self.postgres.host = host;
        }
        if let Some(port) = var("AXIS_POSTGRES_PORT") {
            self.postgres.port = port
                .parse()
                .map_err(|e| Error::from(format!("Invalid postgres port value \"{port}\": {e}")))?;
        }
        if let Some(dbname) = var("AXIS_POSTGRES_DBNAME") {
            self.postgres.dbname = dbname;
        }

        // Master
        if let Some(address) = var("AXIS_MASTER_ADDRESS") {
            self.master.address = address;
        }
        if let Some(port) = var("AXIS_MASTER_PORT") {
            self.master.port = port
                .parse()
                .map_err(|e| Error::from(format!("Invalid master port value \"{port}\": {e}")))?;
        }
        if let Some(public_url) = var("AXIS_MASTER_PUBLIC_URL") {
            self.master.public_url = public_url;
        }
        if let Some(max_payload) = var("AXIS_MASTER_MAX_PAYLOAD") {
            self.master.max_payload = max_payload.parse().map_err(|e| {
                Error::from(format!("Invalid max_payload value \"{max_payload}\": {e}"))
            })?;
        }

        // Agent
        if let Some(id) = var("AXIS_AGENT_ID") {
            self.agent.id = id;
        }
        if let Some(key_file) = var("AXIS_AGENT_KEY_FILE") {
            self.agent.key_file = key_file;
        }
        if let Some(interval) = var("AXIS_AGENT_POLL_INTERVAL_SECONDS") {
            self.agent.poll_interval_seconds = interval.parse().map_err(|e| {
                Error::from(format!(
                    "Invalid poll_interval_seconds value \"{interval}\": {e}"
                ))
            })?;
        }

        // Shell
        if let Some(timeout) = var("AXIS_SHELL_TIMEOUT_SECONDS") {
            self.shell.timeout_seconds = timeout.parse().map_err(|e| {
                Error::from(format!("Invalid shell timeout value \"{timeout}\": {e}"))
            })?;
        }
        if let Some(max_output) = var("AXIS_SHELL_MAX_OUTPUT") {
            self.shell.max_output = max_output.parse().map_err(|e| {
                Error::from(format!("Invalid max_output value \"{max_output}\": {e}"))
            })?;
        }
        Ok(())
    }

    /// Rejects values that would make the processes misbehave.
    fn validate(&self) -> Result<(), Error> {
        if self.agent.poll_interval_seconds == 0 {
            return Error::err_str("agent.poll_interval_seconds must be at least 1");
        }
        if self.shell.timeout_seconds == 0 {
            return Error::err_str("shell.timeout_seconds must be at least 1");
        }
        Ok(())
    }

    /// The connection string handed to libpq.
    pub fn postgres_url(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} connect_timeout=10",
            self.postgres.host,
            self.postgres.port,
            self.postgres.user,
            self.postgres.password,
            self.postgres.dbname
        )
    }

    /// Sets up logging for the current process.
    pub fn setup_logging(self: &Self, prockind: &str) -> Result<(), Error> {
        use log::LevelFilter::{Debug, Info};

        std::fs::create_dir_all(&self.log.dir).map_err(|e| {
            eprintln!(
                "Error creating directory {} for the log file: {}",
                &self.log.dir, e
            );
            e.to_string()
        })?;

        let path_logfile = path_join(&self.log.dir, "log.out")?;
        let prockind = prockind.to_string();
        fern::Dispatch::new()
            .format(move |out, message, record| {
                out.finish(format_args!(
                    "[{0} {1} ({4}-{5}) {2}:{3}] {6}",
                    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.target(),
                    record.line().unwrap_or(0),
                    prockind,
                    std::process::id(),
                    message
                ))
            })
            .level(if self.log.verbose { Debug } else { Info })
            .chain(std::io::stderr())
            .chain(
                fern::log_file(&path_logfile).inspect_err(|e| {
                    eprintln!("Error setting up log file {}: {}", &path_logfile, e)
                })?,
            )
            .apply()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;
    use std::io::Write;

    const EXAMPLE_SETTINGS: &str = r#"
name = "axis"
temp_dir = "tmp"
etc_dir = "etc"

[log]
dir = "log"
verbose = false

[postgres]
user = "axis"
password = "secret"
host = "localhost"
port = 5432
dbname = "axis"

[master]
address = "0.0.0.0"
port = 8080
max_payload = 1048576
public_url = "http://localhost:8080"

[agent]
id = "web-01"
key_file = "agent.key"
poll_interval_seconds = 5

[shell]
timeout_seconds = 60
max_output = 65536
"#;

    #[test]
    fn test_load_makes_paths_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("axis.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(EXAMPLE_SETTINGS.as_bytes()).unwrap();

        let s = Settings::load(path.to_str().unwrap()).unwrap();
        let root = dir.path().to_str().unwrap();
        assert_that!(&s.reldir).is_equal_to(&root.to_string());
        assert_that!(&s.etc_dir).is_equal_to(&format!("{root}/etc"));
        assert_that!(&s.agent.key_file).is_equal_to(&format!("{root}/agent.key"));
        assert_that!(s.master.port).is_equal_to(8080);
        assert_that!(s.shell.max_output).is_equal_to(65536);
    }

    #[test]
    fn test_postgres_url() {
        let s: Settings = toml::from_str(EXAMPLE_SETTINGS).unwrap();
        assert_that!(s.postgres_url()).is_equal_to(
            "host=localhost port=5432 user=axis password=secret dbname=axis connect_timeout=10",
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut s: Settings = toml::from_str(EXAMPLE_SETTINGS).unwrap();
        let env = std::collections::HashMap::from([
            ("AXIS_MASTER_MAX_PAYLOAD", "4096"),
            ("AXIS_SHELL_MAX_OUTPUT", "1024"),
            ("AXIS_AGENT_ID", "db-01"),
        ]);
        s.apply_env_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_that!(s.master.max_payload).is_equal_to(4096);
        assert_that!(s.shell.max_output).is_equal_to(1024);
        assert_that!(s.agent.id.as_str()).is_equal_to("db-01");
        assert_that!(s.master.port).is_equal_to(8080);

        let bad = |name: &str| (name == "AXIS_SHELL_MAX_OUTPUT").then(|| "lots".to_string());
        assert_that!(s.apply_env_overrides(bad)).is_err();
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut s: Settings = toml::from_str(EXAMPLE_SETTINGS).unwrap();
        assert_that!(s.validate()).is_ok();
        s.agent.poll_interval_seconds = 0;
        assert_that!(s.validate()).is_err();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("axis.toml");
        std::fs::write(
            &path,
            EXAMPLE_SETTINGS.replace("poll_interval_seconds = 5", "poll_interval_seconds = 0"),
        )
        .unwrap();
        assert_that!(Settings::load(path.to_str().unwrap())).is_err();
    }

    #[test]
    fn test_parse_truth() {
        assert_that!(parse_truth("Yes")).is_true();
        assert_that!(parse_truth("1")).is_true();
        assert_that!(parse_truth("off")).is_false();
    }
}
