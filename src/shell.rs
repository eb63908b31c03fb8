// Executors that run scripts and move files, either on this machine or on a
// remote host through the system ssh/scp clients.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::{
    error::Error,
    settings::ShellSettings,
    utils::{syscommand_timeout, SyscommandSettings},
};

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_USER: &str = "root";

/// Something that can run scripts and transfer files.
pub trait Command: fmt::Display {
    fn script(&self, user: Option<&str>, command: &str) -> Result<(), Error>;
    fn upload(&self, from: &Path, to: &Path) -> Result<(), Error>;
    fn download(&self, from: &Path, to: &Path) -> Result<(), Error>;
}

pub enum Auth {
    Password(String),
    Key(PathBuf),
}

/// Wraps `command` so that it runs as `user` through `su`.
fn as_user(user: Option<&str>, command: &str) -> Vec<String> {
    match user {
        Some(u) => vec![
            "su".to_string(),
            "-".to_string(),
            u.to_string(),
            "-c".to_string(),
            command.to_string(),
        ],
        None => vec!["sh".to_string(), "-c".to_string(), command.to_string()],
    }
}

/// Quotes a single argument for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn path_str(p: &Path) -> Result<&str, Error> {
    p.to_str()
        .ok_or_else(|| Error::from(format!("Invalid UTF-8 path {}", p.display())))
}

pub struct Local {
    shell: ShellSettings,
}

impl Local {
    pub fn new(shell: &ShellSettings) -> Self {
        Local {
            shell: shell.clone(),
        }
    }
}

impl Command for Local {
    fn script(&self, user: Option<&str>, command: &str) -> Result<(), Error> {
        let out = syscommand_timeout(as_user(user, command), SyscommandSettings::from_shell(&self.shell))?;
        log::debug!("{}:\n{}", self, out.combined());
        if out.code == 0 {
            return Ok(());
        }
        Error::err_string(format!("shell script return {}:\n{}", out.code, out.combined()))
    }

    fn upload(&self, from: &Path, to: &Path) -> Result<(), Error> {
        if from.is_dir() {
            dircpy::copy_dir(from, to)?;
        } else {
            std::fs::copy(from, to)?;
        }
        Ok(())
    }

    fn download(&self, from: &Path, to: &Path) -> Result<(), Error> {
        self.upload(from, to)
    }
}

impl fmt::Display for Local {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "localhost")
    }
}

pub struct Ssh {
    host: String,
    port: u16,
    user: String,
    key: PathBuf,
    shell: ShellSettings,
}

impl Ssh {
    pub fn new(
        host: &str,
        port: Option<u16>,
        user: Option<String>,
        auth: Option<Auth>,
        shell: &ShellSettings,
    ) -> Result<Self, Error> {
        let user = user.unwrap_or(DEFAULT_SSH_USER.to_string());
        let key = match auth {
            Some(Auth::Key(file)) => file,
            Some(Auth::Password(_)) => {
                return Error::err_string(format!(
                    "password authentication for {user}@{host} is not supported, use ssh_private_key"
                ));
            }
            None => default_key(),
        };
        if !key.exists() {
            return Error::err_string(format!("key file {} not exists", key.display()));
        }

        Ok(Ssh {
            host: host.to_string(),
            port: port.unwrap_or(DEFAULT_SSH_PORT),
            user,
            key,
            shell: shell.clone(),
        })
    }

    /// Options shared by ssh and scp.
    fn common_opts(&self) -> Result<Vec<String>, Error> {
        Ok(vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-i".to_string(),
            path_str(&self.key)?.to_string(),
        ])
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn ssh_command(&self, remote_cmd: &str) -> Result<Vec<String>, Error> {
        let mut cmd = vec!["ssh".to_string()];
        cmd.extend(self.common_opts()?);
        cmd.push("-p".to_string());
        cmd.push(self.port.to_string());
        cmd.push(self.target());
        cmd.push(remote_cmd.to_string());
        Ok(cmd)
    }

    fn scp_command(&self, from: String, to: String, recursive: bool) -> Result<Vec<String>, Error> {
        let mut cmd = vec!["scp".to_string()];
        cmd.extend(self.common_opts()?);
        cmd.push("-P".to_string());
        cmd.push(self.port.to_string());
        if recursive {
            cmd.push("-r".to_string());
        }
        cmd.push(from);
        cmd.push(to);
        Ok(cmd)
    }

    fn run(&self, cmd: Vec<String>) -> Result<String, Error> {
        let out = syscommand_timeout(&cmd, SyscommandSettings::from_shell(&self.shell))?;
        log::debug!("{}:\n{}", self, out.combined());
        if out.code == 0 {
            Ok(out.stdout)
        } else {
            Error::err_string(format!(
                "{} on {} return {}:\n{}",
                cmd[0],
                self,
                out.code,
                out.combined()
            ))
        }
    }
}

fn default_key() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".ssh").join("id_rsa"),
        None => Path::new(".ssh").join("id_rsa"),
    }
}

impl Command for Ssh {
    fn script(&self, user: Option<&str>, command: &str) -> Result<(), Error> {
        let remote = as_user(user, command)
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<String>>()
            .join(" ");
        self.run(self.ssh_command(&remote)?).map(|_| ())
    }

    fn upload(&self, from: &Path, to: &Path) -> Result<(), Error> {
        if !from.exists() {
            return Error::err_string(format!("{} not exists", from.display()));
        }
        let remote = format!("{}:{}", self.target(), path_str(to)?);
        self.run(self.scp_command(path_str(from)?.to_string(), remote, from.is_dir())?)
            .map(|_| ())
    }

    fn download(&self, from: &Path, to: &Path) -> Result<(), Error> {
        let check = format!("test -f {}", shell_quote(path_str(from)?));
        self.run(self.ssh_command(&check)?)
            .map_err(|_| Error::from(format!("{}@{} isn't a file", from.display(), self)))?;
        let remote = format!("{}:{}", self.target(), path_str(from)?);
        self.run(self.scp_command(remote, path_str(to)?.to_string(), false)?)
            .map(|_| ())
    }
}

impl fmt::Display for Ssh {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}
