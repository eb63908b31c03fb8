use crate::{error::Error, settings::ShellSettings};
use chrono::DateTime;
use std::{
    ffi::OsString,
    fs::File,
    io::{Read, Write},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use subprocess::{ExitStatus, Popen, PopenConfig, Redirection};
use tempfile;

/// Joins two file system paths together.
pub fn path_join<A: AsRef<Path>, B: AsRef<Path>>(a: A, b: B) -> Result<String, Error> {
    a.as_ref()
        .join(b.as_ref())
        .to_str()
        .map(String::from)
        .ok_or(Error::from("Could not convert path to a string."))
}

/// Joins two file system paths together and returns the absolute path of the
/// result.
pub fn path_absolute_join<A: AsRef<Path>, B: AsRef<Path>>(a: A, b: B) -> Result<String, Error> {
    std::path::absolute(a.as_ref().join(b.as_ref()))?
        .to_str()
        .map(String::from)
        .ok_or(Error::from("Could not convert path to a string."))
}

/// Returns the absolute parent path of the provided string, which can succeed
/// even if the path doesn't exist.
pub fn path_absolute_parent<P: AsRef<Path>>(path: P) -> Result<String, Error> {
    std::path::absolute(path.as_ref())?
        .parent()
        .map(|e| e.to_owned())
        .and_then(|p| p.to_str().map(String::from))
        .ok_or(Error::from("Internal error: Could not get parent of path."))
}

/// Creates a directory if it does not already exist.
pub fn create_dir_if_not_exists<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    if !std::fs::exists(path.as_ref())? {
        std::fs::create_dir_all(path.as_ref())?;
    }
    Ok(())
}

/// Converts the provided system time to a string formatted as
/// YYYY-mm-dd HH:MM:SS in UTC time.
pub fn systemtime_to_utc_string(systime: &SystemTime) -> Option<String> {
    systime
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| {
            let secs: i64 = d.as_secs().try_into().ok()?;
            DateTime::from_timestamp(secs, d.subsec_nanos())
        })
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
}

#[derive(Debug, Clone)]
pub struct SyscommandSettings {
    pub timeout: Duration,
    pub expected_code: Option<i32>,
    pub stdin: Option<String>,
    pub max_stdout_length: Option<usize>,
    pub max_stderr_length: Option<usize>,
    /// Working directory of the spawned process.
    pub cwd: Option<String>,
}

impl Default for SyscommandSettings {
    fn default() -> Self {
        SyscommandSettings {
            timeout: Duration::from_secs(60),
            expected_code: None,
            stdin: None,
            max_stdout_length: None,
            max_stderr_length: None,
            cwd: None,
        }
    }
}

impl SyscommandSettings {
    /// Captures both output streams, bounded by the shell limits.
    pub fn from_shell(shell: &ShellSettings) -> Self {
        SyscommandSettings {
            timeout: Duration::from_secs(shell.timeout_seconds.into()),
            max_stdout_length: Some(shell.max_output),
            max_stderr_length: Some(shell.max_output),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyscommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl SyscommandOutput {
    /// Both streams concatenated, the way they are shown to operators.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

const BUFFER_SIZE: usize = 4096;
const EVENT_CAPACITY: usize = 1024;
const TOKEN_STDOUT: mio::Token = mio::Token(1);
const TOKEN_STDERR: mio::Token = mio::Token(2);

/// Reads one chunk from `src` into `dst`. Returns the number of bytes read,
/// or an error if `dst` grew past `limit`.
fn read_chunk(
    src: &mut File,
    dst: &mut Vec<u8>,
    scratch: &mut [u8; BUFFER_SIZE],
    limit: usize,
) -> Result<usize, Error> {
    let l = src.read(scratch.as_mut_slice())?;
    dst.extend_from_slice(&scratch[..l]);
    if dst.len() > limit {
        return Err(Error::SyscommandOutputLimitExceededError(limit));
    }
    Ok(l)
}

/// Reads whatever remains in `src` after the process has exited.
fn drain(
    src: Option<&mut File>,
    dst: &mut Vec<u8>,
    scratch: &mut [u8; BUFFER_SIZE],
    limit: usize,
) -> Result<(), Error> {
    if let Some(f) = src {
        while read_chunk(f, dst, scratch, limit)? == BUFFER_SIZE {}
    }
    Ok(())
}

/// Polls the output pipes of `handle` until it exits or `end_time` passes.
/// Returns `None` on timeout.
fn wait_collecting(
    handle: &mut Popen,
    buf_stdout: &mut Vec<u8>,
    buf_stderr: &mut Vec<u8>,
    end_time: SystemTime,
    max_stdout_length: usize,
    max_stderr_length: usize,
) -> Result<Option<ExitStatus>, Error> {
    let mut scratch = [0u8; BUFFER_SIZE];
    let mut poll = mio::Poll::new()
        .inspect_err(|e| log::error!("Could not create poll instance: {e}"))?;
    let mut events = mio::Events::with_capacity(EVENT_CAPACITY);

    for (pipe, token) in [(&handle.stdout, TOKEN_STDOUT), (&handle.stderr, TOKEN_STDERR)] {
        if let Some(f) = pipe {
            poll.registry()
                .register(
                    &mut mio::unix::SourceFd(&f.as_raw_fd()),
                    token,
                    mio::Interest::READABLE,
                )
                .inspect_err(|e| log::error!("Could not register output pipe: {e}"))?;
        }
    }

    let mut stat = None;
    while SystemTime::now() < end_time && stat.is_none() {
        poll.poll(&mut events, Some(Duration::from_millis(100)))?;

        for event in &events {
            if event.token() == TOKEN_STDOUT {
                if let Some(f) = handle.stdout.as_mut() {
                    read_chunk(f, buf_stdout, &mut scratch, max_stdout_length)?;
                }
            } else if event.token() == TOKEN_STDERR {
                if let Some(f) = handle.stderr.as_mut() {
                    read_chunk(f, buf_stderr, &mut scratch, max_stderr_length)?;
                }
            }
        }

        stat = handle.poll();
    }

    if stat.is_some() {
        drain(handle.stdout.as_mut(), buf_stdout, &mut scratch, max_stdout_length)?;
        drain(handle.stderr.as_mut(), buf_stderr, &mut scratch, max_stderr_length)?;
    }

    Ok(stat)
}

/// Runs a command with a timeout.
/// On success, returns code, stdout, and stderr.
///
/// Output is only captured for the streams that have a maximum length set.
///
/// ```
/// use axis::utils::{syscommand_timeout, SyscommandSettings};
///
/// let ret = syscommand_timeout(
///     ["echo", "foo"],
///     SyscommandSettings {
///         max_stdout_length: Some(16),
///         ..Default::default()
///     },
/// ).unwrap();
///
/// assert_eq!(ret.stdout, "foo\n");
/// ```
pub fn syscommand_timeout<S: AsRef<str>, CmdList: AsRef<[S]>>(
    cmd: CmdList,
    cmd_settings: SyscommandSettings,
) -> Result<SyscommandOutput, Error> {
    let os_cmd: Vec<OsString> = cmd
        .as_ref()
        .iter()
        .map(|s| OsString::from(s.as_ref()))
        .collect();
    if os_cmd.is_empty() {
        return Error::err_str("Cannot run an empty command");
    }

    // The stdin file is removed as soon as this handle is dropped.
    let stdin_file = match &cmd_settings.stdin {
        Some(s) => {
            let mut f = tempfile::NamedTempFile::new()?;
            f.write_all(s.as_bytes())?;
            Some(f)
        }
        None => None,
    };

    let stdin_path: Option<PathBuf> = stdin_file.as_ref().map(|f| f.path().to_path_buf());

    let mut handle = Popen::create(
        &os_cmd,
        PopenConfig {
            stdin: match &stdin_path {
                Some(path) => Redirection::File(File::open(path)?),
                None => Redirection::None,
            },
            stdout: if cmd_settings.max_stdout_length.is_some() {
                Redirection::Pipe
            } else {
                Redirection::None
            },
            stderr: if cmd_settings.max_stderr_length.is_some() {
                Redirection::Pipe
            } else {
                Redirection::None
            },
            cwd: cmd_settings.cwd.as_ref().map(OsString::from),
            ..Default::default()
        },
    )
    .map_err(|e| Error::from(format!("Could not create Popen process {os_cmd:?}: {e}")))?;

    let mut buf_stdout: Vec<u8> = vec![];
    let mut buf_stderr: Vec<u8> = vec![];

    let end_time = SystemTime::now()
        .checked_add(cmd_settings.timeout)
        .unwrap_or_else(SystemTime::now);

    let wait_result = wait_collecting(
        &mut handle,
        &mut buf_stdout,
        &mut buf_stderr,
        end_time,
        cmd_settings.max_stdout_length.unwrap_or(0),
        cmd_settings.max_stderr_length.unwrap_or(0),
    )
    .inspect_err(|e| {
        log::warn!("(Terminating process) Runtime error when waiting for it to finish: {e}");
        handle
            .kill()
            .unwrap_or_else(|e| log::error!("Could not kill process: {e}"));
    })?;

    drop(stdin_file);

    let stdout = String::from_utf8_lossy(buf_stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(buf_stderr.as_slice()).into_owned();

    match wait_result {
        Some(ExitStatus::Exited(ucode)) => {
            let code = ucode as i32;
            if cmd_settings.expected_code.map_or(true, |ec| ec == code) {
                Ok(SyscommandOutput {
                    code,
                    stdout,
                    stderr,
                })
            } else {
                Err(format!("Exited with unexpected code {code}").into())
            }
        }
        Some(ExitStatus::Signaled(sig)) => Err(format!("Terminated by signal {sig}").into()),
        Some(ExitStatus::Other(v)) => Err(format!("Unknown exit status {v}").into()),
        Some(ExitStatus::Undetermined) => Err("Undetermined error".into()),
        None => {
            handle
                .kill()
                .unwrap_or_else(|e| log::warn!("Could not kill timed out process: {e}"));
            Err(Error::SyscommandTimeoutError {
                stdout: Some(stdout),
                stderr: Some(stderr),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;

    #[test]
    fn test_path_join() {
        assert_that!(path_join("etc", "groups")).has_value("etc/groups");
        assert_that!(path_join("/etc", "tasks")).has_value("/etc/tasks");
        assert_that!(path_join("/etc", "/var")).has_value("/var");
    }

    #[test]
    fn test_path_absolute_parent() {
        assert_that!(path_absolute_parent("/srv/axis/axis.toml")).has_value("/srv/axis");
    }

    #[test]
    fn test_systemtime_to_utc_string() {
        let t = UNIX_EPOCH + Duration::from_secs(86400);
        assert_that!(systemtime_to_utc_string(&t)).has_value("1970-01-02 00:00:00 UTC");
    }

    #[test]
    fn test_combined_output() {
        let out = SyscommandOutput {
            code: 0,
            stdout: "out".to_string(),
            stderr: "".to_string(),
        };
        assert_that!(out.combined()).is_equal_to("out");
        let out = SyscommandOutput {
            code: 1,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
        };
        assert_that!(out.combined()).is_equal_to("out\nerr");
    }

    #[test]
    fn test_syscommand_simple() {
        let ret = syscommand_timeout(
            ["echo", "foo"],
            SyscommandSettings {
                max_stdout_length: Some(10),
                ..Default::default()
            },
        );
        assert_that!(&ret).is_ok();
        assert_that!(&ret)
            .ok()
            .mapping(|s| &s.stdout)
            .is_equal_to("foo\n");
    }

    #[test]
    fn test_syscommand_empty() {
        let empty: [&str; 0] = [];
        assert_that!(syscommand_timeout(empty, SyscommandSettings::default())).is_err();
    }

    #[test]
    fn test_syscommand_stdin() {
        let example_stdin = "uname -a\n".repeat(200);
        let ret = syscommand_timeout(
            ["cat"],
            SyscommandSettings {
                max_stdout_length: Some(1024 * 1024),
                stdin: Some(example_stdin.clone()),
                ..Default::default()
            },
        );
        assert_that!(&ret)
            .ok()
            .mapping(|s| &s.stdout)
            .is_equal_to(&example_stdin);
    }

    #[test]
    fn test_syscommand_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let ret = syscommand_timeout(
            ["pwd"],
            SyscommandSettings {
                max_stdout_length: Some(4096),
                cwd: Some(dir.path().to_str().unwrap().to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert_that!(ret.stdout.trim_end()).is_equal_to(canonical.to_str().unwrap());
    }

    #[test]
    fn test_syscommand_expected_code() {
        let ret = syscommand_timeout(
            ["sh", "-c", "exit 3"],
            SyscommandSettings {
                expected_code: Some(0),
                ..Default::default()
            },
        );
        assert_that!(&ret).is_err();
    }

    #[test]
    fn test_syscommand_output_limit() {
        let ret = syscommand_timeout(
            ["sh", "-c", "for i in $(seq 1 100); do echo 0123456789; done"],
            SyscommandSettings {
                max_stdout_length: Some(64),
                ..Default::default()
            },
        );
        assert_that!(&ret).err().satisfies(|e| match e {
            Error::SyscommandOutputLimitExceededError(64) => true,
            _ => false,
        });
    }

    #[test]
    fn test_syscommand_with_timeout() {
        let ret = syscommand_timeout(
            ["sleep", "2"],
            SyscommandSettings {
                timeout: Duration::from_secs(1),
                ..Default::default()
            },
        );
        assert_that!(&ret).err().satisfies(|e| match e {
            Error::SyscommandTimeoutError { .. } => true,
            _ => false,
        });
    }
}
