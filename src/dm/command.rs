//! Runs the device-mapper helper binaries with a timeout.
//!
//! Table payloads carry key material, so they only ever travel over stdin.

use crate::error::{CryptError, ErrorCategory, ErrorKind, Errno, Result};
use log::debug;
use std::env;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

const SBIN_DIRS: &[&str] = &["/usr/sbin", "/sbin", "/usr/bin", "/bin", "/usr/local/sbin"];

#[derive(Debug, Clone)]
pub(crate) struct HelperCommand {
    binary: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// stderr if the helper wrote any, stdout otherwise.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else {
            self.stdout.trim().to_string()
        }
    }
}

impl HelperCommand {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    /// Locate `name`: an explicit configured path wins, then the usual sbin
    /// directories, then `PATH`.
    pub fn resolve(name: &str, configured: Option<&str>, timeout: Duration) -> Result<Self> {
        if let Some(path) = configured.map(str::trim).filter(|path| !path.is_empty()) {
            let candidate = Path::new(path);
            if !candidate.exists() {
                return Err(helper_error(format!(
                    "{name} binary not found at {}",
                    candidate.display()
                )));
            }
            return Ok(Self::new(candidate.to_path_buf(), timeout));
        }

        SBIN_DIRS
            .iter()
            .map(|dir| Path::new(dir).join(name))
            .find(|candidate| candidate.exists())
            .or_else(|| find_in_path(name))
            .map(|binary| Self::new(binary, timeout))
            .ok_or_else(|| {
                helper_error(format!(
                    "unable to locate {name} binary; tried {SBIN_DIRS:?} and PATH"
                ))
            })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn run(&self, args: &[&str], input: Option<&[u8]>) -> Result<Output> {
        debug!("running {} {}", self.binary.display(), args.join(" "));

        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|e| self.spawn_error(e))?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(e) = stdin.write_all(payload) {
                    drop(stdin);
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CryptError::io(
                        format!("failed to feed {}", self.binary.display()),
                        e,
                    ));
                }
                // Dropping stdin closes the pipe so the helper sees EOF.
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> Result<Output> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            let polled = child
                .try_wait()
                .map_err(|e| CryptError::io(format!("failed to wait for {}", self.binary.display()), e))?;
            if let Some(status) = polled {
                exit_status = Some(status);
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        let Some(exit_status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CryptError::with_kind(
                ErrorCategory::Internal,
                Errno::TimedOut,
                ErrorKind::ExternalCommand,
                format!("{} timed out after {:?}", self.binary.display(), self.timeout),
            ));
        };

        let stdout = join_reader(stdout_handle, "stdout")?;
        let stderr = join_reader(stderr_handle, "stderr")?;

        Ok(Output {
            stdout,
            stderr,
            status: exit_status.code().unwrap_or(-1),
        })
    }

    fn spawn_error(&self, err: io::Error) -> CryptError {
        CryptError::with_kind_and_source(
            ErrorCategory::Internal,
            Errno::Io,
            ErrorKind::ExternalCommand,
            format!("failed to run {}", self.binary.display()),
            err,
        )
    }
}

/// Map a failed helper invocation onto the error taxonomy by its diagnostic.
pub(crate) fn classify_failure(what: &str, output: &Output) -> CryptError {
    let diagnostic = output.diagnostic();
    let lower = diagnostic.to_ascii_lowercase();
    let detail = if diagnostic.is_empty() {
        "no additional output".to_string()
    } else {
        diagnostic
    };
    let msg = format!("{what}: {detail} (exit code {})", output.status);

    if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
    {
        return CryptError::with_kind(
            ErrorCategory::Invalid,
            Errno::NotPermitted,
            ErrorKind::PermissionDenied,
            format!("{msg}. This usually requires root"),
        );
    }

    if lower.contains("device or resource busy") || lower.contains("is in use") {
        return CryptError::with_kind(ErrorCategory::Busy, Errno::Busy, ErrorKind::MappingBusy, msg);
    }

    if lower.contains("already exists") || lower.contains("file exists") {
        return CryptError::with_kind(
            ErrorCategory::Busy,
            Errno::Exists,
            ErrorKind::MappingExists,
            msg,
        );
    }

    if lower.contains("no such device")
        || lower.contains("does not exist")
        || lower.contains("doesn't exist")
        || lower.contains("not found")
    {
        return CryptError::with_kind(
            ErrorCategory::NotFound,
            Errno::NoDevice,
            ErrorKind::MappingNotFound,
            msg,
        );
    }

    if lower.contains("invalid argument") {
        return CryptError::invalid(ErrorKind::ExternalCommand, msg);
    }

    CryptError::with_kind(ErrorCategory::Internal, Errno::Io, ErrorKind::ExternalCommand, msg)
}

fn helper_error(msg: String) -> CryptError {
    CryptError::with_kind(ErrorCategory::Internal, Errno::Io, ErrorKind::ExternalCommand, msg)
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.exists())
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<io::Result<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> io::Result<String> {
        let mut buf = Vec::new();
        if let Some(mut reader) = pipe {
            reader.read_to_end(&mut buf)?;
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}

fn join_reader(handle: thread::JoinHandle<io::Result<String>>, stream: &str) -> Result<String> {
    handle
        .join()
        .map_err(|_| {
            CryptError::with_kind(
                ErrorCategory::Internal,
                Errno::Io,
                ErrorKind::InternalInvariant,
                format!("{stream} reader thread panicked"),
            )
        })?
        .map_err(|e| CryptError::io(format!("failed to read helper {stream}"), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(status: i32, stderr: &str) -> Output {
        Output {
            stdout: String::new(),
            stderr: stderr.to_string(),
            status,
        }
    }

    fn shell(timeout: Duration) -> HelperCommand {
        HelperCommand::new(PathBuf::from("/bin/sh"), timeout)
    }

    #[test]
    fn test_classify_missing_mapping() {
        let err = classify_failure(
            "remove vol",
            &output(1, "device-mapper: remove ioctl on vol failed: No such device or address"),
        );
        assert_eq!(err.code(), -19);
        assert_eq!(err.kind, Some(ErrorKind::MappingNotFound));
    }

    #[test]
    fn test_classify_busy_and_exists() {
        let busy = classify_failure("remove", &output(1, "Device or resource busy"));
        assert_eq!(busy.code(), -16);

        let exists = classify_failure("create", &output(1, "Device vol already exists."));
        assert_eq!(exists.code(), -17);
    }

    #[test]
    fn test_classify_permission() {
        let err = classify_failure("create", &output(1, "Operation not permitted"));
        assert_eq!(err.code(), -1);
    }

    #[test]
    fn test_classify_unknown_is_eio() {
        let err = classify_failure("create", &output(3, ""));
        assert_eq!(err.code(), -5);
        assert!(err.message().contains("no additional output"));
    }

    #[test]
    fn test_resolve_configured_path_must_exist() {
        let err = HelperCommand::resolve(
            "dmsetup",
            Some("/nonexistent/dmsetup"),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::ExternalCommand));
    }

    #[test]
    fn test_run_passes_stdin_and_captures_output() {
        let command = shell(Duration::from_secs(10));

        let out = command
            .run(&["-c", "cat; echo oops >&2; exit 3"], Some(b"table line"))
            .unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout, "table line");
        assert_eq!(out.diagnostic(), "oops");
        assert!(!out.success());
    }

    #[test]
    fn test_run_times_out() {
        let command = shell(Duration::from_millis(100));

        let err = command.run(&["-c", "exec sleep 5"], None).unwrap_err();
        assert_eq!(err.code(), -110);
    }

    #[test]
    fn test_run_reaps_helper_that_closes_stdin() {
        let command = shell(Duration::from_secs(10));
        let payload = vec![b'x'; 1 << 20];

        let start = Instant::now();
        let err = command
            .run(&["-c", "exec 0<&-; exec sleep 5"], Some(&payload))
            .unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::Io));
        assert!(err.message().contains("failed to feed"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
