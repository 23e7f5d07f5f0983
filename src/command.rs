use std::{
    io::{self, Write},
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use nix::errno::Errno;

const EXEC_BUSY_RETRY_ATTEMPTS: usize = 20;
const EXEC_BUSY_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Captured result of one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status code, `1` when terminated by a signal.
    pub status_code: i32,
    /// Standard output bytes.
    pub stdout: Vec<u8>,
    /// Standard error, lossily decoded and trimmed.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` for a zero exit status.
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

/// Runs `command` to completion, optionally feeding `stdin`, and captures its output.
pub fn run_captured(command: &mut Command, stdin: Option<&[u8]>) -> io::Result<CommandOutput> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = retry_exec_busy(|| command.spawn())?;
    if let Some(bytes) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(bytes)?;
        }
    }
    let output = child.wait_with_output()?;
    Ok(CommandOutput {
        status_code: output.status.code().unwrap_or(1),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    })
}

/// Replaces a bare `NotFound` spawn error with one naming the missing binary.
pub fn map_command_execution_error(binary: &str, error: io::Error) -> io::Error {
    if error.kind() == io::ErrorKind::NotFound {
        return io::Error::new(
            io::ErrorKind::NotFound,
            format!("required binary not found: {binary}"),
        );
    }
    error
}

/// Retries `operation` while the kernel reports the executable as busy.
pub fn retry_exec_busy<T, F>(mut operation: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut last_error = None;
    for attempt in 0..EXEC_BUSY_RETRY_ATTEMPTS {
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) if is_exec_busy_error(&error) && attempt + 1 < EXEC_BUSY_RETRY_ATTEMPTS => {
                last_error = Some(error);
                thread::sleep(EXEC_BUSY_RETRY_DELAY);
            }
            Err(error) => return Err(error),
        }
    }

    Err(last_error.unwrap_or_else(|| io::Error::other("command execution failed")))
}

fn is_exec_busy_error(error: &io::Error) -> bool {
    error.raw_os_error() == Some(Errno::ETXTBSY as i32)
}

#[cfg(test)]
mod tests {
    use std::{io, process::Command};

    use super::{map_command_execution_error, run_captured};

    #[test]
    fn run_captured_feeds_stdin_and_collects_stdout() {
        let mut command = Command::new("cat");
        let output = run_captured(&mut command, Some(b"ciphertext")).unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, b"ciphertext");
    }

    #[test]
    fn missing_binary_error_names_binary() {
        let error = map_command_execution_error(
            "aws",
            io::Error::from(io::ErrorKind::NotFound),
        );
        assert!(error.to_string().contains("required binary not found: aws"));
    }
}
