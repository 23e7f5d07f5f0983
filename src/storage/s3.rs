use std::{io, process::Command, thread, time::Duration};

use serde::{Deserialize, Serialize};

use crate::command::{map_command_execution_error, run_captured, CommandOutput};

use super::{SecretStorage, StorageError};

const DEFAULT_AWS_BINARY: &str = "aws";
const DEFAULT_RETRY_ATTEMPTS: usize = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);
const NOT_FOUND_MARKERS: [&str; 4] = ["NoSuchKey", "(404)", "Not Found", "does not exist"];

/// `type = "s3"` storage settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct S3Config {
    /// Bucket holding ciphertext objects.
    pub bucket: String,
    /// Bucket region.
    pub region: String,
    /// Override for the `aws` binary.
    #[serde(default)]
    pub binary: Option<String>,
}

/// Executor abstraction for `aws` CLI invocations.
pub trait S3Executor: Send + Sync {
    /// Runs the CLI with `args`, feeding `stdin` when given.
    fn exec(&self, args: &[String], stdin: Option<&[u8]>) -> io::Result<CommandOutput>;
}

/// Real executor that calls the system `aws` binary.
#[derive(Debug, Clone)]
pub struct AwsCliExecutor {
    binary: String,
}

impl AwsCliExecutor {
    /// Creates an executor using the `aws` binary from `PATH`.
    pub fn new() -> Self {
        Self::with_binary(DEFAULT_AWS_BINARY)
    }

    /// Creates an executor with a custom binary path.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for AwsCliExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl S3Executor for AwsCliExecutor {
    fn exec(&self, args: &[String], stdin: Option<&[u8]>) -> io::Result<CommandOutput> {
        run_captured(Command::new(&self.binary).args(args), stdin)
            .map_err(|error| map_command_execution_error(&self.binary, error))
    }
}

/// Ciphertext objects stored in one S3 bucket.
pub struct S3Storage {
    bucket: String,
    region: String,
    executor: Box<dyn S3Executor>,
    retry_attempts: usize,
    retry_delay: Duration,
}

impl S3Storage {
    /// Creates a backend driving the `aws` CLI.
    pub fn new(config: &S3Config) -> Self {
        let executor = match &config.binary {
            Some(binary) => AwsCliExecutor::with_binary(binary.clone()),
            None => AwsCliExecutor::new(),
        };
        Self::with_executor(config, Box::new(executor))
    }

    /// Creates a backend with a custom executor, useful for tests.
    pub fn with_executor(config: &S3Config, executor: Box<dyn S3Executor>) -> Self {
        Self {
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            executor,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Overrides how often and how far apart transient failures are retried.
    pub fn with_retry(mut self, attempts: usize, delay: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    fn object_url(&self, path: &str) -> Result<String, StorageError> {
        if path.is_empty() || path.starts_with('/') || path.split('/').any(|part| part == "..") {
            return Err(StorageError::InvalidPath(path.to_owned()));
        }
        Ok(format!("s3://{}/{path}", self.bucket))
    }

    fn copy_args(&self, source: String, destination: String) -> Vec<String> {
        vec![
            "s3".to_owned(),
            "cp".to_owned(),
            source,
            destination,
            "--region".to_owned(),
            self.region.clone(),
            "--only-show-errors".to_owned(),
        ]
    }

    fn exec_with_retry(
        &self,
        path: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, StorageError> {
        let mut last_reason = String::new();
        for attempt in 1..=self.retry_attempts {
            let output = self
                .executor
                .exec(args, stdin)
                .map_err(|error| StorageError::Unavailable {
                    path: path.to_owned(),
                    reason: error.to_string(),
                })?;
            if output.success() {
                return Ok(output);
            }
            if is_not_found(&output.stderr) {
                return Err(StorageError::NotFound(path.to_owned()));
            }

            tracing::debug!(path, attempt, stderr = %output.stderr, "s3 request failed");
            last_reason = output.stderr;
            if attempt < self.retry_attempts {
                thread::sleep(self.retry_delay);
            }
        }

        Err(StorageError::Unavailable {
            path: path.to_owned(),
            reason: last_reason,
        })
    }
}

impl SecretStorage for S3Storage {
    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let args = self.copy_args(self.object_url(path)?, "-".to_owned());
        self.exec_with_retry(path, &args, None)
            .map(|output| output.stdout)
    }

    fn put(&self, path: &str, ciphertext: &[u8]) -> Result<(), StorageError> {
        let args = self.copy_args("-".to_owned(), self.object_url(path)?);
        self.exec_with_retry(path, &args, Some(ciphertext))
            .map(|_| ())
    }
}

fn is_not_found(stderr: &str) -> bool {
    NOT_FOUND_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker))
}
