//! Runs one command inside the lifetime of its exposures.

mod signals;

use std::{
    ffi::OsStr,
    io,
    os::unix::{ffi::OsStrExt, process::ExitStatusExt},
    process::{Command, ExitStatus},
};

use thiserror::Error;

use crate::{
    error::{EXIT_EXPOSURE, EXIT_INTERRUPTED, EXIT_SPAWN, EXIT_TEARDOWN, EXIT_USAGE},
    exposure::{ExposureError, ExposureRecord, ExposureRuntime, MountDriver, TeardownError},
    plan::ExposurePlan,
};

pub use signals::{SignalForwarder, FORWARDED_SIGNALS};

/// Offset added to a terminating signal number to form an exit code.
pub const EXIT_SIGNAL_BASE: i32 = 128;

/// Supervisor failures. Exposures have been torn down unless `teardown` says otherwise.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No command was given.
    #[error("no command given")]
    EmptyCommand,
    /// Signal handlers could not be installed.
    #[error("failed to install signal handlers: {0}")]
    InstallingSignals(#[source] io::Error),
    /// Exposures could not be materialized.
    #[error(transparent)]
    Exposure(#[from] ExposureError),
    /// A signal arrived before the command started.
    #[error("interrupted by signal {signal} before the command started{}", teardown_suffix(.teardown))]
    Interrupted {
        /// Signal number.
        signal: i32,
        /// Teardown failure, when any.
        teardown: Option<TeardownError>,
    },
    /// The command could not be started.
    #[error("failed to spawn {program}: {source}{}", teardown_suffix(.teardown))]
    Spawn {
        /// Program name.
        program: String,
        /// Spawn error.
        #[source]
        source: io::Error,
        /// Teardown failure, when any.
        teardown: Option<TeardownError>,
    },
    /// Waiting for the command failed.
    #[error("failed waiting for {program}: {source}{}", teardown_suffix(.teardown))]
    Wait {
        /// Program name.
        program: String,
        /// Wait error.
        #[source]
        source: io::Error,
        /// Teardown failure, when any.
        teardown: Option<TeardownError>,
    },
    /// The command finished but its exposures could not be fully removed.
    #[error("command exited with {exit_code} but {source}")]
    Teardown {
        /// Command exit code.
        exit_code: i32,
        /// Teardown failure.
        #[source]
        source: TeardownError,
    },
}

impl SupervisorError {
    /// Exit code reported for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorError::EmptyCommand
            | SupervisorError::InstallingSignals(_)
            | SupervisorError::Wait { .. } => EXIT_USAGE,
            SupervisorError::Exposure(_) => EXIT_EXPOSURE,
            SupervisorError::Interrupted { .. } => EXIT_INTERRUPTED,
            SupervisorError::Spawn { .. } => EXIT_SPAWN,
            SupervisorError::Teardown { .. } => EXIT_TEARDOWN,
        }
    }

    /// Stage label for diagnostics.
    pub fn stage(&self) -> &'static str {
        match self {
            SupervisorError::Exposure(_) => "exposure",
            SupervisorError::Teardown { .. } => "teardown",
            SupervisorError::Spawn { .. } => "spawn",
            SupervisorError::Interrupted { .. } => "interrupted",
            SupervisorError::EmptyCommand
            | SupervisorError::InstallingSignals(_)
            | SupervisorError::Wait { .. } => "supervisor",
        }
    }
}

fn teardown_suffix(teardown: &Option<TeardownError>) -> String {
    teardown
        .as_ref()
        .map(|error| format!("; {error}"))
        .unwrap_or_default()
}

/// Owns materialized records and tears them down exactly once.
///
/// [`ExposureGuard::release`] is the regular path; dropping an unreleased
/// guard tears down as a fallback.
struct ExposureGuard<'r, D: MountDriver> {
    runtime: &'r ExposureRuntime<D>,
    records: Option<Vec<ExposureRecord>>,
}

impl<'r, D: MountDriver> ExposureGuard<'r, D> {
    fn new(runtime: &'r ExposureRuntime<D>, records: Vec<ExposureRecord>) -> Self {
        Self {
            runtime,
            records: Some(records),
        }
    }

    fn release(mut self) -> Result<(), TeardownError> {
        match self.records.take() {
            Some(records) => self.runtime.teardown(records),
            None => Ok(()),
        }
    }
}

impl<D: MountDriver> Drop for ExposureGuard<'_, D> {
    fn drop(&mut self) {
        if let Some(records) = self.records.take() {
            if let Err(error) = self.runtime.teardown(records) {
                tracing::error!(%error, "teardown after unwinding failed");
            }
        }
    }
}

/// Spawns commands with their exposures materialized around them.
pub struct ProcessSupervisor<'r, D: MountDriver> {
    runtime: &'r ExposureRuntime<D>,
}

impl<'r, D: MountDriver> ProcessSupervisor<'r, D> {
    /// Creates a supervisor using `runtime` for exposures.
    pub fn new(runtime: &'r ExposureRuntime<D>) -> Self {
        Self { runtime }
    }

    /// Materializes `plan`, runs `argv`, waits for it and tears down.
    ///
    /// Returns the child's exit code, or `128 + N` when it was killed by signal `N`.
    pub fn run(&self, argv: &[String], plan: &ExposurePlan<'_>) -> Result<i32, SupervisorError> {
        let (program, args) = argv.split_first().ok_or(SupervisorError::EmptyCommand)?;
        let forwarder = SignalForwarder::install().map_err(SupervisorError::InstallingSignals)?;

        let (records, env) = self.runtime.materialize(plan)?.into_parts();
        let guard = ExposureGuard::new(self.runtime, records);

        if let Some(signal) = forwarder.pending_signal() {
            let teardown = guard.release().err();
            return Err(SupervisorError::Interrupted { signal, teardown });
        }

        let mut command = Command::new(program);
        command.args(args);
        for (name, value) in &env {
            value.expose(|bytes| {
                command.env(name, OsStr::from_bytes(bytes));
            });
        }

        let spawned = command.spawn();
        drop(command);
        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                let teardown = guard.release().err();
                return Err(SupervisorError::Spawn {
                    program: program.clone(),
                    source,
                    teardown,
                });
            }
        };
        tracing::info!(program = %program, pid = child.id(), "started command");
        forwarder.attach(child.id());
        let waited = child.wait();
        forwarder.detach();

        let teardown = guard.release();
        let status = match waited {
            Ok(status) => status,
            Err(source) => {
                return Err(SupervisorError::Wait {
                    program: program.clone(),
                    source,
                    teardown: teardown.err(),
                })
            }
        };
        let exit_code = exit_code_for(status);
        tracing::info!(program = %program, exit_code, "command finished");
        match teardown {
            Ok(()) => Ok(exit_code),
            Err(source) => Err(SupervisorError::Teardown { exit_code, source }),
        }
    }
}

/// Maps a child status to a shell-style exit code.
pub fn exit_code_for(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => EXIT_SIGNAL_BASE + signal,
        (None, None) => EXIT_USAGE,
    }
}
