//! Fire-and-forget execution of remediation programs
//!
//! Every [`Action`] is bound to one external executable. Dispatching starts
//! the program on a detached task and returns immediately; the outcome only
//! ever shows up in the log. Nothing is retried and nothing is reported back
//! to the ingestion cycle.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::config::ActionsConfig;
use crate::thresholds::{Action, Trigger};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to launch {}: {source}", .program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} exited with status {code}", .program.display())]
    NonZeroExit { program: PathBuf, code: i32 },

    #[error("{} was terminated by a signal", .program.display())]
    Signalled { program: PathBuf },
}

/// Something that can act on a triggered threshold.
///
/// Implementations must not block: the ingestion loop calls this inline.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, trigger: &Trigger);
}

/// Runs the configured shell scripts
#[derive(Debug, Clone)]
pub struct ScriptDispatcher {
    cleanup: PathBuf,
    alert: PathBuf,
}

impl ScriptDispatcher {
    pub fn new(config: &ActionsConfig) -> Self {
        Self {
            cleanup: config.cleanup.clone(),
            alert: config.alert.clone(),
        }
    }

    pub fn program(&self, action: Action) -> &Path {
        match action {
            Action::Cleanup => &self.cleanup,
            Action::Alert => &self.alert,
        }
    }

    /// Start the program for `action` on a detached task.
    ///
    /// The handle is only useful to tests; production callers drop it.
    pub fn spawn(&self, action: Action) -> JoinHandle<Result<(), DispatchError>> {
        let program = self.program(action).to_path_buf();

        tokio::spawn(async move {
            let result = run_program(&program).await;
            match &result {
                Ok(()) => info!("{action} action {} completed", program.display()),
                Err(e) => error!("{action} action failed: {e}"),
            }
            result
        })
    }
}

impl Dispatch for ScriptDispatcher {
    #[instrument(skip_all, fields(metric = %trigger.metric, action = %trigger.action))]
    fn dispatch(&self, trigger: &Trigger) {
        // dropping the handle detaches the task
        let _ = self.spawn(trigger.action);
    }
}

async fn run_program(program: &Path) -> Result<(), DispatchError> {
    let status = Command::new(program)
        .stdin(std::process::Stdio::null())
        .status()
        .await
        .map_err(|source| DispatchError::Launch {
            program: program.to_path_buf(),
            source,
        })?;

    check_status(program, status)
}

fn check_status(program: &Path, status: ExitStatus) -> Result<(), DispatchError> {
    if status.success() {
        return Ok(());
    }

    match status.code() {
        Some(code) => Err(DispatchError::NonZeroExit {
            program: program.to_path_buf(),
            code,
        }),
        None => {
            warn!("{} has no exit code", program.display());
            Err(DispatchError::Signalled {
                program: program.to_path_buf(),
            })
        }
    }
}
