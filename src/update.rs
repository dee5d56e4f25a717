//! Drives a self-update across process boundaries.
//!
//! The running program downloads the new executable next to itself, then
//! starts a helper copy with `update <pid> <target> <source> <restart>` and
//! exits. The helper waits for that pid to go away, swaps the files, and
//! relaunches the target with `update_finished <source>` or
//! `update_failed <reason>` so the new (or restored) program can clean up or
//! tell the user what happened.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::replace::AtomicReplacer;
use crate::util;

pub const UPDATE_ARG: &str = "update";
pub const UPDATE_FINISHED_ARG: &str = "update_finished";
pub const UPDATE_FAILED_ARG: &str = "update_failed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCommand {
    Update {
        old_pid: u32,
        target: PathBuf,
        source: PathBuf,
        restart: bool,
    },
    Finished {
        source: PathBuf,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    WaitingForOldProcess,
    Replacing,
    Relaunching,
    ReportingResult,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The target was replaced (and relaunched if requested).
    Replaced,
    /// The `update` branch failed; the target holds its previous content.
    ReplaceFailed(String),
    /// Leftovers from a finished update were cleaned up.
    CleanedUp,
    /// A failure reported by an earlier `update` run.
    ReportedFailure(String),
}

impl UpdateOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            UpdateOutcome::Replaced | UpdateOutcome::CleanedUp => 0,
            UpdateOutcome::ReportedFailure(_) => 1,
            UpdateOutcome::ReplaceFailed(_) => 2,
        }
    }
}

/// Starts the replaced program again.
pub trait Relauncher {
    fn relaunch(&self, program: &Path, args: &[OsString]) -> io::Result<()>;
}

/// Spawns the program as a detached child and does not wait for it.
#[derive(Debug, Default)]
pub struct ProcessRelauncher;

impl Relauncher for ProcessRelauncher {
    fn relaunch(&self, program: &Path, args: &[OsString]) -> io::Result<()> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = program.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        let child = command.spawn()?;
        log::info!("Relaunched {} as pid {}", program.display(), child.id());
        Ok(())
    }
}

pub struct UpdateCoordinator<L: Relauncher = ProcessRelauncher> {
    replacer: AtomicReplacer,
    relauncher: L,
    wait_timeout: Duration,
    poll_interval: Duration,
    state: UpdateState,
    history: Vec<UpdateState>,
}

impl UpdateCoordinator<ProcessRelauncher> {
    pub fn new(replacer: AtomicReplacer) -> Self {
        Self::with_relauncher(replacer, ProcessRelauncher)
    }
}

impl<L: Relauncher> UpdateCoordinator<L> {
    pub fn with_relauncher(replacer: AtomicReplacer, relauncher: L) -> Self {
        UpdateCoordinator {
            replacer,
            relauncher,
            wait_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            state: UpdateState::Idle,
            history: vec![UpdateState::Idle],
        }
    }

    /// Bound on how long to wait for the old process before going ahead.
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Every state visited so far, starting with `Idle`.
    pub fn history(&self) -> &[UpdateState] {
        &self.history
    }

    pub fn relauncher(&self) -> &L {
        &self.relauncher
    }

    fn enter(&mut self, state: UpdateState) {
        log::debug!("Update state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.history.push(state);
    }

    /// Execute one startup command to completion. Never fails; every error
    /// is folded into the returned outcome.
    pub fn run(&mut self, command: UpdateCommand) -> UpdateOutcome {
        let outcome = match command {
            UpdateCommand::Update {
                old_pid,
                target,
                source,
                restart,
            } => self.run_update(old_pid, &target, &source, restart),
            UpdateCommand::Finished { source } => {
                cleanup_source(&source);
                log::info!("Update finished");
                UpdateOutcome::CleanedUp
            }
            UpdateCommand::Failed { reason } => {
                log::error!("Update failed: {reason}");
                log::error!("The previous version is still installed. Download the update manually to retry.");
                UpdateOutcome::ReportedFailure(reason)
            }
        };
        self.enter(UpdateState::Finished);
        outcome
    }

    fn run_update(&mut self, old_pid: u32, target: &Path, source: &Path, restart: bool) -> UpdateOutcome {
        self.enter(UpdateState::WaitingForOldProcess);
        if !wait_for_exit(old_pid, self.wait_timeout, self.poll_interval) {
            log::warn!(
                "Process {old_pid} still running after {:?}; replacing anyway",
                self.wait_timeout
            );
        }

        self.enter(UpdateState::Replacing);
        let result = self.replacer.replace(source, target);

        let outcome = match &result {
            Ok(()) => UpdateOutcome::Replaced,
            Err(e) => UpdateOutcome::ReplaceFailed(e.to_string()),
        };

        if restart {
            self.enter(UpdateState::Relaunching);
            let args: Vec<OsString> = match &result {
                Ok(()) => vec![UPDATE_FINISHED_ARG.into(), source.as_os_str().to_owned()],
                Err(e) => vec![UPDATE_FAILED_ARG.into(), e.to_string().into()],
            };
            if let Err(e) = self.relauncher.relaunch(target, &args) {
                log::error!("Failed to relaunch {}: {e}", target.display());
                self.enter(UpdateState::ReportingResult);
                return match outcome {
                    UpdateOutcome::Replaced => {
                        UpdateOutcome::ReplaceFailed(format!("relaunch failed: {e}"))
                    }
                    other => other,
                };
            }
        }

        self.enter(UpdateState::ReportingResult);
        match &outcome {
            UpdateOutcome::Replaced => log::info!("Updated {}", target.display()),
            UpdateOutcome::ReplaceFailed(reason) => log::error!("Update of {} failed: {reason}", target.display()),
            _ => {}
        }
        outcome
    }
}

/// Best-effort wait for `pid` to exit. A pid that cannot be found counts as
/// already exited. Returns false only if the process outlived `timeout`.
pub fn wait_for_exit(pid: u32, timeout: Duration, interval: Duration) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    util::wait_until(timeout, interval, || {
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).is_none()
    })
}

fn cleanup_source(source: &Path) {
    match fs::remove_file(source) {
        Ok(()) => log::info!("Removed update file {}", source.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove update file {}: {e}", source.display()),
    }
}
