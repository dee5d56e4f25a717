//! Swap a file (typically the running executable) for a new one.
//!
//! The sequence is backup, delete, copy. If any step fails the target is
//! restored from the backup, and the backup is removed at the end unless the
//! restore itself failed. Only one replacement per target may be in flight
//! at a time.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ReplaceError;
use crate::util;

#[derive(Debug, Clone, Copy)]
pub struct ReplaceOptions {
    /// How long to wait for a deleted target to disappear.
    pub delete_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ReplaceOptions {
    fn default() -> Self {
        ReplaceOptions {
            delete_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(25),
        }
    }
}

/// The two filesystem calls a replacement is made of.
pub trait ReplaceFs: Send + Sync + fmt::Debug {
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        fs::copy(from, to)
    }
}

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFs;

impl ReplaceFs for StdFs {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Started,
    BackedUp,
    Deleted,
    Copied,
}

#[derive(Debug, Clone)]
pub struct AtomicReplacer {
    options: ReplaceOptions,
    fs: Arc<dyn ReplaceFs>,
}

impl Default for AtomicReplacer {
    fn default() -> Self {
        AtomicReplacer::new(ReplaceOptions::default())
    }
}

impl AtomicReplacer {
    pub fn new(options: ReplaceOptions) -> Self {
        Self::with_fs(options, Arc::new(StdFs))
    }

    pub fn with_fs(options: ReplaceOptions, fs: Arc<dyn ReplaceFs>) -> Self {
        AtomicReplacer { options, fs }
    }

    /// `<target>.bak.<unix millis>`
    pub fn backup_path(target: &Path) -> PathBuf {
        util::sibling_with_suffix(target, &format!(".bak.{}", util::timestamp_millis()))
    }

    /// Replace `target` with a copy of `source`.
    ///
    /// On failure the original target content is back in place before the
    /// error is returned, except for [`ReplaceError::RollbackFailed`], which
    /// names the backup that still holds it.
    pub fn replace(&self, source: &Path, target: &Path) -> Result<(), ReplaceError> {
        let backup = Self::backup_path(target);
        let mut phase = Phase::Started;

        let result = match self.run(source, target, &backup, &mut phase) {
            Ok(()) => {
                log::info!("Replaced {} with {}", target.display(), source.display());
                Ok(())
            }
            Err(e) => {
                log::warn!("Replacing {} failed after {phase:?}: {e}", target.display());
                match self.rollback(&backup, target, phase) {
                    Ok(()) => Err(e),
                    Err(restore) => {
                        log::error!(
                            "Failed to restore {} from {}: {restore}",
                            target.display(),
                            backup.display()
                        );
                        return Err(ReplaceError::RollbackFailed {
                            cause: Box::new(e),
                            target: target.to_path_buf(),
                            backup,
                            source: restore,
                        });
                    }
                }
            }
        };

        self.remove_if_present(&backup);
        result
    }

    fn run(&self, source: &Path, target: &Path, backup: &Path, phase: &mut Phase) -> Result<(), ReplaceError> {
        let backup_failed = |source: io::Error| ReplaceError::BackupFailed {
            target: target.to_path_buf(),
            backup: backup.to_path_buf(),
            source,
        };
        self.fs.copy(target, backup).map_err(backup_failed)?;
        if !backup.is_file() {
            return Err(backup_failed(io::Error::new(
                io::ErrorKind::NotFound,
                "backup missing after copy",
            )));
        }
        *phase = Phase::BackedUp;
        log::debug!("Backed up {} to {}", target.display(), backup.display());

        let mut last_error = None;
        let gone = util::wait_until(self.options.delete_timeout, self.options.poll_interval, || {
            match self.fs.remove_file(target) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                // Still locked; try again on the next poll.
                Err(e) => last_error = Some(e),
            }
            !target.exists()
        });
        if !gone {
            if let Some(e) = last_error {
                log::warn!("Last delete attempt on {} failed: {e}", target.display());
            }
            return Err(ReplaceError::DeleteTimeout {
                target: target.to_path_buf(),
                timeout: self.options.delete_timeout,
            });
        }
        *phase = Phase::Deleted;

        let copy_failed = |source_err: io::Error| ReplaceError::CopyToTargetFailed {
            source_path: source.to_path_buf(),
            target: target.to_path_buf(),
            source: source_err,
        };
        self.fs.copy(source, target).map_err(copy_failed)?;
        if !target.exists() {
            return Err(copy_failed(io::Error::new(
                io::ErrorKind::NotFound,
                "target missing after copy",
            )));
        }
        *phase = Phase::Copied;

        Ok(())
    }

    /// Put the backup back after a failure in `phase`.
    fn rollback(&self, backup: &Path, target: &Path, phase: Phase) -> io::Result<()> {
        match phase {
            Phase::Started => return Ok(()),
            // The copy may have left a partial target behind.
            Phase::Deleted | Phase::Copied => self.remove_if_present(target),
            // A delete that timed out may still land later.
            Phase::BackedUp if target.exists() => return Ok(()),
            Phase::BackedUp => {}
        }
        self.fs.copy(backup, target)?;
        log::info!("Restored {} from backup", target.display());
        Ok(())
    }

    fn remove_if_present(&self, path: &Path) {
        match self.fs.remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove {}: {e}", path.display()),
        }
    }
}
