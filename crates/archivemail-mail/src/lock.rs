//! Combined advisory + dotlock locking for mbox files, with bounded retry.
//!
//! The advisory lock is a non-blocking `flock(2)` on the open file. The
//! dotlock is a hard link named `<path>.lock` made from a uniquely-named
//! temp file in the same directory; on NFS the link(2) call may report
//! failure even though the link was created, which is detected by the temp
//! file's link count being 2.

use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use archivemail_core::{RunError, RunOptions, StaleHandle};
use log::{debug, warn};

/// Lock state for one mbox-format file. Composes into `Mbox` and
/// `ArchiveMbox` rather than being inherited by them.
#[derive(Debug, Default)]
pub struct MboxLock {
    locked: bool,
}

impl MboxLock {
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Acquire both locks, retrying a bounded number of times. A retry
    /// releases whatever that attempt acquired and sleeps first; once the
    /// budget is exhausted the failure becomes terminal.
    pub fn lock(
        &mut self,
        file: &File,
        path: &Path,
        options: &RunOptions,
        stale: &StaleHandle,
    ) -> Result<()> {
        debug_assert!(!self.locked);
        let mut attempt = 1;
        loop {
            match posix_lock(file, path).and_then(|()| dotlock_lock(path, options, stale)) {
                Ok(()) => break,
                Err(err) => {
                    posix_unlock(file, path);
                    match err.downcast_ref::<RunError>() {
                        Some(RunError::LockUnavailable(msg)) => {
                            attempt += 1;
                            if attempt > options.locking_attempts {
                                return Err(RunError::Unexpected(msg.clone()).into());
                            }
                            debug!("{msg} - sleeping...");
                            std::thread::sleep(options.lock_sleep);
                        }
                        _ => return Err(err),
                    }
                }
            }
        }
        self.locked = true;
        Ok(())
    }

    /// Release in reverse order of acquisition: dotlock first, then the
    /// advisory lock.
    pub fn unlock(&mut self, file: &File, path: &Path, stale: &StaleHandle) -> Result<()> {
        debug_assert!(self.locked);
        dotlock_unlock(path, stale)?;
        posix_unlock(file, path);
        self.locked = false;
        Ok(())
    }
}

fn posix_lock(file: &File, path: &Path) -> Result<()> {
    debug!("trying to acquire posix lock on file '{}'", path.display());
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) | Some(libc::EACCES) => Err(RunError::LockUnavailable(
                format!("posix lock for '{}' unavailable", path.display()),
            )
            .into()),
            _ => Err(anyhow!(err).context(format!(
                "cannot acquire posix lock on '{}'",
                path.display()
            ))),
        };
    }
    debug!("acquired posix lock on file '{}'", path.display());
    Ok(())
}

fn posix_unlock(file: &File, path: &Path) {
    debug!("dropping posix lock on file '{}'", path.display());
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

pub fn dotlock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn dotlock_lock(path: &Path, options: &RunOptions, stale: &StaleHandle) -> Result<()> {
    let lock_name = dotlock_path(path);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let basename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    let pid = std::process::id();
    debug!("trying to create dotlock file '{}'", lock_name.display());

    let prelock = tempfile::Builder::new()
        .prefix(&basename)
        .suffix(&format!(".{host}.{pid}.lock"))
        .tempfile_in(dir);
    let prelock = match prelock {
        Ok(prelock) => prelock,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            if !options.quiet {
                warn!(
                    "no write permissions: omitting dotlock for '{}'",
                    path.display()
                );
            }
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let link_result = std::fs::hard_link(prelock.path(), &lock_name);
    let acquired = match link_result {
        Ok(()) => true,
        Err(err) => {
            // link(2) over NFS can fail spuriously after creating the
            // link; a link count of 2 on the temp file means we won.
            let nlink = prelock.as_file().metadata().map(|meta| meta.nlink());
            if matches!(nlink, Ok(2)) {
                true
            } else if err.kind() == std::io::ErrorKind::AlreadyExists {
                return Err(RunError::LockUnavailable(format!(
                    "dotlock for '{}' unavailable",
                    path.display()
                ))
                .into());
            } else {
                return Err(err.into());
            }
        }
    };
    debug_assert!(acquired);
    stale
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .add_dotlock(lock_name.clone());
    // The prelock temp file unlinks itself on drop.
    debug!("acquired lockfile '{}'", lock_name.display());
    Ok(())
}

fn dotlock_unlock(path: &Path, stale: &StaleHandle) -> Result<()> {
    let lock_name = dotlock_path(path);
    debug!("removing lockfile '{}'", lock_name.display());
    match std::fs::remove_file(&lock_name) {
        Ok(()) => {}
        // Dotlock was skipped for lack of write permission, or someone
        // removed it; either way there is nothing left to release.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    stale
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .forget_dotlock(&lock_name);
    Ok(())
}
