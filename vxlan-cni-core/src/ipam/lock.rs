use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use data_encoding::HEXLOWER;
use log::{debug, info, warn};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const LOCK_FILE_NAME: &str = "lock";
const RECLAIM_EXTENSION: &str = "reclaim";

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_TIME_TO_LIVE: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Couldn't access the host lock at '{}'! {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),
    #[error("Couldn't acquire the host lock within {:?}! Currently held by {}", .0, .1)]
    Timeout(Duration, String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockOwner {
    token: String,
    pid: u32,
    /// Start time of the owning process in clock ticks since boot, tells a
    /// live owner apart from an unrelated process that reused its pid.
    #[serde(default)]
    started: Option<u64>,
    acquired_at: DateTime<Utc>,
}

impl LockOwner {
    fn new() -> Self {
        let mut token = [0u8; 8];
        OsRng.fill_bytes(&mut token);
        let pid = std::process::id();

        Self {
            token: HEXLOWER.encode(&token),
            pid,
            started: process_start_time(pid).ok(),
            acquired_at: Utc::now(),
        }
    }

    fn is_alive(&self) -> bool {
        match process_start_time(self.pid) {
            Ok(started) => self.started.map_or(true, |recorded| recorded == started),
            Err(err) => err.kind() != ErrorKind::NotFound,
        }
    }

    fn describe(owner: &Option<LockOwner>) -> String {
        match owner {
            Some(owner) => format!("pid {} since {}", owner.pid, owner.acquired_at),
            None => "an unknown owner".to_owned(),
        }
    }
}

/// Reads field 22 of `/proc/<pid>/stat`. The command name in field 2 may
/// contain spaces and parentheses, so fields are counted from its closing
/// parenthesis.
fn process_start_time(pid: u32) -> std::io::Result<u64> {
    let stat = fs::read_to_string(Path::new("/proc").join(pid.to_string()).join("stat"))?;

    stat.rsplit_once(')')
        .and_then(|(_, fields)| fields.split_whitespace().nth(19))
        .and_then(|started| started.parse().ok())
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidData, "unexpected stat format"))
}

/// Host-wide mutual exclusion for the lease store.
///
/// The lock is a file created with `O_EXCL` that records its owner. A lock
/// whose owner process is gone is reclaimed by the next contender. A live
/// owner keeps the lock however long it holds it. The time-to-live only
/// applies to lock files without a readable owner.
#[derive(Debug, Clone)]
pub struct HostLock {
    path: PathBuf,
    retry_interval: Duration,
    time_to_live: Duration,
    timeout: Option<Duration>,
}

impl HostLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            time_to_live: DEFAULT_TIME_TO_LIVE,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(LOCK_FILE_NAME))
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn time_to_live(mut self, time_to_live: Duration) -> Self {
        self.time_to_live = time_to_live;
        self
    }

    /// `None` waits forever.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acquire(&self) -> Result<HostLockGuard, LockError> {
        let started = Instant::now();

        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }

            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    let owner = read_owner(&self.path).unwrap_or(None);
                    return Err(LockError::Timeout(timeout, LockOwner::describe(&owner)));
                }
            }

            thread::sleep(self.retry_interval);
        }
    }

    pub fn try_acquire(&self) -> Result<Option<HostLockGuard>, LockError> {
        if let Some(guard) = self.try_create()? {
            return Ok(Some(guard));
        }

        let owner = match read_owner(&self.path) {
            Ok(owner) => owner,
            Err(err) if err.kind() == ErrorKind::NotFound => return self.try_create(),
            Err(err) => return Err(LockError::Io(self.path.clone(), err)),
        };

        let stale = match &owner {
            Some(owner) => !owner.is_alive(),
            // unreadable owner, either mid-write or garbage left by a crash
            None => modified_before(&self.path, self.time_to_live),
        };

        if !stale || !self.reclaim(&owner)? {
            return Ok(None);
        }

        self.try_create()
    }

    fn try_create(&self) -> Result<Option<HostLockGuard>, LockError> {
        let io_error = |err| LockError::Io(self.path.clone(), err);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => return Err(io_error(err)),
        };

        let owner = LockOwner::new();
        let written = serde_json::to_vec(&owner)
            .map_err(std::io::Error::from)
            .and_then(|content| file.write_all(&content))
            .and_then(|_| file.sync_all());

        if let Err(err) = written {
            let _ = fs::remove_file(&self.path);
            return Err(io_error(err));
        }

        debug!("Acquired host lock {}", self.path.display());

        Ok(Some(HostLockGuard {
            path: self.path.clone(),
            token: owner.token,
        }))
    }

    /// Removes a stale lock. Reclaimers are serialized through a marker file
    /// created with `O_EXCL`, and the lock is only removed if it still
    /// records the owner that was found stale. Nothing but a reclaimer
    /// removes a lock of a dead owner, so a fresh lock is never removed.
    fn reclaim(&self, stale: &Option<LockOwner>) -> Result<bool, LockError> {
        let marker = self.path.with_extension(RECLAIM_EXTENSION);
        let io_error = |err| LockError::Io(marker.clone(), err);

        match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(_) => (),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                // a reclaimer that died halfway leaves its marker behind
                if modified_before(&marker, self.time_to_live) {
                    warn!("Removing abandoned reclaim marker {}", marker.display());
                    let _ = fs::remove_file(&marker);
                }

                return Ok(false);
            }
            Err(err) => return Err(io_error(err)),
        }

        let removed = self.remove_if_owned_by(stale);
        let _ = fs::remove_file(&marker);

        removed
    }

    fn remove_if_owned_by(&self, stale: &Option<LockOwner>) -> Result<bool, LockError> {
        let io_error = |err| LockError::Io(self.path.clone(), err);

        match read_owner(&self.path) {
            Ok(current) if current == *stale => (),
            Ok(_) => return Ok(false),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(io_error(err)),
        }

        warn!(
            "Reclaiming stale host lock held by {}",
            LockOwner::describe(stale)
        );

        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
            Err(err) => Err(io_error(err)),
        }
    }
}

fn modified_before(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map(|elapsed| elapsed > age)
        .unwrap_or(false)
}

fn read_owner(path: &Path) -> std::io::Result<Option<LockOwner>> {
    let content = fs::read(path)?;

    Ok(serde_json::from_slice(&content).ok())
}

/// Releases the host lock when dropped.
#[derive(Debug)]
pub struct HostLockGuard {
    path: PathBuf,
    token: String,
}

impl HostLockGuard {
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for HostLockGuard {
    fn drop(&mut self) {
        match read_owner(&self.path) {
            Ok(Some(owner)) if owner.token == self.token => {
                if let Err(err) = fs::remove_file(&self.path) {
                    warn!("Couldn't release host lock {}! {err}", self.path.display());
                    return;
                }

                debug!("Released host lock {}", self.path.display());
            }
            Ok(_) => info!(
                "Host lock {} was reclaimed by another process, leaving it alone",
                self.path.display()
            ),
            Err(err) => warn!(
                "Couldn't read host lock {} on release! {err}",
                self.path.display()
            ),
        }
    }
}
