//! Advisory, PID-aware file locks
//!
//! A lock is a marker file created with `create_new`, holding
//! `pid:unix_seconds`. Existence means held. A lock whose holder process is
//! gone, whose age exceeds the stale threshold, or whose content does not
//! parse is stale and may be broken by any acquirer.
//!
//! Breaking a stale lock happens under a short-lived `<lock>.break` file, so
//! only one acquirer at a time can remove it. The breaker moves the lock to a
//! tombstone and keeps it removed only if the tombstone still holds the
//! content it judged stale; anything else is put back.
//!
//! Locks only coordinate threads and processes on one machine. They live in
//! the synchronized data directory but are never staged, and cross-machine
//! exclusion comes from git's ref updates alone.

use crate::error::LockError;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Sleep between acquisition attempts
pub const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// An empty lock file younger than this is a writer mid-creation, not corruption
const EMPTY_LOCK_GRACE: Duration = Duration::from_secs(1);

/// Stale-lock breaks attempted per poll before yielding
const MAX_BREAKS_PER_ATTEMPT: usize = 3;

/// A break marker older than this was left by a crashed breaker
const BREAKER_STALE_AFTER: Duration = Duration::from_secs(10);

/// Parsed lock file content
#[derive(Debug, Clone, PartialEq)]
pub struct LockHolder {
    pub pid: u32,
    /// Seconds since the unix epoch
    pub acquired_at: f64,
}

impl LockHolder {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: unix_now(),
        }
    }

    pub fn parse(content: &str) -> Option<Self> {
        let (pid, ts) = content.trim().split_once(':')?;
        let pid = pid.trim().parse().ok()?;
        let acquired_at: f64 = ts.trim().parse().ok()?;
        if !acquired_at.is_finite() {
            return None;
        }
        Some(Self { pid, acquired_at })
    }

    pub fn render(&self) -> String {
        format!("{}:{:.6}", self.pid, self.acquired_at)
    }

    /// Age of the lock; zero when the timestamp is in the future
    pub fn age(&self) -> Duration {
        Duration::try_from_secs_f64(unix_now() - self.acquired_at).unwrap_or(Duration::ZERO)
    }
}

/// What the acquirer found when the lock file already existed
#[derive(Debug)]
enum Existing {
    Held(LockHolder),
    Stale { content: String, reason: String },
    Vanished,
}

/// A named advisory lock
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    stale_after: Duration,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is acquired or `max_wait` elapses
    pub fn acquire(&self, max_wait: Duration) -> Result<LockGuard, LockError> {
        let start = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            let waited = start.elapsed();
            if waited >= max_wait {
                debug!(path = %self.path.display(), ?waited, "Lock acquisition timed out");
                return Err(LockError::Timeout {
                    path: self.path.clone(),
                    waited,
                });
            }
            thread::sleep(POLL_INTERVAL.min(max_wait - waited));
        }
    }

    /// One non-blocking attempt; stale locks are broken and retried immediately
    pub fn try_acquire(&self) -> Result<Option<LockGuard>, LockError> {
        for _ in 0..MAX_BREAKS_PER_ATTEMPT {
            match self.create() {
                Ok(guard) => return Ok(Some(guard)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if let Some(parent) = self.path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            match self.inspect()? {
                Existing::Held(_) => return Ok(None),
                Existing::Vanished => continue,
                Existing::Stale { content, reason } => {
                    if !self.break_stale(&content, &reason)? {
                        return Ok(None);
                    }
                }
            }
        }
        Ok(None)
    }

    /// Current holder, if the lock is held and not stale
    pub fn holder(&self) -> Result<Option<LockHolder>, LockError> {
        match self.inspect()? {
            Existing::Held(holder) => Ok(Some(holder)),
            _ => Ok(None),
        }
    }

    pub fn is_held(&self) -> bool {
        matches!(self.holder(), Ok(Some(_)))
    }

    fn create(&self) -> std::io::Result<LockGuard> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        let token = LockHolder::current().render();
        if let Err(e) = file.write_all(token.as_bytes()).and_then(|_| file.flush()) {
            let _ = fs::remove_file(&self.path);
            return Err(e);
        }
        Ok(LockGuard {
            path: self.path.clone(),
            token,
            released: false,
        })
    }

    /// Remove the lock file if it still holds `seen`.
    ///
    /// Returns false when another acquirer is breaking it or it changed
    /// since it was inspected.
    fn break_stale(&self, seen: &str, reason: &str) -> Result<bool, LockError> {
        let marker = self.sibling("break");
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if !younger_than(&marker, BREAKER_STALE_AFTER) {
                    warn!(path = %marker.display(), "Removing abandoned break marker");
                    remove_quietly(&marker)?;
                }
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let _ = file.write_all(LockHolder::current().render().as_bytes());
        drop(file);

        let broken = self.move_aside_if_unchanged(seen);
        remove_quietly(&marker)?;
        let broken = broken?;
        if broken {
            warn!(path = %self.path.display(), %reason, "Broke stale lock");
        }
        Ok(broken)
    }

    fn move_aside_if_unchanged(&self, seen: &str) -> Result<bool, LockError> {
        match fs::read_to_string(&self.path) {
            Ok(current) if current == seen => {}
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        // An aged holder can still release and someone re-acquire before the rename
        let tombstone = self.sibling(&format!("stale.{}", uuid::Uuid::new_v4().simple()));
        match fs::rename(&self.path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let moved = fs::read_to_string(&tombstone).unwrap_or_default();
        if moved == seen {
            remove_quietly(&tombstone)?;
            return Ok(true);
        }

        // Released and re-acquired since inspection; hand it back
        debug!(path = %self.path.display(), "Lock changed before it could be broken");
        if let Err(e) = fs::hard_link(&tombstone, &self.path) {
            warn!(path = %self.path.display(), error = %e, "Could not restore lock taken during break");
        }
        remove_quietly(&tombstone)?;
        Ok(false)
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".");
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn inspect(&self) -> Result<Existing, LockError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Existing::Vanished),
            Err(e) => return Err(e.into()),
        };

        let Some(holder) = LockHolder::parse(&content) else {
            if content.trim().is_empty() && younger_than(&self.path, EMPTY_LOCK_GRACE) {
                return Ok(Existing::Held(LockHolder::current()));
            }
            let reason = format!("unparsable content {:?}", content.trim());
            return Ok(Existing::Stale { content, reason });
        };

        if !is_process_alive(holder.pid) {
            let reason = format!("holder pid {} is not running", holder.pid);
            return Ok(Existing::Stale { content, reason });
        }
        let age = holder.age();
        if age > self.stale_after {
            let reason = format!("held by pid {} for {:.1}s", holder.pid, age.as_secs_f64());
            return Ok(Existing::Stale { content, reason });
        }
        Ok(Existing::Held(holder))
    }
}

fn younger_than(path: &Path, grace: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map(|age| age < grace)
        .unwrap_or(false)
}

fn remove_quietly(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Held lock; the file is removed on release or drop
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly, surfacing IO errors that drop would swallow
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        remove_if_owned(&self.path, &self.token)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = remove_if_owned(&self.path, &self.token) {
                warn!(path = %self.path.display(), error = %e, "Failed to release lock");
            }
        }
    }
}

/// Only delete the lock file if it still carries our token; a stale break may
/// have handed it to someone else.
fn remove_if_owned(path: &Path, token: &str) -> Result<(), LockError> {
    match fs::read_to_string(path) {
        Ok(content) if content.trim() == token => match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        },
        Ok(_) => {
            warn!(path = %path.display(), "Lock was taken over before release");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Check whether a process with the given PID exists.
///
/// On Unix, `kill(pid, 0)` checks for the process without signalling it; `EPERM` means the
/// process exists under another user. Elsewhere the holder is assumed alive,
/// so only the age threshold breaks locks.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}
