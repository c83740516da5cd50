//! # Shared Session Slot
//!
//! The one piece of state shared between independent surfaces: the id of
//! the call that is currently live, if any. The caller surface writes it,
//! monitor surfaces mirror it.
//!
//! ## Storage:
//! One file per key under the configured directory. Writes go to a temp
//! file and are renamed into place, so a reader never sees half an id.
//! A missing or empty file means "no active session".
//!
//! ## Discipline:
//! - **Single writer**: `SlotWriter` is a claimable capability; a second
//!   claim on the same slot fails while the first writer is alive
//! - **Many readers**: `SlotMirror` follows in-process writes through a
//!   `watch` channel and re-reads the file on a short interval to pick up
//!   writers in other processes
//! - The value is a hint; readers re-validate it through the session status

use crate::error::{AppError, AppResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

struct SlotInner {
    path: PathBuf,
    key: String,
    notify: watch::Sender<Option<String>>,
    writer_claimed: AtomicBool,
}

/// Handle to one key of the shared slot directory.
#[derive(Clone)]
pub struct SharedSlot {
    inner: Arc<SlotInner>,
}

impl SharedSlot {
    /// Open (creating the directory if needed) the slot for `key`.
    pub async fn open(dir: &Path, key: &str) -> AppResult<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(key);
        let current = read_slot_file(&path).await?;
        let (notify, _) = watch::channel(current);

        debug!("Shared slot at {}", path.display());
        Ok(Self {
            inner: Arc::new(SlotInner {
                path,
                key: key.to_string(),
                notify,
                writer_claimed: AtomicBool::new(false),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Current value on disk.
    pub async fn read(&self) -> AppResult<Option<String>> {
        read_slot_file(&self.inner.path).await
    }

    /// Notifications for writes made through this handle (or its clones).
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.inner.notify.subscribe()
    }

    /// Take the writer capability.
    pub fn claim_writer(&self) -> AppResult<SlotWriter> {
        if self
            .inner
            .writer_claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::Internal(format!(
                "Slot '{}' already has a writer",
                self.inner.key
            )));
        }
        Ok(SlotWriter {
            slot: self.clone(),
        })
    }
}

/// The only handle allowed to change the slot. Dropping it releases the
/// claim but leaves the stored value untouched.
pub struct SlotWriter {
    slot: SharedSlot,
}

impl SlotWriter {
    /// Publish `session_id` as the active session.
    pub async fn publish(&self, session_id: &str) -> AppResult<()> {
        let path = &self.slot.inner.path;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, session_id.as_bytes()).await?;
        tokio::fs::rename(&tmp, path).await?;

        self.slot.inner.notify.send_replace(Some(session_id.to_string()));
        info!("Published active session {}", session_id);
        Ok(())
    }

    /// Remove the active session id. Clearing an empty slot is fine.
    pub async fn clear(&self) -> AppResult<()> {
        match tokio::fs::remove_file(&self.slot.inner.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.slot.inner.notify.send_replace(None);
        info!("Cleared active session");
        Ok(())
    }
}

impl Drop for SlotWriter {
    fn drop(&mut self) {
        self.slot.inner.writer_claimed.store(false, Ordering::SeqCst);
    }
}

async fn read_slot_file(path: &Path) -> AppResult<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let value = contents.trim();
            Ok((!value.is_empty()).then(|| value.to_string()))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read-only follower of the slot: change notification plus polling.
pub struct SlotMirror {
    rx: watch::Receiver<Option<String>>,
    task: JoinHandle<()>,
}

impl SlotMirror {
    pub fn spawn(slot: SharedSlot, poll_interval: Duration) -> Self {
        let initial = slot.inner.notify.borrow().clone();
        let (tx, rx) = watch::channel(initial);
        let task = tokio::spawn(run_mirror(slot, poll_interval, tx));
        Self { rx, task }
    }

    /// Mirrored session id; usable directly as a poller input.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.rx.clone()
    }

    pub fn current(&self) -> Option<String> {
        self.rx.borrow().clone()
    }
}

impl Drop for SlotMirror {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_mirror(slot: SharedSlot, poll_interval: Duration, tx: watch::Sender<Option<String>>) {
    let mut notifications = slot.subscribe();
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let observed = tokio::select! {
            changed = notifications.changed() => {
                if changed.is_err() {
                    break;
                }
                notifications.borrow_and_update().clone()
            }
            _ = ticker.tick() => match slot.read().await {
                Ok(value) => value,
                Err(e) => {
                    warn!("Failed to read shared slot: {}", e);
                    continue;
                }
            },
        };

        tx.send_if_modified(|current| {
            if *current == observed {
                return false;
            }
            match &observed {
                Some(id) => info!("Mirrored active session {}", id),
                None => info!("Mirrored session cleared"),
            }
            *current = observed;
            true
        });
    }
}
