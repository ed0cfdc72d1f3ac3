// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! Idle-lock ("NIMBY") controller.
//!
//! When a human uses the host's input devices, render work must get out of
//! the way. The concrete input-device watcher lives outside this workspace
//! and feeds [`IdleEvent`]s through an [`IdleEventSource`]; this crate owns
//! the lock state machine, the watcher thread, the audit trail, and the
//! callback seam ([`LockWatcher`]) through which the supervisor kills
//! running frames on lock.
//!
//! Locking does not re-credit ledger cores and unlocking does not hand them
//! back; the explicit lock/unlock operations on the supervisor own core
//! accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tracing::{info, warn};

pub mod audit;

use audit::{LockAuditRow, LockAuditSink};

/// A user-presence transition reported by the input-device watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// Input activity was observed; the host is in use.
    UserActive,
    /// The host has been idle long enough to resume render work.
    UserIdle {
        /// When the idle period began, if the watcher knows.
        as_of: Option<SystemTime>,
    },
}

/// Blocking source of user-presence transitions.
pub trait IdleEventSource: Send + 'static {
    /// Blocks until the next transition; `None` once the source is closed.
    fn next_event(&mut self) -> Option<IdleEvent>;
}

/// Channel-backed [`IdleEventSource`].
#[derive(Debug)]
pub struct ChannelIdleSource {
    rx: flume::Receiver<IdleEvent>,
}

impl IdleEventSource for ChannelIdleSource {
    fn next_event(&mut self) -> Option<IdleEvent> {
        self.rx.recv().ok()
    }
}

/// Creates the feeding side and the source half of an idle-event channel.
/// The device watcher keeps the sender; dropping it closes the source and
/// ends the watcher thread.
pub fn idle_event_channel() -> (flume::Sender<IdleEvent>, ChannelIdleSource) {
    let (tx, rx) = flume::unbounded();
    (tx, ChannelIdleSource { rx })
}

/// Reactions to lock transitions, implemented by the supervisor.
pub trait LockWatcher: Send + Sync {
    /// The host became locked; running non-exempt frames must be killed and
    /// a status report sent.
    fn on_lock(&self);
    /// The host unlocked after sufficient idle time; a status report must be
    /// sent. Cores are NOT re-credited here.
    fn on_unlock(&self, as_of: Option<SystemTime>);
}

#[derive(Debug, Default)]
struct Inner {
    active: AtomicBool,
    locked: AtomicBool,
}

/// The idle-lock state machine. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct Nimby {
    inner: Arc<Inner>,
}

impl Nimby {
    /// Creates an inactive, unlocked controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the controller is watching for user presence.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Whether the idle lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.inner.locked.load(Ordering::SeqCst)
    }

    /// Activates the controller and spawns the watcher thread. Repeated
    /// activation is a no-op.
    pub fn start<S: IdleEventSource>(
        &self,
        mut source: S,
        watcher: Arc<dyn LockWatcher>,
        audit: Arc<dyn LockAuditSink>,
        hostname: String,
    ) {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("idle-lock controller activated");
        let inner = Arc::clone(&self.inner);
        let builder = std::thread::Builder::new().name("nimby-watch".to_owned());
        let spawned = builder.spawn(move || {
            while let Some(event) = source.next_event() {
                if !inner.active.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    IdleEvent::UserActive => {
                        if !inner.locked.swap(true, Ordering::SeqCst) {
                            warn!("user activity detected, locking host");
                            audit.record(LockAuditRow::new(
                                &hostname,
                                true,
                                inner.active.load(Ordering::SeqCst),
                                None,
                            ));
                            watcher.on_lock();
                        }
                    }
                    IdleEvent::UserIdle { as_of } => {
                        if inner.locked.swap(false, Ordering::SeqCst) {
                            info!("host idle long enough, unlocking");
                            audit.record(LockAuditRow::new(
                                &hostname,
                                false,
                                inner.active.load(Ordering::SeqCst),
                                as_of,
                            ));
                            watcher.on_unlock(as_of);
                        }
                    }
                }
            }
            inner.active.store(false, Ordering::SeqCst);
        });
        if let Err(e) = spawned {
            self.inner.active.store(false, Ordering::SeqCst);
            warn!(error = %e, "failed to spawn the nimby watcher thread");
        }
    }

    /// Deactivates the controller and drops any held lock. The watcher
    /// thread exits at its next event or when its source closes.
    pub fn stop(&self) {
        if self.inner.active.swap(false, Ordering::SeqCst) {
            info!("idle-lock controller deactivated");
        }
        self.inner.locked.store(false, Ordering::SeqCst);
    }
}
