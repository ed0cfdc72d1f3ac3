// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! The frame supervisor: admission gate, daemon lifecycle, and the glue
//! between the ledger, the cache, the attendants, and the dispatcher.
//!
//! A single mutex guards the ledger, the cache, and the daemon flags; it is
//! held only for short, non-blocking sections and never across transport,
//! filesystem, or subprocess calls. Attendants hand release and cache
//! removal back to the supervisor's bookkeeping thread as messages, so the
//! mutex is touched only here.

use crate::attendant;
use crate::cache::FrameCache;
use crate::error::Error;
use crate::frame::RunningFrame;
use crate::ledger::CoreLedger;
use crate::periodic::{PeriodicTask, spawn_periodic};
use parking_lot::{Condvar, Mutex};
use rqd_config::Settings;
use rqd_machine::Machine;
use rqd_nimby::audit::LockAuditSink;
use rqd_nimby::{IdleEventSource, LockWatcher, Nimby};
use rqd_report::{
    BootReport, DispatcherClient, FrameCompleteReport, FrameLaunch, HardwareState, HostReport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

/// Marker prefix of kill reasons issued by the idle lock; frames launched
/// with `ignore_idle_lock` are exempt from these kills.
pub const IDLE_LOCK_KILL_PREFIX: &str = "NIMBY";

/// What the daemon should do once it has torn itself down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitIntent {
    /// Plain exit.
    Shutdown,
    /// Exit with the respawn code so the service manager restarts the
    /// daemon.
    Respawn,
    /// The host reboot command has been issued; exit.
    Reboot,
}

pub(crate) enum Bookkeeping {
    FrameDone(Arc<RunningFrame>),
    Stop,
}

struct Shared {
    ledger: CoreLedger,
    cache: FrameCache,
    hardware_state: HardwareState,
    when_idle: bool,
    respawn: bool,
    reboot: bool,
}

#[derive(Default)]
struct ExitGate {
    intent: Mutex<Option<ExitIntent>>,
    condvar: Condvar,
}

pub(crate) struct SupervisorCore {
    self_ref: Weak<SupervisorCore>,
    pub(crate) settings: Settings,
    pub(crate) machine: Arc<Machine>,
    pub(crate) dispatcher: Arc<dyn DispatcherClient>,
    pub(crate) nimby: Nimby,
    shared: Mutex<Shared>,
    pub(crate) done_tx: flume::Sender<Bookkeeping>,
    done_rx: flume::Receiver<Bookkeeping>,
    timers: Mutex<Vec<PeriodicTask>>,
    bookkeeper: Mutex<Option<JoinHandle<()>>>,
    shutdown_scheduled: AtomicBool,
    exit: ExitGate,
}

/// The public face of the daemon: everything the inbound transport and the
/// binary call.
pub struct Supervisor {
    core: Arc<SupervisorCore>,
}

impl Supervisor {
    /// Builds the supervisor with an all-idle ledger sized from the probed
    /// topology.
    pub fn new(
        settings: Settings,
        machine: Arc<Machine>,
        dispatcher: Arc<dyn DispatcherClient>,
        nimby: Nimby,
    ) -> Self {
        let (done_tx, done_rx) = flume::unbounded();
        let ledger = CoreLedger::new(machine.topology());
        let core = Arc::new_cyclic(|self_ref| SupervisorCore {
            self_ref: self_ref.clone(),
            settings,
            machine,
            dispatcher,
            nimby,
            shared: Mutex::new(Shared {
                ledger,
                cache: FrameCache::new(),
                hardware_state: HardwareState::Up,
                when_idle: false,
                respawn: false,
                reboot: false,
            }),
            done_tx,
            done_rx,
            timers: Mutex::new(Vec::new()),
            bookkeeper: Mutex::new(None),
            shutdown_scheduled: AtomicBool::new(false),
            exit: ExitGate::default(),
        });
        Self { core }
    }

    /// Starts the bookkeeping thread and, when a source is wired, the
    /// idle-lock controller according to the startup policy: on for desktop
    /// hosts running as root, overridable either way by `nimby.startup`
    /// (a forced `true` also skips the root requirement).
    pub fn start<S: IdleEventSource>(
        &self,
        idle_source: Option<S>,
        audit: Arc<dyn LockAuditSink>,
    ) {
        self.core.start_bookkeeper();
        let Some(source) = idle_source else {
            return;
        };
        let forced = self.core.settings.nimby.startup == Some(true);
        let enabled = self
            .core
            .settings
            .nimby
            .startup
            .unwrap_or_else(|| self.core.machine.is_desktop());
        if !enabled {
            info!("idle lock disabled at startup");
        } else if !forced && !running_as_root() {
            warn!("not activating the idle lock, not running as root");
        } else {
            let watcher: Arc<dyn LockWatcher> = self.core.arc();
            self.core.nimby.start(
                source,
                watcher,
                audit,
                self.core.machine.hostname().to_owned(),
            );
        }
    }

    /// Called once the transport to the dispatcher is up: sends the boot
    /// report and starts the heartbeat and rss-sampler timers.
    pub fn connected(&self) {
        self.core.connected();
    }

    /// Admission gate. Rejects synchronously without mutating state; on
    /// success the frame's attendant is already running and this returns
    /// immediately.
    pub fn launch_frame(&self, launch: FrameLaunch) -> Result<(), Error> {
        self.core.launch_frame(launch)
    }

    /// Looks up the servant for a running frame.
    pub fn get_running_frame(&self, frame_id: &str) -> Result<Arc<RunningFrame>, Error> {
        self.core
            .shared
            .lock()
            .cache
            .get(frame_id)
            .ok_or_else(|| Error::FrameNotFound {
                frame_id: frame_id.to_owned(),
            })
    }

    /// Assembles the host report returned to `reportStatus` calls.
    pub fn report_status(&self) -> HostReport {
        self.core.host_report()
    }

    /// Withholds up to `num_cores` from scheduling.
    pub fn lock(&self, num_cores: u32) {
        self.core.lock(num_cores);
    }

    /// Withholds every core from scheduling.
    pub fn lock_all(&self) {
        self.core.lock_all();
    }

    /// Returns up to `num_cores` to scheduling and clears any deferred
    /// shutdown/restart/reboot intent.
    pub fn unlock(&self, num_cores: u32) {
        self.core.unlock(num_cores);
    }

    /// Returns every locked core to scheduling and clears any deferred
    /// shutdown/restart/reboot intent.
    pub fn unlock_all(&self) {
        self.core.unlock_all();
    }

    /// Kills every running frame. When `reason` starts with
    /// [`IDLE_LOCK_KILL_PREFIX`], frames launched with `ignore_idle_lock`
    /// are exempt. Blocks until the cache drains (or only exempt frames
    /// remain).
    pub fn kill_all(&self, reason: &str) {
        self.core.kill_all(reason);
    }

    /// Kills all frames and tears the daemon down.
    pub fn shutdown_now(&self) {
        self.core.shutdown_now();
    }

    /// Locks the host and tears down once the last frame completes.
    pub fn shutdown_when_idle(&self) {
        self.core.when_idle(false, false);
    }

    /// Kills all frames and tears down with the respawn intent.
    pub fn restart_now(&self) {
        self.core.shared.lock().respawn = true;
        self.core.shutdown_now();
    }

    /// Locks the host and respawns once the last frame completes.
    pub fn restart_when_idle(&self) {
        self.core.when_idle(true, false);
    }

    /// Kills all frames and reboots the host. Refused while a user is
    /// logged in.
    pub fn reboot_now(&self) -> Result<(), Error> {
        warn!("reboot requested");
        if self.core.machine.is_user_logged_in() {
            let reason = "rebooting is not supported while a user is logged in".to_owned();
            warn!("{reason}");
            return Err(Error::HostBusy { reason });
        }
        self.core.shared.lock().reboot = true;
        self.core.shutdown_now();
        Ok(())
    }

    /// Locks the host and reboots once the last frame completes and no user
    /// is logged in.
    pub fn reboot_when_idle(&self) {
        warn!("reboot-when-idle requested");
        self.core.when_idle(false, true);
    }

    /// Blocks until the daemon has torn itself down.
    pub fn wait_for_exit(&self) -> ExitIntent {
        let mut intent = self.core.exit.intent.lock();
        while intent.is_none() {
            self.core.exit.condvar.wait(&mut intent);
        }
        intent.unwrap_or(ExitIntent::Shutdown)
    }

    /// Like [`Supervisor::wait_for_exit`] with an upper bound; `None` when
    /// the daemon is still running.
    pub fn wait_for_exit_timeout(&self, timeout: Duration) -> Option<ExitIntent> {
        let deadline = std::time::Instant::now() + timeout;
        let mut intent = self.core.exit.intent.lock();
        while intent.is_none() {
            if self
                .core
                .exit
                .condvar
                .wait_until(&mut intent, deadline)
                .timed_out()
            {
                break;
            }
        }
        *intent
    }
}

impl SupervisorCore {
    pub(crate) fn arc(&self) -> Arc<SupervisorCore> {
        self.self_ref
            .upgrade()
            .expect("supervisor core outlives its threads")
    }

    fn start_bookkeeper(&self) {
        let core = self.arc();
        let rx = self.done_rx.clone();
        let builder = std::thread::Builder::new().name("bookkeeper".to_owned());
        match builder.spawn(move || {
            while let Ok(message) = rx.recv() {
                match message {
                    Bookkeeping::FrameDone(frame) => core.retire_frame(&frame),
                    Bookkeeping::Stop => break,
                }
            }
        }) {
            Ok(handle) => *self.bookkeeper.lock() = Some(handle),
            Err(e) => error!(error = %e, "failed to spawn the bookkeeping thread"),
        }
    }

    fn connected(&self) {
        let report = BootReport {
            host: self.render_host(),
            cores: self.shared.lock().ledger.snapshot(),
        };
        if let Err(e) = self.dispatcher.report_startup(report) {
            warn!(error = %e, "failed to send the startup report");
        }
        let rss_core = self.arc();
        let heartbeat_core = self.arc();
        let mut timers = self.timers.lock();
        for timer in timers.drain(..) {
            timer.cancel_and_join();
        }
        timers.push(spawn_periodic(
            "rss-sampler",
            self.settings.timers.rss_update_interval,
            move || rss_core.sample_rss(),
        ));
        timers.push(spawn_periodic(
            "heartbeat",
            self.settings.timers.ping_interval,
            move || heartbeat_core.heartbeat(),
        ));
    }

    fn launch_frame(&self, launch: FrameLaunch) -> Result<(), Error> {
        info!(frame_id = %launch.frame_id, command = %launch.command, "launch requested");
        let pin_set = {
            let mut shared = self.shared.lock();
            if shared.hardware_state != HardwareState::Up {
                return Err(refused("hardware state is not Up"));
            }
            if shared.when_idle {
                return Err(refused("daemon is waiting for idle to shut down"));
            }
            if self.nimby.is_locked() && !launch.ignore_idle_lock {
                return Err(refused("host is locked by user presence"));
            }
            if shared.cache.contains(&launch.frame_id) {
                error!(frame_id = %launch.frame_id, "frame is already running on this host");
                return Err(Error::DuplicateFrame {
                    frame_id: launch.frame_id.clone(),
                });
            }
            if launch.uid == 0 {
                warn!(uid = launch.uid, "refusing to run frame for this uid");
                return Err(Error::InvalidUser { uid: launch.uid });
            }
            if launch.num_cores == 0 {
                return Err(refused("requested core count must be positive"));
            }
            shared
                .ledger
                .reserve(&launch.frame_id, launch.num_cores, launch.threadable)?
        };

        let frame = Arc::new(RunningFrame::new(
            launch,
            pin_set,
            self.machine.platform(),
        ));
        let core = self.arc();
        let attendant_frame = Arc::clone(&frame);
        let thread_name = format!("frame-{}", frame.frame_id());
        let spawned = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || attendant::run(core, attendant_frame));
        if let Err(e) = spawned {
            // The attendant never ran; undo the reservation here.
            self.shared
                .lock()
                .ledger
                .release(frame.frame_id(), frame.launch().num_cores);
            return Err(Error::Internal {
                message: format!("failed to spawn the frame attendant: {e}"),
            });
        }
        Ok(())
    }

    pub(crate) fn store_frame(&self, frame: Arc<RunningFrame>) -> Result<(), Error> {
        self.shared.lock().cache.insert(frame)
    }

    fn retire_frame(&self, frame: &Arc<RunningFrame>) {
        let mut shared = self.shared.lock();
        shared
            .ledger
            .release(frame.frame_id(), frame.launch().num_cores);
        shared.cache.remove(frame);
        info!(frame_id = %frame.frame_id(), "frame retired");
    }

    fn kill_all(&self, reason: &str) {
        let idle_lock_kill = reason.starts_with(IDLE_LOCK_KILL_PREFIX);
        {
            let shared = self.shared.lock();
            if shared.cache.is_empty() {
                return;
            }
            warn!(reason, frames = ?shared.cache.frame_ids(), "killing all frames");
        }
        loop {
            let victims: Vec<Arc<RunningFrame>> = {
                let shared = self.shared.lock();
                if shared.cache.is_empty() {
                    return;
                }
                shared
                    .cache
                    .frames()
                    .into_iter()
                    .filter(|frame| !(idle_lock_kill && frame.launch().ignore_idle_lock))
                    .collect()
            };
            if victims.is_empty() {
                return;
            }
            for frame in victims {
                if let Err(e) = frame.kill(reason) {
                    warn!(frame_id = %frame.frame_id(), error = %e, "kill failed");
                }
            }
            std::thread::sleep(self.settings.timers.kill_all_pass_delay);
        }
    }

    fn shutdown_now(&self) {
        warn!("shutting down: killing all frames");
        self.shared.lock().hardware_state = HardwareState::Down;
        self.lock_all();
        self.kill_all("shutdown requested");
        let cache_empty = self.shared.lock().cache.is_empty();
        if cache_empty && !self.shutdown_scheduled.swap(true, Ordering::SeqCst) {
            let core = self.arc();
            let delay = self.settings.timers.shutdown_delay;
            let builder = std::thread::Builder::new().name("shutdown-timer".to_owned());
            if let Err(e) = builder.spawn(move || {
                std::thread::sleep(delay);
                core.finish();
            }) {
                error!(error = %e, "failed to spawn the shutdown timer");
                self.finish();
            }
        }
    }

    /// Shared tail of the when-idle lifecycle operations.
    fn when_idle(&self, respawn: bool, reboot: bool) {
        self.lock_all();
        {
            let mut shared = self.shared.lock();
            shared.when_idle = true;
            shared.respawn |= respawn;
            shared.reboot |= reboot;
        }
        self.send_status_report();
        let cache_empty = self.shared.lock().cache.is_empty();
        if cache_empty && !(reboot && self.machine.is_user_logged_in()) {
            self.shutdown_now();
        }
    }

    fn finish(&self) {
        warn!("daemon teardown started");
        self.nimby.stop();
        let timers: Vec<PeriodicTask> = self.timers.lock().drain(..).collect();
        for timer in timers {
            timer.cancel_and_join();
        }
        let _ = self.done_tx.send(Bookkeeping::Stop);
        if let Some(handle) = self.bookkeeper.lock().take() {
            if handle.join().is_err() {
                warn!("bookkeeping thread panicked at exit");
            }
        }
        let intent = {
            let shared = self.shared.lock();
            if shared.respawn {
                ExitIntent::Respawn
            } else if shared.reboot {
                ExitIntent::Reboot
            } else {
                ExitIntent::Shutdown
            }
        };
        match intent {
            ExitIntent::Respawn => warn!("respawning the daemon by request"),
            ExitIntent::Reboot => {
                if let Err(e) = self.machine.reboot() {
                    error!(error = %e, "reboot command failed");
                }
            }
            ExitIntent::Shutdown => warn!("shutting down the daemon by request"),
        }
        let mut gate = self.exit.intent.lock();
        *gate = Some(intent);
        let _ = self.exit.condvar.notify_all();
    }

    fn lock(&self, num_cores: u32) {
        let changed = self.shared.lock().ledger.lock(num_cores);
        if changed {
            self.send_status_report();
        }
    }

    fn lock_all(&self) {
        let changed = self.shared.lock().ledger.lock_all();
        if changed {
            self.send_status_report();
        }
    }

    fn unlock(&self, num_cores: u32) {
        let send_update = {
            let mut shared = self.shared.lock();
            let flags_cleared = self.clear_deferred_intents(&mut shared);
            let idle_locked = self.nimby.is_locked();
            shared.ledger.unlock(num_cores, idle_locked) || flags_cleared
        };
        if send_update {
            self.send_status_report();
        }
    }

    fn unlock_all(&self) {
        let send_update = {
            let mut shared = self.shared.lock();
            let flags_cleared = self.clear_deferred_intents(&mut shared);
            let idle_locked = self.nimby.is_locked();
            shared.ledger.unlock_all(idle_locked) || flags_cleared
        };
        if send_update {
            self.send_status_report();
        }
    }

    fn clear_deferred_intents(&self, shared: &mut Shared) -> bool {
        let had_intent = shared.when_idle
            || shared.respawn
            || shared.reboot
            || shared.hardware_state != HardwareState::Up;
        shared.when_idle = false;
        shared.respawn = false;
        shared.reboot = false;
        shared.hardware_state = HardwareState::Up;
        had_intent
    }

    fn heartbeat(&self) {
        let (when_idle, cache_empty) = {
            let shared = self.shared.lock();
            (shared.when_idle, shared.cache.is_empty())
        };
        if when_idle && cache_empty {
            if self.machine.is_user_logged_in() {
                warn!("shutdown requested but a user is logged in");
            } else {
                self.shutdown_now();
            }
        }
        self.send_status_report();
    }

    fn sample_rss(&self) {
        let frames = self.shared.lock().cache.frames();
        for frame in frames {
            if let Some(pid) = frame.pid() {
                if let Some(stats) = self.machine.proc_stats(pid) {
                    frame.update_sample(stats);
                }
            }
        }
    }

    fn render_host(&self) -> rqd_report::RenderHost {
        let hardware_state = self.shared.lock().hardware_state;
        self.machine
            .render_host(hardware_state, self.nimby.is_active(), self.nimby.is_locked())
    }

    fn host_report(&self) -> HostReport {
        let (cores, frames) = {
            let shared = self.shared.lock();
            (
                shared.ledger.snapshot(),
                shared
                    .cache
                    .frames()
                    .iter()
                    .map(|frame| frame.info())
                    .collect(),
            )
        };
        HostReport {
            host: self.render_host(),
            cores,
            frames,
        }
    }

    pub(crate) fn send_status_report(&self) {
        if let Err(e) = self.dispatcher.report_status(self.host_report()) {
            warn!(error = %e, "failed to send a status report");
        }
    }

    /// Builds and sends the completion report for one frame. An active idle
    /// lock overrides the exit status for non-exempt frames.
    pub(crate) fn send_frame_completion(&self, frame: &Arc<RunningFrame>) {
        let info = frame.info();
        let mut exit_status = info.exit_status.unwrap_or(1);
        if self.nimby.is_locked() && !frame.launch().ignore_idle_lock {
            exit_status = self.settings.frames.exit_status_for_idle_kill;
        }
        let report = FrameCompleteReport {
            host: self.render_host(),
            exit_status,
            exit_signal: info.exit_signal,
            run_time: info.run_time,
            frame: info,
        };
        if let Err(e) = self.dispatcher.report_frame_completion(report) {
            warn!(frame_id = %frame.frame_id(), error = %e,
                  "failed to send a frame completion report");
        }
    }
}

impl LockWatcher for SupervisorCore {
    fn on_lock(&self) {
        self.kill_all("NIMBY lock triggered by user activity");
        self.send_status_report();
    }

    fn on_unlock(&self, _as_of: Option<SystemTime>) {
        self.send_status_report();
    }
}

fn refused(reason: &str) -> Error {
    info!("not launching: {reason}");
    Error::CoreReservationFailure {
        reason: reason.to_owned(),
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    true
}
