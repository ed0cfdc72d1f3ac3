// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end supervisor scenarios: real subprocesses, a scripted platform,
//! a capturing dispatcher, and a channel-fed idle lock.

use rqd_config::Settings;
use rqd_core::error::Error;
use rqd_core::supervisor::{ExitIntent, Supervisor};
use rqd_machine::Machine;
use rqd_machine::platform::CoreTopology;
use rqd_machine::testing::FakePlatform;
use rqd_nimby::audit::{LockAuditRow, LockAuditSink};
use rqd_nimby::{IdleEvent, Nimby, idle_event_channel};
use rqd_report::testing::CapturingDispatcher;
use rqd_report::{CoreDetail, FrameLaunch, HardwareState};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[derive(Default)]
struct CapturingAudit {
    rows: Mutex<Vec<LockAuditRow>>,
}

impl CapturingAudit {
    fn rows(&self) -> Vec<LockAuditRow> {
        self.rows.lock().expect("audit rows").clone()
    }
}

impl LockAuditSink for CapturingAudit {
    fn record(&self, row: LockAuditRow) {
        self.rows.lock().expect("audit rows").push(row);
    }
}

struct Harness {
    supervisor: Supervisor,
    dispatcher: CapturingDispatcher,
    platform: Arc<FakePlatform>,
    audit: Arc<CapturingAudit>,
    idle_events: flume::Sender<IdleEvent>,
    log_dir: PathBuf,
    _tmp: TempDir,
}

fn harness(topology: CoreTopology, idle_lock: bool) -> Harness {
    let tmp = tempfile::tempdir().expect("tempdir");
    let scratch = tmp.path().join("scratch");
    std::fs::create_dir_all(&scratch).expect("scratch dir");
    let log_dir = tmp.path().join("logs");

    let mut settings = Settings::default();
    settings.machine.temp_root = Some(scratch);
    settings.machine.desktop = Some(false);
    settings.machine.reboot_command = vec!["/bin/true".to_owned()];
    settings.frames.failed_launch_backoff = Duration::from_millis(50);
    settings.timers.ping_interval = Duration::from_millis(100);
    settings.timers.rss_update_interval = Duration::from_millis(100);
    settings.timers.kill_all_pass_delay = Duration::from_millis(50);
    settings.timers.shutdown_delay = Duration::from_millis(50);
    settings.nimby.startup = Some(idle_lock);

    let platform = Arc::new(FakePlatform::with_topology(topology));
    let platform_ops: Arc<dyn rqd_machine::platform::PlatformOps> = platform.clone();
    let machine = Arc::new(Machine::new(&settings, platform_ops).expect("machine probe"));
    let dispatcher = CapturingDispatcher::new();
    let audit = Arc::new(CapturingAudit::default());
    let supervisor = Supervisor::new(
        settings,
        machine,
        Arc::new(dispatcher.clone()),
        Nimby::new(),
    );
    let (idle_events, idle_source) = idle_event_channel();
    let audit_sink: Arc<dyn LockAuditSink> = audit.clone();
    supervisor.start(Some(idle_source), audit_sink);

    Harness {
        supervisor,
        dispatcher,
        platform,
        audit,
        idle_events,
        log_dir,
        _tmp: tmp,
    }
}

fn launch(frame_id: &str, num_cores: u32, log_dir: &Path, command: &str) -> FrameLaunch {
    FrameLaunch {
        frame_id: frame_id.to_owned(),
        job_id: "job-77".to_owned(),
        job_name: "show_shot_light".to_owned(),
        frame_name: format!("0001-{frame_id}"),
        show: "show".to_owned(),
        shot: "shot".to_owned(),
        user_name: "render".to_owned(),
        uid: 1001,
        gid: 20,
        command: command.to_owned(),
        num_cores,
        log_dir: log_dir.to_path_buf(),
        environment: HashMap::new(),
        ignore_idle_lock: false,
        threadable: false,
    }
}

fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn idle_ledger(total: u32) -> CoreDetail {
    CoreDetail {
        total_cores: total,
        locked_cores: 0,
        idle_cores: total,
        booked_cores: 0,
    }
}

#[test]
fn single_frame_lifecycle_restores_the_ledger() {
    let h = harness(CoreTopology::new(4, 4), false);
    h.supervisor
        .launch_frame(launch("F1", 100, &h.log_dir, "echo frame-output"))
        .expect("admission");

    assert!(
        wait_until(Duration::from_secs(10), || {
            h.dispatcher.completions().len() == 1
        }),
        "completion report never arrived"
    );

    let completion = &h.dispatcher.completions()[0];
    assert_eq!(completion.exit_status, 0);
    assert_eq!(completion.exit_signal, 0);
    assert_eq!(completion.frame.frame_id, "F1");
    assert_eq!(completion.frame.num_cores, 100);

    assert!(wait_until(Duration::from_secs(5), || {
        h.supervisor.report_status().cores == idle_ledger(400)
    }));
    assert!(h.supervisor.report_status().frames.is_empty());

    // The frame log carries the banner contract and the child's output.
    let log = std::fs::read_to_string(
        h.log_dir.join("show_shot_light.0001-F1.rqlog"),
    )
    .expect("frame log");
    assert!(log.contains("RenderQ JobSpec"));
    assert!(log.contains("frameId              F1"));
    assert!(log.contains("frame-output"));
    assert!(log.contains("RenderQ Job Complete"));
    assert!(log.contains("exitStatus          0"));
}

#[test]
fn duplicate_launches_admit_at_most_one_subprocess() {
    let h = harness(CoreTopology::new(4, 4), false);
    let first = launch("F1", 100, &h.log_dir, "sleep 0.3");
    let second = launch("F1", 100, &h.log_dir, "sleep 0.3");

    let supervisor = &h.supervisor;
    let (r1, r2) = std::thread::scope(|scope| {
        let t1 = scope.spawn(|| supervisor.launch_frame(first));
        let t2 = scope.spawn(|| supervisor.launch_frame(second));
        (t1.join().expect("t1"), t2.join().expect("t2"))
    });

    let admitted = [&r1, &r2].iter().filter(|r| r.is_ok()).count();
    assert!(admitted >= 1);
    for result in [&r1, &r2] {
        if let Err(e) = result {
            assert!(
                matches!(
                    e,
                    Error::DuplicateFrame { .. } | Error::CoreReservationFailure { .. }
                ),
                "unexpected rejection: {e}"
            );
        }
    }

    // Every admission reports exactly once; exactly one frame really ran.
    assert!(wait_until(Duration::from_secs(10), || {
        h.dispatcher.completions().len() == admitted
    }));
    let clean: Vec<_> = h
        .dispatcher
        .completions()
        .into_iter()
        .filter(|c| c.exit_status == 0)
        .collect();
    assert_eq!(clean.len(), 1);

    assert!(wait_until(Duration::from_secs(5), || {
        h.supervisor.report_status().cores == idle_ledger(400)
    }));
}

#[test]
fn insufficient_cores_reject_without_side_effects() {
    let h = harness(CoreTopology::new(4, 4), false);
    h.supervisor.lock(350);
    let before = h.dispatcher.completions().len();

    match h
        .supervisor
        .launch_frame(launch("F1", 100, &h.log_dir, "echo never"))
    {
        Err(Error::CoreReservationFailure { .. }) => {}
        other => panic!("unexpected admission result: {other:?}"),
    }

    let status = h.supervisor.report_status();
    assert_eq!(
        status.cores,
        CoreDetail {
            total_cores: 400,
            locked_cores: 350,
            idle_cores: 50,
            booked_cores: 0,
        }
    );
    assert!(status.frames.is_empty());
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(h.dispatcher.completions().len(), before);
}

#[test]
fn idle_lock_kill_overrides_the_exit_status() {
    let h = harness(CoreTopology::new(4, 4), true);
    h.supervisor
        .launch_frame(launch("F2", 200, &h.log_dir, "sleep 30"))
        .expect("admission");
    assert!(wait_until(Duration::from_secs(5), || {
        h.supervisor
            .report_status()
            .frames
            .first()
            .is_some_and(|f| f.pid.is_some())
    }));

    h.idle_events.send(IdleEvent::UserActive).expect("send");

    assert!(
        wait_until(Duration::from_secs(10), || {
            h.dispatcher.completions().len() == 1
        }),
        "killed frame never reported"
    );
    let completion = &h.dispatcher.completions()[0];
    assert_eq!(completion.exit_status, 286);
    assert_eq!(completion.frame.frame_id, "F2");
    assert!(
        completion
            .frame
            .kill_message
            .as_deref()
            .is_some_and(|m| m.starts_with("NIMBY"))
    );

    // A lock-audit row was attempted, and the booking was returned.
    assert_eq!(h.audit.rows().len(), 1);
    assert!(h.audit.rows()[0].locked);
    assert!(wait_until(Duration::from_secs(5), || {
        h.supervisor.report_status().cores == idle_ledger(400)
    }));
}

#[test]
fn exempt_frames_survive_an_idle_lock_kill() {
    let h = harness(CoreTopology::new(4, 4), true);
    let mut exempt = launch("F-exempt", 100, &h.log_dir, "sleep 0.5");
    exempt.ignore_idle_lock = true;
    h.supervisor.launch_frame(exempt).expect("admission");
    h.supervisor
        .launch_frame(launch("F-victim", 100, &h.log_dir, "sleep 30"))
        .expect("admission");
    assert!(wait_until(Duration::from_secs(5), || {
        let frames = h.supervisor.report_status().frames;
        frames.len() == 2 && frames.iter().all(|f| f.pid.is_some())
    }));

    h.idle_events.send(IdleEvent::UserActive).expect("send");

    assert!(wait_until(Duration::from_secs(10), || {
        h.dispatcher.completions().len() == 2
    }));
    let completions = h.dispatcher.completions();
    let victim = completions
        .iter()
        .find(|c| c.frame.frame_id == "F-victim")
        .expect("victim report");
    let exempt = completions
        .iter()
        .find(|c| c.frame.frame_id == "F-exempt")
        .expect("exempt report");
    // The victim carries the idle-kill sentinel; the exempt frame ran to a
    // clean exit even though the lock was still held when it finished.
    assert_eq!(victim.exit_status, 286);
    assert_eq!(exempt.exit_status, 0);
}

#[test]
fn shutdown_when_idle_waits_for_the_last_frame() {
    let h = harness(CoreTopology::new(4, 4), false);
    h.supervisor.connected();
    h.supervisor
        .launch_frame(launch("F3", 100, &h.log_dir, "sleep 0.4"))
        .expect("admission");
    assert!(wait_until(Duration::from_secs(5), || {
        !h.supervisor.report_status().frames.is_empty()
    }));

    h.supervisor.shutdown_when_idle();

    let status = h.supervisor.report_status();
    assert_eq!(status.cores.locked_cores, 400);
    // The running frame is not preempted; the daemon stays up for now.
    assert_eq!(h.supervisor.wait_for_exit_timeout(Duration::from_millis(50)), None);

    assert_eq!(
        h.supervisor.wait_for_exit_timeout(Duration::from_secs(10)),
        Some(ExitIntent::Shutdown),
        "daemon never promoted shutdown-when-idle"
    );
    assert_eq!(h.dispatcher.completions().len(), 1);
}

#[test]
fn reboot_now_is_refused_while_a_user_is_logged_in() {
    let h = harness(CoreTopology::new(4, 4), false);
    h.platform.set_user_logged_in(true);

    match h.supervisor.reboot_now() {
        Err(Error::HostBusy { .. }) => {}
        other => panic!("unexpected reboot result: {other:?}"),
    }

    let status = h.supervisor.report_status();
    assert_eq!(status.host.hardware_state, HardwareState::Up);
    assert_eq!(status.cores, idle_ledger(400));
    assert_eq!(h.supervisor.wait_for_exit_timeout(Duration::from_millis(200)), None);
}

#[test]
fn concurrent_over_subscription_admits_only_what_fits() {
    let h = harness(CoreTopology::new(4, 4), false);
    let first = launch("F-a", 300, &h.log_dir, "sleep 0.2");
    let second = launch("F-b", 300, &h.log_dir, "sleep 0.2");

    let supervisor = &h.supervisor;
    let (r1, r2) = std::thread::scope(|scope| {
        let t1 = scope.spawn(|| supervisor.launch_frame(first));
        let t2 = scope.spawn(|| supervisor.launch_frame(second));
        (t1.join().expect("t1"), t2.join().expect("t2"))
    });

    assert_eq!(
        [&r1, &r2].iter().filter(|r| r.is_ok()).count(),
        1,
        "exactly one of two 300-core launches fits in 400 cores"
    );
    assert!(matches!(
        [r1, r2].into_iter().find(Result::is_err),
        Some(Err(Error::CoreReservationFailure { .. }))
    ));

    assert!(wait_until(Duration::from_secs(10), || {
        h.supervisor.report_status().cores == idle_ledger(400)
    }));
}

#[test]
fn servant_kill_terminates_the_frame() {
    let h = harness(CoreTopology::new(4, 4), false);
    h.supervisor
        .launch_frame(launch("F4", 100, &h.log_dir, "sleep 30"))
        .expect("admission");
    assert!(wait_until(Duration::from_secs(5), || {
        h.supervisor
            .get_running_frame("F4")
            .is_ok_and(|f| f.pid().is_some())
    }));

    let frame = h.supervisor.get_running_frame("F4").expect("servant");
    frame.kill("operator request").expect("kill");

    assert!(wait_until(Duration::from_secs(10), || {
        h.dispatcher.completions().len() == 1
    }));
    let completion = &h.dispatcher.completions()[0];
    assert_eq!(completion.exit_status, 1);
    assert_ne!(completion.exit_signal, 0);
    assert_eq!(
        completion.frame.kill_message.as_deref(),
        Some("operator request")
    );

    assert!(matches!(
        h.supervisor.get_running_frame("F4"),
        Err(Error::FrameNotFound { .. })
    ));
}

#[test]
fn unlock_all_clears_deferred_intents() {
    let h = harness(CoreTopology::new(4, 4), false);
    h.supervisor.connected();
    h.supervisor
        .launch_frame(launch("F5", 100, &h.log_dir, "sleep 0.3"))
        .expect("admission");
    assert!(wait_until(Duration::from_secs(5), || {
        !h.supervisor.report_status().frames.is_empty()
    }));

    h.supervisor.restart_when_idle();
    h.supervisor.unlock_all();

    assert!(wait_until(Duration::from_secs(10), || {
        h.dispatcher.completions().len() == 1
    }));
    // The cleared intent must not shut the daemon down once the frame ends.
    assert_eq!(h.supervisor.wait_for_exit_timeout(Duration::from_millis(400)), None);
    let status = h.supervisor.report_status();
    assert_eq!(status.host.hardware_state, HardwareState::Up);
    assert_eq!(status.cores, idle_ledger(400));
}

#[test]
fn restart_now_reports_the_respawn_intent() {
    let h = harness(CoreTopology::new(4, 4), false);
    h.supervisor.restart_now();
    assert_eq!(
        h.supervisor.wait_for_exit_timeout(Duration::from_secs(5)),
        Some(ExitIntent::Respawn)
    );
}

#[test]
fn connected_sends_the_boot_report_and_heartbeats() {
    let h = harness(CoreTopology::new(4, 4), false);
    h.supervisor.connected();
    assert_eq!(h.dispatcher.startups().len(), 1);
    assert_eq!(h.dispatcher.startups()[0].cores, idle_ledger(400));
    assert!(
        wait_until(Duration::from_secs(5), || {
            h.dispatcher.statuses().len() >= 2
        }),
        "heartbeat never ticked"
    );
}

#[test]
fn transport_failures_do_not_stop_the_frame_lifecycle() {
    let h = harness(CoreTopology::new(4, 4), false);
    h.dispatcher.fail_transport(true);
    h.supervisor
        .launch_frame(launch("F6", 100, &h.log_dir, "echo ok"))
        .expect("admission");
    assert!(wait_until(Duration::from_secs(10), || {
        h.dispatcher.completions().len() == 1
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        h.supervisor.report_status().cores == idle_ledger(400)
    }));
}
