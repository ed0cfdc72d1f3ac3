// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! The per-frame worker.
//!
//! One attendant thread accompanies each admitted frame through a fixed
//! sequence: log preparation, cache insertion, environment build, header,
//! command-file materialization, spawn under the target identity, wait,
//! stat collection, footer, cleanup, completion report, and finally the
//! bookkeeping message that returns the frame's cores. Every failure is
//! fatal to the frame, never to the daemon; the completion report and the
//! bookkeeping message go out on every exit path.

use crate::frame::RunningFrame;
use crate::logfile::{FrameLog, LogError, LogFooter, LogHeader, set_mode};
use crate::supervisor::{Bookkeeping, SupervisorCore};
use rqd_machine::platform::SpawnSpec;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{error, info, warn};

#[derive(thiserror::Error, Debug)]
enum LaunchError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Admission(#[from] crate::error::Error),

    #[error("Unable to create command file {path}: {source}")]
    CommandFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to clone the log handle for the subprocess: {source}")]
    LogHandle {
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn frame subprocess: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
}

/// Accompanies `frame` from launch to completion report. Runs on its own
/// thread; never panics the daemon.
pub(crate) fn run(core: Arc<SupervisorCore>, frame: Arc<RunningFrame>) {
    info!(frame_id = %frame.frame_id(), "frame attendant started");
    let mut temp_files: Vec<PathBuf> = Vec::new();

    if let Err(e) = execute(&core, &frame, &mut temp_files) {
        error!(frame_id = %frame.frame_id(), error = %e, "frame launch failed");
        // No subprocess ever ran; report the launch-failure sentinel, and
        // pause first so the dispatcher does not spin re-booking this host.
        frame.set_exit_status(core.settings.frames.exit_status_for_failed_launch);
        std::thread::sleep(core.settings.frames.failed_launch_backoff);
    }

    cleanup(&temp_files);
    core.send_frame_completion(&frame);
    let _ = core.done_tx.send(Bookkeeping::FrameDone(Arc::clone(&frame)));
    info!(frame_id = %frame.frame_id(), "frame attendant ended");
}

fn execute(
    core: &Arc<SupervisorCore>,
    frame: &Arc<RunningFrame>,
    temp_files: &mut Vec<PathBuf>,
) -> Result<(), LaunchError> {
    let launch = frame.launch();
    let settings = &core.settings;
    let machine = &core.machine;

    let temp_root = machine.temp_root();
    let job_temp_dir = temp_root.join(&launch.job_name);
    let frame_temp_dir = job_temp_dir.join(&launch.frame_name);
    let log_file = format!("{}.{}.rqlog", launch.job_name, launch.frame_name);
    let log_dir = effective_log_dir(core, frame);
    let log_dir_file = log_dir.join(&log_file);

    let mut log = FrameLog::prepare(&log_dir, &log_file, settings.frames.max_log_files)?;

    // Insertion must precede the spawn: when two launches race on one frame
    // id, the cache decides the winner before any subprocess exists.
    core.store_frame(Arc::clone(frame))?;

    let gid = settings.frames.launch_gid;
    let env = build_environment(core, frame, &log_dir_file);

    log.write_header(&LogHeader {
        start_time: SystemTime::now(),
        proxy: format!(
            "RunningFrame/{} -t:tcp -h {} -p {}",
            launch.frame_id,
            machine.hostname(),
            settings.dispatcher.servant_port
        ),
        command: &launch.command,
        uid: launch.uid,
        gid,
        log_dir_file: &log_dir_file,
        cwd: &frame_temp_dir,
        render_host: machine.hostname(),
        job_id: &launch.job_id,
        frame_id: &launch.frame_id,
        env: &env,
        hyperthreaded: !frame.pin_set().is_empty(),
    })?;

    let stamp = unique_stamp();
    let command_file = write_command_file(&temp_root, &launch.frame_id, &launch.command, &stamp)?;
    temp_files.push(command_file.clone());
    let stat_file = temp_root.join(format!("rqd-stat-{}-{stamp}", launch.frame_id));
    temp_files.push(stat_file.clone());

    let platform = machine.platform();
    let argv = platform.build_spawn_argv(&SpawnSpec {
        command_file: &command_file,
        stat_file: Some(&stat_file),
        nice: machine.is_desktop(),
        pin_set: frame.pin_set(),
    });

    let mut command = Command::new(&argv[0]);
    let _ = command
        .args(&argv[1..])
        .env_clear()
        .envs(env.iter())
        .current_dir(&temp_root)
        .stdin(Stdio::piped());
    let stdout = log.child_handle().map_err(|source| LaunchError::LogHandle { source })?;
    let stderr = log.child_handle().map_err(|source| LaunchError::LogHandle { source })?;
    let _ = command.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
    demote_child(&mut command, launch.uid, gid);

    let mut child = command
        .spawn()
        .map_err(|source| LaunchError::Spawn { source })?;
    frame.mark_started(child.id());
    info!(frame_id = %launch.frame_id, pid = child.id(), "frame subprocess started");

    match child.wait() {
        Ok(status) => {
            let (exit_status, exit_signal) = platform.parse_exit_status(status);
            frame.mark_finished(exit_status, exit_signal);
        }
        Err(e) => {
            error!(frame_id = %launch.frame_id, error = %e, "wait on frame subprocess failed");
            frame.mark_finished(1, 0);
        }
    }

    // The stat file is missing when the frame was killed before the time
    // wrapper wrote it; resource times stay zero then.
    if let Some((real_time, utime, stime)) = parse_stat_file(&stat_file) {
        frame.set_times(real_time, utime, stime);
    }

    write_footer(core, frame, &mut log);
    Ok(())
}

fn effective_log_dir(core: &Arc<SupervisorCore>, frame: &Arc<RunningFrame>) -> PathBuf {
    #[cfg(windows)]
    {
        let launch = frame.launch();
        core.settings
            .frames
            .windows_log_root
            .join(format!("{}--{}", launch.job_name, launch.job_id))
    }
    #[cfg(not(windows))]
    {
        let _ = core;
        frame.launch().log_dir.clone()
    }
}

fn build_environment(
    core: &Arc<SupervisorCore>,
    frame: &Arc<RunningFrame>,
    log_dir_file: &Path,
) -> BTreeMap<String, String> {
    let launch = frame.launch();
    let machine = &core.machine;
    let user = &launch.user_name;
    let mut env = BTreeMap::new();
    let mut put = |key: &str, value: String| {
        let _ = env.insert(key.to_owned(), value);
    };
    put("PATH", machine.path_env());
    put("TERM", "unknown".to_owned());
    put("TZ", machine.time_zone());
    put("USER", user.clone());
    put("LOGNAME", user.clone());
    put("MAIL", format!("/usr/mail/{user}"));
    put("HOME", format!("/net/homedirs/{user}"));
    put("mcp", "1".to_owned());
    put("show", launch.show.clone());
    put("shot", launch.shot.clone());
    put("jobid", launch.job_name.clone());
    put("jobhost", machine.hostname().to_owned());
    put("frame", launch.frame_name.clone());
    put("zframe", launch.frame_name.clone());
    put("logfile", log_dir_file.display().to_string());
    put("maxframetime", "0".to_owned());
    put("minspace", "200".to_owned());
    put("CUE3", "True".to_owned());
    put("CUE_GPU_MEMORY", machine.gpu_memory_kb().to_string());
    put("SP_NOMYCSHRC", "1".to_owned());
    for (key, value) in &launch.environment {
        put(key, value.clone());
    }

    // Pinned frames get their thread hint raised to cover every assigned
    // hyperthread.
    if !frame.pin_set().is_empty() {
        if let Some(threads) = env.get("CUE_THREADS") {
            let threads = threads
                .parse::<usize>()
                .unwrap_or(frame.pin_set().len())
                .max(frame.pin_set().len());
            let _ = env.insert("CUE_THREADS".to_owned(), threads.to_string());
            let _ = env.insert("CUE_HT".to_owned(), "True".to_owned());
        }
    }
    env
}

fn unique_stamp() -> String {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_string()
}

#[cfg(unix)]
fn write_command_file(
    temp_root: &Path,
    frame_id: &str,
    command: &str,
    stamp: &str,
) -> Result<PathBuf, LaunchError> {
    let path = temp_root.join(format!("rqd-cmd-{frame_id}-{stamp}"));
    std::fs::write(&path, format!("#!/bin/sh\n{command}\n")).map_err(|source| {
        LaunchError::CommandFile {
            path: path.clone(),
            source,
        }
    })?;
    set_mode(&path, 0o755);
    Ok(path)
}

#[cfg(windows)]
fn write_command_file(
    temp_root: &Path,
    frame_id: &str,
    command: &str,
    stamp: &str,
) -> Result<PathBuf, LaunchError> {
    let path = temp_root.join(format!("rqd-cmd-{frame_id}-{stamp}.bat"));
    std::fs::write(&path, format!("{command}\r\n")).map_err(|source| LaunchError::CommandFile {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

#[cfg(unix)]
fn demote_child(command: &mut Command, uid: u32, gid: u32) {
    use std::os::unix::process::CommandExt;

    // The child leads its own process group so a kill reaches the whole
    // frame tree.
    let _ = command.process_group(0);
    if nix::unistd::geteuid().is_root() {
        let _ = command.uid(uid).gid(gid);
    } else {
        warn!(uid, "daemon is not root; frame runs as the daemon user");
    }
}

#[cfg(not(unix))]
fn demote_child(_command: &mut Command, _uid: u32, _gid: u32) {}

/// Parses the POSIX `time -p` output: three lines `real`/`user`/`sys`,
/// each label followed by seconds.
fn parse_stat_file(path: &Path) -> Option<(f64, f64, f64)> {
    let contents = std::fs::read_to_string(path).ok()?;
    let mut real_time = None;
    let mut utime = None;
    let mut stime = None;
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("real"), Some(value)) => real_time = value.parse().ok(),
            (Some("user"), Some(value)) => utime = value.parse().ok(),
            (Some("sys"), Some(value)) => stime = value.parse().ok(),
            _ => {}
        }
    }
    Some((real_time?, utime?, stime?))
}

fn write_footer(core: &Arc<SupervisorCore>, frame: &Arc<RunningFrame>, log: &mut FrameLog) {
    let (exit_status, exit_signal, kill_message, max_rss_kb, utime, stime) =
        frame.footer_fields();
    let (start_time, end_time) = frame.snapshot_times();
    let footer = LogFooter {
        exit_status,
        exit_signal,
        kill_message: kill_message.as_deref(),
        start_time,
        end_time,
        max_rss_kb,
        utime,
        stime,
        render_host: core.machine.hostname(),
    };
    if let Err(e) = log.write_footer(&footer) {
        error!(frame_id = %frame.frame_id(), error = %e, "unable to write the log footer");
    }
}

fn cleanup(temp_files: &[PathBuf]) {
    for path in temp_files {
        if path.is_file() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "unable to delete temp file");
            }
        }
    }
}
