// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! Frame log preparation and the banner format.
//!
//! The header and footer layout is part of the user-visible contract: show
//! tooling greps these banners. Labels are left-justified in a 21-column
//! field in the header and a 20-column field in the footer, with a
//! 59-character `=` rule fencing each block.

use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

const RULE_WIDTH: usize = 59;

/// Errors raised while preparing or writing a frame log.
#[derive(thiserror::Error, Debug)]
pub enum LogError {
    /// The log directory could not be created and is not observable.
    #[error("Unable to see log directory {dir}: {details}")]
    DirUnobservable {
        /// Log directory.
        dir: PathBuf,
        /// Why creation failed.
        details: String,
    },

    /// The log directory exists but refuses writes.
    #[error("Unable to write to log directory {dir}")]
    DirUnwritable {
        /// Log directory.
        dir: PathBuf,
    },

    /// Rotating the previous log out of the way failed.
    #[error("Unable to rotate previous log file {path}: {source}")]
    Rotate {
        /// Log file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Opening the new log file failed.
    #[error("Unable to write to {path}: {source}")]
    Open {
        /// Log file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Writing a banner failed.
    #[error("Unable to write to {path}: {source}")]
    Write {
        /// Log file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Everything the header banner prints.
#[derive(Debug)]
pub struct LogHeader<'a> {
    /// Frame start time.
    pub start_time: SystemTime,
    /// Callback proxy line advertised to show tooling.
    pub proxy: String,
    /// Frame command line.
    pub command: &'a str,
    /// Uid the frame runs under.
    pub uid: u32,
    /// Gid the frame runs under.
    pub gid: u32,
    /// Full path of this log file.
    pub log_dir_file: &'a Path,
    /// Frame scratch directory.
    pub cwd: &'a Path,
    /// Host running the frame.
    pub render_host: &'a str,
    /// Owning job id.
    pub job_id: &'a str,
    /// Frame id.
    pub frame_id: &'a str,
    /// Child environment, iterated in key order.
    pub env: &'a BTreeMap<String, String>,
    /// Whether a hyperthread pin set is attached.
    pub hyperthreaded: bool,
}

/// Everything the footer banner prints.
#[derive(Debug)]
pub struct LogFooter<'a> {
    /// Exit status, `None` when the frame was killed before exiting.
    pub exit_status: Option<i32>,
    /// Terminating signal, 0 for a normal exit.
    pub exit_signal: i32,
    /// Kill reason, when one was recorded.
    pub kill_message: Option<&'a str>,
    /// Frame start time.
    pub start_time: Option<SystemTime>,
    /// Frame end time.
    pub end_time: Option<SystemTime>,
    /// Peak resident set in KiB.
    pub max_rss_kb: u64,
    /// User CPU seconds.
    pub utime: f64,
    /// System CPU seconds.
    pub stime: f64,
    /// Host that ran the frame.
    pub render_host: &'a str,
}

/// An open frame log.
#[derive(Debug)]
pub struct FrameLog {
    file: File,
    path: PathBuf,
}

impl FrameLog {
    /// Prepares the log directory and opens a fresh log file.
    ///
    /// The directory is created world-accessible when missing; a creation
    /// failure is tolerated as long as the directory is observable
    /// afterwards (a mount may have raced us). An existing log is rotated
    /// to the first free `.1` .. `.max_log_files` suffix.
    pub fn prepare(log_dir: &Path, file_name: &str, max_log_files: u32) -> Result<Self, LogError> {
        if !log_dir.exists() {
            let created = std::fs::create_dir_all(log_dir);
            if let Err(e) = &created {
                debug!(dir = %log_dir.display(), error = %e, "log directory creation failed, re-probing");
            }
            if !log_dir.exists() {
                return Err(LogError::DirUnobservable {
                    dir: log_dir.to_path_buf(),
                    details: created
                        .err()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "No Error".to_owned()),
                });
            }
            set_mode(log_dir, 0o777);
        }
        if !dir_writable(log_dir) {
            return Err(LogError::DirUnwritable {
                dir: log_dir.to_path_buf(),
            });
        }

        let path = log_dir.join(file_name);
        if path.is_file() {
            let mut rotate_count = 1;
            while path_with_suffix(&path, rotate_count).is_file() && rotate_count < max_log_files {
                rotate_count += 1;
            }
            let rotated = path_with_suffix(&path, rotate_count);
            std::fs::rename(&path, &rotated).map_err(|source| LogError::Rotate {
                path: path.clone(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| LogError::Open {
                path: path.clone(),
                source,
            })?;
        set_mode(&path, 0o666);
        Ok(Self { file, path })
    }

    /// Path of the open log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A second handle to the log, for wiring as child stdout/stderr.
    pub fn child_handle(&self) -> std::io::Result<File> {
        self.file.try_clone()
    }

    /// Writes the opening banner.
    pub fn write_header(&mut self, header: &LogHeader<'_>) -> Result<(), LogError> {
        self.banner(|f| {
            writeln!(f, "{}", "=".repeat(RULE_WIDTH))?;
            writeln!(f, "RenderQ JobSpec      {} ", ctime(header.start_time))?;
            writeln!(f)?;
            writeln!(f, "proxy                {}", header.proxy)?;
            writeln!(f, "{:<21}{}", "command", header.command)?;
            writeln!(f, "{:<21}{}", "uid", header.uid)?;
            writeln!(f, "{:<21}{}", "gid", header.gid)?;
            writeln!(f, "{:<21}{}", "logDestination", header.log_dir_file.display())?;
            writeln!(f, "{:<21}{}", "cwd", header.cwd.display())?;
            writeln!(f, "{:<21}{}", "renderHost", header.render_host)?;
            writeln!(f, "{:<21}{}", "jobId", header.job_id)?;
            writeln!(f, "{:<21}{}", "frameId", header.frame_id)?;
            for (key, value) in header.env {
                writeln!(f, "{:<21}{key}={value}", "env")?;
            }
            writeln!(f, "{}", "=".repeat(RULE_WIDTH))?;
            if header.hyperthreaded {
                writeln!(f, "Hyper-threading enabled")?;
            }
            f.flush()
        })
    }

    /// Writes the closing banner.
    pub fn write_footer(&mut self, footer: &LogFooter<'_>) -> Result<(), LogError> {
        self.banner(|f| {
            writeln!(f)?;
            writeln!(f, "{}", "=".repeat(RULE_WIDTH))?;
            writeln!(f, "RenderQ Job Complete")?;
            writeln!(f)?;
            match footer.exit_status {
                Some(code) => writeln!(f, "{:<20}{code}", "exitStatus")?,
                None => writeln!(f, "{:<20}{}", "exitStatus", 1)?,
            }
            writeln!(f, "{:<20}{}", "exitSignal", footer.exit_signal)?;
            if let Some(message) = footer.kill_message {
                writeln!(f, "{:<20}{message}", "killMessage")?;
            }
            if let Some(start) = footer.start_time {
                writeln!(f, "{:<20}{}", "startTime", ctime(start))?;
            }
            if let Some(end) = footer.end_time {
                writeln!(f, "{:<20}{}", "endTime", ctime(end))?;
            }
            writeln!(f, "{:<20}{}", "maxrss", footer.max_rss_kb)?;
            writeln!(f, "{:<20}{}", "utime", footer.utime)?;
            writeln!(f, "{:<20}{}", "stime", footer.stime)?;
            writeln!(f, "{:<20}{}", "renderhost", footer.render_host)?;
            writeln!(f, "{}", "=".repeat(RULE_WIDTH))?;
            f.flush()
        })
    }

    fn banner<F>(&mut self, write: F) -> Result<(), LogError>
    where
        F: FnOnce(&mut File) -> std::io::Result<()>,
    {
        write(&mut self.file).map_err(|source| LogError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

fn path_with_suffix(path: &Path, suffix: u32) -> PathBuf {
    let mut rotated = path.as_os_str().to_owned();
    rotated.push(format!(".{suffix}"));
    PathBuf::from(rotated)
}

/// ctime(3)-style timestamp, e.g. `Mon Aug  3 14:05:00 2026`.
fn ctime(time: SystemTime) -> String {
    let local: DateTime<Local> = time.into();
    local.format("%a %b %e %H:%M:%S %Y").to_string()
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        debug!(path = %path.display(), error = %e, "failed to widen permissions");
    }
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) {}

#[cfg(unix)]
fn dir_writable(dir: &Path) -> bool {
    nix::unistd::access(dir, nix::unistd::AccessFlags::W_OK).is_ok()
}

#[cfg(not(unix))]
fn dir_writable(_dir: &Path) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_header(env: &BTreeMap<String, String>) -> LogHeader<'_> {
        LogHeader {
            start_time: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000),
            proxy: "RunningFrame/f-01 -t:tcp -h host01 -p 10021".to_owned(),
            command: "/usr/bin/render -f 1",
            uid: 1001,
            gid: 20,
            log_dir_file: Path::new("/var/log/frames/job.0001.rqlog"),
            cwd: Path::new("/tmp/job/0001"),
            render_host: "host01",
            job_id: "job-77",
            frame_id: "f-01",
            env,
            hyperthreaded: false,
        }
    }

    #[test]
    fn header_fields_round_trip_through_a_parser() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut env = BTreeMap::new();
        let _ = env.insert("CUE_THREADS".to_owned(), "2".to_owned());
        let _ = env.insert("USER".to_owned(), "render".to_owned());
        let mut log = FrameLog::prepare(dir.path(), "job.0001.rqlog", 15).expect("prepare");
        log.write_header(&sample_header(&env)).expect("header");

        let contents = std::fs::read_to_string(log.path()).expect("read");
        let mut labels = BTreeMap::new();
        let mut envs = Vec::new();
        for line in contents.lines() {
            if line.starts_with('=') || line.trim().is_empty() {
                continue;
            }
            let (label, value) = line.split_at(21.min(line.len()));
            if label.trim() == "env" {
                envs.push(value.to_owned());
            } else {
                let _ = labels.insert(label.trim().to_owned(), value.to_owned());
            }
        }
        assert_eq!(labels["command"], "/usr/bin/render -f 1");
        assert_eq!(labels["uid"], "1001");
        assert_eq!(labels["gid"], "20");
        assert_eq!(labels["jobId"], "job-77");
        assert_eq!(labels["frameId"], "f-01");
        assert_eq!(labels["renderHost"], "host01");
        // Env lines are emitted in key-sorted order.
        assert_eq!(envs, vec!["CUE_THREADS=2", "USER=render"]);
    }

    #[test]
    fn footer_fields_round_trip_through_a_parser() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut log = FrameLog::prepare(dir.path(), "job.0001.rqlog", 15).expect("prepare");
        log.write_footer(&LogFooter {
            exit_status: Some(0),
            exit_signal: 0,
            kill_message: Some("operator request"),
            start_time: Some(SystemTime::UNIX_EPOCH),
            end_time: Some(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(30)),
            max_rss_kb: 5120,
            utime: 12.5,
            stime: 0.7,
            render_host: "host01",
        })
        .expect("footer");

        let contents = std::fs::read_to_string(log.path()).expect("read");
        let mut labels = BTreeMap::new();
        for line in contents.lines() {
            if line.starts_with('=') || line.trim().is_empty() {
                continue;
            }
            let (label, value) = line.split_at(20.min(line.len()));
            let _ = labels.insert(label.trim().to_owned(), value.to_owned());
        }
        assert_eq!(labels["exitStatus"], "0");
        assert_eq!(labels["exitSignal"], "0");
        assert_eq!(labels["killMessage"], "operator request");
        assert_eq!(labels["maxrss"], "5120");
        assert_eq!(labels["utime"], "12.5");
        assert_eq!(labels["stime"], "0.7");
        assert_eq!(labels["renderhost"], "host01");
        assert!(contents.contains("RenderQ Job Complete"));
    }

    #[test]
    fn existing_logs_rotate_to_the_next_free_suffix() {
        let dir = tempfile::tempdir().expect("tempdir");
        for _ in 0..3 {
            let _ = FrameLog::prepare(dir.path(), "job.0001.rqlog", 15).expect("prepare");
        }
        assert!(dir.path().join("job.0001.rqlog").is_file());
        assert!(dir.path().join("job.0001.rqlog.1").is_file());
        assert!(dir.path().join("job.0001.rqlog.2").is_file());
        assert!(!dir.path().join("job.0001.rqlog.3").is_file());
    }

    #[test]
    fn rotation_caps_at_the_configured_maximum() {
        let dir = tempfile::tempdir().expect("tempdir");
        for _ in 0..5 {
            let _ = FrameLog::prepare(dir.path(), "job.0001.rqlog", 2).expect("prepare");
        }
        assert!(dir.path().join("job.0001.rqlog.1").is_file());
        assert!(dir.path().join("job.0001.rqlog.2").is_file());
        assert!(!dir.path().join("job.0001.rqlog.3").is_file());
    }

    #[test]
    fn missing_directories_are_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("logs").join("job");
        let log = FrameLog::prepare(&nested, "job.0001.rqlog", 15).expect("prepare");
        assert!(log.path().is_file());
    }
}
