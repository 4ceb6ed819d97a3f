use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{Local, Timelike};

/// Syslog-style severities, 0 = most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[allow(dead_code)]
pub enum Severity {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Severity::Emergency => "EMERGENCY",
            Severity::Alert => "ALERT",
            Severity::Critical => "CRITICAL",
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
        }
    }
}

/// Per-invocation log file. One file per supervised command, named
/// `<yyyymmdd>-<ms-of-day>-<pid>-<seq>`; lines carry a local timestamp
/// and the severity label. Levels above the configured admission level
/// are dropped.
pub struct LogSink {
    file: Option<File>,
    admit: u8,
}

impl LogSink {
    pub fn open(dir: &Path, admit: u8, pid: u32, seq: u32) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let now = Local::now();
        let ms_of_day = u64::from(now.num_seconds_from_midnight()) * 1000
            + u64::from(now.nanosecond() / 1_000_000);
        let name = format!("{}-{}-{}-{}", now.format("%Y%m%d"), ms_of_day, pid, seq);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(name))?;
        Ok(Self {
            file: Some(file),
            admit,
        })
    }

    /// A sink that admits nothing; used when the log directory is not
    /// writable so a command still runs.
    pub fn disabled(admit: u8) -> Self {
        Self { file: None, admit }
    }

    pub fn write(&mut self, level: Severity, body: &str) {
        if level as u8 > self.admit {
            return;
        }
        let Some(file) = &mut self.file else {
            return;
        };
        let stamp = Local::now().format("%d-%m-%Y %H:%M:%S");
        let _ = writeln!(file, "{stamp} <{}> {body}", level.label());
        let _ = file.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_sole_file(dir: &Path) -> String {
        let mut entries = std::fs::read_dir(dir).expect("read dir");
        let entry = entries.next().expect("one log file").expect("entry");
        assert!(entries.next().is_none());
        std::fs::read_to_string(entry.path()).expect("read log")
    }

    #[test]
    fn admission_level_filters_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = LogSink::open(dir.path(), 4, 1234, 1).expect("open");
        sink.write(Severity::Debug, "dropped");
        sink.write(Severity::Info, "dropped too");
        sink.write(Severity::Warning, "kept");
        sink.write(Severity::Error, "kept as well");
        let contents = open_sole_file(dir.path());
        assert!(!contents.contains("dropped"));
        assert!(contents.contains("<WARNING> kept"));
        assert!(contents.contains("<ERROR> kept as well"));
    }

    #[test]
    fn file_name_carries_pid_and_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = LogSink::open(dir.path(), 7, 4321, 9).expect("open");
        sink.write(Severity::Info, "line");
        let entry = std::fs::read_dir(dir.path())
            .expect("read dir")
            .next()
            .expect("one file")
            .expect("entry");
        let name = entry.file_name().into_string().expect("utf8 name");
        assert!(name.ends_with("-4321-9"), "unexpected name {name}");
    }

    #[test]
    fn line_format_has_timestamp_then_severity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = LogSink::open(dir.path(), 7, 1, 1).expect("open");
        sink.write(Severity::Notice, "stream opened fd 7");
        let contents = open_sole_file(dir.path());
        let line = contents.lines().next().expect("one line");
        // dd-mm-yyyy HH:MM:SS <SEVERITY> body
        let (stamp, rest) = line.split_at(19);
        assert_eq!(stamp.len(), 19);
        assert_eq!(&stamp[2..3], "-");
        assert_eq!(&stamp[5..6], "-");
        assert!(rest.starts_with(" <NOTICE> stream opened fd 7"));
    }

    #[test]
    fn disabled_sink_swallows_everything() {
        let mut sink = LogSink::disabled(7);
        sink.write(Severity::Emergency, "nowhere to go");
    }
}
