use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::ser::{Serialize, SerializeMap, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// One structured entry per client connection outcome, serialised as a JSON
/// object on its own line. Unset fields are omitted; the address and byte
/// pairs are emitted together or not at all.
#[derive(Debug, Clone, Default)]
pub struct ConnectionLog {
    pub event: String,
    pub client_ip: String,
    pub client_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub runway_id: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub duration_ms: f64,
    pub error: String,
}

impl Serialize for ConnectionLog {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("event", &self.event)?;
        if !self.client_ip.is_empty() {
            map.serialize_entry("client_ip", &self.client_ip)?;
            map.serialize_entry("client_port", &self.client_port)?;
        }
        if !self.target_host.is_empty() {
            map.serialize_entry("target_host", &self.target_host)?;
            map.serialize_entry("target_port", &self.target_port)?;
        }
        if !self.runway_id.is_empty() {
            map.serialize_entry("runway_id", &self.runway_id)?;
        }
        if !self.method.is_empty() {
            map.serialize_entry("method", &self.method)?;
        }
        if !self.path.is_empty() {
            map.serialize_entry("path", &self.path)?;
        }
        if self.status_code > 0 {
            map.serialize_entry("status_code", &self.status_code)?;
        }
        if self.bytes_sent > 0 || self.bytes_received > 0 {
            map.serialize_entry("bytes_sent", &self.bytes_sent)?;
            map.serialize_entry("bytes_received", &self.bytes_received)?;
        }
        if self.duration_ms > 0.0 {
            map.serialize_entry("duration_ms", &self.duration_ms)?;
        }
        if !self.error.is_empty() {
            map.serialize_entry("error", &self.error)?;
        }
        map.end()
    }
}

struct Inner {
    path: PathBuf,
    file: Option<File>,
    written: u64,
    max_bytes: u64,
    backup_count: usize,
}

impl Inner {
    fn rotate(&mut self) {
        self.file = None;
        if self.backup_count == 0 {
            let _ = fs::remove_file(&self.path);
        } else {
            for i in (1..self.backup_count).rev() {
                let from = backup_name(&self.path, i);
                let to = backup_name(&self.path, i + 1);
                let _ = fs::rename(from, to);
            }
            let _ = fs::rename(&self.path, backup_name(&self.path, 1));
        }
        self.file = open_append(&self.path);
        self.written = 0;
    }
}

fn backup_name(path: &PathBuf, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", index));
    PathBuf::from(name)
}

fn open_append(path: &PathBuf) -> Option<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let _ = fs::create_dir_all(parent);
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .ok()
}

/// Append-only file logger with size-based rotation. An explicit handle,
/// cloned into every component that needs it; a failed open disables the
/// file sink without failing startup.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Mutex<Inner>>,
}

impl Logger {
    pub fn new(path: &str, max_bytes: u64, backup_count: usize) -> Self {
        if path.is_empty() {
            return Self::disabled();
        }
        let path = PathBuf::from(path);
        let file = open_append(&path);
        if file.is_none() {
            log::warn!("Could not open log file {:?}; file logging disabled", path);
        }
        let written = file
            .as_ref()
            .and_then(|f| f.metadata().ok())
            .map(|m| m.len())
            .unwrap_or(0);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                path,
                file,
                written,
                max_bytes,
                backup_count,
            })),
        }
    }

    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                path: PathBuf::new(),
                file: None,
                written: 0,
                max_bytes: u64::MAX,
                backup_count: 0,
            })),
        }
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        let line = format!("{} [{}] {}\n", timestamp(), level.as_str(), message);
        self.write_line(&line);
    }

    pub fn log_connection(&self, entry: &ConnectionLog) {
        let json = serde_json::to_string(entry).unwrap_or_default();
        let line = format!("{} [CONN] {}\n", timestamp(), json);
        self.write_line(&line);
    }

    fn write_line(&self, line: &str) {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return;
        }
        if let Some(file) = inner.file.as_mut() {
            let _ = file.write_all(line.as_bytes());
            let _ = file.flush();
        }
        inner.written += line.len() as u64;
        if inner.written >= inner.max_bytes {
            inner.rotate();
        }
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_levelled_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.log");
        let logger = Logger::new(path.to_str().unwrap(), 1_000_000, 2);
        logger.log(LogLevel::Info, "starting up");
        logger.log(LogLevel::Error, "boom");

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("[INFO] starting up"));
        assert!(content.contains("[ERROR] boom"));
    }

    #[test]
    fn connection_entries_are_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.log");
        let logger = Logger::new(path.to_str().unwrap(), 1_000_000, 2);
        logger.log_connection(&ConnectionLog {
            event: "disconnect".to_string(),
            client_ip: "127.0.0.1".to_string(),
            client_port: 50000,
            target_host: "example.com".to_string(),
            target_port: 80,
            status_code: 200,
            bytes_sent: 120,
            duration_ms: 35.5,
            ..Default::default()
        });

        let content = fs::read_to_string(&path).unwrap();
        let json_part = content.split("[CONN] ").nth(1).unwrap().trim();
        let value: serde_json::Value = serde_json::from_str(json_part).unwrap();
        assert_eq!(value["event"], "disconnect");
        assert_eq!(value["status_code"], 200);
        // Empty fields are omitted entirely.
        assert!(value.get("error").is_none());
        assert!(value.get("runway_id").is_none());
        // Paired fields travel together: one nonzero byte counter drags the
        // other in, and the client port rides with the client ip.
        assert_eq!(value["bytes_sent"], 120);
        assert_eq!(value["bytes_received"], 0);
        assert_eq!(value["client_port"], 50000);
    }

    #[test]
    fn paired_fields_are_omitted_jointly() {
        let entry = ConnectionLog {
            event: "connect".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&entry).unwrap();
        // No address, no target, no transfer: none of the pairs appear.
        assert_eq!(value.as_object().unwrap().len(), 1);
        assert_eq!(value["event"], "connect");

        let entry = ConnectionLog {
            event: "disconnect".to_string(),
            bytes_received: 7,
            ..Default::default()
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["bytes_sent"], 0);
        assert_eq!(value["bytes_received"], 7);
    }

    #[test]
    fn rotates_when_size_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.log");
        let logger = Logger::new(path.to_str().unwrap(), 64, 2);
        for i in 0..10 {
            logger.log(LogLevel::Info, &format!("filler line number {}", i));
        }

        let backup = dir.path().join("proxy.log.1");
        assert!(backup.exists());
        assert!(fs::metadata(&path).unwrap().len() < 10 * 64);
    }

    #[test]
    fn disabled_logger_is_silent() {
        let logger = Logger::disabled();
        logger.log(LogLevel::Info, "goes nowhere");
        logger.log_connection(&ConnectionLog::default());
    }
}
