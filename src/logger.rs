//! Session logger for the `layercache` binary.
//!
//! Everything the library emits through the `log` facade lands in one file in
//! the OS data directory. The file is **truncated at each launch**, so it only
//! ever holds the most recent session.
//!
//! Log location:
//!   Windows:  `%APPDATA%\layercache\layercache.log`
//!   Linux:    `~/.local/share/layercache/layercache.log`
//!   macOS:    `~/Library/Application Support/layercache/layercache.log`
//!
//! `RUST_LOG` overrides the level picked by `--verbose`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use env_logger::{Builder, Target};
use log::{LevelFilter, Log};

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Path of the current session log, once [`init`] has opened it.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

/// Initialise logging. Call once, before any other work.
///
/// * Creates (or truncates) the log file and writes a session header.
/// * Falls back to stderr if the file cannot be opened.
/// * Installs a panic hook that logs the panic before the default handler runs.
pub fn init(verbose: bool) {
    let path = log_file_path();
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };

    let mut builder = Builder::new();
    builder
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(buf, "[{}] [{}] [{}] {}", timestamp(), record.level(), record.target(), record.args())
        });

    match open_log_file(&path) {
        Ok(mut file) => {
            let _ = writeln!(file, "=== layercache session started (unix {}) ===", unix_secs());
            let _ = writeln!(file, "Log file: {}", path.display());
            let _ = writeln!(file);
            let _ = LOG_PATH.set(path);
            builder.target(Target::Pipe(Box::new(file)));
        }
        Err(e) => {
            // Not fatal; keep logging to stderr.
            eprintln!("[logger] Failed to open log file {:?}: {}", path, e);
            builder.target(Target::Stderr);
        }
    }

    if builder.try_init().is_err() {
        return;
    }

    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC: {}", info);
        log::logger().flush();
        prev(info);
    }));
}

fn open_log_file(path: &PathBuf) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).write(true).truncate(true).open(path)
}

fn log_file_path() -> PathBuf {
    data_dir().join("layercache").join("layercache.log")
}

/// Platform data directory (without the app sub-folder).
fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library").join("Application Support");
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    PathBuf::from(".")
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `HH:MM:SS` within the current (UTC) day.
fn timestamp() -> String {
    let secs = unix_secs();
    format!("{:02}:{:02}:{:02}", (secs % 86400) / 3600, (secs % 3600) / 60, secs % 60)
}
