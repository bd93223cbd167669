// src/logging.rs
//
// Timestamped logging with an optional file sink.
//
// Every tlog! line goes to stderr; when a sink is enabled the same line is
// teed into a dated file under the chosen directory. The sink drops itself
// on the first failed write so a full disk cannot wedge the capture path.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Active file sink, if any. Only `write_line` and the enable/disable pair
/// touch it.
static SINK: Mutex<Option<File>> = Mutex::new(None);

/// Timestamped logging macro. `HH:MM:SS.mmm` local-time prefix, stderr plus
/// the optional file sink.
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::write_line(format_args!($($arg)*))
    };
}

/// Format and emit one log line: stderr always, the file sink when enabled.
/// Called by `tlog!`; not meant to be used directly.
pub fn write_line(args: std::fmt::Arguments<'_>) {
    let line = format!(
        "{} {}",
        chrono::Local::now().format("%H:%M:%S%.3f"),
        args
    );
    eprintln!("{}", line);

    if let Ok(mut sink) = SINK.lock() {
        if let Some(file) = sink.as_mut() {
            if writeln!(file, "{}", line).is_err() {
                // Sink is dead (disk full, file deleted); keep stderr going
                *sink = None;
            }
        }
    }
}

/// Start teeing log lines into `<dir>/commwatch-<stamp>.log`.
/// Returns the path of the file being written. On Unix a `latest.log`
/// symlink in the same directory tracks the newest file.
pub fn enable_file_log(dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let name = format!(
        "commwatch-{}.log",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    );
    let path = dir.join(&name);
    let file = File::options().create(true).append(true).open(&path)?;

    refresh_latest_link(dir, &name);

    if let Ok(mut sink) = SINK.lock() {
        *sink = Some(file);
    }
    tlog!("[logging] teeing to {}", path.display());
    Ok(path)
}

/// Stop teeing and close the file.
pub fn disable_file_log() {
    let was_active = SINK
        .lock()
        .map(|mut sink| sink.take().is_some())
        .unwrap_or(false);
    if was_active {
        tlog!("[logging] file sink closed");
    }
}

/// Point `latest.log` at the newest dated file. Failure is not fatal, the
/// dated file itself is still written.
#[cfg(unix)]
fn refresh_latest_link(dir: &Path, name: &str) {
    let link = dir.join("latest.log");
    let _ = std::fs::remove_file(&link);
    let _ = std::os::unix::fs::symlink(name, &link);
}

// Symlinks need elevated privileges on Windows
#[cfg(not(unix))]
fn refresh_latest_link(_dir: &Path, _name: &str) {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // One test owns the whole sink lifecycle: the sink is process-global, so
    // splitting these into separate #[test] fns would race under the
    // parallel test runner.
    #[test]
    fn test_file_sink_lifecycle() {
        // Disabling with no sink active is a quiet no-op
        disable_file_log();

        let dir = std::env::temp_dir().join(format!("commwatch-log-{}", std::process::id()));
        let path = enable_file_log(&dir).unwrap();

        tlog!("[logging-test] marker {}", 4242);
        disable_file_log();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("marker 4242"));

        // Lines after disable stay out of the file
        let len_before = std::fs::metadata(&path).unwrap().len();
        tlog!("[logging-test] after close");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len_before);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
