//! Structured logging setup. Stdout always; plus a daily-rotating file
//! layer under `LOG_DIR` when that variable is set. No `tracing-appender`
//! dependency — rotation is a plain "reopen the file when the date
//! changes" check on every write, matching the corpus convention of
//! `field = value` structured logging via `tracing`.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::Local;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

fn open_for(dir: &PathBuf, prefix: &str, date: &str) -> io::Result<File> {
    std::fs::create_dir_all(dir)?;
    OpenOptions::new().create(true).append(true).open(dir.join(format!("{prefix}.{date}.log")))
}

struct DailyFile {
    dir: PathBuf,
    prefix: &'static str,
    current: Mutex<(String, File)>,
}

impl DailyFile {
    fn new(dir: PathBuf, prefix: &'static str) -> io::Result<Self> {
        let date = today();
        let file = open_for(&dir, prefix, &date)?;
        Ok(Self { dir, prefix, current: Mutex::new((date, file)) })
    }
}

struct DailyFileWriter<'a>(MutexGuard<'a, (String, File)>);

impl Write for DailyFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 .1.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0 .1.flush()
    }
}

impl<'a> MakeWriter<'a> for DailyFile {
    type Writer = DailyFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        let date = today();
        let mut guard = self.current.lock().expect("log file mutex poisoned");
        if guard.0 != date {
            if let Ok(file) = open_for(&self.dir, self.prefix, &date) {
                *guard = (date, file);
            }
        }
        DailyFileWriter(guard)
    }
}

/// Installs the global tracing subscriber. Call once at process start.
pub fn init() {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true);

    let Ok(log_dir) = std::env::var("LOG_DIR") else {
        tracing_subscriber::registry().with(filter()).with(stdout_layer).init();
        return;
    };

    match DailyFile::new(PathBuf::from(&log_dir), "nginx-shield") {
        Ok(daily) => {
            let file_layer = tracing_subscriber::fmt::layer().with_writer(daily).with_ansi(false).with_target(true);
            tracing_subscriber::registry().with(filter()).with(stdout_layer).with(file_layer).init();
        }
        Err(e) => {
            tracing_subscriber::registry().with(filter()).with(stdout_layer).init();
            tracing::warn!(log_dir = %log_dir, error = %e, "failed to open daily log file, logging to stdout only");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_file_writer_appends_to_todays_file() {
        let dir = tempfile::tempdir().unwrap();
        let daily = DailyFile::new(dir.path().to_path_buf(), "test").unwrap();
        daily.make_writer().write_all(b"hello\n").unwrap();
        daily.make_writer().write_all(b"world\n").unwrap();

        let path = dir.path().join(format!("test.{}.log", today()));
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents, "hello\nworld\n");
    }
}
