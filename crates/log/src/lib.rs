//! Process-wide leveled logger shared by every btcnode crate.
//!
//! Records go to stderr as text or as one JSON object per line. An optional in-memory ring keeps
//! the most recent records for tests and embedders (see [`enable_capture`]).

mod capture;
mod filter;
mod timestamp;

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

use capture::CaptureRing;
pub use capture::CapturedLog;
pub use filter::{Filter, FilterError};
use timestamp::Timestamp;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let level = match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => return None,
        };
        Some(level)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text,
    Json,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.trim().eq_ignore_ascii_case("text") {
            Some(Self::Text)
        } else if raw.trim().eq_ignore_ascii_case("json") {
            Some(Self::Json)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
    /// Per-target overrides. A bare level inside the filter wins over `level`.
    pub filter: Option<Filter>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
            filter: None,
        }
    }
}

struct Settings {
    base: Level,
    format: Format,
    timestamps: bool,
    filter: Filter,
}

struct Logger {
    /// Most verbose level any target may log at; lets disabled call sites skip formatting.
    max_level: AtomicU8,
    stderr: AtomicBool,
    settings: RwLock<Settings>,
    capture: CaptureRing,
}

static LOGGER: Logger = Logger {
    max_level: AtomicU8::new(Level::Info as u8),
    stderr: AtomicBool::new(true),
    settings: RwLock::new(Settings {
        base: Level::Info,
        format: Format::Text,
        timestamps: true,
        filter: Filter::empty(),
    }),
    capture: CaptureRing::new(),
};

pub fn init(config: LogConfig) {
    let filter = config.filter.unwrap_or_default();
    let base = filter.default_level().unwrap_or(config.level);
    let max_level = filter.max_level(base);
    *LOGGER
        .settings
        .write()
        .unwrap_or_else(PoisonError::into_inner) = Settings {
        base,
        format: config.format,
        timestamps: config.timestamps,
        filter,
    };
    LOGGER.max_level.store(max_level as u8, Ordering::Relaxed);
}

/// Starts keeping the newest `capacity` records in memory. Zero turns capture off.
pub fn enable_capture(capacity: usize) {
    LOGGER.capture.enable(capacity);
}

pub fn disable_capture() {
    LOGGER.capture.disable();
}

pub fn clear_captured_logs() {
    LOGGER.capture.clear();
}

/// The newest `limit` captured records, oldest first.
pub fn capture_snapshot(limit: usize) -> Vec<CapturedLog> {
    LOGGER.capture.snapshot(limit)
}

pub fn set_stderr_enabled(enabled: bool) {
    LOGGER.stderr.store(enabled, Ordering::Relaxed);
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= LOGGER.max_level.load(Ordering::Relaxed)
}

struct Record<'a> {
    ts_ms: u64,
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'a>,
}

fn render_text<W: Write>(out: &mut W, record: &Record<'_>, timestamps: bool) -> io::Result<()> {
    if timestamps {
        write!(out, "{} ", Timestamp(record.ts_ms))?;
    }
    writeln!(out, "{:<5} {}: {}", record.level, record.target, record.args)
}

fn render_json<W: Write>(out: &mut W, record: &Record<'_>) -> io::Result<()> {
    let value = json!({
        "ts_ms": record.ts_ms,
        "level": record.level.as_str(),
        "target": record.target,
        "file": record.file,
        "line": record.line,
        "msg": record.args.to_string(),
    });
    serde_json::to_writer(&mut *out, &value)?;
    out.write_all(b"\n")
}

fn now_ms() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX)
}

pub fn log(
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    let (format, timestamps) = {
        let settings = LOGGER
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if level > settings.filter.level_for(target, settings.base) {
            return;
        }
        (settings.format, settings.timestamps)
    };

    let record = Record {
        ts_ms: now_ms(),
        level,
        target,
        file,
        line,
        args,
    };

    if LOGGER.stderr.load(Ordering::Relaxed) {
        // One write per record so concurrent threads never interleave within a line.
        let mut buf = Vec::with_capacity(160);
        let rendered = match format {
            Format::Text => render_text(&mut buf, &record, timestamps),
            Format::Json => render_json(&mut buf, &record),
        };
        if rendered.is_ok() {
            let _ = io::stderr().lock().write_all(&buf);
        }
    }

    if LOGGER.capture.is_enabled() {
        LOGGER.capture.push(CapturedLog {
            ts_ms: record.ts_ms,
            level,
            target,
            file,
            line,
            msg: record.args.to_string(),
        });
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Error, $($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Info, $($arg)*) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(args: fmt::Arguments<'_>, f: impl FnOnce(&Record<'_>)) {
        let record = Record {
            ts_ms: 1_231_006_505_000,
            level: Level::Warn,
            target: "btcnode_chainstate::chain",
            file: "crates/chainstate/src/chain.rs",
            line: 42,
            args,
        };
        f(&record);
    }

    #[test]
    fn parses_levels_and_formats() {
        assert_eq!(Level::parse(" WARNING "), Some(Level::Warn));
        assert_eq!(Level::parse("trace"), Some(Level::Trace));
        assert_eq!(Level::parse("loud"), None);
        assert_eq!(Format::parse("JSON"), Some(Format::Json));
        assert_eq!(Format::parse("text"), Some(Format::Text));
        assert_eq!(Format::parse("yaml"), None);
        assert!(Level::Error < Level::Trace);
    }

    #[test]
    fn text_lines_pad_the_level() {
        sample(format_args!("tip {}", 7), |record| {
            let mut out = Vec::new();
            render_text(&mut out, record, true).expect("render");
            assert_eq!(
                String::from_utf8(out).expect("utf8"),
                "2009-01-03T18:15:05.000Z WARN  btcnode_chainstate::chain: tip 7\n"
            );

            let mut out = Vec::new();
            render_text(&mut out, record, false).expect("render");
            assert_eq!(
                String::from_utf8(out).expect("utf8"),
                "WARN  btcnode_chainstate::chain: tip 7\n"
            );
        });
    }

    #[test]
    fn json_lines_carry_every_field() {
        sample(format_args!("say \"hi\""), |record| {
            let mut out = Vec::new();
            render_json(&mut out, record).expect("render");
            assert_eq!(out.last(), Some(&b'\n'));
            let value: serde_json::Value = serde_json::from_slice(&out).expect("json");
            assert_eq!(value["ts_ms"], 1_231_006_505_000u64);
            assert_eq!(value["level"], "WARN");
            assert_eq!(value["target"], "btcnode_chainstate::chain");
            assert_eq!(value["line"], 42);
            assert_eq!(value["msg"], "say \"hi\"");
        });
    }

    // The only test that touches the global logger.
    #[test]
    fn filter_and_capture_through_the_global_logger() {
        let filter = Filter::parse("warn,btcnode_log::tests=debug").expect("filter");
        init(LogConfig {
            filter: Some(filter),
            ..LogConfig::default()
        });
        set_stderr_enabled(false);
        enable_capture(8);
        clear_captured_logs();

        assert!(enabled(Level::Debug));
        assert!(!enabled(Level::Trace));

        crate::log_debug!("kept {}", 1);
        crate::log_trace!("dropped by max level");
        log(Level::Info, "btcnode_storage", file!(), line!(), format_args!("below warn"));
        log(Level::Warn, "btcnode_storage", file!(), line!(), format_args!("kept 2"));

        let captured = capture_snapshot(8);
        let messages: Vec<&str> = captured.iter().map(|record| record.msg.as_str()).collect();
        assert_eq!(messages, ["kept 1", "kept 2"]);
        assert_eq!(captured[0].target, "btcnode_log::tests");
        assert_eq!(captured[0].level, Level::Debug);

        disable_capture();
        crate::log_warn!("not captured");
        assert_eq!(capture_snapshot(8).len(), 2);
        set_stderr_enabled(true);
    }
}
