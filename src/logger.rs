//! Host stderr log sink.
//!
//! A single lock-guarded writer that every `log` call goes through, so
//! concurrent harts never interleave partial lines. Color is applied only
//! when stderr is attached to a terminal.

use std::io::Write;
use std::sync::Mutex;

use is_terminal::IsTerminal;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct StderrSink {
    color: bool,
}

static SINK: Mutex<Option<StderrSink>> = Mutex::new(None);

struct CoreLogger;

impl Log for CoreLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let guard = SINK.lock().unwrap();
        let color = guard.as_ref().map(|s| s.color).unwrap_or(false);
        let (prefix, code) = match record.level() {
            Level::Error => ("ERROR", "31"),
            Level::Warn => ("WARN ", "33"),
            Level::Info => ("INFO ", "32"),
            Level::Debug => ("DEBUG", "36"),
            Level::Trace => ("TRACE", "90"),
        };
        let mut stderr = std::io::stderr();
        if color {
            let _ = writeln!(
                stderr,
                "\x1b[{code}m[{prefix}]\x1b[0m {}",
                record.args()
            );
        } else {
            let _ = writeln!(stderr, "[{prefix}] {}", record.args());
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: CoreLogger = CoreLogger;

/// Install the log sink. Idempotent; safe to call from multiple threads or
/// repeatedly (later calls are no-ops), matching how `Runtime::global()`
/// lazily brings up shared state on first use.
pub fn init(level: LevelFilter) {
    *SINK.lock().unwrap() = Some(StderrSink {
        color: std::io::stderr().is_terminal(),
    });
    // `set_logger` fails only if a logger is already installed; that's fine,
    // it means a previous `init()` call (or the caller's own logger) won.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Log a fatal invariant violation and abort the process.
///
/// Per the error design, this is reserved for states that make the process
/// unsafe to continue running — allocator exhaustion, a corrupted internal
/// invariant. It is never used for guest-triggerable conditions.
#[track_caller]
pub fn fatal(args: std::fmt::Arguments) -> ! {
    log::error!("FATAL: {args}");
    let _ = std::io::stderr().flush();
    std::process::abort();
}

/// Log a fatal error and abort, formatting like `format!`.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::logger::fatal(format_args!($($arg)*))
    };
}
