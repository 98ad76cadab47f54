use std::cell::RefCell;
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Ordered so that `level as usize <= verbosity` gates emission.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::LogFatal => "FATAL",
            LogLevel::LogError => "ERROR",
            LogLevel::LogWarn => "WARN",
            LogLevel::LogInfo => "INFO",
            LogLevel::LogDebug => "DEBUG",
        }
    }
}

static VERBOSITY: AtomicUsize = AtomicUsize::new(LogLevel::LogWarn as usize);

thread_local! {
    static SINK: RefCell<Option<File>> = RefCell::new(None);
}

/// Set the verbosity threshold; messages above this level are dropped.
/// Called once from main() after parsing `-v`/`-v -v`/...
pub fn set_verbosity(level: LogLevel) {
    VERBOSITY.store(level as usize, Ordering::Relaxed);
}

/// Redirect subsequent log output in this thread to `file`, implementing
/// `-l FILE`.
pub fn redirect_to_file(file: File) {
    SINK.with(|s| *s.borrow_mut() = Some(file));
}

#[doc(hidden)]
pub fn __log_enabled(level: LogLevel) -> bool {
    level as usize <= VERBOSITY.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn __log_emit(level: LogLevel, args: fmt::Arguments<'_>) {
    let line = format!("[{}] {}\n", level.tag(), args);
    let wrote = SINK.with(|s| {
        if let Some(f) = s.borrow_mut().as_mut() {
            let _ = f.write_all(line.as_bytes());
            true
        } else {
            false
        }
    });
    if !wrote {
        eprint!("{}", line);
    }
    if level == LogLevel::LogFatal {
        std::process::abort();
    }
}

use std::fmt;

/// Logs a message at the given level, mirroring the teacher's
/// `log!(LogDebug, "...", args)` call sites (see `thread_group.rs`).
/// `LogFatal` aborts the process after emitting the message.
#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::log::__log_enabled($level) {
            $crate::log::__log_emit($level, format_args!($($arg)*));
        } else if $level == $crate::log::LogLevel::LogFatal {
            $crate::log::__log_emit($level, format_args!($($arg)*));
        }
    }};
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verbosity_gates_levels() {
        set_verbosity(LogLevel::LogWarn);
        assert!(__log_enabled(LogLevel::LogError));
        assert!(__log_enabled(LogLevel::LogWarn));
        assert!(!__log_enabled(LogLevel::LogInfo));
        set_verbosity(LogLevel::LogDebug);
        assert!(__log_enabled(LogLevel::LogDebug));
    }
}
