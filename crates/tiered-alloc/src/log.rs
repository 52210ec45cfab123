//! Injectable diagnostic logging.
//!
//! The allocator never owns a global logger. Each [`TieredAllocator`] is
//! generic over a [`Logger`] supplied by the caller; [`NoopLogger`] turns all
//! tracing off without changing allocator behavior.
//!
//! [`TieredAllocator`]: crate::TieredAllocator

use core::fmt;

macro_rules! log {
    ($logger:expr, $level:expr, $($arg:tt)*) => {
        $crate::log::log(&$logger, $level, format_args!($($arg)*))
    };
}

macro_rules! trace {
    ($logger:expr, $($arg:tt)*) => {
        log!($logger, $crate::log::LogLevel::Trace, $($arg)*)
    };
}

macro_rules! debug {
    ($logger:expr, $($arg:tt)*) => {
        log!($logger, $crate::log::LogLevel::Debug, $($arg)*)
    };
}

macro_rules! warn {
    ($logger:expr, $($arg:tt)*) => {
        log!($logger, $crate::log::LogLevel::Warn, $($arg)*)
    };
}

/// Forwards `message` to `logger` if `level` is enabled.
pub fn log<L>(logger: &L, level: LogLevel, message: fmt::Arguments<'_>)
where
    L: Logger + ?Sized,
{
    if logger.enabled(level) {
        logger.log(level, message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => " INFO",
            Self::Warn => " WARN",
            Self::Error => "ERROR",
        };
        f.write_str(msg)
    }
}

/// A sink for allocator diagnostics.
pub trait Logger {
    /// Returns `true` if messages at `level` should be formatted at all.
    fn enabled(&self, level: LogLevel) -> bool;

    /// Records one message.
    fn log(&self, level: LogLevel, message: fmt::Arguments<'_>);
}

impl<L> Logger for &L
where
    L: Logger + ?Sized,
{
    fn enabled(&self, level: LogLevel) -> bool {
        (**self).enabled(level)
    }

    fn log(&self, level: LogLevel, message: fmt::Arguments<'_>) {
        (**self).log(level, message);
    }
}

/// A logger that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn enabled(&self, _level: LogLevel) -> bool {
        false
    }

    fn log(&self, _level: LogLevel, _message: fmt::Arguments<'_>) {}
}

/// A level-gated logger that prefixes each line with a name and a tag.
///
/// Lines look like `[name:tag] DEBUG message` and are passed to `sink`.
pub struct TaggedLogger<S> {
    name: &'static str,
    tag: u32,
    level: LogLevel,
    sink: S,
}

impl<S> fmt::Debug for TaggedLogger<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedLogger")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

/// Creates a [`TaggedLogger`] that forwards messages at `level` or above.
///
/// ```
/// use core::{cell::RefCell, fmt::Write as _};
///
/// use tiered_alloc::log::{LogLevel, Logger as _, new_logger};
///
/// let out = RefCell::new(String::new());
/// let logger = new_logger("heap", 1, LogLevel::Debug, |line| {
///     writeln!(out.borrow_mut(), "{line}").unwrap();
/// });
/// logger.log(LogLevel::Debug, format_args!("grow {} bytes", 64));
/// assert_eq!(out.borrow().as_str(), "[heap:1] DEBUG grow 64 bytes\n");
/// ```
pub const fn new_logger<S>(name: &'static str, tag: u32, level: LogLevel, sink: S) -> TaggedLogger<S>
where
    S: Fn(fmt::Arguments<'_>),
{
    TaggedLogger {
        name,
        tag,
        level,
        sink,
    }
}

impl<S> TaggedLogger<S> {
    #[must_use]
    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.level = level;
    }
}

impl<S> Logger for TaggedLogger<S>
where
    S: Fn(fmt::Arguments<'_>),
{
    fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level
    }

    fn log(&self, level: LogLevel, message: fmt::Arguments<'_>) {
        (self.sink)(format_args!(
            "[{}:{}] {} {}",
            self.name, self.tag, level, message
        ));
    }
}
