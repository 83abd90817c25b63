//! Logging macros that tag every line with a short prefix identifying the
//! logging entity (a node ID, a client ID, or a fixed tag string).

/// Log a TRACE-level message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// pl_trace!(me; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pl_trace {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };
}

/// Log a DEBUG-level message with parenthesized prefix.
#[macro_export]
macro_rules! pl_debug {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };
}

/// Log an INFO-level message with parenthesized prefix.
#[macro_export]
macro_rules! pl_info {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };
}

/// Log a WARN-level message with parenthesized prefix.
#[macro_export]
macro_rules! pl_warn {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };
}

/// Log an ERROR-level message with parenthesized prefix.
#[macro_export]
macro_rules! pl_error {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };
}

/// Log an error message with prefix, then produce an `Err(LeaseKvError)`
/// holding the same (prefixed) string.
///
/// Example:
/// ```no_run
/// return logged_err!(me; "unexpected {}", thing);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)*) => {{
        pl_error!($prefix; $fmt_str $(, $fmt_arg)*);
        Err(LeaseKvError(format!(
            concat!("({}) ", $fmt_str),
            $prefix $(, $fmt_arg)*
        )))
    }};
}
