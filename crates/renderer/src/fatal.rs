//! Fatal precondition failures.

/// Logs a formatted diagnostic at error level, then panics with it.
///
/// Used for misconfiguration and device failures the frame loop cannot
/// recover from. Release builds abort on panic.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        let message = format!($($arg)+);
        tracing::error!("{}", message);
        panic!("{}", message)
    }};
}
