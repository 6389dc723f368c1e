/// Macro for prefixed status logging to stderr (only when stderr is a terminal).
///
/// Usage:
/// ```ignore
/// log_status!("tunnel", "using {}", host);
/// log_status!("deploy", "progress {} / {}", done, total);
/// ```
#[macro_export]
macro_rules! log_status {
    ($prefix:expr, $($arg:tt)*) => {
        if ::std::io::IsTerminal::is_terminal(&::std::io::stderr()) {
            eprintln!(concat!("[", $prefix, "] {}"), format_args!($($arg)*));
        }
    };
}

pub mod commands;
pub mod core;
pub mod utils;

// Re-export everything from core for ergonomic library use
pub use crate::core::*;
