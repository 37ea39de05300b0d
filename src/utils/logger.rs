/// ANSI color codes for operator-facing console output.
pub struct Colors;

impl Colors {
    /// Primary actions/success - #5FADEB
    pub const MAIN: &'static str = "\x1b[38;2;95;173;235m";
    /// Errors - #FF3B30
    pub const ERROR: &'static str = "\x1b[38;2;255;59;48m";
    /// Reset all formatting
    pub const RESET: &'static str = "\x1b[0m";
}

/// Unicode symbols for different message types
pub struct Symbols;

impl Symbols {
    pub const SUCCESS: &'static str = "✓";
    pub const ERROR: &'static str = "✗";
}

/// Console logger for the command-line surface. Daemon-side logging
/// goes through tracing; this is for direct operator feedback.
pub struct Logger;

impl Logger {
    /// Log a success message (blue checkmark)
    pub fn success(message: &str) {
        println!(
            "{}{} {}{}",
            Colors::MAIN,
            Symbols::SUCCESS,
            message,
            Colors::RESET
        );
    }

    /// Log an error message (red X) to stderr
    pub fn error(message: &str) {
        eprintln!(
            "{}{} {}{}",
            Colors::ERROR,
            Symbols::ERROR,
            message,
            Colors::RESET
        );
    }
}
