//! Output formatting utilities

use std::time::Duration;

use console::{style, Style, StyledObject};

use gantry_engine::UnitStatus;

/// Print a success message
pub fn success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

/// Print a warning message
pub fn warning(message: &str) {
    println!("{} {}", style("!").yellow().bold(), message);
}

/// Print an info message
pub fn info(message: &str) {
    println!("{} {}", style("→").blue(), message);
}

/// Create a styled header
pub fn header(text: &str) -> String {
    style(text).bold().to_string()
}

/// Create a styled key-value line
pub fn key_value(key: &str, value: &str) -> String {
    format!("  {}: {}", style(key).dim(), value)
}

/// Style for partition keys
pub fn partition_style() -> Style {
    Style::new().cyan()
}

/// Style for a unit status
pub fn status_style(status: UnitStatus) -> Style {
    match status {
        UnitStatus::Passed => Style::new().green(),
        UnitStatus::Failed | UnitStatus::ErrorTimeout | UnitStatus::ErrorWorkerCrashed => {
            Style::new().red()
        }
        UnitStatus::SkippedDependencyFailed
        | UnitStatus::SkippedFiltered
        | UnitStatus::SkippedAborted => Style::new().yellow(),
    }
}

/// Status marker shown in front of a unit
pub fn status_symbol(status: UnitStatus) -> StyledObject<&'static str> {
    let symbol = if status.is_passed() {
        "✓"
    } else if status.is_skipped() {
        "○"
    } else {
        "✗"
    };
    status_style(status).apply_to(symbol)
}

/// Seconds with one decimal
pub fn seconds(duration: Duration) -> String {
    format!("{:.1}s", duration.as_secs_f64())
}

/// "1 unit" / "3 units"
pub fn plural(count: usize, word: &str) -> String {
    format!("{} {}{}", count, word, if count == 1 { "" } else { "s" })
}
