//! Status messages for CLI commands
//!
//! Everything here goes to stderr; stdout carries only samples so it can be
//! piped.

use colored::Colorize;

pub fn success(msg: &str) {
    eprintln!("{} {}", "✓".green(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

pub fn info(msg: &str) {
    eprintln!("{} {}", "ℹ".blue(), msg);
}

pub fn warning(msg: &str) {
    eprintln!("{} {}", "⚠".yellow(), msg);
}
