use std::io::{self, Write};
use std::time::SystemTime;

use log::{Level, Metadata, Record};
use nu_ansi_term::{Color, Style};

pub struct Logger;

/// How each level announces itself. Trace is deliberately faint so
/// word-level plumbing does not drown the decisions made above it.
fn tag(level: Level) -> Style {
	match level {
		Level::Error => Color::Red.bold(),
		Level::Warn => Color::Yellow.bold(),
		Level::Info => Color::Green.bold(),
		Level::Debug => Color::Blue.normal(),
		Level::Trace => Color::Purple.dimmed(),
	}
}

impl log::Log for Logger {
	fn enabled(&self, _: &Metadata) -> bool {
		true
	}

	fn log(&self, record: &Record) {
		let dim = Style::new().dimmed();
		// Millisecond resolution is plenty for a per-segment pipeline.
		let time = humantime::format_rfc3339_millis(SystemTime::now()).to_string();
		let level = tag(record.level()).paint(format!("{:5}", record.level().as_str()));
		let target = Style::new().bold().paint(record.target());

		let mut err = io::stderr().lock();
		let _ = writeln!(err, "{} {level} {target} {}", dim.paint(time), record.args());
	}

	fn flush(&self) {}
}
