use log::LevelFilter;

mod exec;
mod logger;

pub use exec::*;

/// Install the stderr logger and set the maximum level.
///
/// Call once at startup (or from a test harness); later calls are ignored so
/// parallel test binaries can race on it safely.
pub fn init(filter: LevelFilter) {
	static LOGGER: logger::Logger = logger::Logger;

	if log::set_logger(&LOGGER).is_ok() {
		log::set_max_level(filter);
	}
}
