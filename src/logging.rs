use std::io::Write;

use log::LevelFilter;

/// Configure the process logger. Messages go to stderr without timestamps or
/// module paths; `--debug` switches per-sweep diagnostics on.
pub fn init(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .try_init();
}
