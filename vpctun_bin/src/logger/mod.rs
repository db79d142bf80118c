mod console;

use log::LevelFilter;

use crate::logger::console::ConsoleLogger;

/// Installs the process-wide log sink. Quiet runs show this workspace's
/// info lines only; `-v` opens the filter to debug and includes dependency
/// targets, which is where the ssh stderr drain and the per-flow traffic
/// lines live.
pub fn init(verbose: bool) {
    let filter = match verbose {
        true => LevelFilter::Debug,
        false => LevelFilter::Info,
    };
    // the library never touches the global level; the binary owns it
    log::set_max_level(filter);
    let logger = ConsoleLogger::new(filter, !verbose);
    if let Err(err) = log::set_boxed_logger(Box::new(logger)) {
        eprintln!("set logger error: {err}");
    }
}
