use colored::Colorize;
use log::{Level, LevelFilter, Log, Metadata, Record};

/// Global terminal logger behind the `log` facade. Non-verbose host
/// output is routed here at DEBUG/WARN; `--dbg` raises the max level so
/// those lines become visible.
pub struct TermLogger {
    dbg: bool,
}

impl Log for TermLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        let max = if self.dbg { Level::Debug } else { Level::Info };
        metadata.level() <= max
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let msg = crate::mask_global(&format!("{}", record.args()));
        match record.level() {
            Level::Error => eprintln!("{} {}", "[ERROR]".red().bold(), msg),
            Level::Warn => println!("{} {}", "[WARN]".yellow(), msg),
            Level::Info => println!("{}", msg),
            Level::Debug | Level::Trace => println!("{} {}", "[DEBUG]".dimmed(), msg),
        }
    }

    fn flush(&self) {}
}

/// Installs the terminal logger. Safe to call more than once, later calls
/// keep the first installed logger.
pub fn init_term_logger(dbg: bool, mono: bool) {
    if mono {
        colored::control::set_override(false);
    }
    let level = if dbg {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if log::set_boxed_logger(Box::new(TermLogger { dbg })).is_ok() {
        log::set_max_level(level);
    }
}
