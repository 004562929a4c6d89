use std::sync::Arc;

use colored::{Color, Colorize};
use flate2::Crc;
use parking_lot::RwLock;

use crate::mask::Masker;

const PALETTE: [Color; 6] = [
    Color::Red,
    Color::Green,
    Color::Yellow,
    Color::Blue,
    Color::Magenta,
    Color::Cyan,
];

/// Colour assigned to a host, stable across runs for the same address.
pub fn host_color(host_addr: &str) -> Color {
    let mut crc = Crc::new();
    crc.update(host_addr.as_bytes());
    PALETTE[(crc.sum() as usize) % PALETTE.len()]
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StreamKind {
    /// Operator-facing progress, always printed.
    Info,
    /// Remote/local command stdout, prefixed with ` >`.
    Out,
    /// Remote/local command stderr, prefixed with ` !`.
    Err,
}

/// Per-host output sink. `Info` lines always go to stdout, colourised by
/// the host colour. `Out`/`Err` lines go to stdout only in verbose mode;
/// otherwise they are routed through the standard logger at DEBUG/WARN so
/// `--dbg` can surface them.
///
/// Every line is passed through the masker before it is written anywhere.
#[derive(Clone)]
pub struct HostLog {
    host_addr: String,
    host_name: String,
    verbose: bool,
    masker: Arc<RwLock<Masker>>,
}

impl HostLog {
    pub fn new(verbose: bool) -> HostLog {
        HostLog {
            host_addr: String::new(),
            host_name: String::new(),
            verbose,
            masker: Arc::new(RwLock::new(Masker::empty())),
        }
    }

    /// Derived writer bound to a concrete host; shares the secret list
    /// with the parent.
    pub fn with_host(&self, host_addr: &str, host_name: &str) -> HostLog {
        HostLog {
            host_addr: host_addr.to_string(),
            host_name: host_name.to_string(),
            verbose: self.verbose,
            masker: self.masker.clone(),
        }
    }

    pub fn set_secrets(&self, secrets: &[String]) {
        self.masker.write().add(secrets);
        crate::add_global_secrets(secrets);
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn host_addr(&self) -> &str {
        &self.host_addr
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn info(&self, msg: &str) {
        self.write(StreamKind::Info, msg)
    }

    pub fn out(&self, line: &str) {
        self.write(StreamKind::Out, line)
    }

    pub fn err(&self, line: &str) {
        self.write(StreamKind::Err, line)
    }

    pub fn write(&self, kind: StreamKind, msg: &str) {
        let msg = self.masker.read().apply(msg);
        let prefix = self.prefix();
        match kind {
            StreamKind::Info => {
                let line = format!("{} {}", prefix, msg);
                println!("{}", line.color(self.color()));
            }
            StreamKind::Out => {
                if self.verbose {
                    let line = format!("{} > {}", prefix, msg);
                    println!("{}", line.color(self.color()));
                } else {
                    log::debug!("{} > {}", prefix, msg);
                }
            }
            StreamKind::Err => {
                if self.verbose {
                    let line = format!("{} ! {}", prefix, msg);
                    println!("{}", line.color(self.color()));
                } else {
                    log::warn!("{} ! {}", prefix, msg);
                }
            }
        }
    }

    fn color(&self) -> Color {
        host_color(&self.host_addr)
    }

    fn prefix(&self) -> String {
        if self.host_name.is_empty() {
            format!("[{}]", self.host_addr)
        } else {
            format!("[{} {}]", self.host_name, self.host_addr)
        }
    }
}

impl std::fmt::Debug for HostLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostLog")
            .field("host_addr", &self.host_addr)
            .field("host_name", &self.host_name)
            .field("verbose", &self.verbose)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_is_deterministic() {
        let a = host_color("10.0.0.1:22");
        let b = host_color("10.0.0.1:22");
        assert_eq!(a, b);
    }

    #[test]
    fn derived_writer_keeps_secrets() {
        let root = HostLog::new(true);
        root.set_secrets(&["hush".to_string()]);
        let derived = root.with_host("h1:22", "h1");
        assert_eq!(derived.masker.read().apply("say hush"), "say ****");
    }

    #[test]
    fn prefix_with_and_without_name() {
        let log = HostLog::new(false).with_host("1.2.3.4:22", "web");
        assert_eq!(log.prefix(), "[web 1.2.3.4:22]");
        let log = HostLog::new(false).with_host("1.2.3.4:22", "");
        assert_eq!(log.prefix(), "[1.2.3.4:22]");
    }
}
