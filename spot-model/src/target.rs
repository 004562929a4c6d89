use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{ModelError, ModelResult};

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Concrete endpoint a worker connects to. Identity for deduplication is
/// `host:port:user`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Destination {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Destination {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Destination {
        Destination {
            name: String::new(),
            host: host.into(),
            port,
            user: None,
            tags: Vec::new(),
        }
    }

    /// `host:port` form used for dialing and for host-addr log prefixes.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Deduplication key.
    pub fn identity(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host,
            self.port,
            self.user.as_deref().unwrap_or("")
        )
    }

    /// Missing port becomes 22; missing user is taken from `user` when
    /// provided.
    pub fn with_defaults(mut self, user: Option<&str>) -> Destination {
        if self.port == 0 {
            self.port = DEFAULT_SSH_PORT;
        }
        if self.user.is_none() {
            self.user = user.map(|u| u.to_string());
        }
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Named set of destinations in a playbook. At least one of the four
/// lists must be non-empty for the target to resolve.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<Destination>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Target {
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.groups.is_empty() && self.names.is_empty() && self.tags.is_empty()
    }
}

lazy_static! {
    static ref HOST_PORT_RE: Regex = Regex::new(r"^(.+):(\d+)$").expect("valid pattern");
}

/// Strict `host[:port]` parse; a `:` with a non-numeric suffix is an
/// error.
pub fn parse_host_port(s: &str) -> ModelResult<(String, u16)> {
    if let Some(caps) = HOST_PORT_RE.captures(s) {
        let port = caps[2]
            .parse::<u16>()
            .map_err(|_| ModelError::HostPortParse(s.to_string()))?;
        if port == 0 {
            return Err(ModelError::HostPortParse(s.to_string()));
        }
        return Ok((caps[1].to_string(), port));
    }
    if s.contains(':') {
        return Err(ModelError::HostPortParse(s.to_string()));
    }
    Ok((s.to_string(), DEFAULT_SSH_PORT))
}

/// Lenient variant used by the simplified playbook form: anything that
/// does not look like `host:port` keeps the whole string as host with the
/// default port.
pub fn parse_host_port_lenient(s: &str) -> (String, u16) {
    match parse_host_port(s) {
        Ok(hp) => hp,
        Err(_) => (s.to_string(), DEFAULT_SSH_PORT),
    }
}

/// Name of the user the process runs as; last resort of the user
/// precedence chain. The uid lookup can only fail in odd chroots.
pub fn current_user() -> String {
    users::get_current_username()
        .map(|u| u.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_plain_host_defaults_port() {
        assert_eq!(
            parse_host_port("h.example.com").unwrap(),
            ("h.example.com".to_string(), 22)
        );
    }

    #[test]
    fn parse_host_with_port() {
        assert_eq!(
            parse_host_port("h.example.com:2222").unwrap(),
            ("h.example.com".to_string(), 2222)
        );
    }

    #[test]
    fn parse_rejects_non_numeric_port() {
        assert!(parse_host_port("h.example.com:ssh").is_err());
        assert!(parse_host_port("h.example.com:0").is_err());
    }

    #[test]
    fn lenient_parse_keeps_whole_string() {
        assert_eq!(
            parse_host_port_lenient("h:ssh"),
            ("h:ssh".to_string(), 22)
        );
        assert_eq!(parse_host_port_lenient("h:23"), ("h".to_string(), 23));
    }

    #[test]
    fn identity_covers_user() {
        let mut d = Destination::new("h", 22);
        assert_eq!(d.identity(), "h:22:");
        d.user = Some("app".to_string());
        assert_eq!(d.identity(), "h:22:app");
    }

    #[test]
    fn defaults_fill_port_and_user() {
        let d = Destination::new("h", 0).with_defaults(Some("deploy"));
        assert_eq!(d.port, 22);
        assert_eq!(d.user.as_deref(), Some("deploy"));

        let d = Destination {
            user: Some("own".to_string()),
            ..Destination::new("h", 2022)
        }
        .with_defaults(Some("deploy"));
        assert_eq!(d.port, 2022);
        assert_eq!(d.user.as_deref(), Some("own"));
    }
}
