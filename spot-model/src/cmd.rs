use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{ModelError, ModelResult};

/// A single playbook command: shared fields plus exactly one action
/// variant, discriminated by which key is present in the config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cmd {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub register: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "CmdOptions::is_default")]
    pub options: CmdOptions,
    #[serde(flatten)]
    pub action: CmdAction,
}

/// The nine action shapes. Parsing as an enum enforces the
/// one-variant-per-command invariant at the type layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CmdAction {
    Script(String),
    Copy(CopySpec),
    Mcopy(Vec<CopySpec>),
    Sync(SyncSpec),
    Msync(Vec<SyncSpec>),
    Delete(DeleteSpec),
    Mdelete(Vec<DeleteSpec>),
    Wait(WaitSpec),
    Echo(String),
    Line(LineSpec),
}

impl CmdAction {
    pub fn kind(&self) -> &'static str {
        match self {
            CmdAction::Script(_) => "script",
            CmdAction::Copy(_) => "copy",
            CmdAction::Mcopy(_) => "mcopy",
            CmdAction::Sync(_) => "sync",
            CmdAction::Msync(_) => "msync",
            CmdAction::Delete(_) => "delete",
            CmdAction::Mdelete(_) => "mdelete",
            CmdAction::Wait(_) => "wait",
            CmdAction::Echo(_) => "echo",
            CmdAction::Line(_) => "line",
        }
    }
}

impl Cmd {
    pub fn script<N: Into<String>, S: Into<String>>(name: N, script: S) -> Cmd {
        Cmd {
            name: name.into(),
            env: IndexMap::new(),
            condition: None,
            register: Vec::new(),
            secrets: Vec::new(),
            options: CmdOptions::default(),
            action: CmdAction::Script(script.into()),
        }
    }

    /// Display label: explicit name when given, action kind otherwise.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            self.action.kind()
        } else {
            &self.name
        }
    }

    /// All secret keys this command references, sudo password included.
    pub fn secret_keys(&self) -> Vec<String> {
        let mut keys = self.secrets.clone();
        if let Some(ref k) = self.options.sudo_password {
            keys.push(k.clone());
        }
        keys
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CmdOptions {
    pub ignore_errors: bool,
    pub no_auto: bool,
    pub local: bool,
    pub sudo: bool,
    /// Secret key (not the value) of the password fed to `sudo -S`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sudo_password: Option<String>,
}

impl CmdOptions {
    pub fn is_default(&self) -> bool {
        *self == CmdOptions::default()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CopyDirection {
    Push,
    Pull,
}

impl Default for CopyDirection {
    fn default() -> Self {
        CopyDirection::Push
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CopySpec {
    pub src: String,
    pub dst: String,
    #[serde(default, skip_serializing_if = "is_push")]
    pub direction: CopyDirection,
    #[serde(default, skip_serializing_if = "is_false")]
    pub mkdir: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub force: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub chmod_x: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSpec {
    pub src: String,
    pub dst: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub force: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteSpec {
    pub path: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub recur: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitSpec {
    pub cmd: String,
    /// Unbounded when omitted.
    #[serde(default, with = "opt_duration", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Predicate poll period, 5s when omitted.
    #[serde(default, with = "opt_duration", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineSpec {
    pub file: String,
    #[serde(rename = "match")]
    pub pattern: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append: Option<String>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_push(d: &CopyDirection) -> bool {
    *d == CopyDirection::Push
}

/// Parses `1h2m3s`, `90s`, `200ms` style duration strings.
pub fn parse_duration(s: &str) -> ModelResult<Duration> {
    use lazy_static::lazy_static;
    use regex::Regex;

    lazy_static! {
        static ref DUR_RE: Regex =
            Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?(?:(\d+)ms)?$").expect("valid pattern");
    }

    let s = s.trim();
    let caps = DUR_RE
        .captures(s)
        .ok_or_else(|| ModelError::DurationParse(s.to_string()))?;
    if caps
        .iter()
        .skip(1)
        .all(|c| c.is_none())
    {
        return Err(ModelError::DurationParse(s.to_string()));
    }
    let num = |i: usize| -> u64 {
        caps.get(i)
            .map(|m| m.as_str().parse::<u64>().unwrap_or(0))
            .unwrap_or(0)
    };
    let millis = num(1) * 3_600_000 + num(2) * 60_000 + num(3) * 1_000 + num(4);
    Ok(Duration::from_millis(millis))
}

pub fn format_duration(d: Duration) -> String {
    let mut millis = d.as_millis() as u64;
    let mut out = String::new();
    let h = millis / 3_600_000;
    millis %= 3_600_000;
    let m = millis / 60_000;
    millis %= 60_000;
    let s = millis / 1_000;
    millis %= 1_000;
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if m > 0 {
        out.push_str(&format!("{}m", m));
    }
    if s > 0 {
        out.push_str(&format!("{}s", s));
    }
    if millis > 0 || out.is_empty() {
        out.push_str(&format!("{}ms", millis));
    }
    out
}

mod opt_duration {
    use super::*;
    use serde::de::Error as DeError;
    use serde::{Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Str(String),
    }

    pub fn serialize<S: Serializer>(v: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => ser.serialize_str(&format_duration(*d)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<Raw> = Option::deserialize(de)?;
        match raw {
            None => Ok(None),
            Some(Raw::Num(secs)) => Ok(Some(Duration::from_millis((secs * 1000.0) as u64))),
            Some(Raw::Str(s)) => parse_duration(&s)
                .map(Some)
                .map_err(|e| D::Error::custom(e.to_string())),
        }
    }
}
