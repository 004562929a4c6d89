use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::{NoExpand, Regex};

/// Marker prefixed to values captured via `setvar KEY:SQ=...`. On
/// substitution the marker is stripped and every `$` escaped, so the
/// value survives another trip through a single-quoting shell.
pub const SQ_MARKER: &str = "__SQ__:";

/// Substitutes `{X}`, `${X}` and `$X` forms of the built-in `SPOT_*`
/// variables and every environment/registered variable into
/// user-supplied strings.
#[derive(Debug, Clone, Default)]
pub struct Templater {
    pub host_addr: String,
    pub host_name: String,
    pub task: String,
    pub command: String,
    pub user: String,
    pub env: IndexMap<String, String>,
    pub err: Option<String>,
}

impl Templater {
    pub fn apply(&self, input: &str) -> String {
        let (host, port) = match self.host_addr.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.to_string()),
            None => (self.host_addr.clone(), "22".to_string()),
        };

        let mut vars: Vec<(String, String)> = vec![
            ("SPOT_REMOTE_HOST".to_string(), self.host_addr.clone()),
            ("SPOT_REMOTE_NAME".to_string(), self.host_name.clone()),
            ("SPOT_REMOTE_ADDR".to_string(), host),
            ("SPOT_REMOTE_PORT".to_string(), port),
            ("SPOT_REMOTE_USER".to_string(), self.user.clone()),
            ("SPOT_TASK".to_string(), self.task.clone()),
            ("SPOT_COMMAND".to_string(), self.command.clone()),
            (
                "SPOT_ERROR".to_string(),
                self.err.clone().unwrap_or_default(),
            ),
        ];
        for (k, v) in &self.env {
            vars.push((k.clone(), v.clone()));
        }
        // longest first so FOO never clobbers FOOBAR
        vars.sort_by_key(|(k, _)| std::cmp::Reverse(k.len()));

        let mut out = input.to_string();
        for (k, v) in vars {
            let v = unmark(&v);
            out = out.replace(&format!("${{{}}}", k), &v);
            out = out.replace(&format!("{{{}}}", k), &v);
            if let Ok(re) = Regex::new(&format!(r"\${}\b", regex::escape(&k))) {
                out = re.replace_all(&out, NoExpand(&v)).into_owned();
            }
        }
        out
    }
}

/// Strips the single-quote marker and escapes `$` so the value is
/// emitted literally downstream.
fn unmark(v: &str) -> String {
    match v.strip_prefix(SQ_MARKER) {
        Some(raw) => raw.replace('$', "\\$"),
        None => v.to_string(),
    }
}

/// Marker-less view of a value, for contexts that single-quote it
/// themselves (e.g. exported environment assignments).
pub(crate) fn strip_marker(v: &str) -> &str {
    v.strip_prefix(SQ_MARKER).unwrap_or(v)
}

lazy_static! {
    static ref SETVAR_RE: Regex =
        Regex::new(r"^setvar ([A-Za-z_][A-Za-z0-9_]*)(:SQ)?=(.*)$").expect("valid pattern");
}

/// Extracts `setvar KEY=VALUE` / `setvar KEY:SQ=VALUE` protocol lines
/// from captured stdout. Returns the variable map and the remaining
/// lines; protocol lines are consumed and not forwarded further.
pub fn extract_setvars(lines: &[String]) -> (IndexMap<String, String>, Vec<String>) {
    let mut vars = IndexMap::new();
    let mut rest = Vec::new();
    for line in lines {
        match SETVAR_RE.captures(line) {
            Some(caps) => {
                let key = caps[1].to_string();
                let sq = caps.get(2).is_some();
                let value = caps[3].to_string();
                let value = if sq {
                    format!("{}{}", SQ_MARKER, value)
                } else {
                    value
                };
                vars.insert(key, value);
            }
            None => rest.push(line.clone()),
        }
    }
    (vars, rest)
}
