//! Small helpers shared by the executor implementations: shell quoting,
//! glob expansion, exclude filters and file-metadata comparisons.

use std::borrow::Cow;
use std::ffi::CString;
use std::fs::Metadata;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use glob::Pattern;

use crate::{ExecError, ExecResult};

/// Single-quotes a string for a POSIX shell, escaping embedded quotes as
/// `'\''`.
pub fn quote(s: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(s)).into_owned()
}

/// Extracts the inner command from an already-wrapped `sh -c '...'` form
/// so local execution does not shell out twice.
pub fn dequote_sh(cmd: &str) -> Option<String> {
    let trimmed = cmd.trim();
    for prefix in &["sh -c ", "/bin/sh -c "] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            let rest = rest.trim();
            if rest.len() >= 2 {
                let first = rest.chars().next().unwrap_or(' ');
                if (first == '\'' || first == '"') && rest.ends_with(first) {
                    return Some(rest[1..rest.len() - 1].to_string());
                }
            }
        }
    }
    None
}

pub fn compile_excludes(patterns: &[String]) -> ExecResult<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| ExecError::Pattern {
                pattern: p.clone(),
                detail: e.to_string(),
            })
        })
        .collect()
}

/// Exclusion test against a path relative to the operation root.
pub fn is_excluded(rel: &Path, excludes: &[Pattern]) -> bool {
    excludes.iter().any(|p| p.matches_path(rel))
}

/// True when `rel` itself is excluded or is a parent of an excluded
/// entry; such directories must survive an exclude-aware delete.
pub fn shields_excluded(rel: &Path, excluded: &[PathBuf]) -> bool {
    excluded.iter().any(|e| e.starts_with(rel))
}

pub fn has_glob_meta(s: &str) -> bool {
    s.chars().any(|c| matches!(c, '*' | '?' | '['))
}

/// Longest literal directory prefix of a glob pattern; relative paths of
/// matches are computed against it for exclude filtering.
pub fn glob_base(pattern: &str) -> PathBuf {
    if has_glob_meta(pattern) {
        let mut base = PathBuf::new();
        for comp in Path::new(pattern).components() {
            let s = comp.as_os_str().to_string_lossy();
            if has_glob_meta(&s) {
                break;
            }
            base.push(comp.as_os_str());
        }
        if base.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            base
        }
    } else {
        Path::new(pattern)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Always-quoted single-quote form, embedded quotes escaped as `'\''`.
/// Used where the quoting must be unconditional, e.g. sudo passwords.
pub fn single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Expands a local glob; zero matches is an error.
pub fn local_glob(pattern: &str) -> ExecResult<Vec<PathBuf>> {
    if !has_glob_meta(pattern) {
        let p = PathBuf::from(pattern);
        if p.exists() {
            return Ok(vec![p]);
        }
        return Err(ExecError::NoMatch(pattern.to_string()));
    }
    let paths = glob::glob(pattern)
        .map_err(|e| ExecError::Pattern {
            pattern: pattern.to_string(),
            detail: e.to_string(),
        })?
        .filter_map(|p| p.ok())
        .filter(|p| p.is_file())
        .collect::<Vec<_>>();
    if paths.is_empty() {
        return Err(ExecError::NoMatch(pattern.to_string()));
    }
    Ok(paths)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileMeta {
    pub size: u64,
    pub mtime: SystemTime,
    pub mode: u32,
    pub is_dir: bool,
}

impl FileMeta {
    pub fn of(md: &Metadata) -> FileMeta {
        FileMeta {
            size: md.len(),
            mtime: md.modified().unwrap_or(UNIX_EPOCH),
            mode: md.permissions().mode() & 0o7777,
            is_dir: md.is_dir(),
        }
    }

    pub fn mtime_secs(&self) -> u64 {
        self.mtime
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Metadata of a local path, `None` when it does not exist.
pub fn local_meta(path: &Path) -> ExecResult<Option<FileMeta>> {
    match std::fs::metadata(path) {
        Ok(md) => Ok(Some(FileMeta::of(&md))),
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Modification times within one second of each other count as equal;
/// SFTP carries whole seconds only.
pub fn mtimes_close(a: SystemTime, b: SystemTime) -> bool {
    let diff = match a.duration_since(b) {
        Ok(d) => d,
        Err(e) => e.duration(),
    };
    diff <= Duration::from_secs(1)
}

/// Skip rule shared by upload/download/sync: an existing destination
/// matching in size and mtime (and mode, when known) needs no copy.
pub fn unchanged(src: &FileMeta, dst: Option<&FileMeta>, check_mode: bool) -> bool {
    match dst {
        Some(dst) => {
            src.size == dst.size
                && mtimes_close(src.mtime, dst.mtime)
                && (!check_mode || src.mode == dst.mode)
        }
        None => false,
    }
}

/// Sets atime+mtime of a local file, whole-microsecond precision.
pub fn set_file_times(path: &Path, mtime: SystemTime) -> ExecResult<()> {
    let since = mtime
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    let tv = libc::timeval {
        tv_sec: since.as_secs() as libc::time_t,
        tv_usec: since.subsec_micros() as libc::suseconds_t,
    };
    let times = [tv, tv];
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| ExecError::transfer(format!("path {:?} contains NUL", path)))?;
    let rc = unsafe { libc::utimes(cpath.as_ptr(), times.as_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Random suffix for per-invocation temp directories.
pub fn random_suffix(len: usize) -> String {
    use rand::distributions::Alphanumeric;
    use rand::{thread_rng, Rng};
    thread_rng().sample_iter(&Alphanumeric).take(len).collect()
}
