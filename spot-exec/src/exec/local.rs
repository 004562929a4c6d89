use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use os_pipe::pipe;
use shared_child::SharedChild;
use spot_log::{HostLog, StreamKind};

use super::{CopyOpts, DeleteOpts, Executor, RunOpts, SyncOpts};
use crate::utils::{self, FileMeta};
use crate::{CancelToken, ExecError, ExecResult};

pub const LOCAL_HOST: &str = "localhost";

const COPY_CHUNK: usize = 32 * 1024;
const POLL_TICK: Duration = Duration::from_millis(50);

/// Executor operating on the local machine: commands through the local
/// shell, file operations straight on the filesystem.
pub struct Local {
    log: HostLog,
    shell: String,
}

impl Local {
    /// `shell` is the operator's `$SHELL` preference threaded through
    /// configuration; `/bin/sh` otherwise.
    pub fn new(log: &HostLog, shell: Option<String>) -> Local {
        Local {
            log: log.with_host(LOCAL_HOST, ""),
            shell: shell.unwrap_or_else(|| "/bin/sh".to_string()),
        }
    }
}

impl Executor for Local {
    fn host_addr(&self) -> &str {
        LOCAL_HOST
    }

    fn host_name(&self) -> &str {
        LOCAL_HOST
    }

    fn run(&mut self, cancel: &CancelToken, cmd: &str, opts: &RunOpts) -> ExecResult<Vec<String>> {
        cancel.check()?;
        // avoid double shelling when the caller already wrapped the
        // command as `sh -c '...'`
        let cmd = utils::dequote_sh(cmd).unwrap_or_else(|| cmd.to_string());
        if opts.verbose {
            self.log.info(&format!("$ {}", cmd));
        } else {
            log::debug!("[{}] $ {}", LOCAL_HOST, cmd);
        }

        let (out_reader, out_writer) = pipe()?;
        let (err_reader, err_writer) = pipe()?;
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .stdout(out_writer)
            .stderr(err_writer);

        let child = SharedChild::spawn(&mut command)?;
        // drop the command to close our copies of the pipe writers,
        // readers would never see EOF otherwise
        drop(command);

        let out_log = self.log.clone();
        let out_handle = thread::spawn(move || consume_lines(out_reader, &out_log, StreamKind::Out));
        let err_log = self.log.clone();
        let err_handle = thread::spawn(move || consume_lines(err_reader, &err_log, StreamKind::Err));

        let status = loop {
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                let _ = out_handle.join();
                let _ = err_handle.join();
                return Err(ExecError::Cancelled);
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(POLL_TICK),
            }
        };

        let lines = out_handle.join().unwrap_or_default();
        let _ = err_handle.join();

        match status.code() {
            Some(0) => Ok(lines),
            Some(code) => Err(ExecError::Exit { code }),
            None => Err(ExecError::Exit { code: -1 }),
        }
    }

    fn upload(
        &mut self,
        cancel: &CancelToken,
        src: &str,
        dst: &str,
        opts: &CopyOpts,
    ) -> ExecResult<()> {
        copy_matches(cancel, src, dst, opts, &self.log)
    }

    fn download(
        &mut self,
        cancel: &CancelToken,
        src: &str,
        dst: &str,
        opts: &CopyOpts,
    ) -> ExecResult<()> {
        // pull and push collapse to the same local copy
        copy_matches(cancel, src, dst, opts, &self.log)
    }

    fn sync(
        &mut self,
        cancel: &CancelToken,
        src: &str,
        dst: &str,
        opts: &SyncOpts,
    ) -> ExecResult<Vec<String>> {
        sync_dirs(cancel, Path::new(src), Path::new(dst), opts, &self.log)
    }

    fn delete(&mut self, cancel: &CancelToken, path: &str, opts: &DeleteOpts) -> ExecResult<()> {
        delete_path(cancel, Path::new(path), opts, &self.log)
    }

    fn close(&mut self) -> ExecResult<()> {
        Ok(())
    }

    fn set_secrets(&mut self, secrets: &[String]) {
        self.log.set_secrets(secrets);
    }
}

fn consume_lines<R: Read>(reader: R, log: &HostLog, kind: StreamKind) -> Vec<String> {
    let mut collected = Vec::new();
    for line in BufReader::new(reader).lines() {
        match line {
            Ok(line) => {
                log.write(kind, &line);
                if kind == StreamKind::Out && !line.is_empty() {
                    collected.push(line);
                }
            }
            // keep draining so the child never blocks on a full pipe
            Err(err) => log.write(kind, &format!("read error: {}", err)),
        }
    }
    collected
}

/// Glob-expanding copy shared by local upload and download.
pub(crate) fn copy_matches(
    cancel: &CancelToken,
    src: &str,
    dst: &str,
    opts: &CopyOpts,
    log: &HostLog,
) -> ExecResult<()> {
    let matches = utils::local_glob(src)?;
    let excludes = utils::compile_excludes(&opts.exclude)?;
    let base = utils::glob_base(src);
    // a trailing slash forces directory semantics even for one match
    let multi = matches.len() > 1 || dst.ends_with('/');
    let dst = dst.trim_end_matches('/');
    for m in matches {
        cancel.check()?;
        let rel = m.strip_prefix(&base).unwrap_or(&m);
        if utils::is_excluded(rel, &excludes) {
            continue;
        }
        let dst_path = if multi {
            let name = m
                .file_name()
                .ok_or_else(|| ExecError::transfer(format!("no file name in {:?}", m)))?;
            Path::new(dst).join(name)
        } else {
            PathBuf::from(dst)
        };
        copy_file(cancel, &m, &dst_path, opts, log)?;
    }
    Ok(())
}

fn copy_file(
    cancel: &CancelToken,
    src: &Path,
    dst: &Path,
    opts: &CopyOpts,
    log: &HostLog,
) -> ExecResult<()> {
    let src_meta = utils::local_meta(src)?
        .ok_or_else(|| ExecError::transfer(format!("source {:?} vanished", src)))?;
    let dst_meta = utils::local_meta(dst)?;
    if !opts.force && utils::unchanged(&src_meta, dst_meta.as_ref(), true) {
        log::debug!("skip copy {:?} to {:?}, unchanged", src, dst);
        return Ok(());
    }

    if let Some(parent) = dst.parent() {
        if opts.mkdir && !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut reader = fs::File::open(src)?;
    let mut writer = fs::File::create(dst)?;
    let mut buf = [0u8; COPY_CHUNK];
    loop {
        cancel.check()?;
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
    }
    writer.flush()?;
    drop(writer);

    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dst, fs::Permissions::from_mode(src_meta.mode))?;
    utils::set_file_times(dst, src_meta.mtime)?;
    log.info(&format!("copied {} to {}", src.display(), dst.display()));
    Ok(())
}

/// Recursive directory mirror; see the executor trait for the contract.
pub(crate) fn sync_dirs(
    cancel: &CancelToken,
    src: &Path,
    dst: &Path,
    opts: &SyncOpts,
    log: &HostLog,
) -> ExecResult<Vec<String>> {
    use std::collections::BTreeMap;

    let excludes = utils::compile_excludes(&opts.exclude)?;

    let mut src_files: BTreeMap<PathBuf, FileMeta> = BTreeMap::new();
    let mut src_dirs: Vec<PathBuf> = Vec::new();
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| ExecError::transfer(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| ExecError::transfer(e.to_string()))?
            .to_path_buf();
        if utils::is_excluded(&rel, &excludes) {
            continue;
        }
        let meta = FileMeta::of(&entry.metadata().map_err(|e| ExecError::transfer(e.to_string()))?);
        if meta.is_dir {
            src_dirs.push(rel);
        } else {
            src_files.insert(rel, meta);
        }
    }

    let mut dst_files: BTreeMap<PathBuf, FileMeta> = BTreeMap::new();
    let mut dst_dirs: Vec<PathBuf> = Vec::new();
    if dst.exists() {
        for entry in walkdir::WalkDir::new(dst).min_depth(1) {
            let entry = entry.map_err(|e| ExecError::transfer(e.to_string()))?;
            let rel = entry
                .path()
                .strip_prefix(dst)
                .map_err(|e| ExecError::transfer(e.to_string()))?
                .to_path_buf();
            if utils::is_excluded(&rel, &excludes) {
                continue;
            }
            let meta =
                FileMeta::of(&entry.metadata().map_err(|e| ExecError::transfer(e.to_string()))?);
            if meta.is_dir {
                dst_dirs.push(rel);
            } else {
                dst_files.insert(rel, meta);
            }
        }
    } else {
        fs::create_dir_all(dst)?;
    }

    for rel in &src_dirs {
        fs::create_dir_all(dst.join(rel))?;
    }

    let mut changed = Vec::new();
    for (rel, meta) in &src_files {
        cancel.check()?;
        if opts.force || !utils::unchanged(meta, dst_files.get(rel), false) {
            let copy_opts = CopyOpts {
                mkdir: true,
                force: true,
                exclude: Vec::new(),
            };
            copy_file(cancel, &src.join(rel), &dst.join(rel), &copy_opts, log)?;
            changed.push(rel.to_string_lossy().into_owned());
        }
    }

    if opts.delete {
        for rel in dst_files.keys() {
            cancel.check()?;
            if !src_files.contains_key(rel) {
                match fs::remove_file(dst.join(rel)) {
                    Ok(()) => log.info(&format!("deleted {}", rel.display())),
                    Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        // deepest first so parents empty out before their own removal
        dst_dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        for rel in &dst_dirs {
            if !src_dirs.contains(rel) {
                match fs::remove_dir_all(dst.join(rel)) {
                    Ok(()) => log.info(&format!("deleted {}", rel.display())),
                    Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    changed.sort();
    Ok(changed)
}

/// Exclude-aware delete; see the executor trait for the contract.
pub(crate) fn delete_path(
    cancel: &CancelToken,
    path: &Path,
    opts: &DeleteOpts,
    log: &HostLog,
) -> ExecResult<()> {
    let meta = match utils::local_meta(path)? {
        Some(m) => m,
        None => return Ok(()),
    };

    if !meta.is_dir {
        fs::remove_file(path)?;
        log.info(&format!("deleted {}", path.display()));
        return Ok(());
    }

    if !opts.recursive {
        fs::remove_dir(path).map_err(|e| {
            ExecError::Delete(format!("cannot remove directory {}: {}", path.display(), e))
        })?;
        log.info(&format!("deleted {}", path.display()));
        return Ok(());
    }

    if opts.exclude.is_empty() {
        fs::remove_dir_all(path)?;
        log.info(&format!("deleted {}", path.display()));
        return Ok(());
    }

    let excludes = utils::compile_excludes(&opts.exclude)?;
    let mut excluded_rels: Vec<PathBuf> = Vec::new();
    for entry in walkdir::WalkDir::new(path).min_depth(1) {
        let entry = entry.map_err(|e| ExecError::Delete(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(path)
            .map_err(|e| ExecError::Delete(e.to_string()))?
            .to_path_buf();
        if utils::is_excluded(&rel, &excludes) {
            excluded_rels.push(rel);
        }
    }

    // children before parents
    for entry in walkdir::WalkDir::new(path).min_depth(1).contents_first(true) {
        cancel.check()?;
        let entry = entry.map_err(|e| ExecError::Delete(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(path)
            .map_err(|e| ExecError::Delete(e.to_string()))?
            .to_path_buf();
        if utils::is_excluded(&rel, &excludes) {
            continue;
        }
        if entry.file_type().is_dir() {
            if utils::shields_excluded(&rel, &excluded_rels) {
                continue;
            }
            fs::remove_dir(entry.path()).map_err(|e| ExecError::Delete(e.to_string()))?;
        } else {
            fs::remove_file(entry.path()).map_err(|e| ExecError::Delete(e.to_string()))?;
        }
    }

    if excluded_rels.is_empty() {
        fs::remove_dir(path).map_err(|e| ExecError::Delete(e.to_string()))?;
    }
    log.info(&format!("deleted {}", path.display()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn local() -> Local {
        Local::new(&HostLog::new(false), None)
    }

    #[test]
    fn run_captures_stdout_lines() {
        let mut ex = local();
        let lines = ex
            .run(&CancelToken::new(), "echo one; echo; echo two", &RunOpts::default())
            .unwrap();
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn run_reports_exit_code() {
        let mut ex = local();
        match ex.run(&CancelToken::new(), "exit 3", &RunOpts::default()) {
            Err(ExecError::Exit { code: 3 }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn run_dequotes_wrapped_command() {
        let mut ex = local();
        let lines = ex
            .run(&CancelToken::new(), "sh -c 'echo wrapped'", &RunOpts::default())
            .unwrap();
        assert_eq!(lines, vec!["wrapped"]);
    }

    #[test]
    fn run_cancelled_kills_child() {
        let mut ex = local();
        let cancel = CancelToken::new();
        let c = cancel.clone();
        let killer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            c.cancel();
        });
        let started = std::time::Instant::now();
        let res = ex.run(&cancel, "sleep 30", &RunOpts::default());
        killer.join().unwrap();
        assert!(matches!(res, Err(ExecError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn upload_skip_and_force() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, b"payload").unwrap();
        let dst = dir.path().join("out/a.txt");

        let mut ex = local();
        let opts = CopyOpts {
            mkdir: true,
            ..CopyOpts::default()
        };
        ex.upload(
            &CancelToken::new(),
            src.to_str().unwrap(),
            dst.to_str().unwrap(),
            &opts,
        )
        .unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"payload");

        // second copy with identical size+mtime+mode is a no-op: mtime
        // of the destination stays put even if we touch the source dir
        let before = fs::metadata(&dst).unwrap().modified().unwrap();
        ex.upload(
            &CancelToken::new(),
            src.to_str().unwrap(),
            dst.to_str().unwrap(),
            &opts,
        )
        .unwrap();
        assert_eq!(fs::metadata(&dst).unwrap().modified().unwrap(), before);
    }

    #[test]
    fn upload_multiple_matches_treats_dst_as_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("one.conf"), b"1").unwrap();
        fs::write(dir.path().join("two.conf"), b"2").unwrap();
        let out = dir.path().join("etc");

        let mut ex = local();
        ex.upload(
            &CancelToken::new(),
            &format!("{}/*.conf", dir.path().display()),
            out.to_str().unwrap(),
            &CopyOpts {
                mkdir: true,
                ..CopyOpts::default()
            },
        )
        .unwrap();
        assert!(out.join("one.conf").exists());
        assert!(out.join("two.conf").exists());
    }

    #[test]
    fn upload_missing_source_is_error() {
        let mut ex = local();
        let res = ex.upload(
            &CancelToken::new(),
            "/nonexistent/*.bin",
            "/tmp/whatever",
            &CopyOpts::default(),
        );
        assert!(matches!(res, Err(ExecError::NoMatch(_))));
    }

    #[test]
    fn sync_mirror_with_delete_and_exclude() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("site");
        fs::create_dir_all(src.join("assets")).unwrap();
        fs::create_dir_all(src.join(".git")).unwrap();
        fs::write(src.join("index.html"), b"<html>").unwrap();
        fs::write(src.join("assets/a.css"), b"body{}").unwrap();
        fs::write(src.join(".git/HEAD"), b"ref").unwrap();

        let dst = dir.path().join("remote");
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("old.html"), b"stale").unwrap();

        let mut ex = local();
        let changed = ex
            .sync(
                &CancelToken::new(),
                src.to_str().unwrap(),
                dst.to_str().unwrap(),
                &SyncOpts {
                    delete: true,
                    exclude: vec![".git/*".to_string(), ".git".to_string()],
                    ..SyncOpts::default()
                },
            )
            .unwrap();

        assert_eq!(changed, vec!["assets/a.css", "index.html"]);
        assert!(!dst.join("old.html").exists());
        assert!(!dst.join(".git").exists());

        // immediate second sync is a no-op
        let changed = ex
            .sync(
                &CancelToken::new(),
                src.to_str().unwrap(),
                dst.to_str().unwrap(),
                &SyncOpts {
                    delete: true,
                    exclude: vec![".git/*".to_string(), ".git".to_string()],
                    ..SyncOpts::default()
                },
            )
            .unwrap();
        assert!(changed.is_empty());
    }

    #[test]
    fn delete_file_dir_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("f");
        fs::write(&f, b"x").unwrap();

        let mut ex = local();
        ex.delete(&CancelToken::new(), f.to_str().unwrap(), &DeleteOpts::default())
            .unwrap();
        assert!(!f.exists());

        // missing path is not an error
        ex.delete(
            &CancelToken::new(),
            dir.path().join("gone").to_str().unwrap(),
            &DeleteOpts {
                recursive: true,
                ..DeleteOpts::default()
            },
        )
        .unwrap();

        // non-recursive delete of a non-empty dir fails
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("inner"), b"x").unwrap();
        assert!(ex
            .delete(&CancelToken::new(), sub.to_str().unwrap(), &DeleteOpts::default())
            .is_err());

        ex.delete(
            &CancelToken::new(),
            sub.to_str().unwrap(),
            &DeleteOpts {
                recursive: true,
                ..DeleteOpts::default()
            },
        )
        .unwrap();
        assert!(!sub.exists());
    }

    #[test]
    fn delete_recursive_preserves_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir_all(root.join("keep/deep")).unwrap();
        fs::create_dir_all(root.join("drop")).unwrap();
        fs::write(root.join("keep/deep/file.txt"), b"x").unwrap();
        fs::write(root.join("drop/file.txt"), b"x").unwrap();
        fs::write(root.join("top.txt"), b"x").unwrap();

        let mut ex = local();
        ex.delete(
            &CancelToken::new(),
            root.to_str().unwrap(),
            &DeleteOpts {
                recursive: true,
                exclude: vec!["keep/deep/*".to_string()],
            },
        )
        .unwrap();

        assert!(root.join("keep/deep/file.txt").exists());
        assert!(!root.join("drop").exists());
        assert!(!root.join("top.txt").exists());
        // the shielding parents survive
        assert!(root.join("keep/deep").exists());
    }
}
