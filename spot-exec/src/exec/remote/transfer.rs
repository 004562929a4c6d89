//! SFTP file operations for the remote executor: stat-based skip rules,
//! glob expansion on the remote side, recursive sync and exclude-aware
//! delete.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use spot_log::HostLog;
use ssh2::{ErrorCode, FileStat, OpenFlags, OpenType, Sftp};

use crate::exec::{CopyOpts, DeleteOpts, SyncOpts};
use crate::utils::{self, FileMeta};
use crate::{CancelToken, ExecError, ExecResult};

const COPY_CHUNK: usize = 32 * 1024;

// sftp status code for a missing path
const SFTP_NO_SUCH_FILE: i32 = 2;

pub fn remote_stat(sftp: &Sftp, path: &Path) -> ExecResult<Option<FileStat>> {
    match sftp.stat(path) {
        Ok(st) => Ok(Some(st)),
        Err(e) => match e.code() {
            ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => Ok(None),
            _ => Err(e.into()),
        },
    }
}

pub fn meta_of_stat(st: &FileStat) -> FileMeta {
    FileMeta {
        size: st.size.unwrap_or(0),
        mtime: UNIX_EPOCH + std::time::Duration::from_secs(st.mtime.unwrap_or(0)),
        mode: st.perm.unwrap_or(0) & 0o7777,
        is_dir: st.is_dir(),
    }
}

fn times_of(meta: &FileMeta) -> FileStat {
    FileStat {
        size: None,
        uid: None,
        gid: None,
        perm: Some(meta.mode),
        atime: Some(meta.mtime_secs()),
        mtime: Some(meta.mtime_secs()),
    }
}

/// Creates the directory chain for `dir`, tolerating already existing
/// components.
pub fn mkdir_all(sftp: &Sftp, dir: &Path) -> ExecResult<()> {
    let mut cur = PathBuf::new();
    for comp in dir.components() {
        cur.push(comp.as_os_str());
        if cur.as_os_str().is_empty() || cur == Path::new("/") {
            continue;
        }
        match remote_stat(sftp, &cur)? {
            Some(_) => continue,
            None => sftp.mkdir(&cur, 0o755).map_err(|e| {
                ExecError::transfer(format!("mkdir {:?}: {}", cur, e))
            })?,
        }
    }
    Ok(())
}

/// Expands a glob on the remote side: the pattern's parent directory is
/// listed and basenames are matched. Zero matches is an error.
pub fn remote_glob(sftp: &Sftp, pattern: &str) -> ExecResult<Vec<(PathBuf, FileStat)>> {
    if !utils::has_glob_meta(pattern) {
        let p = PathBuf::from(pattern);
        return match remote_stat(sftp, &p)? {
            Some(st) => Ok(vec![(p, st)]),
            None => Err(ExecError::NoMatch(pattern.to_string())),
        };
    }

    let pat = glob::Pattern::new(pattern).map_err(|e| ExecError::Pattern {
        pattern: pattern.to_string(),
        detail: e.to_string(),
    })?;
    let parent = Path::new(pattern)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let entries = sftp
        .readdir(&parent)
        .map_err(|e| ExecError::transfer(format!("readdir {:?}: {}", parent, e)))?;
    let matched: Vec<(PathBuf, FileStat)> = entries
        .into_iter()
        .filter(|(p, st)| !st.is_dir() && pat.matches_path(p))
        .collect();
    if matched.is_empty() {
        return Err(ExecError::NoMatch(pattern.to_string()));
    }
    Ok(matched)
}

pub fn upload_file(
    cancel: &CancelToken,
    sftp: &Sftp,
    log: &HostLog,
    src: &Path,
    dst: &Path,
    opts: &CopyOpts,
) -> ExecResult<()> {
    let src_meta = utils::local_meta(src)?
        .ok_or_else(|| ExecError::transfer(format!("source {:?} vanished", src)))?;
    let dst_meta = remote_stat(sftp, dst)?.map(|st| meta_of_stat(&st));
    if !opts.force && utils::unchanged(&src_meta, dst_meta.as_ref(), true) {
        log::debug!("skip upload {:?} to {:?}, unchanged", src, dst);
        return Ok(());
    }

    if opts.mkdir {
        if let Some(parent) = dst.parent() {
            if !parent.as_os_str().is_empty() {
                mkdir_all(sftp, parent)?;
            }
        }
    }

    let mut reader = fs::File::open(src)?;
    let mut remote = sftp
        .open_mode(
            dst,
            OpenFlags::WRITE | OpenFlags::TRUNCATE | OpenFlags::CREATE,
            src_meta.mode as i32,
            OpenType::File,
        )
        .map_err(|e| ExecError::transfer(format!("create {:?}: {}", dst, e)))?;

    let mut buf = [0u8; COPY_CHUNK];
    loop {
        cancel.check()?;
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        remote
            .write_all(&buf[..n])
            .map_err(|e| ExecError::transfer(format!("write {:?}: {}", dst, e)))?;
    }
    drop(remote);

    sftp.setstat(dst, times_of(&src_meta))
        .map_err(|e| ExecError::transfer(format!("setstat {:?}: {}", dst, e)))?;
    log.info(&format!("uploaded {} to {}", src.display(), dst.display()));
    Ok(())
}

pub fn download_file(
    cancel: &CancelToken,
    sftp: &Sftp,
    log: &HostLog,
    src: &Path,
    stat: &FileStat,
    dst: &Path,
    opts: &CopyOpts,
) -> ExecResult<()> {
    let src_meta = meta_of_stat(stat);
    let dst_meta = utils::local_meta(dst)?;
    if !opts.force && utils::unchanged(&src_meta, dst_meta.as_ref(), false) {
        log::debug!("skip download {:?} to {:?}, unchanged", src, dst);
        return Ok(());
    }

    if opts.mkdir {
        if let Some(parent) = dst.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
    }

    let mut remote = sftp
        .open(src)
        .map_err(|e| ExecError::transfer(format!("open {:?}: {}", src, e)))?;
    let mut writer = fs::File::create(dst)?;
    let mut buf = [0u8; COPY_CHUNK];
    loop {
        cancel.check()?;
        let n = remote
            .read(&mut buf)
            .map_err(|e| ExecError::transfer(format!("read {:?}: {}", src, e)))?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
    }
    writer.flush()?;
    drop(writer);

    if src_meta.mode != 0 {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dst, fs::Permissions::from_mode(src_meta.mode))?;
    }
    utils::set_file_times(dst, src_meta.mtime)?;
    log.info(&format!("downloaded {} to {}", src.display(), dst.display()));
    Ok(())
}

fn walk_remote(
    sftp: &Sftp,
    root: &Path,
    excludes: &[glob::Pattern],
) -> ExecResult<(BTreeMap<PathBuf, FileMeta>, Vec<PathBuf>)> {
    let mut files = BTreeMap::new();
    let mut dirs = Vec::new();
    if remote_stat(sftp, root)?.is_none() {
        return Ok((files, dirs));
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = sftp
            .readdir(&dir)
            .map_err(|e| ExecError::transfer(format!("readdir {:?}: {}", dir, e)))?;
        for (path, st) in entries {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| ExecError::transfer(e.to_string()))?
                .to_path_buf();
            if utils::is_excluded(&rel, excludes) {
                continue;
            }
            if st.is_dir() {
                dirs.push(rel);
                stack.push(path);
            } else {
                files.insert(rel, meta_of_stat(&st));
            }
        }
    }
    Ok((files, dirs))
}

/// Mirror of a local tree onto the remote host; returns sorted relative
/// paths of everything uploaded or updated.
pub fn sync_dirs(
    cancel: &CancelToken,
    sftp: &Sftp,
    log: &HostLog,
    src: &Path,
    dst: &Path,
    opts: &SyncOpts,
) -> ExecResult<Vec<String>> {
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
        let meta =
            FileMeta::of(&entry.metadata().map_err(|e| ExecError::transfer(e.to_string()))?);
        if meta.is_dir {
            src_dirs.push(rel);
        } else {
            src_files.insert(rel, meta);
        }
    }

    let (dst_files, mut dst_dirs) = walk_remote(sftp, dst, &excludes)?;
    mkdir_all(sftp, dst)?;
    for rel in &src_dirs {
        if !dst_dirs.contains(rel) {
            mkdir_all(sftp, &dst.join(rel))?;
        }
    }

    let mut changed = Vec::new();
    let copy_opts = CopyOpts {
        mkdir: true,
        force: true,
        exclude: Vec::new(),
    };
    for (rel, meta) in &src_files {
        cancel.check()?;
        if opts.force || !utils::unchanged(meta, dst_files.get(rel), false) {
            upload_file(cancel, sftp, log, &src.join(rel), &dst.join(rel), &copy_opts)?;
            changed.push(rel.to_string_lossy().into_owned());
        }
    }

    if opts.delete {
        for rel in dst_files.keys() {
            cancel.check()?;
            if !src_files.contains_key(rel) {
                sftp.unlink(&dst.join(rel))
                    .map_err(|e| ExecError::Delete(format!("unlink {:?}: {}", rel, e)))?;
                log.info(&format!("deleted {}", rel.display()));
            }
        }
        dst_dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        for rel in &dst_dirs {
            if !src_dirs.contains(rel) {
                delete_path(
                    cancel,
                    sftp,
                    log,
                    &dst.join(rel),
                    &DeleteOpts {
                        recursive: true,
                        exclude: Vec::new(),
                    },
                )?;
            }
        }
    }

    changed.sort();
    Ok(changed)
}

/// Exclude-aware remote delete, depth-first.
pub fn delete_path(
    cancel: &CancelToken,
    sftp: &Sftp,
    log: &HostLog,
    path: &Path,
    opts: &DeleteOpts,
) -> ExecResult<()> {
    let stat = match remote_stat(sftp, path)? {
        Some(st) => st,
        None => return Ok(()),
    };

    if !stat.is_dir() {
        sftp.unlink(path)
            .map_err(|e| ExecError::Delete(format!("unlink {:?}: {}", path, e)))?;
        log.info(&format!("deleted {}", path.display()));
        return Ok(());
    }

    if !opts.recursive {
        sftp.rmdir(path)
            .map_err(|e| ExecError::Delete(format!("rmdir {:?}: {}", path, e)))?;
        log.info(&format!("deleted {}", path.display()));
        return Ok(());
    }

    let excludes = utils::compile_excludes(&opts.exclude)?;
    let (files, mut dirs) = walk_remote(sftp, path, &[])?;

    let mut excluded_rels: Vec<PathBuf> = Vec::new();
    for rel in files.keys().chain(dirs.iter()) {
        if utils::is_excluded(rel, &excludes) {
            excluded_rels.push(rel.clone());
        }
    }

    for rel in files.keys() {
        cancel.check()?;
        if utils::is_excluded(rel, &excludes) {
            continue;
        }
        sftp.unlink(&path.join(rel))
            .map_err(|e| ExecError::Delete(format!("unlink {:?}: {}", rel, e)))?;
    }

    dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for rel in &dirs {
        cancel.check()?;
        if utils::is_excluded(rel, &excludes) || utils::shields_excluded(rel, &excluded_rels) {
            continue;
        }
        sftp.rmdir(&path.join(rel))
            .map_err(|e| ExecError::Delete(format!("rmdir {:?}: {}", rel, e)))?;
    }

    if excluded_rels.is_empty() {
        sftp.rmdir(path)
            .map_err(|e| ExecError::Delete(format!("rmdir {:?}: {}", path, e)))?;
    }
    log.info(&format!("deleted {}", path.display()));
    Ok(())
}
