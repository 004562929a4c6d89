mod transfer;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::thread;
use std::time::Duration;

use spot_log::HostLog;
use ssh2::Session;

use super::{CopyOpts, DeleteOpts, Executor, RunOpts, SyncOpts};
use crate::utils;
use crate::{CancelToken, ExecError, ExecResult};

const IDLE_TICK: Duration = Duration::from_millis(30);

/// SSH-backed executor bound to a single host. Owned by exactly one
/// worker; the underlying session is not thread-safe.
pub struct Remote {
    session: Session,
    sftp: Option<ssh2::Sftp>,
    host_addr: String,
    host_name: String,
    log: HostLog,
    // proxy transport process, reaped on close
    proxy: Option<Child>,
}

impl Remote {
    pub(crate) fn new(
        session: Session,
        host_addr: &str,
        host_name: &str,
        log: HostLog,
        proxy: Option<Child>,
    ) -> Remote {
        Remote {
            session,
            sftp: None,
            host_addr: host_addr.to_string(),
            host_name: host_name.to_string(),
            log,
            proxy,
        }
    }

    fn sftp(&mut self) -> ExecResult<&ssh2::Sftp> {
        if self.sftp.is_none() {
            self.sftp = Some(self.session.sftp()?);
        }
        Ok(self.sftp.as_ref().expect("sftp just initialised"))
    }

    /// Interleaves stdout/stderr reads on a non-blocking session until
    /// the channel reaches EOF, streaming complete lines to the host
    /// writers as they arrive.
    fn stream_channel(
        &self,
        cancel: &CancelToken,
        channel: &mut ssh2::Channel,
    ) -> ExecResult<Vec<String>> {
        let mut collected = Vec::new();
        let mut out_buf = LineBuf::default();
        let mut err_buf = LineBuf::default();
        let mut chunk = [0u8; 8192];

        loop {
            cancel.check()?;
            let mut progressed = false;
            let mut out_eof = false;

            match channel.read(&mut chunk) {
                Ok(0) => out_eof = true,
                Ok(n) => {
                    progressed = true;
                    out_buf.push(&chunk[..n], |line| {
                        self.log.out(line);
                        if !line.is_empty() {
                            collected.push(line.to_string());
                        }
                    });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }

            let mut err_eof = false;
            match channel.stderr().read(&mut chunk) {
                Ok(0) => err_eof = true,
                Ok(n) => {
                    progressed = true;
                    err_buf.push(&chunk[..n], |line| self.log.err(line));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }

            if out_eof && err_eof && channel.eof() {
                break;
            }
            if !progressed {
                thread::sleep(IDLE_TICK);
            }
        }

        out_buf.flush(|line| {
            self.log.out(line);
            if !line.is_empty() {
                collected.push(line.to_string());
            }
        });
        err_buf.flush(|line| self.log.err(line));
        Ok(collected)
    }
}

impl Executor for Remote {
    fn host_addr(&self) -> &str {
        &self.host_addr
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }

    fn run(&mut self, cancel: &CancelToken, cmd: &str, opts: &RunOpts) -> ExecResult<Vec<String>> {
        cancel.check()?;
        if opts.verbose {
            self.log.info(&format!("$ {}", cmd));
        } else {
            log::debug!("[{}] $ {}", self.host_addr, cmd);
        }

        let mut channel = self.session.channel_session()?;
        channel.exec(cmd)?;

        self.session.set_blocking(false);
        let streamed = self.stream_channel(cancel, &mut channel);
        self.session.set_blocking(true);

        let lines = match streamed {
            Ok(lines) => lines,
            Err(e) => {
                // terminates the remote command together with the channel
                let _ = channel.close();
                return Err(e);
            }
        };

        channel.close()?;
        channel.wait_close()?;
        let code = channel.exit_status()?;
        if code != 0 {
            return Err(ExecError::Exit { code });
        }
        Ok(lines)
    }

    fn upload(
        &mut self,
        cancel: &CancelToken,
        src: &str,
        dst: &str,
        opts: &CopyOpts,
    ) -> ExecResult<()> {
        let matches = utils::local_glob(src)?;
        let excludes = utils::compile_excludes(&opts.exclude)?;
        let base = utils::glob_base(src);
        // a trailing slash forces directory semantics even for one match
        let multi = matches.len() > 1 || dst.ends_with('/');
        let dst = dst.trim_end_matches('/');

        let log = self.log.clone();
        let sftp = self.sftp()?;
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
            transfer::upload_file(cancel, sftp, &log, &m, &dst_path, opts)?;
        }
        Ok(())
    }

    fn download(
        &mut self,
        cancel: &CancelToken,
        src: &str,
        dst: &str,
        opts: &CopyOpts,
    ) -> ExecResult<()> {
        let log = self.log.clone();
        let sftp = self.sftp()?;
        let matches = transfer::remote_glob(sftp, src)?;
        let expanded = utils::has_glob_meta(src) || matches.len() > 1;
        let excludes = utils::compile_excludes(&opts.exclude)?;

        for (path, stat) in matches {
            cancel.check()?;
            let name = path
                .file_name()
                .ok_or_else(|| ExecError::transfer(format!("no file name in {:?}", path)))?;
            if utils::is_excluded(Path::new(name), &excludes) {
                continue;
            }
            let dst_path = if expanded {
                Path::new(dst).join(name)
            } else {
                PathBuf::from(dst)
            };
            transfer::download_file(cancel, sftp, &log, &path, &stat, &dst_path, opts)?;
        }
        Ok(())
    }

    fn sync(
        &mut self,
        cancel: &CancelToken,
        src: &str,
        dst: &str,
        opts: &SyncOpts,
    ) -> ExecResult<Vec<String>> {
        let log = self.log.clone();
        let sftp = self.sftp()?;
        transfer::sync_dirs(cancel, sftp, &log, Path::new(src), Path::new(dst), opts)
    }

    fn delete(&mut self, cancel: &CancelToken, path: &str, opts: &DeleteOpts) -> ExecResult<()> {
        let log = self.log.clone();
        let sftp = self.sftp()?;
        transfer::delete_path(cancel, sftp, &log, Path::new(path), opts)
    }

    fn close(&mut self) -> ExecResult<()> {
        self.sftp = None;
        let _ = self
            .session
            .disconnect(None, "closing", None)
            .map_err(|e| log::warn!("[{}] disconnect failed: {}", self.host_addr, e));
        if let Some(mut proxy) = self.proxy.take() {
            let _ = proxy.kill();
            let _ = proxy.wait();
        }
        Ok(())
    }

    fn set_secrets(&mut self, secrets: &[String]) {
        self.log.set_secrets(secrets);
    }
}

impl Drop for Remote {
    fn drop(&mut self) {
        if let Some(mut proxy) = self.proxy.take() {
            let _ = proxy.kill();
            let _ = proxy.wait();
        }
    }
}

/// Splits a byte stream into complete lines, tolerating chunk borders in
/// the middle of a line.
#[derive(Default)]
struct LineBuf {
    buf: Vec<u8>,
}

impl LineBuf {
    fn push<F: FnMut(&str)>(&mut self, data: &[u8], mut f: F) {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let s = String::from_utf8_lossy(&line);
            f(s.trim_end_matches(['\n', '\r'].as_ref()));
        }
    }

    fn flush<F: FnMut(&str)>(&mut self, mut f: F) {
        if !self.buf.is_empty() {
            let s = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            f(s.trim_end_matches(['\n', '\r'].as_ref()));
        }
    }
}
