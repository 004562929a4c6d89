use std::collections::HashMap;
use std::fs;

use spot_log::HostLog;

use super::{CopyOpts, DeleteOpts, Executor, RunOpts, SyncOpts};
use crate::{CancelToken, ExecResult, SCRIPT_MARKER};

/// Side-effect-free executor: every operation only reports what would
/// happen. The one exception is staged scripts, whose local content is
/// echoed through the Out writer so the operator can audit what would
/// run on the host.
pub struct Dry {
    host_addr: String,
    host_name: String,
    log: HostLog,
    // dst -> local src of "uploaded" files, consulted by run
    staged: HashMap<String, String>,
}

impl Dry {
    pub fn new(log: &HostLog, host_addr: &str, host_name: &str) -> Dry {
        Dry {
            host_addr: host_addr.to_string(),
            host_name: host_name.to_string(),
            log: log.with_host(host_addr, host_name),
            staged: HashMap::new(),
        }
    }
}

impl Executor for Dry {
    fn host_addr(&self) -> &str {
        &self.host_addr
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }

    fn run(&mut self, cancel: &CancelToken, cmd: &str, _opts: &RunOpts) -> ExecResult<Vec<String>> {
        cancel.check()?;
        self.log.info(&format!("run: {}", cmd));

        if cmd.contains(SCRIPT_MARKER) {
            // audit staged script content instead of executing it
            for (dst, src) in &self.staged {
                if cmd.contains(dst.as_str()) {
                    let body = fs::read_to_string(src)?;
                    let mut lines = Vec::new();
                    for line in body.lines() {
                        self.log.out(line);
                        if !line.is_empty() {
                            lines.push(line.to_string());
                        }
                    }
                    return Ok(lines);
                }
            }
        }
        Ok(Vec::new())
    }

    fn upload(
        &mut self,
        cancel: &CancelToken,
        src: &str,
        dst: &str,
        opts: &CopyOpts,
    ) -> ExecResult<()> {
        cancel.check()?;
        self.log.info(&format!(
            "upload: {} to {}, mkdir={}, force={}",
            src, dst, opts.mkdir, opts.force
        ));
        if dst.contains(SCRIPT_MARKER) {
            self.staged.insert(dst.to_string(), src.to_string());
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
        cancel.check()?;
        self.log.info(&format!(
            "download: {} to {}, mkdir={}, force={}",
            src, dst, opts.mkdir, opts.force
        ));
        Ok(())
    }

    fn sync(
        &mut self,
        cancel: &CancelToken,
        src: &str,
        dst: &str,
        opts: &SyncOpts,
    ) -> ExecResult<Vec<String>> {
        cancel.check()?;
        self.log.info(&format!(
            "sync: {} to {}, delete={}",
            src, dst, opts.delete
        ));
        Ok(Vec::new())
    }

    fn delete(&mut self, cancel: &CancelToken, path: &str, opts: &DeleteOpts) -> ExecResult<()> {
        cancel.check()?;
        self.log.info(&format!(
            "delete: {}, recursive={}",
            path, opts.recursive
        ));
        Ok(())
    }

    fn close(&mut self) -> ExecResult<()> {
        Ok(())
    }

    fn set_secrets(&mut self, secrets: &[String]) {
        self.log.set_secrets(secrets);
    }
}
