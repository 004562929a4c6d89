pub mod dry;
pub mod local;
pub mod remote;

use crate::{CancelToken, ExecResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOpts {
    pub verbose: bool,
}

impl RunOpts {
    pub fn verbose(v: bool) -> RunOpts {
        RunOpts { verbose: v }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CopyOpts {
    pub mkdir: bool,
    pub force: bool,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOpts {
    pub delete: bool,
    pub force: bool,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOpts {
    pub recursive: bool,
    pub exclude: Vec<String>,
}

/// Uniform capability set over a target host. One executor is owned by
/// exactly one worker; implementations are not required to be
/// thread-safe.
pub trait Executor: Send {
    fn host_addr(&self) -> &str;

    fn host_name(&self) -> &str;

    /// Runs `cmd` under a shell on the target. Stdout is streamed to the
    /// Out writer and captured; stderr goes to the Err writer. Returns
    /// the non-empty stdout lines.
    fn run(&mut self, cancel: &CancelToken, cmd: &str, opts: &RunOpts) -> ExecResult<Vec<String>>;

    /// Push: expands `src` as a local glob and copies matches to `dst`.
    fn upload(
        &mut self,
        cancel: &CancelToken,
        src: &str,
        dst: &str,
        opts: &CopyOpts,
    ) -> ExecResult<()>;

    /// Pull: expands `src` on the target and copies matches to the local
    /// `dst`.
    fn download(
        &mut self,
        cancel: &CancelToken,
        src: &str,
        dst: &str,
        opts: &CopyOpts,
    ) -> ExecResult<()>;

    /// Recursive mirror of a local directory to the target. Returns the
    /// sorted list of relative paths that were created or updated.
    fn sync(
        &mut self,
        cancel: &CancelToken,
        src: &str,
        dst: &str,
        opts: &SyncOpts,
    ) -> ExecResult<Vec<String>>;

    fn delete(&mut self, cancel: &CancelToken, path: &str, opts: &DeleteOpts) -> ExecResult<()>;

    fn close(&mut self) -> ExecResult<()>;

    fn set_secrets(&mut self, secrets: &[String]);
}
