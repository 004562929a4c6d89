use std::io::Write;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use spot_exec::utils as exec_utils;
use spot_exec::{
    CancelToken, CopyOpts, DeleteOpts, ExecError, Executor, RunOpts, SyncOpts, TMP_PREFIX,
};
use spot_model::{Cmd, CmdAction, CopyDirection, CopySpec, DeleteSpec, LineSpec, SyncSpec, WaitSpec};

use crate::template::{extract_setvars, strip_marker, Templater};
use crate::{RunError, RunResult};

const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(5);
const CANCEL_TICK: Duration = Duration::from_millis(100);

/// Per-command state machine: condition gating, dispatch over the nine
/// action variants, sudo wrapping and script staging/teardown.
pub struct CmdExec<'a> {
    pub executor: &'a mut dyn Executor,
    pub cancel: &'a CancelToken,
    pub task_name: &'a str,
    pub cmd: &'a Cmd,
    pub secrets: &'a IndexMap<String, String>,
    pub verbose: bool,
    /// Shell used on the target for wrapped commands.
    pub shell: String,
    /// Base directory for per-invocation staging dirs on the target.
    pub tmp_base: String,
    pub user: String,
}

#[derive(Debug, Default)]
pub struct CmdOutcome {
    pub details: String,
    pub vars: IndexMap<String, String>,
    pub registered: IndexMap<String, String>,
    pub skipped: bool,
}

impl<'a> CmdExec<'a> {
    pub fn exec(&mut self) -> RunResult<CmdOutcome> {
        if let Some(cond) = self.cmd.condition.clone() {
            if !self.check_condition(&cond)? {
                return Ok(CmdOutcome {
                    details: format!(" {{skip: {}}}", self.cmd.label()),
                    skipped: true,
                    ..CmdOutcome::default()
                });
            }
        }

        match self.cmd.action.clone() {
            CmdAction::Script(script) => self.exec_script(&script),
            CmdAction::Copy(c) => self.exec_copy(&c),
            CmdAction::Mcopy(list) => {
                let mut details = Vec::new();
                for c in &list {
                    let out = self.exec_copy(c)?;
                    details.push(out.details);
                }
                Ok(CmdOutcome {
                    details: details.join(","),
                    ..CmdOutcome::default()
                })
            }
            CmdAction::Sync(s) => self.exec_sync(&s),
            CmdAction::Msync(list) => {
                let mut details = Vec::new();
                for s in &list {
                    let out = self.exec_sync(s)?;
                    details.push(out.details);
                }
                Ok(CmdOutcome {
                    details: details.join(","),
                    ..CmdOutcome::default()
                })
            }
            CmdAction::Delete(d) => self.exec_delete(&d),
            CmdAction::Mdelete(list) => {
                let mut details = Vec::new();
                for d in &list {
                    let out = self.exec_delete(d)?;
                    details.push(out.details);
                }
                Ok(CmdOutcome {
                    details: details.join(","),
                    ..CmdOutcome::default()
                })
            }
            CmdAction::Wait(w) => self.exec_wait(&w),
            CmdAction::Echo(msg) => self.exec_echo(&msg),
            CmdAction::Line(l) => self.exec_line(&l),
        }
    }

    fn templater(&self) -> Templater {
        let mut env = IndexMap::new();
        for (k, v) in self.secrets {
            env.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.cmd.env {
            env.insert(k.clone(), v.clone());
        }
        Templater {
            host_addr: self.executor.host_addr().to_string(),
            host_name: self.executor.host_name().to_string(),
            task: self.task_name.to_string(),
            command: self.cmd.label().to_string(),
            user: self.user.clone(),
            env,
            err: None,
        }
    }

    fn run(&mut self, cmd: &str) -> RunResult<Vec<String>> {
        self.executor
            .run(self.cancel, cmd, &RunOpts::verbose(self.verbose))
            .map_err(RunError::from)
    }

    fn shell_wrap(&self, cmd: &str) -> String {
        format!("{} -c {}", self.shell, exec_utils::quote(cmd))
    }

    /// `sudo CMD`, or a `sudo -S` pipeline when a password secret is
    /// configured. The password stays visible in the remote process
    /// list for the duration of the command; this is documented
    /// behaviour, not an oversight.
    fn sudo_wrap(&self, cmd: &str) -> RunResult<String> {
        if !self.cmd.options.sudo {
            return Ok(cmd.to_string());
        }
        match &self.cmd.options.sudo_password {
            Some(key) => {
                let pass = self.secrets.get(key).ok_or_else(|| {
                    RunError::invalid(format!("sudo password secret {:?} not resolved", key))
                })?;
                Ok(format!(
                    "printf '%s\\n' {} | sudo -S {}",
                    exec_utils::single_quote(pass),
                    cmd
                ))
            }
            None => Ok(format!("sudo {}", cmd)),
        }
    }

    /// `export K='v'; ` prefix carrying the command environment into
    /// shell commands, single-quote markers stripped.
    fn env_prefix(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.cmd.env {
            out.push_str(&format!(
                "export {}={}; ",
                k,
                exec_utils::single_quote(strip_marker(v))
            ));
        }
        out
    }

    fn new_tmp_dir(&self) -> String {
        format!(
            "{}/{}{}",
            self.tmp_base,
            TMP_PREFIX,
            exec_utils::random_suffix(8)
        )
    }

    /// A failing exit of the condition script means "skip"; inverted
    /// conditions flip that.
    fn check_condition(&mut self, cond: &str) -> RunResult<bool> {
        let cond = cond.trim();
        let (cond, inverted) = match cond.strip_prefix('!') {
            Some(rest) => (rest.trim(), true),
            None => (cond, false),
        };
        let rendered = self.templater().apply(cond);
        let wrapped = self.shell_wrap(&format!("{}{}", self.env_prefix(), rendered));
        match self
            .executor
            .run(self.cancel, &wrapped, &RunOpts::default())
        {
            Ok(_) => Ok(!inverted),
            Err(ExecError::Cancelled) => Err(RunError::Cancelled),
            Err(ExecError::Exit { .. }) => Ok(inverted),
            Err(e) => Err(e.into()),
        }
    }

    fn registered_subset(
        &self,
        vars: &IndexMap<String, String>,
        tmpl: &Templater,
    ) -> IndexMap<String, String> {
        let mut out = IndexMap::new();
        for name in &self.cmd.register {
            let name = tmpl.apply(name);
            if let Some(v) = vars.get(&name) {
                out.insert(name, v.clone());
            }
        }
        out
    }

    fn exec_script(&mut self, script: &str) -> RunResult<CmdOutcome> {
        let tmpl = self.templater();
        let multiline = script.trim().lines().count() > 1;
        let (lines, details) = if multiline {
            self.run_script_staged(&tmpl, script)?
        } else {
            let rendered = tmpl.apply(script.trim());
            let full = format!("{}{}", self.env_prefix(), rendered);
            let wrapped = self.sudo_wrap(&self.shell_wrap(&full))?;
            let lines = self.run(&wrapped)?;
            (lines, format!(" {{script: {}}}", rendered))
        };

        let (vars, _rest) = extract_setvars(&lines);
        let registered = self.registered_subset(&vars, &tmpl);
        Ok(CmdOutcome {
            details,
            vars,
            registered,
            skipped: false,
        })
    }

    /// Multi-line script: rendered into a local temp file (mode 0700),
    /// uploaded into a fresh staging dir and executed via `SHELL -c
    /// path`. Teardown removes the staging dir; the local file goes
    /// away with its handle.
    fn run_script_staged(
        &mut self,
        tmpl: &Templater,
        script: &str,
    ) -> RunResult<(Vec<String>, String)> {
        let rendered = format!("{}{}", self.env_prefix(), tmpl.apply(script));

        let mut local = tempfile::Builder::new()
            .prefix("spot-script")
            .suffix(".sh")
            .tempfile()
            .map_err(|e| RunError::invalid(format!("cannot create temp script: {}", e)))?;
        local
            .write_all(rendered.as_bytes())
            .and_then(|_| local.flush())
            .map_err(|e| RunError::invalid(format!("cannot write temp script: {}", e)))?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(local.path(), std::fs::Permissions::from_mode(0o700))
                .map_err(|e| RunError::invalid(format!("cannot chmod temp script: {}", e)))?;
        }

        let file_name = local
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RunError::invalid("temp script has no file name"))?;
        let remote_dir = self.new_tmp_dir();
        let remote_path = format!("{}/{}", remote_dir, file_name);

        let up_opts = CopyOpts {
            mkdir: true,
            force: true,
            exclude: Vec::new(),
        };
        let local_path = local.path().to_string_lossy().into_owned();
        self.executor
            .upload(self.cancel, &local_path, &remote_path, &up_opts)?;

        let wrapped = self.sudo_wrap(&format!(
            "{} -c {}",
            self.shell,
            exec_utils::quote(&remote_path)
        ));
        let res = match wrapped {
            Ok(w) => self.run(&w),
            Err(e) => Err(e),
        };

        // teardown is best-effort; a failure here must not mask the
        // script result
        let del_opts = DeleteOpts {
            recursive: true,
            exclude: Vec::new(),
        };
        if let Err(e) = self.executor.delete(self.cancel, &remote_dir, &del_opts) {
            log::warn!("cannot remove staging dir {}: {}", remote_dir, e);
        }

        let lines = res?;
        Ok((lines, format!(" {{script: {}}}", file_name)))
    }

    fn exec_copy(&mut self, c: &CopySpec) -> RunResult<CmdOutcome> {
        let tmpl = self.templater();
        let src = tmpl.apply(&c.src);
        let dst = tmpl.apply(&c.dst);
        let exclude: Vec<String> = c.exclude.iter().map(|e| tmpl.apply(e)).collect();
        let opts = CopyOpts {
            mkdir: c.mkdir,
            force: c.force,
            exclude,
        };

        match c.direction {
            CopyDirection::Push => {
                if self.cmd.options.sudo {
                    self.copy_sudo_push(&src, &dst, &opts)?;
                } else {
                    self.executor.upload(self.cancel, &src, &dst, &opts)?;
                }
                if c.chmod_x {
                    let chmod = self.sudo_wrap(&format!("chmod +x {}", exec_utils::quote(&dst)))?;
                    self.run(&chmod)?;
                }
            }
            CopyDirection::Pull => {
                if self.cmd.options.local {
                    return Err(RunError::invalid("pull is not supported for local copy"));
                }
                if c.chmod_x {
                    log::warn!("chmod_x is ignored for pull copy of {:?}", c.src);
                }
                if self.cmd.options.sudo {
                    self.copy_sudo_pull(&src, &dst, &opts)?;
                } else {
                    self.executor.download(self.cancel, &src, &dst, &opts)?;
                }
            }
        }

        Ok(CmdOutcome {
            details: format!(" {{copy: {} -> {}}}", src, dst),
            ..CmdOutcome::default()
        })
    }

    /// Elevated push: stage into a fresh tmp dir as the ssh user, then
    /// move into place with sudo.
    fn copy_sudo_push(&mut self, src: &str, dst: &str, opts: &CopyOpts) -> RunResult<()> {
        let tmp = self.new_tmp_dir();
        let dst_is_dir = dst.ends_with('/') || exec_utils::has_glob_meta(src);

        let staged_opts = CopyOpts {
            mkdir: true,
            force: true,
            exclude: opts.exclude.clone(),
        };
        let inner = if dst_is_dir {
            let dst_dir = dst.trim_end_matches('/');
            self.executor
                .upload(self.cancel, src, &format!("{}/", tmp), &staged_opts)?;
            format!(
                "mkdir -p {} && mv -f {}/* {}",
                exec_utils::quote(dst_dir),
                tmp,
                exec_utils::quote(dst_dir)
            )
        } else {
            let base = Path::new(dst)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| RunError::invalid(format!("no file name in {:?}", dst)))?;
            let staged = format!("{}/{}", tmp, base);
            self.executor.upload(self.cancel, src, &staged, &staged_opts)?;
            let dir = Path::new(dst)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/".to_string());
            format!(
                "mkdir -p {} && mv -f {} {}",
                exec_utils::quote(&dir),
                exec_utils::quote(&staged),
                exec_utils::quote(dst)
            )
        };

        let wrapped = self.sudo_wrap(&self.shell_wrap(&inner))?;
        let res = self.run(&wrapped);

        let del_opts = DeleteOpts {
            recursive: true,
            exclude: Vec::new(),
        };
        if let Err(e) = self.executor.delete(self.cancel, &tmp, &del_opts) {
            log::warn!("cannot remove staging dir {}: {}", tmp, e);
        }
        res.map(|_| ())
    }

    /// Elevated pull: copy into a readable tmp dir with sudo, download
    /// from there, clean up with sudo.
    fn copy_sudo_pull(&mut self, src: &str, dst: &str, opts: &CopyOpts) -> RunResult<()> {
        let tmp = self.new_tmp_dir();
        let src_arg = if exec_utils::has_glob_meta(src) {
            src.to_string()
        } else {
            exec_utils::quote(src)
        };
        let stage = format!(
            "mkdir -p {t} && cp -f {s} {t}/ && chmod -R a+rX {t}",
            t = tmp,
            s = src_arg
        );
        let wrapped = self.sudo_wrap(&self.shell_wrap(&stage))?;
        self.run(&wrapped)?;

        let base = Path::new(src)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RunError::invalid(format!("no file name in {:?}", src)))?;
        let res = self
            .executor
            .download(self.cancel, &format!("{}/{}", tmp, base), dst, opts)
            .map_err(RunError::from);

        let cleanup = self.sudo_wrap(&self.shell_wrap(&format!("rm -rf {}", tmp)));
        match cleanup {
            Ok(c) => {
                if let Err(e) = self.run(&c) {
                    log::warn!("cannot remove staging dir {}: {}", tmp, e);
                }
            }
            Err(e) => log::warn!("cannot build staging cleanup for {}: {}", tmp, e),
        }
        res.map(|_| ())
    }

    fn exec_sync(&mut self, s: &SyncSpec) -> RunResult<CmdOutcome> {
        if self.cmd.options.sudo {
            return Err(RunError::invalid("sync does not support sudo"));
        }
        let tmpl = self.templater();
        let src = tmpl.apply(&s.src);
        let dst = tmpl.apply(&s.dst);
        let opts = SyncOpts {
            delete: s.delete,
            force: s.force,
            exclude: s.exclude.iter().map(|e| tmpl.apply(e)).collect(),
        };
        let changed = self.executor.sync(self.cancel, &src, &dst, &opts)?;
        Ok(CmdOutcome {
            details: format!(
                " {{sync: {} -> {}, updated: {}}}",
                src,
                dst,
                changed.len()
            ),
            ..CmdOutcome::default()
        })
    }

    fn exec_delete(&mut self, d: &DeleteSpec) -> RunResult<CmdOutcome> {
        let tmpl = self.templater();
        let path = tmpl.apply(&d.path);

        if self.cmd.options.sudo {
            if !d.exclude.is_empty() {
                return Err(RunError::invalid("exclude is not supported for sudo delete"));
            }
            let inner = if d.recur {
                format!("rm -rf {}", exec_utils::quote(&path))
            } else {
                format!(
                    "if [ -d {p} ]; then rmdir {p}; else rm -f {p}; fi",
                    p = exec_utils::quote(&path)
                )
            };
            let wrapped = self.sudo_wrap(&self.shell_wrap(&inner))?;
            self.run(&wrapped)?;
        } else {
            let opts = DeleteOpts {
                recursive: d.recur,
                exclude: d.exclude.iter().map(|e| tmpl.apply(e)).collect(),
            };
            self.executor.delete(self.cancel, &path, &opts)?;
        }

        Ok(CmdOutcome {
            details: format!(" {{delete: {}, recursive: {}}}", path, d.recur),
            ..CmdOutcome::default()
        })
    }

    /// Polls the predicate until it exits zero, the timeout elapses or
    /// the run is cancelled.
    fn exec_wait(&mut self, w: &WaitSpec) -> RunResult<CmdOutcome> {
        let tmpl = self.templater();
        let rendered = tmpl.apply(w.cmd.trim());
        let wrapped = self.sudo_wrap(&self.shell_wrap(&format!("{}{}", self.env_prefix(), rendered)))?;
        let interval = w.interval.unwrap_or(DEFAULT_WAIT_INTERVAL);
        let started = Instant::now();

        loop {
            self.cancel.check().map_err(RunError::from)?;
            match self
                .executor
                .run(self.cancel, &wrapped, &RunOpts::default())
            {
                Ok(_) => {
                    return Ok(CmdOutcome {
                        details: format!(" {{wait: {}}}", rendered),
                        ..CmdOutcome::default()
                    })
                }
                Err(ExecError::Cancelled) => return Err(RunError::Cancelled),
                Err(_) => {}
            }

            if let Some(timeout) = w.timeout {
                if started.elapsed() >= timeout {
                    return Err(RunError::WaitTimeout {
                        cmd: w.cmd.clone(),
                        timeout,
                    });
                }
            }
            self.sleep_cancellable(interval)?;
        }
    }

    fn sleep_cancellable(&self, d: Duration) -> RunResult<()> {
        let until = Instant::now() + d;
        loop {
            self.cancel.check().map_err(RunError::from)?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            thread::sleep(CANCEL_TICK.min(until - now));
        }
    }

    fn exec_echo(&mut self, msg: &str) -> RunResult<CmdOutcome> {
        let tmpl = self.templater();
        let rendered = tmpl.apply(msg.trim());
        let cmd = self.sudo_wrap(&format!("echo {}", exec_utils::quote(&rendered)))?;
        self.run(&cmd)?;
        Ok(CmdOutcome {
            details: format!(" {{echo: {}}}", rendered),
            ..CmdOutcome::default()
        })
    }

    /// In-place line edit on the target, `sed`/`grep` pipeline.
    fn exec_line(&mut self, l: &LineSpec) -> RunResult<CmdOutcome> {
        let tmpl = self.templater();
        let file = tmpl.apply(&l.file);
        let pattern = tmpl.apply(&l.pattern);

        let (inner, details) = if l.delete {
            (
                format!(
                    "sed -i {} {}",
                    exec_utils::quote(&format!("\\|{}|d", pattern)),
                    exec_utils::quote(&file)
                ),
                format!(" {{line: delete {} in {}}}", pattern, file),
            )
        } else if let Some(ref rep) = l.replace {
            let rep = tmpl.apply(rep);
            (
                format!(
                    "sed -i {} {}",
                    exec_utils::quote(&format!("s|.*{}.*|{}|", pattern, rep)),
                    exec_utils::quote(&file)
                ),
                format!(" {{line: replace {} in {}}}", pattern, file),
            )
        } else if let Some(ref app) = l.append {
            let app = tmpl.apply(app);
            (
                format!(
                    "grep -q {} {} || echo {} >> {}",
                    exec_utils::quote(&pattern),
                    exec_utils::quote(&file),
                    exec_utils::quote(&app),
                    exec_utils::quote(&file)
                ),
                format!(" {{line: append to {}}}", file),
            )
        } else {
            return Err(RunError::invalid(
                "line command needs one of delete/replace/append",
            ));
        };

        let wrapped = self.sudo_wrap(&self.shell_wrap(&inner))?;
        self.run(&wrapped)?;
        Ok(CmdOutcome {
            details,
            ..CmdOutcome::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use spot_log::HostLog;
    use spot_model::CmdOptions;

    fn cmd_exec<'a>(
        executor: &'a mut dyn Executor,
        cancel: &'a CancelToken,
        cmd: &'a Cmd,
        secrets: &'a IndexMap<String, String>,
    ) -> CmdExec<'a> {
        CmdExec {
            executor,
            cancel,
            task_name: "test-task",
            cmd,
            secrets,
            verbose: false,
            shell: "/bin/sh".to_string(),
            tmp_base: "/tmp".to_string(),
            user: "tester".to_string(),
        }
    }

    fn local() -> spot_exec::Local {
        spot_exec::Local::new(&HostLog::new(false), None)
    }

    #[test]
    fn sudo_wrap_forms() {
        let mut ex = local();
        let cancel = CancelToken::new();
        let secrets = IndexMap::new();

        let mut cmd = Cmd::script("s", "echo");
        cmd.options = CmdOptions {
            sudo: true,
            ..CmdOptions::default()
        };
        let ce = cmd_exec(&mut ex, &cancel, &cmd, &secrets);
        assert_eq!(ce.sudo_wrap("ls").unwrap(), "sudo ls");
    }

    #[test]
    fn sudo_password_pipeline_escapes_quotes() {
        let mut ex = local();
        let cancel = CancelToken::new();
        let mut secrets = IndexMap::new();
        secrets.insert("ROOT".to_string(), "pa'ss".to_string());

        let mut cmd = Cmd::script("s", "echo");
        cmd.options = CmdOptions {
            sudo: true,
            sudo_password: Some("ROOT".to_string()),
            ..CmdOptions::default()
        };
        let ce = cmd_exec(&mut ex, &cancel, &cmd, &secrets);
        assert_eq!(
            ce.sudo_wrap("ls").unwrap(),
            r#"printf '%s\n' 'pa'\''ss' | sudo -S ls"#
        );
    }

    #[test]
    fn script_runs_and_extracts_setvars() {
        let mut ex = local();
        let cancel = CancelToken::new();
        let secrets = IndexMap::new();
        let mut cmd = Cmd::script("vars", "echo setvar FOO=bar; echo plain");
        cmd.register = vec!["FOO".to_string()];

        let out = cmd_exec(&mut ex, &cancel, &cmd, &secrets).exec().unwrap();
        assert_eq!(out.vars.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(out.registered.get("FOO").map(String::as_str), Some("bar"));
        assert!(!out.skipped);
    }

    #[test]
    fn multiline_script_stages_and_runs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let mut ex = local();
        let cancel = CancelToken::new();
        let secrets = IndexMap::new();
        let script = format!(
            "set -e\ntouch {m}\necho setvar DONE=yes\n",
            m = marker.display()
        );
        let cmd = Cmd::script("staged", script);

        // staging dir for the test lives under the tempdir
        let mut ce = cmd_exec(&mut ex, &cancel, &cmd, &secrets);
        ce.tmp_base = dir.path().display().to_string();
        let out = ce.exec().unwrap();

        assert!(marker.exists());
        assert_eq!(out.vars.get("DONE").map(String::as_str), Some("yes"));
        // staging dir removed on teardown
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn condition_gates_execution() {
        let mut ex = local();
        let cancel = CancelToken::new();
        let secrets = IndexMap::new();
        let mut cmd = Cmd::script("cond", "echo should-not-run");
        cmd.condition = Some("false".to_string());

        let out = cmd_exec(&mut ex, &cancel, &cmd, &secrets).exec().unwrap();
        assert!(out.skipped);
        assert_eq!(out.details, " {skip: cond}");

        // inverted condition flips the gate
        let mut cmd = Cmd::script("cond", "echo runs");
        cmd.condition = Some("! false".to_string());
        let out = cmd_exec(&mut ex, &cancel, &cmd, &secrets).exec().unwrap();
        assert!(!out.skipped);
    }

    #[test]
    fn env_vars_reach_the_script() {
        let mut ex = local();
        let cancel = CancelToken::new();
        let secrets = IndexMap::new();
        let mut cmd = Cmd::script("env", "echo setvar GOT=$GREETING");
        cmd.env
            .insert("GREETING".to_string(), "hello".to_string());

        let out = cmd_exec(&mut ex, &cancel, &cmd, &secrets).exec().unwrap();
        assert_eq!(out.vars.get("GOT").map(String::as_str), Some("hello"));
    }

    #[test]
    fn copy_push_and_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"data").unwrap();
        let dst = dir.path().join("out/a.txt");

        let mut ex = local();
        let cancel = CancelToken::new();
        let secrets = IndexMap::new();

        let copy = CopySpec {
            src: src.display().to_string(),
            dst: dst.display().to_string(),
            direction: CopyDirection::Push,
            mkdir: true,
            force: false,
            chmod_x: true,
            exclude: Vec::new(),
        };
        let cmd = Cmd {
            action: CmdAction::Copy(copy),
            ..Cmd::script("cp", "")
        };
        cmd_exec(&mut ex, &cancel, &cmd, &secrets).exec().unwrap();
        assert!(dst.exists());
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dst).unwrap().permissions().mode();
            assert_ne!(mode & 0o100, 0, "chmod_x must set the execute bit");
        }

        let del = DeleteSpec {
            path: dst.display().to_string(),
            recur: false,
            exclude: Vec::new(),
        };
        let cmd = Cmd {
            action: CmdAction::Delete(del),
            ..Cmd::script("rm", "")
        };
        cmd_exec(&mut ex, &cancel, &cmd, &secrets).exec().unwrap();
        assert!(!dst.exists());
    }

    #[test]
    fn local_pull_is_rejected() {
        let mut ex = local();
        let cancel = CancelToken::new();
        let secrets = IndexMap::new();
        let copy = CopySpec {
            src: "/tmp/x".to_string(),
            dst: "/tmp/y".to_string(),
            direction: CopyDirection::Pull,
            mkdir: false,
            force: false,
            chmod_x: false,
            exclude: Vec::new(),
        };
        let cmd = Cmd {
            options: CmdOptions {
                local: true,
                ..CmdOptions::default()
            },
            action: CmdAction::Copy(copy),
            ..Cmd::script("cp", "")
        };
        assert!(cmd_exec(&mut ex, &cancel, &cmd, &secrets).exec().is_err());
    }

    #[test]
    fn wait_succeeds_once_predicate_holds() {
        let dir = tempfile::tempdir().unwrap();
        let ready = dir.path().join("ready");
        let r = ready.clone();
        let toucher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            std::fs::write(&r, b"ok").unwrap();
        });

        let mut ex = local();
        let cancel = CancelToken::new();
        let secrets = IndexMap::new();
        let wait = WaitSpec {
            cmd: format!("test -f {}", ready.display()),
            timeout: Some(Duration::from_secs(5)),
            interval: Some(Duration::from_millis(100)),
        };
        let cmd = Cmd {
            action: CmdAction::Wait(wait),
            ..Cmd::script("wait", "")
        };
        let started = Instant::now();
        cmd_exec(&mut ex, &cancel, &cmd, &secrets).exec().unwrap();
        toucher.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wait_times_out() {
        let mut ex = local();
        let cancel = CancelToken::new();
        let secrets = IndexMap::new();
        let wait = WaitSpec {
            cmd: "test -f /nonexistent-marker".to_string(),
            timeout: Some(Duration::from_millis(300)),
            interval: Some(Duration::from_millis(100)),
        };
        let cmd = Cmd {
            action: CmdAction::Wait(wait),
            ..Cmd::script("wait", "")
        };
        match cmd_exec(&mut ex, &cancel, &cmd, &secrets).exec() {
            Err(RunError::WaitTimeout { .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn echo_templated() {
        let mut ex = local();
        let cancel = CancelToken::new();
        let secrets = IndexMap::new();
        let cmd = Cmd {
            action: CmdAction::Echo("task={SPOT_TASK}".to_string()),
            ..Cmd::script("say", "")
        };
        let out = cmd_exec(&mut ex, &cancel, &cmd, &secrets).exec().unwrap();
        assert_eq!(out.details, " {echo: task=test-task}");
    }

    #[test]
    fn line_edit_variants() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("conf");
        std::fs::write(&file, "keep me\ndrop me\n").unwrap();

        let mut ex = local();
        let cancel = CancelToken::new();
        let secrets = IndexMap::new();

        let line = LineSpec {
            file: file.display().to_string(),
            pattern: "drop".to_string(),
            delete: true,
            replace: None,
            append: None,
        };
        let cmd = Cmd {
            action: CmdAction::Line(line),
            ..Cmd::script("line", "")
        };
        cmd_exec(&mut ex, &cancel, &cmd, &secrets).exec().unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "keep me\n");

        // append only when the pattern is absent
        let line = LineSpec {
            file: file.display().to_string(),
            pattern: "added".to_string(),
            delete: false,
            replace: None,
            append: Some("added line".to_string()),
        };
        let cmd = Cmd {
            action: CmdAction::Line(line),
            ..Cmd::script("line", "")
        };
        let mut ce = cmd_exec(&mut ex, &cancel, &cmd, &secrets);
        ce.exec().unwrap();
        let mut ce = cmd_exec(&mut ex, &cancel, &cmd, &secrets);
        ce.exec().unwrap();
        let content = std::fs::read_to_string(&file).unwrap();
        assert_eq!(content.matches("added line").count(), 1);

        // replace the matching line wholesale
        let line = LineSpec {
            file: file.display().to_string(),
            pattern: "keep".to_string(),
            delete: false,
            replace: Some("replaced".to_string()),
            append: None,
        };
        let cmd = Cmd {
            action: CmdAction::Line(line),
            ..Cmd::script("line", "")
        };
        cmd_exec(&mut ex, &cancel, &cmd, &secrets).exec().unwrap();
        assert!(std::fs::read_to_string(&file)
            .unwrap()
            .contains("replaced"));
    }
}
