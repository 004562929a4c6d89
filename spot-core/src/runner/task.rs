use std::time::Instant;

use indexmap::IndexMap;

use spot_exec::{CancelToken, Executor, Local, RunOpts};
use spot_log::HostLog;
use spot_model::{Cmd, Task};

use super::cmd::CmdExec;
use crate::template::Templater;
use crate::{RunError, RunResult};

/// Everything a worker needs to run one task on one host.
pub struct TaskParams<'a> {
    pub cancel: &'a CancelToken,
    pub task: &'a Task,
    pub secrets: &'a IndexMap<String, String>,
    pub only: &'a [String],
    pub skip: &'a [String],
    pub verbose: bool,
    pub shell: String,
    pub local_shell: Option<String>,
    pub tmp_base: String,
    pub user: String,
    /// Register-scope variables carried over from earlier tasks.
    pub init_vars: &'a IndexMap<String, String>,
}

#[derive(Debug, Default)]
pub struct HostResult {
    pub count: usize,
    pub registered: IndexMap<String, String>,
}

/// Command filter: `skip` wins over `only`; `no_auto` commands run only
/// when named explicitly in `only`.
pub fn filter_commands<'t>(task: &'t Task, only: &[String], skip: &[String]) -> Vec<&'t Cmd> {
    task.commands
        .iter()
        .filter(|c| {
            let name = c.label();
            if skip.iter().any(|s| s == name) {
                return false;
            }
            if !only.is_empty() {
                return only.iter().any(|o| o == name);
            }
            !c.options.no_auto
        })
        .collect()
}

/// Per-host pipeline: iterate the filtered commands in order, propagate
/// `setvar` variables, print one completion line per command, run the
/// `on_error` hook locally on the first failure.
pub fn run_on_host(
    p: &TaskParams<'_>,
    executor: &mut dyn Executor,
    log: &HostLog,
) -> RunResult<HostResult> {
    let host_addr = executor.host_addr().to_string();
    let host_name = executor.host_name().to_string();
    let mut vars: IndexMap<String, String> = p.init_vars.clone();
    let mut registered = IndexMap::new();
    let mut count = 0usize;

    for cmd in filter_commands(p.task, p.only, p.skip) {
        p.cancel.check().map_err(RunError::from)?;
        let started = Instant::now();

        let mut cmd = cmd.clone();
        // runtime variables flow into the environment; explicit command
        // env keeps precedence
        for (k, v) in &vars {
            if !cmd.env.contains_key(k) {
                cmd.env.insert(k.clone(), v.clone());
            }
        }

        let outcome = if cmd.options.local {
            let mut local = Local::new(log, p.local_shell.clone());
            local.set_secrets(&secret_values(p.secrets));
            let mut ce = CmdExec {
                executor: &mut local,
                cancel: p.cancel,
                task_name: &p.task.name,
                cmd: &cmd,
                secrets: p.secrets,
                verbose: p.verbose,
                shell: p.local_shell.clone().unwrap_or_else(|| "/bin/sh".to_string()),
                tmp_base: p.tmp_base.clone(),
                user: p.user.clone(),
            };
            ce.exec()
        } else {
            let mut ce = CmdExec {
                executor: &mut *executor,
                cancel: p.cancel,
                task_name: &p.task.name,
                cmd: &cmd,
                secrets: p.secrets,
                verbose: p.verbose,
                shell: p.shell.clone(),
                tmp_base: p.tmp_base.clone(),
                user: p.user.clone(),
            };
            ce.exec()
        };

        match outcome {
            Ok(out) => {
                count += 1;
                vars.extend(out.vars);
                registered.extend(out.registered);
                log.info(&format!(
                    "completed command {:?}{} ({}ms)",
                    cmd.label(),
                    out.details,
                    started.elapsed().as_millis()
                ));
            }
            Err(err) => {
                if err.is_cancelled() {
                    return Err(err);
                }
                if cmd.options.ignore_errors {
                    count += 1;
                    log.info(&format!(
                        "failed command {:?} ({}ms), ignored: {}",
                        cmd.label(),
                        started.elapsed().as_millis(),
                        err
                    ));
                    continue;
                }
                if let Some(ref hook) = p.task.on_error {
                    run_on_error_hook(p, &host_addr, &host_name, cmd.label(), hook, &err, log);
                }
                return Err(RunError::on_host(&host_addr, cmd.label(), err));
            }
        }
    }

    Ok(HostResult { count, registered })
}

/// Best-effort local hook; its own failure is logged and the original
/// error kept.
fn run_on_error_hook(
    p: &TaskParams<'_>,
    host_addr: &str,
    host_name: &str,
    cmd_name: &str,
    hook: &str,
    err: &RunError,
    log: &HostLog,
) {
    let tmpl = Templater {
        host_addr: host_addr.to_string(),
        host_name: host_name.to_string(),
        task: p.task.name.clone(),
        command: cmd_name.to_string(),
        user: p.user.clone(),
        env: IndexMap::new(),
        err: Some(err.to_string()),
    };
    let rendered = tmpl.apply(hook.trim());
    let mut local = Local::new(log, p.local_shell.clone());
    if let Err(hook_err) = local.run(p.cancel, &rendered, &RunOpts::default()) {
        log::warn!("on_error hook failed: {}", hook_err);
    }
}

fn secret_values(secrets: &IndexMap<String, String>) -> Vec<String> {
    secrets.values().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use spot_model::CmdOptions;

    fn task(cmds: Vec<Cmd>) -> Task {
        Task::new("t", cmds)
    }

    fn named(name: &str, no_auto: bool) -> Cmd {
        let mut c = Cmd::script(name, "echo");
        c.options = CmdOptions {
            no_auto,
            ..CmdOptions::default()
        };
        c
    }

    fn params<'a>(
        cancel: &'a CancelToken,
        task: &'a Task,
        secrets: &'a IndexMap<String, String>,
        init_vars: &'a IndexMap<String, String>,
    ) -> TaskParams<'a> {
        TaskParams {
            cancel,
            task,
            secrets,
            only: &[],
            skip: &[],
            verbose: false,
            shell: "/bin/sh".to_string(),
            local_shell: None,
            tmp_base: "/tmp".to_string(),
            user: "tester".to_string(),
            init_vars,
        }
    }

    #[test]
    fn filter_drops_skipped_and_no_auto() {
        let t = task(vec![named("a", false), named("b", false), named("c", true)]);
        let names: Vec<&str> = filter_commands(&t, &[], &["b".to_string()])
            .iter()
            .map(|c| c.label())
            .collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn filter_only_allows_no_auto_when_named() {
        let t = task(vec![named("a", false), named("c", true)]);
        let names: Vec<&str> = filter_commands(&t, &["c".to_string()], &[])
            .iter()
            .map(|c| c.label())
            .collect();
        assert_eq!(names, vec!["c"]);
    }

    #[test]
    fn filter_skip_wins_over_only() {
        let t = task(vec![named("a", false)]);
        let names: Vec<&str> =
            filter_commands(&t, &["a".to_string()], &["a".to_string()])
                .iter()
                .map(|c| c.label())
                .collect();
        assert!(names.is_empty());
    }

    #[test]
    fn pipeline_propagates_setvars() {
        let cancel = CancelToken::new();
        let secrets = IndexMap::new();
        let init = IndexMap::new();
        let t = task(vec![
            Cmd::script("produce", "echo setvar COLOR=green"),
            Cmd::script("consume", "echo setvar ECHOED=$COLOR"),
        ]);
        let p = params(&cancel, &t, &secrets, &init);
        let log = HostLog::new(false);
        let mut ex = Local::new(&log, None);

        let res = run_on_host(&p, &mut ex, &log).unwrap();
        assert_eq!(res.count, 2);
        // register list is empty so nothing leaves the task scope
        assert!(res.registered.is_empty());
    }

    #[test]
    fn pipeline_registers_for_next_task() {
        let cancel = CancelToken::new();
        let secrets = IndexMap::new();
        let init = IndexMap::new();
        let mut produce = Cmd::script("produce", "echo setvar COLOR=green");
        produce.register = vec!["COLOR".to_string()];
        let t = task(vec![produce]);
        let p = params(&cancel, &t, &secrets, &init);
        let log = HostLog::new(false);
        let mut ex = Local::new(&log, None);

        let res = run_on_host(&p, &mut ex, &log).unwrap();
        assert_eq!(
            res.registered.get("COLOR").map(String::as_str),
            Some("green")
        );
    }

    #[test]
    fn ignore_errors_continues() {
        let cancel = CancelToken::new();
        let secrets = IndexMap::new();
        let init = IndexMap::new();
        let mut failing = Cmd::script("fail", "exit 1");
        failing.options = CmdOptions {
            ignore_errors: true,
            ..CmdOptions::default()
        };
        let t = task(vec![failing, Cmd::script("after", "echo ok")]);
        let p = params(&cancel, &t, &secrets, &init);
        let log = HostLog::new(false);
        let mut ex = Local::new(&log, None);

        let res = run_on_host(&p, &mut ex, &log).unwrap();
        assert_eq!(res.count, 2);
    }

    #[test]
    fn failure_aborts_and_runs_hook() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("hook-ran");

        let cancel = CancelToken::new();
        let secrets = IndexMap::new();
        let init = IndexMap::new();
        let mut t = task(vec![
            Cmd::script("boom", "exit 2"),
            Cmd::script("never", "echo unreachable"),
        ]);
        t.on_error = Some(format!("touch {}", marker.display()));
        let p = params(&cancel, &t, &secrets, &init);
        let log = HostLog::new(false);
        let mut ex = Local::new(&log, None);

        let err = run_on_host(&p, &mut ex, &log).unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(marker.exists(), "on_error hook must run");
    }
}
