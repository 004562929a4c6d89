mod cmd;
mod task;

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc;
use std::thread;

use indexmap::IndexMap;
use parking_lot::Mutex;

use spot_exec::{CancelToken, Connector, Dry, Executor};
use spot_log::HostLog;
use spot_model::{current_user, Destination, Playbook, Task};

use self::task::{HostResult, TaskParams};
use crate::{RunError, RunResult};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub concurrency: usize,
    pub only: Vec<String>,
    pub skip: Vec<String>,
    pub verbose: bool,
    pub dry: bool,
    /// Shell used on the targets for wrapped commands.
    pub ssh_shell: String,
    /// Operator's `$SHELL` preference for local commands and hooks.
    pub local_shell: Option<String>,
    /// Base directory for staging dirs on the targets.
    pub tmp_base: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            concurrency: 1,
            only: Vec::new(),
            skip: Vec::new(),
            verbose: false,
            dry: false,
            ssh_shell: "/bin/sh".to_string(),
            local_shell: None,
            tmp_base: "/tmp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunStats {
    pub hosts: usize,
    pub commands: usize,
}

/// Concurrent fan-out of a task across its destinations: bounded worker
/// threads, shared cancellation, error aggregation, register-variable
/// merge between tasks.
pub struct Runner {
    playbook: Playbook,
    connector: Connector,
    config: RunnerConfig,
    secrets: IndexMap<String, String>,
    log: HostLog,
    register_vars: IndexMap<String, String>,
}

impl Runner {
    pub fn new(
        playbook: Playbook,
        connector: Connector,
        secrets: IndexMap<String, String>,
        config: RunnerConfig,
        log: HostLog,
    ) -> Runner {
        Runner {
            playbook,
            connector,
            config,
            secrets,
            log,
            register_vars: IndexMap::new(),
        }
    }

    pub fn playbook(&self) -> &Playbook {
        &self.playbook
    }

    /// Runs one task against one target. Tasks are serialised by the
    /// caller; register variables collected here become visible to the
    /// next call.
    pub fn run_task(
        &mut self,
        cancel: &CancelToken,
        task_name: &str,
        target: &str,
    ) -> RunResult<RunStats> {
        // deep copy: per-run mutations must never touch the playbook
        let mut task = self.playbook.task(task_name)?.clone();
        let over_env = self.playbook.overrides().environment.clone();
        for c in task.commands.iter_mut() {
            for (k, v) in &over_env {
                c.env.insert(k.clone(), v.clone());
            }
        }

        let dests = self
            .playbook
            .target_destinations(target, task.user.as_deref())?;
        log::info!(
            "run task {:?} on target {:?} ({} host(s))",
            task_name,
            target,
            dests.len()
        );

        let workers = self.config.concurrency.max(1).min(dests.len().max(1));
        let queue: Mutex<VecDeque<(usize, Destination)>> =
            Mutex::new(dests.into_iter().enumerate().collect());
        let (tx, rx) = mpsc::channel::<(usize, RunResult<HostResult>)>();

        let init_vars = self.register_vars.clone();
        let task_ref = &task;
        let self_ref = &*self;

        let results: Vec<(usize, RunResult<HostResult>)> = thread::scope(|s| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let init_vars = &init_vars;
                s.spawn(move || loop {
                    let (idx, dest) = match queue.lock().pop_front() {
                        Some(item) => item,
                        None => break,
                    };
                    let res = if cancel.is_cancelled() {
                        Err(RunError::Cancelled)
                    } else {
                        self_ref.run_host(cancel, task_ref, &dest, init_vars)
                    };
                    let _ = tx.send((idx, res));
                });
            }
            drop(tx);
            rx.iter().collect()
        });

        let mut errors = Vec::new();
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        let mut hosts_ok = 0usize;
        for (idx, res) in results {
            match res {
                Ok(hr) => {
                    hosts_ok += 1;
                    counts.insert(idx, hr.count);
                    // last writer wins within the task
                    self.register_vars.extend(hr.registered);
                }
                Err(e) => errors.push(e),
            }
        }

        if !errors.is_empty() {
            if errors.iter().all(|e| e.is_cancelled()) {
                return Err(RunError::Cancelled);
            }
            return Err(RunError::Aggregate(errors));
        }

        // every host runs the same filtered sequence; the first host's
        // count stands in for the task
        let commands = counts
            .get(&0)
            .copied()
            .or_else(|| counts.values().next().copied())
            .unwrap_or(0);
        Ok(RunStats {
            hosts: hosts_ok,
            commands,
        })
    }

    fn run_host(
        &self,
        cancel: &CancelToken,
        task: &Task,
        dest: &Destination,
        init_vars: &IndexMap<String, String>,
    ) -> RunResult<HostResult> {
        let user = dest.user.clone().unwrap_or_else(current_user);
        let host_log = self.log.with_host(&dest.addr(), &dest.name);

        let mut executor: Box<dyn Executor> = if self.config.dry {
            Box::new(Dry::new(&self.log, &dest.addr(), &dest.name))
        } else {
            let connector = match task.ssh_key {
                Some(ref key) => self.connector.with_key_path(Some(key.clone()))?,
                None => self.connector.clone(),
            };
            Box::new(connector.connect(&dest.addr(), &dest.name, &user)?)
        };
        executor.set_secrets(&self.secrets.values().cloned().collect::<Vec<_>>());

        let params = TaskParams {
            cancel,
            task,
            secrets: &self.secrets,
            only: &self.config.only,
            skip: &self.config.skip,
            verbose: self.config.verbose,
            shell: self.config.ssh_shell.clone(),
            local_shell: self.config.local_shell.clone(),
            tmp_base: self.config.tmp_base.clone(),
            user,
            init_vars,
        };
        let res = task::run_on_host(&params, executor.as_mut(), &host_log);

        // close is always attempted; its failure must not mask the result
        if let Err(e) = executor.close() {
            log::warn!("close failed for {}: {}", dest.addr(), e);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use spot_exec::DEFAULT_TIMEOUT;
    use spot_model::{Overrides, Playbook};

    fn dry_runner(pb: Playbook, concurrency: usize) -> Runner {
        let log = HostLog::new(false);
        let connector = Connector::new(None, DEFAULT_TIMEOUT, &log).unwrap();
        Runner::new(
            pb,
            connector,
            IndexMap::new(),
            RunnerConfig {
                concurrency,
                dry: true,
                ..RunnerConfig::default()
            },
            log,
        )
    }

    fn playbook() -> Playbook {
        Playbook::from_str(
            indoc::indoc! {"
                targets:
                  pair:
                    hosts:
                      - {host: h1.example.com}
                      - {host: h2.example.com}
                tasks:
                  - name: deploy
                    commands:
                      - name: hello
                        script: echo hello
                      - name: bye
                        script: echo bye
            "},
            false,
        )
        .unwrap()
    }

    #[test]
    fn dry_run_fans_out_over_hosts() {
        let mut runner = dry_runner(playbook(), 2);
        let stats = runner
            .run_task(&CancelToken::new(), "deploy", "pair")
            .unwrap();
        assert_eq!(stats.hosts, 2);
        assert_eq!(stats.commands, 2);
    }

    #[test]
    fn unknown_task_is_error() {
        let mut runner = dry_runner(playbook(), 1);
        assert!(runner
            .run_task(&CancelToken::new(), "nope", "pair")
            .is_err());
    }

    #[test]
    fn cancelled_run_reports_cancellation() {
        let mut runner = dry_runner(playbook(), 2);
        let cancel = CancelToken::new();
        cancel.cancel();
        match runner.run_task(&cancel, "deploy", "pair") {
            Err(RunError::Cancelled) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn only_filter_limits_command_count() {
        let mut runner = dry_runner(playbook(), 1);
        runner.config.only = vec!["hello".to_string()];
        let stats = runner
            .run_task(&CancelToken::new(), "deploy", "pair")
            .unwrap();
        assert_eq!(stats.commands, 1);
    }

    #[test]
    fn override_env_reaches_commands() {
        let mut env = IndexMap::new();
        env.insert("K".to_string(), "v".to_string());
        let pb = Playbook::from_str(
            "tasks:\n  - name: t\n    commands:\n      - {name: c, script: echo $K}\n",
            false,
        )
        .unwrap();
        // overrides are applied on the clone, the playbook stays intact
        let mut runner = dry_runner(pb, 1);
        runner.playbook = runner
            .playbook
            .clone()
            .with_overrides(Overrides {
                environment: env,
                ..Overrides::default()
            });
        runner
            .run_task(&CancelToken::new(), "t", "h.example.com")
            .unwrap();
        assert!(runner.playbook.tasks[0].commands[0].env.is_empty());
    }
}
