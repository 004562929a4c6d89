//! `spot` binary: argument parsing, logger and signal setup, playbook
//! loading and the task/target run loop.

use std::path::PathBuf;
use std::process;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use lazy_static::lazy_static;
use structopt::clap::ErrorKind;
use structopt::StructOpt;

use spot_core::{
    collect_secrets, EnvSecrets, NoSecrets, RunError, Runner, RunnerConfig, SecretProvider,
};
use spot_exec::{CancelToken, Connector};
use spot_log::{init_term_logger, HostLog};
use spot_model::{Overrides, Playbook};

const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "spot",
    about = "concurrent ssh playbook executor",
    setting = structopt::clap::AppSettings::TrailingVarArg
)]
struct Opts {
    /// Playbook file.
    #[structopt(short = "f", long = "file", default_value = "spot.yml")]
    playbook: PathBuf,

    /// Task name(s) to run; every task of the playbook when empty.
    #[structopt(long = "task", number_of_values = 1)]
    tasks: Vec<String>,

    /// Target name(s): playbook target, group, tag, host or host:port.
    #[structopt(short = "t", long = "target", default_value = "default", number_of_values = 1)]
    targets: Vec<String>,

    /// How many hosts to run in parallel.
    #[structopt(short = "c", long = "concurrent", default_value = "1")]
    concurrent: usize,

    /// SSH user override.
    #[structopt(short = "u", long = "user")]
    user: Option<String>,

    /// SSH private key; the agent is used when omitted.
    #[structopt(short = "k", long = "key")]
    key: Option<PathBuf>,

    /// Inventory file; SPOT_INVENTORY applies when omitted.
    #[structopt(short = "i", long = "inventory")]
    inventory: Option<PathBuf>,

    /// KEY=VALUE environment overrides, repeatable.
    #[structopt(short = "e", long = "env", number_of_values = 1)]
    env: Vec<String>,

    /// YAML file with a flat map of environment overrides.
    #[structopt(short = "E", long = "env-file")]
    env_file: Option<PathBuf>,

    /// Run only the named commands.
    #[structopt(long = "only", number_of_values = 1)]
    only: Vec<String>,

    /// Skip the named commands.
    #[structopt(long = "skip", number_of_values = 1)]
    skip: Vec<String>,

    /// Dry run: report intended actions without touching the hosts.
    #[structopt(long = "dry")]
    dry: bool,

    /// Stream per-host command output to stdout.
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,

    /// Show debug-routed output.
    #[structopt(long = "dbg")]
    dbg: bool,

    /// Disable colours.
    #[structopt(long = "no-color")]
    no_color: bool,

    /// Shell used on the targets.
    #[structopt(long = "shell", default_value = "/bin/sh")]
    shell: String,

    /// SSH connect timeout in seconds.
    #[structopt(long = "timeout", default_value = "30")]
    timeout: u64,

    /// Resolve secrets from SPOT_SECRET_* environment variables.
    #[structopt(long = "env-secrets")]
    env_secrets: bool,

    /// Ad-hoc command to run when the playbook defines no task for it.
    #[structopt(name = "COMMAND", allow_hyphen_values = true)]
    ad_hoc: Vec<String>,
}

lazy_static! {
    static ref CANCEL: CancelToken = CancelToken::new();
}

extern "C" fn handle_signal(_sig: libc::c_int) {
    CANCEL.cancel();
}

fn install_signal_handlers() {
    // the token must exist before the first signal can arrive
    let _ = CANCEL.is_cancelled();
    let handler = handle_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn main() {
    let opts = match Opts::from_iter_safe(std::env::args()) {
        Ok(opts) => opts,
        Err(e) => match e.kind {
            ErrorKind::HelpDisplayed | ErrorKind::VersionDisplayed => {
                println!("{}", e.message);
                process::exit(0);
            }
            _ => {
                eprintln!("{}", e.message);
                process::exit(EXIT_USAGE);
            }
        },
    };

    init_term_logger(opts.dbg, opts.no_color);
    install_signal_handlers();

    if let Err(e) = run(&opts, &CANCEL) {
        if e.is_cancelled() {
            log::error!("interrupted");
        } else {
            log::error!("{}", e);
        }
        process::exit(EXIT_FAILURE);
    }
}

fn run(opts: &Opts, cancel: &CancelToken) -> Result<(), RunError> {
    let overrides = build_overrides(opts)?;
    let ad_hoc_mode = overrides.ad_hoc_command.is_some() && !opts.playbook.exists();
    let playbook = if ad_hoc_mode {
        Playbook::ad_hoc(overrides)?
    } else {
        Playbook::load(&opts.playbook, overrides)?
    };

    let provider: Box<dyn SecretProvider> = if opts.env_secrets {
        Box::new(EnvSecrets)
    } else {
        Box::new(NoSecrets)
    };
    let secrets = collect_secrets(&playbook, provider.as_ref())?;
    let secret_values: Vec<String> = secrets.values().cloned().collect();
    spot_log::add_global_secrets(&secret_values);

    let log = HostLog::new(opts.verbose);
    let key = opts.key.clone().or_else(|| playbook.ssh_key.clone());
    let connector = Connector::new(key, Duration::from_secs(opts.timeout), &log)?;

    let config = RunnerConfig {
        concurrency: opts.concurrent,
        only: opts.only.clone(),
        skip: opts.skip.clone(),
        verbose: opts.verbose,
        dry: opts.dry,
        ssh_shell: opts.shell.clone(),
        local_shell: std::env::var("SHELL").ok(),
        tmp_base: "/tmp".to_string(),
    };
    let mut runner = Runner::new(playbook, connector, secrets, config, log);

    let task_names: Vec<String> = if opts.tasks.is_empty() {
        runner
            .playbook()
            .tasks
            .iter()
            .map(|t| t.name.clone())
            .collect()
    } else {
        opts.tasks.clone()
    };

    let started = Instant::now();
    let mut hosts = 0usize;
    let mut commands = 0usize;
    for task in &task_names {
        for target in &opts.targets {
            let stats = runner.run_task(cancel, task, target)?;
            hosts = hosts.max(stats.hosts);
            commands += stats.commands;
        }
    }

    log::info!(
        "completed: hosts:{}, commands:{} in {:.1}s",
        hosts,
        commands,
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

fn build_overrides(opts: &Opts) -> Result<Overrides, RunError> {
    let inventory = opts
        .inventory
        .clone()
        .or_else(|| std::env::var_os("SPOT_INVENTORY").map(PathBuf::from));

    let mut environment = IndexMap::new();
    if let Some(ref path) = opts.env_file {
        environment.extend(load_env_file(path)?);
    }
    // -e pairs win over the env file
    environment.extend(parse_env(&opts.env)?);

    Ok(Overrides {
        user: opts.user.clone(),
        inventory,
        environment,
        ad_hoc_command: if opts.ad_hoc.is_empty() {
            None
        } else {
            Some(opts.ad_hoc.join(" "))
        },
    })
}

fn load_env_file(path: &std::path::Path) -> Result<IndexMap<String, String>, RunError> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| RunError::invalid(format!("cannot read env file {}: {}", path.display(), e)))?;
    serde_yaml::from_str(&data)
        .map_err(|e| RunError::invalid(format!("cannot parse env file {}: {}", path.display(), e)))
}

fn parse_env(pairs: &[String]) -> Result<IndexMap<String, String>, RunError> {
    let mut map = IndexMap::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((k, v)) if !k.is_empty() => {
                map.insert(k.to_string(), v.to_string());
            }
            _ => {
                return Err(RunError::invalid(format!(
                    "environment override {:?} is not KEY=VALUE",
                    pair
                )))
            }
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_env_pairs() {
        let map = parse_env(&["A=1".to_string(), "B=x=y".to_string()]).unwrap();
        assert_eq!(map.get("A").map(String::as_str), Some("1"));
        assert_eq!(map.get("B").map(String::as_str), Some("x=y"));
        assert!(parse_env(&["NOEQ".to_string()]).is_err());
        assert!(parse_env(&["=v".to_string()]).is_err());
    }

    #[test]
    fn env_file_merges_under_explicit_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("env.yml");
        std::fs::write(&f, "A: file\nB: file\n").unwrap();
        let opts = Opts::from_iter_safe(&[
            "spot",
            "-E",
            f.to_str().unwrap(),
            "-e",
            "A=cli",
        ])
        .unwrap();
        let overrides = build_overrides(&opts).unwrap();
        assert_eq!(overrides.environment.get("A").map(String::as_str), Some("cli"));
        assert_eq!(overrides.environment.get("B").map(String::as_str), Some("file"));
    }

    #[test]
    fn opts_defaults() {
        let opts = Opts::from_iter_safe(&["spot"]).unwrap();
        assert_eq!(opts.playbook, PathBuf::from("spot.yml"));
        assert_eq!(opts.targets, vec!["default"]);
        assert_eq!(opts.concurrent, 1);
        assert!(!opts.dry);
    }

    #[test]
    fn opts_ad_hoc_command() {
        let opts =
            Opts::from_iter_safe(&["spot", "-t", "h1.example.com", "df", "-h"]).unwrap();
        let overrides = build_overrides(&opts).unwrap();
        assert_eq!(overrides.ad_hoc_command.as_deref(), Some("df -h"));
    }

    #[test]
    fn ad_hoc_playbook_materialises() {
        let opts = Opts::from_iter_safe(&["spot", "-t", "h1.example.com", "uptime"]).unwrap();
        let overrides = build_overrides(&opts).unwrap();
        let pb = Playbook::ad_hoc(overrides).unwrap();
        assert_eq!(pb.tasks.len(), 1);
        assert_eq!(pb.tasks[0].name, "ad-hoc");
    }
}
