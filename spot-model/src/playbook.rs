use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::target::parse_host_port_lenient;
use crate::{
    current_user, parse_host_port, Cmd, Destination, Inventory, ModelError, ModelResult, Target,
};

pub const DEFAULT_NAME: &str = "default";
pub const AD_HOC_TASK_NAME: &str = "ad-hoc";

/// Run-level overrides coming from the CLI boundary. Applied on top of
/// the playbook without mutating it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub user: Option<String>,
    pub inventory: Option<PathBuf>,
    pub environment: IndexMap<String, String>,
    pub ad_hoc_command: Option<String>,
}

/// Named ordered list of commands applied to a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Task {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
    #[serde(default)]
    pub commands: Vec<Cmd>,
}

impl Task {
    pub fn new<N: Into<String>>(name: N, commands: Vec<Cmd>) -> Task {
        Task {
            name: name.into(),
            user: None,
            ssh_key: None,
            on_error: None,
            commands,
        }
    }
}

/// Top-level declarative document: defaults, targets and ordered tasks.
/// Immutable after load; per-run mutations operate on task clones.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Playbook {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub targets: IndexMap<String, Target>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<Task>,

    #[serde(skip)]
    inventory_data: Option<Inventory>,
    #[serde(skip)]
    overrides: Overrides,
}

/// Simplified schema: one anonymous task plus a flat target list.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SimplePlaybook {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    ssh_key: Option<PathBuf>,
    #[serde(default)]
    inventory: Option<PathBuf>,
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    task: Vec<Cmd>,
}

impl Playbook {
    /// Loads and validates a playbook file; `.toml` extension selects
    /// TOML, anything else parses as YAML. The inventory (override
    /// location first, then the playbook's own) is loaded as part of
    /// this call.
    pub fn load(path: &Path, overrides: Overrides) -> ModelResult<Playbook> {
        let data = fs::read_to_string(path).map_err(|e| ModelError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let is_toml = path.extension().map(|e| e == "toml").unwrap_or(false);
        let mut pb = Playbook::from_str(&data, is_toml).map_err(|e| match e {
            ModelError::PlaybookParse { detail, .. } => ModelError::PlaybookParse {
                path: path.to_path_buf(),
                detail,
            },
            other => other,
        })?;
        pb.overrides = overrides;
        pb.load_inventory()?;
        pb.validate()?;
        Ok(pb)
    }

    /// Playbook for ad-hoc mode: a single synthetic task holding one
    /// script command, no playbook file involved.
    pub fn ad_hoc(overrides: Overrides) -> ModelResult<Playbook> {
        let command = overrides
            .ad_hoc_command
            .clone()
            .ok_or_else(|| ModelError::invalid("ad-hoc mode requires a command"))?;
        let mut pb = Playbook {
            user: overrides.user.clone(),
            tasks: vec![Task::new(
                AD_HOC_TASK_NAME,
                vec![Cmd::script(AD_HOC_TASK_NAME, command)],
            )],
            overrides,
            ..Playbook::default()
        };
        pb.load_inventory()?;
        pb.validate()?;
        Ok(pb)
    }

    /// Two-pass parse: the full schema first, the simplified schema as
    /// fallback. Success iff at least one of them accepts the document.
    pub fn from_str(data: &str, is_toml: bool) -> ModelResult<Playbook> {
        let full: Result<Playbook, String> = if is_toml {
            toml::from_str(data).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(data).map_err(|e| e.to_string())
        };
        match full {
            Ok(pb) => Ok(pb),
            Err(full_err) => {
                let simple: Result<SimplePlaybook, String> = if is_toml {
                    toml::from_str(data).map_err(|e| e.to_string())
                } else {
                    serde_yaml::from_str(data).map_err(|e| e.to_string())
                };
                match simple {
                    Ok(sp) => Ok(sp.materialize()),
                    Err(simple_err) => Err(ModelError::PlaybookParse {
                        path: Default::default(),
                        detail: format!(
                            "full form: {}; simplified form: {}",
                            full_err, simple_err
                        ),
                    }),
                }
            }
        }
    }

    pub fn overrides(&self) -> &Overrides {
        &self.overrides
    }

    pub fn inventory_data(&self) -> Option<&Inventory> {
        self.inventory_data.as_ref()
    }

    pub fn task(&self, name: &str) -> ModelResult<&Task> {
        self.tasks
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ModelError::TaskNotFound(name.to_string()))
    }

    /// Every secret key referenced anywhere in the playbook, sudo
    /// passwords included, deduplicated and sorted.
    pub fn all_secret_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .tasks
            .iter()
            .flat_map(|t| t.commands.iter())
            .flat_map(|c| c.secret_keys())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Unique non-empty task names, at least one command per task. The
    /// one-action-per-command invariant is enforced by the parser.
    pub fn validate(&self) -> ModelResult<()> {
        if self.tasks.is_empty() {
            return Err(ModelError::invalid("playbook defines no tasks"));
        }
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.name.is_empty() {
                return Err(ModelError::invalid("task with empty name"));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(ModelError::invalid(format!(
                    "duplicate task name {:?}",
                    task.name
                )));
            }
            if task.commands.is_empty() {
                return Err(ModelError::invalid(format!(
                    "task {:?} has no commands",
                    task.name
                )));
            }
        }
        Ok(())
    }

    /// Resolves a target name to concrete destinations with ports and
    /// users defaulted and duplicates (by `host:port:user`) removed.
    pub fn target_destinations(
        &self,
        name: &str,
        task_user: Option<&str>,
    ) -> ModelResult<Vec<Destination>> {
        let assembled = self.assemble(name)?;
        let mut res = Vec::new();
        let mut seen = HashSet::new();
        for d in assembled {
            let user = self.resolve_user(d.user.as_deref(), task_user);
            let d = Destination {
                user: Some(user),
                ..d
            }
            .with_defaults(None);
            if seen.insert(d.identity()) {
                res.push(d);
            }
        }
        Ok(res)
    }

    /// User precedence: override, destination, task, playbook, current
    /// OS user.
    fn resolve_user(&self, dest_user: Option<&str>, task_user: Option<&str>) -> String {
        self.overrides
            .user
            .as_deref()
            .or(dest_user)
            .or(task_user)
            .or_else(|| self.user.as_deref())
            .map(|u| u.to_string())
            .unwrap_or_else(current_user)
    }

    fn assemble(&self, name: &str) -> ModelResult<Vec<Destination>> {
        let inv = self.inventory_data.as_ref();

        // 1. playbook target
        if let Some(target) = self.targets.get(name) {
            let mut res: Vec<Destination> = target.hosts.clone();
            if let Some(inv) = inv {
                for n in &target.names {
                    if let Some(d) = inv.host_by_name(n) {
                        res.push(d.clone());
                    }
                }
                for g in &target.groups {
                    if let Some(dests) = inv.group(g) {
                        res.extend(dests.iter().cloned());
                    }
                }
                for t in &target.tags {
                    res.extend(inv.hosts_with_tag(t).into_iter().cloned());
                }
            }
            if res.is_empty() {
                return Err(ModelError::TargetEmpty(name.to_string()));
            }
            return Ok(res);
        }

        if let Some(inv) = inv {
            // 2. inventory group
            if let Some(dests) = inv.group(name) {
                if !dests.is_empty() {
                    return Ok(dests.to_vec());
                }
            }
            // 3. inventory tag
            let tagged = inv.hosts_with_tag(name);
            if !tagged.is_empty() {
                return Ok(tagged.into_iter().cloned().collect());
            }
            // 4. inventory host by name, then by address
            if let Some(d) = inv.host_by_name(name) {
                return Ok(vec![d.clone()]);
            }
            if let Some(d) = inv.host_by_addr(name) {
                return Ok(vec![d.clone()]);
            }
        }

        // 5./6. literal host:port or bare hostname
        let (host, port) = parse_host_port(name)?;
        Ok(vec![Destination::new(host, port)])
    }

    fn load_inventory(&mut self) -> ModelResult<()> {
        let loc = self
            .overrides
            .inventory
            .clone()
            .or_else(|| self.inventory.clone());
        if let Some(loc) = loc {
            self.inventory_data = Some(Inventory::load(&loc)?);
        }
        Ok(())
    }

    /// Builder for embedders and tests that assemble a playbook without
    /// going through a file.
    pub fn with_inventory(mut self, inv: Inventory) -> Playbook {
        self.inventory_data = Some(inv);
        self
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Playbook {
        self.overrides = overrides;
        self
    }
}

impl SimplePlaybook {
    /// Materialises the simplified form into the full one: a synthetic
    /// `default` task and a `default` target whose hosts come from
    /// `host[:port]` parsing and whose names keep the raw strings for
    /// inventory matching.
    fn materialize(self) -> Playbook {
        let hosts = self
            .targets
            .iter()
            .map(|s| {
                let (host, port) = parse_host_port_lenient(s);
                Destination::new(host, port)
            })
            .collect();
        let target = Target {
            name: DEFAULT_NAME.to_string(),
            hosts,
            names: self.targets.clone(),
            ..Target::default()
        };
        let mut targets = IndexMap::new();
        targets.insert(DEFAULT_NAME.to_string(), target);
        Playbook {
            user: self.user,
            ssh_key: self.ssh_key,
            inventory: self.inventory,
            targets,
            tasks: vec![Task::new(DEFAULT_NAME, self.task)],
            inventory_data: None,
            overrides: Overrides::default(),
        }
    }
}
