use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::target::DEFAULT_SSH_PORT;
use crate::{Destination, ModelError, ModelResult};

pub const ALL_GROUP: &str = "all";

/// External host inventory: named groups plus a flat host list. A
/// synthetic `all` group holding the union of everything is computed on
/// load; providing one in the input is an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inventory {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub groups: IndexMap<String, Vec<Destination>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<Destination>,
}

impl Inventory {
    pub fn load(path: &Path) -> ModelResult<Inventory> {
        let data = fs::read_to_string(path).map_err(|e| ModelError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let is_toml = path.extension().map(|e| e == "toml").unwrap_or(false);
        Inventory::from_str(&data, is_toml).map_err(|e| match e {
            ModelError::InventoryLoad { detail, .. } | ModelError::PlaybookParse { detail, .. } => {
                ModelError::InventoryLoad {
                    path: path.to_path_buf(),
                    detail,
                }
            }
            other => other,
        })
    }

    pub fn from_str(data: &str, is_toml: bool) -> ModelResult<Inventory> {
        let inv: Inventory = if is_toml {
            toml::from_str(data).map_err(|e| ModelError::InventoryLoad {
                path: Default::default(),
                detail: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(data).map_err(|e| ModelError::InventoryLoad {
                path: Default::default(),
                detail: e.to_string(),
            })?
        };
        inv.finalize()
    }

    /// Applies port defaults and computes the `all` group.
    fn finalize(mut self) -> ModelResult<Inventory> {
        if self.groups.contains_key(ALL_GROUP) {
            return Err(ModelError::InventoryLoad {
                path: Default::default(),
                detail: format!("group {:?} is reserved", ALL_GROUP),
            });
        }

        for dests in self.groups.values_mut() {
            for d in dests.iter_mut() {
                if d.port == 0 {
                    d.port = DEFAULT_SSH_PORT;
                }
            }
        }
        for d in self.hosts.iter_mut() {
            if d.port == 0 {
                d.port = DEFAULT_SSH_PORT;
            }
        }

        let mut all: Vec<Destination> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for dests in self.groups.values() {
            for d in dests {
                if seen.insert(d.identity()) {
                    all.push(d.clone());
                }
            }
        }
        for d in &self.hosts {
            if seen.insert(d.identity()) {
                all.push(d.clone());
            }
        }
        all.sort_by(|a, b| a.host.cmp(&b.host));
        self.groups.insert(ALL_GROUP.to_string(), all);
        Ok(self)
    }

    pub fn all(&self) -> &[Destination] {
        self.groups
            .get(ALL_GROUP)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn group(&self, name: &str) -> Option<&[Destination]> {
        self.groups.get(name).map(|v| v.as_slice())
    }

    /// Case-insensitive lookup by inventory name.
    pub fn host_by_name(&self, name: &str) -> Option<&Destination> {
        self.all()
            .iter()
            .find(|d| !d.name.is_empty() && d.name.eq_ignore_ascii_case(name))
    }

    pub fn host_by_addr(&self, host: &str) -> Option<&Destination> {
        self.all().iter().find(|d| d.host == host)
    }

    /// All hosts carrying any of the given tags.
    pub fn hosts_with_tag(&self, tag: &str) -> Vec<&Destination> {
        self.all().iter().filter(|d| d.has_tag(tag)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    const YAML_INV: &str = indoc! {"
        groups:
          web:
            - {host: web2.example.com, name: web2}
            - {host: web1.example.com, name: web1, port: 2222}
          db:
            - {host: db1.example.com, name: db1, tags: [primary]}
        hosts:
          - {host: bastion.example.com, user: ops}
    "};

    #[test]
    fn all_group_is_union_sorted_by_host() {
        let inv = Inventory::from_str(YAML_INV, false).unwrap();
        let hosts: Vec<&str> = inv.all().iter().map(|d| d.host.as_str()).collect();
        assert_eq!(
            hosts,
            vec![
                "bastion.example.com",
                "db1.example.com",
                "web1.example.com",
                "web2.example.com"
            ]
        );
    }

    #[test]
    fn ports_defaulted_on_load() {
        let inv = Inventory::from_str(YAML_INV, false).unwrap();
        let web2 = inv.host_by_name("WEB2").unwrap();
        assert_eq!(web2.port, 22);
        let web1 = inv.host_by_name("web1").unwrap();
        assert_eq!(web1.port, 2222);
    }

    #[test]
    fn explicit_all_group_rejected() {
        let res = Inventory::from_str("groups:\n  all:\n    - {host: h}\n", false);
        assert!(res.is_err());
    }

    #[test]
    fn tag_lookup() {
        let inv = Inventory::from_str(YAML_INV, false).unwrap();
        let tagged = inv.hosts_with_tag("primary");
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].name, "db1");
    }

    #[test]
    fn toml_form_parses() {
        let inv = Inventory::from_str(
            indoc! {r#"
                [[groups.web]]
                host = "web1.example.com"

                [[hosts]]
                host = "solo.example.com"
                port = 2222
            "#},
            true,
        )
        .unwrap();
        assert_eq!(inv.all().len(), 2);
        assert_eq!(inv.host_by_addr("solo.example.com").unwrap().port, 2222);
    }

    #[test]
    fn union_dedups_shared_hosts() {
        let inv = Inventory::from_str(
            indoc! {"
                groups:
                  a:
                    - {host: h1}
                  b:
                    - {host: h1}
                    - {host: h2}
            "},
            false,
        )
        .unwrap();
        assert_eq!(inv.all().len(), 2);
    }
}
