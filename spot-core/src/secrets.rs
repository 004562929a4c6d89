use indexmap::IndexMap;
use thiserror::Error;

use spot_model::Playbook;

#[derive(Debug, Error)]
#[error("secret {key:?}: {detail}")]
pub struct SecretError {
    pub key: String,
    pub detail: String,
}

impl SecretError {
    pub fn new<K: Into<String>, D: Into<String>>(key: K, detail: D) -> SecretError {
        SecretError {
            key: key.into(),
            detail: detail.into(),
        }
    }
}

/// Backend boundary: anything able to answer `get(key)` can provide
/// secrets. Full-blown providers live outside the core.
pub trait SecretProvider: Send + Sync {
    fn get(&self, key: &str) -> Result<String, SecretError>;
}

/// Provider used when no backend is configured; any lookup fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecrets;

impl SecretProvider for NoSecrets {
    fn get(&self, key: &str) -> Result<String, SecretError> {
        Err(SecretError::new(key, "no secrets provider configured"))
    }
}

/// Minimal provider mapping key `K` to the `SPOT_SECRET_K` process
/// environment variable.
#[derive(Debug, Clone, Default)]
pub struct EnvSecrets;

pub const ENV_SECRET_PREFIX: &str = "SPOT_SECRET_";

impl SecretProvider for EnvSecrets {
    fn get(&self, key: &str) -> Result<String, SecretError> {
        std::env::var(format!("{}{}", ENV_SECRET_PREFIX, key))
            .map_err(|_| SecretError::new(key, format!("{}{} not set", ENV_SECRET_PREFIX, key)))
    }
}

/// Resolves every secret key referenced by the playbook. A missing key
/// fails the load; the resulting map seeds both the masking list and
/// the substitution environment.
pub fn collect_secrets(
    playbook: &Playbook,
    provider: &dyn SecretProvider,
) -> Result<IndexMap<String, String>, SecretError> {
    let mut map = IndexMap::new();
    for key in playbook.all_secret_keys() {
        let value = provider.get(&key)?;
        map.insert(key, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    struct MapProvider(IndexMap<String, String>);

    impl SecretProvider for MapProvider {
        fn get(&self, key: &str) -> Result<String, SecretError> {
            self.0
                .get(key)
                .cloned()
                .ok_or_else(|| SecretError::new(key, "not found"))
        }
    }

    fn playbook() -> Playbook {
        Playbook::from_str(
            indoc! {"
                tasks:
                  - name: t
                    commands:
                      - script: echo
                        secrets: [API_KEY]
                      - script: echo
                        options: {sudo: true, sudo_password: ROOT_PASS}
            "},
            false,
        )
        .unwrap()
    }

    #[test]
    fn collects_referenced_secrets() {
        let mut vals = IndexMap::new();
        vals.insert("API_KEY".to_string(), "k1".to_string());
        vals.insert("ROOT_PASS".to_string(), "p1".to_string());
        let map = collect_secrets(&playbook(), &MapProvider(vals)).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("API_KEY").map(String::as_str), Some("k1"));
    }

    #[test]
    fn missing_secret_fails() {
        let res = collect_secrets(&playbook(), &MapProvider(IndexMap::new()));
        assert!(res.is_err());
    }

    #[test]
    fn no_provider_errors_on_lookup() {
        assert!(NoSecrets.get("X").is_err());
    }
}
