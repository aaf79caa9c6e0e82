//! User-level key-value configuration, stored as JSON under the global
//! cache directory. `HABITAT_<KEY>` environment variables override reads.

use std::collections::BTreeMap;
use std::path::PathBuf;

pub struct KeyValueStorage {
    file_path: PathBuf,
    data: BTreeMap<String, String>,
}

impl KeyValueStorage {
    pub fn open(file_path: PathBuf) -> Result<Self, std::io::Error> {
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = match std::fs::read_to_string(&file_path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        };
        Ok(Self { file_path, data })
    }

    pub fn set(&mut self, key: String, value: String) -> Result<(), std::io::Error> {
        self.data.insert(key, value);
        self.persist()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let env_key = format!("HABITAT_{}", key.to_uppercase().replace('.', "_"));
        std::env::var(env_key).ok().or_else(|| self.data.get(key).cloned())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.data.iter()
    }

    fn persist(&self) -> Result<(), std::io::Error> {
        let content = serde_json::to_string(&self.data)?;
        std::fs::write(&self.file_path, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("meta/config");
        let mut storage = KeyValueStorage::open(path.clone()).unwrap();
        storage.set("registry.url".to_string(), "https://example.com".to_string()).unwrap();
        drop(storage);

        let storage = KeyValueStorage::open(path).unwrap();
        assert_eq!(storage.get("registry.url").as_deref(), Some("https://example.com"));
        assert_eq!(storage.get("missing"), None);
    }

    #[test]
    fn test_env_overrides_stored_value() {
        let tmp = TempDir::new().unwrap();
        let mut storage = KeyValueStorage::open(tmp.path().join("config")).unwrap();
        storage.set("auth.token".to_string(), "stored".to_string()).unwrap();
        std::env::set_var("HABITAT_AUTH_TOKEN", "from-env");
        assert_eq!(storage.get("auth.token").as_deref(), Some("from-env"));
        std::env::remove_var("HABITAT_AUTH_TOKEN");
    }
}
