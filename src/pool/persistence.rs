// Whole-file JSON persistence for one backend's pool. The file is rewritten
// atomically (temp + rename); a corrupt file degrades to an empty pool.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::models::Account;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolFile {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(rename = "activeIndex", default)]
    pub active_index: usize,
}

pub fn load(path: &Path) -> PoolFile {
    if !path.exists() {
        return PoolFile::default();
    }
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("[W-POOL-READ] failed_to_read_pool_file {:?}: {}", path, e);
            return PoolFile::default();
        }
    };
    match serde_json::from_str::<PoolFile>(&content) {
        Ok(mut file) => {
            if file.active_index >= file.accounts.len() {
                file.active_index = 0;
            }
            file
        }
        Err(e) => {
            warn!(
                "[W-POOL-CORRUPT] pool_file_unreadable_starting_empty {:?}: {}",
                path, e
            );
            PoolFile::default()
        }
    }
}

pub fn save_atomic(path: &Path, file: &PoolFile) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("failed_to_create_state_dir {:?}: {}", parent, e))?;
    }
    let json = serde_json::to_string_pretty(file)
        .map_err(|e| format!("failed_to_serialize_pool_state: {}", e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| format!("failed_to_write_pool_temp: {}", e))?;
    std::fs::rename(&tmp, path).map_err(|e| format!("failed_to_replace_pool_file: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, Credentials};

    fn mk_account(id: &str) -> Account {
        Account::new(
            id.to_string(),
            None,
            Credentials::ApiToken {
                token: "tok".to_string(),
                machine_id: "m1".to_string(),
                ghost_mode: false,
            },
        )
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor-accounts.json");
        let file = PoolFile {
            accounts: vec![mk_account("a"), mk_account("b")],
            active_index: 1,
        };
        save_atomic(&path, &file).unwrap();
        let loaded = load(&path);
        assert_eq!(loaded.accounts.len(), 2);
        assert_eq!(loaded.active_index, 1);
        assert_eq!(loaded.accounts[0].id, "a");
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load(&dir.path().join("nope.json"));
        assert!(loaded.accounts.is_empty());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ this is not json").unwrap();
        let loaded = load(&path);
        assert!(loaded.accounts.is_empty());
    }

    #[test]
    fn out_of_range_cursor_is_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        let file = PoolFile {
            accounts: vec![mk_account("a")],
            active_index: 7,
        };
        save_atomic(&path, &file).unwrap();
        assert_eq!(load(&path).active_index, 0);
    }
}
