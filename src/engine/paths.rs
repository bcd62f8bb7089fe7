// Fractal Memory Engine — On-disk layout
//
//   <root>/memory.sqlite3        — memory table shared by every agent
//   <root>/<agent_id>/fmm.json   — one fractal tree per agent

use crate::atoms::constants::{DB_FILE_NAME, ENV_HOME, FRACTAL_FILE_NAME};
use crate::engine::config::MemoryConfig;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Resolve the memory root: explicit config, then FMEM_HOME, then the
/// platform data dir, then `./state`.
pub fn memory_root(config: &MemoryConfig) -> PathBuf {
    if let Some(root) = &config.store.root {
        return root.clone();
    }
    if let Ok(home) = std::env::var(ENV_HOME) {
        if !home.trim().is_empty() {
            return PathBuf::from(home);
        }
    }
    dirs::data_dir()
        .map(|d| d.join("fractal-memory"))
        .unwrap_or_else(|| PathBuf::from("state"))
}

pub fn db_path(root: &Path) -> PathBuf {
    root.join(DB_FILE_NAME)
}

pub fn agent_dir(root: &Path, agent_id: &str) -> PathBuf {
    root.join(agent_dir_name(agent_id))
}

pub fn fractal_path(root: &Path, agent_id: &str) -> PathBuf {
    agent_dir(root, agent_id).join(FRACTAL_FILE_NAME)
}

/// Agent ids become directory names, one path component each, and distinct
/// ids never share a directory. Ids made only of lowercase ASCII letters,
/// digits, `-`, `_` and `.` are used as-is. Anything else keeps a cleaned
/// prefix plus `~` and a SHA-256 tag of the raw id; `~` never appears in an
/// as-is name.
fn agent_dir_name(agent_id: &str) -> String {
    let plain = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.');
    if !agent_id.is_empty() && agent_id.chars().all(plain) && !agent_id.chars().all(|c| c == '.') {
        return agent_id.to_string();
    }
    let prefix: String = agent_id
        .chars()
        .take(48)
        .map(|c| if plain(c) { c } else { '_' })
        .collect();
    let digest = format!("{:x}", Sha256::digest(agent_id.as_bytes()));
    format!("{}~{}", prefix.trim_matches('.'), &digest[..16])
}
