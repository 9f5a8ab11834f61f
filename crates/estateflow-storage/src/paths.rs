//! Data directory resolution.

use anyhow::Result;
use std::path::PathBuf;

const ESTATEFLOW_DIR: &str = ".estateflow";
const DB_FILE: &str = "estateflow.db";
const LOGS_DIR: &str = "logs";

/// Environment variable to override the EstateFlow directory.
pub const ESTATEFLOW_DIR_ENV: &str = "ESTATEFLOW_DIR";

/// Resolve the EstateFlow data directory.
/// Priority: ESTATEFLOW_DIR env var > ~/.estateflow/
pub fn resolve_data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ESTATEFLOW_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|h| h.join(ESTATEFLOW_DIR))
        .ok_or_else(|| anyhow::anyhow!("Failed to determine home directory"))
}

/// Ensure the data directory exists and return its path.
pub fn ensure_data_dir() -> Result<PathBuf> {
    let dir = resolve_data_dir()?;
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Database file inside `data_dir`.
pub fn database_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join(DB_FILE)
}

/// Log directory inside `data_dir`, created on demand.
pub fn ensure_logs_dir(data_dir: &std::path::Path) -> Result<PathBuf> {
    let dir = data_dir.join(LOGS_DIR);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
