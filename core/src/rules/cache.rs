//! On-disk cache: `<cacheRoot>/<tenantId>/{current.json, <version>/rules.tar.gz}`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::RulesError;

/// Pointer to the active archive for one tenant. Written atomically
/// (temp file + rename) so a crash mid-update never leaves a torn state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheState {
    pub rules_version: String,
    pub manifest_sha256: String,
    pub archive_path: PathBuf,
}

/// Tenant ids become path segments; reject anything that could escape the
/// cache partition. Checked before any filesystem access.
pub fn sanitize_tenant_id(tenant_id: &str) -> Result<&str, RulesError> {
    let id = tenant_id.trim();
    if id.is_empty() {
        return Err(RulesError::TenantEmpty);
    }
    if id.contains('/') || id.contains('\\') || id.contains("..") {
        return Err(RulesError::TenantInvalid);
    }
    Ok(id)
}

fn tenant_dir(cache_root: &Path, tenant_id: &str) -> Result<PathBuf, RulesError> {
    Ok(cache_root.join(sanitize_tenant_id(tenant_id)?))
}

fn state_file(cache_root: &Path, tenant_id: &str) -> Result<PathBuf, RulesError> {
    Ok(tenant_dir(cache_root, tenant_id)?.join("current.json"))
}

/// Missing state is an empty state, not an error.
pub fn load_state(cache_root: &Path, tenant_id: &str) -> Result<CacheState, RulesError> {
    let path = state_file(cache_root, tenant_id)?;
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CacheState::default()),
        Err(e) => return Err(RulesError::Store(e)),
    };
    Ok(serde_json::from_slice(&raw)?)
}

pub fn save_state(cache_root: &Path, tenant_id: &str, state: &CacheState) -> Result<(), RulesError> {
    let dir = tenant_dir(cache_root, tenant_id)?;
    std::fs::create_dir_all(&dir)?;
    let path = state_file(cache_root, tenant_id)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

pub fn save_archive(
    cache_root: &Path,
    tenant_id: &str,
    version: &str,
    data: &[u8],
) -> Result<PathBuf, RulesError> {
    let dir = tenant_dir(cache_root, tenant_id)?.join(version);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("rules.tar.gz");
    std::fs::write(&path, data)?;
    Ok(path)
}

pub fn has_archive(path: &Path) -> bool {
    if path.as_os_str().is_empty() {
        return false;
    }
    path.is_file()
}

/// Drop everything cached for one tenant.
pub fn clear(cache_root: &Path, tenant_id: &str) -> Result<(), RulesError> {
    let dir = tenant_dir(cache_root, tenant_id)?;
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RulesError::Store(e)),
    }
}
