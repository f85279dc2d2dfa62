//! Per-tenant rules archive store and trust chain.
//!
//! The service publishes a signed, versioned `rules.tar.gz`. Each tenant
//! keeps at most one active version on disk plus a `current.json` state
//! pointer. Trust is two-stage: a root public key embedded in the binary
//! signs the per-tenant signing key, which is shipped inside the archive and
//! in turn signs the archive bytes.

mod cache;
mod input_contract;
mod verify;

use std::path::PathBuf;

use thiserror::Error;

pub use cache::{
    clear, has_archive, load_state, sanitize_tenant_id, save_archive, save_state, CacheState,
};
pub use input_contract::load_input_marker_from_archive;
pub use verify::{
    embedded_root_public_key, ensure_root_public_key, verify_archive_signature,
    verify_archive_signature_with_bundled_key,
};

pub const APP_NAME: &str = "syl-listing-pro";

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("tenant_id 不能为空")]
    TenantEmpty,
    #[error("tenant_id 非法")]
    TenantInvalid,
    #[error("读取规则缓存目录失败")]
    NoCacheDir,
    #[error("规则缓存读写失败: {0}")]
    Store(#[from] std::io::Error),
    #[error("解析规则缓存状态失败: {0}")]
    StateDecode(#[from] serde_json::Error),

    #[error("规则签名缺失")]
    MissingArchiveSignature,
    #[error("规则签名公钥路径缺失")]
    MissingSigningKeyPath,
    #[error("规则签名公钥签名缺失")]
    MissingSigningKeySignature,
    #[error("内置根公钥为空")]
    EmptyRootKey,
    #[error("解析签名公钥签名失败: {0}")]
    DecodeSigningKeySignature(base64::DecodeError),
    #[error("解析规则包签名失败: {0}")]
    DecodeArchiveSignature(base64::DecodeError),
    #[error("规则签名公钥验签失败: {0}")]
    SigningKeyVerify(String),
    #[error("规则包验签失败: {0}")]
    ArchiveVerify(String),

    #[error("打开规则包失败: {0}")]
    OpenArchive(std::io::Error),
    #[error("读取规则包内容失败: {0}")]
    ReadArchive(std::io::Error),
    #[error("规则签名公钥路径无效")]
    InvalidSigningKeyPath,
    #[error("规则签名公钥路径不是文件: {0}")]
    SigningKeyNotFile(String),
    #[error("规则签名公钥为空: {0}")]
    SigningKeyEmpty(String),
    #[error("规则包内未找到签名公钥: {0}")]
    SigningKeyNotFound(String),
    #[error("无效 PEM 公钥")]
    InvalidPem,
    #[error("不支持的公钥类型")]
    UnsupportedKeyType,
    #[error("解析公钥失败: {0}")]
    ParseKey(String),

    #[error("规则包缺少 {0}")]
    MissingInputContract(String),
    #[error("解析 input.yaml 失败: {0}")]
    InputContractDecode(#[from] serde_yaml::Error),
    #[error("input.yaml 缺少 file_discovery.marker")]
    MissingMarker,
}

/// Platform cache root for rules archives, falling back to a dotdir under
/// the home directory when the platform has no cache location.
pub fn default_cache_dir() -> Result<PathBuf, RulesError> {
    if let Some(cache) = dirs::cache_dir() {
        return Ok(cache.join(APP_NAME).join("rules"));
    }
    let home = dirs::home_dir().ok_or(RulesError::NoCacheDir)?;
    Ok(home.join(format!(".{APP_NAME}")).join(".rules"))
}
