//! Two-stage archive signature verification.
//!
//! Trust chain: the root public key is compiled into the binary; the resolve
//! response carries (1) a root-key signature over the per-tenant signing
//! public key and (2) a signing-key signature over the archive bytes. The
//! signing public key itself ships inside the archive. Verification
//! short-circuits on the first failure, in that order.

use std::io::Read;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use flate2::read::GzDecoder;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::sha2::{Digest, Sha256};
use rsa::{Pkcs1v15Sign, RsaPublicKey};

use super::RulesError;

static EMBEDDED_ROOT_PUBLIC_KEY_PEM: &[u8] = include_bytes!("rules_root_public.pem");

/// Read cap for any single file pulled out of the archive.
const ARCHIVE_MEMBER_LIMIT: u64 = 2 << 20;

/// The build-time root public key.
pub fn embedded_root_public_key() -> &'static [u8] {
    EMBEDDED_ROOT_PUBLIC_KEY_PEM
}

/// Verify with the compiled-in root key.
pub fn verify_archive_signature_with_bundled_key(
    cache_root: &Path,
    archive_path: &Path,
    archive_signature_base64: &str,
    signing_public_key_path_in_archive: &str,
    signing_public_key_signature_base64: &str,
) -> Result<(), RulesError> {
    verify_archive_signature(
        cache_root,
        EMBEDDED_ROOT_PUBLIC_KEY_PEM,
        archive_path,
        archive_signature_base64,
        signing_public_key_path_in_archive,
        signing_public_key_signature_base64,
    )
}

/// Verify with an explicit root key (the run controller injects this for
/// tests; production passes the embedded key).
pub fn verify_archive_signature(
    cache_root: &Path,
    root_public_key_pem: &[u8],
    archive_path: &Path,
    archive_signature_base64: &str,
    signing_public_key_path_in_archive: &str,
    signing_public_key_signature_base64: &str,
) -> Result<(), RulesError> {
    if archive_signature_base64.trim().is_empty() {
        return Err(RulesError::MissingArchiveSignature);
    }
    if signing_public_key_path_in_archive.trim().is_empty() {
        return Err(RulesError::MissingSigningKeyPath);
    }
    if signing_public_key_signature_base64.trim().is_empty() {
        return Err(RulesError::MissingSigningKeySignature);
    }

    ensure_root_public_key(cache_root, root_public_key_pem)?;

    let signing_public_key_pem =
        extract_file_from_tar_gz(archive_path, signing_public_key_path_in_archive)?;

    let key_signature = base64::engine::general_purpose::STANDARD
        .decode(signing_public_key_signature_base64.trim())
        .map_err(RulesError::DecodeSigningKeySignature)?;
    verify_signature(root_public_key_pem, &signing_public_key_pem, &key_signature)
        .map_err(RulesError::SigningKeyVerify)?;

    let archive_signature = base64::engine::general_purpose::STANDARD
        .decode(archive_signature_base64.trim())
        .map_err(RulesError::DecodeArchiveSignature)?;
    let archive_bytes = std::fs::read(archive_path).map_err(RulesError::OpenArchive)?;
    verify_signature(&signing_public_key_pem, &archive_bytes, &archive_signature)
        .map_err(RulesError::ArchiveVerify)?;
    Ok(())
}

/// Materialize the root key under the cache root so operators can inspect
/// the trust anchor the binary ships with.
pub fn ensure_root_public_key(
    cache_root: &Path,
    root_public_key_pem: &[u8],
) -> Result<PathBuf, RulesError> {
    if root_public_key_pem.iter().all(u8::is_ascii_whitespace) {
        return Err(RulesError::EmptyRootKey);
    }
    std::fs::create_dir_all(cache_root)?;
    let path = cache_root.join("rules_root_public.pem");
    match std::fs::read(&path) {
        Ok(existing) if existing == root_public_key_pem => return Ok(path),
        _ => {}
    }
    std::fs::write(&path, root_public_key_pem)?;
    Ok(path)
}

fn extract_file_from_tar_gz(archive_path: &Path, target_path: &str) -> Result<Vec<u8>, RulesError> {
    let target = target_path.trim().trim_start_matches('/');
    if target.is_empty() {
        return Err(RulesError::InvalidSigningKeyPath);
    }

    let file = std::fs::File::open(archive_path).map_err(RulesError::OpenArchive)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries().map_err(RulesError::ReadArchive)? {
        let mut entry = entry.map_err(RulesError::ReadArchive)?;
        let name = entry
            .path()
            .map_err(RulesError::ReadArchive)?
            .to_string_lossy()
            .trim()
            .trim_start_matches('/')
            .to_string();
        if name != target {
            continue;
        }
        if entry.header().entry_type().is_dir() {
            return Err(RulesError::SigningKeyNotFile(target_path.to_string()));
        }
        let mut content = Vec::new();
        entry
            .by_ref()
            .take(ARCHIVE_MEMBER_LIMIT)
            .read_to_end(&mut content)
            .map_err(RulesError::ReadArchive)?;
        if content.iter().all(u8::is_ascii_whitespace) {
            return Err(RulesError::SigningKeyEmpty(target_path.to_string()));
        }
        return Ok(content);
    }
    Err(RulesError::SigningKeyNotFound(target_path.to_string()))
}

fn parse_rsa_public_key(public_key_pem: &[u8]) -> Result<RsaPublicKey, RulesError> {
    let text = std::str::from_utf8(public_key_pem).map_err(|_| RulesError::InvalidPem)?;
    if text.contains("-----BEGIN RSA PUBLIC KEY-----") {
        RsaPublicKey::from_pkcs1_pem(text).map_err(|e| RulesError::ParseKey(e.to_string()))
    } else if text.contains("-----BEGIN PUBLIC KEY-----") {
        RsaPublicKey::from_public_key_pem(text).map_err(|e| RulesError::ParseKey(e.to_string()))
    } else {
        Err(RulesError::UnsupportedKeyType)
    }
}

/// RSA PKCS#1 v1.5 over SHA-256.
fn verify_signature(public_key_pem: &[u8], payload: &[u8], signature: &[u8]) -> Result<(), String> {
    let key = parse_rsa_public_key(public_key_pem).map_err(|e| e.to_string())?;
    let digest = Sha256::digest(payload);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::RsaPrivateKey;

    const ROOT_PRIVATE_PEM: &str = include_str!("../../tests/fixtures/root_private.pem");
    const SIGNING_PRIVATE_PEM: &str = include_str!("../../tests/fixtures/signing_private.pem");

    fn root_key() -> RsaPrivateKey {
        RsaPrivateKey::from_pkcs8_pem(ROOT_PRIVATE_PEM).expect("root fixture")
    }

    fn signing_key() -> RsaPrivateKey {
        RsaPrivateKey::from_pkcs8_pem(SIGNING_PRIVATE_PEM).expect("signing fixture")
    }

    fn public_pem(key: &RsaPrivateKey) -> Vec<u8> {
        RsaPublicKey::from(key)
            .to_public_key_pem(LineEnding::LF)
            .expect("pem encode")
            .into_bytes()
    }

    fn sign(key: &RsaPrivateKey, payload: &[u8]) -> Vec<u8> {
        let digest = Sha256::digest(payload);
        key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).expect("sign")
    }

    fn b64(data: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(data)
    }

    fn write_archive(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join("rules.tar.gz");
        let file = std::fs::File::create(&path).unwrap();
        let gz = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(gz);
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    #[test]
    fn ensure_root_public_key_materializes_embedded_pem() {
        let cache = tempfile::tempdir().unwrap();
        let path = ensure_root_public_key(cache.path(), embedded_root_public_key()).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), embedded_root_public_key());
        let again = ensure_root_public_key(cache.path(), embedded_root_public_key()).unwrap();
        assert_eq!(path, again);

        let err = ensure_root_public_key(cache.path(), b"  \n").unwrap_err();
        assert!(matches!(err, RulesError::EmptyRootKey));
    }

    #[test]
    fn extracts_named_member() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(dir.path(), "tenant/pub.pem", b"PEM");
        assert_eq!(extract_file_from_tar_gz(&archive, "tenant/pub.pem").unwrap(), b"PEM");
        assert_eq!(extract_file_from_tar_gz(&archive, "/tenant/pub.pem").unwrap(), b"PEM");

        assert!(matches!(
            extract_file_from_tar_gz(&archive, ""),
            Err(RulesError::InvalidSigningKeyPath)
        ));
        assert!(matches!(
            extract_file_from_tar_gz(&archive, "tenant/notfound.pem"),
            Err(RulesError::SigningKeyNotFound(_))
        ));

        let empty_dir = dir.path().join("e");
        std::fs::create_dir_all(&empty_dir).unwrap();
        let empty = write_archive(&empty_dir, "tenant/empty.pem", b"   \n\t");
        assert!(matches!(
            extract_file_from_tar_gz(&empty, "tenant/empty.pem"),
            Err(RulesError::SigningKeyEmpty(_))
        ));
    }

    #[test]
    fn full_chain_verifies_and_each_stage_fails_distinctly() {
        let work = tempfile::tempdir().unwrap();
        let cache = work.path().join("cache");
        let root = root_key();
        let signing = signing_key();
        let root_pub = public_pem(&root);
        let signing_pub = public_pem(&signing);

        let archive = write_archive(work.path(), "tenant/keys/signing_public.pem", &signing_pub);
        let archive_bytes = std::fs::read(&archive).unwrap();

        let key_sig = b64(&sign(&root, &signing_pub));
        let archive_sig = b64(&sign(&signing, &archive_bytes));

        verify_archive_signature(
            &cache,
            &root_pub,
            &archive,
            &archive_sig,
            "tenant/keys/signing_public.pem",
            &key_sig,
        )
        .expect("chain verifies");

        // Corrupt the root-signed key signature: the first verify stage fails.
        let bad_key_sig = b64(&sign(&signing, &signing_pub));
        let err = verify_archive_signature(
            &cache,
            &root_pub,
            &archive,
            &archive_sig,
            "tenant/keys/signing_public.pem",
            &bad_key_sig,
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("规则签名公钥验签失败"), "{err}");

        // Corrupt the archive signature: the second stage fails.
        let bad_archive_sig = b64(&sign(&signing, b"other bytes"));
        let err = verify_archive_signature(
            &cache,
            &root_pub,
            &archive,
            &bad_archive_sig,
            "tenant/keys/signing_public.pem",
            &key_sig,
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("规则包验签失败"), "{err}");
    }

    #[test]
    fn missing_fields_fail_fast_with_distinct_errors() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("x.tar.gz");

        let err = verify_archive_signature_with_bundled_key(dir.path(), &archive, "", "a.pem", "sig")
            .unwrap_err();
        assert!(matches!(err, RulesError::MissingArchiveSignature));

        let err = verify_archive_signature_with_bundled_key(dir.path(), &archive, "abc", "", "sig")
            .unwrap_err();
        assert!(matches!(err, RulesError::MissingSigningKeyPath));

        let err = verify_archive_signature_with_bundled_key(dir.path(), &archive, "abc", "a.pem", "")
            .unwrap_err();
        assert!(matches!(err, RulesError::MissingSigningKeySignature));
    }

    #[test]
    fn accepts_pkcs1_and_pkix_pems_rejects_others() {
        let signing = signing_key();
        let public = RsaPublicKey::from(&signing);

        let pkix = public.to_public_key_pem(LineEnding::LF).unwrap();
        assert!(parse_rsa_public_key(pkix.as_bytes()).is_ok());

        let pkcs1 = public.to_pkcs1_pem(LineEnding::LF).unwrap();
        assert!(parse_rsa_public_key(pkcs1.as_bytes()).is_ok());

        assert!(matches!(
            parse_rsa_public_key(b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n"),
            Err(RulesError::UnsupportedKeyType)
        ));
        assert!(matches!(
            parse_rsa_public_key(&[0xff, 0xfe]),
            Err(RulesError::InvalidPem)
        ));
    }
}
