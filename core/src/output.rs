//! Unique output naming: `<base>_<id>_en.md` / `<base>_<id>_cn.md` pairs.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use rand::rngs::OsRng;
use rand::Rng;

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const ID_LENGTH: usize = 4;
const MAX_DRAWS: usize = 200;

fn random_id(n: usize) -> String {
    let mut rng = OsRng;
    (0..n)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn output_base_name(input_path: &Path) -> String {
    let base = input_path
        .file_stem()
        .map(|s| s.to_string_lossy().trim().to_string())
        .unwrap_or_default();
    if base.is_empty() || base == "." {
        "listing".to_string()
    } else {
        base
    }
}

/// Claim a `(id, enPath, cnPath)` triple under `out_dir`. Redraws the id on
/// any stat hit; gives up after 200 collisions.
pub fn unique_pair(out_dir: &Path, input_path: &Path) -> Result<(String, PathBuf, PathBuf)> {
    std::fs::create_dir_all(out_dir)?;
    let base = output_base_name(input_path);
    for _ in 0..MAX_DRAWS {
        let id = random_id(ID_LENGTH);
        let en = out_dir.join(format!("{base}_{id}_en.md"));
        let cn = out_dir.join(format!("{base}_{id}_cn.md"));
        if en.exists() || cn.exists() {
            continue;
        }
        return Ok((id, en, cn));
    }
    bail!("生成唯一文件名失败")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    #[test]
    fn pair_uses_input_stem_and_four_char_id() {
        let dir = tempfile::tempdir().unwrap();
        let (id, en, cn) = unique_pair(dir.path(), Path::new("inputs/req.md")).unwrap();
        assert_eq!(id.len(), 4);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(en, dir.path().join(format!("req_{id}_en.md")));
        assert_eq!(cn, dir.path().join(format!("req_{id}_cn.md")));
    }

    #[test]
    fn falls_back_to_listing_for_odd_inputs() {
        assert_eq!(output_base_name(Path::new("")), "listing");
        assert_eq!(output_base_name(Path::new(".")), "listing");
        assert_eq!(output_base_name(Path::new("dir/.hidden")), ".hidden");
        assert_eq!(output_base_name(Path::new("a/b/name.tar.md")), "name.tar");
    }

    #[test]
    fn creates_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("out/deep");
        unique_pair(&nested, Path::new("req.md")).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn skips_existing_pairs() {
        let dir = tempfile::tempdir().unwrap();
        // Occupy a pair, then ask again; the second draw must not collide.
        let (id1, en1, cn1) = unique_pair(dir.path(), Path::new("req.md")).unwrap();
        std::fs::write(&en1, "x").unwrap();
        std::fs::write(&cn1, "x").unwrap();
        let (id2, en2, _) = unique_pair(dir.path(), Path::new("req.md")).unwrap();
        assert_ne!(id1, id2);
        assert_ne!(en1, en2);
    }

    #[test]
    fn concurrent_callers_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let out = dir.path().to_path_buf();
            handles.push(std::thread::spawn(move || {
                let (_, en, cn) = unique_pair(&out, Path::new("req.md")).unwrap();
                std::fs::write(&en, "en").unwrap();
                std::fs::write(&cn, "cn").unwrap();
                (en, cn)
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            let (en, cn) = handle.join().unwrap();
            assert!(seen.insert(en), "en path collision");
            assert!(seen.insert(cn), "cn path collision");
        }
    }
}
