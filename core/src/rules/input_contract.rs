//! The one field the core reads from the rules archive:
//! `file_discovery.marker` inside `tenant/rules/input.yaml`.

use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use serde::Deserialize;

use super::RulesError;

const INPUT_CONTRACT_PATH_IN_ARCHIVE: &str = "tenant/rules/input.yaml";
const INPUT_CONTRACT_READ_LIMIT: u64 = 2 << 20;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InputContractDoc {
    file_discovery: FileDiscovery,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileDiscovery {
    marker: String,
}

/// Stream the archive until `input.yaml` shows up and return its trimmed
/// `file_discovery.marker`. Missing file or blank marker is fatal.
pub fn load_input_marker_from_archive(archive_path: &Path) -> Result<String, RulesError> {
    let file = std::fs::File::open(archive_path).map_err(RulesError::OpenArchive)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries().map_err(RulesError::ReadArchive)? {
        let mut entry = entry.map_err(RulesError::ReadArchive)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .map_err(RulesError::ReadArchive)?
            .to_string_lossy()
            .trim()
            .to_string();
        if name != INPUT_CONTRACT_PATH_IN_ARCHIVE {
            continue;
        }
        let mut raw = Vec::new();
        entry
            .by_ref()
            .take(INPUT_CONTRACT_READ_LIMIT)
            .read_to_end(&mut raw)
            .map_err(RulesError::ReadArchive)?;
        let doc: InputContractDoc = serde_yaml::from_slice(&raw)?;
        let marker = doc.file_discovery.marker.trim().to_string();
        if marker.is_empty() {
            return Err(RulesError::MissingMarker);
        }
        return Ok(marker);
    }
    Err(RulesError::MissingInputContract(
        INPUT_CONTRACT_PATH_IN_ARCHIVE.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::path::PathBuf;

    fn write_archive(dir: &Path, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("rules.tar.gz");
        let file = std::fs::File::create(&path).unwrap();
        let gz = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, *name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    #[test]
    fn reads_marker() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(
            dir.path(),
            &[(
                "tenant/rules/input.yaml",
                b"file_discovery:\n  marker: \"===Listing Requirements===\"\n".as_slice(),
            )],
        );
        assert_eq!(
            load_input_marker_from_archive(&archive).unwrap(),
            "===Listing Requirements==="
        );
    }

    #[test]
    fn blank_marker_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(
            dir.path(),
            &[(
                "tenant/rules/input.yaml",
                b"file_discovery:\n  marker: \"  \"\n".as_slice(),
            )],
        );
        assert!(matches!(
            load_input_marker_from_archive(&archive),
            Err(RulesError::MissingMarker)
        ));
    }

    #[test]
    fn missing_contract_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(
            dir.path(),
            &[("tenant/rules/other.yaml", b"x: 1\n".as_slice())],
        );
        assert!(matches!(
            load_input_marker_from_archive(&archive),
            Err(RulesError::MissingInputContract(_))
        ));
    }
}
