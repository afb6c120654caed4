//! On-disk persistence.
//!
//! With `use_bootstraps` enabled and a `base_path` configured, the service
//! persists its bootstrap addresses as a JSON array of `{protocol, uri}`
//! objects and its configuration (including the node identifier, so the
//! identity survives restarts) as a JSON object keyed by the option
//! catalog names. Writes go through a temp file and an atomic rename.

use std::fs;
use std::io::Write;
use std::path::Path;

use brypt_types::{Error, NodeIdentifier, Options, Protocol, RemoteAddress, Result};
use serde::{Deserialize, Serialize};

/// One persisted bootstrap entry.
#[derive(Serialize, Deserialize)]
struct BootstrapEntry {
    protocol: Protocol,
    uri: String,
}

/// The persisted configuration document.
#[derive(Serialize, Deserialize)]
struct ConfigurationDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identifier: Option<NodeIdentifier>,
    #[serde(flatten)]
    options: Options,
}

/// Write `bytes` to `path` atomically via temp-file-and-rename.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or(Error::InvalidConfiguration)?;
    fs::create_dir_all(parent).map_err(|_| Error::InitializationFailure)?;

    let mut temp = path.to_path_buf();
    let file_name = path.file_name().and_then(|name| name.to_str()).unwrap_or("state");
    temp.set_file_name(format!(".{file_name}.tmp"));

    let mut file = fs::File::create(&temp).map_err(|_| Error::InitializationFailure)?;
    file.write_all(bytes).map_err(|_| Error::InitializationFailure)?;
    file.sync_all().map_err(|_| Error::InitializationFailure)?;
    drop(file);

    fs::rename(&temp, path).map_err(|_| Error::InitializationFailure)
}

/// Persist bootstrapable addresses.
///
/// # Errors
///
/// Returns [`Error::InitializationFailure`] on any filesystem fault.
pub fn write_bootstraps(path: &Path, addresses: &[RemoteAddress]) -> Result<()> {
    let entries: Vec<BootstrapEntry> = addresses
        .iter()
        .filter(|address| address.is_bootstrapable())
        .map(|address| BootstrapEntry {
            protocol: address.protocol(),
            uri: address.uri().to_string(),
        })
        .collect();
    let bytes =
        serde_json::to_vec_pretty(&entries).map_err(|_| Error::InvalidConfiguration)?;
    write_atomically(path, &bytes)
}

/// Load previously persisted bootstrap addresses. A missing file is an
/// empty seed list, not an error.
///
/// # Errors
///
/// Returns [`Error::InvalidConfiguration`] when the file exists but does
/// not parse.
pub fn read_bootstraps(path: &Path) -> Result<Vec<RemoteAddress>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path).map_err(|_| Error::InvalidConfiguration)?;
    let entries: Vec<BootstrapEntry> =
        serde_json::from_slice(&bytes).map_err(|_| Error::InvalidConfiguration)?;
    entries
        .into_iter()
        .map(|entry| RemoteAddress::new(entry.protocol, entry.uri, true))
        .collect()
}

/// Persist the configuration and node identifier.
///
/// # Errors
///
/// Returns [`Error::InitializationFailure`] on any filesystem fault.
pub fn write_configuration(
    path: &Path,
    options: &Options,
    identifier: &NodeIdentifier,
) -> Result<()> {
    let document = ConfigurationDocument {
        identifier: Some(*identifier),
        options: options.clone(),
    };
    let bytes =
        serde_json::to_vec_pretty(&document).map_err(|_| Error::InvalidConfiguration)?;
    write_atomically(path, &bytes)
}

/// Load a persisted configuration, if present.
///
/// # Errors
///
/// Returns [`Error::InvalidConfiguration`] when the file exists but does
/// not parse.
pub fn read_configuration(path: &Path) -> Result<Option<(Options, Option<NodeIdentifier>)>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).map_err(|_| Error::InvalidConfiguration)?;
    let document: ConfigurationDocument =
        serde_json::from_slice(&bytes).map_err(|_| Error::InvalidConfiguration)?;
    Ok(Some((document.options, document.identifier)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("brypt-persistence-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&path);
        path
    }

    #[test]
    fn test_bootstraps_round_trip() {
        let dir = temp_dir("bootstraps");
        let path = dir.join("brypt.peers.json");
        let addresses = vec![
            RemoteAddress::new(Protocol::Tcp, "127.0.0.1:35216", true).expect("address"),
            RemoteAddress::new(Protocol::Tcp, "127.0.0.1:35217", false).expect("address"),
        ];

        write_bootstraps(&path, &addresses).expect("write");
        let loaded = read_bootstraps(&path).expect("read");

        // Only the bootstrapable address survives.
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].uri(), "127.0.0.1:35216");
        assert!(loaded[0].is_bootstrapable());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_bootstrap_file_is_empty() {
        let dir = temp_dir("missing");
        let loaded = read_bootstraps(&dir.join("absent.json")).expect("read");
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_configuration_round_trip() {
        let dir = temp_dir("configuration");
        let path = dir.join("brypt.config.json");
        let mut options = Options::default();
        options.network_token = "brypt".to_string();
        let identifier = NodeIdentifier::generate();

        write_configuration(&path, &options, &identifier).expect("write");
        let (loaded, persisted_id) =
            read_configuration(&path).expect("read").expect("present");

        assert_eq!(loaded.network_token, "brypt");
        assert_eq!(persisted_id, Some(identifier));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let dir = temp_dir("corrupt");
        fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("brypt.peers.json");
        fs::write(&path, b"not json").expect("write");
        assert!(read_bootstraps(&path).is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = temp_dir("tempfile");
        let path = dir.join("brypt.peers.json");
        write_bootstraps(&path, &[]).expect("write");
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(&dir);
    }
}
