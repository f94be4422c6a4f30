//! Block device probing.
//!
//! Thin wrappers over lsblk plus pure parsers for its raw output, so the
//! interesting logic stays testable without a disk.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::debug;

/// GPT partition type GUID of the EFI System Partition.
pub const ESP_TYPE_GUID: &str = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exited with status {status}: {stderr}")]
    Failed {
        tool: &'static str,
        status: i32,
        stderr: String,
    },
    #[error("device {0} has no partition label")]
    NoLabel(PathBuf),
    #[error("no EFI system partition found")]
    EspNotFound,
}

fn run_lsblk(args: &[&str]) -> Result<String, ProbeError> {
    let output = Command::new("lsblk")
        .args(args)
        .output()
        .map_err(|source| ProbeError::Spawn { tool: "lsblk", source })?;

    if !output.status.success() {
        return Err(ProbeError::Failed {
            tool: "lsblk",
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// GPT partition label of a device.
pub fn partition_label(device: &Path) -> Result<String, ProbeError> {
    let stdout = run_lsblk(&[
        "-rno",
        "PARTLABEL",
        &device.to_string_lossy(),
    ])?;

    let label = stdout.trim();
    if label.is_empty() {
        return Err(ProbeError::NoLabel(device.to_path_buf()));
    }

    debug!(device = %device.display(), label = %label, "Read partition label");
    Ok(label.to_string())
}

/// Parse `lsblk -rno PATH,PARTTYPE` output into (device, type-guid) pairs.
pub fn parse_parttype_listing(listing: &str) -> Vec<(PathBuf, String)> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let path = fields.next()?;
            let parttype = fields.next()?;
            Some((PathBuf::from(path), parttype.to_ascii_lowercase()))
        })
        .collect()
}

/// Pick the EFI System Partition out of a parttype listing.
pub fn select_esp(listing: &str) -> Option<PathBuf> {
    parse_parttype_listing(listing)
        .into_iter()
        .find(|(_, parttype)| parttype == ESP_TYPE_GUID)
        .map(|(path, _)| path)
}

/// Scan all block devices for the EFI System Partition.
pub fn find_esp_device() -> Result<PathBuf, ProbeError> {
    let listing = run_lsblk(&["-rno", "PATH,PARTTYPE"])?;
    select_esp(&listing).ok_or(ProbeError::EspNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
/dev/vda \n\
/dev/vda1 c12a7328-f81f-11d2-ba4b-00a0c93ec93b\n\
/dev/vda3 5dfbf5f4-2848-4bac-aa5e-0d9a20b745a6\n\
/dev/vda4 3884dd41-8582-4404-b9a8-e9b84f2df50e\n";

    #[test]
    fn test_parse_parttype_listing_skips_bare_disks() {
        let parsed = parse_parttype_listing(LISTING);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].0, PathBuf::from("/dev/vda1"));
    }

    #[test]
    fn test_select_esp_by_type_guid() {
        assert_eq!(select_esp(LISTING), Some(PathBuf::from("/dev/vda1")));
        assert_eq!(select_esp("/dev/vda1 0fc63daf-8483-4772-8e79-3d69d8477de4\n"), None);
    }

    #[test]
    fn test_select_esp_is_case_insensitive() {
        let upper = "/dev/sda1 C12A7328-F81F-11D2-BA4B-00A0C93EC93B\n";
        assert_eq!(select_esp(upper), Some(PathBuf::from("/dev/sda1")));
    }
}
