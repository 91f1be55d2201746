//! Filesystem and binary helpers for the supervised daemon

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{EdgeError, EdgeResult};

/// Check if a binary is available in the system PATH
pub async fn check_binary_available(binary: &str) -> bool {
    if binary.contains('/') {
        return Path::new(binary).exists();
    }
    match Command::new("which").arg(binary).output().await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// Ensure a directory exists, creating it if necessary
pub async fn ensure_directory_exists(path: &Path) -> EdgeResult<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await.map_err(|e| {
            EdgeError::Config(format!("Failed to create directory {:?}: {}", path, e))
        })?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Atomically replace `path` with `content`, readable only as `mode` allows.
///
/// The data goes to a sibling temp file created with `mode` and is renamed
/// into place, so readers never see a partial file or wider permissions.
pub async fn write_with_mode(path: &Path, content: &str, mode: u32) -> EdgeResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_directory_exists(parent).await?;
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| EdgeError::InvalidParameter(format!("{:?} is not a file path", path)))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let written = write_new(&tmp_path, content, mode).await;
    let renamed = match written {
        Ok(()) => tokio::fs::rename(&tmp_path, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = renamed {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(EdgeError::Config(format!("Failed to write {:?}: {}", path, e)));
    }

    debug!("Wrote {:?} with permissions {:o}", path, mode);
    Ok(())
}

async fn write_new(path: &Path, content: &str, mode: u32) -> std::io::Result<()> {
    // A leftover from an interrupted write would keep its old mode
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .await?;
    // The umask may have narrowed the mode further; pin it exactly
    file.set_permissions(std::fs::Permissions::from_mode(mode)).await?;
    file.write_all(content.as_bytes()).await?;
    file.sync_all().await
}
