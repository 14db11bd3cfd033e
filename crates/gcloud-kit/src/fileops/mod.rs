//! Local file helpers for credential and download handling.

use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::Result;

pub mod lock;

/// Create `path` and missing parents with mode 0o700 on Unix.
///
/// Existing directories keep their permissions.
pub fn create_private_dir(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() || path.exists() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)?;
    Ok(())
}

/// Write `content` to a sibling temp file, set `mode`, then rename over
/// `path`. Readers see either the old or the new content, never a partial
/// write.
pub fn write_atomic(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_private_dir(parent)?;
    }
    let tmp = temp_sibling(path);
    fs::write(&tmp, content)?;
    if let Err(e) = set_permissions(&tmp, mode).and_then(|_| Ok(fs::rename(&tmp, path)?)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// `<name>.<pid>.tmp` beside `path`.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

/// Set file permissions on Unix (mode bits such as 0o600).
///
/// On non-Unix platforms this is a no-op.
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
pub fn set_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
