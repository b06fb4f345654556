// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Run directory layout: socket path derivation and directory creation.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const SOCKET_EXTENSION: &str = "sock";
pub const PID_EXTENSION: &str = "pid";

/// Conservative bound below the smallest `sun_path` we target (104 on macOS).
const MAX_SOCKET_PATH: usize = 100;

/// Map a supervisor name to a filesystem-safe key.
pub fn sanitize_key(name: &str) -> String {
    let key: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let key = key.trim_start_matches('.');
    if key.is_empty() {
        "herd".to_string()
    } else {
        key.to_string()
    }
}

/// Control socket path for a key. Falls back to a hashed file name when the
/// readable one would not fit in a Unix socket address.
pub fn socket_path(run_dir: &Path, key: &str) -> PathBuf {
    let readable = run_dir.join(format!("{}.{}", key, SOCKET_EXTENSION));
    if readable.as_os_str().len() <= MAX_SOCKET_PATH {
        return readable;
    }
    let digest = Sha256::digest(key.as_bytes());
    let short = hex::encode(&digest[..8]);
    run_dir.join(format!("herd-{}.{}", short, SOCKET_EXTENSION))
}

/// Create the run directory, owner-only on Unix.
pub fn ensure_run_dir(run_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(run_dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(run_dir, std::fs::Permissions::from_mode(0o700));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("hello"), "hello");
        assert_eq!(sanitize_key("my app/v2"), "my_app_v2");
        assert_eq!(sanitize_key("..hidden"), "hidden");
        assert_eq!(sanitize_key(""), "herd");
    }

    #[test]
    fn test_socket_path_is_readable_when_short() {
        let path = socket_path(Path::new("/tmp/run"), "hello");
        assert_eq!(path, PathBuf::from("/tmp/run/hello.sock"));
    }

    #[test]
    fn test_socket_path_hashes_long_keys() {
        let key = "k".repeat(200);
        let path = socket_path(Path::new("/tmp/run"), &key);
        assert!(path.as_os_str().len() <= MAX_SOCKET_PATH);
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("herd-"));
        assert_eq!(path, socket_path(Path::new("/tmp/run"), &key));
    }
}
