mod process;

use std::path::{Path, PathBuf};

use voldrive_shared::errors::{VoldriveError, VoldriveResult};

pub use process::{is_process_alive, kill_process_group};

/// Locate a companion binary.
///
/// Looks beside the current executable, then one level up (test binaries
/// live in `target/<profile>/deps`), then on `PATH`.
pub fn find_binary(name: &str) -> VoldriveResult<PathBuf> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf));

    let mut candidates = Vec::new();
    if let Some(dir) = exe_dir {
        candidates.push(dir.join(name));
        if let Some(up) = dir.parent() {
            candidates.push(up.join(name));
        }
    }
    if let Some(path) = std::env::var_os("PATH") {
        candidates.extend(std::env::split_paths(&path).map(|dir| dir.join(name)));
    }

    candidates
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| VoldriveError::NotFound(format!("binary {} not found", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_binary_missing() {
        let err = find_binary("voldrive-no-such-binary").unwrap_err();
        assert!(matches!(err, VoldriveError::NotFound(_)));
    }

    #[test]
    fn test_find_binary_on_path() {
        assert!(find_binary("sh").is_ok());
    }
}
