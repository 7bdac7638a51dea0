//! Filesystem root confinement. When a root directory is configured, every
//! script-supplied path must stay inside it: absolute paths and any path
//! containing a parent-directory component are rejected before the
//! filesystem is touched.

use std::path::{Component, Path, PathBuf};

/// Maps a script-supplied file name to the real path to open, or an error
/// reason suitable for a `(nil, message)` pair.
pub fn resolve(root: Option<&Path>, name: &str) -> Result<PathBuf, String> {
    let Some(root) = root else {
        return Ok(PathBuf::from(name));
    };
    let path = Path::new(name);
    if path.is_absolute() {
        return Err("absolute paths are not allowed".into());
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err("path escapes the configured root".into());
    }
    Ok(root.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_without_a_root() {
        assert_eq!(resolve(None, "/etc/passwd").unwrap(), Path::new("/etc/passwd"));
        assert_eq!(resolve(None, "../up.lua").unwrap(), Path::new("../up.lua"));
    }

    #[test]
    fn relative_paths_are_joined_to_the_root() {
        let root = Path::new("/srv/scripts");
        assert_eq!(
            resolve(Some(root), "lib/util.lua").unwrap(),
            Path::new("/srv/scripts/lib/util.lua")
        );
    }

    #[test]
    fn absolute_paths_are_rejected() {
        let root = Path::new("/srv/scripts");
        assert!(resolve(Some(root), "/etc/passwd").is_err());
    }

    #[test]
    fn parent_components_are_rejected_anywhere() {
        let root = Path::new("/srv/scripts");
        assert!(resolve(Some(root), "../secret").is_err());
        assert!(resolve(Some(root), "a/../../secret").is_err());
        assert!(resolve(Some(root), "a/b/../c").is_err());
    }
}
