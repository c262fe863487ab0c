//! Path helpers

use std::path::PathBuf;

/// Expand a leading `~` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// `<platform config dir>/circuitcraft`, or `./.circuitcraft` when the
/// platform has none
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("circuitcraft"))
        .unwrap_or_else(|| PathBuf::from(".circuitcraft"))
}

pub fn default_keystore_dir() -> PathBuf {
    default_config_dir().join("keys")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_home() {
        let Some(home) = dirs::home_dir() else { return };
        assert_eq!(expand_path("~"), home);
        assert_eq!(expand_path("~/keys/node.key"), home.join("keys/node.key"));
    }

    #[test]
    fn test_plain_paths_untouched() {
        assert_eq!(expand_path("/tmp/node.key"), PathBuf::from("/tmp/node.key"));
        assert_eq!(expand_path("relative/~x"), PathBuf::from("relative/~x"));
        assert_eq!(expand_path("~user/x"), PathBuf::from("~user/x"));
    }

    #[test]
    fn test_keystore_under_config_dir() {
        assert!(default_keystore_dir().starts_with(default_config_dir()));
    }
}
