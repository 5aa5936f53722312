use std::fmt;
use std::path::Path;

use crate::errors::SandboxError;

/// Project toolchain, detected from marker files in the repository root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toolchain {
    Node,
    Python,
    Go,
    Rust,
    Unknown,
}

impl fmt::Display for Toolchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Toolchain::Node => "node",
            Toolchain::Python => "python",
            Toolchain::Go => "go",
            Toolchain::Rust => "rust",
            Toolchain::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// First match wins: node, python, go, rust.
pub fn detect(dir: &Path) -> Toolchain {
    let has = |name: &str| dir.join(name).is_file();
    if has("package.json") {
        Toolchain::Node
    } else if has("requirements.txt") || has("pyproject.toml") || has("setup.py") {
        Toolchain::Python
    } else if has("go.mod") {
        Toolchain::Go
    } else if has("Cargo.toml") {
        Toolchain::Rust
    } else {
        Toolchain::Unknown
    }
}

/// Whether `package.json` declares a `build` script.
pub fn node_has_build_script(dir: &Path) -> Result<bool, SandboxError> {
    let manifest_error = |message: String| SandboxError::Manifest {
        file: "package.json".to_string(),
        message,
    };
    let content = std::fs::read_to_string(dir.join("package.json"))
        .map_err(|e| manifest_error(e.to_string()))?;
    let manifest: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| manifest_error(e.to_string()))?;
    Ok(manifest
        .get("scripts")
        .and_then(|s| s.get("build"))
        .and_then(|b| b.as_str())
        .is_some_and(|b| !b.trim().is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_detect_each_toolchain() {
        let cases = [
            ("package.json", Toolchain::Node),
            ("requirements.txt", Toolchain::Python),
            ("pyproject.toml", Toolchain::Python),
            ("setup.py", Toolchain::Python),
            ("go.mod", Toolchain::Go),
            ("Cargo.toml", Toolchain::Rust),
        ];
        for (marker, expected) in cases {
            let dir = tempdir().unwrap();
            touch(dir.path(), marker, "");
            assert_eq!(detect(dir.path()), expected, "marker {}", marker);
        }
    }

    #[test]
    fn test_detect_unknown_and_precedence() {
        let dir = tempdir().unwrap();
        assert_eq!(detect(dir.path()), Toolchain::Unknown);

        touch(dir.path(), "Cargo.toml", "");
        touch(dir.path(), "package.json", "{}");
        assert_eq!(detect(dir.path()), Toolchain::Node);
    }

    #[test]
    fn test_marker_directory_does_not_count() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("go.mod")).unwrap();
        assert_eq!(detect(dir.path()), Toolchain::Unknown);
    }

    #[test]
    fn test_node_build_script() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "package.json", r#"{"scripts": {"build": "tsc"}}"#);
        assert!(node_has_build_script(dir.path()).unwrap());

        touch(dir.path(), "package.json", r#"{"scripts": {"test": "jest"}}"#);
        assert!(!node_has_build_script(dir.path()).unwrap());

        touch(dir.path(), "package.json", "{not json");
        assert!(matches!(
            node_has_build_script(dir.path()),
            Err(SandboxError::Manifest { .. })
        ));
    }
}
