//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - No sleeping in production code outside retry backoff
//! - Credentials never reach logs, errors, or serialized output
//!
//! The helpers here walk the production sources of every crate under
//! `conductor/`, with `#[cfg(test)]` modules cut off.

use std::fs;
use std::path::{Path, PathBuf};

/// Source directories that hold production code
pub const PRODUCTION_DIRS: &[&str] = &["conductor/core/src", "conductor/daemon/src"];

/// One production source file, test module stripped
pub struct SourceFile {
    /// Path relative to the workspace root
    pub path: PathBuf,
    /// Lines before the first `#[cfg(test)]`
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Path with forward slashes, for suffix matching
    pub fn unix_path(&self) -> String {
        self.path.to_string_lossy().replace('\\', "/")
    }
}

/// Workspace root, two levels above this package
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Load every `.rs` file under [`PRODUCTION_DIRS`]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let base = root.join(dir);
        if !base.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&base)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.path().extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };
            let relative = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_path_buf();
            files.push(SourceFile {
                path: relative,
                lines: strip_test_module(&content),
            });
        }
    }

    files
}

/// Drop everything from the first `#[cfg(test)]` onward
pub fn strip_test_module(content: &str) -> Vec<String> {
    content
        .lines()
        .take_while(|line| !line.trim_start().starts_with("#[cfg(test)]"))
        .map(str::to_string)
        .collect()
}

/// The code part of a line, without a trailing `//` comment
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Whether any line in `lines[from..to]` contains one of `needles`
pub fn window_contains(lines: &[String], from: usize, to: usize, needles: &[&str]) -> bool {
    lines[from..to.min(lines.len())].iter().any(|line| {
        let lower = line.to_lowercase();
        needles.iter().any(|n| lower.contains(n))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_test_module() {
        let src = "fn a() {}\n#[cfg(test)]\nmod tests { fn b() {} }\n";
        assert_eq!(strip_test_module(src), vec!["fn a() {}".to_string()]);
    }

    #[test]
    fn test_production_sources_found() {
        let files = production_sources();
        assert!(files
            .iter()
            .any(|f| f.unix_path().ends_with("conductor/core/src/lib.rs")));
    }
}
