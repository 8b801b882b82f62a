use serde::Serialize;
use std::path::Path;
use tracing::debug;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    Dependencies,
    BuildArtifacts,
    SystemFiles,
    Secrets,
    Logs,
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedPattern {
    pub pattern: String,
    pub category: PatternCategory,
    pub is_security_sensitive: bool,
}

/// Names that mark a pattern as a dependency directory.
const DEPENDENCY_NAMES: &[&str] = &[
    "node_modules",
    "bower_components",
    "jspm_packages",
    "vendor",
    "venv",
    ".venv",
    ".pnpm-store",
    ".yarn",
];

/// Names and suffixes that mark a pattern as build output.
const BUILD_NAMES: &[&str] = &[
    "dist", "build", "out", "target", "coverage", ".next", ".nuxt", ".output",
    "__pycache__", ".cache", ".parcel-cache", ".turbo",
];
const BUILD_SUFFIXES: &[&str] = &[".o", ".obj", ".pyc", ".class", ".wasm", ".min.js"];

/// OS and editor litter.
const SYSTEM_NAMES: &[&str] = &[
    ".DS_Store",
    "Thumbs.db",
    "Desktop.ini",
    ".idea",
    ".vscode",
    ".fleet",
];
const SYSTEM_SUFFIXES: &[&str] = &[".swp", ".swo", "~"];

const LOG_NAMES: &[&str] = &["logs", "log"];
const LOG_SUFFIXES: &[&str] = &[".log"];

/// Suffixes and name fragments that flag likely secret material.
const SECRET_SUFFIXES: &[&str] = &[".key", ".pem", ".p12", ".pfx", ".keystore", ".jks"];
const SECRET_NAMES: &[&str] = &[".netrc", ".npmrc", ".htpasswd"];
const SECRET_FRAGMENTS: &[&str] = &["secret", "credential", "token", "id_rsa", "id_ed25519"];

/// Parse the project's `.gitignore` into categorized patterns. A missing
/// file is not an error; it just means there is nothing to offer.
pub fn parse(project_root: &Path) -> Result<Vec<ParsedPattern>, AppError> {
    let path = project_root.join(".gitignore");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| AppError::PatternParse(format!("{}: {}", path.display(), e)))?;
    Ok(parse_content(&content))
}

fn parse_content(content: &str) -> Vec<ParsedPattern> {
    let mut patterns = Vec::new();
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        // Negations un-ignore paths; they are not copyable selections.
        if line.starts_with('!') {
            debug!(pattern = %line, "Skipping negation pattern");
            continue;
        }
        let security = is_security_sensitive(line);
        patterns.push(ParsedPattern {
            pattern: line.to_string(),
            category: categorize(line, security),
            is_security_sensitive: security,
        });
    }
    patterns
}

/// All patterns safe to copy by default: everything not flagged as
/// security-sensitive.
pub fn default_selection(patterns: &[ParsedPattern]) -> Vec<String> {
    patterns
        .iter()
        .filter(|p| !p.is_security_sensitive)
        .map(|p| p.pattern.clone())
        .collect()
}

/// Final path segment of a pattern, with anchoring slashes stripped, so
/// `/src/generated/` and `generated` classify the same way.
fn normalized_name(pattern: &str) -> &str {
    let trimmed = pattern.trim_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

fn categorize(pattern: &str, security: bool) -> PatternCategory {
    if security {
        return PatternCategory::Secrets;
    }
    let name = normalized_name(pattern);
    let bare = name.trim_start_matches('*');

    if DEPENDENCY_NAMES.iter().any(|n| name.eq_ignore_ascii_case(n)) {
        return PatternCategory::Dependencies;
    }
    if BUILD_NAMES.iter().any(|n| name.eq_ignore_ascii_case(n))
        || BUILD_SUFFIXES.iter().any(|s| bare.ends_with(s))
    {
        return PatternCategory::BuildArtifacts;
    }
    if SYSTEM_NAMES.iter().any(|n| name.eq_ignore_ascii_case(n))
        || SYSTEM_SUFFIXES.iter().any(|s| bare.ends_with(s))
    {
        return PatternCategory::SystemFiles;
    }
    if LOG_NAMES.iter().any(|n| name.eq_ignore_ascii_case(n))
        || LOG_SUFFIXES.iter().any(|s| bare.ends_with(s))
    {
        return PatternCategory::Logs;
    }
    PatternCategory::Other
}

fn is_security_sensitive(pattern: &str) -> bool {
    let name = normalized_name(pattern);
    let lower = name.to_ascii_lowercase();
    let bare = lower.trim_start_matches('*');

    if lower.starts_with(".env") || bare.starts_with(".env") {
        return true;
    }
    if SECRET_SUFFIXES.iter().any(|s| bare.ends_with(s)) {
        return true;
    }
    if SECRET_NAMES.iter().any(|n| lower == *n) {
        return true;
    }
    SECRET_FRAGMENTS.iter().any(|f| lower.contains(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_gitignore_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(parse(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn skips_comments_blanks_and_negations() {
        let patterns = parse_content("# deps\n\nnode_modules/\n!keep.log\n");
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].pattern, "node_modules/");
    }

    #[test]
    fn categorizes_common_patterns() {
        let patterns = parse_content(
            "node_modules/\ndist/\n*.o\n.DS_Store\n*.swp\n*.log\n.env\n*.pem\nnotes.txt\n",
        );
        let by_pattern = |p: &str| {
            patterns
                .iter()
                .find(|entry| entry.pattern == p)
                .unwrap()
                .category
        };
        assert_eq!(by_pattern("node_modules/"), PatternCategory::Dependencies);
        assert_eq!(by_pattern("dist/"), PatternCategory::BuildArtifacts);
        assert_eq!(by_pattern("*.o"), PatternCategory::BuildArtifacts);
        assert_eq!(by_pattern(".DS_Store"), PatternCategory::SystemFiles);
        assert_eq!(by_pattern("*.swp"), PatternCategory::SystemFiles);
        assert_eq!(by_pattern("*.log"), PatternCategory::Logs);
        assert_eq!(by_pattern(".env"), PatternCategory::Secrets);
        assert_eq!(by_pattern("*.pem"), PatternCategory::Secrets);
        assert_eq!(by_pattern("notes.txt"), PatternCategory::Other);
    }

    #[test]
    fn security_heuristics_cover_env_keys_and_credentials() {
        for pattern in [".env", ".env.local", "*.key", "*.pem", "secrets.yaml",
                        "aws_credentials", "id_rsa", ".npmrc"] {
            assert!(is_security_sensitive(pattern), "{pattern} should be sensitive");
        }
        for pattern in ["node_modules/", "*.log", "dist/", "envelope.txt"] {
            assert!(!is_security_sensitive(pattern), "{pattern} should not be sensitive");
        }
    }

    #[test]
    fn default_selection_excludes_security_sensitive() {
        let patterns = parse_content("node_modules/\n*.log\n.env\n*.key\n*.pem\n");
        let selection = default_selection(&patterns);
        assert_eq!(selection, vec!["node_modules/", "*.log"]);
        for sensitive in [".env", "*.key", "*.pem"] {
            assert!(patterns.iter().any(|p| p.pattern == sensitive));
            assert!(!selection.iter().any(|s| s == sensitive));
        }
    }

    #[test]
    fn anchored_patterns_classify_by_final_segment() {
        let patterns = parse_content("/packages/app/node_modules/\n/build\n");
        assert_eq!(patterns[0].category, PatternCategory::Dependencies);
        assert_eq!(patterns[1].category, PatternCategory::BuildArtifacts);
    }
}
