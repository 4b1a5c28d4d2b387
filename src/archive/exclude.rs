//! Exclusion rules for archiving
//!
//! Patterns use shell-glob syntax (`*`, `?`, `[...]`) evaluated against the
//! POSIX path relative to the content root. `*` also matches `/`, so `*.log`
//! excludes `a/b/c.log`. A pattern ending in `/` is a directory pattern: it
//! matches a directory (tested as `rel/`) and anything beneath it.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Standard exclusion catalogue, grouped by category
pub const STANDARD_EXCLUDES: &[(&str, &[&str])] = &[
    ("version control", &[".git/", ".svn/", ".hg/", ".cvs/"]),
    (
        "python",
        &[
            "*.pyc",
            "*.pyo",
            "__pycache__/",
            "*.egg-info/",
            "build/",
            "dist/",
            "*.spec",
            ".venv/",
            "venv/",
            "env/",
        ],
    ),
    (
        "logs and temp",
        &["*.log", "*.tmp", "*~", "*.bak", "*.swp", ".DS_Store", "Thumbs.db"],
    ),
    ("configuration", &[".env"]),
    ("ide", &[".vscode/", ".idea/", ".project", ".settings/"]),
    ("macos", &["._*"]),
];

/// Errors for exclusion rules
#[derive(Debug, thiserror::Error)]
pub enum ExcludeError {
    #[error("invalid exclude pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: globset::Error,
    },

    #[error("glob set error: {0}")]
    GlobError(#[from] globset::Error),
}

/// Compiled exclusion rules
#[derive(Debug, Clone)]
pub struct ExcludeRules {
    patterns: Vec<String>,
    ignore_case: bool,
    /// Patterns without a trailing `/`, one glob each
    file_set: GlobSet,
    file_owners: Vec<usize>,
    /// Directory patterns, two globs each (`P` and `P*`)
    dir_set: GlobSet,
    dir_owners: Vec<usize>,
}

impl Default for ExcludeRules {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            ignore_case: false,
            file_set: GlobSet::empty(),
            file_owners: Vec::new(),
            dir_set: GlobSet::empty(),
            dir_owners: Vec::new(),
        }
    }
}

impl ExcludeRules {
    /// Compile a pattern list. Blank patterns are ignored.
    pub fn new<S: AsRef<str>>(patterns: &[S], ignore_case: bool) -> Result<Self, ExcludeError> {
        let patterns: Vec<String> = patterns
            .iter()
            .map(|p| p.as_ref().trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let mut file_builder = GlobSetBuilder::new();
        let mut dir_builder = GlobSetBuilder::new();
        let mut file_owners = Vec::new();
        let mut dir_owners = Vec::new();

        for (index, pattern) in patterns.iter().enumerate() {
            if pattern.ends_with('/') {
                dir_builder.add(compile(pattern, ignore_case)?);
                dir_builder.add(compile(&format!("{}*", pattern), ignore_case)?);
                dir_owners.extend([index, index]);
            } else {
                file_builder.add(compile(pattern, ignore_case)?);
                file_owners.push(index);
            }
        }

        Ok(Self {
            patterns,
            ignore_case,
            file_set: file_builder.build()?,
            file_owners,
            dir_set: dir_builder.build()?,
            dir_owners,
        })
    }

    /// Rules holding the whole standard catalogue
    pub fn standard(ignore_case: bool) -> Result<Self, ExcludeError> {
        Self::new(&standard_patterns(), ignore_case)
    }

    /// Add patterns to the existing set
    pub fn with_patterns<S: AsRef<str>>(self, patterns: &[S]) -> Result<Self, ExcludeError> {
        let mut all = self.patterns;
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if !pattern.is_empty() && !all.iter().any(|p| p == pattern) {
                all.push(pattern.to_string());
            }
        }
        Self::new(&all, self.ignore_case)
    }

    /// Patterns in evaluation order
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether no pattern is configured
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// First pattern matching a relative POSIX path.
    ///
    /// Directories are passed with a trailing `/`.
    pub fn matching_pattern(&self, rel_path: &str) -> Option<&str> {
        if let Some(&i) = self.file_set.matches(rel_path).first() {
            return Some(&self.patterns[self.file_owners[i]]);
        }
        let as_dir;
        let dir_candidate = if rel_path.ends_with('/') {
            rel_path
        } else {
            as_dir = format!("{}/", rel_path);
            &as_dir
        };
        self.dir_set
            .matches(dir_candidate)
            .first()
            .map(|&i| self.patterns[self.dir_owners[i]].as_str())
    }

    /// Whether a relative POSIX path is excluded
    pub fn is_excluded(&self, rel_path: &str) -> bool {
        self.matching_pattern(rel_path).is_some()
    }

    /// Whether a directory (given without trailing `/`) is excluded
    pub fn is_dir_excluded(&self, rel_dir: &str) -> bool {
        self.is_excluded(&format!("{}/", rel_dir.trim_end_matches('/')))
    }
}

/// Flat list of every standard exclusion pattern
pub fn standard_patterns() -> Vec<&'static str> {
    STANDARD_EXCLUDES
        .iter()
        .flat_map(|(_, patterns)| patterns.iter().copied())
        .collect()
}

fn compile(pattern: &str, ignore_case: bool) -> Result<globset::Glob, ExcludeError> {
    GlobBuilder::new(pattern)
        .literal_separator(false)
        .case_insensitive(ignore_case)
        .backslash_escape(true)
        .build()
        .map_err(|source| ExcludeError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}
