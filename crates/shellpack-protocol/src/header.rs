//! Header variable block and embedded manifest
//!
//! A rendered header declares its build facts as top-level shell assignments
//! of the form `SP_NAME='value'`, single-quoted so that no value can break
//! out of its assignment. The per-file manifest follows as a quoted heredoc
//! whose body is `sha256sum`-compatible (`<checksum>  <path>`), with the
//! `empty` and `symlink` sentinels standing in for non-hashable entries.

use std::collections::BTreeMap;

use crate::{split_artifact, ProtocolError, EMPTY_SENTINEL, SYMLINK_SENTINEL};

/// Opening line of the embedded manifest heredoc
pub const MANIFEST_BEGIN: &str = ": <<'__SHELLPACK_MANIFEST__'";

/// Terminator of the embedded manifest heredoc
pub const MANIFEST_END: &str = "__SHELLPACK_MANIFEST__";

/// Names of the variables every header declares.
pub mod vars {
    pub const PROTOCOL_VERSION: &str = "SP_PROTOCOL_VERSION";
    pub const TOOL_VERSION: &str = "SP_TOOL_VERSION";
    pub const BUILD_VERSION: &str = "SP_BUILD_VERSION";
    pub const CREATED_AT: &str = "SP_CREATED_AT";
    /// `user@host` of the build
    pub const BUILD_ORIGIN: &str = "SP_BUILD_ORIGIN";
    pub const PLATFORM: &str = "SP_PLATFORM";
    pub const COMPRESSION: &str = "SP_COMPRESSION";
    pub const TAR_FLAGS: &str = "SP_TAR_FLAGS";
    pub const ARCHIVE_NAME: &str = "SP_ARCHIVE_NAME";
    pub const ARCHIVE_SHA256: &str = "SP_ARCHIVE_SHA256";
    pub const ENCRYPTED_SHA256: &str = "SP_ENCRYPTED_SHA256";
    pub const ENTRY_POINT: &str = "SP_ENTRY_POINT";
    pub const ENCRYPTED: &str = "SP_ENCRYPTED";
    pub const NEED_ROOT: &str = "SP_NEED_ROOT";
    pub const UPDATE_ENABLED: &str = "SP_UPDATE_ENABLED";
    pub const UPDATE_MODE: &str = "SP_UPDATE_MODE";
    pub const VERSION_URL: &str = "SP_VERSION_URL";
    pub const PACKAGE_URL: &str = "SP_PACKAGE_URL";
    pub const ENC_TOOL: &str = "SP_ENC_TOOL";
    pub const ENC_CIPHER: &str = "SP_ENC_CIPHER";
    pub const ENC_ITER: &str = "SP_ENC_ITER";
    pub const ENC_S2K: &str = "SP_ENC_S2K";
}

/// One manifest line: checksum (or sentinel) and relative path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestLine {
    /// Lowercase hex SHA-256, `empty`, or `symlink`
    pub checksum: String,
    /// Path relative to the extraction root
    pub path: String,
}

impl ManifestLine {
    pub fn new(checksum: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            checksum: checksum.into(),
            path: path.into(),
        }
    }

    /// Whether the checksum is a real digest rather than a sentinel
    pub fn is_hashed(&self) -> bool {
        self.checksum != EMPTY_SENTINEL && self.checksum != SYMLINK_SENTINEL
    }

    fn parse(line: &str) -> Option<Self> {
        let (checksum, path) = line.split_once("  ")?;
        if checksum.is_empty() || path.is_empty() {
            return None;
        }
        Some(Self::new(checksum, path))
    }
}

/// Quote a value for a POSIX shell using single quotes.
///
/// Embedded `'` become `'\''`; everything else is literal.
pub fn shell_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Decode a shell word made of single-quoted runs, backslash escapes and
/// plain characters. Other shell syntax is rejected.
pub fn shell_unquote(word: &str) -> Option<String> {
    let mut out = String::with_capacity(word.len());
    let mut chars = word.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\'' => loop {
                match chars.next() {
                    Some('\'') => break,
                    Some(c) => out.push(c),
                    None => return None,
                }
            },
            '\\' => out.push(chars.next()?),
            c if c.is_ascii_alphanumeric() || "_./:-@%+,=".contains(c) => out.push(c),
            _ => return None,
        }
    }
    Some(out)
}

fn quotes_balanced(text: &str) -> bool {
    let mut in_quote = false;
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\'' => in_quote = !in_quote,
            '\\' if !in_quote => {
                chars.next();
            }
            _ => {}
        }
    }
    !in_quote
}

fn assignment_name(line: &str) -> Option<(&str, &str)> {
    let (name, rest) = line.split_once('=')?;
    let mut bytes = name.bytes();
    let first = bytes.next()?;
    if !(first.is_ascii_uppercase() || first == b'_') {
        return None;
    }
    if !bytes.all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_') {
        return None;
    }
    Some((name, rest))
}

/// Render the manifest heredoc. Paths containing line breaks cannot be
/// expressed in a line-oriented manifest and are left out.
pub fn render_manifest_block(lines: &[ManifestLine]) -> String {
    let mut out = String::new();
    out.push_str(MANIFEST_BEGIN);
    out.push('\n');
    for line in lines {
        if line.path.contains(['\n', '\r']) {
            continue;
        }
        out.push_str(&line.checksum);
        out.push_str("  ");
        out.push_str(&line.path);
        out.push('\n');
    }
    out.push_str(MANIFEST_END);
    out
}

/// Facts recovered from a rendered header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderInfo {
    /// Top-level `NAME='value'` assignments, decoded
    pub vars: BTreeMap<String, String>,
    /// Embedded manifest lines, in header order
    pub manifest: Vec<ManifestLine>,
}

impl HeaderInfo {
    /// Parse a header text.
    ///
    /// Only assignments starting at column zero are collected; indented
    /// assignments belong to function bodies. A quoted value may span lines.
    pub fn parse(header: &str) -> Result<Self, ProtocolError> {
        let mut info = HeaderInfo::default();
        let mut lines = header.lines();
        let mut in_manifest = false;

        while let Some(line) = lines.next() {
            let line = line.trim_end_matches('\r');

            if in_manifest {
                if line == MANIFEST_END {
                    in_manifest = false;
                } else if let Some(entry) = ManifestLine::parse(line) {
                    info.manifest.push(entry);
                }
                continue;
            }
            if line == MANIFEST_BEGIN {
                in_manifest = true;
                continue;
            }

            let Some((name, rest)) = assignment_name(line) else {
                continue;
            };
            if !rest.starts_with('\'') {
                continue;
            }

            let mut word = rest.to_string();
            while !quotes_balanced(&word) {
                match lines.next() {
                    Some(next) => {
                        word.push('\n');
                        word.push_str(next);
                    }
                    None => return Err(ProtocolError::BadQuoting(name.to_string())),
                }
            }

            let value =
                shell_unquote(&word).ok_or_else(|| ProtocolError::BadQuoting(name.to_string()))?;
            info.vars.insert(name.to_string(), value);
        }

        Ok(info)
    }

    /// Split a whole artifact and parse its header
    pub fn from_artifact(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let split = split_artifact(bytes)?;
        Self::parse(split.header)
    }

    /// Look up a variable
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Look up a variable, treating absence as empty
    pub fn get_or_empty(&self, name: &str) -> &str {
        self.get(name).unwrap_or_default()
    }

    /// Whether a boolean variable is `true`
    pub fn flag(&self, name: &str) -> bool {
        self.get(name) == Some("true")
    }

    /// Look up a variable and require it to be non-empty
    pub fn require(&self, name: &str) -> Result<&str, ProtocolError> {
        match self.get(name) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(ProtocolError::InvalidHeader),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_plain() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_shell_quote_embedded_quote() {
        let quoted = shell_quote("it's");
        assert_eq!(quoted, "'it'\\''s'");
        assert_eq!(shell_unquote(&quoted).unwrap(), "it's");
    }

    #[test]
    fn test_shell_quote_neutralizes_expansion() {
        let hostile = "$(rm -rf /); `id`; \"x\"";
        assert_eq!(shell_unquote(&shell_quote(hostile)).unwrap(), hostile);
    }

    #[test]
    fn test_unquote_rejects_unquoted_syntax() {
        assert!(shell_unquote("$(id)").is_none());
        assert!(shell_unquote("'open").is_none());
    }

    #[test]
    fn test_parse_vars_and_manifest() {
        let manifest = render_manifest_block(&[
            ManifestLine::new("ab".repeat(32), "bin/run.sh"),
            ManifestLine::new(EMPTY_SENTINEL, "empty.txt"),
            ManifestLine::new(SYMLINK_SENTINEL, "link"),
        ]);
        let header = format!(
            "#!/bin/bash\nSP_BUILD_VERSION='20260101120000'\nSP_ENTRY_POINT='it'\\''s.sh'\n\
             helper() {{\n    SP_BUILD_VERSION='shadow'\n}}\n{}\nSP_ENCRYPTED='true'\n",
            manifest
        );

        let info = HeaderInfo::parse(&header).unwrap();
        assert_eq!(info.get(vars::BUILD_VERSION), Some("20260101120000"));
        assert_eq!(info.get(vars::ENTRY_POINT), Some("it's.sh"));
        assert!(info.flag(vars::ENCRYPTED));
        assert_eq!(info.manifest.len(), 3);
        assert!(info.manifest[0].is_hashed());
        assert!(!info.manifest[1].is_hashed());
        assert_eq!(info.manifest[2].path, "link");
    }

    #[test]
    fn test_parse_multiline_value() {
        let header = "SP_ENTRY_POINT='line one\nline two'\nSP_PLATFORM='linux'\n";
        let info = HeaderInfo::parse(header).unwrap();
        assert_eq!(info.get(vars::ENTRY_POINT), Some("line one\nline two"));
        assert_eq!(info.get(vars::PLATFORM), Some("linux"));
    }

    #[test]
    fn test_parse_unterminated_value() {
        assert!(matches!(
            HeaderInfo::parse("SP_PLATFORM='linux\n"),
            Err(ProtocolError::BadQuoting(_))
        ));
    }

    #[test]
    fn test_manifest_skips_newline_paths() {
        let block = render_manifest_block(&[
            ManifestLine::new(EMPTY_SENTINEL, "bad\nname"),
            ManifestLine::new(EMPTY_SENTINEL, "good"),
        ]);
        assert!(!block.contains("bad"));
        assert!(block.contains("empty  good"));
    }

    #[test]
    fn test_require_missing() {
        let info = HeaderInfo::parse("SP_PLATFORM=''\n").unwrap();
        assert!(info.require(vars::PLATFORM).is_err());
        assert!(info.require(vars::BUILD_VERSION).is_err());
    }
}
