//! Artifact template rendering and writing
//!
//! A template is a shell script that ends with the payload marker line.
//! Rendering substitutes every `%%NAME%%` placeholder in one pass, so text
//! inserted by a substitution is never scanned again, and then rejects the
//! result if any placeholder-shaped token is left.

pub mod fields;
pub mod snippets;

pub use fields::TemplateFields;
pub use snippets::{EncryptionSnippets, UpdateSnippets};

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::write::EncoderWriter;
use tracing::{debug, warn};

use shellpack_protocol::framing::count_marker_lines;
use shellpack_protocol::placeholder::placeholder_regex;
use shellpack_protocol::{find_placeholders, MARKER};

/// Built-in extractor template
pub const BUILTIN_TEMPLATE: &str = include_str!("../../templates/extractor.sh");

/// Template errors
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template does not end with the marker line {MARKER}")]
    MissingMarker,

    #[error("marker line appears {0} times in the template")]
    DuplicateMarker(usize),

    #[error("unresolved placeholders: {}", .0.join(", "))]
    Unresolved(Vec<String>),

    #[error("cannot read template {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A validated template
#[derive(Debug, Clone)]
pub struct Template {
    text: String,
    origin: String,
}

impl Template {
    /// The compiled-in template
    pub fn builtin() -> Self {
        Self {
            text: BUILTIN_TEMPLATE.to_string(),
            origin: "builtin".to_string(),
        }
    }

    /// Load and validate a user template
    pub fn from_file(path: &Path) -> Result<Self, TemplateError> {
        let text = fs::read_to_string(path).map_err(|source| TemplateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let template = Self {
            text,
            origin: path.display().to_string(),
        };
        template.validate()?;
        Ok(template)
    }

    /// User template when given, built-in otherwise
    pub fn load(path: Option<&Path>) -> Result<Self, TemplateError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::builtin()),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The marker must be the last line and appear only once as a full line
    pub fn validate(&self) -> Result<(), TemplateError> {
        match count_marker_lines(&self.text) {
            0 => return Err(TemplateError::MissingMarker),
            1 => {}
            n => return Err(TemplateError::DuplicateMarker(n)),
        }
        let last = self
            .text
            .trim_end_matches(['\n', '\r'])
            .rsplit('\n')
            .next()
            .unwrap_or_default();
        if last.trim_end_matches('\r') != MARKER {
            return Err(TemplateError::MissingMarker);
        }
        Ok(())
    }

    /// Substitute every field and check nothing is left.
    ///
    /// The result ends with the marker line and a single newline.
    pub fn render(&self, fields: &TemplateFields) -> Result<String, TemplateError> {
        self.validate()?;
        let table = fields.substitution_table();

        let rendered = placeholder_regex().replace_all(&self.text, |caps: &regex_lite::Captures| {
            let name = &caps[1];
            match table.get(name) {
                Some(value) => (*value).to_string(),
                None => caps[0].to_string(),
            }
        });

        let unresolved = find_placeholders(&rendered);
        if !unresolved.is_empty() {
            warn!("Template {} left {} placeholders", self.origin, unresolved.len());
            return Err(TemplateError::Unresolved(unresolved));
        }

        // A substituted value could have introduced a second marker line
        match count_marker_lines(&rendered) {
            1 => {}
            0 => return Err(TemplateError::MissingMarker),
            n => return Err(TemplateError::DuplicateMarker(n)),
        }

        let mut header = rendered.trim_end_matches(['\n', '\r']).to_string();
        header.push('\n');
        Ok(header)
    }
}

/// Write `header` followed by the base64 of `payload` to `output`.
///
/// The payload is streamed through the encoder without line wrapping and
/// followed by exactly one newline. The file is made executable. On error
/// the partial artifact is removed.
pub fn write_artifact(header: &str, payload: &Path, output: &Path) -> Result<(), TemplateError> {
    let result = write_artifact_inner(header, payload, output);
    if result.is_err() && output.exists() {
        if let Err(e) = fs::remove_file(output) {
            warn!("Failed to remove partial artifact {}: {}", output.display(), e);
        }
    }
    result
}

fn write_artifact_inner(header: &str, payload: &Path, output: &Path) -> Result<(), TemplateError> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut reader = BufReader::new(File::open(payload)?);
    let mut out = BufWriter::new(File::create(output)?);
    out.write_all(header.as_bytes())?;
    {
        let mut encoder = EncoderWriter::new(&mut out, &STANDARD);
        io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?;
    }
    out.write_all(b"\n")?;
    out.flush()?;
    drop(out);

    set_executable(output)?;
    debug!("Wrote artifact {}", output.display());
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildSpec, EffectiveConfig};
    use crate::metadata::{BuildRecord, Provenance};
    use base64::Engine;
    use chrono::Local;
    use serde_json::json;
    use shellpack_protocol::split_artifact;
    use tempfile::TempDir;

    fn fields(cli: serde_json::Value) -> TemplateFields {
        let config = EffectiveConfig::build(None, Some(cli), Path::new("/work")).unwrap();
        let spec = BuildSpec::from_value(&config).unwrap();
        let record = BuildRecord::new(
            &spec,
            "20260101120000".to_string(),
            Provenance::current(Local::now()),
        );
        TemplateFields::from_record(&record, &spec)
    }

    #[test]
    fn test_builtin_is_valid() {
        Template::builtin().validate().unwrap();
    }

    #[test]
    fn test_render_builtin() {
        let header = Template::builtin().render(&fields(json!({}))).unwrap();
        assert!(header.starts_with("#!/usr/bin/env bash\n"));
        assert!(header.ends_with(&format!("{}\n", MARKER)));
        assert!(header.contains("SP_BUILD_VERSION='20260101120000'"));
        assert!(find_placeholders(&header).is_empty());
    }

    #[test]
    fn test_missing_marker() {
        let template = Template {
            text: "#!/bin/sh\necho hi\n".to_string(),
            origin: "test".to_string(),
        };
        assert!(matches!(template.validate(), Err(TemplateError::MissingMarker)));
    }

    #[test]
    fn test_marker_not_last() {
        let template = Template {
            text: format!("#!/bin/sh\n{}\necho trailing\n", MARKER),
            origin: "test".to_string(),
        };
        assert!(matches!(template.validate(), Err(TemplateError::MissingMarker)));
    }

    #[test]
    fn test_duplicate_marker() {
        let template = Template {
            text: format!("#!/bin/sh\n{m}\n{m}\n", m = MARKER),
            origin: "test".to_string(),
        };
        assert!(matches!(
            template.validate(),
            Err(TemplateError::DuplicateMarker(2))
        ));
    }

    #[test]
    fn test_unknown_placeholder_is_reported() {
        let template = Template {
            text: format!("#!/bin/sh\nA=%%BUILD_VERSION%%\nB=%%NOT_A_FIELD%%\n{}\n", MARKER),
            origin: "test".to_string(),
        };
        match template.render(&fields(json!({}))) {
            Err(TemplateError::Unresolved(names)) => assert_eq!(names, vec!["NOT_A_FIELD"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_substituted_text_is_not_rescanned() {
        let template = Template {
            text: format!("#!/bin/sh\nE=%%POST_EXTRACTION_SCRIPT%%\n{}\n", MARKER),
            origin: "test".to_string(),
        };
        let mut f = fields(json!({}));
        f.post_extraction_script = "'%%BUILD_VERSION%%'".to_string();
        // The literal survives, so the completeness scan catches it
        assert!(matches!(
            template.render(&f),
            Err(TemplateError::Unresolved(_))
        ));
    }

    #[test]
    fn test_from_file_missing() {
        let err = Template::from_file(Path::new("/nonexistent/template.sh")).unwrap_err();
        assert!(matches!(err, TemplateError::Read { .. }));
    }

    #[test]
    fn test_write_artifact_layout() {
        let dir = TempDir::new().unwrap();
        let payload = dir.path().join("payload.bin");
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&payload, &data).unwrap();
        let output = dir.path().join("out/pkg.sh");

        let header = format!("#!/bin/sh\nexit 0\n{}\n", MARKER);
        write_artifact(&header, &payload, &output).unwrap();

        let bytes = fs::read(&output).unwrap();
        assert!(bytes.ends_with(b"\n"));
        assert!(!bytes.ends_with(b"\n\n"));
        let split = split_artifact(&bytes).unwrap();
        assert_eq!(split.marker_line, 3);
        let decoded = STANDARD.decode(split.payload_trimmed()).unwrap();
        assert_eq!(decoded, data);
        // No line wrapping
        assert!(!split.payload_trimmed().contains(&b'\n'));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&output).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn test_write_artifact_removes_partial_on_error() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("pkg.sh");
        let header = format!("#!/bin/sh\n{}\n", MARKER);
        let err = write_artifact(&header, &dir.path().join("missing"), &output);
        assert!(err.is_err());
        assert!(!output.exists());
    }
}
