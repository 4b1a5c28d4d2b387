//! Artifact framing
//!
//! An artifact is a UTF-8 text header whose last line is the marker,
//! followed by the base64 payload and exactly one trailing newline. There is
//! no length prefix: readers locate the payload by scanning for the first
//! line equal to [`MARKER`].

use crate::{ProtocolError, MARKER};

/// An artifact split at its marker line.
#[derive(Debug, Clone, Copy)]
pub struct SplitArtifact<'a> {
    /// Header text, up to but excluding the marker line
    pub header: &'a str,
    /// 1-based line number of the marker
    pub marker_line: usize,
    /// Raw payload bytes following the marker line (still base64)
    pub payload: &'a [u8],
}

impl SplitArtifact<'_> {
    /// Payload with surrounding ASCII whitespace removed
    pub fn payload_trimmed(&self) -> &[u8] {
        self.payload.trim_ascii()
    }
}

fn is_marker_line(line: &[u8]) -> bool {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    line == MARKER.as_bytes()
}

/// Locate the marker line and split the artifact into header and payload.
pub fn split_artifact(bytes: &[u8]) -> Result<SplitArtifact<'_>, ProtocolError> {
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < bytes.len() {
        line_no += 1;
        let end = bytes[offset..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|p| offset + p)
            .unwrap_or(bytes.len());

        if is_marker_line(&bytes[offset..end]) {
            let header = std::str::from_utf8(&bytes[..offset])
                .map_err(|_| ProtocolError::InvalidHeader)?;
            let payload_start = (end + 1).min(bytes.len());
            return Ok(SplitArtifact {
                header,
                marker_line: line_no,
                payload: &bytes[payload_start..],
            });
        }

        offset = end + 1;
    }

    Err(ProtocolError::MissingMarker)
}

/// Count full lines equal to the marker in a header text.
pub fn count_marker_lines(text: &str) -> usize {
    text.lines().filter(|l| is_marker_line(l.as_bytes())).count()
}

/// Assemble an artifact from a rendered header and an encoded payload.
///
/// The header must end with the marker line (a final newline is added if
/// missing) and contain it exactly once.
pub fn frame_artifact(header: &str, encoded_payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let trimmed = header.trim_end_matches(['\n', '\r']);
    let last_line = trimmed.rsplit('\n').next().unwrap_or_default();
    if last_line.trim_end_matches('\r') != MARKER {
        return Err(ProtocolError::MissingMarker);
    }
    match count_marker_lines(trimmed) {
        1 => {}
        0 => return Err(ProtocolError::MissingMarker),
        n => return Err(ProtocolError::DuplicateMarker(n)),
    }

    let mut out = Vec::with_capacity(trimmed.len() + encoded_payload.len() + 2);
    out.extend_from_slice(trimmed.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(encoded_payload);
    out.push(b'\n');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> String {
        format!("#!/bin/bash\necho hi\nexit 0\n{}\n", MARKER)
    }

    #[test]
    fn test_frame_then_split() {
        let artifact = frame_artifact(&header(), b"QUJD").unwrap();
        assert!(artifact.ends_with(b"QUJD\n"));

        let split = split_artifact(&artifact).unwrap();
        assert_eq!(split.marker_line, 4);
        assert_eq!(split.header, "#!/bin/bash\necho hi\nexit 0\n");
        assert_eq!(split.payload_trimmed(), b"QUJD");
    }

    #[test]
    fn test_frame_adds_missing_newline() {
        let h = format!("#!/bin/sh\n{}", MARKER);
        let artifact = frame_artifact(&h, b"AA==").unwrap();
        let text = String::from_utf8(artifact).unwrap();
        assert_eq!(text, format!("#!/bin/sh\n{}\nAA==\n", MARKER));
    }

    #[test]
    fn test_frame_rejects_missing_marker() {
        assert!(matches!(
            frame_artifact("#!/bin/sh\necho\n", b"AA=="),
            Err(ProtocolError::MissingMarker)
        ));
    }

    #[test]
    fn test_frame_rejects_marker_not_on_own_line() {
        let h = format!("#!/bin/sh\necho {}\n", MARKER);
        assert!(matches!(
            frame_artifact(&h, b"AA=="),
            Err(ProtocolError::MissingMarker)
        ));
    }

    #[test]
    fn test_frame_rejects_duplicate_marker() {
        let h = format!("#!/bin/sh\n{m}\necho\n{m}\n", m = MARKER);
        assert!(matches!(
            frame_artifact(&h, b"AA=="),
            Err(ProtocolError::DuplicateMarker(2))
        ));
    }

    #[test]
    fn test_split_ignores_marker_inside_line() {
        let text = format!(
            "awk '/^{m}$/ {{ print NR + 1 }}'\n{m}\nZm9v\n",
            m = MARKER
        );
        let split = split_artifact(text.as_bytes()).unwrap();
        assert_eq!(split.marker_line, 2);
        assert_eq!(split.payload_trimmed(), b"Zm9v");
    }

    #[test]
    fn test_split_missing_marker() {
        assert!(matches!(
            split_artifact(b"#!/bin/sh\nno marker\n"),
            Err(ProtocolError::MissingMarker)
        ));
    }

    #[test]
    fn test_split_tolerates_crlf_marker() {
        let text = format!("#!/bin/sh\r\n{}\r\nZm9v\r\n", MARKER);
        let split = split_artifact(text.as_bytes()).unwrap();
        assert_eq!(split.payload_trimmed(), b"Zm9v");
    }
}
