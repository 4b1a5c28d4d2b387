//! Typed template fields
//!
//! Every placeholder the built-in template uses has exactly one field here.
//! [`TemplateFields::substitution_table`] destructures the struct without a
//! rest pattern, so adding a field does not compile until it is mapped.

use std::collections::BTreeMap;

use shellpack_protocol::header::{render_manifest_block, shell_quote};
use shellpack_protocol::{MARKER, PROTOCOL_VERSION};

use super::snippets::{EncryptionSnippets, UpdateSnippets};
use crate::archive::archive_file_name;
use crate::config::BuildSpec;
use crate::metadata::BuildRecord;

/// Values substituted into a template, already rendered as shell text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateFields {
    pub protocol_version: String,
    pub tool_version: String,
    pub build_version: String,
    pub created_at: String,
    pub build_user_host: String,
    pub platform_build: String,
    pub payload_marker: String,
    pub compression_method: String,
    pub tar_flags: String,
    pub archive_filename: String,
    pub archive_checksum: String,
    pub encrypted_checksum: String,
    pub post_extraction_script: String,
    pub encryption_enabled: String,
    pub update_enabled: String,
    pub need_root: String,
    pub update_mode: String,
    pub update_version_url: String,
    pub update_package_url: String,
    pub encryption: EncryptionSnippets,
    pub update: UpdateSnippets,
    pub manifest_block: String,
}

fn quote_bool(value: bool) -> String {
    shell_quote(if value { "true" } else { "false" })
}

impl TemplateFields {
    /// Fields for a build whose archive (and encryption, if any) is recorded
    pub fn from_record(record: &BuildRecord, spec: &BuildSpec) -> Self {
        let method = spec.compression.method;
        let params = record.encryption.as_ref().map(|e| &e.params);
        let update = spec.update.spec();
        let provenance = &record.provenance;
        let encrypted_checksum = record
            .encryption
            .as_ref()
            .map(|e| e.encrypted_archive_checksum_sha256.as_str())
            .unwrap_or_default();

        Self {
            protocol_version: shell_quote(&PROTOCOL_VERSION.to_string()),
            tool_version: shell_quote(&provenance.tool_version),
            build_version: shell_quote(&record.build_version),
            created_at: shell_quote(&provenance.created_at),
            build_user_host: shell_quote(&format!(
                "{}@{}",
                provenance.build_user, provenance.build_host
            )),
            platform_build: shell_quote(&provenance.platform),
            payload_marker: shell_quote(MARKER),
            compression_method: shell_quote(method.name()),
            tar_flags: shell_quote(method.tar_flag()),
            archive_filename: shell_quote(&archive_file_name(method)),
            archive_checksum: shell_quote(&record.manifest.archive_sha256),
            encrypted_checksum: shell_quote(encrypted_checksum),
            post_extraction_script: shell_quote(
                record.post_extraction_script.as_deref().unwrap_or_default(),
            ),
            encryption_enabled: quote_bool(params.is_some()),
            update_enabled: quote_bool(update.is_some()),
            need_root: quote_bool(spec.need_root),
            update_mode: shell_quote(update.map(|u| u.mode.name()).unwrap_or_default()),
            update_version_url: shell_quote(update.map(|u| u.version_url.as_str()).unwrap_or_default()),
            update_package_url: shell_quote(update.map(|u| u.package_url.as_str()).unwrap_or_default()),
            encryption: EncryptionSnippets::for_params(params),
            update: match update {
                Some(_) => UpdateSnippets::enabled(params.is_some()),
                None => UpdateSnippets::disabled(),
            },
            manifest_block: render_manifest_block(&record.manifest.header_lines()),
        }
    }

    /// Placeholder name to replacement text
    pub fn substitution_table(&self) -> BTreeMap<&'static str, &str> {
        let Self {
            protocol_version,
            tool_version,
            build_version,
            created_at,
            build_user_host,
            platform_build,
            payload_marker,
            compression_method,
            tar_flags,
            archive_filename,
            archive_checksum,
            encrypted_checksum,
            post_extraction_script,
            encryption_enabled,
            update_enabled,
            need_root,
            update_mode,
            update_version_url,
            update_package_url,
            encryption:
                EncryptionSnippets {
                    vars,
                    functions,
                    logic,
                    cleanup,
                },
            update: UpdateSnippets {
                function,
                check_call,
            },
            manifest_block,
        } = self;

        BTreeMap::from([
            ("PROTOCOL_VERSION", protocol_version.as_str()),
            ("TOOL_VERSION", tool_version.as_str()),
            ("BUILD_VERSION", build_version.as_str()),
            ("CREATED_AT", created_at.as_str()),
            ("BUILD_USER_HOST", build_user_host.as_str()),
            ("PLATFORM_BUILD", platform_build.as_str()),
            ("PAYLOAD_MARKER", payload_marker.as_str()),
            ("COMPRESSION_METHOD", compression_method.as_str()),
            ("TAR_FLAGS", tar_flags.as_str()),
            ("ARCHIVE_FILENAME", archive_filename.as_str()),
            ("ARCHIVE_CHECKSUM", archive_checksum.as_str()),
            ("ENCRYPTED_CHECKSUM", encrypted_checksum.as_str()),
            ("POST_EXTRACTION_SCRIPT", post_extraction_script.as_str()),
            ("ENCRYPTION_ENABLED_BOOL", encryption_enabled.as_str()),
            ("UPDATE_ENABLED_BOOL", update_enabled.as_str()),
            ("NEED_ROOT_BOOL", need_root.as_str()),
            ("UPDATE_MODE", update_mode.as_str()),
            ("UPDATE_VERSION_URL", update_version_url.as_str()),
            ("UPDATE_PACKAGE_URL", update_package_url.as_str()),
            ("ENCRYPTION_VARS", vars.as_str()),
            ("ENCRYPTION_FUNCTIONS", functions.as_str()),
            ("DECRYPTION_LOGIC", logic.as_str()),
            ("DECRYPTION_CLEANUP", cleanup.as_str()),
            ("UPDATE_FUNCTION", function.as_str()),
            ("UPDATE_CHECK_CALL", check_call.as_str()),
            ("MANIFEST_BLOCK", manifest_block.as_str()),
        ])
    }
}
