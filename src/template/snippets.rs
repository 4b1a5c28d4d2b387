//! Shell text for the optional sub-protocols
//!
//! Decryption (bounded retry, env-supplied password) and self-update
//! (downloader detection, feed parsing, token check, checksum, the four
//! update modes). Disabled features render as inert comments so the
//! surrounding template stays valid shell.

use shellpack_protocol::header::shell_quote;
use shellpack_protocol::{
    TokenParams, CIPHER_PASS_ENV, MAX_DECRYPT_ATTEMPTS, PASSWORD_CHECK_TOKEN, PASSWORD_ENV, UPDATE_TIMEOUT_SECS,
};

/// Encryption-related shell fragments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionSnippets {
    /// Top-level `SP_ENC_*` assignments
    pub vars: String,
    /// Prompt and decrypt helpers
    pub functions: String,
    /// Decrypt step in the main flow
    pub logic: String,
    /// Extra cleanup of decrypted intermediates
    pub cleanup: String,
}

impl EncryptionSnippets {
    pub fn disabled() -> Self {
        Self {
            vars: "# payload is not encrypted".to_string(),
            functions: "# no decryption helpers".to_string(),
            logic: "    : # payload is not encrypted".to_string(),
            cleanup: "    :".to_string(),
        }
    }

    /// Snippets for the cipher the archive was actually encrypted with
    pub fn enabled(params: &TokenParams) -> Self {
        let iter = params.iter.map(|i| i.to_string()).unwrap_or_default();
        let s2k = params.s2k_options.as_deref().unwrap_or_default();
        let vars = [
            format!("SP_ENC_TOOL={}", shell_quote(&params.tool)),
            format!("SP_ENC_CIPHER={}", shell_quote(&params.cipher)),
            format!("SP_ENC_ITER={}", shell_quote(&iter)),
            format!("SP_ENC_S2K={}", shell_quote(s2k)),
            format!("SP_TOKEN_PLAINTEXT={}", shell_quote(PASSWORD_CHECK_TOKEN)),
            format!("SP_MAX_ATTEMPTS={}", MAX_DECRYPT_ATTEMPTS),
        ]
        .join("\n");

        Self {
            vars,
            functions: DECRYPT_FUNCTIONS
                .replace("@PASSWORD_ENV@", PASSWORD_ENV)
                .replace("@CIPHER_PASS_ENV@", CIPHER_PASS_ENV),
            logic: DECRYPT_LOGIC.to_string(),
            cleanup: DECRYPT_CLEANUP.to_string(),
        }
    }

    pub fn for_params(params: Option<&TokenParams>) -> Self {
        params.map(Self::enabled).unwrap_or_else(Self::disabled)
    }
}

/// Update-related shell fragments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSnippets {
    /// `sp_update_check` and its helpers
    pub function: String,
    /// Call site in the main flow
    pub check_call: String,
}

impl UpdateSnippets {
    pub fn disabled() -> Self {
        Self {
            function: "# self-update disabled".to_string(),
            check_call: "    : # self-update disabled".to_string(),
        }
    }

    /// `encrypted` adds the password-token check before any download
    pub fn enabled(encrypted: bool) -> Self {
        let mut function = UPDATE_HELPERS.replace("@TIMEOUT@", &UPDATE_TIMEOUT_SECS.to_string());
        if encrypted {
            function.push_str(TOKEN_HELPERS);
        }
        function.push_str(UPDATE_CHECK_HEAD);
        if encrypted {
            function.push_str(TOKEN_CHECK);
        }
        function.push_str(UPDATE_CHECK_TAIL);

        Self {
            function,
            check_call: UPDATE_CALL.to_string(),
        }
    }
}

const DECRYPT_FUNCTIONS: &str = r#"sp_prompt_secret() {
    local secret=""
    { : >/dev/tty; } 2>/dev/null || return 1
    printf '%s: ' "$1" > /dev/tty
    IFS= read -r -s secret < /dev/tty || return 1
    printf '\n' > /dev/tty
    printf '%s' "$secret"
}

# tool cipher iter input output password
sp_decrypt_with() {
    case "$1" in
        openssl)
            @CIPHER_PASS_ENV@="$6" openssl enc -d -"$2" -pbkdf2 -iter "$3" \
                -pass env:@CIPHER_PASS_ENV@ -in "$4" -out "$5" 2>/dev/null
            ;;
        gpg)
            gpg --quiet --batch --yes --no-symkey-cache --pinentry-mode loopback \
                --passphrase "$6" --output "$5" --decrypt "$4" 2>/dev/null
            ;;
        *)
            return 1
            ;;
    esac
}

sp_decrypt_payload() {
    local attempt=1 password=""
    if ! command -v "$SP_ENC_TOOL" >/dev/null 2>&1; then
        sp_error "$SP_ENC_TOOL is required to decrypt this package"
        return 1
    fi
    while [ "$attempt" -le "$SP_MAX_ATTEMPTS" ]; do
        if [ -n "${@PASSWORD_ENV@:-}" ]; then
            password="$@PASSWORD_ENV@"
            unset @PASSWORD_ENV@
        elif ! password=$(sp_prompt_secret "Password"); then
            sp_error "no terminal available to read the password"
            return 1
        fi
        if sp_decrypt_with "$SP_ENC_TOOL" "$SP_ENC_CIPHER" "$SP_ENC_ITER" "$1" "$2" "$password" \
            && sp_sum_matches "$2" "$SP_ARCHIVE_SHA256"; then
            password=""
            return 0
        fi
        password=""
        rm -f "$2"
        sp_warn "wrong password ($attempt/$SP_MAX_ATTEMPTS)"
        attempt=$((attempt + 1))
    done
    return 1
}"#;

const DECRYPT_LOGIC: &str = r#"    sp_sum_matches "$SP_PAYLOAD" "$SP_ENCRYPTED_SHA256" || sp_die "encrypted payload checksum mismatch"
    SP_ARCHIVE="$SP_WORK/$SP_ARCHIVE_NAME"
    sp_decrypt_payload "$SP_PAYLOAD" "$SP_ARCHIVE" || sp_die "decryption failed"
    rm -f "$SP_PAYLOAD""#;

const DECRYPT_CLEANUP: &str = r#"    if [ -n "$SP_WORK" ]; then
        rm -f "$SP_WORK/$SP_ARCHIVE_NAME"
    fi"#;

const UPDATE_HELPERS: &str = r#"SP_UPDATE_TIMEOUT=@TIMEOUT@
SP_DOWNLOADER=""

# Value of a top-level "key": value line in pretty-printed JSON
sp_json_field() {
    sed -n 's/^[[:space:]]*"'"$2"'"[[:space:]]*:[[:space:]]*"\{0,1\}\([^",]*\)"\{0,1\},\{0,1\}[[:space:]]*$/\1/p' "$1" | head -n 1
}

sp_detect_downloader() {
    if command -v curl >/dev/null 2>&1; then
        SP_DOWNLOADER=curl
    elif command -v wget >/dev/null 2>&1; then
        SP_DOWNLOADER=wget
    else
        return 1
    fi
}

sp_fetch_feed() {
    case "$SP_DOWNLOADER" in
        curl) curl -fsSL --max-time "$SP_UPDATE_TIMEOUT" -o "$2" "$1" ;;
        wget) wget -q -T "$SP_UPDATE_TIMEOUT" -t 1 -O "$2" "$1" ;;
    esac
}

sp_fetch_package() {
    case "$SP_DOWNLOADER" in
        curl) curl -fsSL --connect-timeout "$SP_UPDATE_TIMEOUT" -o "$2" "$1" ;;
        wget) wget -q -T "$SP_UPDATE_TIMEOUT" -O "$2" "$1" ;;
    esac
}

sp_is_newer() {
    case "$1$2" in
        *[!0-9]*) [ "$1" != "$2" ] ;;
        *) [ "$1" -gt "$2" ] ;;
    esac
}

sp_confirm() {
    local answer=""
    { : >/dev/tty; } 2>/dev/null || return 1
    printf '%s [y/N] ' "$1" > /dev/tty
    IFS= read -r answer < /dev/tty || return 1
    case "$answer" in
        y|Y|yes|YES) return 0 ;;
        *) return 1 ;;
    esac
}

sp_save_beside() {
    local target="$1"
    if [ "$target" = "$SP_SELF" ]; then
        target="$target.new"
    fi
    if cp "$2" "$target" && chmod +x "$target"; then
        sp_info "saved build $3 to $target"
    else
        rm -f "$target"
        sp_warn "update skipped: cannot write $target"
    fi
}

sp_replace_self() {
    local staged="$SP_SELF.new.$$"
    if ! { cp "$1" "$staged" && chmod +x "$staged"; }; then
        rm -f "$staged"
        sp_warn "update skipped: cannot write next to $SP_SELF"
        return 0
    fi
    if ! cp -p "$SP_SELF" "$SP_SELF.bak"; then
        rm -f "$staged"
        sp_warn "update skipped: cannot back up $SP_SELF"
        return 0
    fi
    if ! mv -f "$staged" "$SP_SELF"; then
        rm -f "$staged"
        sp_warn "update skipped: cannot replace $SP_SELF"
        return 0
    fi
    sp_info "updated to build $2, previous version kept as $SP_SELF.bak"
    sp_cleanup
    exec "$SP_SELF" --no-update-check ${SP_ARGS[@]+"${SP_ARGS[@]}"}
}
"#;

const TOKEN_HELPERS: &str = r#"
# feed token password
sp_verify_token() {
    local tool cipher iter plain
    tool=$(sp_json_field "$1" tool)
    cipher=$(sp_json_field "$1" cipher)
    iter=$(sp_json_field "$1" iter)
    [ -n "$tool" ] || tool="$SP_ENC_TOOL"
    [ -n "$cipher" ] || cipher="$SP_ENC_CIPHER"
    [ -n "$iter" ] || iter="$SP_ENC_ITER"
    printf '%s' "$2" | sp_b64_decode > "$SP_WORK/token.enc" 2>/dev/null || return 1
    if ! sp_decrypt_with "$tool" "$cipher" "$iter" "$SP_WORK/token.enc" "$SP_WORK/token.txt" "$3"; then
        rm -f "$SP_WORK/token.enc" "$SP_WORK/token.txt"
        return 1
    fi
    plain=$(cat "$SP_WORK/token.txt")
    rm -f "$SP_WORK/token.enc" "$SP_WORK/token.txt"
    [ "$plain" = "$SP_TOKEN_PLAINTEXT" ]
}
"#;

const UPDATE_CHECK_HEAD: &str = r#"
sp_update_check() {
    local feed remote checksum download target
    if ! sp_detect_downloader; then
        sp_warn "update check skipped: neither curl nor wget is installed"
        return 0
    fi
    feed="$SP_WORK/feed.json"
    sp_debug "fetching $SP_VERSION_URL"
    if ! sp_fetch_feed "$SP_VERSION_URL" "$feed"; then
        sp_warn "update check skipped: could not fetch $SP_VERSION_URL"
        return 0
    fi
    remote=$(sp_json_field "$feed" build_version)
    if [ -z "$remote" ]; then
        sp_warn "update check skipped: the feed has no build_version"
        return 0
    fi
    if [ "$SP_OPT_FORCE_DOWNLOAD" = false ] && ! sp_is_newer "$remote" "$SP_BUILD_VERSION"; then
        sp_info "up to date (build $SP_BUILD_VERSION)"
        return 0
    fi
    sp_info "build $remote is available (running $SP_BUILD_VERSION)"
    if [ "$SP_UPDATE_MODE" = check-only ]; then
        sp_info "download it from $SP_PACKAGE_URL"
        return 0
    fi
"#;

const TOKEN_CHECK: &str = r#"
    local token password
    token=$(sp_json_field "$feed" password_check_token_b64)
    if [ -z "$token" ] || [ "$token" = null ]; then
        sp_warn "update skipped: the feed has no password check token"
        return 0
    fi
    if ! password=$(sp_prompt_secret "Password for build $remote"); then
        sp_warn "update skipped: no terminal available to read the password"
        return 0
    fi
    if ! sp_verify_token "$feed" "$token" "$password"; then
        password=""
        sp_warn "update skipped: password rejected by the published token"
        return 0
    fi
    password=""
    sp_info "password accepted"
"#;

const UPDATE_CHECK_TAIL: &str = r#"
    checksum=$(sp_json_field "$feed" script_checksum_sha256)
    if [ -z "$checksum" ] || [ "$checksum" = null ]; then
        sp_warn "update skipped: the feed has no artifact checksum"
        return 0
    fi
    download="$SP_WORK/download"
    if ! sp_fetch_package "$SP_PACKAGE_URL" "$download"; then
        rm -f "$download"
        sp_warn "update skipped: download of $SP_PACKAGE_URL failed"
        return 0
    fi
    if ! sp_sum_matches "$download" "$checksum"; then
        rm -f "$download"
        sp_warn "update skipped: the download does not match the published checksum"
        return 0
    fi
    target="$SP_SELF_DIR/$(basename "${SP_PACKAGE_URL%%\?*}")"

    case "$SP_UPDATE_MODE" in
        download-only)
            sp_save_beside "$target" "$download" "$remote"
            ;;
        auto-replace)
            if sp_confirm "Replace $SP_SELF with build $remote?"; then
                sp_replace_self "$download" "$remote"
            else
                sp_save_beside "$target" "$download" "$remote"
            fi
            ;;
        auto-replace-always)
            sp_replace_self "$download" "$remote"
            ;;
    esac
    return 0
}"#;

const UPDATE_CALL: &str = r#"    if [ "$SP_OPT_NO_UPDATE" = false ]; then
        sp_update_check
    fi"#;
