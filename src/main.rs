//! shellpack CLI
//!
//! Entry point for the `shellpack` command-line tool.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use shellpack::config::{sidecar, BuiltinDefaults, DEFAULT_CONFIG_FILE};
use shellpack::context::ColorPolicy;
use shellpack::crypto::{verify_published_token, Password};
use shellpack::inspect::inspect_artifact;
use shellpack::runtime::{
    EnvPassword, FixedPasswords, Interaction, PasswordChain, TtyInteraction, UpdateOutcome,
};
use shellpack::signal::{SignalHandler, TempRegistry};
use shellpack::{
    BuildContext, BuildError, BuildPipeline, BuildSpec, EffectiveConfig, RunOptions, Runner,
    RuntimeError, Verbosity,
};
use shellpack_protocol::{UpdateFeed, PASSWORD_ENV};

#[derive(Parser)]
#[command(name = "shellpack")]
#[command(about = "Build and run self-extracting shell artifacts", version)]
struct Cli {
    /// More output (debug level)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    /// Colorize log output
    #[arg(long, global = true, value_enum, default_value_t = ColorPolicy::Auto)]
    color: ColorPolicy,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an artifact from a content directory
    Build {
        /// Config file (default: ./shellpack.toml when present)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Output artifact path
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,

        /// Content directory to pack
        #[arg(long)]
        content: Option<PathBuf>,

        /// Compression method (store, gzip, bzip2, xz)
        #[arg(long)]
        compression: Option<String>,

        /// Compression level (1-9)
        #[arg(long)]
        level: Option<u32>,

        /// Encrypt the archive
        #[arg(long, overrides_with = "no_encrypt")]
        encrypt: bool,

        /// Do not encrypt, whatever the config says
        #[arg(long)]
        no_encrypt: bool,

        /// Add the standard exclusion catalogue
        #[arg(long)]
        standard_excludes: bool,

        /// Keep the work directory and write the effective config beside the artifact
        #[arg(long)]
        debug: bool,
    },

    /// Run an artifact with the reference runner
    Extract {
        /// Artifact to run
        artifact: PathBuf,

        /// Extract into DIR instead of a temporary directory
        #[arg(long, short = 'd')]
        dir: Option<PathBuf>,

        /// Extract without running the entry point
        #[arg(long, short = 'x')]
        extract_only: bool,

        /// Download the published build even if it is not newer
        #[arg(long)]
        force_download: bool,

        #[arg(long)]
        no_update_check: bool,

        /// Skip manifest verification
        #[arg(long)]
        no_verify: bool,

        /// Keep temporary files
        #[arg(long)]
        no_cleanup: bool,

        /// Keep temporary files and log every step
        #[arg(long)]
        debug: bool,

        /// Read the password from the first line of FILE
        #[arg(long)]
        password_file: Option<PathBuf>,

        /// Arguments for the entry point (after --)
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Show the build facts embedded in an artifact
    Inspect {
        artifact: PathBuf,

        /// Output JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Write a commented default config file
    Init {
        /// Where to write (default: ./shellpack.toml)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Check a password against the token in an update feed
    VerifyToken {
        /// Update feed JSON file
        #[arg(long)]
        feed: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let verbosity = Verbosity::from_flags(cli.verbose, cli.quiet);

    let code = match run(cli, verbosity) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            exit_code_for(&e)
        }
    };
    process::exit(code);
}

fn exit_code_for(e: &anyhow::Error) -> i32 {
    if let Some(build) = e.downcast_ref::<BuildError>() {
        build.exit_code()
    } else if let Some(runtime) = e.downcast_ref::<RuntimeError>() {
        runtime.exit_code()
    } else {
        1
    }
}

fn run(cli: Cli, verbosity: Verbosity) -> Result<i32> {
    let temps = TempRegistry::new();
    SignalHandler::new(&temps)
        .install()
        .context("failed to install signal handler")?;
    let ctx = BuildContext::new(verbosity)
        .with_color(cli.color)
        .with_temps(temps);

    match cli.command {
        Commands::Build {
            config,
            output,
            content,
            compression,
            level,
            encrypt,
            no_encrypt,
            standard_excludes,
            debug,
        } => {
            let overrides = BuildOverrides {
                output,
                content,
                compression,
                level,
                encrypt: match (encrypt, no_encrypt) {
                    (true, _) => Some(true),
                    (false, true) => Some(false),
                    _ => None,
                },
                standard_excludes,
            };
            run_build(ctx.with_debug(debug), config, overrides)
        }
        Commands::Extract {
            artifact,
            dir,
            extract_only,
            force_download,
            no_update_check,
            no_verify,
            no_cleanup,
            debug,
            password_file,
            args,
        } => {
            let verbosity = if debug { Verbosity::Verbose } else { ctx.verbosity };
            init_logging(verbosity, ctx.color, None)?;
            let options = RunOptions {
                dir,
                extract_only,
                force_download,
                no_update_check,
                no_verify,
                no_cleanup,
                debug,
                entry_args: args,
            };
            run_extract(&ctx, &artifact, options, password_file.as_deref())
        }
        Commands::Inspect { artifact, json } => {
            init_logging(ctx.verbosity, ctx.color, None)?;
            let summary = inspect_artifact(&artifact)?;
            if json {
                println!("{}", summary.to_json()?);
            } else {
                println!("{}", artifact.display());
                print!("{}", summary.to_human());
            }
            Ok(0)
        }
        Commands::Init { path, force } => {
            init_logging(ctx.verbosity, ctx.color, None)?;
            run_init(path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE)), force)
        }
        Commands::VerifyToken { feed } => {
            init_logging(ctx.verbosity, ctx.color, None)?;
            run_verify_token(&feed)
        }
    }
}

/// Install the global subscriber: stderr at the verbosity level (`RUST_LOG`
/// overrides), plus an optional plain-text file sink at its own level
fn init_logging(
    verbosity: Verbosity,
    color: ColorPolicy,
    log_file: Option<(&Path, &str)>,
) -> Result<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.filter_directive()));
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(color.enabled())
        .with_target(false)
        .with_filter(console_filter);

    let file_layer = match log_file {
        Some((path, level)) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_filter(filter),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .context("failed to initialize logging")?;
    Ok(())
}

/// CLI values layered over the config file
#[derive(Debug, Default)]
struct BuildOverrides {
    output: Option<PathBuf>,
    content: Option<PathBuf>,
    compression: Option<String>,
    level: Option<u32>,
    encrypt: Option<bool>,
    standard_excludes: bool,
}

impl BuildOverrides {
    /// Overrides as a config layer; relative paths are made absolute
    /// against the working directory first
    fn to_value(&self, cwd: &Path) -> Value {
        let mut root = Value::Object(Map::new());
        let path = |p: &PathBuf| Value::String(cwd.join(p).to_string_lossy().into_owned());
        if let Some(output) = &self.output {
            set(&mut root, &["output", "path"], path(output));
        }
        if let Some(content) = &self.content {
            set(&mut root, &["content"], path(content));
        }
        if let Some(method) = &self.compression {
            set(&mut root, &["compression", "method"], Value::from(method.as_str()));
        }
        if let Some(level) = self.level {
            set(&mut root, &["compression", "level"], Value::from(level));
        }
        if let Some(encrypt) = self.encrypt {
            set(&mut root, &["encryption", "enabled"], Value::from(encrypt));
        }
        if self.standard_excludes {
            set(&mut root, &["exclude", "standard"], Value::from(true));
        }
        root
    }
}

fn set(root: &mut Value, keys: &[&str], value: Value) {
    let Some((last, parents)) = keys.split_last() else {
        return;
    };
    let mut current = root;
    for key in parents {
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
    }
}

fn run_build(ctx: BuildContext, config: Option<PathBuf>, overrides: BuildOverrides) -> Result<i32> {
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    let config_path = config.or_else(|| {
        let default = cwd.join(DEFAULT_CONFIG_FILE);
        default.exists().then_some(default)
    });

    let effective = EffectiveConfig::build(
        config_path.as_deref(),
        Some(overrides.to_value(&cwd)),
        &cwd,
    )
    .map_err(BuildError::from)
    .context("loading configuration")?;
    let spec = BuildSpec::from_value(&effective)
        .map_err(BuildError::from)
        .context("validating configuration")?;

    let verbosity = if ctx.debug { Verbosity::Verbose } else { ctx.verbosity };
    init_logging(
        verbosity,
        ctx.color,
        spec.log_file.as_deref().map(|p| (p, spec.log_level.as_str())),
    )?;
    match &config_path {
        Some(path) => info!("Using config {}", path.display()),
        None => debug!("No config file, using defaults"),
    }
    for source in &effective.sources {
        debug!(
            "Config layer {:?} {} {}",
            source.origin,
            source.path.as_deref().unwrap_or("-"),
            source.digest.as_deref().unwrap_or("-")
        );
    }
    if ctx.debug {
        let dump = sidecar(&spec.output, "config.json");
        effective
            .write_to_file(&dump)
            .with_context(|| format!("writing {}", dump.display()))?;
        info!(
            "Effective config written to {} ({} values redacted)",
            dump.display(),
            effective.redactions.len()
        );
    }

    let mut pipeline = BuildPipeline::new(&spec, &ctx);
    if spec.encryption.is_enabled() {
        pipeline = pipeline.with_password(build_password()?);
    }
    let report = pipeline.run().context("build failed")?;

    if !ctx.is_quiet() {
        let manifest = report.manifest();
        println!("Built {}", report.artifact.display());
        println!("  Build:    {}", report.build_version);
        println!(
            "  Files:    {} included, {} excluded",
            manifest.files.len(),
            manifest.excluded.len()
        );
        println!("  SHA-256:  {}", report.artifact_sha256);
        println!("  Encrypted: {}", if report.is_encrypted() { "yes" } else { "no" });
        if let Some(path) = &report.metadata_path {
            println!("  Metadata: {}", path.display());
        }
        if let Some(path) = &report.feed_path {
            println!("  Feed:     {}", path.display());
        }
    }
    Ok(0)
}

/// `SHELLPACK_PASSWORD`, or a confirmed prompt on the terminal
fn build_password() -> Result<Password> {
    if let Ok(value) = std::env::var(PASSWORD_ENV) {
        if !value.is_empty() {
            debug!("Using password from {}", PASSWORD_ENV);
            return Ok(Password::new(value));
        }
    }

    let mut tty = TtyInteraction::new();
    let first = tty
        .prompt_secret("Encryption password")
        .filter(|p| !p.is_empty())
        .map(Password::new)
        .ok_or(BuildError::MissingPassword)?;
    let second = tty
        .prompt_secret("Confirm password")
        .map(Password::new)
        .ok_or(BuildError::MissingPassword)?;
    if first != second {
        return Err(BuildError::MissingPassword).context("passwords do not match");
    }
    Ok(first)
}

fn run_extract(
    ctx: &BuildContext,
    artifact: &Path,
    options: RunOptions,
    password_file: Option<&Path>,
) -> Result<i32> {
    let mut passwords = PasswordChain::new();
    if let Some(path) = password_file {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read password file {}", path.display()))?;
        let first = text.lines().next().unwrap_or_default().to_string();
        passwords = passwords.then(FixedPasswords::new([first]));
    }
    passwords = passwords.then(EnvPassword::new());

    let outcome = Runner::new(artifact, options)
        .with_passwords(passwords)
        .with_temps(ctx.temps.clone())
        .run()
        .with_context(|| format!("running {}", artifact.display()))?;

    match &outcome.update {
        Some(Ok(UpdateOutcome::Available { version })) => {
            info!("Build {} is available", version)
        }
        Some(Ok(UpdateOutcome::Downloaded { version, path })) => {
            info!("Build {} saved to {}", version, path.display())
        }
        Some(Err(reason)) => warn!("Update check failed: {}", reason),
        _ => {}
    }
    if outcome.extract_dir_kept && !ctx.is_quiet() {
        println!("{}", outcome.extract_dir.display());
    }
    Ok(outcome.entry_status.unwrap_or(0))
}

fn run_init(path: PathBuf, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    fs::write(&path, BuiltinDefaults::default().to_toml_template())
        .with_context(|| format!("cannot write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(0)
}

fn run_verify_token(feed_path: &Path) -> Result<i32> {
    let json = fs::read_to_string(feed_path)
        .with_context(|| format!("cannot read {}", feed_path.display()))?;
    let feed = UpdateFeed::from_json(&json).context("invalid update feed")?;
    if !feed.has_token() {
        bail!("feed for build {} has no password check token", feed.build_version);
    }
    let (Some(token), Some(params)) = (
        feed.password_check_token_b64.as_deref(),
        feed.token_encryption_params.as_ref(),
    ) else {
        bail!("feed for build {} has no token parameters", feed.build_version);
    };

    let password = match std::env::var(PASSWORD_ENV).ok().filter(|v| !v.is_empty()) {
        Some(value) => Password::new(value),
        None => TtyInteraction::new()
            .prompt_secret(&format!("Password for build {}", feed.build_version))
            .map(Password::new)
            .context("no password available")?,
    };

    if verify_published_token(token, params, &password)? {
        println!("Password accepted for build {}", feed.build_version);
        Ok(0)
    } else {
        println!("Password rejected for build {}", feed.build_version);
        Ok(1)
    }
}
