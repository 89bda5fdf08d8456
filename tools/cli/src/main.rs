//! tvault-core - command line front end for the container engine.
//!
//! Every command prints `PROGRESS n` lines while it runs and finishes with a
//! single JSON line: the result, or an error report. Logs go to stderr.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tvault_app::{
    ContainerInfoArgs, DecryptArgs, EncryptArgs, Engine, JobEvent, JobHandle, ResealArgs,
};
use tvault_common::{EngineError, ErrorCode, ErrorReport};
use tvault_container::{EngineConfig, InfoSink};
use tvault_crypto::KdfParams;

/// Final JSON line of a command, or the error report to print instead.
type CmdResult = std::result::Result<serde_json::Value, ErrorReport>;

#[derive(Parser)]
#[command(name = "tvault-core")]
#[command(about = "tvault - encrypted container engine")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine configuration file (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// KDF strength: "interactive", "moderate", or "sensitive".
    #[arg(long, global = true)]
    kdf: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seal a folder into a new container.
    Seal(SealCmd),
    /// Restore a container into a folder.
    Unseal(UnsealCmd),
    /// Re-encrypt a container from its mount folder.
    Reseal(ResealCmd),
    /// Show a container's public header.
    Info(InfoCmd),
    /// List containers in a directory.
    Scan {
        /// Directory to scan (not recursive).
        #[arg(short, long)]
        dir: PathBuf,
    },
    /// Check that a container can be created at a path.
    CheckPath {
        #[arg(short, long)]
        path: PathBuf,

        /// Accept an existing file.
        #[arg(long)]
        overwrite: bool,
    },
    /// Estimate the entropy of bytes read from stdin.
    Entropy,
}

#[derive(Args)]
struct SealCmd {
    /// Folder to seal.
    #[arg(long)]
    folder_path: PathBuf,

    /// Container file to create.
    #[arg(long)]
    new_path: PathBuf,

    #[arg(long)]
    name: Option<String>,

    /// Passphrase, or seed material for master/share tokens.
    #[arg(long)]
    passphrase: Option<String>,

    /// Prompt for the passphrase instead.
    #[arg(long)]
    ask_passphrase: bool,

    /// Read key entropy from stdin.
    #[arg(long)]
    entropy_stdin: bool,

    #[arg(long)]
    comment: Option<String>,

    /// Comma-separated tags.
    #[arg(long)]
    tags: Option<String>,

    /// Compression: "zip" or "none".
    #[arg(long, default_value = "zip")]
    compression: String,

    /// Token type: "none", "master", or "share".
    #[arg(long, default_value = "none")]
    token_type: String,

    /// Where tokens are written besides stdout: "stdout" or "file".
    #[arg(long, default_value = "stdout")]
    token_writer: String,

    /// Token file path when --token-writer=file.
    #[arg(long)]
    token_path: Option<String>,

    #[arg(long)]
    shares: Option<u32>,

    #[arg(long)]
    threshold: Option<u32>,

    /// Integrity provider: "none" or "hmac".
    #[arg(long, default_value = "none")]
    integrity: String,

    #[arg(long)]
    integrity_password: Option<String>,

    /// Replace an existing container file.
    #[arg(long)]
    overwrite: bool,
}

#[derive(Args)]
struct TokenReadArgs {
    /// Token reader: "flag" or "file".
    #[arg(long)]
    token_reader: Option<String>,

    /// Token format: "plaintext" or "json".
    #[arg(long)]
    token_format: Option<String>,

    /// Token value when --token-reader=flag. Separate shares with '|'.
    #[arg(long)]
    token_flag: Option<String>,

    /// Token file when --token-reader=file.
    #[arg(long)]
    token_path: Option<String>,
}

#[derive(Args)]
struct UnsealCmd {
    #[arg(long)]
    current_path: PathBuf,

    /// Folder to restore into.
    #[arg(long)]
    folder_path: PathBuf,

    #[arg(long)]
    passphrase: Option<String>,

    /// Prompt for the passphrase instead.
    #[arg(long)]
    ask_passphrase: bool,

    #[arg(long)]
    master_token: Option<String>,

    #[command(flatten)]
    tokens: TokenReadArgs,

    #[arg(long)]
    integrity_password: Option<String>,
}

#[derive(Args)]
struct ResealCmd {
    #[arg(long)]
    current_path: PathBuf,

    /// Write the result here instead of replacing the current file.
    #[arg(long)]
    new_path: Option<PathBuf>,

    /// Folder whose contents become the new payload.
    #[arg(long)]
    folder_path: PathBuf,

    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    comment: Option<String>,

    #[arg(long)]
    tags: Option<String>,

    /// Current passphrase of a `none` container.
    #[arg(long)]
    passphrase: Option<String>,

    #[arg(long)]
    master_token: Option<String>,

    /// Share tokens of the current container.
    #[arg(long = "share", num_args = 1..)]
    shares: Vec<String>,

    /// Token type of the current container.
    #[arg(long)]
    token_type: Option<String>,

    /// JSON token file of the current container.
    #[arg(long)]
    token_json_path: Option<String>,

    /// Integrity provider after the reseal.
    #[arg(long)]
    integrity: Option<String>,

    #[arg(long)]
    current_integrity_password: Option<String>,

    #[arg(long)]
    new_integrity_password: Option<String>,

    /// New passphrase, or seed material for new tokens.
    #[arg(long)]
    new_passphrase: Option<String>,

    /// Re-key to this token type.
    #[arg(long)]
    rekey_token_type: Option<String>,

    #[arg(long)]
    rekey_shares: Option<u32>,

    #[arg(long)]
    rekey_threshold: Option<u32>,
}

#[derive(Args)]
struct InfoCmd {
    #[arg(short, long)]
    path: String,

    /// Also write the info: "stdout" or "file".
    #[arg(long, default_value = "stdout")]
    info_writer: String,

    /// Info file format: "json" or "plaintext".
    #[arg(long)]
    info_format: Option<String>,

    /// Info file path when --info-writer=file.
    #[arg(long)]
    info_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_ref(), cli.kdf.as_deref())?;
    let engine = Engine::new(config);

    let outcome = match cli.command {
        Commands::Seal(cmd) => cmd_seal(&engine, cmd).await,
        Commands::Unseal(cmd) => cmd_unseal(&engine, cmd).await,
        Commands::Reseal(cmd) => cmd_reseal(&engine, cmd).await,
        Commands::Info(cmd) => cmd_info(&engine, cmd).await,
        Commands::Scan { dir } => engine
            .scan_containers_directory(&dir.to_string_lossy())
            .map(|found| serde_json::json!(found))
            .map_err(|e| e.report()),
        Commands::CheckPath { path, overwrite } => engine
            .check_container_path(&path.to_string_lossy(), overwrite)
            .map(|()| serde_json::json!({ "path": path }))
            .map_err(|e| e.report()),
        Commands::Entropy => cmd_entropy(&engine),
    };

    match outcome {
        Ok(value) => {
            println!("{}", value);
            Ok(ExitCode::SUCCESS)
        }
        Err(report) => {
            println!("{}", serde_json::to_string(&report)?);
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Load the engine configuration.
///
/// An explicit `--config` must exist; the default location is optional.
fn load_config(path: Option<&PathBuf>, kdf: Option<&str>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => match dirs::config_dir() {
            Some(dir) => {
                let path = dir.join("tvault").join("config.json");
                EngineConfig::load_or_default(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?
            }
            None => EngineConfig::default(),
        },
    };

    if let Some(name) = kdf {
        let Some(params) = KdfParams::preset(name) else {
            anyhow::bail!("Invalid KDF strength. Use: interactive, moderate, or sensitive");
        };
        config.kdf = params;
        config.integrity_kdf = params;
    }
    debug!(?config, "Configuration loaded");
    Ok(config)
}

/// Prompt for a passphrase securely.
fn prompt_passphrase(prompt: &str) -> std::result::Result<String, ErrorReport> {
    rpassword::prompt_password(prompt)
        .map_err(|e| EngineError::wrap(ErrorCode::ContainerPassphraseRequired, e).report())
}

fn read_stdin() -> std::result::Result<Vec<u8>, ErrorReport> {
    let mut bytes = Vec::new();
    io::stdin()
        .read_to_end(&mut bytes)
        .map_err(|e| EngineError::wrap(ErrorCode::FileOperation, e).report())?;
    Ok(bytes)
}

/// Print progress lines until the job ends, then return its result.
async fn drive(engine: &Engine, mut handle: JobHandle) -> CmdResult {
    let run = async {
        while let Some(event) = handle.next().await {
            match event {
                JobEvent::Progress(n) => println!("PROGRESS {}", n),
                // Tokens are part of the result line.
                JobEvent::Stdout(_) => {}
                JobEvent::Done(output) => {
                    return serde_json::to_value(&output)
                        .map_err(|e| EngineError::wrap(ErrorCode::FileOperation, e).report());
                }
                JobEvent::Error(report) => return Err(report),
            }
        }
        Err(EngineError::new(ErrorCode::JobAborted).report())
    };
    match tokio::time::timeout(engine.job_timeout(), run).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::new(ErrorCode::JobTimeout).report()),
    }
}

fn path_arg(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn cmd_seal(engine: &Engine, cmd: SealCmd) -> CmdResult {
    let passphrase = match (cmd.passphrase, cmd.ask_passphrase) {
        (None, true) => Some(prompt_passphrase("Enter passphrase: ")?),
        (passphrase, _) => passphrase,
    };
    if cmd.entropy_stdin {
        let bits = engine.entropy_batch(&read_stdin()?);
        debug!(bits, "Entropy read from stdin");
    }

    let args = EncryptArgs {
        name: cmd.name,
        container_path: path_arg(&cmd.new_path),
        folder_path: path_arg(&cmd.folder_path),
        compression_type: cmd.compression,
        passphrase,
        token_type: cmd.token_type,
        token_save_type: cmd.token_writer,
        token_save_path: cmd.token_path,
        is_shamir_enabled: cmd.shares.is_some() || cmd.threshold.is_some(),
        number_of_shares: cmd.shares,
        threshold: cmd.threshold,
        integrity_provider: cmd.integrity,
        additional_password: cmd.integrity_password,
        comment: cmd.comment,
        tags: cmd.tags,
        use_entropy: cmd.entropy_stdin,
        overwrite: cmd.overwrite,
    };
    drive(engine, engine.run_encrypt(args)).await
}

async fn cmd_unseal(engine: &Engine, cmd: UnsealCmd) -> CmdResult {
    let token = match (cmd.passphrase, cmd.ask_passphrase) {
        (None, true) => Some(prompt_passphrase("Enter passphrase: ")?),
        (passphrase, _) => passphrase,
    };
    let args = DecryptArgs {
        container_path: path_arg(&cmd.current_path),
        folder_path: path_arg(&cmd.folder_path),
        token,
        master_token: cmd.master_token,
        token_reader_type: cmd.tokens.token_reader,
        token_format: cmd.tokens.token_format,
        token_flag: cmd.tokens.token_flag,
        token_path: cmd.tokens.token_path,
        additional_password: cmd.integrity_password,
    };
    drive(engine, engine.run_decrypt(args)).await
}

async fn cmd_reseal(engine: &Engine, cmd: ResealCmd) -> CmdResult {
    let args = ResealArgs {
        current_path: path_arg(&cmd.current_path),
        new_path: cmd.new_path.as_deref().map(path_arg),
        folder_path: path_arg(&cmd.folder_path),
        name: cmd.name,
        passphrase: cmd.passphrase,
        comment: cmd.comment,
        tags: cmd.tags,
        integrity_provider: cmd.integrity,
        current_integrity_password: cmd.current_integrity_password,
        new_integrity_password: cmd.new_integrity_password,
        master_token: cmd.master_token,
        shares: (!cmd.shares.is_empty()).then_some(cmd.shares),
        token_type: cmd.token_type,
        token_json_path: cmd.token_json_path,
        new_passphrase: cmd.new_passphrase,
        rekey_token_type: cmd.rekey_token_type,
        rekey_shares: cmd.rekey_shares,
        rekey_threshold: cmd.rekey_threshold,
    };
    drive(engine, engine.run_reseal(args)).await
}

async fn cmd_info(engine: &Engine, cmd: InfoCmd) -> CmdResult {
    let sink = InfoSink::from_args(
        &cmd.info_writer,
        cmd.info_format.as_deref(),
        cmd.info_path.as_deref(),
    )
    .map_err(|e| e.report())?;

    let result = engine.container_info_once(&ContainerInfoArgs { path: cmd.path });
    if let Some(report) = result.error {
        return Err(report);
    }
    let Some(info) = result.data else {
        return Err(EngineError::new(ErrorCode::ContainerOpenFile).report());
    };
    sink.write(&info).map_err(|e| e.report())?;
    serde_json::to_value(&info).map_err(|e| EngineError::wrap(ErrorCode::FileOperation, e).report())
}

fn cmd_entropy(engine: &Engine) -> CmdResult {
    let bits = engine.entropy_batch(&read_stdin()?);
    Ok(serde_json::json!({
        "bits": bits,
        "target": engine.config().entropy_target_bits,
        "ready": engine.entropy_ready(),
    }))
}
