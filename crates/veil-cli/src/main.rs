//! veil: confidential chunked transfer CLI
//!
//!   keygen                         - create a local Ed25519 identity
//!   whoami                         - print principal and X25519 public key
//!   upload <file>                  - encrypt, upload and register a file
//!   download <address> <owner>     - fetch and decrypt a file you may read
//!   resume <session>               - continue an interrupted transfer
//!   share / revoke-access          - manage time-bounded grants
//!   revoke-file / rotate-key       - owner-side ledger operations
//!   sessions                       - list, abort or remove resumable sessions
//!   check [--probe <address>]      - storage and gateway health
//!   config show                    - display current configuration

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use veil_core::config::{expand_tilde, StorageScheme, VeilConfig};
use veil_core::{unix_now, ContentAddress};
use veil_crypto::{
    derive_keypair, parse_public_key, Ed25519Signer, Signer, KEY_DERIVATION_CHALLENGE,
};
use veil_storage::{
    build_from_config, check_health, Endpoint, GatewayFetcher, OperatorSink, S3Credentials,
};
use veil_transfer::{
    Direction, LocalLedger, SessionStore, SystemClock, TransferEngine, TransferOptions,
    TransferSession,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "veil",
    version,
    about = "Confidential chunked file transfer",
    long_about = "veil: end-to-end encrypted, resumable uploads and ledger-controlled sharing"
)]
struct Cli {
    /// Path to veil.toml configuration file
    #[arg(long, short = 'c', env = "VEIL_CONFIG", default_value = "~/.config/veil/veil.toml")]
    config: PathBuf,

    /// Log format (overrides logging.format)
    #[arg(long, env = "VEIL_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a local Ed25519 identity at signer.identity_file
    Keygen {
        /// Overwrite an existing identity
        #[arg(long)]
        force: bool,
    },

    /// Print the principal name and its derived X25519 public key
    Whoami,

    /// Encrypt and upload a file, then register it on the ledger
    ///
    /// S3 credentials are read from AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY
    /// (VEIL_ACCESS_KEY_ID / VEIL_SECRET_ACCESS_KEY are accepted as fallbacks).
    Upload {
        file: PathBuf,
        /// MIME type recorded in the manifest (default: guessed from extension)
        #[arg(long)]
        mime: Option<String>,
        /// Parallel chunk workers (overrides transfer.concurrency)
        #[arg(long, short = 'j')]
        jobs: Option<usize>,
    },

    /// Download and decrypt a file by manifest address
    Download {
        /// Manifest content address (64 hex chars)
        address: String,
        /// Principal that registered the file
        owner: String,
        /// Destination path (default: ./<address prefix>)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        #[arg(long, short = 'j')]
        jobs: Option<usize>,
    },

    /// Resume an interrupted upload or download
    Resume {
        session: String,
        #[arg(long, short = 'j')]
        jobs: Option<usize>,
    },

    /// Grant a principal time-bounded read access
    Share {
        address: String,
        /// Grantee principal name
        #[arg(long)]
        grantee: String,
        /// Grantee X25519 public key, hex (from their `veil whoami`)
        #[arg(long)]
        grantee_key: String,
        /// Window start, Unix seconds (default: now)
        #[arg(long)]
        from: Option<u64>,
        /// Window end, Unix seconds (exclusive)
        #[arg(long, conflicts_with = "duration")]
        to: Option<u64>,
        /// Window length, e.g. 3600, 90m, 12h, 7d (default: 7d)
        #[arg(long)]
        duration: Option<String>,
    },

    /// Revoke one grantee's access
    #[command(name = "revoke-access")]
    RevokeAccess { address: String, grantee: String },

    /// Revoke a file entirely; every grant stops working
    #[command(name = "revoke-file")]
    RevokeFile { address: String },

    /// Re-wrap the owner's file key (optionally for a new owner public key)
    #[command(name = "rotate-key")]
    RotateKey {
        address: String,
        /// New owner X25519 public key, hex
        #[arg(long)]
        new_owner_key: Option<String>,
    },

    /// Inspect resumable sessions
    Sessions {
        #[command(subcommand)]
        action: Option<SessionAction>,
    },

    /// Check storage health and probe retrieval endpoints
    Check {
        /// Fetch this content address from every endpoint
        #[arg(long)]
        probe: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum SessionAction {
    /// List sessions, newest first
    List,
    /// Show one session snapshot as JSON
    Show { id: String },
    /// Park a session as aborted (it stays resumable)
    Abort { id: String },
    /// Delete a session snapshot
    Rm { id: String },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let (config, found) = load_config(&config_path).await?;

    let format = cli.log_format.clone().unwrap_or(match config.logging.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&config.logging.level, &format);
    if !found {
        tracing::warn!("config file not found: {}  (using defaults)", config_path.display());
    }

    match cli.command {
        Commands::Keygen { force } => cmd_keygen(&config, force),
        Commands::Whoami => cmd_whoami(&config).await,
        Commands::Upload { file, mime, jobs } => cmd_upload(&config, &file, mime, jobs).await,
        Commands::Download {
            address,
            owner,
            output,
            jobs,
        } => cmd_download(&config, &address, &owner, output, jobs).await,
        Commands::Resume { session, jobs } => cmd_resume(&config, &session, jobs).await,
        Commands::Share {
            address,
            grantee,
            grantee_key,
            from,
            to,
            duration,
        } => {
            cmd_share(&config, &address, &grantee, &grantee_key, from, to, duration.as_deref())
                .await
        }
        Commands::RevokeAccess { address, grantee } => {
            let engine = build_engine(&config)?;
            let signer = load_signer(&config)?;
            engine
                .revoke_access(&parse_address(&address)?, &grantee, signer.principal())
                .await
                .context("revoking access")?;
            println!("revoked {grantee} on {}", short(&address));
            Ok(())
        }
        Commands::RevokeFile { address } => {
            let engine = build_engine(&config)?;
            let signer = load_signer(&config)?;
            engine
                .revoke_file(&parse_address(&address)?, signer.principal())
                .await
                .context("revoking file")?;
            println!("revoked file {}", short(&address));
            Ok(())
        }
        Commands::RotateKey {
            address,
            new_owner_key,
        } => cmd_rotate_key(&config, &address, new_owner_key.as_deref()).await,
        Commands::Sessions { action } => cmd_sessions(&config, action.unwrap_or(SessionAction::List)),
        Commands::Check { probe } => cmd_check(&config, probe.as_deref()).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path, found),
    }
}

// ── Config, logging, wiring ───────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<(VeilConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config = VeilConfig::from_toml(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((VeilConfig::default(), false))
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_env("VEIL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// S3 credentials from AWS_* (standard) or VEIL_* environment variables.
fn s3_credentials_from_env() -> Result<S3Credentials> {
    let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
        .or_else(|_| std::env::var("VEIL_ACCESS_KEY_ID"))
        .context(
            "S3 credentials not set\n\
             Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.\n\
             Example:\n\
             \texport AWS_ACCESS_KEY_ID=your-key\n\
             \texport AWS_SECRET_ACCESS_KEY=your-secret",
        )?;
    let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
        .or_else(|_| std::env::var("VEIL_SECRET_ACCESS_KEY"))
        .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
    Ok(S3Credentials {
        access_key_id,
        secret_access_key,
    })
}

fn build_operator(config: &VeilConfig) -> Result<opendal::Operator> {
    let creds = match config.storage.scheme {
        StorageScheme::S3 => Some(s3_credentials_from_env()?),
        _ => None,
    };
    build_from_config(&config.storage, creds.as_ref()).context("building storage operator")
}

fn build_engine(config: &VeilConfig) -> Result<TransferEngine> {
    let op = build_operator(config)?;
    let prefix = config.storage.prefix.as_str();

    let sink = OperatorSink::new(op.clone(), prefix, config.storage.put_timeout());
    let fetcher = GatewayFetcher::from_config(
        &config.gateway,
        config.storage.enforce_tls,
        Some(Endpoint::storage_readback(op, prefix)),
    )
    .context("configuring retrieval endpoints")?;

    let ledger_path = expand_tilde(&config.ledger.path);
    let ledger = LocalLedger::open(&ledger_path, Arc::new(SystemClock))
        .with_context(|| format!("opening ledger: {}", ledger_path.display()))?;

    let session_dir = expand_tilde(&config.transfer.session_dir);
    let store = SessionStore::open(&session_dir)
        .with_context(|| format!("opening session dir: {}", session_dir.display()))?;

    Ok(TransferEngine::new(
        Arc::new(sink),
        Arc::new(fetcher),
        Arc::new(ledger),
        Arc::new(store),
        config,
    ))
}

fn load_signer(config: &VeilConfig) -> Result<Ed25519Signer> {
    let path = expand_tilde(&config.signer.identity_file);
    Ed25519Signer::load(&path, config.signer.principal.clone()).with_context(|| {
        format!(
            "loading identity {} (run `veil keygen` to create one)",
            path.display()
        )
    })
}

fn parse_address(s: &str) -> Result<ContentAddress> {
    ContentAddress::parse(s.trim()).with_context(|| format!("invalid content address: {s}"))
}

/// Transfer options wired to a progress bar and ctrl-c.
fn transfer_options(pb: &ProgressBar, jobs: Option<usize>) -> TransferOptions {
    let opts = TransferOptions {
        concurrency: jobs,
        ..Default::default()
    };

    let bar = pb.clone();
    let opts = TransferOptions {
        progress: Some(Arc::new(move |done: u64, total: u64| {
            bar.set_length(total);
            bar.set_position(done);
        })),
        ..opts
    };

    let cancel = opts.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupt: stopping after in-flight chunks (resume with `veil resume`)");
            cancel.store(true, Ordering::SeqCst);
        }
    });
    opts
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    if let Ok(style) =
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} chunks {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

// ── `veil keygen` / `veil whoami` ─────────────────────────────────────────────

fn cmd_keygen(config: &VeilConfig, force: bool) -> Result<()> {
    let path = expand_tilde(&config.signer.identity_file);
    if path.exists() && !force {
        anyhow::bail!(
            "identity already exists at {} (use --force to replace it; files shared to it become unreadable)",
            path.display()
        );
    }
    Ed25519Signer::generate()
        .save(&path)
        .with_context(|| format!("writing identity: {}", path.display()))?;
    let signer = load_signer(config)?;
    println!("identity:  {}", path.display());
    println!("principal: {}", signer.principal());
    Ok(())
}

async fn cmd_whoami(config: &VeilConfig) -> Result<()> {
    let signer = load_signer(config)?;
    let signature = signer
        .sign(KEY_DERIVATION_CHALLENGE)
        .await
        .context("signing key derivation challenge")?;
    let keypair = derive_keypair(signer.principal(), &signature).context("deriving keypair")?;
    println!("principal:  {}", signer.principal());
    println!("public key: {}", keypair.public_key_hex());
    Ok(())
}

// ── `veil upload` ─────────────────────────────────────────────────────────────

async fn cmd_upload(
    config: &VeilConfig,
    file: &Path,
    mime: Option<String>,
    jobs: Option<usize>,
) -> Result<()> {
    if !file.is_file() {
        anyhow::bail!("not a file: {}", file.display());
    }
    let engine = build_engine(config)?;
    let signer = load_signer(config)?;

    println!(
        "Uploading {} ({}) as {}",
        file.display(),
        fmt_bytes(std::fs::metadata(file)?.len()),
        signer.principal()
    );
    let pb = make_progress_bar("upload");
    let opts = TransferOptions {
        mime_type: mime,
        ..transfer_options(&pb, jobs)
    };

    let outcome = engine.upload(file, &signer, &opts).await;
    pb.finish_and_clear();
    let outcome = outcome.with_context(|| format!("uploading {}", file.display()))?;

    println!("  address:    {}", outcome.manifest_address);
    println!("  chunks:     {}", outcome.total_chunks);
    println!("  bytes:      {}", fmt_bytes(outcome.file_size));
    println!(
        "  registered: {}",
        if outcome.registered { "yes" } else { "no (signature declined)" }
    );
    println!("  session:    {}", outcome.session_id);
    Ok(())
}

// ── `veil download` ───────────────────────────────────────────────────────────

async fn cmd_download(
    config: &VeilConfig,
    address: &str,
    owner: &str,
    output: Option<PathBuf>,
    jobs: Option<usize>,
) -> Result<()> {
    let address = parse_address(address)?;
    let dest = output.unwrap_or_else(|| PathBuf::from(address.short()));
    let engine = build_engine(config)?;
    let signer = load_signer(config)?;

    println!("Downloading {} → {}", address.short(), dest.display());
    let pb = make_progress_bar("download");
    let opts = transfer_options(&pb, jobs);

    let outcome = engine.download(&address, owner, &dest, &signer, &opts).await;
    pb.finish_and_clear();
    let outcome = outcome.with_context(|| format!("downloading {}", address.short()))?;

    println!("  local:  {}", outcome.path.display());
    println!("  bytes:  {}", fmt_bytes(outcome.file_size));
    println!("  chunks: {}", outcome.total_chunks);
    Ok(())
}

// ── `veil resume` ─────────────────────────────────────────────────────────────

async fn cmd_resume(config: &VeilConfig, id: &str, jobs: Option<usize>) -> Result<()> {
    let engine = build_engine(config)?;
    let signer = load_signer(config)?;
    let snapshot = engine.session(id).context("loading session")?;

    let pb = make_progress_bar("resume");
    let opts = transfer_options(&pb, jobs);
    match snapshot.direction {
        Direction::Upload => {
            let outcome = engine.resume_upload(id, &signer, &opts).await;
            pb.finish_and_clear();
            let outcome = outcome.context("resuming upload")?;
            println!("  address:     {}", outcome.manifest_address);
            println!(
                "  transferred: {} of {} chunks",
                outcome.transferred.len(),
                outcome.total_chunks
            );
            println!("  registered:  {}", if outcome.registered { "yes" } else { "no" });
        }
        Direction::Download => {
            let outcome = engine.resume_download(id, &signer, &opts).await;
            pb.finish_and_clear();
            let outcome = outcome.context("resuming download")?;
            println!("  local:       {}", outcome.path.display());
            println!(
                "  transferred: {} of {} chunks",
                outcome.transferred.len(),
                outcome.total_chunks
            );
        }
    }
    Ok(())
}

// ── `veil share` / `veil rotate-key` ──────────────────────────────────────────

async fn cmd_share(
    config: &VeilConfig,
    address: &str,
    grantee: &str,
    grantee_key: &str,
    from: Option<u64>,
    to: Option<u64>,
    duration: Option<&str>,
) -> Result<()> {
    let address = parse_address(address)?;
    let grantee_pk = parse_public_key(grantee_key).context("parsing grantee key")?;
    let valid_from = from.unwrap_or_else(unix_now);
    let valid_to = match to {
        Some(t) => t,
        None => valid_from.saturating_add(parse_duration(duration.unwrap_or("7d"))?.as_secs()),
    };

    let engine = build_engine(config)?;
    let signer = load_signer(config)?;
    let grant = engine
        .share(&address, grantee, &grantee_pk, valid_from, valid_to, &signer)
        .await
        .context("granting access")?;

    println!("shared {} with {}", address.short(), grant.grantee);
    println!("  valid from: {}", grant.valid_from);
    println!("  valid to:   {} (exclusive)", grant.valid_to);
    Ok(())
}

async fn cmd_rotate_key(config: &VeilConfig, address: &str, new_owner: Option<&str>) -> Result<()> {
    let address = parse_address(address)?;
    let target = new_owner
        .map(parse_public_key)
        .transpose()
        .context("parsing new owner key")?;
    let engine = build_engine(config)?;
    let signer = load_signer(config)?;
    engine
        .rotate_owner_key(&address, &signer, target)
        .await
        .context("rotating owner key")?;
    println!("owner key rotated for {}", address.short());
    Ok(())
}

// ── `veil sessions` ───────────────────────────────────────────────────────────

fn cmd_sessions(config: &VeilConfig, action: SessionAction) -> Result<()> {
    let session_dir = expand_tilde(&config.transfer.session_dir);
    let store = SessionStore::open(&session_dir)
        .with_context(|| format!("opening session dir: {}", session_dir.display()))?;

    match action {
        SessionAction::List => {
            let sessions = store.list()?;
            if sessions.is_empty() {
                println!("no sessions in {}", session_dir.display());
                return Ok(());
            }
            for s in sessions {
                let total = s
                    .total_chunks()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "?".into());
                let direction = match s.direction {
                    Direction::Upload => "upload",
                    Direction::Download => "download",
                };
                let resumable_from = s
                    .aborted_from
                    .map(|p| format!(" (from {p})"))
                    .unwrap_or_default();
                println!(
                    "{}  {:8}  {}{}  {}/{} chunks",
                    s.id,
                    direction,
                    s.phase,
                    resumable_from,
                    s.completed(),
                    total
                );
            }
        }
        SessionAction::Show { id } => {
            let snapshot = store.load(&id)?;
            println!("{}", String::from_utf8_lossy(&snapshot.to_json()?));
        }
        SessionAction::Abort { id } => {
            let session = TransferSession::from_snapshot(store.load(&id)?)?;
            session.abort().context("aborting session")?;
            store.write(&session.snapshot())?;
            println!("aborted {id}");
        }
        SessionAction::Rm { id } => {
            store.remove(&id)?;
            println!("removed {id}");
        }
    }
    Ok(())
}

// ── `veil check` / `veil config show` ─────────────────────────────────────────

async fn cmd_check(config: &VeilConfig, probe: Option<&str>) -> Result<()> {
    let op = build_operator(config)?;
    print!("storage ({:?}): ", config.storage.scheme);
    match check_health(&op, &config.storage.prefix).await {
        Ok(()) => println!("ok"),
        Err(e) => println!("FAILED: {e}"),
    }

    let fetcher = GatewayFetcher::from_config(
        &config.gateway,
        config.storage.enforce_tls,
        Some(Endpoint::storage_readback(op, &config.storage.prefix)),
    )?;
    println!("retrieval endpoints (in configured order):");
    match probe {
        None => {
            for name in fetcher.endpoint_names() {
                println!("  - {name}");
            }
        }
        Some(address) => {
            let address = parse_address(address)?;
            for (name, result) in fetcher.probe(&address).await {
                match result {
                    Ok(elapsed) => println!("  - {name}: ok ({} ms)", elapsed.as_millis()),
                    Err(failure) => println!("  - {name}: {} ({})", failure.kind, failure.message),
                }
            }
        }
    }
    Ok(())
}

fn cmd_config_show(config: &VeilConfig, path: &Path, found: bool) -> Result<()> {
    let source = if found { "file" } else { "defaults" };
    println!("# {} ({source})", path.display());
    print!("{}", toml::to_string_pretty(config).context("serializing config")?);
    Ok(())
}

// ── Formatting helpers ────────────────────────────────────────────────────────

/// `3600`, `90s`, `45m`, `12h`, `7d`.
fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, "s"),
    };
    let n: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration: {s:?}"))?;
    let secs = match unit {
        "s" => n,
        "m" => n.saturating_mul(60),
        "h" => n.saturating_mul(3600),
        "d" => n.saturating_mul(86_400),
        other => anyhow::bail!("unknown duration unit {other:?} (use s, m, h or d)"),
    };
    if secs == 0 {
        anyhow::bail!("duration must be positive");
    }
    Ok(Duration::from_secs(secs))
}

fn short(address: &str) -> &str {
    &address[..12.min(address.len())]
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
