//! keyshard: split a secret into passphrase-sealed shards and hand them to trustees
//!
//! All commands share one config file. Shards and manifests are exchanged
//! through the directory transport rooted at `transport.data_dir`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use keyshard_backup::{
    collect_shards, open_shard_message, recover_secret, BackupOrchestrator, BackupRequest,
    DeferredShard, JsonDeferredQueue, MetadataService,
};
use keyshard_core::config::{expand_tilde, KeyshardConfig};
use keyshard_core::{
    BackupMetadata, BackupStatus, EncryptedShard, PublishedShard, ShardConfig, Trustee,
};
use keyshard_crypto::{validate_strength, KdfParams, Keypair, Secret};
use keyshard_transport::{DirTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(name = "keyshard", about = "Threshold secret backup to trustees", version)]
struct Cli {
    /// Path to keyshard config file
    #[arg(
        long,
        short = 'c',
        env = "KEYSHARD_CONFIG",
        default_value = "~/.config/keyshard/keyshard.toml"
    )]
    config: PathBuf,

    /// Log level filter, overridden by KEYSHARD_LOG (default: config log_level)
    #[arg(long)]
    log: Option<String>,

    /// Log format (default: config log_format)
    #[arg(long, value_enum)]
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
    /// Generate an identity keypair and write its secret key to a file
    Keygen {
        /// Destination for the hex secret key (mode 0600)
        #[arg(long, short = 'o')]
        out: PathBuf,
        /// Replace an existing key file
        #[arg(long)]
        force: bool,
    },
    /// Check a passphrase against the strength rules
    CheckPassphrase,
    /// Split a secret, seal each shard and publish one to every trustee
    Backup {
        /// Owner identity key file (signs the manifest)
        #[arg(long)]
        owner_key: PathBuf,
        /// File holding the secret bytes
        #[arg(long)]
        secret_file: PathBuf,
        /// Trustee public key (hex), once per shard, in shard order
        #[arg(long = "trustee", required = true)]
        trustees: Vec<String>,
        /// Shards required to recover (default: config backup.threshold)
        #[arg(long, short = 't')]
        threshold: Option<u8>,
        /// Where to record published shards if the manifest cannot be written
        #[arg(long, default_value = "keyshard-resume.json")]
        resume_file: PathBuf,
    },
    /// Publish the manifest for a backup whose manifest step failed
    Resume {
        #[arg(long)]
        owner_key: PathBuf,
        #[arg(long, default_value = "keyshard-resume.json")]
        resume_file: PathBuf,
    },
    /// (Trustee) fetch and decrypt a shard message addressed to you
    OpenShard {
        /// Trustee identity key file
        #[arg(long)]
        trustee_key: PathBuf,
        /// Shard message id from the owner's manifest
        #[arg(long)]
        event_id: String,
        /// Write the sealed shard JSON here instead of stdout
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },
    /// Reconstruct the secret from sealed shard files or from trustee keys
    Recover {
        /// Sealed shard JSON file, as produced by `open-shard`
        #[arg(long = "shard")]
        shards: Vec<PathBuf>,
        /// Owner key file; with --trustee-key, collects shards via the manifest
        #[arg(long)]
        owner_key: Option<PathBuf>,
        /// Trustee key file held locally
        #[arg(long = "trustee-key")]
        trustee_keys: Vec<PathBuf>,
        /// Write the recovered secret here (default: hex on stdout)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },
    /// Print the latest backup manifest
    Metadata {
        #[arg(long)]
        owner_key: PathBuf,
    },
    /// Check that every shard message is still retrievable
    Health {
        #[arg(long)]
        owner_key: PathBuf,
    },
    /// Publish deferred shards that are due and update the manifest
    Drain {
        #[arg(long)]
        owner_key: PathBuf,
    },
    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

/// Written when a backup published shards but could not publish its manifest.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeState {
    threshold: u8,
    total_shards: u8,
    published: Vec<PublishedShard>,
    deferred: Vec<DeferredShard>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = expand_tilde(&cli.config);
    let config = KeyshardConfig::load(&config_path)?;

    let format = match cli.log_format {
        Some(f) => f,
        None if config.log_format.eq_ignore_ascii_case("json") => LogFormat::Json,
        None => LogFormat::Text,
    };
    init_logging(cli.log.as_deref().unwrap_or(&config.log_level), &format);

    if !config_path.exists() {
        tracing::warn!(
            "config file not found: {} (using defaults)",
            config_path.display()
        );
    }

    match cli.command {
        Commands::Keygen { out, force } => cmd_keygen(&out, force),
        Commands::CheckPassphrase => cmd_check_passphrase(),
        Commands::Backup {
            owner_key,
            secret_file,
            trustees,
            threshold,
            resume_file,
        } => {
            cmd_backup(
                &config,
                &owner_key,
                &secret_file,
                trustees,
                threshold,
                &resume_file,
            )
            .await
        }
        Commands::Resume {
            owner_key,
            resume_file,
        } => cmd_resume(&config, &owner_key, &resume_file).await,
        Commands::OpenShard {
            trustee_key,
            event_id,
            out,
        } => cmd_open_shard(&config, &trustee_key, &event_id, out.as_deref()).await,
        Commands::Recover {
            shards,
            owner_key,
            trustee_keys,
            out,
        } => {
            cmd_recover(
                &config,
                &shards,
                owner_key.as_deref(),
                &trustee_keys,
                out.as_deref(),
            )
            .await
        }
        Commands::Metadata { owner_key } => cmd_metadata(&config, &owner_key).await,
        Commands::Health { owner_key } => cmd_health(&config, &owner_key).await,
        Commands::Drain { owner_key } => cmd_drain(&config, &owner_key).await,
        Commands::Config { action } => match action {
            ConfigAction::Show => cmd_config_show(&config, &config_path),
        },
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_env("KEYSHARD_LOG").unwrap_or_else(|_| EnvFilter::new(level));

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

// ── Shared helpers ────────────────────────────────────────────────────────────

fn transport(config: &KeyshardConfig) -> Arc<dyn Transport> {
    Arc::new(DirTransport::new(expand_tilde(&config.transport.data_dir)))
}

fn orchestrator(config: &KeyshardConfig) -> Result<BackupOrchestrator> {
    let queue_path = expand_tilde(&config.distribution.deferred_queue);
    let queue = JsonDeferredQueue::open(&queue_path)
        .with_context(|| format!("opening deferred queue {}", queue_path.display()))?;
    Ok(BackupOrchestrator::new(
        transport(config),
        Arc::new(queue),
        config,
    ))
}

fn load_keypair(path: &Path) -> Result<Keypair> {
    let hex = Zeroizing::new(
        std::fs::read_to_string(path)
            .with_context(|| format!("reading key file {}", path.display()))?,
    );
    Keypair::from_secret_hex(hex.trim())
        .with_context(|| format!("parsing key file {}", path.display()))
}

/// Passphrase from `KEYSHARD_PASSPHRASE`, or prompted on the terminal.
fn read_passphrase(confirm: bool) -> Result<SecretString> {
    if let Ok(from_env) = std::env::var("KEYSHARD_PASSPHRASE") {
        return Ok(SecretString::from(from_env));
    }
    let first = rpassword::prompt_password("Passphrase: ").context("reading passphrase")?;
    if confirm {
        let again = Zeroizing::new(
            rpassword::prompt_password("Confirm passphrase: ").context("reading passphrase")?,
        );
        if first != *again {
            bail!("passphrases do not match");
        }
    }
    Ok(SecretString::from(first))
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    // mode() only applies on create; tighten a file that already existed
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restricting {}", path.display()))?;
    }
    file.write_all(contents)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

async fn fetch_metadata(config: &KeyshardConfig, owner: &Keypair) -> Result<BackupMetadata> {
    let service = MetadataService::from_config(transport(config), config);
    match service.fetch(owner).await? {
        Some(metadata) => Ok(metadata),
        None => bail!(
            "no backup manifest found for {} on {}",
            owner.public(),
            config.transport.relays.join(", ")
        ),
    }
}

fn fmt_time(secs: u64) -> String {
    let days = secs / 86_400;
    let rem = secs % 86_400;
    format!(
        "{secs} (+{days}d {:02}:{:02})",
        rem / 3600,
        (rem % 3600) / 60
    )
}

// ── Progress display ──────────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

// ── keygen ────────────────────────────────────────────────────────────────────

fn cmd_keygen(out: &Path, force: bool) -> Result<()> {
    if out.exists() && !force {
        bail!("{} already exists (use --force to replace it)", out.display());
    }
    let keypair = Keypair::try_generate()?;
    let secret = keypair.secret_hex();
    write_private(out, format!("{}\n", secret.as_str()).as_bytes())?;

    println!("Key written: {}", out.display());
    println!("  public key: {}", keypair.public());
    Ok(())
}

// ── check-passphrase ──────────────────────────────────────────────────────────

fn cmd_check_passphrase() -> Result<()> {
    let passphrase = read_passphrase(false)?;
    let report = validate_strength(passphrase.expose_secret());
    if report.valid {
        println!("Passphrase OK");
        return Ok(());
    }
    println!("Passphrase rejected:");
    for rule in &report.errors {
        println!("  - {rule}");
    }
    report.into_result()?;
    Ok(())
}

// ── backup ────────────────────────────────────────────────────────────────────

async fn cmd_backup(
    config: &KeyshardConfig,
    owner_key: &Path,
    secret_file: &Path,
    trustees: Vec<String>,
    threshold: Option<u8>,
    resume_file: &Path,
) -> Result<()> {
    let owner = load_keypair(owner_key)?;
    let secret = Secret::new(
        std::fs::read(secret_file)
            .with_context(|| format!("reading secret {}", secret_file.display()))?,
    );
    if secret.is_empty() {
        bail!("secret file {} is empty", secret_file.display());
    }

    let total = u8::try_from(trustees.len()).context("too many trustees")?;
    let shard_config = ShardConfig::new(threshold.unwrap_or(config.backup.threshold), total)?;
    let trustees = trustees.into_iter().map(Trustee::new).collect::<Vec<_>>();
    let passphrase = read_passphrase(true)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let orchestrator = orchestrator(config)?;
    let mut progress = orchestrator.progress();
    let pb = make_progress_bar(0, "backup");
    let render = {
        let pb = pb.clone();
        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let snapshot = progress.borrow_and_update().clone();
                pb.set_length(u64::from(snapshot.total_steps));
                pb.set_position(u64::from(snapshot.current_step));
                pb.set_message(snapshot.message);
                if matches!(snapshot.status, BackupStatus::Complete | BackupStatus::Error) {
                    break;
                }
            }
        })
    };

    let request = BackupRequest::new(secret, passphrase, shard_config, trustees, owner)
        .with_cancellation(cancel);
    let result = orchestrator.create_backup(request).await;
    render.abort();
    pb.finish_and_clear();

    match result {
        Ok(outcome) => {
            println!("Backup complete");
            println!("  manifest:  {}", outcome.manifest_id);
            println!("  run:       {}", outcome.backup_id);
            println!(
                "  quorum:    {}-of-{}",
                outcome.metadata.threshold, outcome.metadata.total_shards
            );
            println!("  published: {}", outcome.published.len());
            for shard in &outcome.published {
                println!(
                    "    shard {:>2} -> {}  event {}  at {}",
                    shard.shard_index,
                    shard.recipient_pubkey,
                    shard.event_id,
                    fmt_time(shard.published_at)
                );
            }
            if !outcome.deferred.is_empty() {
                println!("  deferred:  {} (run `keyshard drain` later)", outcome.deferred.len());
                for shard in &outcome.deferred {
                    println!(
                        "    shard {:>2} -> {}  due {}",
                        shard.shard_index(),
                        shard.recipient_pubkey,
                        fmt_time(shard.publish_at)
                    );
                }
            }
            Ok(())
        }
        Err(abort) => {
            if abort.is_partial() {
                let state = ResumeState {
                    threshold: shard_config.threshold(),
                    total_shards: shard_config.total_shards(),
                    published: abort.published.clone(),
                    deferred: abort.deferred.clone(),
                };
                let json = serde_json::to_vec_pretty(&state)?;
                write_private(resume_file, &json)?;
                eprintln!(
                    "{} shard(s) went out before the failure; state saved to {}",
                    state.published.len() + state.deferred.len(),
                    resume_file.display()
                );
                eprintln!("run `keyshard resume --resume-file {}` to publish the manifest", resume_file.display());
            }
            Err(anyhow::Error::new(abort))
        }
    }
}

// ── resume ────────────────────────────────────────────────────────────────────

async fn cmd_resume(config: &KeyshardConfig, owner_key: &Path, resume_file: &Path) -> Result<()> {
    let owner = load_keypair(owner_key)?;
    let raw = std::fs::read(resume_file)
        .with_context(|| format!("reading {}", resume_file.display()))?;
    let state: ResumeState = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing {}", resume_file.display()))?;
    let shard_config = ShardConfig::new(state.threshold, state.total_shards)?;

    let orchestrator = orchestrator(config)?;
    let (metadata, id) = orchestrator
        .resume_metadata(&state.published, &state.deferred, &shard_config, &owner)
        .await?;

    std::fs::remove_file(resume_file)
        .with_context(|| format!("removing {}", resume_file.display()))?;
    println!("Manifest published: {id}");
    println!(
        "  shards: {} published, {} pending",
        metadata.shard_events.len(),
        metadata.pending_shards.len()
    );
    Ok(())
}

// ── open-shard ────────────────────────────────────────────────────────────────

async fn cmd_open_shard(
    config: &KeyshardConfig,
    trustee_key: &Path,
    event_id: &str,
    out: Option<&Path>,
) -> Result<()> {
    let trustee = load_keypair(trustee_key)?;
    let transport = transport(config);
    let ids = [event_id.to_string()];
    let found = tokio::time::timeout(
        config.transport.fetch_timeout(),
        transport.fetch_by_ids(&ids, &config.transport.relays),
    )
    .await
    .context("shard fetch timed out")??;

    let Some(message) = found.iter().find(|m| m.id == event_id) else {
        bail!("shard message {event_id} not found");
    };
    let shard = open_shard_message(&trustee, message)?;
    let json = shard.to_json()?;

    match out {
        Some(path) => {
            write_private(path, json.as_bytes())?;
            println!("Shard {} of {} written: {}", shard.index, shard.total_shards, path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

// ── recover ───────────────────────────────────────────────────────────────────

async fn cmd_recover(
    config: &KeyshardConfig,
    shard_files: &[PathBuf],
    owner_key: Option<&Path>,
    trustee_keys: &[PathBuf],
    out: Option<&Path>,
) -> Result<()> {
    let mut shards = Vec::new();
    for path in shard_files {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading shard {}", path.display()))?;
        shards.push(EncryptedShard::from_json(&json)?);
    }

    if let Some(owner_key) = owner_key {
        let owner = load_keypair(owner_key)?;
        let trustees = trustee_keys
            .iter()
            .map(|p| load_keypair(p))
            .collect::<Result<Vec<_>>>()?;
        let metadata = fetch_metadata(config, &owner).await?;
        let collected = collect_shards(
            transport(config).as_ref(),
            &metadata,
            &trustees,
            config.transport.fetch_timeout(),
        )
        .await?;
        tracing::info!(collected = collected.len(), "shards collected from manifest");
        for shard in collected {
            if !shards.iter().any(|s| s.index == shard.index) {
                shards.push(shard);
            }
        }
    } else if !trustee_keys.is_empty() {
        bail!("--trustee-key requires --owner-key to locate the manifest");
    }

    if shards.is_empty() {
        bail!("no shards given (use --shard or --owner-key with --trustee-key)");
    }

    let passphrase = read_passphrase(false)?;
    let secret = recover_secret(&shards, &passphrase, &KdfParams::default())?;

    match out {
        Some(path) => {
            write_private(path, secret.as_bytes())?;
            println!("Secret recovered: {} ({} bytes)", path.display(), secret.len());
        }
        None => {
            let hex = Zeroizing::new(hex::encode(secret.as_bytes()));
            println!("{}", hex.as_str());
        }
    }
    Ok(())
}

// ── metadata / health ─────────────────────────────────────────────────────────

async fn cmd_metadata(config: &KeyshardConfig, owner_key: &Path) -> Result<()> {
    let owner = load_keypair(owner_key)?;
    let metadata = fetch_metadata(config, &owner).await?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}

async fn cmd_health(config: &KeyshardConfig, owner_key: &Path) -> Result<()> {
    let owner = load_keypair(owner_key)?;
    let metadata = fetch_metadata(config, &owner).await?;
    let service = MetadataService::from_config(transport(config), config);
    let report = service.check_health(&metadata).await;

    let healthy = report.iter().filter(|h| h.healthy).count();
    println!(
        "Backup {}-of-{}: {healthy}/{} shard messages retrievable",
        metadata.threshold,
        metadata.total_shards,
        report.len()
    );
    for health in &report {
        let state = if health.healthy { "ok" } else { "MISSING" };
        let relays = if health.relays.is_empty() {
            "-".to_string()
        } else {
            health.relays.join(", ")
        };
        println!("  shard {:>2}  {state:<8} {relays}", health.shard_index);
    }
    for pending in &metadata.pending_shards {
        println!(
            "  shard {:>2}  pending  due {}",
            pending.shard_index,
            fmt_time(pending.publish_at)
        );
    }
    if healthy < usize::from(metadata.threshold) {
        bail!(
            "only {healthy} shard(s) retrievable, {} needed to recover",
            metadata.threshold
        );
    }
    Ok(())
}

// ── drain ─────────────────────────────────────────────────────────────────────

async fn cmd_drain(config: &KeyshardConfig, owner_key: &Path) -> Result<()> {
    let owner = load_keypair(owner_key)?;
    let orchestrator = orchestrator(config)?;
    let previous = orchestrator.metadata_service().fetch(&owner).await?;

    match previous {
        Some(previous) if !previous.pending_shards.is_empty() => {
            match orchestrator.finalize_deferred(&owner, &previous).await? {
                Some((next, id)) => {
                    println!("Manifest updated: {id}");
                    println!(
                        "  shards: {} published, {} pending",
                        next.shard_events.len(),
                        next.pending_shards.len()
                    );
                }
                None => println!(
                    "No deferred shards due yet ({} pending)",
                    previous.pending_shards.len()
                ),
            }
        }
        _ => {
            let report = orchestrator
                .drain_deferred(keyshard_transport::now())
                .await?;
            println!("Published {} deferred shard(s)", report.published.len());
            for shard in &report.published {
                println!("  #{} -> {}", shard.shard_index, shard.event_id);
            }
            if let Some(e) = report.queue_error {
                return Err(e.into());
            }
        }
    }
    Ok(())
}

// ── config ────────────────────────────────────────────────────────────────────

fn cmd_config_show(config: &KeyshardConfig, path: &Path) -> Result<()> {
    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
