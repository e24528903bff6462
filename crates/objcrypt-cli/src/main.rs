//! objcrypt: client-side envelope encryption for a local object store
//!
//! Commands:
//!   put <file> <key>                 - encrypt and store a file
//!   get <key> [-o out] [--range a..b] - fetch and decrypt (whole or a range)
//!   share <key> --recipient k=v      - re-wrap the CEK for another KEK
//!   multipart-put <file> <key>       - encrypted multipart upload
//!   keygen <path>                    - write a fresh base64 AES KEK
//!   config show                      - print the active configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use objcrypt_client::{
    provider_from_config, CryptoClient, LocalFsTransport, MultipartUpload, ObjectTransport,
};
use objcrypt_core::config::ObjcryptConfig;
use objcrypt_core::{CryptoError, MaterialsDescription, ObjectMetadata};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "objcrypt",
    version,
    about = "Client-side envelope encryption for object storage",
    long_about = "objcrypt: encrypt objects before they reach storage, decrypt them after"
)]
struct Cli {
    /// Path to objcrypt.toml configuration file
    #[arg(long, short = 'c', env = "OBJCRYPT_CONFIG", default_value = "objcrypt.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "OBJCRYPT_LOG")]
    log_level: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "OBJCRYPT_LOG_FORMAT")]
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
    /// Encrypt a local file and store it under KEY
    Put {
        file: PathBuf,
        key: String,
        /// User metadata, repeatable: --meta owner=alice
        #[arg(long = "meta", value_parser = parse_pair)]
        metadata: Vec<(String, String)>,
    },

    /// Fetch and decrypt KEY
    ///
    /// Range reads are not integrity-checked for authenticated objects.
    Get {
        key: String,
        /// Output file (default: stdout)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        /// Plaintext byte range, half-open: --range 10..20
        #[arg(long, value_parser = parse_range)]
        range: Option<Range<u64>>,
        /// Read the envelope from <KEY>.<SUFFIX>
        #[arg(long)]
        instruction_suffix: Option<String>,
    },

    /// Give another key-encryption key access to KEY
    ///
    /// Writes a new instruction object <KEY>.<SUFFIX>; the object body is
    /// not touched.
    Share {
        key: String,
        /// Materials description of the recipient KEK, repeatable
        #[arg(long = "recipient", value_parser = parse_pair, required = true)]
        recipient: Vec<(String, String)>,
        #[arg(long)]
        suffix: String,
    },

    /// Encrypt a local file with a multipart upload
    MultipartPut {
        file: PathBuf,
        key: String,
        /// Part size in bytes (default: from config)
        #[arg(long)]
        part_size: Option<u64>,
        #[arg(long = "meta", value_parser = parse_pair)]
        metadata: Vec<(String, String)>,
    },

    /// Generate a 256-bit AES key-encryption key file
    Keygen { path: PathBuf },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let level = cli.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);
    if !cli.config.exists() {
        tracing::warn!("config file not found: {}  (using defaults)", cli.config.display());
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "objcrypt starting"
    );

    match cli.command {
        Commands::Put { file, key, metadata } => cmd_put(&config, &file, &key, metadata),
        Commands::Get {
            key,
            output,
            range,
            instruction_suffix,
        } => cmd_get(&config, &key, output.as_deref(), range, instruction_suffix.as_deref()),
        Commands::Share { key, recipient, suffix } => cmd_share(&config, &key, recipient, &suffix),
        Commands::MultipartPut {
            file,
            key,
            part_size,
            metadata,
        } => cmd_multipart_put(&config, &file, &key, part_size, metadata),
        Commands::Keygen { path } => cmd_keygen(&path),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

// ── Config / logging ──────────────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<ObjcryptConfig> {
    if path.exists() {
        ObjcryptConfig::load(path).with_context(|| format!("loading config: {}", path.display()))
    } else {
        Ok(ObjcryptConfig::default())
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so `get` can stream plaintext to stdout
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stderr))
                .init();
        }
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

fn build_client(config: &ObjcryptConfig) -> Result<CryptoClient<LocalFsTransport>> {
    if config.keys.is_empty() {
        anyhow::bail!(
            "no key-encryption keys configured\n\
             Generate one with `objcrypt keygen kek.b64` and add to the config:\n\
             \t[[keys]]\n\
             \taes_key_file = \"kek.b64\"\n\
             \t[keys.description]\n\
             \tname = \"default\""
        );
    }
    let provider = provider_from_config(&config.keys).context("loading key-encryption keys")?;
    let root = expand_tilde(&config.storage.root);
    let transport = LocalFsTransport::new(&root)
        .with_context(|| format!("opening object store: {}", root.display()))?;
    CryptoClient::new(transport, Arc::new(provider), config.crypto.clone())
        .context("configuring crypto client")
}

// ── Argument parsers ──────────────────────────────────────────────────────────

fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got {s:?}")),
    }
}

fn parse_range(s: &str) -> Result<Range<u64>, String> {
    let (start, end) = s
        .split_once("..")
        .ok_or_else(|| format!("expected start..end, got {s:?}"))?;
    let start: u64 = start.trim().parse().map_err(|e| format!("range start: {e}"))?;
    let end: u64 = end.trim().parse().map_err(|e| format!("range end: {e}"))?;
    if start > end {
        return Err(format!("range start {start} is past its end {end}"));
    }
    Ok(start..end)
}

// ── `objcrypt put` ────────────────────────────────────────────────────────────

fn cmd_put(
    config: &ObjcryptConfig,
    file: &Path,
    key: &str,
    metadata: Vec<(String, String)>,
) -> Result<()> {
    let client = build_client(config)?;
    let body = File::open(file).with_context(|| format!("opening {}", file.display()))?;
    let metadata: ObjectMetadata = metadata.into_iter().collect();
    client
        .put_object(key, body, &metadata)
        .with_context(|| format!("storing {key}"))?;
    println!("{} → {key} ({:?})", file.display(), client.module().scheme());
    Ok(())
}

// ── `objcrypt get` ────────────────────────────────────────────────────────────

fn cmd_get(
    config: &ObjcryptConfig,
    key: &str,
    output: Option<&Path>,
    range: Option<Range<u64>>,
    instruction_suffix: Option<&str>,
) -> Result<()> {
    let client = build_client(config)?;
    let object = match (range, instruction_suffix) {
        (Some(_), Some(_)) => anyhow::bail!("--range and --instruction-suffix cannot be combined"),
        (Some(range), None) => client.get_object_range(key, range),
        (None, Some(suffix)) => client.get_object_with_instruction(key, suffix),
        (None, None) => client.get_object(key),
    }
    .with_context(|| format!("fetching {key}"))?;

    if !object.integrity_verified {
        eprintln!("warning: {key} is not integrity-verified ({:?})", object.scheme);
    }
    let mut body = object.body;

    match output {
        // Decrypt next to the destination, persist only once the tag checked out
        Some(path) => {
            let dir = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            let mut partial = tempfile::Builder::new()
                .prefix(".objcrypt-")
                .suffix(".partial")
                .tempfile_in(dir)
                .with_context(|| format!("creating temp file in {}", dir.display()))?;
            // dropping `partial` on error removes it
            let n = io::copy(&mut body, partial.as_file_mut())
                .and_then(|n| partial.as_file().sync_all().map(|_| n))
                .map_err(CryptoError::from_io)
                .with_context(|| format!("decrypting {key}"))?;
            partial
                .persist(path)
                .with_context(|| format!("renaming to {}", path.display()))?;
            eprintln!("{key} → {} ({n} bytes)", path.display());
        }
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            io::copy(&mut body, &mut lock)
                .map_err(CryptoError::from_io)
                .with_context(|| format!("decrypting {key}"))?;
            lock.flush()?;
        }
    }
    Ok(())
}

// ── `objcrypt share` ──────────────────────────────────────────────────────────

fn cmd_share(
    config: &ObjcryptConfig,
    key: &str,
    recipient: Vec<(String, String)>,
    suffix: &str,
) -> Result<()> {
    let client = build_client(config)?;
    let description: MaterialsDescription = recipient.into_iter().collect();
    client
        .put_instruction_for_recipient(key, &description, suffix)
        .with_context(|| format!("re-wrapping {key} for {description:?}"))?;
    println!("{key}.{suffix} written");
    Ok(())
}

// ── `objcrypt multipart-put` ──────────────────────────────────────────────────

fn cmd_multipart_put(
    config: &ObjcryptConfig,
    file: &Path,
    key: &str,
    part_size: Option<u64>,
    metadata: Vec<(String, String)>,
) -> Result<()> {
    let part_size = part_size.unwrap_or(config.storage.part_size);
    if part_size == 0 {
        anyhow::bail!("part size must be positive");
    }
    let client = build_client(config)?;
    let source = File::open(file).with_context(|| format!("opening {}", file.display()))?;
    let total = source.metadata()?.len();
    let metadata: ObjectMetadata = metadata.into_iter().collect();

    let pb = ProgressBar::new(total);
    let template = "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";
    if let Ok(style) = ProgressStyle::with_template(template) {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_prefix("upload");

    let part_count = upload_in_parts(&client, key, source, total, part_size, &metadata, &pb)?;
    pb.finish_with_message(format!("{part_count} parts"));
    println!("{} → {key} ({part_count} parts)", file.display());
    Ok(())
}

/// Upload `total` bytes of `source` as parts of `part_size` bytes.
///
/// Any failure after initiation aborts the upload before returning.
fn upload_in_parts<T: ObjectTransport>(
    client: &CryptoClient<T>,
    key: &str,
    source: impl Read,
    total: u64,
    part_size: u64,
    metadata: &ObjectMetadata,
    pb: &ProgressBar,
) -> Result<u64> {
    let part_count = total.div_ceil(part_size).max(1);
    let mut upload = client
        .initiate_multipart_upload(key, metadata)
        .with_context(|| format!("initiating multipart upload of {key}"))?;

    match send_parts(client, &mut upload, source, part_size, part_count, pb) {
        Ok(()) => {
            client
                .complete_multipart_upload(upload)
                .with_context(|| format!("completing multipart upload of {key}"))?;
            Ok(part_count)
        }
        Err(e) => {
            pb.abandon_with_message("aborted");
            if let Err(abort) = client.abort_multipart_upload(upload) {
                tracing::warn!(key, "abort after failed part: {abort}");
            }
            Err(e)
        }
    }
}

fn send_parts<T: ObjectTransport>(
    client: &CryptoClient<T>,
    upload: &mut MultipartUpload,
    mut source: impl Read,
    part_size: u64,
    part_count: u64,
    pb: &ProgressBar,
) -> Result<()> {
    for part_number in 1..=part_count {
        let mut chunk = Vec::with_capacity(usize::try_from(part_size).unwrap_or(0));
        (&mut source)
            .take(part_size)
            .read_to_end(&mut chunk)
            .with_context(|| format!("reading part {part_number}"))?;
        let len = chunk.len() as u64;
        let is_last = part_number == part_count;
        pb.set_message(format!("part {part_number}/{part_count}"));

        let number = u32::try_from(part_number).context("too many parts")?;
        client
            .upload_part(upload, number, Cursor::new(chunk), is_last)
            .with_context(|| format!("uploading part {part_number}"))?;
        pb.inc(len);
    }
    Ok(())
}

// ── `objcrypt keygen` ─────────────────────────────────────────────────────────

fn cmd_keygen(path: &Path) -> Result<()> {
    objcrypt_client::keyring::write_aes_key(path)
        .with_context(|| format!("writing key to {}", path.display()))?;
    println!("AES-256 key-encryption key written to {}", path.display());
    Ok(())
}

// ── `objcrypt config show` ────────────────────────────────────────────────────

fn cmd_config_show(config: &ObjcryptConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
