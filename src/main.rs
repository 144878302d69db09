use clap::{Args, Parser, Subcommand};
use krypto431::codec::{ChecksumStatus, CodecOptions, Collector, Decoder, Encoder, ReceivedMessage};
use krypto431::group::{GroupWriter, DEFAULT_GROUPS_PER_LINE, DEFAULT_GROUP_LEN};
use krypto431::keystore::{self, DirKeyStore, DummyKeyStore, KeyStore};
use krypto431::{Cipher, Direction};
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "k431", version, about = "One-time-pad messages over an A-Z channel")]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StoreArgs {
    /// Key store directory
    #[arg(short, long, env = "K431_STORE", default_value = "keys", global = true)]
    store: PathBuf,
    /// Seal key files with AES-256-GCM (Argon2id key derivation)
    #[arg(short, long, env = "K431_PASSWORD", global = true)]
    password: Option<String>,
    /// Use the all-A identity key instead of the store (no secrecy)
    #[arg(long, global = true)]
    dummy: bool,
    /// Longest key name announced in band
    #[arg(long, default_value_t = 8, global = true)]
    max_key_name_len: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage key material
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },
    /// Encode and encipher files (or stdin) into grouped A-Z text
    Encode {
        /// Append a CRC-32 the receiver can verify
        #[arg(long)]
        crc: bool,
        /// Content type; non-text types travel as hex bytes
        #[arg(short = 't', long)]
        content_type: Option<String>,
        /// Filename header (defaults to each input's file name)
        #[arg(short, long)]
        filename: Option<String>,
        /// Letters per group, 0 for one unbroken line
        #[arg(short, long, default_value_t = DEFAULT_GROUP_LEN)]
        group: usize,
        #[arg(short, long)]
        output: Option<PathBuf>,
        input: Vec<PathBuf>,
    },
    /// Decipher and decode A-Z text; prints a JSON summary
    Decode {
        /// Save messages that carry a filename into this directory
        #[arg(short = 'C', long)]
        output_dir: Option<PathBuf>,
        input: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate random keys
    Generate {
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
        /// Symbols per key
        #[arg(long, default_value_t = 1000)]
        size: usize,
        /// Explicit names; random 5-letter names otherwise
        names: Vec<String>,
    },
    /// List keys and their allocation state
    List,
}

#[derive(Serialize)]
struct MessageSummary {
    id:           usize,
    headers:      BTreeMap<String, String>,
    complete:     bool,
    bytes:        usize,
    checksum:     &'static str,
    /// Received CRC-32, hex.
    crc32:        Option<String>,
    header_error: Option<String>,
    saved:        Option<PathBuf>,
    text:         Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    let options = CodecOptions { max_key_name_len: cli.store.max_key_name_len };

    match cli.command {

        // ── Keys ─────────────────────────────────────────────────────────────
        Commands::Keys { command: KeyCommands::Generate { count, size, names } } => {
            if size < options.min_key_len() {
                return Err(format!("keys need at least {} symbols", options.min_key_len()).into());
            }
            let mut store = open_store(&cli.store)?;
            let mut rng = rand::rng();
            let names = if names.is_empty() {
                let taken: Vec<String> = store.list().into_iter().map(|k| k.name).collect();
                let mut fresh = Vec::with_capacity(count);
                while fresh.len() < count {
                    let name = keystore::random_name(&mut rng);
                    if !taken.contains(&name) && !fresh.contains(&name) {
                        fresh.push(name);
                    }
                }
                fresh
            } else {
                names
            };
            for name in &names {
                options.check_key_name(name)?;
                store.generate(name, size, &mut rng)?;
                println!("  generated  {name}  ({size} symbols)");
            }
            store.close()?;
        }

        Commands::Keys { command: KeyCommands::List } => {
            let mut store = open_store(&cli.store)?;
            println!("{:<10} {:>10}  Allocated", "Name", "Symbols");
            for k in store.list() {
                println!("{:<10} {:>10}  {}", k.name, k.size, if k.allocated { "yes" } else { "no" });
            }
            store.close()?;
        }

        // ── Encode ───────────────────────────────────────────────────────────
        Commands::Encode { crc, content_type, filename, group, output, input } => {
            let sink: Box<dyn Write> = match &output {
                Some(path) => Box::new(File::create(path)?),
                None       => Box::new(io::stdout().lock()),
            };
            let grouped = GroupWriter::with_layout(sink, group, DEFAULT_GROUPS_PER_LINE);
            let cipher = Cipher::new(open_store(&cli.store)?, Direction::Encrypt);
            let mut enc = Encoder::with_options(grouped, cipher, options);

            let inputs: Vec<(Option<String>, Vec<u8>)> = if input.is_empty() {
                let mut data = Vec::new();
                io::stdin().read_to_end(&mut data)?;
                vec![(filename.clone(), data)]
            } else {
                input.iter()
                    .map(|p| -> io::Result<(Option<String>, Vec<u8>)> {
                        Ok((filename.clone().or_else(|| file_name(p)), fs::read(p)?))
                    })
                    .collect::<io::Result<_>>()?
            };

            for (name, data) in &inputs {
                let mut msg = enc.new_message()?;
                if crc {
                    msg = msg.with_crc32();
                }
                if let Some(ct) = &content_type {
                    msg = msg.with_content_type(ct);
                }
                if let Some(n) = name {
                    msg = msg.with_filename(n);
                }
                msg.write_bytes(data)?;
                msg.close()?;
                info!("encoded {} bytes{}", data.len(), name.as_deref().map(|n| format!(" from {n}")).unwrap_or_default());
            }
            enc.close()?;
            let symbols = enc.symbols_written();
            let keys = enc.keys_used();
            enc.into_inner().finish()?;
            eprintln!("{symbols} symbols, {keys} key(s)");
        }

        // ── Decode ───────────────────────────────────────────────────────────
        Commands::Decode { output_dir, input } => {
            let mut wire = Vec::new();
            match &input {
                Some(path) => { File::open(path)?.read_to_end(&mut wire)?; }
                None       => { io::stdin().read_to_end(&mut wire)?; }
            }
            let cipher = Cipher::new(open_store(&cli.store)?, Direction::Decrypt);
            let mut dec = Decoder::with_options(cipher, Collector::new(), options);
            let result = dec.write(&wire).and_then(|_| dec.close());
            let messages = dec.into_sink().into_messages();
            if let Err(e) = &result {
                warn!("decoding stopped: {e}");
            }

            let mut summary = Vec::with_capacity(messages.len());
            for m in &messages {
                summary.push(summarize(m, output_dir.as_deref())?);
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
            result?;
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn open_store(args: &StoreArgs) -> Result<Box<dyn KeyStore>, Box<dyn std::error::Error>> {
    let mut store: Box<dyn KeyStore> = if args.dummy {
        Box::new(DummyKeyStore)
    } else {
        match &args.password {
            Some(pwd) => Box::new(DirKeyStore::with_password(&args.store, pwd)),
            None      => Box::new(DirKeyStore::new(&args.store)),
        }
    };
    store.open()?;
    Ok(store)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

fn summarize(m: &ReceivedMessage, output_dir: Option<&Path>) -> io::Result<MessageSummary> {
    let (checksum, crc32) = match m.info.checksum {
        ChecksumStatus::Absent                 => ("absent", None),
        ChecksumStatus::Match { crc32 }        => ("ok", Some(crc32)),
        ChecksumStatus::Mismatch { expected, .. } => ("mismatch", Some(expected)),
        ChecksumStatus::Malformed              => ("malformed", None),
    };

    // Only the final path component of a received name is trusted.
    let saved = match (output_dir, m.info.filename().and_then(|f| file_name(Path::new(f)))) {
        (Some(dir), Some(name)) => {
            fs::create_dir_all(dir)?;
            let path = dir.join(name);
            fs::write(&path, m.content())?;
            Some(path)
        }
        _ => None,
    };
    let text = match (&saved, std::str::from_utf8(m.content())) {
        (None, Ok(s)) => Some(s.to_owned()),
        _ => None,
    };

    Ok(MessageSummary {
        id:           m.info.id,
        headers:      m.info.headers.clone(),
        complete:     m.info.complete,
        bytes:        m.info.content_len,
        checksum,
        crc32:        crc32.map(|c| hex::encode(c.to_be_bytes())),
        header_error: m.info.header_error.clone(),
        saved,
        text,
    })
}
