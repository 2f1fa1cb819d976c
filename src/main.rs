use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use bitstash::backup_exchanger::{self, ExchangeFlags};
use bitstash::compression::CompressionMethod;
use bitstash::config::{RuntimeConfig, StorageConfig};
use bitstash::repository::{derive_storage_dir, Repository};

#[derive(Parser)]
#[command(
    name = "bitstash",
    version = "1.0.0",
    about = "A versatile deduplicating backup tool"
)]
struct Cli {
    /// Read a repository password from this file; for export/import the
    /// passwords are matched to the encrypted repositories involved
    #[arg(long, global = true, value_name = "FILE")]
    password_file: Vec<PathBuf>,

    /// The repository involved is not encrypted; counts as one password
    /// slot for export/import
    #[arg(long, global = true, action = ArgAction::Count)]
    non_encrypted: u8,

    /// Suppress progress output (default is verbose)
    #[arg(long, global = true)]
    silent: bool,

    /// Number of compression threads (default: one per CPU)
    #[arg(long, global = true, value_name = "N")]
    threads: Option<String>,

    /// Bundle cache size with an 'mb' suffix, e.g. 40mb
    #[arg(long, global = true, value_name = "SIZE")]
    cache_size: Option<String>,

    /// Compression method: lzma (default), lzo (alias of lz4), lz4, zstd
    #[arg(long, global = true, value_name = "METHOD")]
    compression: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new repository
    Init {
        storage_dir: PathBuf,
    },
    /// Perform a backup from stdin
    Backup {
        backup_file: PathBuf,
    },
    /// Restore a backup to stdout
    Restore {
        backup_file: PathBuf,
    },
    /// Perform garbage collection: gc [fast|deep] <storage dir>
    Gc {
        #[arg(required = true, num_args = 1..=2, value_name = "ARGS")]
        args: Vec<String>,
    },
    /// Copy repository contents from source to destination
    Export {
        source:      PathBuf,
        destination: PathBuf,
        /// What to copy: backups, bundles or index (repeatable)
        #[arg(long, value_name = "WHAT")]
        exchange: Vec<String>,
    },
    /// Copy repository contents from source into destination
    Import {
        source:      PathBuf,
        destination: PathBuf,
        /// What to copy: backups, bundles or index (repeatable)
        #[arg(long, value_name = "WHAT")]
        exchange: Vec<String>,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error("won't read data from a terminal")]
    WontReadFromTerminal,
    #[error("won't write data to a terminal")]
    WontWriteToTerminal,
    #[error(
        "specify password flag (--non-encrypted or --password-file) for \
         import/export operation twice (first for source and second for destination)"
    )]
    ExchangeWithLessThanTwoKeys,
    #[error("--non-encrypted and --password-file are incompatible")]
    NonEncryptedWithKey,
    #[error("specify either --password-file or --non-encrypted")]
    SpecifyEncryptionOptions,
    #[error("not enough passwords for the encrypted repositories involved")]
    NotEnoughPasswords,
    #[error("invalid threads value specified: {0}")]
    InvalidThreadsValue(String),
    #[error(
        "invalid cache size value specified: {0}; must be a number with the 'mb' suffix, e.g. '100mb'"
    )]
    InvalidCacheSize(String),
    #[error("invalid exchange value specified: {0}; must be one of: backups, bundles, index")]
    InvalidExchangeValue(String),
    #[error("specify any --exchange flag")]
    NoExchangeFlags,
    #[error("invalid gc mode: {0}; must be 'fast' or 'deep'")]
    InvalidGcMode(String),
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Also covers --help/--version, which are not failures.
            let code = if e.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
            let _ = e.print();
            return code;
        }
    };

    let default_level = if cli.silent { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let passwords: Vec<String> = cli
        .password_file
        .iter()
        .map(|path| read_password_file(path))
        .collect::<Result<_, _>>()?;
    let password_slots = passwords.len() + cli.non_encrypted as usize;

    let mut runtime = RuntimeConfig::default();
    if let Some(ref threads) = cli.threads {
        match threads.parse::<usize>() {
            Ok(n) if n >= 1 => runtime.threads = n,
            _ => return Err(CliError::InvalidThreadsValue(threads.clone()).into()),
        }
    }
    if let Some(ref cache) = cli.cache_size {
        runtime.cache_bytes = parse_cache_size(cache)?;
    }
    if let Some(ref method) = cli.compression {
        runtime.compression = Some(CompressionMethod::from_cli_token(method)?);
    }

    let is_exchange =
        matches!(cli.command, Commands::Export { .. } | Commands::Import { .. });
    if is_exchange {
        if password_slots < 2 {
            return Err(CliError::ExchangeWithLessThanTwoKeys.into());
        }
    } else {
        if password_slots < 1 {
            return Err(CliError::SpecifyEncryptionOptions.into());
        }
        if !passwords.is_empty() && cli.non_encrypted > 0 {
            return Err(CliError::NonEncryptedWithKey.into());
        }
    }

    let single_password = passwords.first().cloned().unwrap_or_default();

    match cli.command {
        Commands::Init { storage_dir } => {
            let config = StorageConfig {
                compression: runtime.compression.unwrap_or_default(),
                ..StorageConfig::default()
            };
            let password =
                if passwords.is_empty() { None } else { Some(single_password.as_str()) };
            Repository::init(&storage_dir, password, &config)?;
        }

        Commands::Backup { backup_file } => {
            if io::stdin().is_terminal() {
                return Err(CliError::WontReadFromTerminal.into());
            }
            let storage_dir = derive_storage_dir(&backup_file, false)?;
            let mut repo = Repository::open(&storage_dir, &single_password, runtime, false)?;
            let stdin = io::stdin();
            repo.backup(&mut stdin.lock(), &backup_file)?;
        }

        Commands::Restore { backup_file } => {
            if io::stdout().is_terminal() {
                return Err(CliError::WontWriteToTerminal.into());
            }
            let storage_dir = derive_storage_dir(&backup_file, false)?;
            let repo = Repository::open(&storage_dir, &single_password, runtime, false)?;
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            repo.restore(&backup_file, &mut lock)?;
            lock.flush()?;
        }

        Commands::Gc { args } => {
            let (deep, dir) = match args.as_slice() {
                [dir] => (false, dir.clone()),
                [mode, dir] => match mode.as_str() {
                    "fast" => (false, dir.clone()),
                    "deep" => (true, dir.clone()),
                    other => return Err(CliError::InvalidGcMode(other.to_owned()).into()),
                },
                _ => unreachable!("clap enforces 1..=2 args"),
            };
            let storage_dir = derive_storage_dir(Path::new(&dir), true)?;
            let repo = Repository::open(&storage_dir, &single_password, runtime, false)?;
            repo.gc(deep)?;
        }

        Commands::Export { source, destination, exchange }
        | Commands::Import { source, destination, exchange } => {
            let flags = parse_exchange_flags(&exchange)?;
            if !flags.any() {
                return Err(CliError::NoExchangeFlags.into());
            }

            let src_dir = derive_storage_dir(&source, true)?;
            let dst_dir = derive_storage_dir(&destination, true)?;

            // Passwords are consumed in order by whichever repositories
            // are actually encrypted.
            let mut remaining = passwords.into_iter();
            let mut password_for =
                |dir: &Path| -> Result<String, Box<dyn std::error::Error>> {
                    if Repository::is_encrypted(dir)? {
                        remaining.next().ok_or_else(|| CliError::NotEnoughPasswords.into())
                    } else {
                        Ok(String::new())
                    }
                };

            let src_password = password_for(&src_dir)?;
            let dst_password = password_for(&dst_dir)?;

            let src = Repository::open(&src_dir, &src_password, runtime.clone(), true)?;
            let dst = Repository::open(&dst_dir, &dst_password, runtime, true)?;
            backup_exchanger::exchange(&src, &dst, &flags)?;
        }
    }

    Ok(())
}

fn read_password_file(path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    let mut data = fs::read_to_string(path)?;
    // Many editors append a newline whether the user wants one or not.
    if data.ends_with('\n') {
        data.pop();
        if data.ends_with('\r') {
            data.pop();
        }
    }
    Ok(data)
}

fn parse_cache_size(value: &str) -> Result<usize, CliError> {
    let lower = value.to_lowercase();
    let number = lower
        .strip_suffix("mb")
        .ok_or_else(|| CliError::InvalidCacheSize(value.to_owned()))?;
    number
        .trim()
        .parse::<usize>()
        .map(|mb| mb * 1048576)
        .map_err(|_| CliError::InvalidCacheSize(value.to_owned()))
}

fn parse_exchange_flags(values: &[String]) -> Result<ExchangeFlags, CliError> {
    let mut flags = ExchangeFlags::default();
    for value in values {
        match value.as_str() {
            "backups" => flags.backups = true,
            "bundles" => flags.bundles = true,
            "index" => flags.index = true,
            other => return Err(CliError::InvalidExchangeValue(other.to_owned())),
        }
    }
    Ok(flags)
}
