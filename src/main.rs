use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, warn};

use photox::config::{Config, EXAMPLE_CONFIG};
use photox::core::exif::ExifToolProbe;
use photox::core::organizer::Organizer;
use photox::index::IndexStore;
use photox::report;

#[derive(Parser, Debug)]
#[command(
    name = "photox",
    version,
    about = "Organizes photo/video collections into a YYYY/MM archive, deduplicating against a persistent index"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, default_value = "photox.toml")]
    config: PathBuf,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a starter configuration and create the archive skeleton
    Init,

    /// Run the organizing pipeline over the source directory
    Run {
        /// Override the configured source directory
        #[arg(short, long, value_name = "DIR")]
        source: Option<PathBuf>,
        /// Report every action without touching any file
        #[arg(long)]
        dry_run: bool,
        /// Index files already present in the archive before organizing
        #[arg(long)]
        include_dest: bool,
    },

    /// Rebuild the fingerprint index from the archive contents
    BuildIndex {
        /// Report every action without touching any file
        #[arg(long)]
        dry_run: bool,
    },

    /// Show run history and index statistics
    Status,
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
    process::exit(dispatch(cli));
}

fn dispatch(cli: Cli) -> i32 {
    match cli.command {
        Commands::Init => init(&cli.config),
        Commands::Run {
            source,
            dry_run,
            include_dest,
        } => match load_config(&cli.config, source, dry_run, include_dest) {
            Ok(config) => run_pipeline(config),
            Err(code) => code,
        },
        Commands::BuildIndex { dry_run } => match load_config(&cli.config, None, dry_run, true) {
            Ok(config) => run_pipeline(config),
            Err(code) => code,
        },
        Commands::Status => status(&cli.config),
    }
}

fn load_config(
    path: &Path,
    source: Option<PathBuf>,
    dry_run: bool,
    include_dest: bool,
) -> Result<Config, i32> {
    let mut config = match Config::load(path) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return Err(1);
        }
    };
    if let Some(source) = source {
        if let Err(err) = config.set_source(&source) {
            error!("{err}");
            return Err(1);
        }
    }
    if dry_run {
        config.dry_run = true;
    }
    if include_dest {
        config.include_dest = true;
    }
    // with --include-dest a missing source still allows an index-only run
    if let Err(err) = config.validate(!config.include_dest) {
        error!("{err}");
        return Err(1);
    }
    Ok(config)
}

fn run_pipeline(config: Config) -> i32 {
    let probe = match ExifToolProbe::new(config.exiftool_chunk_size) {
        Ok(probe) => probe,
        Err(err) => {
            error!("{err}; install it first (brew install exiftool)");
            return 2;
        }
    };

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        if let Err(err) = ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst)) {
            warn!("could not install interrupt handler: {err}");
        }
    }

    let organizer = match Organizer::new(config, Box::new(probe), cancel) {
        Ok(organizer) => organizer,
        Err(err) => {
            error!("cannot start run: {err}");
            return 2;
        }
    };
    match organizer.run() {
        Ok(counts) => {
            if counts.error > 0 {
                warn!("{} files hit errors; see error.csv", counts.error);
            }
            0
        }
        Err(err) => {
            error!("run aborted: {err}");
            2
        }
    }
}

fn init(config_path: &Path) -> i32 {
    if !config_path.exists() {
        if let Err(err) = fs::write(config_path, EXAMPLE_CONFIG) {
            error!("could not write {}: {err}", config_path.display());
            return 2;
        }
        println!(
            "wrote {}; edit paths.source and paths.dest, then run `photox run`",
            config_path.display()
        );
        return 0;
    }

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return 1;
        }
    };
    for dir in [
        &config.dest,
        &config.data_dir,
        &config.dup_dir,
        &config.orphan_aae_dir,
        &config.second_check_dir,
    ] {
        if let Err(err) = fs::create_dir_all(dir) {
            error!("could not create {}: {err}", dir.display());
            return 2;
        }
    }
    println!("archive skeleton ready under {}", config.dest.display());
    0
}

fn status(config_path: &Path) -> i32 {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return 1;
        }
    };

    let history = report::read_history(&config.history_file());
    if history.is_empty() {
        println!("no recorded runs");
    } else {
        println!("{} recorded runs; most recent:", history.len());
        for record in history.iter().rev().take(5) {
            println!(
                "  {}  moved={} duplicate={} dest_duplicate={} orphan_aae={} unrecognized={} error={}{}",
                record.run_id,
                record.counts.moved,
                record.counts.duplicate,
                record.counts.dest_duplicate,
                record.counts.orphan_aae,
                record.counts.unrecognized,
                record.counts.error,
                if record.dry_run { "  (dry-run)" } else { "" },
            );
        }
    }

    if config.db_path.exists() {
        match IndexStore::open(&config.db_path).and_then(|index| index.len()) {
            Ok(entries) => println!(
                "index: {entries} fingerprints at {}",
                config.db_path.display()
            ),
            Err(err) => {
                error!("could not read index: {err}");
                return 2;
            }
        }
    } else {
        println!("index: not built yet (run `photox build-index`)");
    }
    0
}
