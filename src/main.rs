use clap::Parser;
use log::error;
use std::path::PathBuf;
use std::process::ExitCode;
use tsindex::logging;
use tsindex::probe::MpegTsProber;
use tsindex::reader::walk_path;
use tsindex::store::Store;

/// Index DVB transport stream metadata into a SQLite database.
#[derive(Parser)]
#[command(name = "tsindex", version)]
struct Args {
    /// Verbosity: a severity 0-3 for everything, or comma-separated
    /// component:severity tokens (components: tsindex, probe, psi, store)
    #[arg(short = 'v', value_name = "VERBOSITY")]
    verbosity: Option<String>,

    /// SQLite database file to create or update
    #[arg(value_name = "DBFILE")]
    db: PathBuf,

    /// Transport stream files or directories to index
    #[arg(value_name = "STREAM", required = true)]
    streams: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = logging::init(args.verbosity.as_deref()) {
        eprintln!("could not install the logger: {}", e);
        return ExitCode::FAILURE;
    }

    let store = match Store::open(&args.db) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Could not init database {}: {}", args.db.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = store.ensure_schema() {
        eprintln!("Could not init database {}: {}", args.db.display(), e);
        return ExitCode::FAILURE;
    }

    let prober = MpegTsProber::default();
    for stream in &args.streams {
        if let Err(e) = walk_path(&store, &prober, stream) {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}
