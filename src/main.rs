use clap::Parser;
use env_logger::Target;
use fuser::MountOption;
use remote_fs::client::{RemoteClient, RemoteStore};
use remote_fs::credentials::Credentials;
use remote_fs::fs::RemoteFs;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

/// The remote object store this client authenticates against. Unlike the
/// rest of the CLI surface (§6), this is not user-configurable: the
/// protocol (endpoint paths, form fields, login-redirect contract) is
/// specific to one remote service, matching the system this was built
/// against (see DESIGN.md).
const API_BASE: &str = "https://cloud.example.com/api/v2";
const EXPECTED_LANDING: &str = "https://cloud.example.com/home";

/// `prog MOUNTPOINT -c CREDENTIALS_FILE -t TEMP_DIR [-l LOGFILE]` (§6).
#[derive(Parser, Debug)]
#[command(name = "remote-fs", about = "Mount a remote cloud-storage account as a local filesystem")]
struct Cli {
    /// Local directory to mount the remote account onto.
    mountpoint: PathBuf,

    /// Path to the credentials file (`login`/`password`).
    #[arg(short = 'c', long = "credentials", value_name = "CREDENTIALS_FILE")]
    credentials: PathBuf,

    /// Directory used to back the per-open-file read/write cache.
    #[arg(short = 't', long = "temp-dir", value_name = "TEMP_DIR")]
    temp_dir: PathBuf,

    /// Optional log sink; defaults to stderr.
    #[arg(short = 'l', long = "log-file", value_name = "LOGFILE")]
    log_file: Option<PathBuf>,

    /// Stay attached to the terminal instead of daemonizing. Not part of
    /// the external CLI contract (§6) — a debugging convenience only.
    #[arg(long)]
    foreground: bool,
}

fn init_logging(log_file: Option<&PathBuf>) {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    );
    if let Some(path) = log_file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!("failed to open log file {}: {e}", path.display());
            }
        }
    }
    builder.init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_ref());

    let creds = match Credentials::load(&cli.credentials) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error reading credentials file: {e}");
            std::process::exit(1);
        }
    };

    let client = match RemoteClient::new(API_BASE, &creds, EXPECTED_LANDING) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("login failed: {e}");
            std::process::exit(1);
        }
    };
    let remote: Arc<dyn RemoteStore> = Arc::new(client);

    if let Err(e) = std::fs::create_dir_all(&cli.temp_dir) {
        eprintln!("failed to prepare temp dir {}: {e}", cli.temp_dir.display());
        std::process::exit(1);
    }

    if !cli.foreground {
        let daemon = daemonize::Daemonize::new();
        if let Err(e) = daemon.start() {
            eprintln!("daemonize failed: {e}");
            std::process::exit(1);
        }
    }

    let fs = RemoteFs::new(remote, cli.temp_dir.clone());

    // `nothreads=true`/single-threaded dispatch (§5) is the default
    // behavior of `fuser::mount2`'s blocking request loop; there is no
    // separate opt-out to disable here, unlike the `allow_other` flag
    // below which must be requested explicitly (§6).
    let options = vec![
        MountOption::FSName("remote-fs".to_string()),
        MountOption::AllowOther,
    ];

    log::info!("mounting {} at {}", API_BASE, cli.mountpoint.display());
    if let Err(e) = fuser::mount2(fs, &cli.mountpoint, &options) {
        log::error!("mount failed: {e}");
        std::process::exit(1);
    }
}
