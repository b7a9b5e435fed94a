//! Mount the SMB network namespace
//!
//! Usage:
//!   smbnet-mount --network <fixture.toml> [mount_point]
//!
//! Example:
//!   smbnet-mount --network fixtures/network.toml /mnt/network
//!
//! The remote side is a simulated network described by a TOML fixture.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use smbnet_core::Config;
use smbnet_daemon::{
    event_channel, request_channel, NetworkFixture, RemoteLock, Scanner, TracingNotifier, Volume,
    VolumeOptions,
};

#[derive(Parser)]
#[command(name = "smbnet-mount")]
#[command(about = "Mount the SMB network neighbourhood as a filesystem")]
struct Cli {
    /// Mount point (defaults to the configured one)
    mount_point: Option<PathBuf>,

    /// Configuration file (defaults to the per-user config)
    #[arg(short, long, env = "SMBNET_CONFIG")]
    config: Option<PathBuf>,

    /// Simulated network to serve, as a TOML fixture
    #[arg(long)]
    network: PathBuf,

    /// Reject every write to shares
    #[arg(long)]
    read_only: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if cli.read_only {
        config.mount.read_only = true;
    }
    if let Some(mount_point) = &cli.mount_point {
        config.mount.mount_point = Some(mount_point.clone());
    }

    if cli.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let mount_point = config
        .mount
        .mount_point
        .clone()
        .ok_or("no mount point given and none configured")?;

    let network = NetworkFixture::load(&cli.network)?.build();
    network.login(&config.remote.username);
    info!(
        "Serving simulated network from {:?} as {:?}",
        cli.network, config.remote.username
    );
    let remote = Arc::new(RemoteLock::new(network));

    let (request_tx, request_rx) = request_channel();
    let (event_tx, event_rx) = event_channel();

    let scanner = Scanner::new(remote.clone(), event_tx, config.scan.scan_interval());
    let scanner_thread = scanner.spawn(request_rx)?;

    let volume = Arc::new(
        Volume::new(
            VolumeOptions::from_config(&config),
            remote,
            Arc::new(TracingNotifier),
        )
        .with_scanner(request_tx),
    );
    let pump_thread = volume.clone().spawn_event_pump(event_rx)?;

    // Populate the root before the first listing
    volume.network_scan();

    let mounted = mount(volume.clone(), &config, &mount_point);

    if let Err(e) = volume.stop_scanner() {
        error!("failed to stop scanner: {}", e);
    }
    if scanner_thread.join().is_err() {
        error!("scanner thread panicked");
    }
    if pump_thread.join().is_err() {
        error!("event thread panicked");
    }
    mounted
}

#[cfg(unix)]
fn mount(
    volume: Arc<Volume>,
    config: &Config,
    mount_point: &std::path::Path,
) -> Result<(), Box<dyn std::error::Error>> {
    use std::time::Duration;

    use fuser::MountOption;
    use smbnet_daemon::SmbNetworkFs;

    if !mount_point.exists() {
        std::fs::create_dir_all(mount_point)?;
    }

    let ttl = Duration::from_secs(config.mount.attr_ttl_secs);
    let fs = SmbNetworkFs::new(volume, ttl);

    let mut options = vec![
        MountOption::FSName("smbnet".to_string()),
        MountOption::Subtype(config.mount.volume_name.replace(' ', "_")),
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
    ];
    if config.mount.read_only {
        options.push(MountOption::RO);
    }

    info!("Mounting {:?} at {:?}", config.mount.volume_name, mount_point);
    // This blocks until unmounted
    fuser::mount2(fs, mount_point, &options)?;
    info!("Unmounted {:?}", mount_point);
    Ok(())
}

#[cfg(not(unix))]
fn mount(
    _volume: Arc<Volume>,
    _config: &Config,
    _mount_point: &std::path::Path,
) -> Result<(), Box<dyn std::error::Error>> {
    Err("mounting requires FUSE, which is only available on Unix".into())
}
