use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use adbhost::util::logging::{init_logger, LogVerbosity};
use adbhost::{AdbHost, FileKeyStore};

#[derive(Debug, Parser)]
#[command(name = "adbhost-cli", version, about = "Host-side ADB-over-USB protocol client")]
struct Cli {
    /// Device index among matching ADB interfaces
    #[arg(long, default_value_t = 0, global = true)]
    device_index: usize,

    /// Verbose logging (repeat for more: -v, -vv)
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Connect and print the device's serial, product, and model
    ConnectInfo,
    /// Run a shell command and print its output
    Shell { cmd: String },
    /// List installed packages (pm list packages)
    ListPackages,
    /// Enable a package (pm enable PKG)
    Enable { package: String },
    /// Disable a package for the current user (pm disable-user --user 0 PKG)
    Disable { package: String },
    /// Uninstall a package for the current user (pm uninstall --user 0 PKG)
    Uninstall { package: String },
    /// Print a diagnostics snapshot (recent packets, stream count, uptime)
    Diagnostics,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(match cli.verbose {
        0 => LogVerbosity::Normal,
        1 => LogVerbosity::Verbose,
        _ => LogVerbosity::Debug,
    });

    let key_store = FileKeyStore::new();
    let mut host = AdbHost::new();
    let info = host
        .connect_usb(cli.device_index, &key_store)
        .context("connecting to ADB device over USB")?;

    let result = run_command(&host, &cli.command, &info);

    host.disconnect();
    result
}

fn run_command(host: &AdbHost, command: &Commands, info: &adbhost::ConnectInfo) -> Result<()> {
    match command {
        Commands::ConnectInfo => {
            println!("serial:  {}", info.serial);
            println!("product: {}", info.product);
            println!("model:   {}", info.model);
        }
        Commands::Shell { cmd } => {
            let output = host.run_shell(cmd).context("running shell command")?;
            print!("{output}");
        }
        Commands::ListPackages => {
            for package in host.list_packages().context("listing packages")? {
                println!("{package}");
            }
        }
        Commands::Enable { package } => {
            let output = host.enable_package(package).context("enabling package")?;
            print!("{output}");
        }
        Commands::Disable { package } => {
            let output = host.disable_package(package).context("disabling package")?;
            print!("{output}");
        }
        Commands::Uninstall { package } => {
            let output = host.uninstall_package(package).context("uninstalling package")?;
            print!("{output}");
        }
        Commands::Diagnostics => {
            let diag = host.diagnostics();
            println!("connected:          {}", diag.connected);
            println!("max_payload:        {}", diag.max_payload);
            println!("open streams:       {}", diag.open_stream_count);
            println!("uptime:             {:?}", diag.uptime);
            println!("recent packets ({}):", diag.recent_packets.len());
            for pkt in &diag.recent_packets {
                println!(
                    "  {:?} {} arg0={:#x} arg1={:#x} len={} checksum={:#x}",
                    pkt.direction, pkt.command, pkt.arg0, pkt.arg1, pkt.payload_len, pkt.payload_checksum
                );
            }
        }
    }
    Ok(())
}
