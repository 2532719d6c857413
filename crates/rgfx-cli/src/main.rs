mod probe;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use rgfx_core::config::{default_config_path, RgfxConfig};

#[derive(Parser)]
#[command(name = "rgfx")]
#[command(about = "rgfx - record graphics commands locally, replay them on a remote host")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to /etc/rgfx/rgfx.toml, then ./rgfx.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host the software device and accept client sessions
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(short, long)]
        bind: Option<String>,

        /// Write PID to this file (for service managers)
        #[arg(long)]
        pid_file: Option<String>,
    },

    /// Connect to a host, print its device and run one bake round trip
    Probe {
        /// Host address (host:port); defaults to client.address
        addr: Option<String>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        // The probe prints its own report; keep the log to problems.
        Commands::Probe { .. } => {
            rgfx_common::init_logging_with_default("warn");
        }
        _ => rgfx_common::init_logging(),
    }

    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Serve { port, bind, pid_file } => {
            let mut config = load_config(&config_path)?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            config.validate()?;

            if let Some(ref path) = pid_file {
                std::fs::write(path, std::process::id().to_string())?;
            }

            info!(
                "starting rgfx host on {}:{} ({})",
                config.server.bind,
                config.server.port,
                rgfx_common::platform::platform_name()
            );
            let server = Arc::new(rgfx_server::RgfxServer::new(&config));
            let result = server.run().await.map_err(|e| anyhow::anyhow!("{}", e));

            if let Some(ref path) = pid_file {
                let _ = std::fs::remove_file(path);
            }

            result?;
        }

        Commands::Probe { addr, json } => {
            let mut config = load_config(&config_path)?;
            if let Some(addr) = addr {
                config.client.address = addr;
            }
            if !probe::run_probe(&config, json).await {
                std::process::exit(1);
            }
        }

        Commands::Config => {
            let config = load_config(&config_path)?;
            println!("# effective configuration ({})", config_path);
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// A missing file means defaults; a file that fails to parse or validate is
/// an error.
fn load_config(path: &str) -> anyhow::Result<RgfxConfig> {
    if std::path::Path::new(path).exists() {
        Ok(RgfxConfig::load(path)?)
    } else {
        info!("no config at {}, using defaults", path);
        Ok(RgfxConfig::default())
    }
}
