use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use astergate_gateway::{
    config::{self, Config},
    server::{GatewayServer, GatewayService},
};
use clap::Parser;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "astergate", about = "PBX to browser softphone gateway")]
struct Args {
    /// Main config file path
    #[arg(short = 'c', default_value = "/usr/local/etc/astergate.toml")]
    config: String,
    /// Group definitions path
    #[arg(short = 'g', default_value = "/usr/local/etc/astergate_groups.toml")]
    groups: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config load error {}: {err:#}", args.config);
            std::process::exit(1);
        }
    };
    astergate_log::init(&config.log_level);
    info!(path = %args.config, "config loaded");

    let groups = match config::load_groups(&args.groups) {
        Ok(groups) => {
            info!(path = %args.groups, count = groups.len(), "groups loaded");
            groups
        }
        Err(err) => {
            warn!(path = %args.groups, %err, "group config load error, groups disabled");
            HashMap::new()
        }
    };

    let service = Arc::new(GatewayService::new(config, groups)?);
    GatewayServer::new(service).run().await?;
    Ok(())
}
