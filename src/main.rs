use std::env;
use std::sync::Arc;

use tracing::{error, info};

use crosswire::config::{Config, SsConfig};
use crosswire::proxy::Proxy;
use crosswire::registry::Registry;

fn version() -> &'static str {
    option_env!("CROSSWIRE_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"))
}

fn print_usage() {
    println!("Usage: crosswire [-f <config.json>] [--ss-config <config.json>] [--version]");
    println!("Example: crosswire -f client.json");
}

fn parse_args() -> Result<Config, String> {
    let args: Vec<String> = env::args().collect();
    let mut config_file = "client.json".to_string();
    let mut ss_config_file: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-f" => {
                i += 1;
                config_file = args.get(i).ok_or("missing value for -f")?.clone();
            }
            "--ss-config" => {
                i += 1;
                ss_config_file = Some(args.get(i).ok_or("missing value for --ss-config")?.clone());
            }
            "--version" => {
                println!("Crosswire {}", version());
                std::process::exit(0);
            }
            other => {
                return Err(format!("unknown argument: {}", other));
            }
        }
        i += 1;
    }

    let config = match ss_config_file {
        Some(path) => SsConfig::load(&path)
            .map_err(|e| e.to_string())?
            .into_config(),
        None => Config::load(&config_file).map_err(|e| e.to_string())?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    println!(
        "Crosswire {}, socks5-fronted vless/trojan/shadowsocks tunnel",
        version()
    );

    let config = match parse_args() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage();
            std::process::exit(1);
        }
    };

    let registry = Registry::new();
    let proxy = match Proxy::new(&config, &registry) {
        Ok(proxy) => Arc::new(proxy),
        Err(e) => {
            error!("can not create proxy: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "starting: {} -> {} (route: {:?})",
        config.local, config.remote, config.route
    );

    tokio::select! {
        result = proxy.run() => {
            if let Err(e) = result {
                error!("can not run proxy: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("caught interrupt, exit");
        }
    }
}
