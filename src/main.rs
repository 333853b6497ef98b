// src/main.rs

//! The main entry point for the inferctl control-plane binary. A single
//! executable runs in one of two modes selected by the first argument,
//! mirroring how the original service ships a single daemon that is told
//! which role to take on at launch.

use anyhow::Result;
use inferctl::controller;
use inferctl::coordinator::{self, config::CoordinatorAddrs};
use std::env;
use tracing::error;

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

fn init_logging() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .with_ansi(true)
        .init();
}

fn usage() -> ! {
    eprintln!(
        "Usage:\n  \
         inferctl controller [config-path]\n  \
         inferctl coordinator <predict_ip> <predict_port> <manage_ip> <manage_port> [config-path]\n\n\
         The config path may be omitted if MINDIE_MS_CONTROLLER_CONFIG_FILE_PATH or\n\
         MINDIE_MS_COORDINATOR_CONFIG_FILE_PATH is set in the environment."
    );
    std::process::exit(1);
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("inferctl version {VERSION}");
        return Ok(());
    }

    if args.len() < 2 {
        usage();
    }

    match args[1].as_str() {
        "controller" => {
            // Usage: inferctl controller [config-path]
            let config_path = match controller::config::ControllerConfig::resolve_path(args.get(2).map(String::as_str)) {
                Ok(path) => path,
                Err(e) => {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            };

            init_logging();
            if let Err(e) = controller::run(&config_path).await {
                error!("controller runtime error: {}", e);
                return Err(e);
            }
        }
        "coordinator" => {
            // Usage: inferctl coordinator <predict_ip> <predict_port> <manage_ip> <manage_port> [config-path]
            if args.len() < 6 {
                usage();
            }
            let predict_ip = args[2].clone();
            let predict_port: u16 = match args[3].parse() {
                Ok(p) => p,
                Err(_) => {
                    eprintln!("invalid predict_port: {}", args[3]);
                    std::process::exit(1);
                }
            };
            let manage_ip = args[4].clone();
            let manage_port: u16 = match args[5].parse() {
                Ok(p) => p,
                Err(_) => {
                    eprintln!("invalid manage_port: {}", args[5]);
                    std::process::exit(1);
                }
            };
            let addrs = CoordinatorAddrs {
                predict_ip,
                predict_port,
                manage_ip,
                manage_port,
            };

            let config_path =
                match coordinator::config::CoordinatorConfig::resolve_path(args.get(6).map(String::as_str)) {
                    Ok(path) => path,
                    Err(e) => {
                        eprintln!("{e}");
                        std::process::exit(1);
                    }
                };

            init_logging();
            if let Err(e) = coordinator::run(&config_path, addrs).await {
                error!("coordinator runtime error: {}", e);
                return Err(e);
            }
        }
        other => {
            eprintln!("unknown mode \"{other}\"");
            usage();
        }
    }

    Ok(())
}
