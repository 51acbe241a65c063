//! Braid mesh node
//!
//! One process, one router. The node:
//! - listens for authenticated peer channels when configured;
//! - logs in to upstream peers (bonded channels with `count` > 1);
//! - fronts local applications with a SOCKS5 proxy;
//! - serves a read-only JSON state endpoint;
//! and offers console subcommands (`ping`, `exec`, `state`) on top.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod console;
mod socks;
mod web;

use braid_router::{ChannelOptions, Router};
use cli::{Cli, Commands};
use crate::config::NodeConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if cli.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };
        EnvFilter::new(format!(
            "braid_node={},braid_router={},braid_common={}",
            level, level, level
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Some(Commands::GenerateConfig) => {
            println!("{}", NodeConfig::generate_sample_config());
            return Ok(ExitCode::SUCCESS);
        }
        Some(Commands::State) => {
            let config = NodeConfig::load(&cli.config)?;
            let state = config
                .state
                .ok_or_else(|| anyhow::anyhow!("no [state] section in configuration"))?;
            console::print_state(state.listen).await?;
            return Ok(ExitCode::SUCCESS);
        }
        Some(Commands::Ping {
            path,
            count,
            delay_ms,
        }) => {
            let config = NodeConfig::load(&cli.config)?;
            let router = start_router(&config, false).await?;
            let result =
                console::ping(&router, &path, count, Duration::from_millis(delay_ms)).await;
            router.close().await;
            result?;
            return Ok(ExitCode::SUCCESS);
        }
        Some(Commands::Exec { command }) => {
            let config = NodeConfig::load(&cli.config)?;
            let template = config
                .socks
                .as_ref()
                .map(|s| s.template.clone())
                .unwrap_or_else(|| "tcp://${HOST}".to_string());
            let router = start_router(&config, false).await?;
            let code = console::proxy_exec(router.clone(), &template, &command).await;
            router.close().await;
            return Ok(ExitCode::from(code?.clamp(0, 255) as u8));
        }
        Some(Commands::ExecSsh {
            uri,
            key_path,
            command,
            proxy_command,
            args,
        }) => {
            let config = NodeConfig::load(&cli.config)?;
            let router = start_router(&config, false).await?;
            let code = console::proxy_ssh(
                router.clone(),
                &uri,
                key_path.as_deref(),
                &command,
                &proxy_command,
                &args,
            )
            .await;
            router.close().await;
            return Ok(ExitCode::from(code?.clamp(0, 255) as u8));
        }
        Some(Commands::Run) | None => {}
    }

    let config = NodeConfig::load(&cli.config)?;
    tracing::info!(
        name = %config.name,
        version = env!("CARGO_PKG_VERSION"),
        "starting braid node"
    );

    let router = start_router(&config, true).await?;

    if let Some(socks) = &config.socks {
        let proxy = socks::SocksProxy::new(router.clone(), socks.template.clone());
        proxy.start(&socks.listen).await?;
    }
    if let Some(state) = &config.state {
        web::serve_state(state.listen, router.clone()).await?;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    router.close().await;
    Ok(ExitCode::SUCCESS)
}

/// Build the router from configuration, bind the listener when requested,
/// and establish every configured outbound channel.
async fn start_router(config: &NodeConfig, listen: bool) -> anyhow::Result<Router> {
    let router = Router::new(config.router_config());

    if listen {
        if let Some(addr) = &config.listen {
            router.listen(addr).await?;
        }
    }

    for channel in &config.channels {
        let options: Vec<ChannelOptions> = (0..channel.count.max(1))
            .map(|index| ChannelOptions {
                remote: channel.remote.clone(),
                token: channel.token.clone(),
                index,
            })
            .collect();
        router.login_channels(&options).await?;
    }

    Ok(router)
}
