// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! tinywhip CLI
//!
//! Publishes to a WHIP endpoint or plays from a WHEP endpoint until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tinywhip::media::{LocalTrack, PeerRole, WebRtcPeer};
use tinywhip::{
    HttpSignaling, IceBootstrap, ReconnectOutcome, WhepClient, WhepConfig, WhipClient,
    WhipConfig,
};

#[derive(Parser)]
#[command(name = "tinywhip")]
#[command(author, version, about = "WHIP/WHEP signaling client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CommonArgs {
    /// WHIP/WHEP endpoint URL (overrides the config file)
    #[arg(value_name = "ENDPOINT")]
    endpoint: Option<String>,

    /// TOML configuration file
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bearer token sent with signaling requests
    #[arg(long, env = "TINYWHIP_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish an H.264 + Opus session to a WHIP endpoint
    Publish {
        #[command(flatten)]
        common: CommonArgs,

        /// Send the offer once ICE gathering completes instead of trickling
        #[arg(long)]
        no_trickle: bool,

        /// Fetch ICE servers from the endpoint (needs an auth token)
        #[arg(long)]
        fetch_ice_servers: bool,
    },

    /// Play a session from a WHEP endpoint
    Play {
        #[command(flatten)]
        common: CommonArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Publish {
            common,
            no_trickle,
            fetch_ice_servers,
        } => {
            let mut config = match &common.config {
                Some(path) => WhipConfig::from_toml_file(path)
                    .with_context(|| format!("Failed to load {}", path.display()))?,
                None => WhipConfig::default(),
            };
            if let Some(endpoint) = common.endpoint {
                config.endpoint_url = endpoint;
            }
            if common.auth_token.is_some() {
                config.auth_token = common.auth_token;
            }
            config.no_trickle_ice |= no_trickle;
            config.debug |= common.debug;

            publish(config, fetch_ice_servers).await
        }
        Commands::Play { common } => {
            let mut config = match &common.config {
                Some(path) => WhepConfig::from_toml_file(path)
                    .with_context(|| format!("Failed to load {}", path.display()))?,
                None => WhepConfig::default(),
            };
            if let Some(endpoint) = common.endpoint {
                config.endpoint_url = endpoint;
            }
            if common.auth_token.is_some() {
                config.auth_token = common.auth_token;
            }
            config.debug |= common.debug;

            play(config).await
        }
    }
}

async fn publish(config: WhipConfig, fetch_ice_servers: bool) -> Result<()> {
    tinywhip::logging::init(config.debug);
    config.validate().context("Invalid WHIP configuration")?;

    let signaling = HttpSignaling::new(config.request_timeout())?
        .with_auth_token(config.auth_token.clone());
    let (peer, events) = WebRtcPeer::new(PeerRole::Publish);

    let session = WhipClient::spawn(config, Arc::new(signaling), Arc::new(peer), events)?;

    if fetch_ice_servers {
        match session.set_ice_servers_from_endpoint().await? {
            IceBootstrap::Applied(servers) => {
                println!("Using {} ICE server(s) from endpoint", servers.len())
            }
            IceBootstrap::Skipped(warning) => println!("ICE server fetch skipped: {:?}", warning),
        }
    }

    let tracks = vec![LocalTrack::h264("tinywhip"), LocalTrack::opus("tinywhip")];
    let ingest = tokio::select! {
        result = session.ingest(tracks) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    match ingest {
        Some(Ok(())) => {
            if let Some(resource) = session.resource_url().await? {
                println!("Publishing: {}", resource);
            }
            for extension in session.resource_extensions().await? {
                println!("  extension: {}", extension);
            }
            println!("Press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
        }
        Some(Err(e)) => {
            session.destroy().await?;
            return Err(e).context("WHIP negotiation failed");
        }
        None => {}
    }

    session.destroy().await?;
    println!("Session closed");
    Ok(())
}

async fn play(config: WhepConfig) -> Result<()> {
    tinywhip::logging::init(config.debug);

    let signaling = HttpSignaling::new(config.request_timeout())?
        .with_auth_token(config.auth_token.clone());
    let (peer, events) = WebRtcPeer::new(PeerRole::Play);
    let mut client = WhepClient::new(config, Arc::new(signaling), Arc::new(peer), events)
        .context("Invalid WHEP configuration")?;

    let outcome = tokio::select! {
        outcome = client.connect() => Some(outcome.context("WHEP negotiation failed")?),
        _ = tokio::signal::ctrl_c() => None,
    };

    if let Some(ReconnectOutcome::Established { location }) = outcome {
        println!(
            "Playing: {}",
            location.as_deref().unwrap_or("(no Location header)")
        );
        println!("Press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }

    client.terminate().await?;
    println!("Session closed");
    Ok(())
}
