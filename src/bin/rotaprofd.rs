// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use rotaprof::{
    config::AgentConfig,
    endpoint,
    facility::{ProfilingFacility, RuntimeFacility},
    gate::ProfilingGate,
};

#[cfg(target_os = "linux")]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

// heap profiling needs jemalloc's sampling switched on from the start
#[cfg(target_os = "linux")]
#[allow(non_upper_case_globals)]
#[export_name = "_rjem_malloc_conf"]
pub static malloc_conf: &[u8] = b"prof:true,prof_active:true,lg_prof_sample:19\0";

pub fn set_up_tracing() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    let format = tracing_subscriber::fmt::layer();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(format)
        .with(filter)
        .init();
}

/// Rotating in-process profiler with a live /debug/pprof endpoint
#[derive(Parser, Debug)]
struct Args {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Address of the diagnostics endpoint, overrides the config file
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Directory for rotation artifacts, overrides the config file
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    worker_threads: Option<usize>,
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut rt: tokio::runtime::Builder = tokio::runtime::Builder::new_multi_thread();
    rt.enable_all();
    if let Some(worker_threads) = args.worker_threads {
        rt.worker_threads(worker_threads);
    }
    let rt = rt.build()?;
    rt.block_on(main_internal(args))
}

async fn main_internal(args: Args) -> anyhow::Result<()> {
    set_up_tracing();

    let mut config = match &args.config {
        Some(path) => AgentConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(output_dir) = args.output_dir {
        config.output_dir = output_dir;
    }
    tracing::info!(?config, "rotaprofd started");

    let facility = RuntimeFacility::default();
    facility.set_block_profile_rate(config.block_rate);
    let gate = ProfilingGate::new(facility, config.gate_config());

    let rotation = config
        .rotation(gate.clone())
        .context("building the profiling rotation")?;
    let rotation = rotation.spawn();
    tracing::info!(output_dir = %config.output_dir.display(), "profiling rotation started");

    let app = endpoint::router(config.diagnostics_state(gate));
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    tracing::info!(listen = %config.listen, "serving /debug/pprof/");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(%err, "unable to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
        })
        .await
        .context("serving the diagnostics endpoint")?;

    rotation.abort();
    Ok(())
}
