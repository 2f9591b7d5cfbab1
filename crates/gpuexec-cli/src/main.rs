#![forbid(unsafe_code)]

mod workload;

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use gpuexec_csr::sim::ExecutionMode;
use gpuexec_csr::GfxFamily;

use crate::workload::RunConfig;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FamilyArg {
    Gen9,
    Gen12,
    XeHpc,
    Xe2,
}

impl From<FamilyArg> for GfxFamily {
    fn from(family: FamilyArg) -> Self {
        match family {
            FamilyArg::Gen9 => GfxFamily::Gen9,
            FamilyArg::Gen12 => GfxFamily::Gen12,
            FamilyArg::XeHpc => GfxFamily::XeHpc,
            FamilyArg::Xe2 => GfxFamily::Xe2,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "gpuexec",
    about = "Drive command stream receivers against the simulated device and print their statistics as JSON."
)]
struct Args {
    /// JSON run configuration; omitted fields keep their defaults and GPUEXEC_* variables are ignored
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// GPU family whose receiver is built
    #[arg(long, value_enum)]
    family: Option<FamilyArg>,

    /// Number of engines (one receiver and OS context each)
    #[arg(long)]
    engines: Option<u32>,

    /// Flushes submitted by every engine
    #[arg(long)]
    flushes: Option<u32>,

    /// Tiles every engine spans
    #[arg(long)]
    tiles: Option<u32>,

    /// Queue batches and execute them on a worker thread
    #[arg(long, action = clap::ArgAction::SetTrue)]
    deferred: bool,

    /// Make every n-th flush blocking (0 disables)
    #[arg(long, value_name = "N")]
    blocking_every: Option<u32>,

    /// Do not map a host range into each flush
    #[arg(long, action = clap::ArgAction::SetTrue)]
    no_host_surfaces: bool,

    /// Write the report to this path instead of stdout
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
}

fn load_config(args: &Args) -> anyhow::Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?
        }
        None => RunConfig::from_env()?,
    };
    if let Some(family) = args.family {
        config.family = family.into();
    }
    if let Some(engines) = args.engines {
        config.engines = engines;
    }
    if let Some(flushes) = args.flushes {
        config.flushes = flushes;
    }
    if let Some(tiles) = args.tiles {
        config.tiles = tiles;
    }
    if args.deferred {
        config.mode = ExecutionMode::Deferred;
    }
    if let Some(n) = args.blocking_every {
        config.blocking_every = n;
    }
    if args.no_host_surfaces {
        config.host_surfaces = false;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let report = workload::run(&config)?;
    if report.gpu_hang {
        tracing::warn!("device hung during the run");
    }

    let json = serde_json::to_string_pretty(&report).context("serialize report")?;
    match &args.report {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("write report {}", path.display()))?
        }
        None => println!("{json}"),
    }
    Ok(())
}
