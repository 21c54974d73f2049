//! fleet-gate
//!
//! # Architecture Overview
//!
//! ```text
//!                       ┌──────────────────────────────────────────────────────┐
//!                       │                      FLEET GATE                       │
//!                       │                                                       │
//!   Client Request      │  ┌────────────┐   ┌─────────────┐   ┌─────────────┐  │
//!   ────────────────────┼─▶│ rate_limit │──▶│load_balancer│──▶│ http proxy  │──┼──▶ Instance
//!   ◀── 429 ────────────┼──│  buckets   │   │  strategy   │   │ retry/stream│  │
//!   ◀── 503             │  └────────────┘   └──────┬──────┘   └──────┬──────┘  │
//!                       │                          │ snapshot        │ outcome │
//!                       │                          ▼                 ▼         │
//!                       │                   ┌──────────────────────────────┐   │
//!                       │                   │          registry            │   │
//!                       │                   └──────▲───────────────▲───────┘   │
//!                       │                          │               │           │
//!                       │                   ┌──────┴─────┐  ┌──────┴───────┐   │
//!                       │                   │   health   │─▶│   scaling    │───┼──▶ Orchestrator
//!                       │                   │probes/evict│  │  controller  │   │
//!                       │                   └────────────┘  └──────────────┘   │
//!                       │                                                       │
//!                       │   config (hot reload) · observability · admin API     │
//!                       └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "fleet-gate")]
#[command(about = "Load balancing, rate limiting, health checking and autoscaling gateway", long_about = None)]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "FLEET_GATE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = fleet_gate::lifecycle::run(args.config).await {
        eprintln!("fleet-gate: {}", e);
        std::process::exit(1);
    }
}
