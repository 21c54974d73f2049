use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "gate-cli")]
#[command(about = "Management CLI for fleet-gate", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "FLEET_GATE_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Gateway status and registry summary
    Status,
    /// List instances with health and connections
    Instances,
    /// Scaling controller state and last intent
    Scaling,
    /// Rate limiter parameters and counters
    Limiter,
    /// Switch the load balancing strategy (round_robin, least_conn, ip_hash, weighted)
    Strategy { name: String },
    /// Report external utilization (0 to 1) for the external scaling signal
    Utilization { value: f64 },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );
    let client = reqwest::Client::builder().default_headers(headers).build()?;
    let base = cli.url.trim_end_matches('/');

    let res = match cli.command {
        Commands::Status => client.get(format!("{}/admin/status", base)).send().await?,
        Commands::Instances => client.get(format!("{}/admin/instances", base)).send().await?,
        Commands::Scaling => client.get(format!("{}/admin/scaling", base)).send().await?,
        Commands::Limiter => client.get(format!("{}/admin/limiter", base)).send().await?,
        Commands::Strategy { name } => {
            client
                .put(format!("{}/admin/strategy", base))
                .json(&json!({ "strategy": name }))
                .send()
                .await?
        }
        Commands::Utilization { value } => {
            client
                .put(format!("{}/admin/utilization", base))
                .json(&json!({ "utilization": value }))
                .send()
                .await?
        }
    };

    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let text = res.text().await?;
    if text.is_empty() {
        println!("{}", status);
        return Ok(());
    }
    let json: Value = serde_json::from_str(&text)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
