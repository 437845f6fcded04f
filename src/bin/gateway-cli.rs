use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Management CLI for the front-door gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:8081")]
    url: String,

    #[arg(short, long, env = "FRONT_DOOR_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show gateway status
    Status,
    /// List backends with health, load and latency
    Backends,
    /// Register a backend
    AddBackend {
        url: String,
        #[arg(short, long, default_value_t = 1)]
        weight: u32,
    },
    /// Unregister a backend
    RemoveBackend { url: String },
    /// Switch the load-balancing strategy
    Strategy { name: String },
    /// Add an IP or CIDR to the rate-limit allow-list
    Allow { ip: String },
    /// Remove an IP or CIDR from the rate-limit allow-list
    Disallow { ip: String },
    /// Block an IP for a number of seconds
    Block {
        ip: String,
        #[arg(short, long, default_value_t = 3600)]
        ttl_secs: u64,
    },
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

    let request = match cli.command {
        Commands::Status => client.get(format!("{}/admin/status", base)),
        Commands::Backends => client.get(format!("{}/admin/backends", base)),
        Commands::AddBackend { url, weight } => client
            .post(format!("{}/admin/backends", base))
            .json(&json!({ "url": url, "weight": weight })),
        Commands::RemoveBackend { url } => client
            .delete(format!("{}/admin/backends", base))
            .json(&json!({ "url": url })),
        Commands::Strategy { name } => client
            .put(format!("{}/admin/strategy", base))
            .json(&json!({ "strategy": name })),
        Commands::Allow { ip } => client
            .post(format!("{}/admin/allowlist", base))
            .json(&json!({ "ip": ip })),
        Commands::Disallow { ip } => client
            .delete(format!("{}/admin/allowlist", base))
            .json(&json!({ "ip": ip })),
        Commands::Block { ip, ttl_secs } => client
            .post(format!("{}/admin/blocklist", base))
            .json(&json!({ "ip": ip, "ttl_secs": ttl_secs })),
    };

    let ok = print_response(request.send().await?).await?;
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<bool, Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;

    if !status.is_success() {
        eprintln!("Error: admin API returned status {}", status);
        if !text.is_empty() {
            eprintln!("Response: {}", text);
        }
        return Ok(false);
    }

    if text.is_empty() {
        println!("{}", status);
    } else {
        match serde_json::from_str::<Value>(&text) {
            Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
            Err(_) => println!("{}", text),
        }
    }
    Ok(true)
}
