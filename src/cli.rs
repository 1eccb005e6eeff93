//! Admin client: a thin CLI for the allocator's admin HTTP surface,
//! mirroring the teacher's two-binary convention (server + companion CLI).

use clap::Parser;
use resalloc::Result;

#[derive(Debug, Parser)]
#[command(name = "resalloc-cli", about = "Admin client for a running resalloc-server")]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:60000")]
    admin_url: String,

    #[arg(long)]
    app_id: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║          resalloc-cli - admin client                      ║");
    println!("╚══════════════════════════════════════════════════════════╝");
    println!();

    let cli = Cli::parse();

    let client = reqwest::Client::new();
    let url = format!("{}/reset_metrics", cli.admin_url.trim_end_matches('/'));
    println!("POST {} app_id={}", url, cli.app_id);

    let resp = client.post(&url).query(&[("app_id", cli.app_id)]).send().await?;
    let status = resp.status();
    let body = resp.text().await?;
    println!("{} {}", status, body);

    Ok(())
}
