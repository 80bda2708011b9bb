//! One-shot scrape from the command line.

use std::sync::Arc;

use anyhow::Result;
use banner_crawler::{ChromeLauncher, ConnectionController, GeoTable, ScrapeConfig};
use clap::Parser;
use dotenv::dotenv;

#[derive(Parser, Debug)]
#[command(
    name = "scrape_site",
    about = "Scrape the home and promotions banners of one site",
    version
)]
struct Args {
    /// Site to scrape; `https://` is assumed when no scheme is given
    url: String,

    /// Country code of the geo profile (US, UK, CA, AU, DE, FR, JP, BR, IN, SG)
    #[arg(default_value = "US")]
    country: String,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Never fall back to the configured proxy
    #[arg(long)]
    skip_proxy: bool,
}

impl Args {
    fn config(&self, geo_table: &GeoTable) -> ScrapeConfig {
        ScrapeConfig::new(&self.url, &self.country, geo_table)
            .with_headless(!self.headed)
            .with_skip_proxy(self.skip_proxy)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = args.config(&GeoTable::default());

    println!("🕵️ Scraping {} as {} ...", config.url, config.geo.name);
    let report = ConnectionController::new(Arc::new(ChromeLauncher::new()))
        .run(&config)
        .await?;

    println!(
        "✅ {} banners via {:?} ({:?})",
        report.result.total(),
        report.mode,
        report.outcome
    );
    println!("{}", serde_json::to_string_pretty(&report.result)?);
    Ok(())
}
