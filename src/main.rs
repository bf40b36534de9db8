use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use region_resolver::{
    init_tracing, read_query_column, AppConfig, BoundingBox, Region, RegionService,
    ResolutionStats,
};

#[derive(Parser, Debug)]
#[command(name = "region-resolver", about = "Resolve place names to administrative boundaries")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve the first column of a CSV sheet and print one region per row.
    Resolve {
        /// Sheet whose first row holds column headings.
        path: PathBuf,
    },
    /// Print a cached region by its OSM id.
    Region { osm_id: i64 },
    /// Print the effective configuration without secrets.
    Config,
}

#[derive(Serialize)]
struct SheetOutput<'a> {
    heading: &'a str,
    target_rank: Option<i64>,
    bounds: Option<BoundingBox>,
    stats: &'a ResolutionStats,
    records: Vec<RowOutput<'a>>,
}

#[derive(Serialize)]
struct RowOutput<'a> {
    query: &'a str,
    region: Option<&'a Region>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command {
        Command::Resolve { path } => resolve_sheet(&config, path).await,
        Command::Region { osm_id } => {
            let service = RegionService::open(&config)?;
            let Some(region) = service.region_by_id(osm_id)? else {
                bail!("region {osm_id} is not cached");
            };
            println!("{}", serde_json::to_string_pretty(&region)?);
            Ok(())
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config.public_profile())?);
            Ok(())
        }
    }
}

async fn resolve_sheet(config: &AppConfig, path: PathBuf) -> Result<()> {
    let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    let column = read_query_column(&bytes)?;
    let service = RegionService::open(config)?;
    let resolved = service.resolve(&column.values).await?;

    // An all-unresolved sheet still prints its rows, just without bounds.
    let bounds = resolved.bounding_box().ok();
    let records = column
        .values
        .iter()
        .map(|query| RowOutput {
            query,
            region: resolved.region_for(query),
        })
        .collect();

    let output = SheetOutput {
        heading: &column.heading,
        target_rank: resolved.target_rank,
        bounds,
        stats: &resolved.stats,
        records,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
