use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Remap field-survey workbooks and GeoPackages into a monitoring database",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Load every catalogued layer of a survey file for one site visit
    Load(LoadArgs),
    /// List the target tables that have no rows for a site visit yet
    Pending(PendingArgs),
    /// Summarize a mapping catalog: layers, target tables and field counts
    Catalog(CatalogArgs),
}

#[derive(Debug, Args)]
pub struct VisitArgs {
    /// Site identifier (e.g. RMN_01)
    #[arg(short = 'r', long = "site", value_parser = parse_key_part)]
    pub site: String,
    /// Grant identifier the visit was funded under
    #[arg(short = 'g', long = "grant", value_parser = parse_key_part)]
    pub grant: String,
    /// Visit label (e.g. 2024_spring)
    #[arg(short = 'v', long = "visit", value_parser = parse_key_part)]
    pub visit: String,
}

#[derive(Debug, Args)]
pub struct CatalogSourceArgs {
    /// Mapping catalog (CSV, TSV or workbook)
    #[arg(short = 'c', long = "catalog")]
    pub catalog: PathBuf,
    /// Character encoding of a CSV catalog (defaults to utf-8)
    #[arg(long = "catalog-encoding")]
    pub catalog_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct StoreArgs {
    /// Target SQLite database
    #[arg(short = 'd', long = "database")]
    pub database: PathBuf,
    /// YAML run configuration (layer registry, key columns, value policies)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Schema holding the target tables; overrides the configuration
    #[arg(long)]
    pub namespace: Option<String>,
    /// Database file attached under --namespace
    #[arg(long = "namespace-path")]
    pub namespace_path: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct LoadArgs {
    #[command(flatten)]
    pub visit: VisitArgs,
    #[command(flatten)]
    pub catalog: CatalogSourceArgs,
    #[command(flatten)]
    pub store: StoreArgs,
    /// Survey workbook (.xlsx, .xls, .ods) or GeoPackage (.gpkg)
    pub path: PathBuf,
    /// Write <layer>_before.csv and <layer>_after.csv snapshots here
    #[arg(long = "export-dir")]
    pub export_dir: Option<PathBuf>,
    /// Read and normalize every layer without writing to the database
    #[arg(long)]
    pub dry_run: bool,
    /// Print the run report as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct PendingArgs {
    #[command(flatten)]
    pub visit: VisitArgs,
    #[command(flatten)]
    pub catalog: CatalogSourceArgs,
    #[command(flatten)]
    pub store: StoreArgs,
}

#[derive(Debug, Args)]
pub struct CatalogArgs {
    #[command(flatten)]
    pub catalog: CatalogSourceArgs,
}

pub fn parse_key_part(value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err("Key values cannot be empty".to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_load_invocation() {
        let cli = Cli::try_parse_from([
            "rmn-loader", "load", "-r", " RMN_01 ", "-g", "G7", "-v", "V1", "-c", "map.csv", "-d",
            "rmn.sqlite", "--dry-run", "survey.xlsx",
        ])
        .unwrap();
        match cli.command {
            Commands::Load(args) => {
                assert_eq!(args.visit.site, "RMN_01");
                assert!(args.dry_run);
                assert_eq!(args.path, PathBuf::from("survey.xlsx"));
                assert_eq!(args.store.namespace, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn blank_key_part_is_rejected() {
        assert!(parse_key_part("   ").is_err());
        assert!(
            Cli::try_parse_from(["rmn-loader", "pending", "-r", "", "-g", "G", "-v", "V", "-c", "m", "-d", "db"])
                .is_err()
        );
    }
}
