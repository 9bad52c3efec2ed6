pub mod catalog;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod geometry;
pub mod guard;
pub mod io_utils;
pub mod loader;
pub mod normalize;
pub mod pipeline;
pub mod shape;
pub mod source;
pub mod store;
pub mod table;

use std::{env, sync::OnceLock};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{LevelFilter, debug, info};

use crate::{
    catalog::MappingCatalog,
    cli::{CatalogSourceArgs, Cli, Commands, StoreArgs, VisitArgs},
    config::PipelineConfig,
    data::VisitKey,
    pipeline::{Pipeline, RunOptions},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("rmn_loader", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Load(args) => handle_load(&args),
        Commands::Pending(args) => handle_pending(&args),
        Commands::Catalog(args) => handle_catalog(&args),
    }
}

fn handle_load(args: &cli::LoadArgs) -> Result<()> {
    if !args.path.exists() {
        bail!("The file at '{}' does not exist", args.path.display());
    }
    let key = visit_key(&args.visit);
    let config = load_config(&args.store)?;
    let options = RunOptions {
        dry_run: args.dry_run,
        export_dir: args.export_dir.clone(),
    };
    let pipeline = open_pipeline(config, &args.catalog)?.with_options(options);
    let report = pipeline
        .run(&key, &args.path)
        .with_context(|| format!("Loading {:?}", args.path))?;
    if args.json {
        let json = serde_json::to_string_pretty(&report).context("Serializing run report")?;
        println!("{json}");
    } else {
        print!("{}", report.render());
    }
    info!(
        "Run finished: {} row(s) loaded, {} layer(s) failed",
        report.rows_loaded(),
        report.failures().count()
    );
    Ok(())
}

fn handle_pending(args: &cli::PendingArgs) -> Result<()> {
    let key = visit_key(&args.visit);
    let config = load_config(&args.store)?;
    let pipeline = open_pipeline(config, &args.catalog)?;
    let pending = pipeline
        .pending_tables(&key)
        .with_context(|| format!("Checking pending tables for {key}"))?;
    for table in &pending {
        println!("{table}");
    }
    info!(
        "{} of {} table(s) pending for {}",
        pending.len(),
        pipeline.catalog().all_target_tables().len(),
        key
    );
    Ok(())
}

fn handle_catalog(args: &cli::CatalogArgs) -> Result<()> {
    let catalog = load_catalog(&args.catalog)?;
    let headers = ["layer", "table", "fields"].map(str::to_string);
    let rows = catalog
        .layers()
        .iter()
        .map(|layer| {
            let plan = catalog.layer_plan(layer, Default::default())?;
            Ok(vec![
                layer.clone(),
                plan.table.clone(),
                plan.target_fields().len().to_string(),
            ])
        })
        .collect::<Result<Vec<_>, error::PipelineError>>()?;
    table::print_table(&headers, &rows);
    Ok(())
}

fn visit_key(args: &VisitArgs) -> VisitKey {
    VisitKey::new(&args.site, &args.grant, &args.visit)
}

fn load_config(args: &StoreArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Loading configuration from {path:?}"))?,
        None => PipelineConfig::default(),
    };
    config.store.path = Some(args.database.clone());
    if let Some(namespace) = &args.namespace {
        config.store.namespace = namespace.clone();
    }
    if let Some(path) = &args.namespace_path {
        config.store.namespace_path = Some(path.clone());
    }
    debug!("Effective configuration:\n{}", config.to_yaml_string()?);
    Ok(config)
}

fn load_catalog(args: &CatalogSourceArgs) -> Result<MappingCatalog> {
    let encoding = io_utils::resolve_encoding(args.catalog_encoding.as_deref())?;
    MappingCatalog::load(&args.catalog, encoding)
        .with_context(|| format!("Loading mapping catalog {:?}", args.catalog))
}

fn open_pipeline(config: PipelineConfig, args: &CatalogSourceArgs) -> Result<Pipeline> {
    let encoding = io_utils::resolve_encoding(args.catalog_encoding.as_deref())?;
    Pipeline::new(config, &args.catalog, encoding)
        .with_context(|| format!("Loading mapping catalog {:?}", args.catalog))
}
