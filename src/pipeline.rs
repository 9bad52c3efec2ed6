//! Drives one run: catalog, visit key, duplicate guard, then every layer in
//! turn.
//!
//! A run moves through the [`Stage`]s in order. Anything that goes wrong
//! before [`Stage::PerLayer`] aborts the run; inside it, each layer succeeds
//! or fails on its own and the outcome lands in the [`RunReport`].

use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
};

use encoding_rs::Encoding;
use log::{error, info, warn};
use serde::Serialize;

use crate::{
    catalog::MappingCatalog,
    config::PipelineConfig,
    data::VisitKey,
    error::{ErrorClass, PipelineError, Result},
    export::DiagnosticExporter,
    guard,
    loader::Loader,
    normalize::Normalizer,
    source::{LayerSource, open_source},
    store::{self, LedgerStamp, Store},
    table,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    CatalogLoaded,
    KeyResolved,
    GuardEvaluated,
    PerLayer,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::CatalogLoaded => "catalog-loaded",
            Stage::KeyResolved => "key-resolved",
            Stage::GuardEvaluated => "guard-evaluated",
            Stage::PerLayer => "per-layer",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

fn enter(stage: Stage) {
    info!("Stage: {stage}");
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Read and normalize every layer but write nothing.
    pub dry_run: bool,
    pub export_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotInSource,
    AlreadyLoaded,
    NoRecords,
    DryRun { rows: usize },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotInSource => f.write_str("layer not in source"),
            SkipReason::AlreadyLoaded => f.write_str("visit already loaded"),
            SkipReason::NoRecords => f.write_str("no records after normalization"),
            SkipReason::DryRun { rows } => write!(f, "dry run, {rows} row(s) ready"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LayerOutcome {
    Loaded { rows: usize },
    Skipped { reason: SkipReason },
    Failed { class: ErrorClass, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerReport {
    pub layer: String,
    /// Target table, when the catalog resolves one.
    pub table: Option<String>,
    pub outcome: LayerOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub key: VisitKey,
    pub source: PathBuf,
    pub dry_run: bool,
    pub push_set: BTreeSet<String>,
    pub layers: Vec<LayerReport>,
}

impl RunReport {
    pub fn rows_loaded(&self) -> usize {
        self.layers
            .iter()
            .map(|report| match report.outcome {
                LayerOutcome::Loaded { rows } => rows,
                _ => 0,
            })
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &LayerReport> {
        self.layers
            .iter()
            .filter(|report| matches!(report.outcome, LayerOutcome::Failed { .. }))
    }

    pub fn outcome_of(&self, layer: &str) -> Option<&LayerOutcome> {
        self.layers
            .iter()
            .find(|report| report.layer == layer)
            .map(|report| &report.outcome)
    }

    /// Plain-text table, one line per catalog layer.
    pub fn render(&self) -> String {
        let headers = ["layer", "table", "status", "detail"].map(str::to_string);
        let rows = self
            .layers
            .iter()
            .map(|report| {
                let (status, detail) = match &report.outcome {
                    LayerOutcome::Loaded { rows } => ("loaded", format!("{rows} row(s)")),
                    LayerOutcome::Skipped { reason } => ("skipped", reason.to_string()),
                    LayerOutcome::Failed { class, error } => ("failed", format!("{class}: {error}")),
                };
                vec![
                    report.layer.clone(),
                    report.table.clone().unwrap_or_else(|| "-".to_string()),
                    status.to_string(),
                    detail,
                ]
            })
            .collect::<Vec<_>>();
        let mut rendered = table::render_table(&headers, &rows);
        rendered.push_str(&format!(
            "\n{} row(s) loaded for {}; {} layer(s) failed\n",
            self.rows_loaded(),
            self.key,
            self.failures().count()
        ));
        rendered
    }
}

/// Run-scoped state shared by every layer.
struct LayerContext<'r> {
    key: &'r VisitKey,
    push_set: &'r BTreeSet<String>,
    ledger: Option<&'r LedgerStamp>,
    exporter: Option<&'r DiagnosticExporter>,
}

pub struct Pipeline {
    config: PipelineConfig,
    catalog: MappingCatalog,
    options: RunOptions,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, catalog_path: &Path, encoding: &'static Encoding) -> Result<Self> {
        enter(Stage::Init);
        let catalog = MappingCatalog::load(catalog_path, encoding)?;
        info!(
            "Loaded catalog {:?}: {} layer(s), {} target table(s)",
            catalog_path,
            catalog.layers().len(),
            catalog.all_target_tables().len()
        );
        Ok(Pipeline::with_catalog(config, catalog))
    }

    pub fn with_catalog(config: PipelineConfig, catalog: MappingCatalog) -> Self {
        enter(Stage::CatalogLoaded);
        Pipeline {
            config,
            catalog,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn catalog(&self) -> &MappingCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Tables that would accept rows for `key` right now.
    pub fn pending_tables(&self, key: &VisitKey) -> Result<BTreeSet<String>> {
        let store = Store::open(&self.config.store)?;
        let pending = self.push_set(&store, key);
        store.close()?;
        Ok(pending)
    }

    fn push_set(&self, store: &Store, key: &VisitKey) -> BTreeSet<String> {
        guard::tables_pending(
            store.connection(),
            store.namespace(),
            &self.config.key_columns,
            &self.catalog.all_target_tables(),
            key,
        )
    }

    pub fn run(&self, key: &VisitKey, source_path: &Path) -> Result<RunReport> {
        if !source_path.exists() {
            return Err(PipelineError::not_found(format!(
                "The file at {source_path:?} does not exist"
            )));
        }
        let mut source = open_source(source_path)?;
        info!("Processing {:?} for {}", source_path, key);
        enter(Stage::KeyResolved);

        let mut store = Store::open(&self.config.store)?;
        if let Some(reference) = &self.config.grant_reference {
            guard::require_grant(store.connection(), store.namespace(), reference, &key.grant_id)?;
        }
        let ledger = if self.config.store.ledger && !self.options.dry_run {
            store.ensure_ledger()?;
            let source_sha256 = store::file_sha256(source_path).map_err(|err| {
                PipelineError::not_found(format!("Reading {source_path:?}: {err}"))
            })?;
            Some(LedgerStamp {
                key: key.clone(),
                source_sha256,
                geometry_srid: self.config.store.geometry_srid,
            })
        } else {
            None
        };
        let push_set = self.push_set(&store, key);
        info!(
            "{} of {} table(s) pending: {:?}",
            push_set.len(),
            self.catalog.all_target_tables().len(),
            push_set
        );
        enter(Stage::GuardEvaluated);

        let exporter = self.options.export_dir.as_ref().map(DiagnosticExporter::new);
        let context = LayerContext {
            key,
            push_set: &push_set,
            ledger: ledger.as_ref(),
            exporter: exporter.as_ref(),
        };
        enter(Stage::PerLayer);
        let mut layers = Vec::with_capacity(self.catalog.layers().len());
        for layer in self.catalog.layers() {
            let table = self.catalog.target_table_of(layer).ok().map(str::to_string);
            let outcome = if !source.has_layer(layer) {
                info!("Layer '{}' not in source, skipping", layer);
                LayerOutcome::Skipped {
                    reason: SkipReason::NotInSource,
                }
            } else {
                info!("Processing layer '{}'", layer);
                match self.process_layer(source.as_mut(), &mut store, &context, layer) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        error!("Layer '{}' failed ({}): {}", layer, err.class(), err);
                        LayerOutcome::Failed {
                            class: err.class(),
                            error: err.to_string(),
                        }
                    }
                }
            };
            layers.push(LayerReport {
                layer: layer.clone(),
                table,
                outcome,
            });
        }

        if let Err(err) = store.close() {
            warn!("Closing database: {}", err);
        }
        enter(Stage::Done);
        Ok(RunReport {
            key: key.clone(),
            source: source_path.to_path_buf(),
            dry_run: self.options.dry_run,
            push_set,
            layers,
        })
    }

    fn process_layer(
        &self,
        source: &mut dyn LayerSource,
        store: &mut Store,
        context: &LayerContext<'_>,
        layer: &str,
    ) -> Result<LayerOutcome> {
        let plan = self.catalog.layer_plan(layer, self.config.descriptor(layer))?;
        let raw = source.read_layer(layer, &plan.descriptor)?;
        if let Some(exporter) = context.exporter
            && let Err(err) = exporter.write_raw(&raw)
        {
            warn!("Exporting '{}' before normalization: {:#}", layer, err);
        }

        let normalized = Normalizer::new(&plan, context.key, &self.config).normalize(raw)?;
        if let Some(exporter) = context.exporter
            && let Err(err) = exporter.write_normalized(&normalized)
        {
            warn!("Exporting '{}' after normalization: {:#}", layer, err);
        }

        let reason = if normalized.is_empty() {
            Some(SkipReason::NoRecords)
        } else if !context.push_set.contains(&plan.table) {
            Some(SkipReason::AlreadyLoaded)
        } else if self.options.dry_run {
            Some(SkipReason::DryRun {
                rows: normalized.len(),
            })
        } else {
            None
        };
        if let Some(reason) = reason {
            info!("Layer '{}' skipped: {}", layer, reason);
            return Ok(LayerOutcome::Skipped { reason });
        }

        let namespace = store.namespace().to_string();
        let mut loader = Loader::new(&namespace, self.config.not_applicable.storage);
        if let Some(stamp) = context.ledger {
            loader = loader.with_ledger(stamp);
        }
        let rows = loader.load(store.connection_mut(), normalized)?;
        Ok(LayerOutcome::Loaded { rows })
    }
}
