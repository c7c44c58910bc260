use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use mig_core::ExternalCatalog;
use mig_core::GeometryCatalog;
use tracing::info;

#[derive(Parser, Debug, Clone)]
pub struct CatalogArgs {
    #[arg(
        long,
        env = "KNOWN_MIG_GEOMETRIES_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML file of allowed MIG geometries merged over the built-in ones"
    )]
    pub known_geometries_file: Option<PathBuf>,
}

/// The built-in catalog, overridden per model by `known_geometries_file` if given.
pub fn load_catalog(known_geometries_file: Option<&Path>) -> Result<GeometryCatalog> {
    let mut catalog = GeometryCatalog::builtin();
    if let Some(path) = known_geometries_file {
        let document = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let external = ExternalCatalog::from_yaml_str(&document)
            .with_context(|| format!("failed to decode {}", path.display()))?;
        catalog
            .merge(&external)
            .with_context(|| format!("invalid geometries in {}", path.display()))?;
        info!(file = %path.display(), "loaded known MIG geometries");
    }
    catalog.validate().context("invalid MIG geometry catalog")?;
    Ok(catalog)
}
