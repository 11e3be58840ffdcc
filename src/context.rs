use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::imaging_tool::{ImagingTool, create_tool};
use crate::core::models::{Catalog, CatalogError};
use crate::core::registry::SessionRegistry;

/// State shared by every connection the helper serves.
#[derive(Clone)]
pub struct HelperContext {
    pub config: Arc<AppConfig>,
    /// The helper's own catalog. Apply requests are checked against it.
    pub catalog: Arc<Catalog>,
    pub registry: SessionRegistry,
    pub tool: Arc<dyn ImagingTool>,
}

impl HelperContext {
    /// Load the catalog named by `config` and pick the configured tool.
    pub fn new(config: AppConfig) -> Result<Self, CatalogError> {
        let catalog = Catalog::load(&config.catalog_path)?;
        let tool = create_tool(config.imaging_tool);
        Ok(Self::with_tool(config, catalog, tool))
    }

    pub fn with_tool(config: AppConfig, catalog: Catalog, tool: Arc<dyn ImagingTool>) -> Self {
        Self {
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            registry: SessionRegistry::new(),
            tool,
        }
    }
}
