use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use super::document::BundleCatalog;
use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(PathBuf),
    Inline(String),
}

impl ConfigSource {
    fn read(&self) -> Result<String, ConfigError> {
        match self {
            ConfigSource::File(path) => {
                std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })
            }
            ConfigSource::Inline(text) => Ok(text.clone()),
        }
    }
}

/// Owns the bundle catalog. The first successful `load` is memoized;
/// `reload` swaps in a freshly parsed catalog. Runs that already hold an
/// `Arc` keep their snapshot.
pub struct BundleRegistry {
    source: ConfigSource,
    cache: RwLock<Option<Arc<BundleCatalog>>>,
}

impl BundleRegistry {
    pub fn new(source: ConfigSource) -> Self {
        Self {
            source,
            cache: RwLock::new(None),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::new(ConfigSource::File(path.into()))
    }

    pub fn load(&self) -> Result<Arc<BundleCatalog>, ConfigError> {
        if let Some(catalog) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Ok(Arc::clone(catalog));
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(catalog) = cache.as_ref() {
            return Ok(Arc::clone(catalog));
        }
        let catalog = self.parse()?;
        *cache = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    /// Re-reads the source. On failure the previous catalog stays cached.
    pub fn reload(&self) -> Result<Arc<BundleCatalog>, ConfigError> {
        let catalog = self.parse()?;
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    fn parse(&self) -> Result<Arc<BundleCatalog>, ConfigError> {
        let text = self.source.read()?;
        let catalog = BundleCatalog::from_json(&text)?;
        tracing::info!(
            bundles = catalog.bundles.len(),
            api_bundles = catalog.api_bundles.len(),
            apis = catalog.apis.len(),
            "Bundle config loaded"
        );
        Ok(Arc::new(catalog))
    }
}
