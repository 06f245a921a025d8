//! Assembles the long-lived components behind the HTTP surface.

use std::sync::Arc;

use cpcache_core::{
    registry, CacheLayout, Config, Downloader, MetadataDb, MirrorSelector, RegistryHandle,
};

/// Shared handles to every long-lived component, cloned into each
/// connection task.
#[derive(Clone)]
pub struct App {
    /// Validated daemon configuration.
    pub config: Arc<Config>,
    /// Cache directory layout.
    pub layout: CacheLayout,
    /// Persistent metadata (content lengths, mirror scores).
    pub db: MetadataDb,
    /// The download registry actor.
    pub registry: RegistryHandle,
    /// Ordered mirror list provider.
    pub mirrors: MirrorSelector,
    /// Mirror-walking download starter.
    pub downloader: Downloader,
}

impl App {
    /// Builds all components for `config`: cache directories, metadata
    /// database, registry actor, mirror selector (including its
    /// re-scoring task in `auto` mode) and the downloader.
    ///
    /// # Errors
    /// Any failure preparing directories, opening the database or
    /// building HTTP clients.
    pub async fn bootstrap(config: Config) -> cpcache_core::Result<Self> {
        config.validate()?;

        let layout = CacheLayout::new(&config.cache_directory);
        layout.ensure_directories().await?;

        let db = MetadataDb::open(&layout.metadata_db_path()).await?;
        let registry = registry::spawn_registry();
        let mirrors = MirrorSelector::start(&config, db.clone()).await?;
        let downloader = Downloader::new(registry.clone())?;

        Ok(Self {
            config: Arc::new(config),
            layout,
            db,
            registry,
            mirrors,
            downloader,
        })
    }
}
