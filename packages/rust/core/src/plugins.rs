//! Plugin graph loading.
//!
//! A [`PipelineConfig`] names plugins by `type`. [`PluginFactory`] maps each
//! type to a constructor returning a [`Plugin`], a closed variant that fixes
//! the plugin's role once at load time. [`load_pipeline`] builds every
//! entry, injects named `provider` / `storage` references, and reports the
//! references it could not resolve as [`LoadWarning`]s.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use newsloom_shared::{
    AiProvider, ContentStore, Enricher, Exporter, Generator, GeneratorContext, GeneratorResult,
    HistoricalSource, LegacyGenerator, NewsloomError, PipelineConfig, PipelineSettings,
    PluginSpec, Result, Source,
};

use crate::aggregator::{AggregationEngine, SourceHandle};

// ---------------------------------------------------------------------------
// Plugin variants
// ---------------------------------------------------------------------------

/// A constructed plugin, classified by role.
#[derive(Clone)]
pub enum Plugin {
    Source(Arc<dyn Source>),
    HistoricalSource(Arc<dyn HistoricalSource>),
    Enricher(Arc<dyn Enricher>),
    Storage(Arc<dyn ContentStore>),
    Generator(Arc<dyn Generator>),
    LegacyGenerator(Arc<dyn LegacyGenerator>),
    Exporter(Arc<dyn Exporter>),
    Provider(Arc<dyn AiProvider>),
}

impl Plugin {
    pub fn role(&self) -> &'static str {
        match self {
            Self::Source(_) => "source",
            Self::HistoricalSource(_) => "historical source",
            Self::Enricher(_) => "enricher",
            Self::Storage(_) => "storage",
            Self::Generator(_) => "generator",
            Self::LegacyGenerator(_) => "legacy generator",
            Self::Exporter(_) => "exporter",
            Self::Provider(_) => "provider",
        }
    }
}

/// A generator in either calling convention.
#[derive(Clone)]
pub enum GeneratorHandle {
    Modern(Arc<dyn Generator>),
    Legacy(Arc<dyn LegacyGenerator>),
}

impl GeneratorHandle {
    pub fn name(&self) -> &str {
        match self {
            Self::Modern(g) => g.name(),
            Self::Legacy(g) => g.name(),
        }
    }
}

/// Constructor input: the entry's name and params, plus resolved references.
#[derive(Clone)]
pub struct PluginArgs {
    pub name: String,
    pub params: toml::Table,
    pub provider: Option<Arc<dyn AiProvider>>,
    pub storage: Option<Arc<dyn ContentStore>>,
}

impl PluginArgs {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: toml::Table::new(),
            provider: None,
            storage: None,
        }
    }

    /// Deserialize the params table into a typed struct.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        toml::Value::Table(self.params.clone())
            .try_into()
            .map_err(|e| NewsloomError::config(format!("invalid params for '{}': {e}", self.name)))
    }

    /// The injected storage, or a config error naming this plugin.
    pub fn require_storage(&self) -> Result<Arc<dyn ContentStore>> {
        self.storage.clone().ok_or_else(|| {
            NewsloomError::config(format!("plugin '{}' needs a storage reference", self.name))
        })
    }
}

pub type PluginConstructor = Arc<dyn Fn(PluginArgs) -> Result<Plugin> + Send + Sync>;

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Registry of plugin constructors keyed by `type` name.
#[derive(Clone, Default)]
pub struct PluginFactory {
    constructors: HashMap<String, PluginConstructor>,
}

impl PluginFactory {
    /// An empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory with the bundled plugin types registered.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        crate::builtin::register_builtins(&mut factory);
        factory
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(PluginArgs) -> Result<Plugin> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Arc::new(constructor));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Registered type names, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Construct the plugin described by `spec`.
    pub fn build(&self, spec: &PluginSpec, args: PluginArgs) -> Result<Plugin> {
        let constructor =
            self.constructors
                .get(&spec.kind)
                .ok_or_else(|| NewsloomError::UnknownPluginType {
                    kind: spec.kind.clone(),
                    name: spec.name.clone(),
                })?;
        constructor(args)
    }
}

// ---------------------------------------------------------------------------
// Loaded pipeline
// ---------------------------------------------------------------------------

/// A non-fatal problem found while loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadWarning {
    UnresolvedProvider { plugin: String, provider: String },
    UnresolvedStorage { plugin: String, storage: String },
    /// `depends_on` on a legacy generator has no effect.
    IgnoredDependsOn { plugin: String },
}

impl fmt::Display for LoadWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedProvider { plugin, provider } => {
                write!(f, "plugin '{plugin}' references unknown provider '{provider}'")
            }
            Self::UnresolvedStorage { plugin, storage } => {
                write!(f, "plugin '{plugin}' references unknown storage '{storage}'")
            }
            Self::IgnoredDependsOn { plugin } => {
                write!(f, "depends_on is ignored for legacy generator '{plugin}'")
            }
        }
    }
}

/// A loaded plugin with its own tick interval, if configured.
#[derive(Clone)]
pub struct Loaded<T> {
    pub name: String,
    pub interval_secs: Option<u64>,
    pub plugin: T,
}

/// The resolved plugin graph for one configuration.
#[derive(Clone)]
pub struct LoadedPipeline {
    pub name: String,
    pub settings: PipelineSettings,
    pub storages: Vec<Loaded<Arc<dyn ContentStore>>>,
    pub providers: Vec<Loaded<Arc<dyn AiProvider>>>,
    pub sources: Vec<Loaded<SourceHandle>>,
    pub enrichers: Vec<Loaded<Arc<dyn Enricher>>>,
    pub generators: Vec<Loaded<GeneratorHandle>>,
    pub exporters: Vec<Loaded<Arc<dyn Exporter>>>,
    pub warnings: Vec<LoadWarning>,
}

impl LoadedPipeline {
    /// The store generators and the engine persist into: the last one
    /// configured.
    pub fn primary_storage(&self) -> Option<Arc<dyn ContentStore>> {
        self.storages.last().map(|s| s.plugin.clone())
    }

    /// Modern generators, in configuration order.
    pub fn modern_generators(&self) -> Vec<Arc<dyn Generator>> {
        self.generators
            .iter()
            .filter_map(|g| match &g.plugin {
                GeneratorHandle::Modern(g) => Some(g.clone()),
                GeneratorHandle::Legacy(_) => None,
            })
            .collect()
    }

    pub fn legacy_generators(&self) -> Vec<Arc<dyn LegacyGenerator>> {
        self.generators
            .iter()
            .filter_map(|g| match &g.plugin {
                GeneratorHandle::Legacy(g) => Some(g.clone()),
                GeneratorHandle::Modern(_) => None,
            })
            .collect()
    }

    pub fn exporter_plugins(&self) -> Vec<Arc<dyn Exporter>> {
        self.exporters.iter().map(|e| e.plugin.clone()).collect()
    }

    /// Build an engine with every source, enricher and storage registered
    /// in configuration order.
    pub fn build_engine(&self) -> AggregationEngine {
        let mut engine = AggregationEngine::new();
        for storage in &self.storages {
            engine.register_storage(storage.plugin.clone());
        }
        for source in &self.sources {
            engine.register_source(source.plugin.clone());
        }
        for enricher in &self.enrichers {
            engine.register_enricher(enricher.plugin.clone());
        }
        engine
    }

    /// Initialize every store, in order.
    pub async fn init_storages(&self) -> Result<()> {
        for storage in &self.storages {
            storage.plugin.init().await.map_err(|e| {
                NewsloomError::Storage(format!("failed to init storage '{}': {e}", storage.name))
            })?;
        }
        Ok(())
    }

    /// Close every store. Failures are logged.
    pub async fn close_storages(&self) {
        for storage in &self.storages {
            if let Err(e) = storage.plugin.close().await {
                warn!(storage = %storage.name, error = %e, "failed to close storage");
            }
        }
    }
}

/// Overrides a generator's own `depends_on` with the configured one.
struct ConfiguredGenerator {
    inner: Arc<dyn Generator>,
    depends_on: String,
}

#[async_trait]
impl Generator for ConfiguredGenerator {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn depends_on(&self) -> Option<&str> {
        Some(&self.depends_on)
    }

    async fn generate(&self, date: NaiveDate, ctx: GeneratorContext) -> Result<GeneratorResult> {
        self.inner.generate(date, ctx).await
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Named plugins already built, used to resolve references.
struct Resolver<'a> {
    providers: &'a [Loaded<Arc<dyn AiProvider>>],
    storages: &'a [Loaded<Arc<dyn ContentStore>>],
}

impl Resolver<'_> {
    fn args(&self, spec: &PluginSpec, warnings: &mut Vec<LoadWarning>) -> PluginArgs {
        let mut args = PluginArgs {
            name: spec.name.clone(),
            params: spec.params.clone(),
            provider: None,
            storage: None,
        };

        if let Some(wanted) = spec.param_str("provider") {
            match self.providers.iter().find(|p| p.name == wanted) {
                Some(p) => args.provider = Some(p.plugin.clone()),
                None => {
                    warn!(plugin = %spec.name, provider = wanted, "unresolved provider reference");
                    warnings.push(LoadWarning::UnresolvedProvider {
                        plugin: spec.name.clone(),
                        provider: wanted.to_string(),
                    });
                }
            }
        }

        if let Some(wanted) = spec.param_str("storage") {
            match self.storages.iter().find(|s| s.name == wanted) {
                Some(s) => args.storage = Some(s.plugin.clone()),
                None => {
                    warn!(plugin = %spec.name, storage = wanted, "unresolved storage reference");
                    warnings.push(LoadWarning::UnresolvedStorage {
                        plugin: spec.name.clone(),
                        storage: wanted.to_string(),
                    });
                }
            }
        }

        args
    }
}

fn wrong_role(spec: &PluginSpec, plugin: &Plugin, category: &str) -> NewsloomError {
    NewsloomError::config(format!(
        "plugin '{}' of type '{}' is a {}, not allowed in [[{category}]]",
        spec.name,
        spec.kind,
        plugin.role()
    ))
}

fn loaded<T>(spec: &PluginSpec, plugin: T) -> Loaded<T> {
    Loaded {
        name: spec.name.clone(),
        interval_secs: spec.interval_secs,
        plugin,
    }
}

/// Build every plugin in `config`.
///
/// Storages and providers are built first so the other categories can
/// reference them. An unknown `type` or a plugin in the wrong category is
/// fatal; unresolved references are collected as warnings.
#[instrument(skip_all, fields(config = %config.name))]
pub fn load_pipeline(config: &PipelineConfig, factory: &PluginFactory) -> Result<LoadedPipeline> {
    let mut warnings = Vec::new();

    // --- Storage and providers (no references) ---
    let mut storages = Vec::new();
    for spec in &config.storage {
        match factory.build(spec, PluginArgs {
            name: spec.name.clone(),
            params: spec.params.clone(),
            provider: None,
            storage: None,
        })? {
            Plugin::Storage(s) => storages.push(loaded(spec, s)),
            other => return Err(wrong_role(spec, &other, "storage")),
        }
    }

    let mut providers = Vec::new();
    for spec in &config.providers {
        match factory.build(spec, PluginArgs {
            name: spec.name.clone(),
            params: spec.params.clone(),
            provider: None,
            storage: None,
        })? {
            Plugin::Provider(p) => providers.push(loaded(spec, p)),
            other => return Err(wrong_role(spec, &other, "providers")),
        }
    }

    let resolver = Resolver {
        providers: &providers,
        storages: &storages,
    };

    // --- Sources, enrichers, generators, exporters ---
    let mut sources = Vec::new();
    for spec in &config.sources {
        let args = resolver.args(spec, &mut warnings);
        match factory.build(spec, args)? {
            Plugin::Source(s) => sources.push(loaded(spec, SourceHandle::Live(s))),
            Plugin::HistoricalSource(s) => {
                sources.push(loaded(spec, SourceHandle::Historical(s)))
            }
            other => return Err(wrong_role(spec, &other, "sources")),
        }
    }

    let mut enrichers = Vec::new();
    for spec in &config.enrichers {
        let args = resolver.args(spec, &mut warnings);
        match factory.build(spec, args)? {
            Plugin::Enricher(e) => enrichers.push(loaded(spec, e)),
            other => return Err(wrong_role(spec, &other, "enrichers")),
        }
    }

    let mut generators = Vec::new();
    for spec in &config.generators {
        let args = resolver.args(spec, &mut warnings);
        let handle = match factory.build(spec, args)? {
            Plugin::Generator(g) => match &spec.depends_on {
                Some(dep) => GeneratorHandle::Modern(Arc::new(ConfiguredGenerator {
                    inner: g,
                    depends_on: dep.clone(),
                })),
                None => GeneratorHandle::Modern(g),
            },
            Plugin::LegacyGenerator(g) => {
                if spec.depends_on.is_some() {
                    warnings.push(LoadWarning::IgnoredDependsOn {
                        plugin: spec.name.clone(),
                    });
                }
                GeneratorHandle::Legacy(g)
            }
            other => return Err(wrong_role(spec, &other, "generators")),
        };
        generators.push(loaded(spec, handle));
    }

    let mut exporters = Vec::new();
    for spec in &config.exporters {
        let args = resolver.args(spec, &mut warnings);
        match factory.build(spec, args)? {
            Plugin::Exporter(e) => exporters.push(loaded(spec, e)),
            other => return Err(wrong_role(spec, &other, "exporters")),
        }
    }

    debug!(
        storages = storages.len(),
        sources = sources.len(),
        enrichers = enrichers.len(),
        generators = generators.len(),
        exporters = exporters.len(),
        "built plugins"
    );
    if !warnings.is_empty() {
        info!(warnings = warnings.len(), "pipeline loaded with warnings");
    }

    Ok(LoadedPipeline {
        name: config.name.clone(),
        settings: config.settings.clone(),
        storages,
        providers,
        sources,
        enrichers,
        generators,
        exporters,
        warnings,
    })
}
