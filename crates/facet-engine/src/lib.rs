//! Engine orchestration for Facet.
//!
//! Wires the ingestion buffer, quality scorer, model builder, and query
//! engine behind two trait seams: `Connector` (how batches are fetched)
//! and `EventSink` (where notifications go). Records are immutable from
//! the moment a connector hands them over; the engine only ever appends,
//! drains, and rebuilds whole models.

use core::{future::Future, pin::Pin};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use facet_core::{
    CleanedRecord, DataModel, Dimension, FieldMap, ModelName, RawRecord, Schema, Source, SourceId,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, trace, warn};

pub mod buffer;
pub mod model;
pub mod quality;
pub mod query;

pub use buffer::{BufferConfig, IngestionBuffer};
pub use model::{
    clean_data, model_data, MeasureExtractor, ModelRegistry, SalesMeasures, TransformConfig,
};
pub use query::{
    aggregate_measure, CacheConfig, FilterOp, OrderBy, Query, QueryEngine, QueryFilter,
    QueryResult, Row, SortDirection,
};

pub type Result<T> = std::result::Result<T, FacetError>;

/// Errors surfaced by the Facet engine layer.
#[derive(Debug, Error)]
pub enum FacetError {
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("source fetch failed for {source_id}: {message}")]
    SourceFetchFailed { source_id: SourceId, message: String },
    #[error("unknown source: {0}")]
    UnknownSource(SourceId),
    #[error("unknown field in query: {0}")]
    UnknownField(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Connector seam: fetches one batch of records for a registered source.
/// The engine treats the payload maps as opaque and tolerates any shape.
pub trait Connector {
    #[allow(clippy::type_complexity)]
    fn fetch<'a>(
        &'a self,
        source: &'a Source,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FieldMap>>> + Send + 'a>>;
}

/// Notification published by the engine. Fire-and-forget; there is no
/// delivery guarantee.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event", content = "payload")]
pub enum EngineEvent {
    DataCollected(RawRecord),
    DataCleaned(Vec<CleanedRecord>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DataCollected,
    DataCleaned,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::DataCollected(_) => EventKind::DataCollected,
            EngineEvent::DataCleaned(_) => EventKind::DataCleaned,
        }
    }
}

/// Observer seam for engine notifications.
pub trait EventSink {
    fn publish(&self, event: &EngineEvent) -> Result<()>;
}

/// Sink that drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: &EngineEvent) -> Result<()> {
        Ok(())
    }
}

/// Cadence of the periodic drain task.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct DrainConfig {
    #[serde(default = "DrainConfig::default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "DrainConfig::default_batch_size")]
    pub batch_size: usize,
}

impl DrainConfig {
    const fn default_interval_ms() -> u64 {
        5_000
    }

    const fn default_batch_size() -> usize {
        256
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            interval_ms: Self::default_interval_ms(),
            batch_size: Self::default_batch_size(),
        }
    }
}

/// Engine-wide configuration, deserializable from TOML.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub buffer: BufferConfig,
    pub drain: DrainConfig,
    pub cache: CacheConfig,
    pub transform: TransformConfig,
    /// Bound on the pool of cleaned records awaiting model builds; the
    /// oldest cleaned record is dropped on overflow.
    pub cleaned_capacity: CleanedCapacity,
}

/// Newtype so the default survives `#[serde(default)]` on the parent.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct CleanedCapacity(pub usize);

impl Default for CleanedCapacity {
    fn default() -> Self {
        Self(50_000)
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| FacetError::InvalidInput(format!("bad config: {e}")))
    }
}

/// Counters exposed to callers and operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct EngineStatistics {
    pub source_count: usize,
    pub schema_count: usize,
    pub model_count: usize,
    pub buffered_record_count: usize,
    pub cached_query_count: usize,
    pub cleaned_record_count: usize,
    pub dropped_record_count: u64,
}

/// Orchestrator tying together the ingestion, modeling, and query stages.
pub struct FacetEngine<C, E> {
    pub connector: C,
    pub sink: E,
    config: EngineConfig,
    sources: RwLock<HashMap<SourceId, Source>>,
    schemas: RwLock<HashMap<SourceId, Schema>>,
    buffer: IngestionBuffer,
    cleaned: Mutex<VecDeque<CleanedRecord>>,
    registry: ModelRegistry,
    queries: QueryEngine,
}

impl<C, E> FacetEngine<C, E> {
    pub fn new(config: EngineConfig, connector: C, sink: E) -> Self {
        let buffer = IngestionBuffer::new(config.buffer);
        let queries = QueryEngine::new(config.cache);
        Self {
            connector,
            sink,
            config,
            sources: RwLock::new(HashMap::new()),
            schemas: RwLock::new(HashMap::new()),
            buffer,
            cleaned: Mutex::new(VecDeque::new()),
            registry: ModelRegistry::new(),
            queries,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl<C, E> FacetEngine<C, E>
where
    C: Connector,
    E: EventSink,
{
    /// Register a source and its optional schema. Sources are immutable
    /// after registration; re-registering an id is an error.
    pub fn register_source(&self, source: Source, schema: Option<Schema>) -> Result<()> {
        let mut sources = self.sources.write();
        if sources.contains_key(&source.id) {
            return Err(FacetError::InvalidInput(format!(
                "source already registered: {}",
                source.id
            )));
        }
        if let Some(schema) = schema {
            self.schemas.write().insert(source.id.clone(), schema);
        }
        sources.insert(source.id.clone(), source);
        Ok(())
    }

    /// Fetch one batch from the source's connector and append it to the
    /// ingestion buffer. A connector failure skips the batch and leaves
    /// the buffer unchanged. Returns the number of records collected.
    pub async fn ingest(&self, source: &SourceId) -> Result<usize> {
        let registered = self
            .sources
            .read()
            .get(source)
            .cloned()
            .ok_or_else(|| FacetError::UnknownSource(source.clone()))?;

        let batch = match self.connector.fetch(&registered).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(source = %source, error = %e, "connector fetch failed, batch skipped");
                return Err(FacetError::SourceFetchFailed {
                    source_id: source.clone(),
                    message: e.to_string(),
                });
            }
        };

        let now = now_ms();
        let mut collected = 0usize;
        for fields in batch {
            let record = RawRecord::new(source.clone(), now, fields);
            self.buffer.push(record.clone());
            if let Err(e) = self.sink.publish(&EngineEvent::DataCollected(record)) {
                trace!(error = %e, "data_collected notification dropped");
            }
            collected += 1;
        }
        #[cfg(feature = "metrics")]
        {
            facet_metrics::record_buffer_depth(self.buffer.len() as u64);
            facet_metrics::record_buffer_dropped(self.buffer.dropped_total());
        }
        debug!(source = %source, collected, "batch collected");
        Ok(collected)
    }

    /// Drain one batch from the buffer through the cleaning step and into
    /// the cleaned pool. Returns the number of cleaned records produced.
    pub fn drain_once(&self) -> usize {
        #[cfg(feature = "metrics")]
        let start = std::time::Instant::now();

        let batch = self.buffer.drain(self.config.drain.batch_size);
        if batch.is_empty() {
            return 0;
        }
        let drained = batch.len();

        let cleaned = {
            let schemas = self.schemas.read();
            clean_data(batch, |id| schemas.get(id), &self.config.transform, now_ms())
        };

        if let Err(e) = self
            .sink
            .publish(&EngineEvent::DataCleaned(cleaned.clone()))
        {
            trace!(error = %e, "data_cleaned notification dropped");
        }

        let produced = cleaned.len();
        {
            let mut pool = self.cleaned.lock();
            pool.extend(cleaned);
            let capacity = self.config.cleaned_capacity.0.max(1);
            while pool.len() > capacity {
                pool.pop_front();
            }
        }

        #[cfg(feature = "metrics")]
        {
            facet_metrics::record_drain_batch(produced as u64);
            facet_metrics::record_clean_latency(start.elapsed());
        }
        debug!(drained, produced, "drain cycle complete");
        produced
    }

    /// Snapshot of the cleaned pool, oldest first.
    pub fn cleaned_records(&self) -> Vec<CleanedRecord> {
        self.cleaned.lock().iter().cloned().collect()
    }

    /// Build a model over the cleaned pool and register it under `name`,
    /// replacing any previous model with that name.
    pub fn build_model(
        &self,
        name: impl Into<String>,
        dimensions: Vec<Dimension>,
        extractor: &dyn MeasureExtractor,
    ) -> Arc<DataModel> {
        let cleaned = self.cleaned_records();
        let model = model_data(name, &cleaned, dimensions, extractor);
        debug!(model = %model.name(), facts = model.facts().len(), "model registered");
        self.registry.register(model)
    }

    /// Execute a query against a registered model.
    pub fn query(&self, query: &Query) -> Result<QueryResult> {
        self.queries.execute(&self.registry, query)
    }

    pub fn model(&self, name: &ModelName) -> Option<Arc<DataModel>> {
        self.registry.get(name)
    }

    pub fn statistics(&self) -> EngineStatistics {
        EngineStatistics {
            source_count: self.sources.read().len(),
            schema_count: self.schemas.read().len(),
            model_count: self.registry.len(),
            buffered_record_count: self.buffer.len(),
            cached_query_count: self.queries.cached_count(),
            cleaned_record_count: self.cleaned.lock().len(),
            dropped_record_count: self.buffer.dropped_total(),
        }
    }
}

/// Spawn the periodic drain task. The caller owns the handle; aborting it
/// stops the loop.
pub fn spawn_drain_loop<C, E>(engine: Arc<FacetEngine<C, E>>) -> tokio::task::JoinHandle<()>
where
    C: Connector + Send + Sync + 'static,
    E: EventSink + Send + Sync + 'static,
{
    let interval = Duration::from_millis(engine.config.drain.interval_ms.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let produced = engine.drain_once();
            if produced > 0 {
                trace!(produced, "periodic drain tick");
            }
        }
    })
}
