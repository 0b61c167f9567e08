//! End-to-end flow over concrete components: scripted connector, local
//! event bus, drain, model build, query, and every analytics entry point.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use facet_analytics::{attribute, compare, olap, trend, ComparisonGroup, Factor, Granularity, TimeRange, TrendDirection};
use facet_core::{
    Dimension, DimensionKind, FieldDef, FieldMap, FieldType, ModelName, Schema, Source, SourceId,
    SourceType,
};
use facet_engine::{
    spawn_drain_loop, Connector, EngineConfig, EngineEvent, EventKind, FacetEngine, FacetError,
    NullSink, Query, Result, SalesMeasures,
};
use facet_events_local::LocalEventBus;
use parking_lot::Mutex;
use serde_json::json;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

struct ScriptedConnector {
    batches: Mutex<Vec<Result<Vec<FieldMap>>>>,
}

impl ScriptedConnector {
    fn new(batches: Vec<Result<Vec<FieldMap>>>) -> Self {
        Self {
            batches: Mutex::new(batches),
        }
    }
}

impl Connector for ScriptedConnector {
    fn fetch<'a>(
        &'a self,
        _source: &'a Source,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FieldMap>>> + Send + 'a>> {
        Box::pin(async move {
            let mut batches = self.batches.lock();
            if batches.is_empty() {
                Ok(Vec::new())
            } else {
                batches.remove(0)
            }
        })
    }
}

fn order(region: &str, amount: f64, day: i64) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("region".into(), json!(region));
    fields.insert("amount".into(), json!(amount));
    fields.insert("timestamp".into(), json!(day * DAY_MS));
    fields
}

fn sales_schema(source: SourceId) -> Schema {
    Schema::new(
        source,
        vec![
            FieldDef::new("region", FieldType::String),
            FieldDef::new("amount", FieldType::Float),
            FieldDef::new("timestamp", FieldType::Timestamp),
        ],
    )
}

#[tokio::test(flavor = "current_thread")]
async fn full_pipeline_from_ingest_to_analytics() {
    let source_id = SourceId::new("orders-api");
    let batches = vec![
        Ok(vec![
            order("north", 100.0, 0),
            order("south", 50.0, 1),
            order("north", 200.0, 2),
        ]),
        Err(FacetError::InvalidInput("upstream outage".into())),
        Ok(vec![order("south", 80.0, 3), order("north", 120.0, 4)]),
    ];
    let engine = FacetEngine::new(
        EngineConfig::default(),
        ScriptedConnector::new(batches),
        LocalEventBus::new(),
    );
    engine
        .register_source(
            Source::new("orders-api", "orders", SourceType::Api),
            Some(sales_schema(source_id.clone())),
        )
        .unwrap();
    let collected_handle = engine.sink.subscribe(vec![EventKind::DataCollected]);
    let cleaned_handle = engine.sink.subscribe(vec![EventKind::DataCleaned]);

    // First batch flows; the outage batch is skipped without touching the
    // buffer; the third batch flows again.
    assert_eq!(engine.ingest(&source_id).await.unwrap(), 3);
    assert!(matches!(
        engine.ingest(&source_id).await,
        Err(FacetError::SourceFetchFailed { .. })
    ));
    assert_eq!(engine.ingest(&source_id).await.unwrap(), 2);
    assert_eq!(engine.statistics().buffered_record_count, 5);

    assert_eq!(engine.drain_once(), 5);
    let mut collected = 0;
    while engine.sink.poll(&collected_handle).unwrap().is_some() {
        collected += 1;
    }
    assert_eq!(collected, 5);
    assert!(matches!(
        engine.sink.poll(&cleaned_handle).unwrap(),
        Some(EngineEvent::DataCleaned(batch)) if batch.len() == 5
    ));

    engine.build_model(
        "sales",
        vec![Dimension::new("region", DimensionKind::Location)],
        &SalesMeasures,
    );

    // Grouped query: revenue per region, declared sum aggregation.
    let mut query = Query::new("sales");
    query.group_by = vec!["region".into()];
    query.measures = vec!["revenue".into()];
    let result = engine.query(&query).unwrap();
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0].get("region"), Some(&json!("north")));
    assert_eq!(result.rows[0].get("revenue"), Some(&json!(420.0)));
    assert_eq!(result.rows[1].get("revenue"), Some(&json!(130.0)));

    // Second run comes from the cache with identical rows.
    let again = engine.query(&query).unwrap();
    assert!(again.cached);
    assert_eq!(again.rows, result.rows);

    // OLAP over the same cube.
    let analysis = olap(
        &engine,
        &ModelName::new("sales"),
        &["region".into()],
        &["revenue".into()],
    )
    .unwrap();
    assert!(!analysis.insights.is_empty());
    assert!(!analysis.recommendations.is_empty());

    // Trend over the five daily facts.
    let report = trend(
        &engine,
        &ModelName::new("sales"),
        "revenue",
        &TimeRange {
            start_ms: 0,
            end_ms: 5 * DAY_MS,
            granularity: Granularity::Day,
        },
        2,
    )
    .unwrap();
    assert_eq!(report.points.len(), 5);
    assert_eq!(report.direction, TrendDirection::Up);
    assert_eq!(report.forecast.len(), 2);

    // Comparison built from the grouped rows.
    let groups: Vec<ComparisonGroup> = result
        .rows
        .iter()
        .map(|row| {
            ComparisonGroup::new(
                row.get("region").unwrap().as_str().unwrap(),
                row.get("revenue").unwrap().as_f64().unwrap(),
            )
        })
        .collect();
    let comparison = compare(&groups, "revenue");
    assert_eq!(comparison.winner.as_deref(), Some("north"));
    assert_eq!(comparison.comparisons.len(), 1);

    // Attribution splits the north total across two plausible drivers.
    let attribution = attribute(
        420.0,
        &[Factor::new("campaigns", 3.0), Factor::new("seasonality", 1.0)],
    )
    .unwrap();
    let total: f64 = attribution
        .contributions
        .iter()
        .map(|c| c.contribution)
        .sum();
    assert!((total - 420.0).abs() < 1e-6);

    let stats = engine.statistics();
    assert_eq!(stats.source_count, 1);
    assert_eq!(stats.schema_count, 1);
    assert_eq!(stats.model_count, 1);
    assert_eq!(stats.buffered_record_count, 0);
    assert_eq!(stats.cleaned_record_count, 5);
    assert!(stats.cached_query_count >= 1);

    // Ghost model stays a hard error end to end.
    assert!(matches!(
        engine.query(&Query::new("ghost")),
        Err(FacetError::ModelNotFound(name)) if name == "ghost"
    ));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn background_drain_feeds_the_cleaned_pool() {
    let mut config = EngineConfig::default();
    config.drain.interval_ms = 20;
    let engine = Arc::new(FacetEngine::new(
        config,
        ScriptedConnector::new(vec![Ok(vec![order("north", 10.0, 0)])]),
        NullSink,
    ));
    engine
        .register_source(Source::new("s1", "orders", SourceType::Stream), None)
        .unwrap();
    engine.ingest(&SourceId::new("s1")).await.unwrap();

    let handle = spawn_drain_loop(engine.clone());
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    handle.abort();

    assert_eq!(engine.statistics().buffered_record_count, 0);
    assert_eq!(engine.statistics().cleaned_record_count, 1);
}
