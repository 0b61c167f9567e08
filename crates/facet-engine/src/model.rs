//! Cleaning and dimensional model building.
//!
//! Cleaning runs per record: quality scoring, a declarative transform
//! (field renames plus numeric coercion), and within-batch exact-duplicate
//! dropping. Model building folds cleaned records into facts, one per
//! record, with measure extraction supplied by the caller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use facet_core::{
    Aggregation, CleanedRecord, DataModel, Dimension, Fact, FieldMap, Measure, ModelName,
    RawRecord, Schema, SourceId,
};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::quality;

/// Declarative transform applied to every record during cleaning.
///
/// An empty transform is the identity, which is a valid configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TransformConfig {
    /// Old field name -> new field name.
    #[serde(default)]
    pub renames: HashMap<String, String>,
    /// Fields whose string values should be parsed into numbers when they
    /// parse cleanly; unparseable values pass through untouched.
    #[serde(default)]
    pub coerce_numeric: Vec<String>,
}

impl TransformConfig {
    fn apply(&self, mut fields: FieldMap) -> FieldMap {
        for (from, to) in &self.renames {
            if let Some(value) = fields.remove(from) {
                fields.insert(to.clone(), value);
            }
        }
        for name in &self.coerce_numeric {
            let parsed = match fields.get(name) {
                Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            if let Some(n) = parsed {
                if let Some(num) = serde_json::Number::from_f64(n) {
                    fields.insert(name.clone(), Value::Number(num));
                }
            }
        }
        fields
    }
}

/// Clean a drained batch: score, transform, and drop exact duplicates
/// (same source, identical fields) within the batch.
///
/// The record timestamp prefers an explicit integer `timestamp` field and
/// falls back to the ingestion time.
pub fn clean_data<'a>(
    raws: Vec<RawRecord>,
    schema_for: impl Fn(&SourceId) -> Option<&'a Schema>,
    transform: &TransformConfig,
    now_ms: i64,
) -> Vec<CleanedRecord> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut cleaned = Vec::with_capacity(raws.len());

    for raw in raws {
        let fingerprint = (
            raw.source.0.clone(),
            serde_json::to_string(&raw.fields).unwrap_or_default(),
        );
        if !seen.insert(fingerprint) {
            debug!(source = %raw.source, "dropped duplicate record within batch");
            continue;
        }

        let quality = quality::score(&raw, schema_for(&raw.source), now_ms);
        let fields = transform.apply(raw.fields);
        let timestamp_ms = fields
            .get("timestamp")
            .and_then(Value::as_i64)
            .unwrap_or(raw.ingested_at_ms);

        cleaned.push(CleanedRecord {
            id: Uuid::new_v4().to_string(),
            source: raw.source,
            timestamp_ms,
            fields,
            quality,
        });
    }

    cleaned
}

/// Measure extraction seam: maps one cleaned record to its measure values
/// and declares the measure set (with aggregation kinds) for the model.
pub trait MeasureExtractor {
    fn measures(&self) -> Vec<Measure>;
    fn extract(&self, record: &CleanedRecord) -> std::collections::BTreeMap<String, f64>;
}

/// Default sales-oriented extractor: `count = 1`, `revenue = amount or 0`,
/// `avg_order_value = amount or 0`, declared count/sum/avg respectively.
pub struct SalesMeasures;

impl MeasureExtractor for SalesMeasures {
    fn measures(&self) -> Vec<Measure> {
        vec![
            Measure::new("count", Aggregation::Count),
            Measure::new("revenue", Aggregation::Sum),
            Measure::new("avg_order_value", Aggregation::Avg),
        ]
    }

    fn extract(&self, record: &CleanedRecord) -> std::collections::BTreeMap<String, f64> {
        let amount = record
            .fields
            .get("amount")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let mut measures = std::collections::BTreeMap::new();
        measures.insert("count".to_string(), 1.0);
        measures.insert("revenue".to_string(), amount);
        measures.insert("avg_order_value".to_string(), amount);
        measures
    }
}

/// Build a model from cleaned records: one fact per record, one value per
/// declared dimension (missing becomes null), measures from the extractor.
pub fn model_data(
    name: impl Into<String>,
    cleaned: &[CleanedRecord],
    dimensions: Vec<Dimension>,
    extractor: &dyn MeasureExtractor,
) -> DataModel {
    let dimension_names: Vec<String> = dimensions.iter().map(|d| d.name.clone()).collect();
    let mut builder = DataModel::builder(name);
    for dimension in dimensions {
        builder = builder.dimension(dimension);
    }
    for measure in extractor.measures() {
        builder = builder.measure(measure);
    }

    for record in cleaned {
        let mut dimension_values = FieldMap::new();
        for dim in &dimension_names {
            let value = record.fields.get(dim).cloned().unwrap_or(Value::Null);
            dimension_values.insert(dim.clone(), value);
        }
        let measure_values = extractor.extract(record);
        builder.push_fact(Fact::new(
            dimension_values,
            measure_values,
            record.timestamp_ms,
        ));
    }

    builder.build()
}

/// Named model registry. Rebuilds swap the `Arc` for the name, so readers
/// holding the previous snapshot are unaffected.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<ModelName, Arc<DataModel>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model, replacing any previous model under the same name.
    pub fn register(&self, model: DataModel) -> Arc<DataModel> {
        let model = Arc::new(model);
        self.models
            .write()
            .insert(model.name().clone(), model.clone());
        model
    }

    pub fn get(&self, name: &ModelName) -> Option<Arc<DataModel>> {
        self.models.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }

    pub fn names(&self) -> Vec<ModelName> {
        let mut names: Vec<_> = self.models.read().keys().cloned().collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));
        names
    }
}
