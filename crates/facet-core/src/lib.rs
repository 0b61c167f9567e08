//! Core immutable data model for Facet.
//!
//! Records flow one direction: a connector produces `RawRecord`s, cleaning
//! produces `CleanedRecord`s, and model building folds those into `Fact`s
//! owned by a `DataModel`. Facts and models are never mutated in place; a
//! rebuild produces a fresh model that replaces its predecessor by name.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field map shared by raw records, cleaned records, and fact values.
///
/// Ordered so that serialized forms are canonical (the query cache keys on
/// serialized queries, and facts embed these maps).
pub type FieldMap = BTreeMap<String, Value>;

/// Identifier for a registered data source.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Name of a registered data model.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelName(pub String);

impl ModelName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Connector flavor behind a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Database,
    Api,
    File,
    Stream,
}

/// One registered data origin. Immutable after registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub kind: SourceType,
    /// Opaque connector configuration; the engine never interprets it.
    #[serde(default)]
    pub config: Value,
}

impl Source {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: SourceType) -> Self {
        Self {
            id: SourceId::new(id),
            name: name.into(),
            kind,
            config: Value::Null,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Declared type of a schema field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Json,
}

impl FieldType {
    /// Whether a JSON value conforms to this declared type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            // Timestamps arrive either as epoch numbers or ISO strings.
            FieldType::Timestamp => value.is_number() || value.is_string(),
            FieldType::Json => true,
        }
    }
}

/// One typed, possibly-nullable field of a schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub nullable: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Cross-field rule the quality scorer checks for the consistency score.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyRule {
    /// Either all listed fields are present and non-null, or none are.
    RequireTogether(Vec<String>),
    /// The named field, when present and numeric, must be >= 0.
    NonNegative(String),
}

/// Declared shape of records from a source.
///
/// Schemas document and score records; they are not structurally enforced
/// anywhere in the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub source: SourceId,
    /// Ordered field declarations.
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub rules: Vec<ConsistencyRule>,
}

impl Schema {
    pub fn new(source: SourceId, fields: Vec<FieldDef>) -> Self {
        Self {
            source,
            fields,
            primary_key: Vec::new(),
            partition_key: None,
            rules: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// One record as fetched from a connector, before cleaning. Immutable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source: SourceId,
    pub ingested_at_ms: i64,
    pub fields: FieldMap,
}

impl RawRecord {
    pub fn new(source: SourceId, ingested_at_ms: i64, fields: FieldMap) -> Self {
        Self {
            source,
            ingested_at_ms,
            fields,
        }
    }
}

/// Quality score in the closed range [0.0, 1.0].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualityScore(f64);

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum QualityScoreError {
    #[error("quality score must be between 0.0 and 1.0 inclusive, got {0}")]
    OutOfRange(f64),
    #[error("quality score cannot be NaN")]
    NotANumber,
}

impl QualityScore {
    /// Validates the provided value is finite and within [0.0, 1.0].
    pub fn new(value: f64) -> Result<Self, QualityScoreError> {
        if value.is_nan() {
            return Err(QualityScoreError::NotANumber);
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(QualityScoreError::OutOfRange(value));
        }
        Ok(Self(value))
    }

    /// Clamps the provided value into the valid range; NaN becomes 0.0.
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            return Self(0.0);
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl fmt::Display for QualityScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-record quality vector produced by the scorer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataQuality {
    pub completeness: QualityScore,
    pub accuracy: QualityScore,
    pub consistency: QualityScore,
    pub timeliness: QualityScore,
}

impl DataQuality {
    /// Unweighted mean of the four components.
    pub fn overall(&self) -> QualityScore {
        QualityScore::clamped(
            (self.completeness.get()
                + self.accuracy.get()
                + self.consistency.get()
                + self.timeliness.get())
                / 4.0,
        )
    }
}

/// A scored, transformed record ready for model building. Immutable; the
/// raw record it came from is discarded after cleaning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CleanedRecord {
    pub id: String,
    pub source: SourceId,
    pub timestamp_ms: i64,
    pub fields: FieldMap,
    pub quality: DataQuality,
}

/// Kind of axis a dimension represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Time,
    Location,
    Category,
    Product,
    Customer,
    Custom,
}

/// A categorical or temporal axis facts are grouped and filtered by.
///
/// Declared by the caller when building a model; `values` is filled by the
/// model builder with the distinct values observed, in first-seen order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub kind: DimensionKind,
    #[serde(default)]
    pub hierarchy: Option<Vec<String>>,
    #[serde(default)]
    pub values: Vec<Value>,
}

impl Dimension {
    pub fn new(name: impl Into<String>, kind: DimensionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            hierarchy: None,
            values: Vec::new(),
        }
    }

    pub fn with_hierarchy(mut self, levels: Vec<String>) -> Self {
        self.hierarchy = Some(levels);
        self
    }
}

/// How a measure aggregates across a group of facts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

/// A numeric quantity attached to facts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub name: String,
    pub aggregation: Aggregation,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

impl Measure {
    pub fn new(name: impl Into<String>, aggregation: Aggregation) -> Self {
        Self {
            name: name.into(),
            aggregation,
            format: None,
            unit: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// One denormalized record of dimension values + measure values.
///
/// Facts are constructed once by the model builder and owned exclusively by
/// their `DataModel`; the keys of both maps are always a subset of the
/// model's declared dimension and measure names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    dimension_values: FieldMap,
    measure_values: BTreeMap<String, f64>,
    timestamp_ms: i64,
}

impl Fact {
    pub fn new(
        dimension_values: FieldMap,
        measure_values: BTreeMap<String, f64>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            dimension_values,
            measure_values,
            timestamp_ms,
        }
    }

    pub fn dimension_values(&self) -> &FieldMap {
        &self.dimension_values
    }

    pub fn measure_values(&self) -> &BTreeMap<String, f64> {
        &self.measure_values
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn dimension(&self, name: &str) -> Option<&Value> {
        self.dimension_values.get(name)
    }

    pub fn measure(&self, name: &str) -> Option<f64> {
        self.measure_values.get(name).copied()
    }
}

/// A star-schema-like collection of facts sharing declared dimensions and
/// measures. Read-only once built; a rebuild replaces the whole model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataModel {
    name: ModelName,
    dimensions: Vec<Dimension>,
    measures: Vec<Measure>,
    facts: Vec<Fact>,
}

impl DataModel {
    pub fn builder(name: impl Into<String>) -> DataModelBuilder {
        DataModelBuilder {
            name: ModelName::new(name),
            dimensions: Vec::new(),
            measures: Vec::new(),
            facts: Vec::new(),
        }
    }

    pub fn name(&self) -> &ModelName {
        &self.name
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn measures(&self) -> &[Measure] {
        &self.measures
    }

    pub fn facts(&self) -> &[Fact] {
        &self.facts
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn measure(&self, name: &str) -> Option<&Measure> {
        self.measures.iter().find(|m| m.name == name)
    }

    /// Whether `field` names a declared dimension or measure.
    pub fn declares(&self, field: &str) -> bool {
        self.dimension(field).is_some() || self.measure(field).is_some()
    }
}

/// Builder for data models.
///
/// `push_fact` drops any dimension or measure key the model does not
/// declare, so the subset invariant holds by construction, and records
/// newly observed dimension values in declaration order.
pub struct DataModelBuilder {
    name: ModelName,
    dimensions: Vec<Dimension>,
    measures: Vec<Measure>,
    facts: Vec<Fact>,
}

impl DataModelBuilder {
    pub fn dimension(mut self, dimension: Dimension) -> Self {
        self.dimensions.push(dimension);
        self
    }

    pub fn measure(mut self, measure: Measure) -> Self {
        self.measures.push(measure);
        self
    }

    pub fn push_fact(&mut self, fact: Fact) {
        let Fact {
            mut dimension_values,
            mut measure_values,
            timestamp_ms,
        } = fact;
        dimension_values.retain(|k, _| self.dimensions.iter().any(|d| &d.name == k));
        measure_values.retain(|k, _| self.measures.iter().any(|m| &m.name == k));

        for dim in &mut self.dimensions {
            if let Some(value) = dimension_values.get(&dim.name) {
                if !value.is_null() && !dim.values.contains(value) {
                    dim.values.push(value.clone());
                }
            }
        }

        self.facts.push(Fact {
            dimension_values,
            measure_values,
            timestamp_ms,
        });
    }

    pub fn build(self) -> DataModel {
        DataModel {
            name: self.name,
            dimensions: self.dimensions,
            measures: self.measures,
            facts: self.facts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn quality_score_validation() {
        assert!(QualityScore::new(0.0).is_ok());
        assert!(QualityScore::new(1.0).is_ok());
        assert!(QualityScore::new(1.1).is_err());
        assert!(QualityScore::new(-0.1).is_err());
        assert!(QualityScore::new(f64::NAN).is_err());
        assert_eq!(QualityScore::clamped(1.5).get(), 1.0);
        assert_eq!(QualityScore::clamped(-1.0).get(), 0.0);
        assert_eq!(QualityScore::clamped(f64::NAN).get(), 0.0);
    }

    #[test]
    fn quality_overall_is_component_mean() {
        let q = DataQuality {
            completeness: QualityScore::clamped(1.0),
            accuracy: QualityScore::clamped(0.5),
            consistency: QualityScore::clamped(0.5),
            timeliness: QualityScore::clamped(0.0),
        };
        assert!((q.overall().get() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn enum_serde_names_are_stable() {
        let cases = [
            (serde_json::to_string(&SourceType::Database).unwrap(), "\"database\""),
            (serde_json::to_string(&SourceType::Api).unwrap(), "\"api\""),
            (serde_json::to_string(&DimensionKind::Time).unwrap(), "\"time\""),
            (serde_json::to_string(&DimensionKind::Custom).unwrap(), "\"custom\""),
            (serde_json::to_string(&Aggregation::Sum).unwrap(), "\"sum\""),
            (serde_json::to_string(&Aggregation::Avg).unwrap(), "\"avg\""),
            (serde_json::to_string(&FieldType::Timestamp).unwrap(), "\"timestamp\""),
        ];
        for (actual, expected) in cases {
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn field_type_conformance() {
        assert!(FieldType::String.matches(&json!("x")));
        assert!(!FieldType::String.matches(&json!(1)));
        assert!(FieldType::Integer.matches(&json!(3)));
        assert!(!FieldType::Integer.matches(&json!(3.5)));
        assert!(FieldType::Float.matches(&json!(3)));
        assert!(FieldType::Float.matches(&json!(3.5)));
        assert!(FieldType::Timestamp.matches(&json!(1_700_000_000_000i64)));
        assert!(FieldType::Timestamp.matches(&json!("2024-01-01T00:00:00Z")));
        assert!(FieldType::Json.matches(&json!({"nested": true})));
    }

    #[test]
    fn builder_enforces_declared_keys() {
        let mut builder = DataModel::builder("sales")
            .dimension(Dimension::new("region", DimensionKind::Location))
            .measure(Measure::new("revenue", Aggregation::Sum));

        let mut measures = BTreeMap::new();
        measures.insert("revenue".to_string(), 10.0);
        measures.insert("undeclared".to_string(), 99.0);
        builder.push_fact(Fact::new(
            fields(&[("region", json!("north")), ("rogue", json!("x"))]),
            measures,
            0,
        ));

        let model = builder.build();
        let fact = &model.facts()[0];
        assert_eq!(fact.dimension("region"), Some(&json!("north")));
        assert!(fact.dimension("rogue").is_none());
        assert_eq!(fact.measure("revenue"), Some(10.0));
        assert!(fact.measure("undeclared").is_none());
    }

    #[test]
    fn builder_collects_distinct_dimension_values_in_order() {
        let mut builder = DataModel::builder("sales")
            .dimension(Dimension::new("region", DimensionKind::Location))
            .measure(Measure::new("count", Aggregation::Count));

        for region in ["north", "south", "north", "east"] {
            builder.push_fact(Fact::new(
                fields(&[("region", json!(region))]),
                BTreeMap::new(),
                0,
            ));
        }

        let model = builder.build();
        let values = &model.dimension("region").unwrap().values;
        assert_eq!(values, &vec![json!("north"), json!("south"), json!("east")]);
    }

    #[test]
    fn missing_dimension_value_stays_absent() {
        let mut builder = DataModel::builder("sales")
            .dimension(Dimension::new("region", DimensionKind::Location))
            .dimension(Dimension::new("channel", DimensionKind::Category))
            .measure(Measure::new("count", Aggregation::Count));

        builder.push_fact(Fact::new(
            fields(&[("region", json!("north"))]),
            BTreeMap::new(),
            0,
        ));

        let model = builder.build();
        assert!(model.facts()[0].dimension("channel").is_none());
        assert!(model.dimension("channel").unwrap().values.is_empty());
    }
}
