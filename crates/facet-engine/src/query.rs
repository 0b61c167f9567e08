//! Query execution: filter, group/aggregate, sort, paginate, cache.
//!
//! Queries run synchronously against a registered model snapshot; the only
//! side effect is cache population. Cached results are keyed by the
//! canonical serialization of the query and expire on age; the cache is
//! additionally LRU-bounded so distinct query shapes cannot grow memory
//! without limit.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use facet_core::{Aggregation, DataModel, Fact, ModelName};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::model::ModelRegistry;
use crate::{FacetError, Result};

/// One filter predicate over a declared dimension or measure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

/// Closed operator set; anything else is rejected at deserialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Like,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// One ad-hoc query against a named model.
///
/// Empty `dimensions`/`measures` select everything the model declares.
/// Maps inside are ordered, so the serialized form is canonical and usable
/// as a cache key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub model: ModelName,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub measures: Vec<String>,
    #[serde(default)]
    pub filters: Vec<QueryFilter>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl Query {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: ModelName::new(model),
            dimensions: Vec::new(),
            measures: Vec::new(),
            filters: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }
}

pub type Row = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Row count before pagination.
    pub total: usize,
    pub execution_ms: f64,
    pub cached: bool,
}

/// TTL and capacity bounds for the query result cache.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "CacheConfig::default_capacity")]
    pub capacity: usize,
}

impl CacheConfig {
    const fn default_ttl_ms() -> u64 {
        60_000
    }

    const fn default_capacity() -> usize {
        256
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: Self::default_ttl_ms(),
            capacity: Self::default_capacity(),
        }
    }
}

pub(crate) trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct CacheEntry {
    rows: Vec<Row>,
    total: usize,
    execution_ms: f64,
    created_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Usage order, least recent at the front.
    order: VecDeque<String>,
}

impl CacheState {
    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }

    fn insert(&mut self, key: String, entry: CacheEntry, capacity: usize) {
        self.remove(&key);
        self.entries.insert(key.clone(), entry);
        self.order.push_back(key);
        while self.entries.len() > capacity.max(1) {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

/// Executes queries against the model registry, memoizing results.
pub struct QueryEngine {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    cache: Mutex<CacheState>,
}

impl QueryEngine {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub(crate) fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            cache: Mutex::new(CacheState::default()),
        }
    }

    /// Number of live cache entries.
    pub fn cached_count(&self) -> usize {
        self.cache.lock().entries.len()
    }

    pub fn execute(&self, registry: &ModelRegistry, query: &Query) -> Result<QueryResult> {
        let key = serde_json::to_string(query)
            .map_err(|e| FacetError::InvalidInput(format!("unserializable query: {e}")))?;
        let ttl = Duration::from_millis(self.config.ttl_ms);
        let now = self.clock.now();

        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.entries.get(&key) {
                if now.duration_since(entry.created_at) < ttl {
                    let result = QueryResult {
                        rows: entry.rows.clone(),
                        total: entry.total,
                        execution_ms: entry.execution_ms,
                        cached: true,
                    };
                    cache.touch(&key);
                    trace!(model = %query.model, "query served from cache");
                    #[cfg(feature = "metrics")]
                    facet_metrics::record_cache_hit();
                    return Ok(result);
                }
                cache.remove(&key);
            }
        }

        let model = registry
            .get(&query.model)
            .ok_or_else(|| FacetError::ModelNotFound(query.model.0.clone()))?;
        validate_fields(&model, query)?;

        let start = now;
        let facts: Vec<&Fact> = model
            .facts()
            .iter()
            .filter(|fact| query.filters.iter().all(|f| filter_matches(fact, f)))
            .collect();

        let rows = if query.group_by.is_empty() {
            project(&model, &facts, query)
        } else {
            group_and_aggregate(&model, &facts, query)
        };
        let rows = sorted(rows, &query.order_by);

        let total = rows.len();
        let offset = query.offset.unwrap_or(0).min(total);
        let end = match query.limit {
            Some(limit) => (offset + limit).min(total),
            None => total,
        };
        let page: Vec<Row> = rows[offset..end].to_vec();

        let execution_ms = self.clock.now().duration_since(start).as_secs_f64() * 1_000.0;
        #[cfg(feature = "metrics")]
        facet_metrics::record_query_latency(self.clock.now().duration_since(start));

        let result = QueryResult {
            rows: page.clone(),
            total,
            execution_ms,
            cached: false,
        };
        self.cache.lock().insert(
            key,
            CacheEntry {
                rows: page,
                total,
                execution_ms,
                created_at: self.clock.now(),
            },
            self.config.capacity,
        );
        Ok(result)
    }
}

/// Every referenced field must name a declared dimension or measure;
/// requested projection lists are checked against their own kind.
fn validate_fields(model: &DataModel, query: &Query) -> Result<()> {
    for name in &query.dimensions {
        if model.dimension(name).is_none() {
            return Err(FacetError::UnknownField(name.clone()));
        }
    }
    for name in &query.measures {
        if model.measure(name).is_none() {
            return Err(FacetError::UnknownField(name.clone()));
        }
    }
    let referenced = query
        .filters
        .iter()
        .map(|f| &f.field)
        .chain(query.group_by.iter())
        .chain(query.order_by.iter().map(|o| &o.field));
    for name in referenced {
        if !model.declares(name) {
            return Err(FacetError::UnknownField(name.clone()));
        }
    }
    Ok(())
}

/// Field lookup: dimension values first, then measures.
fn value_of(fact: &Fact, field: &str) -> Value {
    if let Some(value) = fact.dimension(field) {
        return value.clone();
    }
    match fact.measure(field) {
        Some(n) => serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        None => Value::Null,
    }
}

fn numbers_eq(a: &Value, b: &Value) -> Option<bool> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Some(x == y),
        _ => None,
    }
}

fn values_eq(a: &Value, b: &Value) -> bool {
    numbers_eq(a, b).unwrap_or_else(|| a == b)
}

/// Ordering for sorting: nulls first, numbers numerically, strings
/// lexically; incomparable kinds tie.
fn sort_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(_), Value::Number(_)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Ordering for filter comparisons; null or mixed-kind operands do not
/// compare, so ordered predicates fail on them.
fn filter_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(_), Value::Number(_)) => a.as_f64().partial_cmp(&b.as_f64()),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn filter_matches(fact: &Fact, filter: &QueryFilter) -> bool {
    let actual = value_of(fact, &filter.field);
    match filter.op {
        FilterOp::Eq => values_eq(&actual, &filter.value),
        FilterOp::Ne => !values_eq(&actual, &filter.value),
        FilterOp::Gt => matches!(filter_cmp(&actual, &filter.value), Some(Ordering::Greater)),
        FilterOp::Gte => matches!(
            filter_cmp(&actual, &filter.value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::Lt => matches!(filter_cmp(&actual, &filter.value), Some(Ordering::Less)),
        FilterOp::Lte => matches!(
            filter_cmp(&actual, &filter.value),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOp::In => filter
            .value
            .as_array()
            .map(|list| list.iter().any(|v| values_eq(&actual, v)))
            .unwrap_or(false),
        FilterOp::Like => match (coerce_string(&actual), coerce_string(&filter.value)) {
            (Some(haystack), Some(needle)) => haystack.contains(&needle),
            _ => false,
        },
    }
}

fn selected<'a>(requested: &'a [String], declared: Vec<String>) -> Vec<String> {
    if requested.is_empty() {
        declared
    } else {
        requested.to_vec()
    }
}

/// No group-by: one output row per fact, projecting the selected
/// dimension and measure values directly. No aggregation happens here.
fn project(model: &DataModel, facts: &[&Fact], query: &Query) -> Vec<Row> {
    let dims = selected(
        &query.dimensions,
        model.dimensions().iter().map(|d| d.name.clone()).collect(),
    );
    let measures = selected(
        &query.measures,
        model.measures().iter().map(|m| m.name.clone()).collect(),
    );

    facts
        .iter()
        .map(|fact| {
            let mut row = Row::new();
            for dim in &dims {
                row.insert(dim.clone(), value_of(fact, dim));
            }
            for measure in &measures {
                row.insert(measure.clone(), value_of(fact, measure));
            }
            row
        })
        .collect()
}

/// Group facts by the group-by tuple (first-seen order) and aggregate each
/// selected measure with its declared aggregation.
fn group_and_aggregate(model: &DataModel, facts: &[&Fact], query: &Query) -> Vec<Row> {
    let measures = selected(
        &query.measures,
        model.measures().iter().map(|m| m.name.clone()).collect(),
    );

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Vec<Value>, Vec<&Fact>)> = Vec::new();
    for fact in facts {
        let key_values: Vec<Value> = query
            .group_by
            .iter()
            .map(|field| value_of(fact, field))
            .collect();
        let key = serde_json::to_string(&key_values).unwrap_or_default();
        match index.get(&key) {
            Some(&slot) => groups[slot].1.push(fact),
            None => {
                index.insert(key, groups.len());
                groups.push((key_values, vec![fact]));
            }
        }
    }

    groups
        .into_iter()
        .map(|(key_values, members)| {
            let mut row = Row::new();
            for (field, value) in query.group_by.iter().zip(key_values) {
                row.insert(field.clone(), value);
            }
            for name in &measures {
                let kind = model
                    .measure(name)
                    .map(|m| m.aggregation)
                    .unwrap_or(Aggregation::Sum);
                let value = aggregate(kind, name, &members);
                row.insert(
                    name.clone(),
                    serde_json::Number::from_f64(value)
                        .map(Value::Number)
                        .unwrap_or(Value::Null),
                );
            }
            row
        })
        .collect()
}

fn aggregate(kind: Aggregation, name: &str, members: &[&Fact]) -> f64 {
    let present: Vec<f64> = members.iter().filter_map(|f| f.measure(name)).collect();
    aggregate_measure(kind, &present, members.len())
}

/// Aggregation dispatch over the declared kind. Sums treat a missing
/// measure as 0 (present values carry the whole sum); avg/min/max only
/// consider facts carrying the measure; count counts group members.
pub fn aggregate_measure(kind: Aggregation, present: &[f64], member_count: usize) -> f64 {
    match kind {
        Aggregation::Count => member_count as f64,
        Aggregation::Sum => present.iter().sum(),
        Aggregation::Avg => {
            if present.is_empty() {
                0.0
            } else {
                present.iter().sum::<f64>() / present.len() as f64
            }
        }
        Aggregation::Min => present
            .iter()
            .copied()
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.min(v))))
            .unwrap_or(0.0),
        Aggregation::Max => present
            .iter()
            .copied()
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.max(v))))
            .unwrap_or(0.0),
    }
}

/// Stable multi-key sort; ties fall through to the next key. Without
/// order-by the input order (first-seen group order) is preserved.
fn sorted(mut rows: Vec<Row>, order_by: &[OrderBy]) -> Vec<Row> {
    if order_by.is_empty() {
        return rows;
    }
    rows.sort_by(|a, b| {
        for key in order_by {
            let left = a.get(&key.field).unwrap_or(&Value::Null);
            let right = b.get(&key.field).unwrap_or(&Value::Null);
            let ord = match key.direction {
                SortDirection::Asc => sort_cmp(left, right),
                SortDirection::Desc => sort_cmp(right, left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    rows
}
