//! Analytics layered on top of the Facet query engine.
//!
//! All analyses are read-only: they query registered model snapshots and
//! never mutate them. OLAP and comparison live here; trend/forecast and
//! attribution have their own modules.

use facet_core::ModelName;
use facet_engine::{Connector, EventSink, FacetEngine, Query, Result, Row};
use serde::Serialize;
use serde_json::Value;

pub mod attribution;
pub mod trend;

pub use attribution::{
    attribute, attribute_with, AttributionResult, CoalitionValue, Factor, FactorContribution,
};
pub use trend::{trend, Granularity, TimeRange, TrendDirection, TrendPoint, TrendReport};

/// Output of an OLAP cube analysis.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysisResult {
    pub data: Vec<Row>,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Run a cube analysis: group the model by `dims` and aggregate
/// `measures`, then derive textual insights and recommendations.
///
/// Whenever `data` is non-empty, both text lists are non-empty too.
pub fn olap<C, E>(
    engine: &FacetEngine<C, E>,
    model: &ModelName,
    dims: &[String],
    measures: &[String],
) -> Result<AnalysisResult>
where
    C: Connector,
    E: EventSink,
{
    let mut query = Query::new(model.0.clone());
    query.group_by = dims.to_vec();
    query.measures = measures.to_vec();
    let result = engine.query(&query)?;

    let measure_names: Vec<String> = if measures.is_empty() {
        engine
            .model(model)
            .map(|snapshot| snapshot.measures().iter().map(|m| m.name.clone()).collect())
            .unwrap_or_default()
    } else {
        measures.to_vec()
    };

    let insights = cube_insights(&result.rows, dims, &measure_names);
    let recommendations = cube_recommendations(&result.rows, dims, &measure_names);

    Ok(AnalysisResult {
        data: result.rows,
        insights,
        recommendations,
    })
}

fn measure_value(row: &Row, measure: &str) -> Option<f64> {
    row.get(measure).and_then(Value::as_f64)
}

fn describe_combination(row: &Row, dims: &[String]) -> String {
    let parts: Vec<String> = dims
        .iter()
        .map(|dim| {
            let value = row
                .get(dim)
                .map(render_value)
                .unwrap_or_else(|| "null".to_string());
            format!("{dim}={value}")
        })
        .collect();
    if parts.is_empty() {
        "all facts".to_string()
    } else {
        parts.join(", ")
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// One insight per measure: the combination holding the maximum value.
fn cube_insights(rows: &[Row], dims: &[String], measures: &[String]) -> Vec<String> {
    if rows.is_empty() {
        return Vec::new();
    }
    let mut insights = Vec::new();
    for measure in measures {
        let best = rows
            .iter()
            .filter_map(|row| measure_value(row, measure).map(|v| (row, v)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        if let Some((row, value)) = best {
            insights.push(format!(
                "{measure} peaks at {value} for {}",
                describe_combination(row, dims)
            ));
        }
    }
    if insights.is_empty() {
        insights.push(format!("{} groups analyzed", rows.len()));
    }
    insights
}

/// Simple rules over the result shape; falls back to a generic
/// recommendation so the list is never empty alongside data.
fn cube_recommendations(rows: &[Row], dims: &[String], measures: &[String]) -> Vec<String> {
    if rows.is_empty() {
        return Vec::new();
    }
    let axis = if dims.is_empty() {
        "overall".to_string()
    } else {
        dims.join(", ")
    };
    let mut recommendations = Vec::new();

    for measure in measures {
        let values: Vec<f64> = rows
            .iter()
            .filter_map(|row| measure_value(row, measure))
            .collect();
        if values.len() < 2 {
            continue;
        }
        let max = values.iter().cloned().fold(f64::MIN, f64::max);
        let min = values.iter().cloned().fold(f64::MAX, f64::min);
        let total: f64 = values.iter().sum();
        if min > 0.0 && max / min >= 2.0 {
            recommendations.push(format!(
                "{measure} varies {:.1}x across {axis} segments; review the lagging segments",
                max / min
            ));
        }
        if total > 0.0 && max / total > 0.5 {
            recommendations.push(format!(
                "over half of total {measure} comes from a single {axis} combination; \
                 consider reducing concentration"
            ));
        }
    }

    if recommendations.is_empty() {
        recommendations.push(format!(
            "segments are balanced across {axis}; keep monitoring {}",
            measures.join(", ")
        ));
    }
    recommendations
}

/// A named group value entering a comparison.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ComparisonGroup {
    pub name: String,
    pub value: f64,
}

impl ComparisonGroup {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One pairwise comparison, oriented from `left` to `right`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Comparison {
    pub left: String,
    pub right: String,
    /// right minus left.
    pub difference: f64,
    /// Relative change from left to right, in percent.
    pub percentage_change: f64,
    pub significant: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ComparisonReport {
    pub metric: String,
    pub comparisons: Vec<Comparison>,
    pub winner: Option<String>,
}

const SIGNIFICANCE_THRESHOLD_PCT: f64 = 10.0;

/// Compare every unordered pair of groups on one metric. The winner is the
/// group with the maximum raw value; ties keep the first seen.
pub fn compare(groups: &[ComparisonGroup], metric: &str) -> ComparisonReport {
    let mut comparisons = Vec::new();
    for i in 0..groups.len() {
        for j in (i + 1)..groups.len() {
            let (left, right) = (&groups[i], &groups[j]);
            let difference = right.value - left.value;
            let percentage_change = if left.value != 0.0 {
                difference / left.value * 100.0
            } else {
                0.0
            };
            comparisons.push(Comparison {
                left: left.name.clone(),
                right: right.name.clone(),
                difference,
                percentage_change,
                significant: percentage_change.abs() > SIGNIFICANCE_THRESHOLD_PCT,
            });
        }
    }

    let winner = groups
        .iter()
        .fold(None::<&ComparisonGroup>, |best, g| match best {
            Some(b) if g.value > b.value => Some(g),
            None => Some(g),
            keep => keep,
        })
        .map(|g| g.name.clone());

    ComparisonReport {
        metric: metric.to_string(),
        comparisons,
        winner,
    }
}
