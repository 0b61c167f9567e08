//! Time-series trend analysis and naive forecasting.
//!
//! Buckets are fixed-duration (a month is always 30 days, a year 365), not
//! calendar-aware. Each bucket aggregates the metric over the model's
//! facts with the metric's declared aggregation.

use facet_core::ModelName;
use facet_engine::{aggregate_measure, Connector, EventSink, FacetEngine, FacetError, Result};
use serde::{Deserialize, Serialize};

/// Hard bound on bucket count so a runaway range cannot allocate without
/// limit.
const MAX_BUCKETS: usize = 10_000;

const HOUR_MS: i64 = 60 * 60 * 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    pub fn bucket_ms(self) -> i64 {
        match self {
            Granularity::Hour => HOUR_MS,
            Granularity::Day => 24 * HOUR_MS,
            Granularity::Week => 7 * 24 * HOUR_MS,
            Granularity::Month => 30 * 24 * HOUR_MS,
            Granularity::Quarter => 90 * 24 * HOUR_MS,
            Granularity::Year => 365 * 24 * HOUR_MS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct TimeRange {
    pub start_ms: i64,
    pub end_ms: i64,
    pub granularity: Granularity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
    Stable,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TrendPoint {
    pub bucket_start_ms: i64,
    pub value: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrendReport {
    pub metric: String,
    pub points: Vec<TrendPoint>,
    pub direction: TrendDirection,
    /// Relative change from the first point to the last, in percent.
    pub change_rate: f64,
    pub forecast: Vec<TrendPoint>,
    pub insights: Vec<String>,
}

/// Analyze one metric of a registered model over a time range.
pub fn trend<C, E>(
    engine: &FacetEngine<C, E>,
    model: &ModelName,
    metric: &str,
    range: &TimeRange,
    forecast_periods: usize,
) -> Result<TrendReport>
where
    C: Connector,
    E: EventSink,
{
    if range.end_ms <= range.start_ms {
        return Err(FacetError::InvalidInput(
            "trend range end must be after start".into(),
        ));
    }
    let snapshot = engine
        .model(model)
        .ok_or_else(|| FacetError::ModelNotFound(model.0.clone()))?;
    let kind = snapshot
        .measure(metric)
        .map(|m| m.aggregation)
        .ok_or_else(|| FacetError::UnknownField(metric.to_string()))?;

    let bucket_ms = range.granularity.bucket_ms();
    let span = range.end_ms - range.start_ms;
    let bucket_count = (span + bucket_ms - 1) / bucket_ms;
    if bucket_count as usize > MAX_BUCKETS {
        return Err(FacetError::InvalidInput(format!(
            "trend range spans {bucket_count} buckets, limit is {MAX_BUCKETS}"
        )));
    }

    let mut points = Vec::with_capacity(bucket_count as usize);
    for i in 0..bucket_count {
        let bucket_start_ms = range.start_ms + i * bucket_ms;
        let bucket_end_ms = bucket_start_ms + bucket_ms;
        let mut present = Vec::new();
        let mut members = 0usize;
        for fact in snapshot.facts() {
            let ts = fact.timestamp_ms();
            if ts >= bucket_start_ms && ts < bucket_end_ms {
                members += 1;
                if let Some(v) = fact.measure(metric) {
                    present.push(v);
                }
            }
        }
        points.push(TrendPoint {
            bucket_start_ms,
            value: aggregate_measure(kind, &present, members),
        });
    }

    let values: Vec<f64> = points.iter().map(|p| p.value).collect();
    let direction = classify(&values);
    let change_rate = match values.first() {
        Some(&first) if first != 0.0 => {
            (values.last().copied().unwrap_or(first) - first) / first * 100.0
        }
        _ => 0.0,
    };
    let forecast = forecast_points(&points, bucket_ms, forecast_periods);
    let insights = build_insights(metric, &values, &points, direction);

    Ok(TrendReport {
        metric: metric.to_string(),
        points,
        direction,
        change_rate,
        forecast,
        insights,
    })
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Second-half mean against first-half mean, with a 5% dead band.
fn classify(values: &[f64]) -> TrendDirection {
    if values.len() < 2 {
        return TrendDirection::Stable;
    }
    let mid = values.len() / 2;
    let first = mean(&values[..mid]);
    let second = mean(&values[mid..]);
    if first == 0.0 {
        return if second > 0.0 {
            TrendDirection::Up
        } else {
            TrendDirection::Stable
        };
    }
    let ratio = (second - first) / first;
    if ratio > 0.05 {
        TrendDirection::Up
    } else if ratio < -0.05 {
        TrendDirection::Down
    } else {
        TrendDirection::Stable
    }
}

/// Linear extrapolation from the last two points' slope, clamped at zero.
/// A single point projects flat; no points, no forecast.
fn forecast_points(points: &[TrendPoint], bucket_ms: i64, periods: usize) -> Vec<TrendPoint> {
    let Some(last) = points.last() else {
        return Vec::new();
    };
    let slope = if points.len() >= 2 {
        last.value - points[points.len() - 2].value
    } else {
        0.0
    };
    (1..=periods as i64)
        .map(|k| TrendPoint {
            bucket_start_ms: last.bucket_start_ms + k * bucket_ms,
            value: (last.value + slope * k as f64).max(0.0),
        })
        .collect()
}

fn build_insights(
    metric: &str,
    values: &[f64],
    points: &[TrendPoint],
    direction: TrendDirection,
) -> Vec<String> {
    let mut insights = Vec::new();
    let word = match direction {
        TrendDirection::Up => "up",
        TrendDirection::Down => "down",
        TrendDirection::Stable => "stable",
    };
    insights.push(format!(
        "{metric} is {word} over {} buckets",
        values.len()
    ));

    let m = mean(values);
    let variance = if values.is_empty() {
        0.0
    } else {
        values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64
    };
    let std_dev = variance.sqrt();
    if std_dev > 0.0 {
        for point in points {
            if (point.value - m).abs() > 2.0 * std_dev {
                insights.push(format!(
                    "anomaly: {metric} at bucket {} is {} against a mean of {:.2}",
                    point.bucket_start_ms, point.value, m
                ));
            }
        }
    }
    insights
}
