//! Quality scoring for incoming raw records.
//!
//! Scoring is a pure function of the record, its declared schema (if any),
//! and the caller-provided notion of "now". It never fails: anything that
//! cannot be scored falls back to a conservative default so downstream
//! consumers always receive a complete quality vector.

use facet_core::{ConsistencyRule, DataQuality, QualityScore, RawRecord, Schema};
use serde_json::Value;

/// Window over which timeliness decays linearly to zero.
const TIMELINESS_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

/// Fallback when a component has nothing to measure against.
const CONSERVATIVE: f64 = 0.5;

/// Score a raw record against its declared schema.
pub fn score(raw: &RawRecord, schema: Option<&Schema>, now_ms: i64) -> DataQuality {
    DataQuality {
        completeness: QualityScore::clamped(completeness(raw, schema)),
        accuracy: QualityScore::clamped(accuracy(raw, schema)),
        consistency: QualityScore::clamped(consistency(raw, schema)),
        timeliness: QualityScore::clamped(timeliness(raw.ingested_at_ms, now_ms)),
    }
}

fn present(raw: &RawRecord, field: &str) -> bool {
    raw.fields.get(field).map(|v| !v.is_null()).unwrap_or(false)
}

/// Fraction of required (non-nullable) schema fields present and non-null.
/// Without a schema, the record is judged against itself: the fraction of
/// its own fields that are non-null.
fn completeness(raw: &RawRecord, schema: Option<&Schema>) -> f64 {
    match schema {
        Some(schema) => {
            let required: Vec<_> = schema.fields.iter().filter(|f| !f.nullable).collect();
            if required.is_empty() {
                return 1.0;
            }
            let hit = required.iter().filter(|f| present(raw, &f.name)).count();
            hit as f64 / required.len() as f64
        }
        None => {
            if raw.fields.is_empty() {
                return 0.0;
            }
            let non_null = raw.fields.values().filter(|v| !v.is_null()).count();
            non_null as f64 / raw.fields.len() as f64
        }
    }
}

/// Fraction of schema-declared fields, among those present, whose value
/// conforms to the declared type. Nulls conform only on nullable fields.
fn accuracy(raw: &RawRecord, schema: Option<&Schema>) -> f64 {
    let Some(schema) = schema else {
        return CONSERVATIVE;
    };
    let mut checked = 0usize;
    let mut conforming = 0usize;
    for def in &schema.fields {
        let Some(value) = raw.fields.get(&def.name) else {
            continue;
        };
        checked += 1;
        let ok = if value.is_null() {
            def.nullable
        } else {
            def.field_type.matches(value)
        };
        if ok {
            conforming += 1;
        }
    }
    if checked == 0 {
        return CONSERVATIVE;
    }
    conforming as f64 / checked as f64
}

/// Fraction of declared consistency rules the record satisfies. With no
/// rules declared there is nothing to violate.
fn consistency(raw: &RawRecord, schema: Option<&Schema>) -> f64 {
    let rules = match schema {
        Some(schema) if !schema.rules.is_empty() => &schema.rules,
        _ => return 1.0,
    };
    let satisfied = rules.iter().filter(|r| rule_holds(raw, r)).count();
    satisfied as f64 / rules.len() as f64
}

fn rule_holds(raw: &RawRecord, rule: &ConsistencyRule) -> bool {
    match rule {
        ConsistencyRule::RequireTogether(fields) => {
            let hit = fields.iter().filter(|f| present(raw, f)).count();
            hit == 0 || hit == fields.len()
        }
        ConsistencyRule::NonNegative(field) => match raw.fields.get(field) {
            Some(Value::Number(n)) => n.as_f64().map(|v| v >= 0.0).unwrap_or(true),
            // Absent or non-numeric is unscoreable, not a violation.
            _ => true,
        },
    }
}

/// Linear decay of record age over the timeliness window.
fn timeliness(ingested_at_ms: i64, now_ms: i64) -> f64 {
    let age = (now_ms - ingested_at_ms).max(0);
    1.0 - age as f64 / TIMELINESS_WINDOW_MS as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use facet_core::{FieldDef, FieldMap, FieldType, SourceId};
    use serde_json::json;

    fn record(pairs: &[(&str, Value)], ingested_at_ms: i64) -> RawRecord {
        let fields: FieldMap = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        RawRecord::new(SourceId::new("s1"), ingested_at_ms, fields)
    }

    fn schema() -> Schema {
        let mut schema = Schema::new(
            SourceId::new("s1"),
            vec![
                FieldDef::new("order_id", FieldType::String),
                FieldDef::new("amount", FieldType::Float),
                FieldDef::new("note", FieldType::String).nullable(),
            ],
        );
        schema.rules = vec![
            ConsistencyRule::NonNegative("amount".into()),
            ConsistencyRule::RequireTogether(vec!["order_id".into(), "amount".into()]),
        ];
        schema
    }

    #[test]
    fn fresh_conforming_record_scores_high() {
        let raw = record(
            &[("order_id", json!("o-1")), ("amount", json!(12.5))],
            1_000,
        );
        let q = score(&raw, Some(&schema()), 1_000);
        assert_eq!(q.completeness.get(), 1.0);
        assert_eq!(q.accuracy.get(), 1.0);
        assert_eq!(q.consistency.get(), 1.0);
        assert_eq!(q.timeliness.get(), 1.0);
    }

    #[test]
    fn missing_required_field_lowers_completeness() {
        let raw = record(&[("order_id", json!("o-1"))], 0);
        let q = score(&raw, Some(&schema()), 0);
        assert_eq!(q.completeness.get(), 0.5);
    }

    #[test]
    fn type_mismatch_lowers_accuracy() {
        let raw = record(
            &[("order_id", json!(42)), ("amount", json!(12.5))],
            0,
        );
        let q = score(&raw, Some(&schema()), 0);
        assert_eq!(q.accuracy.get(), 0.5);
    }

    #[test]
    fn null_on_nullable_field_conforms() {
        let raw = record(
            &[
                ("order_id", json!("o-1")),
                ("amount", json!(1.0)),
                ("note", Value::Null),
            ],
            0,
        );
        let q = score(&raw, Some(&schema()), 0);
        assert_eq!(q.accuracy.get(), 1.0);
    }

    #[test]
    fn rule_violations_lower_consistency() {
        // Negative amount violates NonNegative; both fields present keeps
        // RequireTogether satisfied.
        let raw = record(
            &[("order_id", json!("o-1")), ("amount", json!(-3.0))],
            0,
        );
        let q = score(&raw, Some(&schema()), 0);
        assert_eq!(q.consistency.get(), 0.5);
    }

    #[test]
    fn partial_require_together_violates() {
        let mut schema = schema();
        schema.rules = vec![ConsistencyRule::RequireTogether(vec![
            "order_id".into(),
            "amount".into(),
        ])];
        let raw = record(&[("order_id", json!("o-1"))], 0);
        let q = score(&raw, Some(&schema), 0);
        assert_eq!(q.consistency.get(), 0.0);
    }

    #[test]
    fn stale_record_times_out() {
        let raw = record(&[("order_id", json!("o-1"))], 0);
        let q = score(&raw, Some(&schema()), TIMELINESS_WINDOW_MS * 2);
        assert_eq!(q.timeliness.get(), 0.0);
    }

    #[test]
    fn no_schema_defaults_are_conservative() {
        let raw = record(&[("a", json!(1)), ("b", Value::Null)], 0);
        let q = score(&raw, None, 0);
        assert_eq!(q.completeness.get(), 0.5);
        assert_eq!(q.accuracy.get(), CONSERVATIVE);
        assert_eq!(q.consistency.get(), 1.0);
    }

    #[test]
    fn empty_record_scores_zero_completeness() {
        let raw = record(&[], 0);
        let q = score(&raw, None, 0);
        assert_eq!(q.completeness.get(), 0.0);
    }
}
