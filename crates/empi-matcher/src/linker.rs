//! Contract with the external probabilistic linkage engine.
//!
//! The core never trains or introspects the model; it hands over a frame of
//! person records plus settings and receives scored candidate pairs back.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

/// One person record as handed to the linker. Column order is part of the
/// contract; `created` is pre-formatted because linkage settings may compare
/// on it as text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonRecordFrameRow {
    pub id: i64,
    pub created: String,
    pub job_id: i64,
    pub data_source: String,
    pub source_person_id: String,
    pub first_name: String,
    pub last_name: String,
    pub sex: String,
    pub race: String,
    pub birth_date: String,
    pub death_date: String,
    pub social_security_number: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub county: String,
    pub phone: String,
}

/// One scored candidate pair returned by the linker. Both record ids must
/// appear in the input frame.
#[derive(Debug, Clone)]
pub struct ScoredPair {
    pub match_weight: f64,
    pub match_probability: f64,
    pub person_record_l_id: i64,
    pub person_record_r_id: i64,
    /// Opaque per-pair diagnostics (match key, bayes factors, comparison
    /// vector values).
    pub data: Value,
}

/// Opaque pairwise scoring engine.
///
/// Scoring is CPU-bound and runs on the dedicated matcher worker, so the
/// trait is synchronous.
pub trait Linker: Send + Sync {
    fn predict(
        &self,
        records: &[PersonRecordFrameRow],
        settings: &Value,
    ) -> Result<Vec<ScoredPair>>;
}

/// Linker that returns a fixed set of pairs. Useful for wiring tests and for
/// replaying previously exported scores.
#[derive(Debug, Clone, Default)]
pub struct FixedLinker {
    pub pairs: Vec<ScoredPair>,
}

impl Linker for FixedLinker {
    fn predict(&self, _records: &[PersonRecordFrameRow], _settings: &Value) -> Result<Vec<ScoredPair>> {
        Ok(self.pairs.clone())
    }
}

/// Deterministic fallback linker: exact agreement on name and birth date.
///
/// Intended for deployments without a trained probabilistic model and for
/// end-to-end exercising of the pipeline. Mirrors the job-scoped blocking
/// constraint by only emitting pairs where at least one side belongs to the
/// newest job in the frame.
#[derive(Debug, Clone, Default)]
pub struct ExactMatchLinker;

impl Linker for ExactMatchLinker {
    fn predict(
        &self,
        records: &[PersonRecordFrameRow],
        _settings: &Value,
    ) -> Result<Vec<ScoredPair>> {
        use std::collections::HashMap;

        let current_job = records.iter().map(|r| r.job_id).max().unwrap_or(0);

        let mut by_key: HashMap<(String, String, String), Vec<&PersonRecordFrameRow>> =
            HashMap::new();
        for record in records {
            if record.first_name.is_empty()
                || record.last_name.is_empty()
                || record.birth_date.is_empty()
            {
                continue;
            }
            by_key
                .entry((
                    record.first_name.to_lowercase(),
                    record.last_name.to_lowercase(),
                    record.birth_date.clone(),
                ))
                .or_default()
                .push(record);
        }

        let mut pairs = Vec::new();
        for bucket in by_key.values() {
            for (i, left) in bucket.iter().enumerate() {
                for right in &bucket[i + 1..] {
                    if left.job_id != current_job && right.job_id != current_job {
                        continue;
                    }

                    let mut probability: f64 = 0.9;
                    if !left.sex.is_empty() && left.sex == right.sex {
                        probability += 0.04;
                    }
                    if !left.social_security_number.is_empty()
                        && left.social_security_number == right.social_security_number
                    {
                        probability += 0.05;
                    }

                    pairs.push(ScoredPair {
                        match_weight: (probability / (1.0 - probability)).log2(),
                        match_probability: probability,
                        person_record_l_id: left.id.min(right.id),
                        person_record_r_id: left.id.max(right.id),
                        data: json!({"match_key": "0"}),
                    });
                }
            }
        }

        Ok(pairs)
    }
}

/// Rewrite linker settings for one job.
///
/// Each configured blocking rule `R` becomes the pair
/// `(R) and l.job_id = <job>` / `(R) and r.job_id = <job>`, so only pairs
/// with at least one side from the current job are scored: old records have
/// already been compared against each other by earlier jobs. Output column
/// prefixes and the dedupe link type are overridden so downstream parsing is
/// stable regardless of the stored settings.
pub fn job_scoped_settings(settings: &Value, job_id: i64) -> Result<Value> {
    let mut scoped = settings.clone();

    let Some(object) = scoped.as_object_mut() else {
        bail!("linker settings must be a JSON object");
    };

    let rules = match object.get("blocking_rules_to_generate_predictions") {
        Some(Value::Array(rules)) => rules.clone(),
        Some(other) => bail!(
            "blocking_rules_to_generate_predictions must be an array, got {}",
            other
        ),
        None => bail!("linker settings missing blocking_rules_to_generate_predictions"),
    };

    let mut scoped_rules = Vec::with_capacity(rules.len() * 2);
    for rule in &rules {
        let rule_sql = match rule {
            Value::String(sql) => sql.as_str(),
            Value::Object(map) => map
                .get("blocking_rule")
                .and_then(Value::as_str)
                .unwrap_or_default(),
            _ => "",
        };
        if rule_sql.is_empty() {
            bail!("blocking rule has no SQL: {}", rule);
        }

        for side in ["l", "r"] {
            scoped_rules.push(json!({
                "blocking_rule": format!("({}) and {}.job_id = {}", rule_sql, side, job_id),
                "sql_dialect": "duckdb",
            }));
        }
    }

    info!(
        "Scoped {} blocking rules to job {} ({} rules total)",
        rules.len(),
        job_id,
        scoped_rules.len()
    );

    object.insert(
        "blocking_rules_to_generate_predictions".to_string(),
        Value::Array(scoped_rules),
    );
    object.insert("link_type".to_string(), json!("dedupe_only"));
    object.insert("unique_id_column_name".to_string(), json!("id"));
    object.insert("source_dataset_column_name".to_string(), json!("source_dataset"));
    object.insert("retain_matching_columns".to_string(), json!(false));
    object.insert(
        "retain_intermediate_calculation_columns".to_string(),
        json!(true),
    );
    object.insert("additional_columns_to_retain".to_string(), json!([]));
    object.insert("bayes_factor_column_prefix".to_string(), json!("bf_"));
    object.insert(
        "term_frequency_adjustment_column_prefix".to_string(),
        json!("tf_"),
    );
    object.insert(
        "comparison_vector_value_column_prefix".to_string(),
        json!("gamma_"),
    );
    object.insert("sql_dialect".to_string(), json!("duckdb"));

    Ok(scoped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_row(id: i64, job_id: i64, first: &str, last: &str, birth: &str) -> PersonRecordFrameRow {
        PersonRecordFrameRow {
            id,
            created: "2024-01-01T00:00:00.000000+00:00".to_string(),
            job_id,
            data_source: "clinic-a".to_string(),
            source_person_id: format!("src-{}", id),
            first_name: first.to_string(),
            last_name: last.to_string(),
            sex: String::new(),
            race: String::new(),
            birth_date: birth.to_string(),
            death_date: String::new(),
            social_security_number: String::new(),
            address: String::new(),
            city: String::new(),
            state: String::new(),
            zip_code: String::new(),
            county: String::new(),
            phone: String::new(),
        }
    }

    #[test]
    fn exact_linker_pairs_agreeing_records() {
        let records = vec![
            frame_row(1, 1, "Ann", "Lee", "1980-01-01"),
            frame_row(2, 2, "ann", "lee", "1980-01-01"),
            frame_row(3, 2, "Bob", "Ray", "1975-05-05"),
        ];
        let pairs = ExactMatchLinker.predict(&records, &json!({})).unwrap();

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].person_record_l_id, 1);
        assert_eq!(pairs[0].person_record_r_id, 2);
        assert!(pairs[0].match_probability > 0.8);
    }

    #[test]
    fn exact_linker_skips_pairs_outside_current_job() {
        // Both records predate the newest job; they were compared before.
        let records = vec![
            frame_row(1, 1, "Ann", "Lee", "1980-01-01"),
            frame_row(2, 1, "Ann", "Lee", "1980-01-01"),
            frame_row(3, 2, "Cy", "Dae", "1990-02-02"),
        ];
        let pairs = ExactMatchLinker.predict(&records, &json!({})).unwrap();
        assert!(pairs.is_empty());
    }

    #[test]
    fn exact_linker_ignores_blank_keys() {
        let records = vec![
            frame_row(1, 1, "", "Lee", "1980-01-01"),
            frame_row(2, 1, "", "Lee", "1980-01-01"),
        ];
        let pairs = ExactMatchLinker.predict(&records, &json!({})).unwrap();
        assert!(pairs.is_empty());
    }

    #[test]
    fn blocking_rules_are_split_per_side() {
        let settings = json!({
            "blocking_rules_to_generate_predictions": [
                {"blocking_rule": "l.last_name = r.last_name"},
                "l.phone = r.phone",
            ],
        });

        let scoped = job_scoped_settings(&settings, 42).unwrap();
        let rules = scoped["blocking_rules_to_generate_predictions"]
            .as_array()
            .unwrap();

        assert_eq!(rules.len(), 4);
        assert_eq!(
            rules[0]["blocking_rule"],
            "(l.last_name = r.last_name) and l.job_id = 42"
        );
        assert_eq!(
            rules[1]["blocking_rule"],
            "(l.last_name = r.last_name) and r.job_id = 42"
        );
        assert_eq!(rules[2]["blocking_rule"], "(l.phone = r.phone) and l.job_id = 42");
        assert_eq!(rules[3]["blocking_rule"], "(l.phone = r.phone) and r.job_id = 42");
    }

    #[test]
    fn overrides_pin_output_shape() {
        let settings = json!({
            "blocking_rules_to_generate_predictions": ["l.phone = r.phone"],
            "link_type": "link_and_dedupe",
            "comparisons": [{"output_column_name": "phone"}],
        });

        let scoped = job_scoped_settings(&settings, 7).unwrap();

        assert_eq!(scoped["link_type"], "dedupe_only");
        assert_eq!(scoped["unique_id_column_name"], "id");
        assert_eq!(scoped["bayes_factor_column_prefix"], "bf_");
        assert_eq!(scoped["term_frequency_adjustment_column_prefix"], "tf_");
        assert_eq!(scoped["comparison_vector_value_column_prefix"], "gamma_");
        // Untouched settings pass through.
        assert_eq!(scoped["comparisons"][0]["output_column_name"], "phone");
    }

    #[test]
    fn missing_rules_are_rejected() {
        let settings = json!({"link_type": "dedupe_only"});
        assert!(job_scoped_settings(&settings, 1).is_err());
    }

    #[test]
    fn empty_rule_sql_is_rejected() {
        let settings = json!({
            "blocking_rules_to_generate_predictions": [{"sql_dialect": "duckdb"}],
        });
        assert!(job_scoped_settings(&settings, 1).is_err());
    }
}
