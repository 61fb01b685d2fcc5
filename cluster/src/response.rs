//! The InfluxDB 1.x query response JSON model and the statement-specific
//! merge reducers used by the fan-out executor.
//!
//! Reducers operate on `results[0].series` of each backend body, the way the
//! upstream database lays out single-statement responses. Entries belonging
//! to the proxy's own statistics measurement are filtered so they do not
//! leak into client-visible listings.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use crate::STATISTICS_MEASUREMENT;

/// One series of a statement result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Vec<Value>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

/// A user-facing message attached to a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub level: String,
    pub text: String,
}

/// The resultset of a single statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementResult {
    #[serde(default)]
    pub statement_id: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub series: Vec<Row>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A whole `/query` response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub results: Vec<StatementResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Extracts `results[0].series` from a backend response body.
pub fn series_from_response_bytes(body: &[u8]) -> Result<Vec<Row>, serde_json::Error> {
    let response: Response = serde_json::from_slice(body)?;
    Ok(response
        .results
        .into_iter()
        .next()
        .map(|r| r.series)
        .unwrap_or_default())
}

/// Extracts all statement results from a backend response body.
pub fn results_from_response_bytes(
    body: &[u8],
) -> Result<Vec<StatementResult>, serde_json::Error> {
    let response: Response = serde_json::from_slice(body)?;
    Ok(response.results)
}

/// Serializes a merged series list as a single-statement response.
pub fn response_from_series(series: Vec<Row>, error: Option<String>) -> Bytes {
    response_from_results(
        vec![StatementResult {
            series,
            ..Default::default()
        }],
        error,
    )
}

/// Serializes merged statement results, with the optional top-level error.
pub fn response_from_results(results: Vec<StatementResult>, error: Option<String>) -> Bytes {
    let response = Response { results, error };
    let mut body = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
    body.push(b'\n');
    Bytes::from(body)
}

/// True for rows describing the proxy's own statistics measurement, which
/// never belong in merged listings.
fn is_statistics_entry(value: &Value) -> bool {
    value.as_str().is_some_and(|s| {
        s == STATISTICS_MEASUREMENT || s.starts_with(&format!("{STATISTICS_MEASUREMENT},"))
    })
}

/// Merge rule for `SHOW MEASUREMENTS` / `SHOW SERIES` / `SHOW DATABASES`:
/// union of the first-column values, de-duplicated in arrival order.
pub fn reduce_by_values(bodies: &[Bytes]) -> Result<Vec<Row>, serde_json::Error> {
    let mut merged: Option<Row> = None;
    let mut seen = HashSet::new();
    let mut values = Vec::new();
    for body in bodies {
        let Some(row) = series_from_response_bytes(body)?.into_iter().next() else {
            continue;
        };
        for value in &row.values {
            let Some(first) = value.first() else { continue };
            if is_statistics_entry(first) {
                continue;
            }
            let key = first.to_string();
            if seen.insert(key) {
                values.push(value.clone());
            }
        }
        merged.get_or_insert(row);
    }
    Ok(match merged {
        Some(mut row) => {
            row.values = values;
            vec![row]
        }
        None => vec![],
    })
}

/// Merge rule for `SHOW FIELD KEYS` / `SHOW TAG KEYS` / `SHOW TAG VALUES`:
/// union of series keyed by series name.
pub fn reduce_by_series(bodies: &[Bytes]) -> Result<Vec<Row>, serde_json::Error> {
    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for body in bodies {
        for row in series_from_response_bytes(body)? {
            if row.name == STATISTICS_MEASUREMENT {
                continue;
            }
            if seen.insert(row.name.clone()) {
                rows.push(row);
            }
        }
    }
    Ok(rows)
}

/// Merge rule for `SHOW RETENTION POLICIES`: plain concatenation of the
/// single series' values.
pub fn concat_by_values(bodies: &[Bytes]) -> Result<Vec<Row>, serde_json::Error> {
    let mut merged: Option<Row> = None;
    let mut values = Vec::new();
    for body in bodies {
        let Some(row) = series_from_response_bytes(body)?.into_iter().next() else {
            continue;
        };
        values.extend(row.values.iter().cloned());
        merged.get_or_insert(row);
    }
    Ok(match merged {
        Some(mut row) => {
            row.values = values;
            vec![row]
        }
        None => vec![],
    })
}

/// Merge rule for `SHOW STATS`: concatenation of per-backend result objects.
pub fn concat_by_results(bodies: &[Bytes]) -> Result<Vec<StatementResult>, serde_json::Error> {
    let mut results = Vec::new();
    for body in bodies {
        results.extend(results_from_response_bytes(body)?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(values: serde_json::Value) -> Bytes {
        Bytes::from(
            json!({
                "results": [{
                    "statement_id": 0,
                    "series": [{
                        "name": "measurements",
                        "columns": ["name"],
                        "values": values,
                    }],
                }],
            })
            .to_string(),
        )
    }

    #[test]
    fn round_trips_error_fields() {
        let raw = br#"{"results":[{"statement_id":0,"error":"shard gone"}],"error":"partial"}"#;
        let response: Response = serde_json::from_slice(raw).unwrap();
        assert_eq!(response.error.as_deref(), Some("partial"));
        assert_eq!(response.results[0].error.as_deref(), Some("shard gone"));
        let encoded = serde_json::to_string(&response).unwrap();
        let again: Response = serde_json::from_str(&encoded).unwrap();
        assert_eq!(response, again);
    }

    #[test]
    fn reduce_by_values_unions_and_filters() {
        let bodies = vec![
            body(json!([["cpu"], ["mem"], [STATISTICS_MEASUREMENT]])),
            body(json!([["cpu"], ["disk"]])),
        ];
        let rows = reduce_by_values(&bodies).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "measurements");
        assert_eq!(
            rows[0].values,
            vec![
                vec![json!("cpu")],
                vec![json!("mem")],
                vec![json!("disk")]
            ]
        );
    }

    #[test]
    fn reduce_by_values_filters_statistics_series_keys() {
        let series_key = format!("{STATISTICS_MEASUREMENT},host=h1");
        let bodies = vec![body(json!([["cpu,host=h1"], [series_key]]))];
        let rows = reduce_by_values(&bodies).unwrap();
        assert_eq!(rows[0].values, vec![vec![json!("cpu,host=h1")]]);
    }

    #[test]
    fn reduce_by_values_handles_empty_inputs() {
        let empty = Bytes::from(r#"{"results":[{"statement_id":0}]}"#);
        let rows = reduce_by_values(&[empty]).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn reduce_by_series_unions_by_name() {
        let series = |name: &str| {
            Bytes::from(
                json!({
                    "results": [{
                        "statement_id": 0,
                        "series": [
                            {"name": name, "columns": ["fieldKey"], "values": [["v"]]},
                            {"name": STATISTICS_MEASUREMENT, "columns": ["fieldKey"], "values": [["statQueryRequest"]]},
                        ],
                    }],
                })
                .to_string(),
            )
        };
        let rows = reduce_by_series(&[series("cpu"), series("cpu"), series("mem")]).unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["cpu", "mem"]);
    }

    #[test]
    fn concat_by_values_keeps_duplicates() {
        let bodies = vec![body(json!([["autogen"]])), body(json!([["autogen"]]))];
        let rows = concat_by_values(&bodies).unwrap();
        assert_eq!(rows[0].values.len(), 2);
    }

    #[test]
    fn concat_by_results_concatenates() {
        let one = Bytes::from(r#"{"results":[{"statement_id":0}]}"#);
        let results = concat_by_results(&[one.clone(), one]).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(reduce_by_values(&[Bytes::from_static(b"not json")]).is_err());
    }
}
