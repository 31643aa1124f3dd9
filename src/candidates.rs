//! Load candidate records from files.
//!
//! - `.json`: an array of objects with `artist` and `title`. Every other key
//!   is kept as source metadata.
//! - anything else is read as CSV with a header row containing `Artist` and
//!   `Title` (case-insensitive). Other columns become source metadata.
//!
//! Rows with a blank artist or title are skipped with a warning.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::models::CandidateRecord;

pub fn load_candidates(path: &Path) -> Result<Vec<CandidateRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read candidates file: {}", path.display()))?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let records = if is_json {
        parse_json(&content)
    } else {
        parse_csv(&content)
    }
    .with_context(|| format!("Failed to parse candidates file: {}", path.display()))?;

    info!(count = records.len(), path = %path.display(), "loaded candidates");
    Ok(records)
}

pub fn parse_csv(content: &str) -> Result<Vec<CandidateRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers = reader.headers()?.clone();
    let find = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
    let (Some(artist_col), Some(title_col)) = (find("artist"), find("title")) else {
        bail!("CSV header must contain Artist and Title columns");
    };

    let mut records = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let record =
            result.with_context(|| format!("CSV parse error at row {}", row_idx + 2))?;
        let artist = record.get(artist_col).unwrap_or_default();
        let title = record.get(title_col).unwrap_or_default();
        if artist.is_empty() || title.is_empty() {
            warn!(row = row_idx + 2, "skipping row without artist or title");
            continue;
        }

        let mut metadata = Map::new();
        for (col, value) in record.iter().enumerate() {
            if col == artist_col || col == title_col {
                continue;
            }
            if let Some(name) = headers.get(col) {
                metadata.insert(name.to_string(), Value::String(value.to_string()));
            }
        }
        let metadata = if metadata.is_empty() {
            Value::Null
        } else {
            Value::Object(metadata)
        };
        records.push(CandidateRecord::new(artist, title).with_metadata(metadata));
    }
    Ok(records)
}

pub fn parse_json(content: &str) -> Result<Vec<CandidateRecord>> {
    let value: Value = serde_json::from_str(content)?;
    let Some(items) = value.as_array() else {
        bail!("expected a JSON array of candidate objects");
    };

    let mut records = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            bail!("candidate {} is not an object", idx);
        };
        let text = |key: &str| {
            obj.get(key)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .unwrap_or_default()
        };
        let (artist, title) = (text("artist"), text("title"));
        if artist.is_empty() || title.is_empty() {
            warn!(index = idx, "skipping candidate without artist or title");
            continue;
        }

        let metadata: Map<String, Value> = obj
            .iter()
            .filter(|(k, _)| k.as_str() != "artist" && k.as_str() != "title")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let metadata = if metadata.is_empty() {
            Value::Null
        } else {
            Value::Object(metadata)
        };
        records.push(CandidateRecord::new(artist, title).with_metadata(metadata));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn csv_with_extra_columns() {
        let rows = parse_csv("Artist,Title,Show\nBladee,Be Nice 2 Me,Ep 12\n ,Missing,Ep 13\n")
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].artist, "Bladee");
        assert_eq!(rows[0].title, "Be Nice 2 Me");
        assert_eq!(rows[0].source_metadata, json!({"Show": "Ep 12"}));
    }

    #[test]
    fn csv_headers_are_case_insensitive() {
        let rows = parse_csv("title,artist\nHalo,Beyoncé\n").unwrap();
        assert_eq!(rows[0].artist, "Beyoncé");
        assert_eq!(rows[0].source_metadata, Value::Null);
    }

    #[test]
    fn csv_without_required_headers() {
        assert!(parse_csv("Name,Song\nA,B\n").is_err());
    }

    #[test]
    fn json_array() {
        let rows = parse_json(
            r#"[{"artist": "Bladee", "title": "Be Nice 2 Me", "played_at": "2024-01-01"},
                {"artist": "", "title": "x"}]"#,
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_metadata, json!({"played_at": "2024-01-01"}));
        assert!(parse_json(r#"{"artist": "a"}"#).is_err());
    }

    #[test]
    fn load_by_extension() {
        let tmp = TempDir::new().unwrap();
        let json_path = tmp.path().join("c.json");
        std::fs::write(&json_path, r#"[{"artist": "A", "title": "B"}]"#).unwrap();
        let csv_path = tmp.path().join("c.csv");
        std::fs::write(&csv_path, "Artist,Title\nA,B\nC,D\n").unwrap();

        assert_eq!(load_candidates(&json_path).unwrap().len(), 1);
        assert_eq!(load_candidates(&csv_path).unwrap().len(), 2);
        assert!(load_candidates(&tmp.path().join("absent.csv")).is_err());
    }
}
