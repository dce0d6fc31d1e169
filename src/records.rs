use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::warn;

/// Wrapper keys under which some detector exports nest their frame list.
const WRAPPER_KEYS: [&str; 6] = ["frames", "data", "records", "annotations", "items", "results"];

/// Field names a frame record may use for its frame index.
const FRAME_ID_KEYS: [&str; 6] = ["frame_id", "frame", "fid", "index", "idx", "image_id"];

/// Recognized container shapes for a per-frame record stream, tried in
/// priority order. Upstream exporters are not consistent about this, so the
/// parse is tagged instead of guessed ad hoc.
#[derive(Debug)]
pub enum RecordStream {
    /// Top-level JSON array of records.
    List(Vec<Value>),
    /// Object with a known wrapper key holding the array.
    Wrapped(&'static str, Vec<Value>),
    /// Object keyed by numeric frame index; the key becomes `frame_id` when
    /// the record itself lacks one.
    Keyed(Vec<(i64, Value)>),
    /// A single bare record object.
    Single(Value),
    /// Newline-delimited JSON, malformed lines dropped.
    LineDelimited(Vec<Value>),
}

impl RecordStream {
    /// Flatten into records in source order.
    pub fn into_records(self) -> Vec<Value> {
        match self {
            RecordStream::List(records)
            | RecordStream::Wrapped(_, records)
            | RecordStream::LineDelimited(records) => records,
            RecordStream::Single(record) => vec![record],
            RecordStream::Keyed(entries) => entries
                .into_iter()
                .map(|(fid, mut record)| {
                    if let Value::Object(map) = &mut record {
                        map.entry("frame_id").or_insert_with(|| Value::from(fid));
                    }
                    record
                })
                .collect(),
        }
    }
}

fn is_record(value: &Value) -> bool {
    value.is_object() || value.is_array()
}

/// Parse a document into one of the known stream shapes.
pub fn parse_document(text: &str) -> RecordStream {
    let text = text.trim();
    if text.is_empty() {
        return RecordStream::List(Vec::new());
    }

    if let Ok(data) = serde_json::from_str::<Value>(text) {
        match data {
            Value::Array(items) => {
                return RecordStream::List(items.into_iter().filter(is_record).collect());
            }
            Value::Object(map) => {
                for key in WRAPPER_KEYS {
                    if let Some(Value::Array(items)) = map.get(key) {
                        let records: Vec<Value> =
                            items.iter().filter(|v| is_record(v)).cloned().collect();
                        return RecordStream::Wrapped(key, records);
                    }
                }
                let mut keyed: Vec<(i64, Value)> = map
                    .iter()
                    .filter_map(|(k, v)| {
                        let fid = k.parse::<i64>().ok()?;
                        v.is_object().then(|| (fid, v.clone()))
                    })
                    .collect();
                if !keyed.is_empty() {
                    keyed.sort_by_key(|(fid, _)| *fid);
                    return RecordStream::Keyed(keyed);
                }
                return RecordStream::Single(Value::Object(map));
            }
            _ => {}
        }
    }

    // Whole-document parse failed: treat as JSON lines, skipping bad ones.
    let mut records = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => records.push(value),
            Err(err) => warn!(line = line_no + 1, %err, "skipping malformed record line"),
        }
    }
    RecordStream::LineDelimited(records)
}

/// Frame index of a record, if it carries one explicitly.
pub fn frame_id(record: &Value) -> Option<i64> {
    let map = record.as_object()?;
    for key in FRAME_ID_KEYS {
        if let Some(value) = map.get(key) {
            if let Some(fid) = value.as_i64() {
                return Some(fid);
            }
            if let Some(fid) = value.as_str().and_then(|s| s.parse::<i64>().ok()) {
                return Some(fid);
            }
        }
    }
    None
}

fn has_json_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json") || e.eq_ignore_ascii_case("jsonl"))
        .unwrap_or(false)
}

/// Non-recursive listing of .json/.jsonl files in a directory, sorted.
pub fn list_json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && has_json_extension(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Recursive listing of .json/.jsonl files under a root, sorted.
pub fn list_json_files_recursive(root: &Path) -> Result<Vec<PathBuf>> {
    fn walk(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
        for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
            let path = entry?.path();
            if path.is_dir() {
                walk(&path, files)?;
            } else if has_json_extension(&path) {
                files.push(path);
            }
        }
        Ok(())
    }
    let mut files = Vec::new();
    walk(root, &mut files)?;
    files.sort();
    Ok(files)
}

/// Read all records from a file, or from every JSON file in a directory.
pub fn read_records(path: &Path) -> Result<Vec<Value>> {
    let files = if path.is_dir() {
        list_json_files(path)?
    } else {
        vec![path.to_path_buf()]
    };
    let mut records = Vec::new();
    for file in files {
        let text = fs::read_to_string(&file)
            .with_context(|| format!("reading {}", file.display()))?;
        records.extend(parse_document(&text).into_records());
    }
    Ok(records)
}

/// Build a frame-indexed mapping from a record stream. Records with an
/// explicit frame id keep it; the rest get their in-file ordinal. When
/// `expected_type` is set, records carrying a different `type` tag are
/// skipped (pose and object streams are sometimes interleaved in one file).
pub fn load_sequence(path: &Path, expected_type: Option<&str>) -> Result<BTreeMap<i64, Value>> {
    let mut frames = BTreeMap::new();
    for (idx, record) in read_records(path)?.into_iter().enumerate() {
        if let (Some(expected), Some(tag)) = (expected_type, record.get("type")) {
            if tag.as_str().map(|t| t != expected).unwrap_or(false) {
                continue;
            }
        }
        let fid = frame_id(&record).unwrap_or(idx as i64);
        frames.insert(fid, record);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_shape() {
        let stream = parse_document(r#"[{"frame_id": 0}, {"frame_id": 1}]"#);
        assert!(matches!(stream, RecordStream::List(_)));
        assert_eq!(stream.into_records().len(), 2);
    }

    #[test]
    fn test_parse_wrapped_shape() {
        let stream = parse_document(r#"{"frames": [{"a": 1}, {"a": 2}], "meta": "x"}"#);
        match &stream {
            RecordStream::Wrapped(key, records) => {
                assert_eq!(*key, "frames");
                assert_eq!(records.len(), 2);
            }
            other => panic!("expected Wrapped, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_keyed_shape_injects_frame_id() {
        let stream = parse_document(r#"{"3": {"boxes": []}, "1": {"boxes": []}}"#);
        let records = match stream {
            RecordStream::Keyed(_) => stream.into_records(),
            other => panic!("expected Keyed, got {other:?}"),
        };
        assert_eq!(frame_id(&records[0]), Some(1));
        assert_eq!(frame_id(&records[1]), Some(3));
    }

    #[test]
    fn test_parse_line_delimited_skips_malformed() {
        let stream = parse_document("{\"frame_id\": 0}\nnot json\n{\"frame_id\": 2}");
        let records = stream.into_records();
        assert_eq!(records.len(), 2);
        assert_eq!(frame_id(&records[1]), Some(2));
    }

    #[test]
    fn test_single_object_falls_back_to_single() {
        let stream = parse_document(r#"{"boxes": [[0, 0, 1, 1]]}"#);
        assert!(matches!(stream, RecordStream::Single(_)));
        assert_eq!(stream.into_records().len(), 1);
    }

    #[test]
    fn test_frame_id_variants() {
        assert_eq!(frame_id(&serde_json::json!({"frame": 7})), Some(7));
        assert_eq!(frame_id(&serde_json::json!({"image_id": "12"})), Some(12));
        assert_eq!(frame_id(&serde_json::json!({"other": 1})), None);
    }
}
