//! Query engine
//!
//! Two query shapes over in-memory record lists:
//! - bins: tombstone exclusion, optional bounding box, offset/limit paging
//! - append logs: cursor paging by timestamp (`before` / `since`)
//!
//! The remote backend pushes the bin query down as a [`Filter`]; these
//! functions are the in-memory path and the fallback when that query fails.
//!
//! [`Filter`]: crate::backend::document::Filter

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{record_key, Record};

pub const DEFAULT_BIN_LIMIT: usize = 5_000;
pub const MAX_BIN_LIMIT: usize = 10_000;
pub const DEFAULT_LOG_LIMIT: usize = 50;
pub const MAX_LOG_LIMIT: usize = 100;

/// `[minLng, minLat, maxLng, maxLat]`, inclusive on every edge
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lng: f64, min_lat: f64, max_lng: f64, max_lat: f64) -> Self {
        Self {
            min_lng,
            min_lat,
            max_lng,
            max_lat,
        }
    }

    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lng >= self.min_lng && lng <= self.max_lng
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from(b: [f64; 4]) -> Self {
        Self::new(b[0], b[1], b[2], b[3])
    }
}

impl FromStr for BoundingBox {
    type Err = String;

    /// Parse `minLng,minLat,maxLng,maxLat`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid bounding box '{}': {}", s, e))?;
        match parts.as_slice() {
            [a, b, c, d] => Ok(Self::new(*a, *b, *c, *d)),
            _ => Err(format!(
                "invalid bounding box '{}': expected minLng,minLat,maxLng,maxLat",
                s
            )),
        }
    }
}

/// Bin listing options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BinQuery {
    pub bbox: Option<BoundingBox>,
    /// Clamped to `[1, MAX_BIN_LIMIT]`, default `DEFAULT_BIN_LIMIT`
    pub limit: Option<usize>,
    pub offset: usize,
}

impl BinQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_BIN_LIMIT)
            .clamp(1, MAX_BIN_LIMIT)
    }
}

/// One page of bins
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BinPage {
    pub bins: Vec<Record>,
    /// Matches after filtering, before paging
    pub total: usize,
}

/// `(lat, lng)` of a bin, from its top-level numeric fields
pub fn bin_coordinates(bin: &Record) -> Option<(f64, f64)> {
    let lat = bin.get("lat").and_then(Value::as_f64)?;
    let lng = bin.get("lng").and_then(Value::as_f64)?;
    Some((lat, lng))
}

/// Whether a bin survives tombstones and the bounding box
pub fn bin_matches(bin: &Record, deleted: &HashSet<String>, bbox: Option<&BoundingBox>) -> bool {
    if record_key(bin, "id").is_some_and(|id| deleted.contains(&id)) {
        return false;
    }
    match bbox {
        Some(bbox) => bin_coordinates(bin).is_some_and(|(lat, lng)| bbox.contains(lat, lng)),
        None => true,
    }
}

/// Filter and page bins held in memory
pub fn page_bins(bins: &[Record], deleted: &HashSet<String>, query: &BinQuery) -> BinPage {
    let matching: Vec<&Record> = bins
        .iter()
        .filter(|bin| bin_matches(bin, deleted, query.bbox.as_ref()))
        .collect();

    BinPage {
        total: matching.len(),
        bins: matching
            .into_iter()
            .skip(query.offset)
            .take(query.effective_limit())
            .cloned()
            .collect(),
    }
}

/// Cursor options for append logs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorQuery {
    /// Clamped to `[1, MAX_LOG_LIMIT]`, default `DEFAULT_LOG_LIMIT`
    pub limit: Option<usize>,
    /// Entries strictly older than this, newest first
    pub before: Option<DateTime<Utc>>,
    /// Entries strictly newer than this; wins over `before`
    pub since: Option<DateTime<Utc>>,
}

impl CursorQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LOG_LIMIT)
            .clamp(1, MAX_LOG_LIMIT)
    }
}

/// One page of a log
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    pub entries: Vec<Value>,
    pub has_more: bool,
    /// Timestamp of the oldest entry returned
    pub next_before: Option<DateTime<Utc>>,
}

/// Timestamp of a log entry: RFC 3339 string or epoch milliseconds
pub fn entry_timestamp(entry: &Value) -> Option<DateTime<Utc>> {
    match entry.get("timestamp")? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Page through a log by timestamp cursor
///
/// - `since`: everything newer, capped to the newest `limit`, oldest first;
///   `has_more` is always false
/// - `before`: up to `limit` older entries, newest first
/// - neither: the newest `limit` entries, oldest first
///
/// Entries without a timestamp sort as the oldest.
pub fn page_log(entries: &[Value], query: &CursorQuery) -> LogPage {
    let limit = query.effective_limit();

    let mut sorted: Vec<(DateTime<Utc>, &Value)> = entries
        .iter()
        .map(|e| (entry_timestamp(e).unwrap_or(DateTime::<Utc>::MIN_UTC), e))
        .collect();
    sorted.sort_by_key(|(ts, _)| *ts);

    let newest = |list: Vec<(DateTime<Utc>, &Value)>| -> Vec<Value> {
        let start = list.len().saturating_sub(limit);
        list[start..].iter().map(|(_, e)| (*e).clone()).collect()
    };

    let (entries, has_more) = if let Some(since) = query.since {
        let newer: Vec<_> = sorted.into_iter().filter(|(ts, _)| *ts > since).collect();
        (newest(newer), false)
    } else if let Some(before) = query.before {
        let older: Vec<_> = sorted.into_iter().filter(|(ts, _)| *ts < before).collect();
        let has_more = older.len() > limit;
        let mut page = newest(older);
        page.reverse();
        (page, has_more)
    } else {
        let has_more = sorted.len() > limit;
        (newest(sorted), has_more)
    };

    let oldest = if query.since.is_none() && query.before.is_some() {
        entries.last()
    } else {
        entries.first()
    };

    LogPage {
        next_before: oldest.and_then(entry_timestamp),
        entries,
        has_more,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn bin(id: &str, lat: f64, lng: f64) -> Record {
        json!({"id": id, "lat": lat, "lng": lng}).as_object().unwrap().clone()
    }

    fn log(n: i64) -> (DateTime<Utc>, Vec<Value>) {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let entries = (0..n)
            .map(|i| {
                json!({
                    "id": format!("m{}", i),
                    "timestamp": (base + Duration::seconds(i)).to_rfc3339()
                })
            })
            .collect();
        (base, entries)
    }

    fn ids(page: &LogPage) -> Vec<String> {
        page.entries
            .iter()
            .map(|e| e["id"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_bin_limit_clamping() {
        assert_eq!(BinQuery::default().effective_limit(), 5_000);
        assert_eq!(BinQuery { limit: Some(0), ..Default::default() }.effective_limit(), 1);
        assert_eq!(BinQuery { limit: Some(50_000), ..Default::default() }.effective_limit(), 10_000);
    }

    #[test]
    fn test_parse_bounding_box() {
        let bbox: BoundingBox = "55.1, 25.0, 55.4, 25.3".parse().unwrap();
        assert_eq!(bbox, BoundingBox::new(55.1, 25.0, 55.4, 25.3));

        assert!("1,2,3".parse::<BoundingBox>().is_err());
        assert!("a,b,c,d".parse::<BoundingBox>().is_err());
    }

    #[test]
    fn test_page_bins_bbox_and_tombstones() {
        let bins = vec![
            bin("in-1", 25.1, 55.2),
            bin("out", 30.0, 55.2),
            bin("in-2", 25.2, 55.3),
            bin("gone", 25.1, 55.2),
            json!({"id": "nowhere"}).as_object().unwrap().clone(),
        ];
        let deleted: HashSet<String> = ["gone".to_string()].into();
        let query = BinQuery {
            bbox: Some(BoundingBox::new(55.0, 25.0, 55.5, 25.5)),
            ..Default::default()
        };

        let page = page_bins(&bins, &deleted, &query);
        assert_eq!(page.total, 2);
        assert_eq!(page.bins[0]["id"], "in-1");
        assert_eq!(page.bins[1]["id"], "in-2");

        let all = page_bins(&bins, &deleted, &BinQuery::default());
        assert_eq!(all.total, 4);
    }

    #[test]
    fn test_page_bins_offset_and_total() {
        let bins: Vec<Record> = (0..10).map(|i| bin(&format!("b{}", i), 0.0, 0.0)).collect();
        let query = BinQuery {
            limit: Some(3),
            offset: 8,
            ..Default::default()
        };

        let page = page_bins(&bins, &HashSet::new(), &query);
        assert_eq!(page.total, 10);
        assert_eq!(page.bins.len(), 2);
        assert_eq!(page.bins[0]["id"], "b8");
    }

    #[test]
    fn test_coordinates_must_be_numeric() {
        let text = json!({"id": "t", "lat": "1.5", "lng": 2.5});
        assert_eq!(bin_coordinates(text.as_object().unwrap()), None);

        let ok = json!({"id": "n", "lat": 1.5, "lng": 2});
        assert_eq!(bin_coordinates(ok.as_object().unwrap()), Some((1.5, 2.0)));
    }

    #[test]
    fn test_numeric_bin_ids_match_tombstones() {
        let bins = vec![json!({"id": 7, "lat": 0, "lng": 0}).as_object().unwrap().clone()];
        let deleted: HashSet<String> = ["7".to_string()].into();
        assert_eq!(page_bins(&bins, &deleted, &BinQuery::default()).total, 0);
    }

    #[test]
    fn test_entry_timestamp_formats() {
        let millis = json!({"timestamp": 1_700_000_000_000_i64});
        assert_eq!(
            entry_timestamp(&millis),
            Utc.timestamp_millis_opt(1_700_000_000_000).single()
        );
        assert!(entry_timestamp(&json!({"timestamp": "yesterday"})).is_none());
        assert!(entry_timestamp(&json!({})).is_none());
    }

    #[test]
    fn test_default_page_is_most_recent() {
        let (_, entries) = log(120);
        let page = page_log(&entries, &CursorQuery::default());

        assert_eq!(page.entries.len(), 50);
        assert!(page.has_more);
        assert_eq!(ids(&page)[0], "m70");
        assert_eq!(ids(&page)[49], "m119");
    }

    #[test]
    fn test_before_pagination_has_no_gaps() {
        let (_, entries) = log(120);
        let first = page_log(&entries, &CursorQuery::default());
        let second = page_log(
            &entries,
            &CursorQuery {
                before: first.next_before,
                ..Default::default()
            },
        );

        assert_eq!(second.entries.len(), 50);
        assert!(second.has_more);
        assert_eq!(ids(&second)[0], "m69");
        assert_eq!(ids(&second)[49], "m20");

        let mut seen: Vec<String> = ids(&first);
        seen.extend(ids(&second));
        seen.sort_by_key(|id| id[1..].parse::<u32>().unwrap());
        let expected: Vec<String> = (20..120).map(|i| format!("m{}", i)).collect();
        assert_eq!(seen, expected);

        let third = page_log(
            &entries,
            &CursorQuery {
                before: second.next_before,
                ..Default::default()
            },
        );
        assert_eq!(third.entries.len(), 20);
        assert!(!third.has_more);
    }

    #[test]
    fn test_since_returns_newer_only() {
        let (base, entries) = log(120);
        let page = page_log(
            &entries,
            &CursorQuery {
                since: Some(base + Duration::seconds(109)),
                ..Default::default()
            },
        );

        assert_eq!(ids(&page), (110..120).map(|i| format!("m{}", i)).collect::<Vec<_>>());
        assert!(!page.has_more);

        let capped = page_log(
            &entries,
            &CursorQuery {
                since: Some(base - Duration::seconds(1)),
                limit: Some(5),
                before: Some(base),
            },
        );
        assert_eq!(ids(&capped), vec!["m115", "m116", "m117", "m118", "m119"]);
        assert!(!capped.has_more);
    }

    #[test]
    fn test_log_limit_clamped() {
        let (_, entries) = log(300);
        let page = page_log(
            &entries,
            &CursorQuery {
                limit: Some(1_000),
                ..Default::default()
            },
        );
        assert_eq!(page.entries.len(), 100);
    }

    #[test]
    fn test_empty_log() {
        let page = page_log(&[], &CursorQuery::default());
        assert!(page.entries.is_empty());
        assert!(!page.has_more);
        assert!(page.next_before.is_none());
    }
}
