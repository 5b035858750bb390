/// Utility functions and helpers
use chrono::{DateTime, TimeZone, Utc};
use mongodb::bson::{Bson, Document};
use std::time::{SystemTime, UNIX_EPOCH};

/// Generate a unique ID based on timestamp and random component
pub fn generate_id(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();

    let random: u32 = rand::random();
    format!("{}_{}_{:x}", prefix, timestamp, random)
}

/// Read an int32, int64 or double field as `f64`
pub fn bson_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

/// Numeric field of a command reply, 0 when absent
pub fn number_field(document: &Document, key: &str) -> f64 {
    document.get(key).and_then(bson_number).unwrap_or(0.0)
}

/// Convert a BSON datetime to chrono
pub fn bson_datetime(value: &Bson) -> Option<DateTime<Utc>> {
    match value {
        Bson::DateTime(dt) => Utc.timestamp_millis_opt(dt.timestamp_millis()).single(),
        _ => None,
    }
}

/// Bytes to megabytes, rounded to two decimals
pub fn bytes_to_mb(bytes: f64) -> f64 {
    (bytes / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

/// Format duration for human-readable output
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn test_format_duration() {
        use std::time::Duration;

        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h1m1s");
    }

    #[test]
    fn test_generate_id() {
        let id1 = generate_id("replication_test");
        let id2 = generate_id("replication_test");

        assert!(id1.starts_with("replication_test_"));
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_number_fields() {
        let reply = doc! { "a": 3i32, "b": 4i64, "c": 1.5, "d": "x" };
        assert_eq!(number_field(&reply, "a"), 3.0);
        assert_eq!(number_field(&reply, "b"), 4.0);
        assert_eq!(number_field(&reply, "c"), 1.5);
        assert_eq!(number_field(&reply, "d"), 0.0);
        assert_eq!(number_field(&reply, "missing"), 0.0);
    }

    #[test]
    fn test_bson_datetime() {
        let value = Bson::DateTime(mongodb::bson::DateTime::from_millis(1_700_000_000_000));
        let converted = bson_datetime(&value).unwrap();
        assert_eq!(converted.timestamp_millis(), 1_700_000_000_000);
        assert!(bson_datetime(&Bson::Null).is_none());
    }

    #[test]
    fn test_bytes_to_mb() {
        assert_eq!(bytes_to_mb(1048576.0), 1.0);
        assert_eq!(bytes_to_mb(1572864.0), 1.5);
        assert_eq!(bytes_to_mb(0.0), 0.0);
    }
}
