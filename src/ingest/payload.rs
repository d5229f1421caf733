use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

/// Decoded device payload before it is bound to a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    pub values: Vec<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct BorrowedReading<'a> {
    #[serde(default, borrow)]
    timestamp: Option<BorrowedTimestamp<'a>>,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    values: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BorrowedTimestamp<'a> {
    Str(&'a str),
    Int(i64),
    Float(f64),
}

impl<'a> BorrowedTimestamp<'a> {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            BorrowedTimestamp::Str(s) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            BorrowedTimestamp::Int(ms) => millis_to_dt(*ms),
            BorrowedTimestamp::Float(ms) => millis_to_dt(*ms as i64),
        }
    }
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Maps `balluff/cmtk/<master>/iolink/devices/<port>/data/fromdevice` to
/// `<master>/<port>`. Other topics are used verbatim.
pub fn channel_id_from_topic(topic: &str) -> String {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 8
        && parts[3] == "iolink"
        && parts[4] == "devices"
        && parts[6] == "data"
        && parts[7] == "fromdevice"
    {
        return format!("{}/{}", parts[2], parts[5]);
    }
    topic.to_string()
}

/// Decodes `{"value": n}` or `{"values": [..]}` with an optional
/// `timestamp` (RFC 3339 or epoch millis). Non-finite values are rejected.
pub fn decode_payload(payload: &mut [u8]) -> Result<DecodedPayload, String> {
    if payload.is_empty() {
        return Err("empty payload".to_string());
    }
    let reading: BorrowedReading =
        simd_json::serde::from_slice(payload).map_err(|err| err.to_string())?;

    let values = match (reading.values, reading.value) {
        (Some(values), _) if !values.is_empty() => values,
        (_, Some(value)) => vec![value],
        _ => return Err("payload carries no value".to_string()),
    };
    if values.iter().any(|value| !value.is_finite()) {
        return Err("non-finite value".to_string());
    }

    let timestamp = match &reading.timestamp {
        Some(raw) => Some(
            raw.to_datetime()
                .ok_or_else(|| "unparseable timestamp".to_string())?,
        ),
        None => None,
    };

    Ok(DecodedPayload { values, timestamp })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iolink_topics_map_to_master_port_ids() {
        assert_eq!(
            channel_id_from_topic("balluff/cmtk/master2/iolink/devices/port0/data/fromdevice"),
            "master2/port0"
        );
        assert_eq!(channel_id_from_topic("master1/port3"), "master1/port3");
        assert_eq!(
            channel_id_from_topic("balluff/cmtk/master2/iolink/devices/port0/data/todevice"),
            "balluff/cmtk/master2/iolink/devices/port0/data/todevice"
        );
    }

    #[test]
    fn decodes_scalar_and_vector_payloads() {
        let mut raw = br#"{"value": 12.5, "timestamp": "2026-03-02T06:00:04Z"}"#.to_vec();
        let decoded = decode_payload(&mut raw).unwrap();
        assert_eq!(decoded.values, vec![12.5]);
        assert_eq!(
            decoded.timestamp,
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 4).unwrap())
        );

        let mut raw = br#"{"values": [500, 320], "timestamp": 1772431204000}"#.to_vec();
        let decoded = decode_payload(&mut raw).unwrap();
        assert_eq!(decoded.values, vec![500.0, 320.0]);
        assert_eq!(
            decoded.timestamp.map(|ts| ts.timestamp_millis()),
            Some(1_772_431_204_000)
        );
    }

    #[test]
    fn missing_timestamp_is_left_to_the_caller() {
        let mut raw = br#"{"value": 3}"#.to_vec();
        assert_eq!(decode_payload(&mut raw).unwrap().timestamp, None);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        for raw in [
            &b""[..],
            br#"{"value": "abc"}"#,
            br#"{"quality": 1}"#,
            br#"{"values": []}"#,
            br#"{"value": 1, "timestamp": "yesterday"}"#,
            b"not json",
        ] {
            let mut raw = raw.to_vec();
            assert!(decode_payload(&mut raw).is_err(), "{:?}", String::from_utf8_lossy(&raw));
        }
    }
}
