//! Coordinate records and their wire codec.
//!
//! The wire format is the JSON object produced by the devices:
//!
//! ```json
//! {"obuid": 42, "lat": 40.7128, "lon": -74.006}
//! ```
//!
//! Encoded records also carry `"ts"`, the time the bridge received the record
//! in milliseconds since the Unix epoch. Decoding accepts messages without it.
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Valid latitude range, in decimal degrees.
pub const LATITUDE_RANGE: std::ops::RangeInclusive<f64> = -90.0..=90.0;
/// Valid longitude range, in decimal degrees.
pub const LONGITUDE_RANGE: std::ops::RangeInclusive<f64> = -180.0..=180.0;

/// Identifier of the device (On-Board Unit) that produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub i64);

/// A validated GPS sample.
///
/// Instances can only be built through [`CoordinateRecord::new`] or
/// [`decode`], both of which enforce the coordinate ranges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateRecord {
    source_id: SourceId,
    latitude: f64,
    longitude: f64,
    received_at: SystemTime,
}

/// Why a message could not be decoded.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DecodeError {
    #[snafu(display("malformed message: {source}"))]
    Malformed { source: serde_json::Error },
    #[snafu(display("invalid field: {source}"))]
    InvalidField { source: serde_json::Error },
    #[snafu(display("latitude {value} outside of [-90, 90]"))]
    LatitudeOutOfRange { value: f64 },
    #[snafu(display("longitude {value} outside of [-180, 180]"))]
    LongitudeOutOfRange { value: f64 },
    #[snafu(display("timestamp {millis}ms is not representable"))]
    InvalidTimestamp { millis: u64 },
}

pub type Result<T, E = DecodeError> = std::result::Result<T, E>;

#[derive(Serialize, Deserialize)]
struct WireRecord {
    obuid: i64,
    lat: f64,
    lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ts: Option<u64>,
}

impl CoordinateRecord {
    /// Creates a record, validating the coordinates.
    ///
    /// `received_at` is truncated to millisecond precision, the resolution of
    /// the wire format.
    pub fn new(
        source_id: SourceId,
        latitude: f64,
        longitude: f64,
        received_at: SystemTime,
    ) -> Result<Self> {
        if !LATITUDE_RANGE.contains(&latitude) {
            return LatitudeOutOfRangeSnafu { value: latitude }.fail();
        }

        if !LONGITUDE_RANGE.contains(&longitude) {
            return LongitudeOutOfRangeSnafu { value: longitude }.fail();
        }

        Ok(Self {
            source_id,
            latitude,
            longitude,
            received_at: truncate_to_millis(received_at),
        })
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    /// The broker partitioning key: the decimal source id.
    pub fn key(&self) -> Vec<u8> {
        self.source_id.to_string().into_bytes()
    }
}

/// Decodes and validates a message received from a device.
pub fn decode(data: &[u8]) -> Result<CoordinateRecord> {
    let wire: WireRecord = serde_json::from_slice(data).map_err(|err| {
        if err.is_data() {
            DecodeError::InvalidField { source: err }
        } else {
            DecodeError::Malformed { source: err }
        }
    })?;

    let received_at = match wire.ts {
        None => SystemTime::now(),
        Some(millis) => SystemTime::UNIX_EPOCH
            .checked_add(Duration::from_millis(millis))
            .ok_or(DecodeError::InvalidTimestamp { millis })?,
    };

    CoordinateRecord::new(SourceId(wire.obuid), wire.lat, wire.lon, received_at)
}

/// Encodes a record for publishing.
pub fn encode(record: &CoordinateRecord) -> Bytes {
    let wire = WireRecord {
        obuid: record.source_id.0,
        lat: record.latitude,
        lon: record.longitude,
        ts: Some(unix_millis(record.received_at)),
    };

    // PANIC: a struct of integers and finite floats always serializes.
    let data = serde_json::to_vec(&wire).expect("coordinate record serialization");
    Bytes::from(data)
}

fn unix_millis(ts: SystemTime) -> u64 {
    ts.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn truncate_to_millis(ts: SystemTime) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_millis(unix_millis(ts))
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for CoordinateRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "OBUID={} Lat={:.2} Lon={:.2}",
            self.source_id, self.latitude, self.longitude
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(millis: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(millis)
    }

    #[test]
    fn test_round_trip() {
        let records = [
            CoordinateRecord::new(SourceId(42), 40.7128, -74.006, at(1_700_000_000_123)).unwrap(),
            CoordinateRecord::new(SourceId(-1), -90.0, 180.0, at(0)).unwrap(),
            CoordinateRecord::new(SourceId(i64::MAX), 0.1 + 0.2, -179.999_999_9, at(1)).unwrap(),
        ];

        for record in records {
            let decoded = decode(&encode(&record)).unwrap();
            assert_eq!(record, decoded);
        }
    }

    #[test]
    fn test_decode_device_wire_format() {
        let record = decode(br#"{"obuid": 7, "lat": 12.5, "lon": 99.25}"#).unwrap();
        assert_eq!(record.source_id(), SourceId(7));
        assert_eq!(record.latitude(), 12.5);
        assert_eq!(record.longitude(), 99.25);
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let record = decode(br#"{"obuid": 7, "lat": 1.0, "lon": 2.0, "speed": 88}"#).unwrap();
        assert_eq!(record.source_id(), SourceId(7));
    }

    #[test]
    fn test_decode_rejects_out_of_range() {
        let err = decode(br#"{"obuid": 1, "lat": 90.5, "lon": 0.0}"#).unwrap_err();
        assert!(matches!(err, DecodeError::LatitudeOutOfRange { .. }));

        let err = decode(br#"{"obuid": 1, "lat": 0.0, "lon": -180.01}"#).unwrap_err();
        assert!(matches!(err, DecodeError::LongitudeOutOfRange { .. }));
    }

    #[test]
    fn test_decode_rejects_missing_and_mistyped_fields() {
        let err = decode(br#"{"obuid": 1, "lat": 0.0}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField { .. }));

        let err = decode(br#"{"obuid": "one", "lat": 0.0, "lon": 0.0}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField { .. }));

        let err = decode(br#"{"obuid": 1.5, "lat": 0.0, "lon": 0.0}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField { .. }));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let err = decode(b"{\"obuid\": 1, ").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));

        let err = decode(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn test_new_rejects_nan() {
        assert!(CoordinateRecord::new(SourceId(1), f64::NAN, 0.0, SystemTime::now()).is_err());
        assert!(CoordinateRecord::new(SourceId(1), 0.0, f64::INFINITY, SystemTime::now()).is_err());
    }

    #[test]
    fn test_key_is_decimal_source_id() {
        let record = CoordinateRecord::new(SourceId(1234), 0.0, 0.0, at(0)).unwrap();
        assert_eq!(record.key(), b"1234".to_vec());
    }
}
