// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Canonical event records and the coercions that produce them from decoded
//! packet fields (§3 "Event record", §4.E).

use crate::codec::cursor::PayloadCursor;
use crate::error::PayloadShort;

/// Registry of field-type codes the template engine and standard-event
/// decoder both recognise. Each code resolves to a decoder and a slot in
/// [`EventRecord`] (§9's "small registry mapping protocol field-type to
/// (name, width, decoder)", replacing the teacher source's reflection-driven
/// field descriptor with explicit structure).
pub mod field {
    pub const TIMESTAMP: u8 = 0;
    pub const STATUS_CODE: u8 = 1;
    pub const LATITUDE: u8 = 2;
    pub const LONGITUDE: u8 = 3;
    pub const SPEED_KPH: u8 = 4;
    pub const HEADING_DEG: u8 = 5;
    pub const ALTITUDE_M: u8 = 6;
    pub const DISTANCE_KM: u8 = 7;
    pub const TOP_SPEED_KPH: u8 = 8;
    pub const GEOFENCE_1: u8 = 9;
    pub const GEOFENCE_2: u8 = 10;
    pub const SEQUENCE: u8 = 11;
    pub const RAW_DATA: u8 = 12;

    #[must_use]
    pub fn is_recognised(code: u8) -> bool {
        code <= RAW_DATA
    }
}

/// A value decoded for a single field-type code.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    UInt(u32),
    Real(f64),
    Bytes(Vec<u8>),
}

/// The canonical, persistence-ready event (§3).
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub account: String,
    pub device: String,
    pub timestamp: i64,
    pub status_code: u32,
    pub data_source: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kph: f64,
    pub heading_deg: f64,
    pub altitude_m: f64,
    pub distance_km: f64,
    pub top_speed_kph: f64,
    pub geofence_ids: [u32; 2],
    pub raw_data: Option<Vec<u8>>,
}

impl EventRecord {
    /// A record with every numeric field at its typed zero, for `account`
    /// and `device` (§4.E: "Field types recognised but not set default to
    /// the typed zero").
    #[must_use]
    pub fn zeroed(account: String, device: String, data_source: String) -> Self {
        EventRecord {
            account,
            device,
            timestamp: 0,
            status_code: 0,
            data_source,
            latitude: 0.0,
            longitude: 0.0,
            speed_kph: 0.0,
            heading_deg: 0.0,
            altitude_m: 0.0,
            distance_km: 0.0,
            top_speed_kph: 0.0,
            geofence_ids: [0, 0],
            raw_data: None,
        }
    }

    /// Apply one decoded field onto the record (§4.E coercions).
    pub fn apply_field(&mut self, code: u8, value: FieldValue) {
        match (code, value) {
            (field::TIMESTAMP, FieldValue::UInt(v)) => self.timestamp = i64::from(v),
            (field::STATUS_CODE, FieldValue::UInt(v)) => self.status_code = v,
            (field::LATITUDE, FieldValue::Real(v)) => self.latitude = v,
            (field::LONGITUDE, FieldValue::Real(v)) => self.longitude = v,
            (field::SPEED_KPH, FieldValue::Real(v)) => self.speed_kph = v,
            (field::HEADING_DEG, FieldValue::Real(v)) => self.heading_deg = v,
            (field::ALTITUDE_M, FieldValue::Real(v)) => self.altitude_m = v,
            (field::DISTANCE_KM, FieldValue::Real(v)) => self.distance_km = v,
            (field::TOP_SPEED_KPH, FieldValue::Real(v)) => self.top_speed_kph = v,
            (field::GEOFENCE_1, FieldValue::UInt(v)) => self.geofence_ids[0] = v,
            (field::GEOFENCE_2, FieldValue::UInt(v)) => self.geofence_ids[1] = v,
            (field::RAW_DATA, FieldValue::Bytes(b)) => self.raw_data = Some(b),
            // SEQUENCE is consumed by the session driver, not stored on the record.
            _ => {}
        }
    }

    /// Reduce this record to only the fields a given template declares
    /// (Testable Property 7's round-trip comparison).
    #[must_use]
    pub fn reduced_to_fields(&self, codes: &[u8]) -> EventRecord {
        let mut out = EventRecord::zeroed(self.account.clone(), self.device.clone(), self.data_source.clone());
        for &code in codes {
            match code {
                field::TIMESTAMP => out.timestamp = self.timestamp,
                field::STATUS_CODE => out.status_code = self.status_code,
                field::LATITUDE => out.latitude = self.latitude,
                field::LONGITUDE => out.longitude = self.longitude,
                field::SPEED_KPH => out.speed_kph = self.speed_kph,
                field::HEADING_DEG => out.heading_deg = self.heading_deg,
                field::ALTITUDE_M => out.altitude_m = self.altitude_m,
                field::DISTANCE_KM => out.distance_km = self.distance_km,
                field::TOP_SPEED_KPH => out.top_speed_kph = self.top_speed_kph,
                field::GEOFENCE_1 => out.geofence_ids[0] = self.geofence_ids[0],
                field::GEOFENCE_2 => out.geofence_ids[1] = self.geofence_ids[1],
                field::RAW_DATA => out.raw_data = self.raw_data.clone(),
                _ => {}
            }
        }
        out
    }
}

/// Decode one field value given its type code, hi-res flag and declared
/// wire width. Returns `None` for a recognised-but-zero-width field (the
/// template engine rejects those at definition time, §4.C) and
/// `Some(Err(_))` on payload exhaustion.
pub fn decode_field(
    cursor: &mut PayloadCursor<'_>,
    code: u8,
    hi_res: bool,
    length: usize,
) -> Result<FieldValue, PayloadShort> {
    use field::*;
    Ok(match code {
        TIMESTAMP | GEOFENCE_1 | GEOFENCE_2 | SEQUENCE => {
            FieldValue::UInt(read_uint_of_width(cursor, length)?)
        }
        STATUS_CODE => FieldValue::UInt(read_uint_of_width(cursor, length)?),
        LATITUDE | LONGITUDE => FieldValue::Real(cursor.read_degrees(hi_res)?),
        SPEED_KPH | TOP_SPEED_KPH => {
            FieldValue::Real(f64::from(read_uint_of_width(cursor, length)?) * 0.1)
        }
        HEADING_DEG => {
            let raw = read_uint_of_width(cursor, length)?;
            let degrees = if length <= 1 {
                f64::from(raw) * 360.0 / 255.0
            } else {
                f64::from(raw) * 0.1
            };
            FieldValue::Real(degrees)
        }
        ALTITUDE_M => FieldValue::Real(f64::from(read_uint_of_width(cursor, length)? as i32)),
        DISTANCE_KM => FieldValue::Real(f64::from(read_uint_of_width(cursor, length)?) * 0.1),
        RAW_DATA => FieldValue::Bytes(cursor.read_bytes(length)?.to_vec()),
        _ => FieldValue::Bytes(cursor.read_bytes(length)?.to_vec()),
    })
}

fn read_uint_of_width(cursor: &mut PayloadCursor<'_>, width: usize) -> Result<u32, PayloadShort> {
    Ok(match width {
        1 => u32::from(cursor.read_u8()?),
        2 => u32::from(cursor.read_u16()?),
        3 => cursor.read_u24()?,
        _ => cursor.read_u32()?,
    })
}

/// The fixed wire layout of a standard event packet (`packet_type ==
/// 0x05`): every field present, in order, at a fixed width (§4.B "Standard
/// event packet"). The leading `SEQUENCE` field is the device-assigned
/// event sequence number the session state machine tracks (§4.D); it has
/// no slot on [`EventRecord`] itself.
pub const STANDARD_EVENT_FIELDS: &[(u8, bool, usize)] = &[
    (field::SEQUENCE, false, 4),
    (field::TIMESTAMP, false, 4),
    (field::STATUS_CODE, false, 2),
    (field::LATITUDE, true, 4),
    (field::LONGITUDE, true, 4),
    (field::SPEED_KPH, false, 2),
    (field::HEADING_DEG, false, 2),
    (field::ALTITUDE_M, false, 4),
    (field::DISTANCE_KM, false, 4),
    (field::TOP_SPEED_KPH, false, 2),
    (field::GEOFENCE_1, false, 4),
    (field::GEOFENCE_2, false, 4),
];

/// Decode a standard event packet's payload into its device-assigned
/// sequence number and an [`EventRecord`].
pub fn decode_standard_event(
    payload: &[u8],
    account: &str,
    device: &str,
) -> Result<(u32, EventRecord), PayloadShort> {
    let mut cursor = PayloadCursor::new(payload);
    let mut record = EventRecord::zeroed(account.to_string(), device.to_string(), "gps".to_string());
    let mut seq = 0u32;
    for &(code, hi_res, length) in STANDARD_EVENT_FIELDS {
        let value = decode_field(&mut cursor, code, hi_res, length)?;
        if code == field::SEQUENCE {
            if let FieldValue::UInt(v) = value {
                seq = v;
            }
        }
        record.apply_field(code, value);
    }
    Ok((seq, record))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_record_has_typed_zeros() {
        let rec = EventRecord::zeroed("a".into(), "d".into(), "gps".into());
        assert_eq!(rec.timestamp, 0);
        assert_eq!(rec.latitude, 0.0);
        assert_eq!(rec.geofence_ids, [0, 0]);
        assert!(rec.raw_data.is_none());
    }

    #[test]
    fn decodes_standard_event_payload() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&8u32.to_be_bytes()); // sequence
        payload.extend_from_slice(&1_700_000_000u32.to_be_bytes()); // timestamp
        payload.extend_from_slice(&7u16.to_be_bytes()); // status
        payload.extend_from_slice(&12_345_678i32.to_be_bytes()); // lat
        payload.extend_from_slice(&(-98_765_432i32).to_be_bytes()); // lon
        payload.extend_from_slice(&100u16.to_be_bytes()); // speed (10.0 kph)
        payload.extend_from_slice(&900u16.to_be_bytes()); // heading (90.0 deg)
        payload.extend_from_slice(&50i32.to_be_bytes()); // altitude
        payload.extend_from_slice(&120u32.to_be_bytes()); // distance (12.0 km)
        payload.extend_from_slice(&200u16.to_be_bytes()); // top speed (20.0 kph)
        payload.extend_from_slice(&1u32.to_be_bytes()); // geofence 1
        payload.extend_from_slice(&2u32.to_be_bytes()); // geofence 2

        let (seq, rec) = decode_standard_event(&payload, "acct", "dev").unwrap();
        assert_eq!(seq, 8);
        assert_eq!(rec.timestamp, 1_700_000_000);
        assert_eq!(rec.status_code, 7);
        assert!((rec.latitude - 12.345_678).abs() < 1e-9);
        assert!((rec.longitude + 98.765_432).abs() < 1e-9);
        assert_eq!(rec.speed_kph, 10.0);
        assert_eq!(rec.heading_deg, 90.0);
        assert_eq!(rec.geofence_ids, [1, 2]);
    }

    #[test]
    fn reduced_to_fields_keeps_only_requested() {
        let mut rec = EventRecord::zeroed("a".into(), "d".into(), "gps".into());
        rec.timestamp = 5;
        rec.latitude = 1.0;
        rec.speed_kph = 9.0;
        let reduced = rec.reduced_to_fields(&[field::TIMESTAMP, field::LATITUDE]);
        assert_eq!(reduced.timestamp, 5);
        assert_eq!(reduced.latitude, 1.0);
        assert_eq!(reduced.speed_kph, 0.0);
    }
}
