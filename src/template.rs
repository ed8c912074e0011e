// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Device-defined custom event layouts (§4.C): `Define`, `Lookup`, `Apply`.

use std::collections::HashMap;

use crate::codec::cursor::PayloadCursor;
use crate::error::NackCode;
use crate::event::{self, decode_field, EventRecord, FieldValue};
use crate::packet::{CUSTOM_TYPE_MAX, CUSTOM_TYPE_MIN};

/// One field slot within a [`Template`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    /// Field-type code (§4.E's registry).
    pub code: u8,
    /// Whether a coordinate field is 32-bit (`true`) or 24-bit (`false`).
    /// Ignored for non-coordinate fields.
    pub hi_res: bool,
    /// Declared position within the template, `0`-based.
    pub index: u8,
    /// Wire width in bytes.
    pub length: u8,
}

/// A device-declared layout for one custom `packet_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub packet_type: u8,
    /// When set, a payload longer than one record's worth of bytes is
    /// interpreted as that many repeats of the same field sequence (§4.C,
    /// "repeatLast").
    pub repeat_last: bool,
    pub fields: Vec<FieldDef>,
}

impl Template {
    fn record_len(&self) -> usize {
        self.fields.iter().map(|f| usize::from(f.length)).sum()
    }
}

/// Per-session store of negotiated templates, keyed by `packet_type`.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: HashMap<u8, Template>,
    custom_types_enabled: bool,
}

impl TemplateRegistry {
    #[must_use]
    pub fn new(custom_types_enabled: bool) -> Self {
        TemplateRegistry {
            templates: HashMap::new(),
            custom_types_enabled,
        }
    }

    /// Validate and install a template definition (§4.C "Define").
    ///
    /// Rejections map onto the three format nacks: an out-of-range type, a
    /// malformed field list, or a payload too large for the transport all
    /// produce [`NackCode::FormatDefInvalid`]; a custom type while the
    /// deployment has them disabled produces
    /// [`NackCode::FormatNotSupported`].
    pub fn define(
        &mut self,
        packet_type: u8,
        repeat_last: bool,
        fields: Vec<FieldDef>,
        max_payload_len: usize,
    ) -> Result<(), NackCode> {
        if !(CUSTOM_TYPE_MIN..=CUSTOM_TYPE_MAX).contains(&packet_type) {
            return Err(NackCode::FormatDefInvalid);
        }
        if !self.custom_types_enabled {
            return Err(NackCode::FormatNotSupported);
        }
        if fields.is_empty() || fields.len() > 255 {
            return Err(NackCode::FormatDefInvalid);
        }
        for (i, f) in fields.iter().enumerate() {
            if usize::from(f.index) != i {
                return Err(NackCode::FormatDefInvalid);
            }
            if f.length == 0 {
                return Err(NackCode::FormatDefInvalid);
            }
            if !event::field::is_recognised(f.code) {
                return Err(NackCode::FormatDefInvalid);
            }
        }
        let record_len: usize = fields.iter().map(|f| usize::from(f.length)).sum();
        if record_len > max_payload_len {
            return Err(NackCode::FormatDefInvalid);
        }

        let template = Template {
            packet_type,
            repeat_last,
            fields,
        };
        self.templates.insert(packet_type, template);
        Ok(())
    }

    #[must_use]
    pub fn lookup(&self, packet_type: u8) -> Option<&Template> {
        self.templates.get(&packet_type)
    }

    /// Install a template reloaded from the persisted template store (§4.C
    /// "Lookup"), bypassing `define`'s validation since it was already
    /// validated once, when it was first defined.
    pub fn install(&mut self, template: Template) {
        self.templates.insert(template.packet_type, template);
    }

    /// Parse a `TemplateDefine` packet payload: `packet_type`(1) +
    /// `repeatLast`(1, nonzero = true) + field count(1) + that many field
    /// records of `code`(1) + `hiRes`(1, nonzero = true) + `index`(1) +
    /// `length`(1).
    pub fn parse_define_payload(payload: &[u8]) -> Result<(u8, bool, Vec<FieldDef>), NackCode> {
        let mut cursor = PayloadCursor::new(payload);
        let packet_type = cursor.read_u8().map_err(|_| NackCode::FormatDefInvalid)?;
        let repeat_last = cursor.read_u8().map_err(|_| NackCode::FormatDefInvalid)? != 0;
        let count = cursor.read_u8().map_err(|_| NackCode::FormatDefInvalid)?;
        let mut fields = Vec::with_capacity(usize::from(count));
        for index in 0..count {
            let code = cursor.read_u8().map_err(|_| NackCode::FormatDefInvalid)?;
            let hi_res = cursor.read_u8().map_err(|_| NackCode::FormatDefInvalid)? != 0;
            let decl_index = cursor.read_u8().map_err(|_| NackCode::FormatDefInvalid)?;
            if decl_index != index {
                return Err(NackCode::FormatDefInvalid);
            }
            let length = cursor.read_u8().map_err(|_| NackCode::FormatDefInvalid)?;
            fields.push(FieldDef { code, hi_res, index, length });
        }
        Ok((packet_type, repeat_last, fields))
    }

    /// Decode a custom event payload against its negotiated template
    /// (§4.C "Apply"). Each produced record is paired with the
    /// device-assigned sequence number if the template declares a
    /// `SEQUENCE` field, else `None` (the caller auto-assigns one).
    pub fn apply(
        &self,
        packet_type: u8,
        payload: &[u8],
        account: &str,
        device: &str,
    ) -> Result<Vec<(Option<u32>, EventRecord)>, NackCode> {
        if !self.custom_types_enabled {
            return Err(NackCode::FormatNotSupported);
        }
        let template = self
            .lookup(packet_type)
            .ok_or(NackCode::FormatNotRecognized)?;
        if template.record_len() == 0 {
            return Err(NackCode::FormatNotRecognized);
        }

        let mut cursor = PayloadCursor::new(payload);
        let mut records = Vec::new();
        loop {
            let mut record =
                EventRecord::zeroed(account.to_string(), device.to_string(), "custom".to_string());
            let mut seq = None;
            for field in &template.fields {
                let value = decode_field(
                    &mut cursor,
                    field.code,
                    field.hi_res,
                    usize::from(field.length),
                )
                .map_err(|_| NackCode::PacketPayload)?;
                if field.code == event::field::SEQUENCE {
                    if let FieldValue::UInt(v) = value {
                        seq = Some(v);
                    }
                }
                record.apply_field(field.code, value);
            }
            records.push((seq, record));

            if !template.repeat_last || cursor.is_empty() {
                break;
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fields() -> Vec<FieldDef> {
        vec![
            FieldDef { code: event::field::TIMESTAMP, hi_res: false, index: 0, length: 4 },
            FieldDef { code: event::field::STATUS_CODE, hi_res: false, index: 1, length: 2 },
            FieldDef { code: event::field::LATITUDE, hi_res: false, index: 2, length: 3 },
            FieldDef { code: event::field::LONGITUDE, hi_res: false, index: 3, length: 3 },
        ]
    }

    #[test]
    fn define_then_lookup_round_trips() {
        let mut reg = TemplateRegistry::new(true);
        reg.define(0x30, true, sample_fields(), 2048).unwrap();
        let tpl = reg.lookup(0x30).unwrap();
        assert_eq!(tpl.packet_type, 0x30);
        assert!(tpl.repeat_last);
        assert_eq!(tpl.fields.len(), 4);
    }

    #[test]
    fn define_rejects_out_of_range_type() {
        let mut reg = TemplateRegistry::new(true);
        assert_eq!(
            reg.define(0x02, false, sample_fields(), 2048),
            Err(NackCode::FormatDefInvalid)
        );
    }

    #[test]
    fn define_rejects_when_custom_disabled() {
        let mut reg = TemplateRegistry::new(false);
        assert_eq!(
            reg.define(0x30, false, sample_fields(), 2048),
            Err(NackCode::FormatNotSupported)
        );
    }

    #[test]
    fn apply_without_definition_is_not_recognized() {
        let reg = TemplateRegistry::new(true);
        assert_eq!(
            reg.apply(0x30, &[0, 0, 0, 1], "a", "d"),
            Err(NackCode::FormatNotRecognized)
        );
    }

    #[test]
    fn apply_repeats_record_across_whole_payload() {
        let mut reg = TemplateRegistry::new(true);
        reg.define(0x30, true, sample_fields(), 2048).unwrap();

        let mut payload = Vec::new();
        for (ts, status) in [(100u32, 1u16), (200u32, 2u16)] {
            payload.extend_from_slice(&ts.to_be_bytes());
            payload.extend_from_slice(&status.to_be_bytes());
            payload.extend_from_slice(&[0, 0, 1]);
            payload.extend_from_slice(&[0, 0, 2]);
        }

        let records = reg.apply(0x30, &payload, "acct", "dev").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, None);
        assert_eq!(records[0].1.timestamp, 100);
        assert_eq!(records[1].1.timestamp, 200);
    }

    #[test]
    fn parses_define_payload() {
        let payload = vec![0x30, 1, 2, event::field::TIMESTAMP, 0, 0, 4, event::field::LATITUDE, 0, 1, 3];
        let (packet_type, repeat_last, fields) = TemplateRegistry::parse_define_payload(&payload).unwrap();
        assert_eq!(packet_type, 0x30);
        assert!(repeat_last);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[1].code, event::field::LATITUDE);
        assert_eq!(fields[1].length, 3);
    }

    #[test]
    fn apply_without_repeat_last_stops_after_one_record() {
        let mut reg = TemplateRegistry::new(true);
        reg.define(0x30, false, sample_fields(), 2048).unwrap();

        let mut payload = Vec::new();
        for (ts, status) in [(100u32, 1u16), (200u32, 2u16)] {
            payload.extend_from_slice(&ts.to_be_bytes());
            payload.extend_from_slice(&status.to_be_bytes());
            payload.extend_from_slice(&[0, 0, 1]);
            payload.extend_from_slice(&[0, 0, 2]);
        }

        let records = reg.apply(0x30, &payload, "acct", "dev").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1.timestamp, 100);
    }
}
