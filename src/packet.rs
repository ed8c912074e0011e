// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The closed packet catalogue (§4.B): every recognised `packet_type` byte,
//! which category it belongs to, and the directionality/ack/sequencing
//! metadata the session state machine needs to dispatch it.

use crate::error::FrameError;

/// Direction(s) a packet kind is valid in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    DeviceToServer,
    ServerToDevice,
}

/// One entry of the packet catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    UniqueId,
    AccountId,
    DeviceId,
    EndOfBlock16,
    EndOfBlock32,
    Ack,
    Nack,
    KeepAlive,
    SessionTerminate,
    TemplateDefine,
    StandardEvent,
    /// `packet_type` is carried alongside since the custom type identifies
    /// which template applies (§4.C).
    CustomEvent(u8),
}

/// Lowest/highest `packet_type` a device may declare a custom template for
/// (§3's Template invariant technically allows the full `[0x00, 0xEF]`
/// range; this server reserves `0x00..=0x05` for identification and the
/// standard event so custom definitions are unambiguous in practice — see
/// DESIGN.md).
pub const CUSTOM_TYPE_MIN: u8 = 0x06;
pub const CUSTOM_TYPE_MAX: u8 = 0xEF;

pub const TYPE_UNIQUE_ID: u8 = 0x01;
pub const TYPE_ACCOUNT_ID: u8 = 0x02;
pub const TYPE_DEVICE_ID: u8 = 0x03;
pub const TYPE_STANDARD_EVENT: u8 = 0x05;
pub const TYPE_END_OF_BLOCK_16: u8 = 0xF0;
pub const TYPE_END_OF_BLOCK_32: u8 = 0xF1;
pub const TYPE_ACK: u8 = 0xF2;
pub const TYPE_NACK: u8 = 0xF3;
pub const TYPE_KEEP_ALIVE: u8 = 0xF5;
pub const TYPE_SESSION_TERMINATE: u8 = 0xF6;
pub const TYPE_TEMPLATE_DEFINE: u8 = 0xF8;

impl PacketKind {
    /// Classify a raw `packet_type` byte, the sole source of truth for the
    /// catalogue (§4.B: "a closed enumeration").
    pub fn classify(packet_type: u8) -> Result<PacketKind, FrameError> {
        Ok(match packet_type {
            TYPE_UNIQUE_ID => PacketKind::UniqueId,
            TYPE_ACCOUNT_ID => PacketKind::AccountId,
            TYPE_DEVICE_ID => PacketKind::DeviceId,
            TYPE_STANDARD_EVENT => PacketKind::StandardEvent,
            TYPE_END_OF_BLOCK_16 => PacketKind::EndOfBlock16,
            TYPE_END_OF_BLOCK_32 => PacketKind::EndOfBlock32,
            TYPE_ACK => PacketKind::Ack,
            TYPE_NACK => PacketKind::Nack,
            TYPE_KEEP_ALIVE => PacketKind::KeepAlive,
            TYPE_SESSION_TERMINATE => PacketKind::SessionTerminate,
            TYPE_TEMPLATE_DEFINE => PacketKind::TemplateDefine,
            t @ CUSTOM_TYPE_MIN..=CUSTOM_TYPE_MAX => PacketKind::CustomEvent(t),
            _ => return Err(FrameError::TypeBad),
        })
    }

    #[must_use]
    pub fn direction(self) -> Direction {
        match self {
            PacketKind::Ack | PacketKind::Nack => Direction::ServerToDevice,
            _ => Direction::DeviceToServer,
        }
    }

    /// Only identification packets may appear before the session has
    /// authenticated (§4.D: `AUTH` state).
    #[must_use]
    pub fn allowed_before_auth(self) -> bool {
        matches!(
            self,
            PacketKind::UniqueId | PacketKind::AccountId | PacketKind::DeviceId
        )
    }

    /// Whether this packet kind advances the device-observed event sequence
    /// counter (§3, §4.D).
    #[must_use]
    pub fn contributes_to_sequence(self) -> bool {
        matches!(self, PacketKind::StandardEvent | PacketKind::CustomEvent(_))
    }

    #[must_use]
    pub fn is_event(self) -> bool {
        self.contributes_to_sequence()
    }

    #[must_use]
    pub fn is_end_of_block(self) -> bool {
        matches!(self, PacketKind::EndOfBlock16 | PacketKind::EndOfBlock32)
    }
}
