// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The on-wire error taxonomy (§7) and the policy for propagating it.

use std::fmt;

/// A nack reason code, fixed by the protocol and emitted big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum NackCode {
    IdInvalid = 0xF011,
    AccountInvalid = 0xF021,
    AccountInactive = 0xF022,
    AccountError = 0xF023,
    DeviceInvalid = 0xF031,
    DeviceInactive = 0xF032,
    DeviceError = 0xF033,
    ExcessiveConnections = 0xF041,

    PacketHeader = 0xF111,
    PacketType = 0xF112,
    PacketLength = 0xF113,
    PacketPayload = 0xF114,
    PacketEncoding = 0xF115,
    PacketChecksum = 0xF116,

    BlockChecksum = 0xF311,
    Protocol = 0xF312,

    FormatDefInvalid = 0xF411,
    FormatNotSupported = 0xF421,
    FormatNotRecognized = 0xF422,
    ExcessiveEvents = 0xF431,
    DuplicateEvent = 0xF432,
    EventError = 0xF441,
}

impl NackCode {
    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Whether this code, once emitted, ends the session (§7 propagation policy).
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            NackCode::IdInvalid
                | NackCode::AccountInvalid
                | NackCode::AccountInactive
                | NackCode::AccountError
                | NackCode::DeviceInvalid
                | NackCode::DeviceInactive
                | NackCode::DeviceError
                | NackCode::ExcessiveConnections
                | NackCode::Protocol
                | NackCode::PacketHeader
                | NackCode::PacketType
                | NackCode::PacketLength
                | NackCode::PacketPayload
        )
    }
}

impl fmt::Display for NackCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} (0x{:04X})", self.code())
    }
}

/// Errors raised while reading a single frame off the wire (§4.A).
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad sync/header byte")]
    HeaderBad,
    #[error("unrecognised type byte")]
    TypeBad,
    #[error("declared length exceeds configured maximum")]
    LengthBad,
    #[error("payload bytes insufficient or malformed")]
    PayloadBad,
    #[error("non-hex digit in ASCII-framed payload")]
    EncodingErr,
    #[error("ASCII checksum mismatch")]
    ChecksumErr,
}

impl From<FrameError> for NackCode {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::HeaderBad => NackCode::PacketHeader,
            FrameError::TypeBad => NackCode::PacketType,
            FrameError::LengthBad => NackCode::PacketLength,
            FrameError::PayloadBad => NackCode::PacketPayload,
            FrameError::EncodingErr => NackCode::PacketEncoding,
            FrameError::ChecksumErr => NackCode::PacketChecksum,
        }
    }
}

/// Failure to read one typed value off a payload cursor (§4.A).
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
#[error("payload exhausted before the requested field could be read")]
pub struct PayloadShort;
