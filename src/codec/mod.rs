// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Frame delimiting, binary/ASCII encode-decode and checksum math (§4.A).
//!
//! The decoder is a pure function over an already-buffered slice; the
//! buffering and timeout policy that turns a [`crate::transport::ClientSocket`]
//! into a stream of frames lives in [`FrameReader`] below.

pub mod cursor;

pub use cursor::PayloadCursor;

use crate::error::FrameError;
use crate::transport::ClientSocket;
use std::time::Duration;
use tracing::trace;

/// Which of the two wire framings produced (or should produce) a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Binary,
    Ascii,
}

/// The two fixed bytes that open every binary frame.
pub const BINARY_SYNC: [u8; 2] = [0xE0, 0x01];
/// The leading character of every ASCII frame.
pub const ASCII_SYNC: u8 = b'$';
/// Separates the hex payload from the optional checksum field in an ASCII frame.
pub const ASCII_CHECKSUM_MARKER: u8 = b'*';

/// A single decoded (or to-be-encoded) packet: type byte plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub framing: Framing,
    pub packet_type: u8,
    pub payload: Vec<u8>,
}

/// Result of attempting to decode one frame from the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A full frame was decoded; the `usize` is how many bytes of `buf` it consumed.
    Frame(Frame, usize),
    /// Not enough bytes yet; caller should read more (stream transports only).
    Incomplete,
    /// The bytes seen so far cannot form a valid frame.
    Error(FrameError),
}

/// Decode one frame from the front of `buf`, honouring `max_payload_len` and
/// the configured ASCII line terminator / ignore set.
pub fn decode_one(buf: &[u8], max_payload_len: usize, eol: u8, ignore: &[u8]) -> DecodeOutcome {
    match buf.first() {
        None => DecodeOutcome::Incomplete,
        Some(&b) if b == BINARY_SYNC[0] => decode_binary(buf, max_payload_len),
        Some(&b) if b == ASCII_SYNC => decode_ascii(buf, max_payload_len, eol, ignore),
        Some(_) => DecodeOutcome::Error(FrameError::HeaderBad),
    }
}

fn decode_binary(buf: &[u8], max_payload_len: usize) -> DecodeOutcome {
    if buf.len() < 2 {
        return DecodeOutcome::Incomplete;
    }
    if buf[1] != BINARY_SYNC[1] {
        return DecodeOutcome::Error(FrameError::HeaderBad);
    }
    if buf.len() < 4 {
        return DecodeOutcome::Incomplete;
    }
    let packet_type = buf[2];
    let length = buf[3] as usize;
    if length > max_payload_len {
        return DecodeOutcome::Error(FrameError::LengthBad);
    }
    let total = 4 + length;
    if buf.len() < total {
        return DecodeOutcome::Incomplete;
    }
    DecodeOutcome::Frame(
        Frame {
            framing: Framing::Binary,
            packet_type,
            payload: buf[4..total].to_vec(),
        },
        total,
    )
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn hex_decode(hex: &[u8]) -> Result<Vec<u8>, FrameError> {
    if hex.len() % 2 != 0 {
        return Err(FrameError::EncodingErr);
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    for pair in hex.chunks_exact(2) {
        let hi = hex_val(pair[0]).ok_or(FrameError::EncodingErr)?;
        let lo = hex_val(pair[1]).ok_or(FrameError::EncodingErr)?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

/// Reducing XOR over `bytes`, per §4.A's checksum definition.
fn xor_reduce(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

fn decode_ascii(buf: &[u8], max_payload_len: usize, eol: u8, ignore: &[u8]) -> DecodeOutcome {
    let Some(eol_rel) = buf[1..].iter().position(|&b| b == eol) else {
        return DecodeOutcome::Incomplete;
    };
    let eol_idx = 1 + eol_rel;
    let consumed = eol_idx + 1;

    // Line content, sync byte excluded, ignore characters (e.g. a stray CR) stripped.
    let line: Vec<u8> = buf[1..eol_idx]
        .iter()
        .copied()
        .filter(|b| !ignore.contains(b))
        .collect();

    let marker_pos = line.iter().position(|&b| b == ASCII_CHECKSUM_MARKER);
    let (hex_part, checksum_hex) = match marker_pos {
        Some(idx) => (&line[..idx], Some(&line[idx + 1..])),
        None => (&line[..], None),
    };

    if hex_part.len() < 2 {
        return DecodeOutcome::Error(FrameError::EncodingErr);
    }
    let decoded = match hex_decode(hex_part) {
        Ok(d) => d,
        Err(e) => return DecodeOutcome::Error(e),
    };
    let packet_type = decoded[0];
    let payload = decoded[1..].to_vec();
    if payload.len() > max_payload_len {
        return DecodeOutcome::Error(FrameError::LengthBad);
    }

    if let Some(checksum_hex) = checksum_hex {
        if checksum_hex.len() != 2 {
            return DecodeOutcome::Error(FrameError::EncodingErr);
        }
        let expected = match hex_decode(checksum_hex) {
            Ok(v) => v[0],
            Err(e) => return DecodeOutcome::Error(e),
        };
        // Checksum covers the sync byte through (excluding) the marker.
        let marker_abs = 1 + marker_pos.expect("checksum_hex implies marker present");
        let covered = &buf[0..marker_abs];
        let actual = xor_reduce(covered);
        if actual != expected {
            return DecodeOutcome::Error(FrameError::ChecksumErr);
        }
    }

    DecodeOutcome::Frame(
        Frame {
            framing: Framing::Ascii,
            packet_type,
            payload,
        },
        consumed,
    )
}

/// Verify the checksum of a raw ASCII line (sync byte through EOL, exclusive).
///
/// Exposed standalone per §4.A's contract; `decode_one` already enforces this
/// internally, but callers (and tests) may want to check an arbitrary line.
pub fn verify_ascii_checksum(line_with_sync: &[u8]) -> Result<(), FrameError> {
    let Some(marker_pos) = line_with_sync.iter().position(|&b| b == ASCII_CHECKSUM_MARKER) else {
        return Ok(());
    };
    let tail = &line_with_sync[marker_pos + 1..];
    if tail.len() != 2 {
        return Err(FrameError::EncodingErr);
    }
    let expected = hex_decode(tail)?[0];
    let actual = xor_reduce(&line_with_sync[..marker_pos]);
    if actual == expected {
        Ok(())
    } else {
        Err(FrameError::ChecksumErr)
    }
}

fn hex_encode_into(out: &mut Vec<u8>, bytes: &[u8]) {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    for &b in bytes {
        out.push(DIGITS[(b >> 4) as usize]);
        out.push(DIGITS[(b & 0x0F) as usize]);
    }
}

/// Encode `frame` using the framing it carries, per §4.A's `encode` contract.
///
/// `eol` is only consulted for ASCII framing.
pub fn encode(frame: &Frame, eol: u8) -> Result<Vec<u8>, FrameError> {
    match frame.framing {
        Framing::Binary => encode_binary(frame),
        Framing::Ascii => Ok(encode_ascii(frame, eol)),
    }
}

fn encode_binary(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    if frame.payload.len() > u8::MAX as usize {
        return Err(FrameError::LengthBad);
    }
    let mut out = Vec::with_capacity(4 + frame.payload.len());
    out.extend_from_slice(&BINARY_SYNC);
    out.push(frame.packet_type);
    out.push(frame.payload.len() as u8);
    out.extend_from_slice(&frame.payload);
    Ok(out)
}

fn encode_ascii(frame: &Frame, eol: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + frame.payload.len() * 2);
    out.push(ASCII_SYNC);
    hex_encode_into(&mut out, &[frame.packet_type]);
    hex_encode_into(&mut out, &frame.payload);
    let checksum = xor_reduce(&out);
    out.push(ASCII_CHECKSUM_MARKER);
    hex_encode_into(&mut out, &[checksum]);
    out.push(eol);
    out
}

/// Reads successive frames off a [`ClientSocket`], applying idle/packet
/// deadlines and the transport-appropriate end-of-input rule (§4.A, §4.F).
pub struct FrameReader {
    buf: Vec<u8>,
    max_payload_len: usize,
    eol: u8,
    ignore: Vec<u8>,
}

/// Outcome of asking a [`FrameReader`] for the next frame.
#[derive(Debug)]
pub enum ReadFrameOutcome {
    Frame(Frame),
    FrameError(FrameError),
    /// Idle timeout elapsed while waiting mid-frame for more bytes.
    IdleTimeout,
    /// The transport reached a clean end (UDP datagram exhausted, TCP FIN).
    EndOfStream,
}

impl FrameReader {
    #[must_use]
    pub fn new(max_payload_len: usize, eol: u8, ignore: Vec<u8>) -> Self {
        FrameReader {
            buf: Vec::new(),
            max_payload_len,
            eol,
            ignore,
        }
    }

    /// Pull one frame, reading as many times as needed from `socket`.
    ///
    /// `idle_timeout` bounds the wait between successive reads once a
    /// partial frame is in flight; `packet_timeout` bounds the time from the
    /// first byte of a frame to its completion.
    pub async fn read_frame<S: ClientSocket>(
        &mut self,
        socket: &mut S,
        idle_timeout: Duration,
        packet_timeout: Duration,
    ) -> ReadFrameOutcome {
        let mut packet_deadline: Option<tokio::time::Instant> = None;
        loop {
            match self.try_decode() {
                DecodeOutcome::Frame(frame, consumed) => {
                    self.buf.drain(..consumed);
                    return ReadFrameOutcome::Frame(frame);
                }
                DecodeOutcome::Error(e) => {
                    self.buf.clear();
                    return ReadFrameOutcome::FrameError(e);
                }
                DecodeOutcome::Incomplete => {}
            }

            if !self.buf.is_empty() && packet_deadline.is_none() {
                packet_deadline = Some(tokio::time::Instant::now() + packet_timeout);
            }

            let wait = match packet_deadline {
                Some(deadline) => idle_timeout.min(
                    deadline.saturating_duration_since(tokio::time::Instant::now()),
                ),
                None => idle_timeout,
            };

            let mut chunk = [0u8; 4096];
            match tokio::time::timeout(wait, socket.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    return ReadFrameOutcome::EndOfStream;
                }
                Ok(Ok(n)) => {
                    trace!(bytes = n, "read from socket");
                    self.buf.extend_from_slice(&chunk[..n]);
                }
                Ok(Err(_)) => {
                    return ReadFrameOutcome::EndOfStream;
                }
                Err(_) => {
                    if packet_deadline
                        .is_some_and(|d| tokio::time::Instant::now() >= d)
                    {
                        // Packet timeout: discard whatever partial frame we have.
                        self.buf.clear();
                    }
                    return ReadFrameOutcome::IdleTimeout;
                }
            }
        }
    }

    /// Discard any partial frame bytes currently buffered (used when a
    /// timeout is non-fatal per `terminate_on_timeout=false`, §4.F).
    pub fn discard_partial(&mut self) {
        self.buf.clear();
    }

    fn try_decode(&self) -> DecodeOutcome {
        decode_one(&self.buf, self.max_payload_len, self.eol, &self.ignore)
    }
}
