// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-connection protocol state machine (§4.D):
//! `ACCEPT -> AUTH -> ACTIVE -> DRAIN -> CLOSED`.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::codec::{self, Frame, Framing, ReadFrameOutcome};
use crate::codec::FrameReader;
use crate::error::NackCode;
use crate::event::{self, EventRecord};
use crate::packet::{self, PacketKind};
use crate::store::{Account, AccountStore, Device, DeviceStore, EventStore, InsertResult, LookupResult, TemplateStore};
use crate::template::{Template, TemplateRegistry};
use crate::transport::ClientSocket;

/// A session's lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accept,
    Auth,
    Active,
    Drain,
    Closed,
}

/// Static, per-session tunables (a narrowed view of [`crate::config::Config`]).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub packet_timeout: Duration,
    pub session_timeout: Duration,
    pub linger: Duration,
    pub terminate_on_timeout: bool,
    pub max_payload_len: usize,
    pub eol: u8,
    pub ignore: Vec<u8>,
    pub custom_types_enabled: bool,
    pub duplicate_events_nack: bool,
    pub block_checksum_retry_budget: u32,
}

/// Restricted identity alphabet: letters, digits, `.`, `_`, `@`, `&` (§3).
fn is_valid_identity(s: &[u8]) -> bool {
    !s.is_empty()
        && s.len() <= 32
        && s.iter().all(|&b| {
            b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'@' | b'&')
        })
}

/// A single device connection or UDP exchange, driven to completion.
pub struct Session<'a, S, A, D, Ev, T> {
    socket: S,
    reader: FrameReader,
    cfg: SessionConfig,
    state: SessionState,
    framing: Framing,
    account: Option<String>,
    device: Option<String>,
    supports_custom: bool,
    templates: TemplateRegistry,
    highest_seq_persisted: u32,
    seen_any_event: bool,
    next_auto_seq: u32,
    block_records: Vec<(Option<u32>, EventRecord)>,
    block_bytes: Vec<u8>,
    block_checksum_failures: u32,
    account_store: &'a A,
    device_store: &'a D,
    event_store: &'a Ev,
    template_store: &'a T,
}

/// What ended the session, for the listener's logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Clean,
    TimedOut,
    Rejected(NackCode),
    ProtocolError,
}

impl<'a, S, A, D, Ev, T> Session<'a, S, A, D, Ev, T>
where
    S: ClientSocket,
    A: AccountStore,
    D: DeviceStore,
    Ev: EventStore,
    T: TemplateStore,
{
    #[must_use]
    pub fn new(
        socket: S,
        cfg: SessionConfig,
        account_store: &'a A,
        device_store: &'a D,
        event_store: &'a Ev,
        template_store: &'a T,
    ) -> Self {
        let reader = FrameReader::new(cfg.max_payload_len, cfg.eol, cfg.ignore.clone());
        Session {
            socket,
            reader,
            state: SessionState::Accept,
            framing: Framing::Binary,
            account: None,
            device: None,
            supports_custom: false,
            templates: TemplateRegistry::new(cfg.custom_types_enabled),
            highest_seq_persisted: 0,
            seen_any_event: false,
            next_auto_seq: 1,
            block_records: Vec::new(),
            block_bytes: Vec::new(),
            block_checksum_failures: 0,
            account_store,
            device_store,
            event_store,
            template_store,
            cfg,
        }
    }

    /// Drive the session to completion (§4.D).
    #[instrument(skip(self), fields(peer = %self.socket.peer_addr()))]
    pub async fn run(mut self) -> SessionOutcome {
        self.state = SessionState::Auth;
        let outcome = self.drive().await;
        self.state = SessionState::Drain;
        self.socket.close(self.cfg.linger).await;
        self.state = SessionState::Closed;
        debug!(?outcome, "session closed");
        outcome
    }

    async fn drive(&mut self) -> SessionOutcome {
        let session_deadline = tokio::time::Instant::now() + self.cfg.session_timeout;
        loop {
            let remaining = session_deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                debug!("session deadline elapsed");
                return SessionOutcome::TimedOut;
            }

            let read = self
                .reader
                .read_frame(&mut self.socket, self.cfg.idle_timeout, self.cfg.packet_timeout);
            let outcome = match tokio::time::timeout(remaining, read).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!("session deadline elapsed");
                    return SessionOutcome::TimedOut;
                }
            };

            let frame = match outcome {
                ReadFrameOutcome::Frame(f) => f,
                ReadFrameOutcome::EndOfStream => return SessionOutcome::Clean,
                ReadFrameOutcome::IdleTimeout => {
                    if self.cfg.terminate_on_timeout {
                        return SessionOutcome::TimedOut;
                    }
                    self.reader.discard_partial();
                    continue;
                }
                ReadFrameOutcome::FrameError(e) => {
                    let nack = NackCode::from(e);
                    self.send_nack(nack, 0, None).await;
                    if nack.is_fatal() {
                        return SessionOutcome::Rejected(nack);
                    }
                    continue;
                }
            };
            self.framing = frame.framing;

            let kind = match PacketKind::classify(frame.packet_type) {
                Ok(k) => k,
                Err(e) => {
                    let nack = NackCode::from(e);
                    self.send_nack(nack, frame.packet_type, None).await;
                    return SessionOutcome::Rejected(nack);
                }
            };

            if self.state == SessionState::Auth && !kind.allowed_before_auth() {
                self.send_nack(NackCode::Protocol, frame.packet_type, None).await;
                return SessionOutcome::Rejected(NackCode::Protocol);
            }

            match self.dispatch(kind, &frame).await {
                Ok(true) => {}
                Ok(false) => return SessionOutcome::Clean,
                Err(outcome) => return outcome,
            }
        }
    }

    async fn dispatch(&mut self, kind: PacketKind, frame: &Frame) -> Result<bool, SessionOutcome> {
        match kind {
            PacketKind::UniqueId | PacketKind::AccountId | PacketKind::DeviceId => {
                self.handle_identification(kind, frame).await
            }
            PacketKind::TemplateDefine => {
                self.handle_template_define(frame).await;
                Ok(true)
            }
            PacketKind::StandardEvent => {
                self.handle_standard_event(frame).await;
                Ok(true)
            }
            PacketKind::CustomEvent(packet_type) => {
                self.handle_custom_event(packet_type, frame).await;
                Ok(true)
            }
            PacketKind::EndOfBlock16 => {
                self.handle_end_of_block(frame, 2).await?;
                Ok(true)
            }
            PacketKind::EndOfBlock32 => {
                self.handle_end_of_block(frame, 4).await?;
                Ok(true)
            }
            PacketKind::KeepAlive => Ok(true),
            PacketKind::SessionTerminate => Ok(false),
            PacketKind::Ack | PacketKind::Nack => {
                self.send_nack(NackCode::Protocol, frame.packet_type, None).await;
                Err(SessionOutcome::Rejected(NackCode::Protocol))
            }
        }
    }

    async fn handle_identification(
        &mut self,
        kind: PacketKind,
        frame: &Frame,
    ) -> Result<bool, SessionOutcome> {
        if self.state != SessionState::Auth {
            // Re-identification mid-session is a protocol violation.
            self.send_nack(NackCode::Protocol, frame.packet_type, None).await;
            return Err(SessionOutcome::Rejected(NackCode::Protocol));
        }

        let device = match kind {
            PacketKind::UniqueId => match self.device_store.get_by_unique_id(&frame.payload).await {
                LookupResult::Found(d) => d,
                LookupResult::NotFound => {
                    self.send_nack(NackCode::IdInvalid, frame.packet_type, None).await;
                    return Err(SessionOutcome::Rejected(NackCode::IdInvalid));
                }
                LookupResult::Error => {
                    self.send_nack(NackCode::DeviceError, frame.packet_type, None).await;
                    return Err(SessionOutcome::Rejected(NackCode::DeviceError));
                }
            },
            PacketKind::AccountId | PacketKind::DeviceId => {
                // Account-id and device-id packets are paired: the server
                // resolves on the second of the two. The first simply
                // stashes the identity we have so far.
                let text = std::str::from_utf8(&frame.payload).unwrap_or("");
                let text = text.trim_end_matches('\0');
                if !is_valid_identity(text.as_bytes()) {
                    self.send_nack(NackCode::IdInvalid, frame.packet_type, None).await;
                    return Err(SessionOutcome::Rejected(NackCode::IdInvalid));
                }
                if kind == PacketKind::AccountId {
                    self.account = Some(text.to_string());
                } else {
                    self.device = Some(text.to_string());
                }
                if self.account.is_none() || self.device.is_none() {
                    return Ok(true);
                }
                match self
                    .device_store
                    .get(self.account.as_deref().unwrap(), self.device.as_deref().unwrap())
                    .await
                {
                    LookupResult::Found(d) => d,
                    LookupResult::NotFound => {
                        self.send_nack(NackCode::DeviceInvalid, frame.packet_type, None).await;
                        return Err(SessionOutcome::Rejected(NackCode::DeviceInvalid));
                    }
                    LookupResult::Error => {
                        self.send_nack(NackCode::DeviceError, frame.packet_type, None).await;
                        return Err(SessionOutcome::Rejected(NackCode::DeviceError));
                    }
                }
            }
            _ => unreachable!("only identification kinds reach handle_identification"),
        };

        self.authenticate(device, frame.packet_type).await
    }

    async fn authenticate(
        &mut self,
        device: Device,
        offending_type: u8,
    ) -> Result<bool, SessionOutcome> {
        if !device.is_active {
            self.send_nack(NackCode::DeviceInactive, offending_type, None).await;
            return Err(SessionOutcome::Rejected(NackCode::DeviceInactive));
        }
        let account = match self.account_store.get(&device.account_id).await {
            LookupResult::Found(a) => a,
            LookupResult::NotFound => {
                self.send_nack(NackCode::AccountInvalid, offending_type, None).await;
                return Err(SessionOutcome::Rejected(NackCode::AccountInvalid));
            }
            LookupResult::Error => {
                self.send_nack(NackCode::AccountError, offending_type, None).await;
                return Err(SessionOutcome::Rejected(NackCode::AccountError));
            }
        };
        if !account.is_active {
            self.send_nack(NackCode::AccountInactive, offending_type, None).await;
            return Err(SessionOutcome::Rejected(NackCode::AccountInactive));
        }
        if !self
            .device_store
            .note_connection(&device.account_id, &device.device_id)
            .await
        {
            self.send_nack(NackCode::ExcessiveConnections, offending_type, None).await;
            return Err(SessionOutcome::Rejected(NackCode::ExcessiveConnections));
        }

        info!(account = %account.account_id, device = %device.device_id, "session authenticated");
        self.account = Some(account.account_id);
        self.device = Some(device.device_id);
        self.supports_custom = device.supports_custom_types && self.cfg.custom_types_enabled;
        self.templates = TemplateRegistry::new(self.supports_custom);
        self.state = SessionState::Active;
        Ok(true)
    }

    async fn handle_template_define(&mut self, frame: &Frame) {
        let (packet_type, repeat_last, fields) =
            match TemplateRegistry::parse_define_payload(&frame.payload) {
                Ok(v) => v,
                Err(nack) => {
                    self.send_nack(nack, frame.packet_type, None).await;
                    return;
                }
            };
        match self
            .templates
            .define(packet_type, repeat_last, fields.clone(), self.cfg.max_payload_len)
        {
            Ok(()) => {
                let template = Template { packet_type, repeat_last, fields };
                if let (Some(account), Some(device)) = (self.account.clone(), self.device.clone()) {
                    self.template_store.put(&account, &device, template).await;
                }
            }
            Err(nack) => self.send_nack(nack, frame.packet_type, None).await,
        }
    }

    async fn handle_standard_event(&mut self, frame: &Frame) {
        self.block_bytes.extend_from_slice(&frame.payload);
        let account = self.account.clone().unwrap_or_default();
        let device = self.device.clone().unwrap_or_default();
        match event::decode_standard_event(&frame.payload, &account, &device) {
            Ok((seq, record)) => self.block_records.push((Some(seq), record)),
            Err(_) => self.send_nack(NackCode::PacketPayload, frame.packet_type, None).await,
        }
    }

    async fn handle_custom_event(&mut self, packet_type: u8, frame: &Frame) {
        self.block_bytes.extend_from_slice(&frame.payload);
        let account = self.account.clone().unwrap_or_default();
        let device = self.device.clone().unwrap_or_default();

        // A template defined in an earlier session isn't redefined on
        // reconnect; fall back to the persisted form before giving up (§4.C
        // "Lookup").
        if self.templates.lookup(packet_type).is_none() {
            if let Some(template) = self.template_store.get(&account, &device, packet_type).await {
                self.templates.install(template);
            }
        }

        match self.templates.apply(packet_type, &frame.payload, &account, &device) {
            Ok(records) => self.block_records.extend(records),
            Err(nack) => self.send_nack(nack, frame.packet_type, None).await,
        }
    }

    /// §4.D: verify the block checksum, then persist every buffered
    /// record in receive order, mapping each store result per §4.D point
    /// 3, and ack the highest sequence actually persisted.
    async fn handle_end_of_block(
        &mut self,
        frame: &Frame,
        checksum_width: usize,
    ) -> Result<(), SessionOutcome> {
        let observed = checksum_over(&self.block_bytes, checksum_width);
        let claimed = bytes_to_uint(&frame.payload, checksum_width);

        if observed != claimed {
            self.block_checksum_failures += 1;
            self.block_records.clear();
            self.block_bytes.clear();
            self.send_nack(NackCode::BlockChecksum, frame.packet_type, None).await;
            if self.block_checksum_failures > self.cfg.block_checksum_retry_budget {
                warn!("block checksum retry budget exceeded, terminating session");
                return Err(SessionOutcome::Rejected(NackCode::BlockChecksum));
            }
            return Ok(());
        }
        self.block_checksum_failures = 0;

        let records = std::mem::take(&mut self.block_records);
        self.block_bytes.clear();

        let mut excessive = false;
        for (seq, record) in records {
            let seq = seq.unwrap_or_else(|| {
                let s = self.next_auto_seq;
                self.next_auto_seq += 1;
                s
            });
            self.next_auto_seq = self.next_auto_seq.max(seq + 1);

            match self.event_store.insert(record).await {
                InsertResult::Inserted => {
                    self.highest_seq_persisted = self.highest_seq_persisted.max(seq);
                    self.seen_any_event = true;
                }
                InsertResult::Duplicate => {
                    self.highest_seq_persisted = self.highest_seq_persisted.max(seq);
                    self.seen_any_event = true;
                    if self.cfg.duplicate_events_nack {
                        self.send_nack(NackCode::DuplicateEvent, frame.packet_type, Some(seq)).await;
                    }
                }
                InsertResult::Excessive => excessive = true,
                InsertResult::Error => {
                    self.send_nack(NackCode::EventError, frame.packet_type, Some(seq)).await;
                }
            }
        }

        self.send_ack(self.highest_seq_persisted).await;
        if excessive {
            self.send_nack(NackCode::ExcessiveEvents, frame.packet_type, None).await;
        }
        Ok(())
    }

    async fn send_ack(&mut self, seq: u32) {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&seq.to_be_bytes());
        self.send_frame(packet::TYPE_ACK, payload).await;
    }

    async fn send_nack(&mut self, code: NackCode, offending_type: u8, seq: Option<u32>) {
        let mut payload = Vec::with_capacity(7);
        payload.extend_from_slice(&code.code().to_be_bytes());
        payload.push(offending_type);
        if let Some(seq) = seq {
            payload.extend_from_slice(&seq.to_be_bytes());
        }
        self.send_frame(packet::TYPE_NACK, payload).await;
    }

    async fn send_frame(&mut self, packet_type: u8, payload: Vec<u8>) {
        let frame = Frame { framing: self.framing, packet_type, payload };
        match codec::encode(&frame, self.cfg.eol) {
            Ok(bytes) => {
                if let Err(e) = self.socket.write_all(&bytes).await {
                    warn!(error = %e, "failed to write reply frame");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode reply frame"),
        }
    }
}

/// Byte-wise XOR checksum folded into `width`-byte lanes (§9 open question:
/// the authoritative bit-width/algorithm is device-specification defined;
/// this implementation's choice is recorded in DESIGN.md).
fn checksum_over(bytes: &[u8], width: usize) -> u64 {
    let mut lanes = vec![0u8; width];
    for (i, &b) in bytes.iter().enumerate() {
        lanes[i % width] ^= b;
    }
    bytes_to_uint(&lanes, width)
}

fn bytes_to_uint(bytes: &[u8], width: usize) -> u64 {
    let mut acc = 0u64;
    for &b in bytes.iter().take(width) {
        acc = (acc << 8) | u64::from(b);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_folds_xor_into_lanes() {
        let observed = checksum_over(&[0x01, 0x02, 0x03, 0x04], 2);
        // lane0 = 0x01 ^ 0x03 = 0x02, lane1 = 0x02 ^ 0x04 = 0x06
        assert_eq!(observed, 0x0206);
    }

    #[test]
    fn identity_alphabet_is_restricted() {
        assert!(is_valid_identity(b"device_01@fleet.example"));
        assert!(!is_valid_identity(b"bad space"));
        assert!(!is_valid_identity(b""));
        assert!(!is_valid_identity(&[b'a'; 33]));
    }
}
