// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pluggable back-end interfaces (§4.G): accounts, devices, events and
//! templates are each behind a trait so a deployment can swap in its own
//! persistence without touching the protocol engine.

pub mod memstore;

use std::future::Future;

use crate::event::EventRecord;
use crate::template::{FieldDef, Template};

/// An account record (§4.G).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub account_id: String,
    pub is_active: bool,
    pub contact_email: Option<String>,
    pub notify_email: Option<String>,
}

/// A device record (§4.G).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub account_id: String,
    pub device_id: String,
    pub is_active: bool,
    /// Maximum accepted connections within `conn_rate_window_secs`, or
    /// `None` for unlimited.
    pub conn_rate_max: Option<u32>,
    pub conn_rate_window_secs: u32,
    /// Maximum accepted events within `event_rate_window_secs`, or `None`
    /// for unlimited.
    pub event_rate_max: Option<u32>,
    pub event_rate_window_secs: u32,
    pub supports_custom_types: bool,
}

/// Outcome of looking a record up. `Error` covers a backend failure
/// (connection loss, query error) distinct from a clean `NotFound` (§6
/// `Account | NOT_FOUND | ERROR`, `Device | NOT_FOUND | ERROR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult<T> {
    Found(T),
    NotFound,
    Error,
}

impl<T> LookupResult<T> {
    #[must_use]
    pub fn found(self) -> Option<T> {
        match self {
            LookupResult::Found(v) => Some(v),
            LookupResult::NotFound | LookupResult::Error => None,
        }
    }
}

/// Outcome of inserting an event (§4.G, §7 `DUPLICATE_EVENT`/
/// `EXCESSIVE_EVENTS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    Duplicate,
    Excessive,
    Error,
}

/// Account lookups used during identification (§4.D `AUTH`).
pub trait AccountStore: Send + Sync {
    fn get(
        &self,
        account_id: &str,
    ) -> impl Future<Output = LookupResult<Account>> + Send;
}

/// Device lookups and rate bookkeeping used during identification and
/// event processing.
pub trait DeviceStore: Send + Sync {
    fn get(
        &self,
        account_id: &str,
        device_id: &str,
    ) -> impl Future<Output = LookupResult<Device>> + Send;

    /// Resolve a device from its globally unique hardware id, used for the
    /// `UniqueId` identification packet (§4.B, §4.D).
    fn get_by_unique_id(
        &self,
        unique_id: &[u8],
    ) -> impl Future<Output = LookupResult<Device>> + Send;

    /// Record a new connection attempt and report whether it falls within
    /// the device's configured connection-rate window.
    fn note_connection(
        &self,
        account_id: &str,
        device_id: &str,
    ) -> impl Future<Output = bool> + Send;
}

/// Durable event sink (§4.G).
pub trait EventStore: Send + Sync {
    fn insert(
        &self,
        record: EventRecord,
    ) -> impl Future<Output = InsertResult> + Send;
}

/// Per-device custom template persistence, so a definition survives across
/// sessions (§4.C).
pub trait TemplateStore: Send + Sync {
    fn put(
        &self,
        account_id: &str,
        device_id: &str,
        template: Template,
    ) -> impl Future<Output = ()> + Send;

    fn get(
        &self,
        account_id: &str,
        device_id: &str,
        packet_type: u8,
    ) -> impl Future<Output = Option<Template>> + Send;
}

/// Helper re-exported for callers constructing a [`Template`] from a
/// decoded `TemplateDefine` payload without reaching into `crate::template`
/// directly.
pub type TemplateFieldDef = FieldDef;
