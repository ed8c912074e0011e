// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory reference implementations of the [`super`] store traits.
//!
//! These back a standalone server and the integration tests; a production
//! deployment is expected to supply its own (§4.G "pluggable").

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{Account, AccountStore, Device, DeviceStore, EventStore, InsertResult, LookupResult, TemplateStore};
use crate::event::EventRecord;
use crate::template::Template;

#[derive(Debug, Default)]
pub struct MemAccountStore {
    accounts: Mutex<HashMap<String, Account>>,
}

impl MemAccountStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, account: Account) {
        self.accounts
            .lock()
            .unwrap()
            .insert(account.account_id.clone(), account);
    }
}

impl AccountStore for MemAccountStore {
    async fn get(&self, account_id: &str) -> LookupResult<Account> {
        match self.accounts.lock().unwrap().get(account_id) {
            Some(a) => LookupResult::Found(a.clone()),
            None => LookupResult::NotFound,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemDeviceStore {
    devices: Mutex<HashMap<(String, String), Device>>,
    by_unique_id: Mutex<HashMap<Vec<u8>, (String, String)>>,
    connections_seen: Mutex<HashMap<(String, String), u32>>,
}

impl MemDeviceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, device: Device, unique_id: Option<Vec<u8>>) {
        let key = (device.account_id.clone(), device.device_id.clone());
        if let Some(uid) = unique_id {
            self.by_unique_id.lock().unwrap().insert(uid, key.clone());
        }
        self.devices.lock().unwrap().insert(key, device);
    }
}

impl DeviceStore for MemDeviceStore {
    async fn get(&self, account_id: &str, device_id: &str) -> LookupResult<Device> {
        let key = (account_id.to_string(), device_id.to_string());
        match self.devices.lock().unwrap().get(&key) {
            Some(d) => LookupResult::Found(d.clone()),
            None => LookupResult::NotFound,
        }
    }

    async fn get_by_unique_id(&self, unique_id: &[u8]) -> LookupResult<Device> {
        let key = match self.by_unique_id.lock().unwrap().get(unique_id).cloned() {
            Some(k) => k,
            None => return LookupResult::NotFound,
        };
        match self.devices.lock().unwrap().get(&key) {
            Some(d) => LookupResult::Found(d.clone()),
            None => LookupResult::NotFound,
        }
    }

    async fn note_connection(&self, account_id: &str, device_id: &str) -> bool {
        let key = (account_id.to_string(), device_id.to_string());
        let max = self
            .devices
            .lock()
            .unwrap()
            .get(&key)
            .and_then(|d| d.conn_rate_max);
        let Some(max) = max else { return true };
        let mut seen = self.connections_seen.lock().unwrap();
        let count = seen.entry(key).or_insert(0);
        *count += 1;
        *count <= max
    }
}

#[derive(Debug, Default)]
pub struct MemEventStore {
    seen: Mutex<HashSet<(String, String, i64, u32)>>,
    records: Mutex<Vec<EventRecord>>,
    max_per_device: Option<u32>,
}

impl MemEventStore {
    #[must_use]
    pub fn new(max_per_device: Option<u32>) -> Self {
        MemEventStore {
            seen: Mutex::new(HashSet::new()),
            records: Mutex::new(Vec::new()),
            max_per_device,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventStore for MemEventStore {
    async fn insert(&self, record: EventRecord) -> InsertResult {
        let key = (
            record.account.clone(),
            record.device.clone(),
            record.timestamp,
            record.status_code,
        );
        {
            let mut seen = self.seen.lock().unwrap();
            if !seen.insert(key) {
                return InsertResult::Duplicate;
            }
        }
        if let Some(max) = self.max_per_device {
            let count = self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.account == record.account && r.device == record.device)
                .count() as u32;
            if count >= max {
                return InsertResult::Excessive;
            }
        }
        self.records.lock().unwrap().push(record);
        InsertResult::Inserted
    }
}

#[derive(Debug, Default)]
pub struct MemTemplateStore {
    templates: Mutex<HashMap<(String, String, u8), Template>>,
}

impl MemTemplateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TemplateStore for MemTemplateStore {
    async fn put(&self, account_id: &str, device_id: &str, template: Template) {
        let key = (account_id.to_string(), device_id.to_string(), template.packet_type);
        self.templates.lock().unwrap().insert(key, template);
    }

    async fn get(&self, account_id: &str, device_id: &str, packet_type: u8) -> Option<Template> {
        let key = (account_id.to_string(), device_id.to_string(), packet_type);
        self.templates.lock().unwrap().get(&key).cloned()
    }
}
