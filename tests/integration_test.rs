// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use dmtpd::codec::{encode, Frame, Framing};
use dmtpd::event;
use dmtpd::packet;
use dmtpd::session::{Session, SessionConfig, SessionOutcome};
use dmtpd::store::memstore::{MemAccountStore, MemDeviceStore, MemEventStore, MemTemplateStore};
use dmtpd::store::{Account, Device};
use dmtpd::transport::TcpClientSocket;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn test_session_config() -> SessionConfig {
    SessionConfig {
        idle_timeout: Duration::from_millis(500),
        packet_timeout: Duration::from_millis(2000),
        session_timeout: Duration::from_secs(30),
        linger: Duration::from_secs(1),
        terminate_on_timeout: true,
        max_payload_len: 1024,
        eol: b'\n',
        ignore: vec![b'\r'],
        custom_types_enabled: true,
        duplicate_events_nack: false,
        block_checksum_retry_budget: 1,
    }
}

async fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let (server, _) = listener.accept().await.unwrap();
    (server, client.await.unwrap())
}

fn seed_active_device(devices: &MemDeviceStore, accounts: &MemAccountStore, unique_id: &[u8]) {
    accounts.put(Account {
        account_id: "acct1".into(),
        is_active: true,
        contact_email: None,
        notify_email: None,
    });
    devices.put(
        Device {
            account_id: "acct1".into(),
            device_id: "dev1".into(),
            is_active: true,
            conn_rate_max: None,
            conn_rate_window_secs: 0,
            event_rate_max: None,
            event_rate_window_secs: 0,
            supports_custom_types: true,
        },
        Some(unique_id.to_vec()),
    );
}

fn standard_event_payload(seq: u32, timestamp: u32, lat: i32, lng: i32) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&seq.to_be_bytes());
    p.extend_from_slice(&timestamp.to_be_bytes());
    p.extend_from_slice(&7u16.to_be_bytes());
    p.extend_from_slice(&lat.to_be_bytes());
    p.extend_from_slice(&lng.to_be_bytes());
    p.extend_from_slice(&0u16.to_be_bytes());
    p.extend_from_slice(&0u16.to_be_bytes());
    p.extend_from_slice(&0i32.to_be_bytes());
    p.extend_from_slice(&0u32.to_be_bytes());
    p.extend_from_slice(&0u16.to_be_bytes());
    p.extend_from_slice(&0u32.to_be_bytes());
    p.extend_from_slice(&0u32.to_be_bytes());
    p
}

fn block_checksum16(block_bytes: &[u8]) -> u16 {
    let mut lanes = [0u8; 2];
    for (i, &b) in block_bytes.iter().enumerate() {
        lanes[i % 2] ^= b;
    }
    u16::from_be_bytes(lanes)
}

async fn send_binary(stream: &mut TcpStream, packet_type: u8, payload: Vec<u8>) {
    let frame = Frame { framing: Framing::Binary, packet_type, payload };
    let bytes = encode(&frame, b'\n').unwrap();
    stream.write_all(&bytes).await.unwrap();
}

async fn read_reply(stream: &mut TcpStream) -> Frame {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    let packet_type = header[2];
    let len = header[3] as usize;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await.unwrap();
    }
    Frame { framing: Framing::Binary, packet_type, payload }
}

/// Every test drives a client script concurrently with the session future
/// via `tokio::join!` rather than `tokio::spawn`, since the session borrows
/// the (non-`'static`, stack-local) store fixtures directly.
#[tokio::test]
async fn happy_path_binary_two_events_acked() {
    let accounts = MemAccountStore::new();
    let devices = MemDeviceStore::new();
    let events = MemEventStore::new(None);
    let templates = MemTemplateStore::new();
    seed_active_device(&devices, &accounts, b"\xaa\xbb\xcc\xdd");

    let (server_stream, mut client) = loopback_pair().await;
    let server = Session::new(
        TcpClientSocket::new(server_stream, "127.0.0.1:0".parse().unwrap()),
        test_session_config(),
        &accounts,
        &devices,
        &events,
        &templates,
    );

    let client_script = async {
        send_binary(&mut client, packet::TYPE_UNIQUE_ID, b"\xaa\xbb\xcc\xdd".to_vec()).await;

        let first = standard_event_payload(7, 1_700_000_000, 1_000_000, 2_000_000);
        let second = standard_event_payload(8, 1_700_000_010, 1_000_100, 2_000_100);
        send_binary(&mut client, packet::TYPE_STANDARD_EVENT, first.clone()).await;
        send_binary(&mut client, packet::TYPE_STANDARD_EVENT, second.clone()).await;

        let mut block_bytes = Vec::new();
        block_bytes.extend_from_slice(&first);
        block_bytes.extend_from_slice(&second);
        let checksum = block_checksum16(&block_bytes);
        send_binary(&mut client, packet::TYPE_END_OF_BLOCK_16, checksum.to_be_bytes().to_vec()).await;

        let reply = read_reply(&mut client).await;
        assert_eq!(reply.packet_type, packet::TYPE_ACK);
        assert_eq!(u32::from_be_bytes(reply.payload.try_into().unwrap()), 8);

        send_binary(&mut client, packet::TYPE_SESSION_TERMINATE, Vec::new()).await;
    };

    let (outcome, ()) = tokio::join!(server.run(), client_script);
    assert_eq!(outcome, SessionOutcome::Clean);
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn bad_block_checksum_is_nacked_and_session_survives() {
    let accounts = MemAccountStore::new();
    let devices = MemDeviceStore::new();
    let events = MemEventStore::new(None);
    let templates = MemTemplateStore::new();
    seed_active_device(&devices, &accounts, b"\x01\x02\x03\x04");

    let (server_stream, mut client) = loopback_pair().await;
    let server = Session::new(
        TcpClientSocket::new(server_stream, "127.0.0.1:0".parse().unwrap()),
        test_session_config(),
        &accounts,
        &devices,
        &events,
        &templates,
    );

    let client_script = async {
        send_binary(&mut client, packet::TYPE_UNIQUE_ID, b"\x01\x02\x03\x04".to_vec()).await;

        let first = standard_event_payload(1, 1_700_000_000, 0, 0);
        let second = standard_event_payload(2, 1_700_000_001, 0, 0);
        send_binary(&mut client, packet::TYPE_STANDARD_EVENT, first.clone()).await;
        send_binary(&mut client, packet::TYPE_STANDARD_EVENT, second.clone()).await;

        let mut block_bytes = Vec::new();
        block_bytes.extend_from_slice(&first);
        block_bytes.extend_from_slice(&second);
        let mut bad_checksum = block_checksum16(&block_bytes);
        bad_checksum ^= 0x0001; // flip a bit

        send_binary(&mut client, packet::TYPE_END_OF_BLOCK_16, bad_checksum.to_be_bytes().to_vec()).await;

        let reply = read_reply(&mut client).await;
        assert_eq!(reply.packet_type, packet::TYPE_NACK);
        let code = u16::from_be_bytes([reply.payload[0], reply.payload[1]]);
        assert_eq!(code, dmtpd::error::NackCode::BlockChecksum.code());

        send_binary(&mut client, packet::TYPE_SESSION_TERMINATE, Vec::new()).await;
    };

    let (outcome, ()) = tokio::join!(server.run(), client_script);
    assert_eq!(outcome, SessionOutcome::Clean);
    assert_eq!(events.len(), 0, "the discarded block must not be persisted");
}

#[tokio::test]
async fn unknown_custom_type_is_nacked_and_session_continues() {
    let accounts = MemAccountStore::new();
    let devices = MemDeviceStore::new();
    let events = MemEventStore::new(None);
    let templates = MemTemplateStore::new();
    seed_active_device(&devices, &accounts, b"\xde\xad\xbe\xef");

    let (server_stream, mut client) = loopback_pair().await;
    let server = Session::new(
        TcpClientSocket::new(server_stream, "127.0.0.1:0".parse().unwrap()),
        test_session_config(),
        &accounts,
        &devices,
        &events,
        &templates,
    );

    let client_script = async {
        send_binary(&mut client, packet::TYPE_UNIQUE_ID, b"\xde\xad\xbe\xef".to_vec()).await;
        send_binary(&mut client, 0x31, vec![0, 0, 0, 1]).await;

        let reply = read_reply(&mut client).await;
        assert_eq!(reply.packet_type, packet::TYPE_NACK);
        let code = u16::from_be_bytes([reply.payload[0], reply.payload[1]]);
        assert_eq!(code, dmtpd::error::NackCode::FormatNotRecognized.code());

        send_binary(&mut client, packet::TYPE_SESSION_TERMINATE, Vec::new()).await;
    };

    let (outcome, ()) = tokio::join!(server.run(), client_script);
    assert_eq!(outcome, SessionOutcome::Clean);
}

#[tokio::test]
async fn account_inactive_terminates_without_reading_events() {
    let accounts = MemAccountStore::new();
    let devices = MemDeviceStore::new();
    let events = MemEventStore::new(None);
    let templates = MemTemplateStore::new();

    accounts.put(Account {
        account_id: "acct1".into(),
        is_active: false,
        contact_email: None,
        notify_email: None,
    });
    devices.put(
        Device {
            account_id: "acct1".into(),
            device_id: "dev1".into(),
            is_active: true,
            conn_rate_max: None,
            conn_rate_window_secs: 0,
            event_rate_max: None,
            event_rate_window_secs: 0,
            supports_custom_types: false,
        },
        Some(b"\x99\x99\x99\x99".to_vec()),
    );

    let (server_stream, mut client) = loopback_pair().await;
    let server = Session::new(
        TcpClientSocket::new(server_stream, "127.0.0.1:0".parse().unwrap()),
        test_session_config(),
        &accounts,
        &devices,
        &events,
        &templates,
    );

    let client_script = async {
        send_binary(&mut client, packet::TYPE_UNIQUE_ID, b"\x99\x99\x99\x99".to_vec()).await;

        let reply = read_reply(&mut client).await;
        assert_eq!(reply.packet_type, packet::TYPE_NACK);
        let code = u16::from_be_bytes([reply.payload[0], reply.payload[1]]);
        assert_eq!(code, dmtpd::error::NackCode::AccountInactive.code());
    };

    let (outcome, ()) = tokio::join!(server.run(), client_script);
    assert_eq!(outcome, SessionOutcome::Rejected(dmtpd::error::NackCode::AccountInactive));
    assert!(events.is_empty());
}

#[tokio::test]
async fn template_lifecycle_defines_and_applies_with_repeat_last() {
    let accounts = MemAccountStore::new();
    let devices = MemDeviceStore::new();
    let events = MemEventStore::new(None);
    let templates = MemTemplateStore::new();
    seed_active_device(&devices, &accounts, b"\x10\x20\x30\x40");

    let (server_stream, mut client) = loopback_pair().await;
    let server = Session::new(
        TcpClientSocket::new(server_stream, "127.0.0.1:0".parse().unwrap()),
        test_session_config(),
        &accounts,
        &devices,
        &events,
        &templates,
    );

    let client_script = async {
        send_binary(&mut client, packet::TYPE_UNIQUE_ID, b"\x10\x20\x30\x40".to_vec()).await;

        // Define custom type 0x30: timestamp(4), statusCode(4 widened), lat(3), lng(3), repeatLast.
        let mut define = vec![0x30, 1, 4];
        define.extend_from_slice(&[event::field::TIMESTAMP, 0, 0, 4]);
        define.extend_from_slice(&[event::field::STATUS_CODE, 0, 1, 4]);
        define.extend_from_slice(&[event::field::LATITUDE, 0, 2, 3]);
        define.extend_from_slice(&[event::field::LONGITUDE, 0, 3, 3]);
        send_binary(&mut client, packet::TYPE_TEMPLATE_DEFINE, define).await;

        let mut record_bytes = Vec::new();
        for (ts, status) in [(1_700_000_000u32, 1u32), (1_700_000_100u32, 2u32)] {
            record_bytes.extend_from_slice(&ts.to_be_bytes());
            record_bytes.extend_from_slice(&status.to_be_bytes());
            record_bytes.extend_from_slice(&[0, 0, 1]);
            record_bytes.extend_from_slice(&[0, 0, 2]);
        }
        send_binary(&mut client, 0x30, record_bytes.clone()).await;

        let checksum = block_checksum16(&record_bytes);
        send_binary(&mut client, packet::TYPE_END_OF_BLOCK_16, checksum.to_be_bytes().to_vec()).await;

        let reply = read_reply(&mut client).await;
        assert_eq!(reply.packet_type, packet::TYPE_ACK);

        send_binary(&mut client, packet::TYPE_SESSION_TERMINATE, Vec::new()).await;
    };

    let (outcome, ()) = tokio::join!(server.run(), client_script);
    assert_eq!(outcome, SessionOutcome::Clean);
    assert_eq!(events.len(), 2);
}
