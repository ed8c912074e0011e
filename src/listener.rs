// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dual TCP/UDP acceptor with a bounded worker pool (§4.F).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::session::{Session, SessionConfig, SessionOutcome};
use crate::store::{AccountStore, DeviceStore, EventStore, TemplateStore};
use crate::transport::{TcpClientSocket, UdpClientSocket};

/// Maximum bytes in a single UDP datagram the listener will read (§4.F:
/// "decode all frames from the single datagram until exhausted").
const UDP_MAX_DATAGRAM: usize = 65_507;

/// How [`Listener::shutdown`] treats sessions still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Let queued and in-flight sessions finish normally.
    Drain,
    /// Stop accepting; let only the current packet of each session finish.
    HardStop,
}

/// Owns the listening sockets and hands accepted transports to [`Session`]
/// workers bounded by `pool.max` (§4.F).
pub struct Listener<A, D, Ev, T> {
    cfg: Config,
    account_store: Arc<A>,
    device_store: Arc<D>,
    event_store: Arc<Ev>,
    template_store: Arc<T>,
}

impl<A, D, Ev, T> Listener<A, D, Ev, T>
where
    A: AccountStore + 'static,
    D: DeviceStore + 'static,
    Ev: EventStore + 'static,
    T: TemplateStore + 'static,
{
    pub fn new(
        cfg: Config,
        account_store: Arc<A>,
        device_store: Arc<D>,
        event_store: Arc<Ev>,
        template_store: Arc<T>,
    ) -> Self {
        Listener {
            cfg,
            account_store,
            device_store,
            event_store,
            template_store,
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout: Duration::from_millis(self.cfg.timeout.idle_ms),
            packet_timeout: Duration::from_millis(self.cfg.timeout.packet_ms),
            session_timeout: Duration::from_millis(self.cfg.timeout.session_ms),
            linger: Duration::from_secs(u64::from(self.cfg.timeout.linger_sec)),
            terminate_on_timeout: self.cfg.timeout.terminate_on_timeout,
            // Binary frames are capped at 255 bytes by their 1-byte length
            // field regardless of `packet.max_len_binary`; the wider of the
            // two configured maxima bounds both framings at the codec layer.
            max_payload_len: self
                .cfg
                .packet
                .max_len_ascii
                .max(self.cfg.packet.max_len_binary) as usize,
            eol: self.cfg.packet.eol,
            ignore: self.cfg.packet.ignore.clone(),
            custom_types_enabled: self.cfg.template.custom_enabled,
            duplicate_events_nack: self.cfg.event.duplicate_nack,
            block_checksum_retry_budget: 1,
        }
    }

    /// Run the listener until `cancel` fires, then stop accepting and wait
    /// for in-flight sessions per `mode`.
    pub async fn serve(self, cancel: CancellationToken, mode: ShutdownMode) -> std::io::Result<()> {
        let this = Arc::new(self);
        let permits = Arc::new(Semaphore::new(this.cfg.pool.max as usize));
        let mut sessions = JoinSet::new();

        let tcp = if let Some(port) = this.cfg.listen.tcp_port {
            Some(TcpListener::bind(("0.0.0.0", port)).await?)
        } else {
            None
        };
        let udp = if let Some(port) = this.cfg.listen.udp_port {
            Some(Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?))
        } else {
            None
        };

        info!(
            tcp = ?this.cfg.listen.tcp_port,
            udp = ?this.cfg.listen.udp_port,
            pool_max = this.cfg.pool.max,
            "dmtpd listening"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                accepted = accept_tcp(tcp.as_ref()), if tcp.is_some() => {
                    if let Some((stream, peer)) = accepted {
                        spawn_tcp_session(&this, &permits, &mut sessions, stream, peer);
                    }
                }
                datagram = recv_udp(udp.as_deref()), if udp.is_some() => {
                    if let Some((bytes, peer)) = datagram {
                        spawn_udp_session(&this, &permits, &mut sessions, udp.clone().unwrap(), bytes, peer);
                    }
                }
            }
        }

        match mode {
            ShutdownMode::Drain => {
                debug!(remaining = sessions.len(), "draining in-flight sessions");
                while sessions.join_next().await.is_some() {}
            }
            ShutdownMode::HardStop => {
                debug!(remaining = sessions.len(), "hard-stopping in-flight sessions");
                sessions.abort_all();
                while sessions.join_next().await.is_some() {}
            }
        }
        Ok(())
    }
}

async fn accept_tcp(listener: Option<&TcpListener>) -> Option<(tokio::net::TcpStream, SocketAddr)> {
    match listener {
        Some(l) => match l.accept().await {
            Ok(pair) => Some(pair),
            Err(e) => {
                warn!(error = %e, "tcp accept failed");
                None
            }
        },
        None => std::future::pending().await,
    }
}

async fn recv_udp(socket: Option<&UdpSocket>) -> Option<(Vec<u8>, SocketAddr)> {
    match socket {
        Some(s) => {
            let mut buf = vec![0u8; UDP_MAX_DATAGRAM];
            match s.recv_from(&mut buf).await {
                Ok((n, peer)) => {
                    buf.truncate(n);
                    Some((buf, peer))
                }
                Err(e) => {
                    warn!(error = %e, "udp recv failed");
                    None
                }
            }
        }
        None => std::future::pending().await,
    }
}

fn spawn_tcp_session<A, D, Ev, T>(
    listener: &Arc<Listener<A, D, Ev, T>>,
    permits: &Arc<Semaphore>,
    sessions: &mut JoinSet<SessionOutcome>,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
) where
    A: AccountStore + 'static,
    D: DeviceStore + 'static,
    Ev: EventStore + 'static,
    T: TemplateStore + 'static,
{
    let listener = Arc::clone(listener);
    let permits = Arc::clone(permits);
    sessions.spawn(async move {
        let Ok(permit) = permits.acquire_owned().await else {
            return SessionOutcome::Clean;
        };
        let socket = TcpClientSocket::new(stream, peer);
        let session_cfg = listener.session_config();
        let outcome = Session::new(
            socket,
            session_cfg,
            listener.account_store.as_ref(),
            listener.device_store.as_ref(),
            listener.event_store.as_ref(),
            listener.template_store.as_ref(),
        )
        .run()
        .await;
        drop(permit);
        outcome
    });
}

fn spawn_udp_session<A, D, Ev, T>(
    listener: &Arc<Listener<A, D, Ev, T>>,
    permits: &Arc<Semaphore>,
    sessions: &mut JoinSet<SessionOutcome>,
    socket: Arc<UdpSocket>,
    datagram: Vec<u8>,
    peer: SocketAddr,
) where
    A: AccountStore + 'static,
    D: DeviceStore + 'static,
    Ev: EventStore + 'static,
    T: TemplateStore + 'static,
{
    let listener = Arc::clone(listener);
    let permits = Arc::clone(permits);
    sessions.spawn(async move {
        let Ok(permit) = permits.acquire_owned().await else {
            return SessionOutcome::Clean;
        };
        let client = UdpClientSocket::new(socket, peer, datagram);
        let session_cfg = listener.session_config();
        let outcome = Session::new(
            client,
            session_cfg,
            listener.account_store.as_ref(),
            listener.device_store.as_ref(),
            listener.event_store.as_ref(),
            listener.template_store.as_ref(),
        )
        .run()
        .await;
        drop(permit);
        outcome
    });
}
