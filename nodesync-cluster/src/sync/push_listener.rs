//! UDP endpoint for registry push notifications
//!
//! The registry announces a changed service with a small JSON datagram. The
//! listener re-queries that one service and pushes it through the driver
//! with a forced refresh, instead of waiting for the next poll tick.
//!
//! Replies are best effort: every packet gets an ack, none is retried.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::driver::SyncDriver;
use crate::discovery::fetcher::MAX_CONCURRENT_QUERIES;
use crate::error::{Error, Result};
use nodesync_core::metrics::PUSH_PACKETS;
use nodesync_core::SyncBatch;

/// Largest datagram accepted
const MAX_PACKET_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckType {
    PushAck,
    DumpAck,
    UnknownAck,
}

impl AckType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PushAck => "push-ack",
            Self::DumpAck => "dump-ack",
            Self::UnknownAck => "unknown-ack",
        }
    }
}

/// Reply datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    #[serde(rename = "type")]
    pub ack_type: AckType,
    #[serde(rename = "lastRefTime")]
    pub last_ref_time: String,
    pub data: String,
}

impl PushAck {
    fn new(ack_type: AckType, last_ref_time: String) -> Self {
        Self {
            ack_type,
            last_ref_time,
            data: String::new(),
        }
    }
}

/// Turns one datagram into driver work and an ack
pub struct PushHandler {
    driver: Arc<SyncDriver>,
}

impl PushHandler {
    #[must_use]
    pub const fn new(driver: Arc<SyncDriver>) -> Self {
        Self { driver }
    }

    /// Handle one packet; never fails, the worst case is `unknown-ack`
    pub async fn handle_packet(&self, payload: &[u8]) -> PushAck {
        let Ok(Value::Object(message)) = serde_json::from_slice::<Value>(payload) else {
            debug!(len = payload.len(), "Ignoring unparsable push packet");
            return PushAck::new(AckType::UnknownAck, now_millis());
        };

        let last_ref_time = message
            .get("lastRefTime")
            .and_then(ref_time_string)
            .unwrap_or_else(now_millis);

        let ack_type = match message.get("type").and_then(Value::as_str) {
            Some("dom" | "service") => {
                if let Some(name) = pushed_service_name(message.get("data")) {
                    self.refresh_service(&name).await;
                }
                AckType::PushAck
            }
            Some("dump") => AckType::DumpAck,
            Some(other) => {
                debug!(push_type = %other, "Unknown push packet type");
                AckType::UnknownAck
            }
            None => AckType::UnknownAck,
        };

        PushAck::new(ack_type, last_ref_time)
    }

    /// Re-query one consumer and propagate it with a forced refresh
    async fn refresh_service(&self, service_name: &str) {
        let Some(consumer) = self
            .driver
            .consumers()
            .iter()
            .find(|c| c.name == service_name)
            .cloned()
        else {
            debug!(service = %service_name, "Push for a service this process does not consume");
            return;
        };

        let snapshot = self.driver.fetcher().fetch_one(&consumer).await;
        info!(
            service = %service_name,
            nodes = snapshot.nodes.len(),
            "Registry pushed a service change"
        );

        match self.driver.sync_nodes(SyncBatch::single(snapshot), true).await {
            Ok(_) => {}
            Err(Error::FanOutIncomplete { failed, total }) => warn!(
                service = %service_name,
                failed = failed,
                total = total,
                "Pushed change not delivered to every sibling, next poll retries"
            ),
            Err(e) => error!(service = %service_name, error = %e, "Failed to sync pushed change"),
        }
    }
}

/// `data` carries `{"name": "<group>@@<service>"}`, usually JSON-encoded
/// inside a string
fn pushed_service_name(data: Option<&Value>) -> Option<String> {
    let content = match data? {
        Value::String(encoded) => serde_json::from_str::<Value>(encoded).ok()?,
        other => other.clone(),
    };
    let name = content.get("name")?.as_str()?;
    let service = name.split("@@").nth(1)?;
    (!service.is_empty()).then(|| service.to_string())
}

fn ref_time_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(|v| v.to_string())
            .or_else(|| n.as_u64().map(|v| v.to_string()))
            .or_else(|| n.as_f64().map(|v| format!("{v:.0}"))),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn now_millis() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}

/// UDP server feeding [`PushHandler`]
///
/// At most [`MAX_CONCURRENT_QUERIES`] packets are handled at once; further
/// datagrams wait in the socket buffer.
pub struct PushListener {
    socket: Arc<UdpSocket>,
    handler: Arc<PushHandler>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl PushListener {
    pub async fn bind(
        addr: &str,
        handler: Arc<PushHandler>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(bind_addr = %socket.local_addr()?, "Push listener bound");
        Ok(Self {
            socket: Arc::new(socket),
            handler,
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_QUERIES)),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Receive until shutdown; each packet is handled on its own task
    pub async fn run(self) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let permit = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => permit,
            };
            let Ok(permit) = permit else { break };

            let received = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, peer_addr)) => {
                    let data = buf[..len].to_vec();
                    let socket = Arc::clone(&self.socket);
                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(Self::handle(socket, handler, data, peer_addr, permit));
                }
                Err(e) => {
                    error!(error = %e, "Failed to receive push packet");
                }
            }
        }

        info!("Push listener stopped");
    }

    async fn handle(
        socket: Arc<UdpSocket>,
        handler: Arc<PushHandler>,
        data: Vec<u8>,
        peer_addr: SocketAddr,
        _permit: OwnedSemaphorePermit,
    ) {
        // A panicking handler must not take the listener with it
        let ack = match tokio::spawn(async move { handler.handle_packet(&data).await }).await {
            Ok(ack) => ack,
            Err(e) => {
                error!(peer_addr = %peer_addr, error = %e, "Push packet handler failed");
                return;
            }
        };

        PUSH_PACKETS.with_label_values(&[ack.ack_type.as_str()]).inc();
        let reply = match serde_json::to_vec(&ack) {
            Ok(reply) => reply,
            Err(e) => {
                error!(peer_addr = %peer_addr, error = %e, "Failed to encode push ack");
                return;
            }
        };
        if let Err(e) = socket.send_to(&reply, peer_addr).await {
            warn!(peer_addr = %peer_addr, error = %e, "Failed to send push ack");
        }
    }
}
