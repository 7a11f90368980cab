//! Channels from one process to its siblings
//!
//! Worker slots receive messages through an in-memory mailbox. Auxiliary
//! processes receive them as length-delimited frames on a byte stream.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::message::PipeMessage;
use crate::error::{Error, Result};

pub type WorkerId = usize;

/// Identity of the process running a driver
///
/// Workers have both a worker id and a pid; auxiliary processes only a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub worker_id: Option<WorkerId>,
}

impl ProcessIdentity {
    #[must_use]
    pub const fn worker(worker_id: WorkerId, pid: u32) -> Self {
        Self {
            pid,
            worker_id: Some(worker_id),
        }
    }

    #[must_use]
    pub const fn auxiliary(pid: u32) -> Self {
        Self { pid, worker_id: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecipientKind {
    Worker(WorkerId),
    Process(u32),
}

impl RecipientKind {
    /// Metric label
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Worker(_) => "worker",
            Self::Process(_) => "process",
        }
    }
}

impl fmt::Display for RecipientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker(id) => write!(f, "worker#{id}"),
            Self::Process(pid) => write!(f, "process#{pid}"),
        }
    }
}

/// Delivers a message to one recipient
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &PipeMessage) -> Result<()>;
}

/// Mailbox of a worker slot
pub struct WorkerSender {
    tx: mpsc::Sender<PipeMessage>,
}

impl WorkerSender {
    #[must_use]
    pub const fn new(tx: mpsc::Sender<PipeMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl MessageSender for WorkerSender {
    async fn send(&self, message: &PipeMessage) -> Result<()> {
        self.tx
            .send(message.clone())
            .await
            .map_err(|_| Error::Transport("worker mailbox closed".to_string()))
    }
}

/// Writes serialized messages to an auxiliary process
pub struct ProcessSender<W> {
    writer: Mutex<FramedWrite<W, LengthDelimitedCodec>>,
    timeout: Duration,
}

impl<W: AsyncWrite + Unpin + Send> ProcessSender<W> {
    pub fn new(writer: W, timeout: Duration) -> Self {
        Self {
            writer: Mutex::new(FramedWrite::new(writer, LengthDelimitedCodec::new())),
            timeout,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageSender for ProcessSender<W> {
    async fn send(&self, message: &PipeMessage) -> Result<()> {
        let frame = message.encode()?;
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.send(frame).await
        };

        match tokio::time::timeout(self.timeout, write).await {
            Ok(result) => result.map_err(Error::Io),
            Err(_) => Err(Error::Timeout(format!(
                "process send exceeded {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

/// Reading end of an auxiliary process channel
pub struct ProcessReceiver<R> {
    reader: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> ProcessReceiver<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: FramedRead::new(reader, LengthDelimitedCodec::new()),
        }
    }

    /// Next message, `None` once the writing side is gone
    pub async fn recv(&mut self) -> Option<Result<PipeMessage>> {
        let frame = self.reader.next().await?;
        Some(frame.map_err(Error::Io).and_then(|bytes| PipeMessage::decode(&bytes)))
    }
}

/// Connected sender/receiver pair over a Unix socket pair
#[cfg(unix)]
pub fn process_channel(
    timeout: Duration,
) -> Result<(ProcessSender<tokio::net::UnixStream>, ProcessReceiver<tokio::net::UnixStream>)> {
    let (tx, rx) = tokio::net::UnixStream::pair()?;
    Ok((ProcessSender::new(tx, timeout), ProcessReceiver::new(rx)))
}

/// Every recipient known to a server: worker slots and auxiliary processes
#[derive(Default, Clone)]
pub struct ServerTransport {
    workers: Vec<(WorkerId, Arc<dyn MessageSender>)>,
    processes: Vec<(u32, Arc<dyn MessageSender>)>,
}

impl ServerTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker(&mut self, worker_id: WorkerId, sender: Arc<dyn MessageSender>) {
        self.workers.push((worker_id, sender));
    }

    pub fn add_process(&mut self, pid: u32, sender: Arc<dyn MessageSender>) {
        self.processes.push((pid, sender));
    }

    #[must_use]
    pub fn workers(&self) -> &[(WorkerId, Arc<dyn MessageSender>)] {
        &self.workers
    }

    #[must_use]
    pub fn processes(&self) -> &[(u32, Arc<dyn MessageSender>)] {
        &self.processes
    }

    /// Recipients of a fan-out from `identity`, never including itself
    pub fn recipients_for(
        &self,
        identity: ProcessIdentity,
    ) -> impl Iterator<Item = (RecipientKind, &Arc<dyn MessageSender>)> {
        let workers = self
            .workers
            .iter()
            .filter(move |(id, _)| Some(*id) != identity.worker_id)
            .map(|(id, sender)| (RecipientKind::Worker(*id), sender));
        let processes = self
            .processes
            .iter()
            .filter(move |(pid, _)| *pid != identity.pid)
            .map(|(pid, sender)| (RecipientKind::Process(*pid), sender));
        workers.chain(processes)
    }
}
