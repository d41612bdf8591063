//! Request arbiter: serializes every logical client onto the single
//! transport, in arrival order, and routes each completion back to its
//! originator by client tag.
//!
//! Routing is by tag rather than by slave address: the scanner probes
//! addresses that may or may not belong to a device and must not be confused
//! by poller traffic at those addresses. Single-in-flight is structural:
//! the dispatch loop awaits each completion before pulling the next
//! submission.

use anyhow::{anyhow, Result};

use super::frame::{Request, Response};
use super::transport::TransportJob;

/// Identifies the logical originator of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientId {
    Scanner,
    /// Poller for the device at the given address at construction time.
    Poller(u8),
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientId::Scanner => write!(f, "scanner"),
            ClientId::Poller(address) => write!(f, "poller@{address}"),
        }
    }
}

/// One queued request together with its reply route.
pub struct Submission {
    pub client: ClientId,
    pub request: Request,
    pub reply: flume::Sender<Response>,
}

/// Cloneable entry point handed to every component that talks Modbus.
#[derive(Clone)]
pub struct ArbiterHandle {
    submissions: flume::Sender<Submission>,
}

impl ArbiterHandle {
    /// Start the arbiter on the current runtime, dispatching onto `jobs`.
    pub fn start(jobs: flume::Sender<TransportJob>) -> Self {
        let (submissions_tx, submissions_rx) = flume::unbounded();
        tokio::spawn(run(jobs, submissions_rx));
        Self {
            submissions: submissions_tx,
        }
    }

    /// Create a client endpoint with its own reply channel.
    pub fn client(&self, id: ClientId) -> ArbiterClient {
        let (reply_tx, reply_rx) = flume::unbounded();
        ArbiterClient {
            id,
            submissions: self.submissions.clone(),
            reply_tx,
            reply_rx,
        }
    }
}

/// Dispatch loop: strict FIFO, one request in flight at a time.
pub async fn run(jobs: flume::Sender<TransportJob>, submissions: flume::Receiver<Submission>) {
    while let Ok(submission) = submissions.recv_async().await {
        let (done_tx, done_rx) = flume::bounded(1);
        let job = TransportJob {
            request: submission.request,
            completion: done_tx,
        };
        if jobs.send_async(job).await.is_err() {
            log::error!("transport gone, arbiter exiting");
            return;
        }
        match done_rx.recv_async().await {
            Ok(response) => {
                // A client that went away simply misses its reply.
                let _ = submission.reply.send(response);
            }
            Err(_) => {
                log::error!(
                    "transport dropped the in-flight request from {}",
                    submission.client
                );
                return;
            }
        }
    }
    log::debug!("all clients gone, arbiter exiting");
}

/// Per-client endpoint: submits requests and awaits replies routed by tag.
pub struct ArbiterClient {
    id: ClientId,
    submissions: flume::Sender<Submission>,
    reply_tx: flume::Sender<Response>,
    reply_rx: flume::Receiver<Response>,
}

impl ArbiterClient {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Submit one request and await its completion.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.submissions
            .send_async(Submission {
                client: self.id,
                request,
                reply: self.reply_tx.clone(),
            })
            .await
            .map_err(|_| anyhow!("arbiter is gone"))?;
        self.reply_rx
            .recv_async()
            .await
            .map_err(|_| anyhow!("arbiter dropped the reply channel"))
    }

    pub async fn read_holding_registers(
        &self,
        slave: u8,
        start_register: u16,
        count: u16,
    ) -> Result<Response> {
        self.execute(Request::read_holding_registers(slave, start_register, count))
            .await
    }

    pub async fn write_single_register(
        &self,
        slave: u8,
        register: u16,
        value: u16,
    ) -> Result<Response> {
        self.execute(Request::write_single_register(slave, register, value))
            .await
    }
}
