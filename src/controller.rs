//! The controller loop: multiplexes the client and worker endpoints,
//! dispatches messages to handlers, and owns the periodic maintenance
//! sweep.
//!
//! Every handler is isolated — a decode or dispatch failure for one
//! datagram is logged and the loop continues. Only startup (binding the
//! two UDP endpoints) is fatal.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codec::{self, Message, MessageType};
use crate::config::Config;
use crate::counters::Counters;
use crate::net::Endpoint;
use crate::reassembler::{IngestOutcome, Reassembler};
use crate::registry::{Registry, WorkerAddr};
use crate::signals::Phase;
use crate::tracker::Tracker;

/// Interval between maintenance sweeps.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

/// Poll timeout per endpoint per loop iteration. Short enough that the
/// dispatcher alternates endpoints responsively without busy-spinning.
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

const ERROR_CODE_NO_WORKERS: u16 = 0x0001;
const ERROR_CODE_WORKER_BUSY: u16 = 0x0002;

fn build_error_payload(code: u16, message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + message.len());
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(message.as_bytes());
    out
}

/// The controller's routing and lifecycle engine: owns both datagram
/// endpoints and the three pieces of shared state (registry, tracker,
/// reassembler) that the dispatcher, maintenance, and observability tasks
/// all touch.
pub struct Controller {
    client_endpoint: Endpoint,
    worker_endpoint: Endpoint,
    registry: Registry,
    tracker: Tracker,
    reassembler: Reassembler,
    counters: Arc<Counters>,
}

impl Controller {
    /// Bind both UDP endpoints: client port then worker port. The first
    /// failure is returned to the caller and is fatal (no background task
    /// has been started yet).
    pub async fn bind(config: &Config) -> Result<Self, crate::error::Error> {
        let client_addr = SocketAddr::new(config.bind_addr, config.client_port);
        let worker_addr = SocketAddr::new(config.bind_addr, config.worker_port);

        let client_endpoint = Endpoint::bind(client_addr)
            .await
            .map_err(|source| crate::error::Error::Bind {
                addr: client_addr,
                source,
            })?;
        let worker_endpoint = Endpoint::bind(worker_addr)
            .await
            .map_err(|source| crate::error::Error::Bind {
                addr: worker_addr,
                source,
            })?;

        info!(%client_addr, %worker_addr, "head controller bound");

        Ok(Self {
            client_endpoint,
            worker_endpoint,
            registry: Registry::new(config.worker_timeout),
            tracker: Tracker::new(config.request_timeout, config.max_pending),
            reassembler: Reassembler::new(config.request_timeout),
            counters: Arc::new(Counters::new()),
        })
    }

    #[must_use]
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    #[must_use]
    pub fn tracker(&self) -> Tracker {
        self.tracker.clone()
    }

    #[must_use]
    pub fn reassembler(&self) -> Reassembler {
        self.reassembler.clone()
    }

    /// The client-facing endpoint's bound address. Useful in tests that
    /// bind to port 0 and need to learn the OS-assigned port.
    pub fn client_addr(&self) -> Result<SocketAddr, crate::net::endpoint::Error> {
        self.client_endpoint.local_addr()
    }

    /// The worker-facing endpoint's bound address.
    pub fn worker_addr(&self) -> Result<SocketAddr, crate::net::endpoint::Error> {
        self.worker_endpoint.local_addr()
    }

    #[must_use]
    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// Run the maintenance sweep on a fixed cadence until shutdown is
    /// signalled. Independent of the dispatcher: runs as its own task.
    pub async fn run_maintenance(
        registry: Registry,
        tracker: Tracker,
        reassembler: Reassembler,
        mut shutdown: Phase,
    ) {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                () = shutdown.recv() => {
                    info!("maintenance task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let pruned = registry.prune_stale();
                    let expired = tracker.expire();
                    let stale_chunks = reassembler.sweep_stale();
                    if pruned > 0 || expired > 0 || stale_chunks > 0 {
                        debug!(pruned, expired, stale_chunks, "maintenance sweep");
                    }
                }
            }
        }
    }

    /// The main dispatcher loop. Alternates polling the worker and client
    /// endpoints; each iteration's handlers are infallible from the loop's
    /// point of view — failures are logged internally and never propagate.
    pub async fn run(&self, mut shutdown: Phase) {
        info!("controller dispatch loop starting");
        while !shutdown.is_shutdown() {
            if let Some((msg, from)) = self.worker_endpoint.recv(POLL_TIMEOUT).await {
                self.handle_worker_message(msg, from).await;
            }
            if shutdown.is_shutdown() {
                break;
            }
            if let Some((msg, from)) = self.client_endpoint.recv(POLL_TIMEOUT).await {
                self.handle_client_message(msg, from).await;
            }
        }
        info!("controller dispatch loop stopped");
    }

    /// Idempotent endpoint teardown, called once the dispatch loop has
    /// returned. Safe to call more than once.
    pub fn shutdown(&self) {
        self.client_endpoint.close();
        self.worker_endpoint.close();
    }

    async fn handle_worker_message(&self, msg: Message, from: SocketAddr) {
        self.counters.record_received(codec::encode(&msg).len());
        match msg.msg_type {
            MessageType::Heartbeat => self.handle_heartbeat(msg, from.ip()),
            MessageType::Result => self.handle_worker_result(msg, from).await,
            MessageType::Chunk => self.handle_chunk(msg, from).await,
            MessageType::Error => self.handle_worker_error(msg, from).await,
            other => {
                warn!(?other, %from, "unexpected message type on worker port");
            }
        }
    }

    fn handle_heartbeat(&self, msg: Message, source_ip: IpAddr) {
        let Ok(port_str) = std::str::from_utf8(&msg.payload) else {
            warn!(%source_ip, "heartbeat payload is not valid UTF-8, dropping");
            return;
        };
        let Ok(port) = port_str.trim().parse::<u16>() else {
            warn!(%source_ip, payload = %port_str, "heartbeat payload is not a valid port, dropping");
            return;
        };
        let worker_addr: WorkerAddr = (source_ip, port);
        if self.registry.register(worker_addr) {
            info!(ip = %worker_addr.0, port = worker_addr.1, "new worker registered");
        }
    }

    async fn handle_worker_result(&self, msg: Message, from: SocketAddr) {
        self.complete_and_forward(msg.sequence, msg.timestamp, msg.payload, from, true)
            .await;
    }

    async fn handle_chunk(&self, msg: Message, from: SocketAddr) {
        let Some(chunk) = codec::decode_chunk_payload(&msg.payload) else {
            warn!(sequence = msg.sequence, "malformed chunk payload, dropping");
            return;
        };
        match self.reassembler.ingest(
            msg.sequence,
            chunk.total_chunks,
            chunk.index,
            chunk.checksum,
            chunk.data,
        ) {
            IngestOutcome::Incomplete => {}
            IngestOutcome::Mismatch => {
                warn!(sequence = msg.sequence, "chunk assembly failed checksum or metadata mismatch");
            }
            IngestOutcome::Complete(payload) => {
                self.complete_and_forward(msg.sequence, msg.timestamp, payload, from, true)
                    .await;
            }
        }
    }

    /// Shared tail of the RESULT and completed-CHUNK paths: look up the
    /// pending request, credit the worker, and forward the assembled
    /// payload to the client.
    async fn complete_and_forward(
        &self,
        sequence: u32,
        timestamp: u64,
        payload: Vec<u8>,
        worker_from: SocketAddr,
        success: bool,
    ) {
        let Some(pending) = self.tracker.complete(sequence) else {
            warn!(sequence, "result for unknown or already-completed request, dropping");
            return;
        };

        let latency_ms = pending.created_at.elapsed().as_secs_f64() * 1000.0;
        let worker_addr = pending
            .worker_address
            .unwrap_or((worker_from.ip(), worker_from.port()));
        self.registry.complete(worker_addr, latency_ms, success);

        let response = Message {
            msg_type: MessageType::Result,
            sequence,
            timestamp,
            payload,
        };
        match self
            .client_endpoint
            .send_chunked(&response, pending.client_address)
            .await
        {
            Ok(report) => self.counters.record_sent(report.datagrams as u64, report.bytes),
            Err(e) => warn!(sequence, "failed to forward result to client: {e}"),
        }
        self.counters.record_task_processed();
    }

    async fn handle_worker_error(&self, msg: Message, from: SocketAddr) {
        let Some(pending) = self.tracker.complete(msg.sequence) else {
            warn!(sequence = msg.sequence, "error for unknown or already-completed request, dropping");
            return;
        };
        let worker_addr = pending
            .worker_address
            .unwrap_or((from.ip(), from.port()));
        self.registry.complete(worker_addr, 0.0, false);

        let forwarded = Message {
            msg_type: MessageType::Error,
            sequence: msg.sequence,
            timestamp: msg.timestamp,
            payload: msg.payload,
        };
        match self.client_endpoint.send(&forwarded, pending.client_address).await {
            Ok(bytes) => self.counters.record_sent(1, bytes),
            Err(e) => warn!(sequence = msg.sequence, "failed to forward error to client: {e}"),
        }
        self.counters.record_task_failed();
    }

    async fn handle_client_message(&self, msg: Message, from: SocketAddr) {
        self.counters.record_received(codec::encode(&msg).len());
        match msg.msg_type {
            MessageType::Task => self.handle_task(msg, from).await,
            MessageType::Health => self.handle_health(msg, from).await,
            other => {
                debug!(?other, %from, "ignoring unsupported message type on client port");
            }
        }
    }

    async fn handle_task(&self, msg: Message, from: SocketAddr) {
        let Some(worker_addr) = self.registry.pick(true) else {
            self.send_client_error(msg.sequence, from, ERROR_CODE_NO_WORKERS, "NO_WORKERS")
                .await;
            return;
        };

        let accepted = self
            .tracker
            .add(msg.sequence, from, Some(worker_addr), msg.payload.len());
        if !accepted {
            self.send_client_error(msg.sequence, from, ERROR_CODE_WORKER_BUSY, "WORKER_BUSY")
                .await;
            return;
        }

        self.registry.assign(worker_addr, msg.sequence);
        let forwarded = Message {
            msg_type: MessageType::Task,
            sequence: msg.sequence,
            timestamp: msg.timestamp,
            payload: msg.payload,
        };
        let worker_socket = SocketAddr::new(worker_addr.0, worker_addr.1);
        match self.worker_endpoint.send(&forwarded, worker_socket).await {
            Ok(bytes) => self.counters.record_sent(1, bytes),
            Err(e) => warn!(sequence = msg.sequence, "failed to forward task to worker: {e}"),
        }
    }

    async fn send_client_error(&self, sequence: u32, to: SocketAddr, code: u16, message: &str) {
        let err = Message::new(MessageType::Error, sequence, build_error_payload(code, message));
        match self.client_endpoint.send(&err, to).await {
            Ok(bytes) => self.counters.record_sent(1, bytes),
            Err(e) => warn!(sequence, "failed to send error to client: {e}"),
        }
    }

    async fn handle_health(&self, msg: Message, from: SocketAddr) {
        let snapshot = self.registry.snapshot();
        let payload = serde_json::to_vec(&snapshot).unwrap_or_default();
        let response = Message::new(MessageType::Health, msg.sequence, payload);
        match self.client_endpoint.send(&response, from).await {
            Ok(bytes) => self.counters.record_sent(1, bytes),
            Err(e) => warn!(sequence = msg.sequence, "failed to reply to HEALTH request: {e}"),
        }
    }
}
