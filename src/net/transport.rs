//! Worker side of the network.
//!
//! The scheduler is synchronous, so the transport owns a small tokio runtime
//! that pumps every QUIC stream in the background. Everything that arrives,
//! from brokers or from peers, is funnelled into one channel drained by the
//! scheduler thread; nothing here touches task state.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::future::join_all;
use hashbrown::{HashMap, HashSet};
use tokio::{
    runtime::Runtime,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    advertised_addr, dial, endpoint,
    link::{send_once, FrameRecvStream, FrameSendStream},
    wire::{Channel, Envelope, Message},
};
use crate::{config::WorkerConfig, error::NetError, task::WorkerAddr};

/// How long shutdown waits for queued frames to be acknowledged.
const LINGER: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum Inbound {
    /// A message from broker link `broker`, or straight from a peer worker
    /// when `broker` is `None`.
    Message {
        broker: Option<usize>,
        envelope: Envelope,
        /// When the frame was read off the wire.
        received: Instant,
    },
    /// A broker link failed or was closed by the broker.
    Lost { broker: usize, reason: String },
}

struct BrokerLink {
    addr: String,
    task_tx: Option<UnboundedSender<Vec<u8>>>,
    info_tx: Option<UnboundedSender<Vec<u8>>>,
    conn: quinn::Connection,
    writers: Vec<JoinHandle<()>>,
    alive: bool,
}

pub struct Transport {
    runtime: Runtime,
    endpoint: quinn::Endpoint,
    addr: WorkerAddr,
    brokers: Vec<BrokerLink>,
    /// Cached connections to other workers, keyed by their address.
    peers: HashMap<WorkerAddr, quinn::Connection>,
    inbound_tx: UnboundedSender<Inbound>,
    inbound_rx: UnboundedReceiver<Inbound>,
    compress_above: Option<usize>,
    connect_timeout: Duration,
}

impl Transport {
    /// Binds the worker's endpoint and starts accepting direct replies.
    pub fn bind(config: &WorkerConfig) -> Result<Self, NetError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("shoal-net")
            .enable_all()
            .build()?;
        let endpoint = {
            let _guard = runtime.enter();
            endpoint(config.bind, config.keep_alive)?
        };
        let addr = advertised_addr(endpoint.local_addr()?, config.advertise_host.as_deref());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        runtime.spawn(accept_peers(endpoint.clone(), inbound_tx.clone()));
        debug!(%addr, "transport bound");
        Ok(Self {
            runtime,
            endpoint,
            addr,
            brokers: Vec::new(),
            peers: HashMap::new(),
            inbound_tx,
            inbound_rx,
            compress_above: config.compression_threshold,
            connect_timeout: config.connect_timeout,
        })
    }

    pub fn addr(&self) -> &WorkerAddr {
        &self.addr
    }

    /// Connects to a broker and writes `opening` as the first message of the
    /// task stream, then opens the info stream. Returns the link index used
    /// by [`send`](Self::send) and reported in [`Inbound`].
    pub fn connect_broker(&mut self, addr: &str, opening: Message) -> Result<usize, NetError> {
        let idx = self.brokers.len();
        let opening = Envelope::new(self.addr.clone(), opening);
        let hello = Envelope::new(self.addr.clone(), Message::Hello);
        let compress_above = self.compress_above;
        let endpoint = self.endpoint.clone();
        let timeout = self.connect_timeout;

        let (conn, task_stream, info_stream) = self.runtime.block_on(async {
            let conn = dial(&endpoint, addr, timeout).await?;
            let (send, recv) = conn.open_bi().await?;
            let mut task_send = FrameSendStream::new(send, compress_above);
            task_send.send(&opening).await?;
            let (send, info_recv) = conn.open_bi().await?;
            let mut info_send = FrameSendStream::new(send, compress_above);
            info_send.send(&hello).await?;
            Ok::<_, NetError>((conn, (task_send, recv), (info_send, info_recv)))
        })?;

        let span = debug_span!("broker", %addr, idx);
        let mut writers = Vec::with_capacity(2);
        let mut senders = Vec::with_capacity(2);
        let readers = Arc::new(AtomicUsize::new(2));
        for (send, recv) in [task_stream, info_stream] {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            writers.push(self.runtime.spawn(pump_writes(send, rx).instrument(span.clone())));
            self.runtime.spawn(
                pump_reads(
                    FrameRecvStream::new(recv),
                    idx,
                    readers.clone(),
                    self.inbound_tx.clone(),
                )
                .instrument(span.clone()),
            );
        }
        let info_tx = senders.pop();
        let task_tx = senders.pop();

        debug!(%addr, idx, "connected to broker");
        self.brokers.push(BrokerLink {
            addr: addr.to_owned(),
            task_tx,
            info_tx,
            conn,
            writers,
            alive: true,
        });
        Ok(idx)
    }

    pub fn broker_count(&self) -> usize {
        self.brokers.len()
    }

    pub fn broker_addr(&self, idx: usize) -> Option<&str> {
        self.brokers.get(idx).map(|link| link.addr.as_str())
    }

    /// Whether a link to `addr` exists, by name or by resolved address.
    pub fn knows_broker(&self, addr: &str) -> bool {
        let resolved = addr.parse::<SocketAddr>().ok();
        self.brokers
            .iter()
            .any(|link| link.addr == addr || Some(link.conn.remote_address()) == resolved)
    }

    pub fn is_alive(&self, idx: usize) -> bool {
        self.brokers.get(idx).map_or(false, |link| link.alive)
    }

    pub fn alive_brokers(&self) -> Vec<usize> {
        (0..self.brokers.len()).filter(|&i| self.is_alive(i)).collect()
    }

    /// Marks a link dead. Returns whether it was alive, so a loss reported
    /// by both of its streams is only acted on once.
    pub fn mark_lost(&mut self, idx: usize) -> bool {
        match self.brokers.get_mut(idx) {
            Some(link) if link.alive => {
                link.alive = false;
                link.task_tx = None;
                link.info_tx = None;
                true
            }
            _ => false,
        }
    }

    /// Queues `message` for broker `idx` on the stream its kind belongs to.
    pub fn send(&mut self, idx: usize, message: Message) -> Result<(), NetError> {
        let channel = message.channel();
        let body = Envelope::new(self.addr.clone(), message).encode(self.compress_above)?;
        let link = self.brokers.get(idx).ok_or(NetError::Closed)?;
        let tx = match channel {
            Channel::Task => link.task_tx.as_ref(),
            Channel::Info => link.info_tx.as_ref(),
        };
        trace!(idx, ?channel, len = body.len(), "queueing frame");
        tx.ok_or(NetError::Closed)?
            .send(body)
            .map_err(|_| NetError::Closed)
    }

    /// Delivers `message` straight to the worker at `dest` on a fresh
    /// unidirectional stream. Callers fall back to the broker on error.
    pub fn send_direct(&mut self, dest: &WorkerAddr, message: Message) -> Result<(), NetError> {
        let body = Envelope::new(self.addr.clone(), message).encode(self.compress_above)?;
        let cached = self.peers.get(dest).cloned();
        let endpoint = self.endpoint.clone();
        let timeout = self.connect_timeout;

        let result = self.runtime.block_on(async {
            let conn = match cached {
                Some(conn) => conn,
                None => dial(&endpoint, dest.as_str(), timeout).await?,
            };
            match tokio::time::timeout(timeout, send_once(&conn, &body)).await {
                Ok(Ok(())) => Ok(conn),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(NetError::Closed),
            }
        });
        match result {
            Ok(conn) => {
                self.peers.insert(dest.clone(), conn);
                Ok(())
            }
            Err(e) => {
                self.peers.remove(dest);
                Err(e)
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Inbound> {
        self.inbound_rx.try_recv().ok()
    }

    /// Waits up to `timeout` for the next inbound message.
    pub fn poll(&mut self, timeout: Duration) -> Option<Inbound> {
        let rx = &mut self.inbound_rx;
        self.runtime
            .block_on(async move { tokio::time::timeout(timeout, rx.recv()).await })
            .ok()
            .flatten()
    }

    /// Finishes every stream after its queued frames are written, then closes
    /// the endpoint. Each broker in `awaiting` must first send SHUTDOWN or
    /// drop the link, within a short linger; frames it has not read yet die
    /// with the connection.
    pub fn shutdown(&mut self, awaiting: &[usize]) {
        let mut pending: HashSet<usize> = awaiting
            .iter()
            .copied()
            .filter(|&idx| self.is_alive(idx))
            .collect();
        let mut writers = Vec::new();
        for link in &mut self.brokers {
            link.task_tx = None;
            link.info_tx = None;
            link.alive = false;
            writers.append(&mut link.writers);
        }
        let drained = self
            .runtime
            .block_on(async move { tokio::time::timeout(LINGER, join_all(writers)).await.is_ok() });
        if !drained {
            debug!("gave up waiting for broker streams to drain");
        }

        let deadline = Instant::now() + LINGER;
        while !pending.is_empty() {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.poll(left) {
                Some(Inbound::Message {
                    broker: Some(idx),
                    envelope,
                    ..
                }) if matches!(envelope.message, Message::Shutdown) => {
                    pending.remove(&idx);
                }
                Some(Inbound::Lost { broker, .. }) => {
                    pending.remove(&broker);
                }
                Some(_) => {}
                None if left.is_zero() => {
                    debug!(count = pending.len(), "brokers did not confirm shutdown");
                    break;
                }
                None => {}
            }
        }

        let conns: Vec<_> = self.brokers.iter().map(|link| link.conn.clone()).collect();
        let endpoint = self.endpoint.clone();
        self.runtime.block_on(async move {
            for conn in conns {
                conn.close(0u32.into(), b"shutdown");
            }
            endpoint.close(0u32.into(), b"shutdown");
            let _ = tokio::time::timeout(LINGER, endpoint.wait_idle()).await;
        });
        self.peers.clear();
        debug!(addr = %self.addr, "transport shut down");
    }
}

/// Writes queued frames until the link is dropped. A failed write ends the
/// pump; the readers of the same connection report the loss.
async fn pump_writes(mut stream: FrameSendStream, mut rx: UnboundedReceiver<Vec<u8>>) {
    while let Some(body) = rx.recv().await {
        if let Err(e) = stream.send_raw(&body).await {
            warn!("write to broker failed: {}", e);
            return;
        }
    }
    if let Err(e) = stream.finish().await {
        debug!("could not finish stream: {}", e);
    }
}

/// Forwards frames into the inbound channel. Only the last of a link's two
/// readers to end reports it lost, after everything the other stream carried.
async fn pump_reads(
    mut stream: FrameRecvStream,
    idx: usize,
    readers: Arc<AtomicUsize>,
    inbound: UnboundedSender<Inbound>,
) {
    loop {
        let reason = match stream.receive().await {
            Ok(Some(envelope)) => {
                trace!(kind = ?envelope.message.msg_type(), "received");
                if inbound
                    .send(Inbound::Message {
                        broker: Some(idx),
                        envelope,
                        received: Instant::now(),
                    })
                    .is_err()
                {
                    return;
                }
                continue;
            }
            Ok(None) => "stream finished".to_owned(),
            Err(e) => e.to_string(),
        };
        if readers.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = inbound.send(Inbound::Lost { broker: idx, reason });
        } else {
            trace!(idx, "reader ended: {}", reason);
        }
        return;
    }
}

/// Accepts connections from other workers; each carries replies, one per
/// unidirectional stream.
async fn accept_peers(ep: quinn::Endpoint, inbound: UnboundedSender<Inbound>) {
    while let Some(connecting) = ep.accept().await {
        let inbound = inbound.clone();
        let remote = connecting.remote_address();
        tokio::spawn(
            async move {
                let conn = match connecting.await {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!("peer handshake failed: {}", e);
                        return;
                    }
                };
                while let Ok(stream) = conn.accept_uni().await {
                    let inbound = inbound.clone();
                    tokio::spawn(async move {
                        match FrameRecvStream::new(stream).receive().await {
                            Ok(Some(envelope)) => {
                                let _ = inbound.send(Inbound::Message {
                                    broker: None,
                                    envelope,
                                    received: Instant::now(),
                                });
                            }
                            Ok(None) => {}
                            Err(e) => debug!("dropping direct frame: {}", e),
                        }
                    });
                }
            }
            .instrument(debug_span!("peer", %remote)),
        );
    }
}
