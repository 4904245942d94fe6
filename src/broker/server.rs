use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::join_all;
use hashbrown::{HashMap, HashSet};
use tokio::{
    select,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use super::state::{BrokerState, ConnId, Effect};
use crate::{
    config::BrokerConfig,
    error::NetError,
    net::{
        advertised_addr, dial, endpoint,
        link::{FrameRecvStream, FrameSendStream},
        wire::{Channel, Envelope, Message},
    },
    task::WorkerAddr,
};

/// How long termination waits for queued frames to drain.
const LINGER: Duration = Duration::from_secs(2);

enum LinkEvent {
    Opened {
        conn: ConnId,
        link: Link,
        /// Address of the peer broker when this side dialed.
        dialed: Option<String>,
    },
    Message {
        conn: ConnId,
        envelope: Envelope,
    },
    Closed {
        conn: ConnId,
        reason: String,
    },
}

struct Link {
    conn: quinn::Connection,
    task_tx: UnboundedSender<Vec<u8>>,
    info_tx: UnboundedSender<Vec<u8>>,
    writers: Vec<JoinHandle<()>>,
}

/// Everything a link task needs to report back to the broker loop.
#[derive(Clone)]
struct Hub {
    events: UnboundedSender<LinkEvent>,
    next_conn: Arc<AtomicUsize>,
    compress_above: Option<usize>,
}

impl Hub {
    fn next_conn(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }
}

/// A broker process: a QUIC endpoint plus the loop that owns the
/// [`BrokerState`].
pub struct Broker {
    endpoint: quinn::Endpoint,
    state: BrokerState,
    config: BrokerConfig,
}

impl Broker {
    /// Binds the endpoint. Must be called from within a tokio runtime.
    pub fn bind(config: BrokerConfig) -> Result<Self, NetError> {
        let endpoint = endpoint(config.bind, config.keep_alive)?;
        let addr = advertised_addr(endpoint.local_addr()?, config.advertise_host.as_deref());
        Ok(Self {
            endpoint,
            state: BrokerState::new(addr, config.dispatch),
            config,
        })
    }

    /// Address workers and peer brokers should connect to.
    pub fn addr(&self) -> &WorkerAddr {
        self.state.addr()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Serves until a SHUTDOWN is handled or the process is interrupted.
    pub async fn run(self) -> Result<(), NetError> {
        let span = debug_span!("broker", addr = %self.state.addr());
        self.serve().instrument(span).await
    }

    async fn serve(mut self) -> Result<(), NetError> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let hub = Hub {
            events: events_tx,
            next_conn: Arc::new(AtomicUsize::new(0)),
            compress_above: self.config.compression_threshold,
        };
        let acceptor = tokio::spawn(accept_links(self.endpoint.clone(), hub.clone()));
        info!(addr = %self.state.addr(), "broker listening");

        let mut links: HashMap<ConnId, Link> = HashMap::new();
        // links whose peer already sent SHUTDOWN
        let mut settled: HashSet<ConnId> = HashSet::new();
        let startup = self.state.add_peers(&self.config.peers);
        let mut done = self.apply(startup, &mut links, &hub);

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        while !done {
            select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    let effects = match event {
                        LinkEvent::Opened { conn, link, dialed } => {
                            match dialed {
                                Some(addr) => self.state.peer_connected(conn, addr),
                                None => self.state.accepted(conn),
                            }
                            links.insert(conn, link);
                            Vec::new()
                        }
                        LinkEvent::Message { conn, envelope } => {
                            if matches!(envelope.message, Message::Shutdown) {
                                settled.insert(conn);
                            }
                            self.state.handle(conn, envelope)
                        }
                        LinkEvent::Closed { conn, reason } => {
                            if let Some(link) = links.remove(&conn) {
                                debug!(conn, "link closed: {}", reason);
                                link.conn.close(0u32.into(), b"closed");
                            }
                            self.state.disconnect(conn)
                        }
                    };
                    done = self.apply(effects, &mut links, &hub);
                }
                _ = &mut ctrl_c => {
                    warn!("interrupted, shutting the job down");
                    let effects = self.state.shutdown();
                    done = self.apply(effects, &mut links, &hub);
                }
            }
        }

        acceptor.abort();
        self.terminate(links, settled, &mut events_rx).await;
        Ok(())
    }

    /// Carries out `effects`. Returns whether the broker should terminate.
    fn apply(&self, effects: Vec<Effect>, links: &mut HashMap<ConnId, Link>, hub: &Hub) -> bool {
        let mut terminate = false;
        for effect in effects {
            match effect {
                Effect::Send { conn, envelope } => {
                    let Some(link) = links.get(&conn) else {
                        debug!(
                            conn,
                            kind = ?envelope.message.msg_type(),
                            "dropping frame for a closed link"
                        );
                        continue;
                    };
                    let body = match envelope.encode(hub.compress_above) {
                        Ok(body) => body,
                        Err(e) => {
                            warn!(
                                kind = ?envelope.message.msg_type(),
                                "could not encode frame: {}",
                                e
                            );
                            continue;
                        }
                    };
                    let tx = match envelope.message.channel() {
                        Channel::Task => &link.task_tx,
                        Channel::Info => &link.info_tx,
                    };
                    trace!(conn, kind = ?envelope.message.msg_type(), "sending");
                    if tx.send(body).is_err() {
                        debug!(conn, "writer for link is gone");
                    }
                }
                Effect::Dial(addr) => {
                    let opening =
                        Envelope::new(self.state.addr().clone(), self.state.connect_message());
                    let hello = Envelope::new(self.state.addr().clone(), Message::Hello);
                    tokio::spawn(
                        dial_peer(
                            self.endpoint.clone(),
                            addr.clone(),
                            opening,
                            hello,
                            self.config.connect_timeout,
                            hub.clone(),
                        )
                        .instrument(debug_span!("peer", %addr)),
                    );
                }
                Effect::Terminate => terminate = true,
            }
        }
        terminate
    }

    /// Lets every writer flush what is queued, then waits for each peer to
    /// either send its own SHUTDOWN or go away before closing all links and
    /// the endpoint.
    async fn terminate(
        self,
        links: HashMap<ConnId, Link>,
        settled: HashSet<ConnId>,
        events: &mut UnboundedReceiver<LinkEvent>,
    ) {
        let mut writers = Vec::new();
        let mut conns = Vec::new();
        let mut pending = HashSet::new();
        for (id, link) in links {
            writers.extend(link.writers);
            conns.push(link.conn);
            if !settled.contains(&id) {
                pending.insert(id);
            }
        }
        if tokio::time::timeout(LINGER, join_all(writers)).await.is_err() {
            debug!("gave up waiting for links to drain");
        }

        let settle = async {
            while !pending.is_empty() {
                match events.recv().await {
                    Some(LinkEvent::Message { conn, envelope })
                        if matches!(envelope.message, Message::Shutdown) =>
                    {
                        pending.remove(&conn);
                    }
                    Some(LinkEvent::Closed { conn, .. }) => {
                        pending.remove(&conn);
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        };
        if tokio::time::timeout(LINGER, settle).await.is_err() {
            debug!("gave up waiting for peers to close");
        }
        for conn in conns {
            conn.close(0u32.into(), b"shutdown");
        }
        self.endpoint.close(0u32.into(), b"shutdown");
        let _ = tokio::time::timeout(LINGER, self.endpoint.wait_idle()).await;
        info!("broker terminated");
    }
}

async fn accept_links(ep: quinn::Endpoint, hub: Hub) {
    while let Some(connecting) = ep.accept().await {
        let remote = connecting.remote_address();
        let hub = hub.clone();
        tokio::spawn(
            async move {
                let conn = match connecting.await {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!("handshake failed: {}", e);
                        return;
                    }
                };
                match accept_streams(&conn, hub.compress_above).await {
                    Ok((task, info, first)) => open_link(conn, None, task, info, Some(first), hub),
                    Err(e) => {
                        debug!("link setup failed: {}", e);
                        conn.close(0u32.into(), b"bad handshake");
                    }
                }
            }
            .instrument(debug_span!("link", %remote)),
        );
    }
}

type Streams = (FrameSendStream, FrameRecvStream);

/// Accepts both streams of a new link and reads their opening frames. The
/// one that opens with HELLO is the info stream; the opening frame of the
/// other one is returned to be handled.
async fn accept_streams(
    conn: &quinn::Connection,
    compress_above: Option<usize>,
) -> Result<(Streams, Streams, Envelope), NetError> {
    let mut opened = Vec::with_capacity(2);
    for _ in 0..2 {
        let (send, recv) = conn.accept_bi().await?;
        let mut recv = FrameRecvStream::new(recv);
        let first = recv.receive().await?.ok_or(NetError::Closed)?;
        opened.push((FrameSendStream::new(send, compress_above), recv, first));
    }
    let (b_send, b_recv, b_first) = opened.pop().ok_or(NetError::Closed)?;
    let (a_send, a_recv, a_first) = opened.pop().ok_or(NetError::Closed)?;
    match (&a_first.message, &b_first.message) {
        (_, Message::Hello) => Ok(((a_send, a_recv), (b_send, b_recv), a_first)),
        (Message::Hello, _) => Ok(((b_send, b_recv), (a_send, a_recv), b_first)),
        _ => Err(NetError::Closed),
    }
}

async fn dial_peer(
    ep: quinn::Endpoint,
    addr: String,
    opening: Envelope,
    hello: Envelope,
    timeout: Duration,
    hub: Hub,
) {
    let attempt = async {
        let conn = dial(&ep, &addr, timeout).await?;
        let (send, recv) = conn.open_bi().await?;
        let mut task_send = FrameSendStream::new(send, hub.compress_above);
        task_send.send(&opening).await?;
        let (send, info_recv) = conn.open_bi().await?;
        let mut info_send = FrameSendStream::new(send, hub.compress_above);
        info_send.send(&hello).await?;
        Ok::<_, NetError>((
            conn,
            (task_send, FrameRecvStream::new(recv)),
            (info_send, FrameRecvStream::new(info_recv)),
        ))
    };
    match attempt.await {
        Ok((conn, task, info)) => {
            debug!("connected to peer broker");
            open_link(conn, Some(addr), task, info, None, hub);
        }
        Err(e) => warn!("could not reach peer broker: {}", e),
    }
}

/// Starts the reader and writer tasks of a link and announces it to the
/// broker loop, followed by `first` if the handshake already read a frame.
fn open_link(
    conn: quinn::Connection,
    dialed: Option<String>,
    task: Streams,
    info: Streams,
    first: Option<Envelope>,
    hub: Hub,
) {
    let id = hub.next_conn();
    let (task_send, task_recv) = task;
    let (info_send, info_recv) = info;
    let (task_tx, task_rx) = mpsc::unbounded_channel();
    let (info_tx, info_rx) = mpsc::unbounded_channel();
    let writers = vec![
        tokio::spawn(pump_writes(task_send, task_rx, id, hub.events.clone())),
        tokio::spawn(pump_writes(info_send, info_rx, id, hub.events.clone())),
    ];
    let link = Link {
        conn,
        task_tx,
        info_tx,
        writers,
    };
    if hub
        .events
        .send(LinkEvent::Opened {
            conn: id,
            link,
            dialed,
        })
        .is_err()
    {
        return;
    }
    if let Some(envelope) = first {
        let _ = hub.events.send(LinkEvent::Message { conn: id, envelope });
    }
    let readers = Arc::new(AtomicUsize::new(2));
    tokio::spawn(pump_reads(task_recv, id, readers.clone(), hub.events.clone()));
    tokio::spawn(pump_reads(info_recv, id, readers, hub.events));
}

async fn pump_writes(
    mut stream: FrameSendStream,
    mut rx: UnboundedReceiver<Vec<u8>>,
    conn: ConnId,
    events: UnboundedSender<LinkEvent>,
) {
    while let Some(body) = rx.recv().await {
        if let Err(e) = stream.send_raw(&body).await {
            let _ = events.send(LinkEvent::Closed {
                conn,
                reason: e.to_string(),
            });
            return;
        }
    }
    let _ = stream.finish().await;
}

/// Forwards frames to the broker loop. The link is reported closed once both
/// of its readers have ended, so a frame still in flight on the other stream
/// is never overtaken by the close.
async fn pump_reads(
    mut stream: FrameRecvStream,
    conn: ConnId,
    readers: Arc<AtomicUsize>,
    events: UnboundedSender<LinkEvent>,
) {
    loop {
        let reason = match stream.receive().await {
            Ok(Some(envelope)) => {
                if events.send(LinkEvent::Message { conn, envelope }).is_err() {
                    return;
                }
                continue;
            }
            Ok(None) => String::from("stream finished"),
            Err(e) => e.to_string(),
        };
        if readers.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = events.send(LinkEvent::Closed { conn, reason });
        } else {
            trace!(conn, "reader ended: {}", reason);
        }
        return;
    }
}
