use std::{
    collections::VecDeque,
    thread,
    time::{Duration, Instant},
};

use hashbrown::{HashMap, HashSet};
use rand::seq::SliceRandom;
use tracing::{debug, trace, warn};

use super::table::TaskTable;
use crate::{
    codec::{Decode, Encode},
    config::WorkerConfig,
    error::QueueError,
    net::{
        wire::{AssignmentState, InitReply, TaskStatus},
        Inbound, Message, Transport,
    },
    task::{FailureKind, Outcome, TaskEnvelope, TaskFailure, TaskId, WorkerAddr},
};

/// Where a shipped task went and when it was last heard of.
struct Shipment {
    broker: usize,
    at: Instant,
}

/// How a locally executed task left the queue.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Finalized {
    /// Owned here; now ready for its parent.
    Local,
    /// Owned elsewhere; the result was sent back and the record dropped.
    Sent,
}

/// The hand-off point between the scheduler and the network.
///
/// Holds the ids of tasks that are `movable` (not started, may still be
/// shipped), `ready` (reconciled, waiting to resume a parent) or
/// `inprogress` (started here and not yet finished). A task is in at most one
/// of them.
pub(crate) struct TaskQueue {
    movable: VecDeque<TaskId>,
    ready: VecDeque<TaskId>,
    inprogress: HashSet<TaskId>,
    low_watermark: usize,
    high_watermark: usize,
    transport: Option<Transport>,
    /// Messages read before the queue existed, handled first.
    backlog: VecDeque<Inbound>,
    /// One REQUEST credit per broker link at most.
    requested: Vec<bool>,
    shipped: HashMap<TaskId, Shipment>,
    shared: HashMap<String, Vec<u8>>,
    poll_interval: Duration,
    status_interval: Duration,
    direct_replies: bool,
    last_status_check: Instant,
    shutdown_received: bool,
    /// Set once this worker announced SHUTDOWN or got one.
    job_over: bool,
    /// Broker links that delivered SHUTDOWN.
    shutdown_from: HashSet<usize>,
    /// Address of the last broker link, once every link is gone.
    orphaned: Option<String>,
    closed: bool,
}

impl TaskQueue {
    pub(crate) fn new(
        config: &WorkerConfig,
        transport: Option<Transport>,
        backlog: Vec<Inbound>,
    ) -> Self {
        let (low_watermark, high_watermark) = config.watermarks();
        let requested = vec![false; transport.as_ref().map_or(0, |t| t.broker_count())];
        Self {
            movable: VecDeque::new(),
            ready: VecDeque::new(),
            inprogress: HashSet::new(),
            low_watermark,
            high_watermark,
            transport,
            backlog: backlog.into(),
            requested,
            shipped: HashMap::new(),
            shared: HashMap::new(),
            poll_interval: config.poll_interval,
            status_interval: config.status_interval,
            direct_replies: config.direct_replies,
            last_status_check: Instant::now(),
            shutdown_received: false,
            job_over: false,
            shutdown_from: HashSet::new(),
            orphaned: None,
            closed: false,
        }
    }

    pub(crate) fn is_networked(&self) -> bool {
        self.transport.is_some()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown_received || self.closed
    }

    pub(crate) fn is_in_progress(&self, id: &TaskId) -> bool {
        self.inprogress.contains(id)
    }

    pub(crate) fn len(&self) -> (usize, usize, usize) {
        (self.movable.len(), self.ready.len(), self.inprogress.len())
    }

    /// First registration of a task freshly created here. A networked worker
    /// offers it to a broker straight away; it is kept local when there is
    /// no broker or it cannot be encoded.
    pub(crate) fn append_init(
        &mut self,
        table: &mut TaskTable,
        id: TaskId,
    ) -> Result<(), QueueError> {
        let task = table.get(&id)?;
        if !task.is_movable() {
            return Err(QueueError::InvalidTaskState {
                id,
                reason: "append_init on a started task",
            });
        }
        if !table.is_owned(&id) {
            return Err(QueueError::InvalidTaskState {
                id,
                reason: "append_init on a task owned elsewhere",
            });
        }
        if self.ship_or_keep(table, id)? {
            return Ok(());
        }
        self.movable.push_back(id);
        Ok(())
    }

    /// Queues a not-yet-started task for local execution. Above the high
    /// watermark the oldest movable tasks are shipped back out.
    pub(crate) fn append_movable(
        &mut self,
        table: &mut TaskTable,
        id: TaskId,
    ) -> Result<(), QueueError> {
        if !table.get(&id)?.is_movable() {
            return Err(QueueError::InvalidTaskState {
                id,
                reason: "append_movable on a started task",
            });
        }
        self.movable.push_back(id);
        while self.movable.len() > self.high_watermark {
            let Some(oldest) = self.movable.pop_front() else {
                break;
            };
            if !self.ship_or_keep(table, oldest)? {
                self.movable.push_front(oldest);
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn append_ready(&mut self, table: &TaskTable, id: TaskId) -> Result<(), QueueError> {
        if !table.is_ready(&id)? {
            return Err(QueueError::InvalidTaskState {
                id,
                reason: "append_ready on a task that is not ready",
            });
        }
        self.ready.push_back(id);
        Ok(())
    }

    /// Next task for the scheduler: ready tasks first, then movable ones.
    /// When both are empty it asks the brokers for work and polls the network
    /// until something arrives or `deadline` passes, returning `None` in the
    /// latter case.
    pub(crate) fn pop(
        &mut self,
        table: &mut TaskTable,
        deadline: Option<Instant>,
    ) -> Result<Option<TaskId>, QueueError> {
        loop {
            self.update_queue(table)?;
            if let Some(id) = self.ready.pop_front() {
                return Ok(Some(id));
            }
            if self.movable.len() < self.low_watermark {
                self.request_future();
            }
            if let Some(id) = self.movable.pop_front() {
                self.start(table, id)?;
                return Ok(Some(id));
            }

            self.request_future();
            self.check_status(table)?;

            let now = Instant::now();
            if deadline.map_or(false, |d| d <= now) {
                return Ok(None);
            }
            let wait = deadline.map_or(self.poll_interval, |d| (d - now).min(self.poll_interval));
            match self.transport.as_mut() {
                Some(transport) => {
                    if let Some(inbound) = transport.poll(wait) {
                        self.handle(table, inbound)?;
                    }
                }
                None if deadline.is_some() => thread::sleep(wait),
                None => return Err(QueueError::Starved),
            }
        }
    }

    /// Waits up to `timeout` for one inbound message and handles it. Returns
    /// whether anything arrived.
    pub(crate) fn wait_inbound(
        &mut self,
        table: &mut TaskTable,
        timeout: Duration,
    ) -> Result<bool, QueueError> {
        if let Some(inbound) = self.backlog.pop_front() {
            self.handle(table, inbound)?;
            return Ok(true);
        }
        match self.transport.as_mut().and_then(|t| t.poll(timeout)) {
            Some(inbound) => {
                self.handle(table, inbound)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn start(&mut self, table: &mut TaskTable, id: TaskId) -> Result<(), QueueError> {
        let owned = table.is_owned(&id);
        let task = table.get_mut(&id)?;
        task.started = true;
        task.started_at = Some(Instant::now());
        let via_broker = task.via_broker;
        self.inprogress.insert(id);
        if let (false, Some(broker), Some(transport)) =
            (owned, via_broker, self.transport.as_mut())
        {
            if let Err(e) = transport.send(broker, Message::StatusUpdate { ids: vec![id] }) {
                debug!("could not report {} as running: {}", id, e);
            }
        }
        Ok(())
    }

    /// Sends one REQUEST to every live broker that has none outstanding.
    pub(crate) fn request_future(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        self.requested.resize(transport.broker_count(), false);
        for idx in transport.alive_brokers() {
            if self.requested[idx] {
                continue;
            }
            match transport.send(idx, Message::Request) {
                Ok(()) => {
                    trace!(idx, "requested work");
                    self.requested[idx] = true;
                }
                Err(e) => debug!(idx, "could not request work: {}", e),
            }
        }
    }

    /// Drains every message that has already arrived.
    pub(crate) fn update_queue(&mut self, table: &mut TaskTable) -> Result<(), QueueError> {
        if self.shutdown_received {
            return Err(QueueError::Shutdown);
        }
        if let Some(addr) = &self.orphaned {
            return Err(QueueError::BrokerLost(addr.clone()));
        }
        loop {
            let inbound = match self.backlog.pop_front() {
                Some(inbound) => inbound,
                None => match self.transport.as_mut().and_then(|t| t.try_recv()) {
                    Some(inbound) => inbound,
                    None => return Ok(()),
                },
            };
            self.handle(table, inbound)?;
        }
    }

    fn handle(&mut self, table: &mut TaskTable, inbound: Inbound) -> Result<(), QueueError> {
        let (broker, envelope, received) = match inbound {
            Inbound::Message {
                broker,
                envelope,
                received,
            } => (broker, envelope, received),
            Inbound::Lost { broker, reason } => return self.broker_lost(table, broker, &reason),
        };
        trace!(from = %envelope.sender, kind = ?envelope.message.msg_type(), "handling");

        match envelope.message {
            Message::Task { id, owner, payload } => {
                if let Some(idx) = broker {
                    if let Some(flag) = self.requested.get_mut(idx) {
                        *flag = false;
                    }
                }
                self.receive_task(table, id, owner, &payload, broker)
            }
            Message::Reply { id, payload, .. } => {
                self.receive_reply(table, id, &payload, received)
            }
            Message::ResendFuture { id } => {
                if self.shipped.contains_key(&id) {
                    debug!(%id, "broker lost the executor, resending");
                    self.reship(table, id)
                } else {
                    debug!(%id, "resend requested for a task that is no longer outstanding");
                    Ok(())
                }
            }
            Message::StatusAns { statuses } => self.receive_statuses(table, statuses),
            Message::Variable { key, value, .. } => {
                self.shared.insert(key, value);
                Ok(())
            }
            Message::InitReply(reply) => {
                self.absorb_init_reply(reply);
                Ok(())
            }
            Message::Shutdown => {
                debug!("shutdown received");
                self.shutdown_received = true;
                self.job_over = true;
                self.shutdown_from.extend(broker);
                Err(QueueError::Shutdown)
            }
            other => {
                debug!(kind = ?other.msg_type(), "ignoring unexpected message");
                Ok(())
            }
        }
    }

    fn receive_task(
        &mut self,
        table: &mut TaskTable,
        id: TaskId,
        owner: WorkerAddr,
        payload: &[u8],
        broker: Option<usize>,
    ) -> Result<(), QueueError> {
        if table.is_owned(&id) {
            // one of ours, handed back by a broker
            let reclaim = matches!(table.get(&id), Ok(task) if task.shipped && task.is_movable());
            if !reclaim {
                debug!(%id, "own task delivered twice, dropping");
                return Ok(());
            }
            table.get_mut(&id)?.shipped = false;
            self.shipped.remove(&id);
            return self.append_movable(table, id);
        }
        if table.contains(&id) {
            debug!(%id, "task delivered twice, dropping");
            return Ok(());
        }
        match TaskEnvelope::decode(payload) {
            Ok(envelope) => {
                table.insert_remote(envelope, broker);
                self.append_movable(table, id)
            }
            Err(e) => {
                warn!(%id, "undecodable task: {}", e);
                let failure = Outcome::Failure(TaskFailure::new(
                    FailureKind::Serialization,
                    e.to_string(),
                ));
                self.reply_failure(id, owner, failure, broker)
            }
        }
    }

    fn receive_reply(
        &mut self,
        table: &mut TaskTable,
        id: TaskId,
        payload: &[u8],
        received: Instant,
    ) -> Result<(), QueueError> {
        if !table.contains(&id) {
            warn!(%id, "reply for an unknown task, dropping");
            return Ok(());
        }
        let envelope = match TaskEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                let mut placeholder = table
                    .get(&id)?
                    .envelope()
                    .ok_or(QueueError::TaskNotFound(id))?;
                placeholder.outcome = Some(Outcome::Failure(TaskFailure::new(
                    FailureKind::Serialization,
                    e.to_string(),
                )));
                placeholder
            }
        };
        if !table.reconcile(envelope, received)? {
            warn!(%id, "duplicate reply, dropping");
            return Ok(());
        }
        self.shipped.remove(&id);
        self.finalize_returned_future(table, id)
    }

    /// Reconciles a task this worker owns that finished on another worker.
    pub(crate) fn finalize_returned_future(
        &mut self,
        table: &mut TaskTable,
        id: TaskId,
    ) -> Result<(), QueueError> {
        if !table.is_owned(&id) {
            return Err(QueueError::InvalidTaskState {
                id,
                reason: "returned task is owned elsewhere",
            });
        }
        if !table.get(&id)?.is_done() {
            return Err(QueueError::InvalidTaskState {
                id,
                reason: "returned task is not done",
            });
        }
        table.mark_ready(&id)?;
        if table.get(&id)?.detached {
            table.remove(&id);
            return Ok(());
        }
        self.append_ready(table, id)
    }

    /// Settles a task that just finished running here.
    pub(crate) fn finalize_future(
        &mut self,
        table: &mut TaskTable,
        id: TaskId,
    ) -> Result<Finalized, QueueError> {
        if !self.inprogress.contains(&id) {
            return Err(QueueError::InvalidTaskState {
                id,
                reason: "finalize of a task that is not in progress",
            });
        }
        if !table.get(&id)?.is_done() {
            return Err(QueueError::InvalidTaskState {
                id,
                reason: "finalize of a task that is not done",
            });
        }
        self.inprogress.remove(&id);
        if table.is_owned(&id) {
            table.mark_ready(&id)?;
            Ok(Finalized::Local)
        } else {
            self.send_result(table, id)?;
            Ok(Finalized::Sent)
        }
    }

    /// Returns a finished task to its owner, directly when possible and
    /// through a broker otherwise.
    fn send_result(&mut self, table: &mut TaskTable, id: TaskId) -> Result<(), QueueError> {
        let task = table.remove(&id).ok_or(QueueError::TaskNotFound(id))?;
        let mut envelope = task.envelope().ok_or(QueueError::InvalidTaskState {
            id,
            reason: "local task cannot be returned",
        })?;
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                envelope.outcome = Some(Outcome::Failure(TaskFailure::new(
                    FailureKind::Serialization,
                    e.to_string(),
                )));
                envelope.encode()?
            }
        };
        let reply = Message::Reply {
            id,
            destination: task.owner.clone(),
            payload,
        };
        let Some(transport) = self.transport.as_mut() else {
            return Err(QueueError::InvalidTaskState {
                id,
                reason: "remote task on a standalone worker",
            });
        };

        if self.direct_replies {
            match transport.send_direct(&task.owner, reply.clone()) {
                Ok(()) => {
                    trace!(%id, owner = %task.owner, "replied directly");
                    if let Some(broker) = task.via_broker {
                        let done = Message::StatusDone { ids: vec![id] };
                        if let Err(e) = transport.send(broker, done) {
                            debug!("could not report {} as done: {}", id, e);
                        }
                    }
                    return Ok(());
                }
                Err(e) => debug!(
                    owner = %task.owner,
                    "direct reply failed, routing through broker: {}",
                    e
                ),
            }
        }

        let broker = task
            .via_broker
            .filter(|&idx| transport.is_alive(idx))
            .or_else(|| transport.alive_brokers().first().copied())
            .ok_or_else(|| QueueError::BrokerLost(task.owner.to_string()))?;
        transport.send(broker, reply)?;
        Ok(())
    }

    fn reply_failure(
        &mut self,
        id: TaskId,
        owner: WorkerAddr,
        outcome: Outcome,
        broker: Option<usize>,
    ) -> Result<(), QueueError> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };
        let envelope = TaskEnvelope {
            id,
            parent: TaskId::ROOT,
            owner: owner.clone(),
            function: String::new(),
            args: Vec::new(),
            groups: Vec::new(),
            created_at: chrono::Utc::now().timestamp_micros(),
            outcome: Some(outcome),
            executor: None,
            execution_micros: None,
        };
        let payload = envelope.encode()?;
        let reply = Message::Reply {
            id,
            destination: owner,
            payload,
        };
        if let Some(broker) = broker.or_else(|| transport.alive_brokers().first().copied()) {
            transport.send(broker, reply)?;
        }
        Ok(())
    }

    /// Offers a task to a random live broker. Returns `false` when the task
    /// has to stay here: standalone, no live broker, local closure, or an
    /// encoding failure.
    fn ship_or_keep(&mut self, table: &mut TaskTable, id: TaskId) -> Result<bool, QueueError> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(false);
        };
        let alive = transport.alive_brokers();
        let Some(&broker) = alive.choose(&mut rand::thread_rng()) else {
            return Ok(false);
        };
        let task = table.get(&id)?;
        let Some(envelope) = task.envelope() else {
            return Ok(false);
        };
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%id, "task kept local: {}", e);
                return Ok(false);
            }
        };
        let owner = task.owner.clone();
        if let Err(e) = transport.send(broker, Message::Task { id, owner, payload }) {
            debug!(%id, "could not ship task, keeping it: {}", e);
            return Ok(false);
        }
        trace!(%id, broker, "shipped");

        if table.is_owned(&id) {
            table.get_mut(&id)?.shipped = true;
            self.shipped.insert(
                id,
                Shipment {
                    broker,
                    at: Instant::now(),
                },
            );
        } else {
            table.remove(&id);
        }
        Ok(true)
    }

    fn reship(&mut self, table: &mut TaskTable, id: TaskId) -> Result<(), QueueError> {
        self.shipped.remove(&id);
        if !matches!(table.get(&id), Ok(task) if task.shipped && task.is_movable()) {
            return Ok(());
        }
        table.get_mut(&id)?.shipped = false;
        if !self.ship_or_keep(table, id)? {
            self.movable.push_back(id);
        }
        Ok(())
    }

    fn broker_lost(
        &mut self,
        table: &mut TaskTable,
        idx: usize,
        reason: &str,
    ) -> Result<(), QueueError> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };
        if !transport.mark_lost(idx) {
            return Ok(());
        }
        let addr = transport.broker_addr(idx).unwrap_or_default().to_owned();
        if self.closed {
            return Ok(());
        }
        warn!(broker = %addr, "lost broker link: {}", reason);
        if let Some(flag) = self.requested.get_mut(idx) {
            *flag = false;
        }
        if transport.alive_brokers().is_empty() {
            self.orphaned = Some(addr.clone());
            return Err(QueueError::BrokerLost(addr));
        }
        let stranded: Vec<TaskId> = self
            .shipped
            .iter()
            .filter(|(_, s)| s.broker == idx)
            .map(|(id, _)| *id)
            .collect();
        for id in stranded {
            self.reship(table, id)?;
        }
        Ok(())
    }

    /// Asks brokers about tasks shipped long ago and still unanswered.
    fn check_status(&mut self, table: &mut TaskTable) -> Result<(), QueueError> {
        let now = Instant::now();
        if now.duration_since(self.last_status_check) < self.status_interval {
            return Ok(());
        }
        self.last_status_check = now;
        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };

        let mut by_broker: HashMap<usize, Vec<TaskId>> = HashMap::new();
        for (id, shipment) in &self.shipped {
            if now.duration_since(shipment.at) >= self.status_interval {
                by_broker.entry(shipment.broker).or_default().push(*id);
            }
        }
        let mut unreachable = Vec::new();
        for (broker, ids) in by_broker {
            if !transport.is_alive(broker) {
                unreachable.extend(ids);
                continue;
            }
            debug!(broker, count = ids.len(), "asking for task status");
            if let Err(e) = transport.send(broker, Message::StatusReq { ids }) {
                debug!("status request failed: {}", e);
            }
        }
        for id in unreachable {
            self.reship(table, id)?;
        }
        Ok(())
    }

    fn receive_statuses(
        &mut self,
        table: &mut TaskTable,
        statuses: Vec<TaskStatus>,
    ) -> Result<(), QueueError> {
        let now = Instant::now();
        for status in statuses {
            match status.state {
                AssignmentState::Lost => {
                    if self.shipped.contains_key(&status.id) {
                        debug!(id = %status.id, "broker reports task lost, resending");
                        self.reship(table, status.id)?;
                    }
                }
                _ => {
                    if let Some(shipment) = self.shipped.get_mut(&status.id) {
                        shipment.at = now;
                    }
                }
            }
        }
        Ok(())
    }

    fn absorb_init_reply(&mut self, reply: InitReply) {
        for entry in reply.shared {
            self.shared.entry(entry.key).or_insert(entry.value);
        }
    }

    /// Ships every movable task out and empties `movable`. The `ready` list
    /// is left as it is: it only holds reconciled results of this worker's
    /// own tasks, which no other worker could consume.
    pub(crate) fn flush(&mut self, table: &mut TaskTable) -> Result<(), QueueError> {
        if self.transport.is_none() || self.movable.is_empty() {
            return Ok(());
        }
        let pending: Vec<TaskId> = self.movable.drain(..).collect();
        for id in pending {
            if !self.ship_or_keep(table, id)? {
                self.movable.push_back(id);
            }
        }
        Ok(())
    }

    /// Cancels a task that has not started yet. Returns `false` if it already
    /// started, finished or left this worker.
    pub(crate) fn cancel(&mut self, table: &mut TaskTable, id: TaskId) -> Result<bool, QueueError> {
        if !self.movable.contains(&id) || !table.get(&id)?.is_movable() {
            return Ok(false);
        }
        self.movable.retain(|queued| *queued != id);
        let children: Vec<TaskId> = table.get(&id)?.children.iter().copied().collect();
        for child in children {
            self.cancel(table, child)?;
        }
        table.resolve(
            &id,
            Outcome::Failure(TaskFailure::new(FailureKind::Cancelled, "")),
        )?;
        table.mark_ready(&id)?;
        if table.get(&id)?.detached {
            table.remove(&id);
        } else {
            self.ready.push_back(id);
        }
        debug!(%id, "cancelled");
        Ok(true)
    }

    pub(crate) fn shared(&self, key: &str) -> Option<&[u8]> {
        self.shared.get(key).map(Vec::as_slice)
    }

    /// Stores a shared constant and sends it to one broker, which broadcasts
    /// it to everyone.
    pub(crate) fn publish(
        &mut self,
        key: String,
        value: Vec<u8>,
        source: WorkerAddr,
    ) -> Result<(), QueueError> {
        self.shared.insert(key.clone(), value.clone());
        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };
        let Some(&broker) = transport.alive_brokers().first() else {
            return Err(QueueError::BrokerLost(String::from("all brokers")));
        };
        transport.send(broker, Message::Variable { key, value, source })?;
        Ok(())
    }

    /// Asks a broker to shut the whole cluster down.
    pub(crate) fn announce_shutdown(&mut self) {
        self.job_over = true;
        if let Some(transport) = self.transport.as_mut() {
            if let Some(&broker) = transport.alive_brokers().first() {
                if let Err(e) = transport.send(broker, Message::Shutdown) {
                    warn!("could not announce shutdown: {}", e);
                }
            }
        }
    }

    /// Best-effort WORKER_DOWN to every live broker.
    pub(crate) fn announce_down(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            for idx in transport.alive_brokers() {
                let _ = transport.send(idx, Message::WorkerDown);
            }
        }
    }

    /// Closes the transport. Anything still queued is abandoned. When the job
    /// is over, every broker link is first given the chance to confirm it.
    pub(crate) fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let (movable, ready, inprogress) = self.len();
        debug!(movable, ready, inprogress, "queue shut down");
        if let Some(transport) = self.transport.as_mut() {
            let awaiting: Vec<usize> = if self.job_over {
                (0..transport.broker_count())
                    .filter(|idx| !self.shutdown_from.contains(idx))
                    .collect()
            } else {
                Vec::new()
            };
            transport.shutdown(&awaiting);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{net::wire::Envelope, task::WorkerId, worker::table::Callable};

    fn setup() -> (TaskQueue, TaskTable) {
        let queue = TaskQueue::new(&WorkerConfig::default(), None, Vec::new());
        let table = TaskTable::new(WorkerId(1), WorkerAddr::from("local"));
        (queue, table)
    }

    fn spawn(queue: &mut TaskQueue, table: &mut TaskTable) -> TaskId {
        let id = table.create(
            TaskId::ROOT,
            "noop",
            Callable::Named {
                function: "noop".into(),
                args: Vec::new(),
            },
            Vec::new(),
        );
        queue.append_init(table, id).unwrap();
        id
    }

    #[test]
    fn standalone_keeps_new_tasks_local() {
        let (mut queue, mut table) = setup();
        let id = spawn(&mut queue, &mut table);
        assert!(queue.movable.contains(&id));
        assert_eq!(queue.len(), (1, 0, 0));
    }

    #[test]
    fn ready_tasks_pop_before_movable_ones() {
        let (mut queue, mut table) = setup();
        let first = spawn(&mut queue, &mut table);
        let second = spawn(&mut queue, &mut table);
        assert!(queue.cancel(&mut table, second).unwrap());

        assert_eq!(queue.pop(&mut table, None).unwrap(), Some(second));
        assert_eq!(queue.pop(&mut table, None).unwrap(), Some(first));
        assert!(queue.is_in_progress(&first));
    }

    #[test]
    fn empty_standalone_queue_starves() {
        let (mut queue, mut table) = setup();
        assert!(matches!(
            queue.pop(&mut table, None),
            Err(QueueError::Starved)
        ));
        let soon = Instant::now() + Duration::from_millis(5);
        assert_eq!(queue.pop(&mut table, Some(soon)).unwrap(), None);
    }

    #[test]
    fn flush_on_an_empty_queue_is_a_no_op() {
        let (mut queue, mut table) = setup();
        for _ in 0..3 {
            queue.flush(&mut table).unwrap();
        }
        assert_eq!(queue.len(), (0, 0, 0));

        let id = spawn(&mut queue, &mut table);
        queue.flush(&mut table).unwrap();
        assert!(queue.movable.contains(&id));
    }

    #[test]
    fn flush_leaves_ready_tasks_in_place() {
        let (mut queue, mut table) = setup();
        let done = spawn(&mut queue, &mut table);
        spawn(&mut queue, &mut table);
        assert!(queue.cancel(&mut table, done).unwrap());
        queue.flush(&mut table).unwrap();
        assert_eq!(queue.len(), (1, 1, 0));
        assert_eq!(queue.pop(&mut table, None).unwrap(), Some(done));
    }

    #[test]
    fn append_init_rejects_started_tasks() {
        let (mut queue, mut table) = setup();
        let id = spawn(&mut queue, &mut table);
        queue.pop(&mut table, None).unwrap();
        assert!(matches!(
            queue.append_init(&mut table, id),
            Err(QueueError::InvalidTaskState { .. })
        ));
    }

    #[test]
    fn append_init_rejects_foreign_tasks() {
        let (mut queue, mut table) = setup();
        let envelope = TaskEnvelope {
            id: TaskId::new(WorkerId(2), 1),
            parent: TaskId::ROOT,
            owner: WorkerAddr::from("elsewhere"),
            function: "noop".into(),
            args: Vec::new(),
            groups: Vec::new(),
            created_at: 0,
            outcome: None,
            executor: None,
            execution_micros: None,
        };
        let id = envelope.id;
        assert!(table.insert_remote(envelope, None));
        assert!(matches!(
            queue.append_init(&mut table, id),
            Err(QueueError::InvalidTaskState { .. })
        ));
    }

    #[test]
    fn cancel_only_before_start() {
        let (mut queue, mut table) = setup();
        let running = spawn(&mut queue, &mut table);
        let waiting = spawn(&mut queue, &mut table);
        assert_eq!(queue.pop(&mut table, None).unwrap(), Some(running));

        assert!(!queue.cancel(&mut table, running).unwrap());
        assert!(table.get(&running).unwrap().outcome.get().is_none());

        assert!(queue.cancel(&mut table, waiting).unwrap());
        assert!(table.get(&waiting).unwrap().outcome.get().unwrap().is_cancelled());
        assert!(!queue.cancel(&mut table, waiting).unwrap());
    }

    #[test]
    fn shutdown_is_remembered_per_broker() {
        let (mut queue, mut table) = setup();
        let shutdown = Inbound::Message {
            broker: Some(0),
            envelope: Envelope::new(WorkerAddr::from("broker"), Message::Shutdown),
            received: Instant::now(),
        };
        assert!(matches!(
            queue.handle(&mut table, shutdown),
            Err(QueueError::Shutdown)
        ));
        assert!(queue.is_shut_down());
        assert!(queue.job_over);
        assert!(queue.shutdown_from.contains(&0));
        assert!(matches!(
            queue.update_queue(&mut table),
            Err(QueueError::Shutdown)
        ));
    }

    #[test]
    fn finalize_requires_in_progress_and_done() {
        let (mut queue, mut table) = setup();
        let id = spawn(&mut queue, &mut table);
        assert!(queue.finalize_future(&mut table, id).is_err());

        assert_eq!(queue.pop(&mut table, None).unwrap(), Some(id));
        assert!(queue.finalize_future(&mut table, id).is_err());

        table
            .complete(&id, Outcome::Value(vec![]), Duration::ZERO)
            .unwrap();
        assert_eq!(queue.finalize_future(&mut table, id).unwrap(), Finalized::Local);
        assert!(table.is_ready(&id).unwrap());
    }
}
