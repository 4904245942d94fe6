use std::collections::{BTreeMap, BTreeSet, VecDeque};

use hashbrown::HashMap;
use tracing::{debug, trace, warn};

use crate::{
    config::{DispatchPolicy, JobConfig},
    net::wire::{AssignmentState, Envelope, InitReply, Message, SharedEntry, TaskStatus},
    task::{TaskId, WorkerAddr},
};

/// Identifies one accepted or dialed connection for the broker's lifetime.
pub type ConnId = usize;

/// What the server has to do after a message was handled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Write `envelope` on the stream of `conn` its message belongs to.
    Send { conn: ConnId, envelope: Envelope },
    /// Connect to a newly learned peer broker.
    Dial(String),
    /// Stop accepting and close every link.
    Terminate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Peer {
    /// Opened, no INIT or CONNECT seen yet.
    Unknown,
    Worker(WorkerAddr),
    Broker(String),
}

struct QueuedTask {
    id: TaskId,
    envelope: Envelope,
}

struct Assignment {
    owner: WorkerAddr,
    executor: Option<ConnId>,
    state: AssignmentState,
}

pub struct BrokerState {
    addr: WorkerAddr,
    policy: DispatchPolicy,
    links: HashMap<ConnId, Peer>,
    workers: HashMap<WorkerAddr, ConnId>,
    /// Workers holding a REQUEST credit, oldest first.
    available: VecDeque<ConnId>,
    unassigned: VecDeque<QueuedTask>,
    assignments: HashMap<TaskId, Assignment>,
    shared: BTreeMap<WorkerAddr, BTreeMap<String, Vec<u8>>>,
    job: Option<JobConfig>,
    /// Peer brokers, not including this one.
    brokers: BTreeSet<String>,
    shutting_down: bool,
}

impl BrokerState {
    pub fn new(addr: WorkerAddr, policy: DispatchPolicy) -> Self {
        Self {
            addr,
            policy,
            links: HashMap::new(),
            workers: HashMap::new(),
            available: VecDeque::new(),
            unassigned: VecDeque::new(),
            assignments: HashMap::new(),
            shared: BTreeMap::new(),
            job: None,
            brokers: BTreeSet::new(),
            shutting_down: false,
        }
    }

    pub fn addr(&self) -> &WorkerAddr {
        &self.addr
    }

    pub fn available_workers(&self) -> usize {
        self.available.len()
    }

    pub fn unassigned_tasks(&self) -> usize {
        self.unassigned.len()
    }

    /// Tasks queued here or out with an executor.
    pub fn tracked_tasks(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Registers a connection accepted from anyone.
    pub fn accepted(&mut self, conn: ConnId) {
        self.links.insert(conn, Peer::Unknown);
    }

    /// Registers a connection this broker dialed to a peer broker.
    pub fn peer_connected(&mut self, conn: ConnId, addr: String) {
        self.brokers.insert(addr.clone());
        self.links.insert(conn, Peer::Broker(addr));
    }

    /// Peer brokers this one should dial at startup, marked known so a
    /// CONNECT naming them does not dial them twice.
    pub fn add_peers(&mut self, peers: &[String]) -> Vec<Effect> {
        peers
            .iter()
            .filter(|peer| peer.as_str() != self.addr.as_str())
            .filter(|peer| self.brokers.insert((*peer).clone()))
            .map(|peer| Effect::Dial(peer.clone()))
            .collect()
    }

    /// Opening message of a link to a peer broker.
    pub fn connect_message(&self) -> Message {
        Message::Connect {
            brokers: self.known_brokers(true),
        }
    }

    fn known_brokers(&self, with_self: bool) -> Vec<String> {
        let mut list: Vec<String> = self.brokers.iter().cloned().collect();
        if with_self {
            list.push(self.addr.to_string());
        }
        list
    }

    fn reply(&self, conn: ConnId, message: Message) -> Effect {
        Effect::Send {
            conn,
            envelope: Envelope::new(self.addr.clone(), message),
        }
    }

    fn worker_conns(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.links
            .iter()
            .filter(|(_, peer)| matches!(peer, Peer::Worker(_)))
            .map(|(conn, _)| *conn)
    }

    fn broker_conns(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.links
            .iter()
            .filter(|(_, peer)| matches!(peer, Peer::Broker(_)))
            .map(|(conn, _)| *conn)
    }

    /// Records that `executor` got task `id`. A task handed back to its own
    /// owner runs there without a REPLY, so it is no longer tracked.
    fn assign(&mut self, id: TaskId, executor: ConnId) {
        let Some(assignment) = self.assignments.get_mut(&id) else {
            return;
        };
        if self.workers.get(&assignment.owner) == Some(&executor) {
            trace!(%id, executor, "returned to its owner");
            self.assignments.remove(&id);
            return;
        }
        assignment.executor = Some(executor);
        assignment.state = AssignmentState::Assigned;
        trace!(%id, executor, "dispatched");
    }

    /// Handles one message read from `conn`.
    pub fn handle(&mut self, conn: ConnId, envelope: Envelope) -> Vec<Effect> {
        trace!(
            conn,
            from = %envelope.sender,
            kind = ?envelope.message.msg_type(),
            "broker handling"
        );
        let from_worker = matches!(self.links.get(&conn), Some(Peer::Worker(_)));

        match &envelope.message {
            Message::Hello => Vec::new(),
            Message::Init(info) => {
                debug!(conn, worker = %info.addr, origin = info.origin, "worker joined");
                if let Some(Peer::Worker(previous)) = self.links.get(&conn) {
                    self.workers.remove(previous);
                }
                self.links.insert(conn, Peer::Worker(info.addr.clone()));
                self.workers.insert(info.addr.clone(), conn);
                if info.origin {
                    match self.job.as_ref() {
                        Some(job) if *job != info.job => {
                            debug!(job = %job.name, "keeping the job config of the first origin")
                        }
                        Some(_) => {}
                        None => self.job = Some(info.job.clone()),
                    }
                }
                let shared = self
                    .shared
                    .iter()
                    .flat_map(|(source, vars)| {
                        vars.iter().map(move |(key, value)| SharedEntry {
                            source: source.clone(),
                            key: key.clone(),
                            value: value.clone(),
                        })
                    })
                    .collect();
                vec![self.reply(
                    conn,
                    Message::InitReply(InitReply {
                        job: self.job.clone(),
                        shared,
                        brokers: self.known_brokers(false),
                    }),
                )]
            }
            Message::Task { id, owner, .. } => {
                let (id, owner) = (*id, owner.clone());
                match self.available.pop_front() {
                    Some(executor) => {
                        self.assignments.insert(
                            id,
                            Assignment {
                                owner,
                                executor: None,
                                state: AssignmentState::Queued,
                            },
                        );
                        self.assign(id, executor);
                        vec![Effect::Send {
                            conn: executor,
                            envelope,
                        }]
                    }
                    None => {
                        self.assignments.insert(
                            id,
                            Assignment {
                                owner,
                                executor: None,
                                state: AssignmentState::Queued,
                            },
                        );
                        self.unassigned.push_back(QueuedTask { id, envelope });
                        Vec::new()
                    }
                }
            }
            Message::Request => {
                let next = match self.policy {
                    DispatchPolicy::Lifo => self.unassigned.pop_back(),
                    DispatchPolicy::Fifo => self.unassigned.pop_front(),
                };
                match next {
                    Some(task) => {
                        self.assign(task.id, conn);
                        vec![Effect::Send {
                            conn,
                            envelope: task.envelope,
                        }]
                    }
                    None => {
                        if !self.available.contains(&conn) {
                            self.available.push_back(conn);
                        }
                        Vec::new()
                    }
                }
            }
            Message::Reply { id, destination, .. } => {
                self.assignments.remove(id);
                match self.workers.get(destination) {
                    Some(&owner) => vec![Effect::Send {
                        conn: owner,
                        envelope,
                    }],
                    None => {
                        warn!(%id, %destination, "undeliverable reply, dropping");
                        Vec::new()
                    }
                }
            }
            Message::Variable { key, value, source } => {
                self.shared
                    .entry(source.clone())
                    .or_default()
                    .insert(key.clone(), value.clone());
                let mut targets: Vec<ConnId> =
                    self.worker_conns().filter(|&c| c != conn).collect();
                if from_worker {
                    targets.extend(self.broker_conns());
                }
                targets
                    .into_iter()
                    .map(|target| Effect::Send {
                        conn: target,
                        envelope: envelope.clone(),
                    })
                    .collect()
            }
            Message::Shutdown => {
                // the sender is included: it waits for the echo before closing
                let mut targets: Vec<ConnId> = self.worker_conns().collect();
                if from_worker {
                    targets.extend(self.broker_conns());
                } else {
                    targets.push(conn);
                }
                self.broadcast_shutdown(envelope, targets)
            }
            Message::Connect { brokers } => {
                let mut effects = Vec::new();
                let sender = envelope.sender.to_string();
                if matches!(self.links.get(&conn), Some(Peer::Unknown) | None) {
                    debug!(conn, peer = %sender, "peer broker connected");
                    self.links.insert(conn, Peer::Broker(sender.clone()));
                    self.brokers.insert(sender.clone());
                    effects.push(self.reply(conn, self.connect_message()));
                }
                for broker in brokers {
                    if broker.as_str() == self.addr.as_str() || broker == &sender {
                        continue;
                    }
                    if self.brokers.insert(broker.clone()) {
                        effects.push(Effect::Dial(broker.clone()));
                    }
                }
                effects
            }
            Message::StatusReq { ids } => {
                let statuses = ids
                    .iter()
                    .map(|id| TaskStatus {
                        id: *id,
                        state: self
                            .assignments
                            .get(id)
                            .map_or(AssignmentState::Lost, |a| a.state),
                    })
                    .collect();
                vec![self.reply(conn, Message::StatusAns { statuses })]
            }
            Message::StatusUpdate { ids } => {
                for id in ids {
                    if let Some(assignment) = self.assignments.get_mut(id) {
                        assignment.state = AssignmentState::Running;
                    }
                }
                Vec::new()
            }
            Message::StatusDone { ids } => {
                for id in ids {
                    self.assignments.remove(id);
                }
                Vec::new()
            }
            Message::WorkerDown => {
                warn!(worker = %envelope.sender, "worker reported its scheduler down");
                self.disconnect(conn)
            }
            other => {
                debug!(conn, kind = ?other.msg_type(), "ignoring unexpected message");
                Vec::new()
            }
        }
    }

    /// Shutdown started by this broker itself, e.g. on an interrupt.
    pub fn shutdown(&mut self) -> Vec<Effect> {
        let envelope = Envelope::new(self.addr.clone(), Message::Shutdown);
        let targets: Vec<ConnId> = self.worker_conns().chain(self.broker_conns()).collect();
        self.broadcast_shutdown(envelope, targets)
    }

    fn broadcast_shutdown(&mut self, envelope: Envelope, targets: Vec<ConnId>) -> Vec<Effect> {
        if self.shutting_down {
            return Vec::new();
        }
        self.shutting_down = true;
        debug!(from = %envelope.sender, "shutting down");
        let mut effects: Vec<Effect> = targets
            .into_iter()
            .map(|conn| Effect::Send {
                conn,
                envelope: envelope.clone(),
            })
            .collect();
        effects.push(Effect::Terminate);
        effects
    }

    /// Forgets a link. Tasks its worker was executing are sent back to
    /// their owners for resending; tasks it owned are dropped, nobody is
    /// left to receive their results. Safe to call more than once.
    pub fn disconnect(&mut self, conn: ConnId) -> Vec<Effect> {
        let Some(peer) = self.links.remove(&conn) else {
            return Vec::new();
        };
        self.available.retain(|&c| c != conn);
        let addr = match peer {
            Peer::Worker(addr) => addr,
            Peer::Broker(addr) => {
                warn!(peer = %addr, "lost peer broker");
                return Vec::new();
            }
            Peer::Unknown => return Vec::new(),
        };
        if self.workers.get(&addr) == Some(&conn) {
            self.workers.remove(&addr);
        }
        if !self.shutting_down {
            warn!(worker = %addr, "lost worker");
        }

        self.unassigned.retain(|task| match &task.envelope.message {
            Message::Task { owner, .. } => *owner != addr,
            _ => true,
        });
        let mut effects = Vec::new();
        let mut forget = Vec::new();
        for (id, assignment) in &self.assignments {
            if assignment.owner == addr {
                forget.push(*id);
            } else if assignment.executor == Some(conn) {
                forget.push(*id);
                if let Some(&owner) = self.workers.get(&assignment.owner) {
                    debug!(%id, owner = %assignment.owner, "asking owner to resend");
                    effects.push(self.reply(owner, Message::ResendFuture { id: *id }));
                }
            }
        }
        for id in forget {
            self.assignments.remove(&id);
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{net::wire::WorkerInfo, task::WorkerId};

    fn state(policy: DispatchPolicy) -> BrokerState {
        BrokerState::new(WorkerAddr::from("127.0.0.1:5000"), policy)
    }

    fn addr(i: usize) -> WorkerAddr {
        WorkerAddr(format!("127.0.0.1:{}", 6000 + i))
    }

    fn join(state: &mut BrokerState, conn: ConnId, origin: bool) -> Vec<Effect> {
        state.accepted(conn);
        state.handle(
            conn,
            Envelope::new(
                addr(conn),
                Message::Init(WorkerInfo {
                    addr: addr(conn),
                    origin,
                    job: JobConfig {
                        name: "job".into(),
                        low_watermark: 1,
                        high_watermark: 4,
                    },
                }),
            ),
        )
    }

    fn task(owner: ConnId, seq: u64) -> Envelope {
        Envelope::new(
            addr(owner),
            Message::Task {
                id: TaskId::new(WorkerId(owner as u64), seq),
                owner: addr(owner),
                payload: vec![seq as u8],
            },
        )
    }

    fn request(conn: ConnId) -> Envelope {
        Envelope::new(addr(conn), Message::Request)
    }

    fn sent_to(effects: &[Effect]) -> Vec<ConnId> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send { conn, .. } => Some(*conn),
                _ => None,
            })
            .collect()
    }

    fn sent_seq(effect: &Effect) -> u64 {
        match effect {
            Effect::Send {
                envelope:
                    Envelope {
                        message: Message::Task { id, .. },
                        ..
                    },
                ..
            } => id.seq,
            other => panic!("not a task delivery: {:?}", other),
        }
    }

    #[test]
    fn init_reply_carries_job_and_shared_variables() {
        let mut state = state(DispatchPolicy::Lifo);
        join(&mut state, 1, true);
        state.handle(
            1,
            Envelope::new(
                addr(1),
                Message::Variable {
                    key: "k".into(),
                    value: vec![7],
                    source: addr(1),
                },
            ),
        );

        let effects = join(&mut state, 2, false);
        match &effects[..] {
            [Effect::Send {
                conn: 2,
                envelope:
                    Envelope {
                        message: Message::InitReply(reply),
                        ..
                    },
            }] => {
                assert_eq!(reply.job.as_ref().map(|j| j.name.as_str()), Some("job"));
                assert_eq!(reply.shared.len(), 1);
                assert_eq!(reply.shared[0].key, "k");
                assert_eq!(reply.shared[0].source, addr(1));
            }
            other => panic!("unexpected effects {:?}", other),
        }
    }

    #[test]
    fn tasks_go_to_idle_workers_one_each() {
        let mut state = state(DispatchPolicy::Lifo);
        for conn in 1..=4 {
            join(&mut state, conn, conn == 1);
        }
        for conn in 2..=4 {
            assert!(state.handle(conn, request(conn)).is_empty());
        }

        let mut receivers = Vec::new();
        for seq in 1..=3 {
            receivers.extend(sent_to(&state.handle(1, task(1, seq))));
        }
        assert_eq!(receivers, vec![2, 3, 4]);
        assert_eq!(state.available_workers(), 0);

        // no capacity left: queued, not dropped
        assert!(state.handle(1, task(1, 4)).is_empty());
        assert_eq!(state.unassigned_tasks(), 1);
    }

    #[test]
    fn repeated_requests_grant_one_credit() {
        let mut state = state(DispatchPolicy::Lifo);
        join(&mut state, 1, true);
        join(&mut state, 2, false);
        state.handle(2, request(2));
        state.handle(2, request(2));
        assert_eq!(state.available_workers(), 1);
    }

    #[test]
    fn dispatch_policy_picks_newest_or_oldest() {
        for (policy, expected) in [(DispatchPolicy::Lifo, 3), (DispatchPolicy::Fifo, 1)] {
            let mut state = state(policy);
            join(&mut state, 1, true);
            join(&mut state, 2, false);
            for seq in 1..=3 {
                state.handle(1, task(1, seq));
            }
            let effects = state.handle(2, request(2));
            assert_eq!(effects.len(), 1);
            assert_eq!(sent_seq(&effects[0]), expected);
        }
    }

    #[test]
    fn replies_are_routed_to_the_owner() {
        let mut state = state(DispatchPolicy::Lifo);
        join(&mut state, 1, true);
        join(&mut state, 2, false);
        let id = TaskId::new(WorkerId(1), 1);
        let reply = Envelope::new(
            addr(2),
            Message::Reply {
                id,
                destination: addr(1),
                payload: vec![],
            },
        );
        assert_eq!(sent_to(&state.handle(2, reply)), vec![1]);

        let lost = Envelope::new(
            addr(2),
            Message::Reply {
                id,
                destination: addr(9),
                payload: vec![],
            },
        );
        assert!(state.handle(2, lost).is_empty());
    }

    #[test]
    fn executor_loss_asks_owner_to_resend() {
        let mut state = state(DispatchPolicy::Lifo);
        join(&mut state, 1, true);
        join(&mut state, 2, false);
        state.handle(2, request(2));
        state.handle(1, task(1, 1));

        let effects = state.disconnect(2);
        match &effects[..] {
            [Effect::Send {
                conn: 1,
                envelope:
                    Envelope {
                        message: Message::ResendFuture { id },
                        ..
                    },
            }] => assert_eq!(*id, TaskId::new(WorkerId(1), 1)),
            other => panic!("unexpected effects {:?}", other),
        }
        assert!(state.disconnect(2).is_empty());
    }

    #[test]
    fn owner_loss_drops_its_queued_tasks() {
        let mut state = state(DispatchPolicy::Lifo);
        join(&mut state, 1, true);
        state.handle(1, task(1, 1));
        assert_eq!(state.unassigned_tasks(), 1);
        state.disconnect(1);
        assert_eq!(state.unassigned_tasks(), 0);
    }

    #[test]
    fn tasks_handed_back_to_their_owner_are_not_tracked() {
        let mut state = state(DispatchPolicy::Lifo);
        join(&mut state, 1, true);
        join(&mut state, 2, false);
        for seq in 1..=50 {
            state.handle(1, request(1));
            assert_eq!(sent_to(&state.handle(1, task(1, seq))), vec![1]);
        }
        for seq in 51..=100 {
            state.handle(1, task(1, seq));
            assert_eq!(sent_to(&state.handle(1, request(1))), vec![1]);
        }
        assert_eq!(state.tracked_tasks(), 0);

        state.handle(2, request(2));
        state.handle(1, task(1, 101));
        assert_eq!(state.tracked_tasks(), 1);
    }

    #[test]
    fn status_requests_report_lost_tasks() {
        let mut state = state(DispatchPolicy::Lifo);
        join(&mut state, 1, true);
        join(&mut state, 2, false);
        state.handle(1, task(1, 1));
        state.handle(2, request(2));
        state.handle(
            2,
            Envelope::new(
                addr(2),
                Message::StatusUpdate {
                    ids: vec![TaskId::new(WorkerId(1), 1)],
                },
            ),
        );

        let ids = vec![TaskId::new(WorkerId(1), 1), TaskId::new(WorkerId(1), 2)];
        let effects = state.handle(1, Envelope::new(addr(1), Message::StatusReq { ids }));
        match &effects[..] {
            [Effect::Send {
                envelope:
                    Envelope {
                        message: Message::StatusAns { statuses },
                        ..
                    },
                ..
            }] => {
                assert_eq!(statuses[0].state, AssignmentState::Running);
                assert_eq!(statuses[1].state, AssignmentState::Lost);
            }
            other => panic!("unexpected effects {:?}", other),
        }
    }

    #[test]
    fn shutdown_is_broadcast_once() {
        let mut state = state(DispatchPolicy::Lifo);
        for conn in 1..=3 {
            join(&mut state, conn, conn == 1);
        }
        let shutdown = Envelope::new(addr(1), Message::Shutdown);
        let effects = state.handle(1, shutdown.clone());
        let mut targets = sent_to(&effects);
        targets.sort_unstable();
        assert_eq!(targets, vec![1, 2, 3]);
        assert_eq!(effects.last(), Some(&Effect::Terminate));
        assert!(state.is_shutting_down());
        assert!(state.handle(1, shutdown).is_empty());
    }

    #[test]
    fn connect_dials_unknown_brokers() {
        let mut state = state(DispatchPolicy::Lifo);
        state.accepted(7);
        let effects = state.handle(
            7,
            Envelope::new(
                WorkerAddr::from("127.0.0.1:5001"),
                Message::Connect {
                    brokers: vec![
                        "127.0.0.1:5000".into(),
                        "127.0.0.1:5001".into(),
                        "127.0.0.1:5002".into(),
                    ],
                },
            ),
        );
        assert_eq!(sent_to(&effects), vec![7]);
        assert!(effects.contains(&Effect::Dial("127.0.0.1:5002".into())));
        assert!(!effects.contains(&Effect::Dial("127.0.0.1:5000".into())));

        // worker joining later learns both peers
        let reply = join(&mut state, 8, false);
        match &reply[..] {
            [Effect::Send {
                envelope:
                    Envelope {
                        message: Message::InitReply(reply),
                        ..
                    },
                ..
            }] => assert_eq!(reply.brokers, vec!["127.0.0.1:5001", "127.0.0.1:5002"]),
            other => panic!("unexpected effects {:?}", other),
        }
    }

    #[test]
    fn variables_from_workers_reach_peer_brokers() {
        let mut state = state(DispatchPolicy::Lifo);
        join(&mut state, 1, true);
        join(&mut state, 2, false);
        state.peer_connected(3, "127.0.0.1:5001".into());
        let var = Envelope::new(
            addr(1),
            Message::Variable {
                key: "k".into(),
                value: vec![1],
                source: addr(1),
            },
        );
        let mut targets = sent_to(&state.handle(1, var.clone()));
        targets.sort_unstable();
        assert_eq!(targets, vec![2, 3]);

        // forwarded copies are not forwarded again
        let mut targets = sent_to(&state.handle(3, var));
        targets.sort_unstable();
        assert_eq!(targets, vec![1, 2]);
    }
}
