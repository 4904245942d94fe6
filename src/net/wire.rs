use std::borrow::Cow;

use rkyv::{Archive, Deserialize, Serialize};

use crate::{
    codec::{self, Decode, Encode},
    config::JobConfig,
    error::CodecError,
    task::{TaskId, WorkerAddr},
};

/// First byte of every frame body. Only the lowest bit is used so far.
const FLAG_COMPRESSED: u8 = 0b0000_0001;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    // TASK STREAM
    /// Offer (worker → broker) or deliver (broker → worker) one task
    Task = 1,
    /// "I can run one more task"
    Request = 2,
    /// A finished task on its way back to its owner
    Reply = 3,
    /// Worker handshake
    Init = 4,
    /// Broker's answer to INIT: job config, shared variables, known brokers
    InitReply = 5,
    /// Broker → owner: the executor of this task is gone, send it again
    ResendFuture = 6,
    /// Owner → broker: where are these tasks?
    StatusReq = 7,
    /// Broker → owner: answer to a status request
    StatusAns = 8,
    /// Executor → broker: these tasks were answered directly
    StatusDone = 9,
    /// Executor → broker: these tasks started running here
    StatusUpdate = 10,
    /// A worker advertises that its scheduler failed
    WorkerDown = 11,
    /// Broker federation: known broker addresses
    Connect = 12,

    // INFO STREAM (and forwarded between brokers)
    /// A shared constant was set
    Variable = 32,
    /// Graceful teardown
    Shutdown = 33,
    /// Opens the info stream
    Hello = 34,
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageType::*;
        Ok(match value {
            1 => Task,
            2 => Request,
            3 => Reply,
            4 => Init,
            5 => InitReply,
            6 => ResendFuture,
            7 => StatusReq,
            8 => StatusAns,
            9 => StatusDone,
            10 => StatusUpdate,
            11 => WorkerDown,
            12 => Connect,
            32 => Variable,
            33 => Shutdown,
            34 => Hello,
            other => return Err(CodecError::UnknownMessageType(other)),
        })
    }
}

/// Which of the two streams of a worker↔broker link a message travels on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Task,
    Info,
}

/// Sent with INIT.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct WorkerInfo {
    pub addr: WorkerAddr,
    pub origin: bool,
    pub job: JobConfig,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct SharedEntry {
    pub source: WorkerAddr,
    pub key: String,
    pub value: Vec<u8>,
}

/// Everything a late-joining worker needs to catch up.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct InitReply {
    pub job: Option<JobConfig>,
    pub shared: Vec<SharedEntry>,
    pub brokers: Vec<String>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum AssignmentState {
    /// Waiting at the broker for a worker
    Queued,
    /// Handed to a live worker
    Assigned,
    /// The executor reported it started
    Running,
    /// The broker has no live record of it
    Lost,
}

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct TaskStatus {
    pub id: TaskId,
    pub state: AssignmentState,
}

/// The closed set of messages exchanged between workers and brokers. Decoded
/// once at the transport boundary; nothing above it dispatches on raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Task {
        id: TaskId,
        owner: WorkerAddr,
        /// Encoded `TaskEnvelope`, opaque to the broker
        payload: Vec<u8>,
    },
    Request,
    Reply {
        id: TaskId,
        destination: WorkerAddr,
        payload: Vec<u8>,
    },
    Init(WorkerInfo),
    InitReply(InitReply),
    ResendFuture {
        id: TaskId,
    },
    StatusReq {
        ids: Vec<TaskId>,
    },
    StatusAns {
        statuses: Vec<TaskStatus>,
    },
    StatusDone {
        ids: Vec<TaskId>,
    },
    StatusUpdate {
        ids: Vec<TaskId>,
    },
    WorkerDown,
    Connect {
        brokers: Vec<String>,
    },
    Variable {
        key: String,
        value: Vec<u8>,
        source: WorkerAddr,
    },
    Shutdown,
    Hello,
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Task { .. } => MessageType::Task,
            Message::Request => MessageType::Request,
            Message::Reply { .. } => MessageType::Reply,
            Message::Init(_) => MessageType::Init,
            Message::InitReply(_) => MessageType::InitReply,
            Message::ResendFuture { .. } => MessageType::ResendFuture,
            Message::StatusReq { .. } => MessageType::StatusReq,
            Message::StatusAns { .. } => MessageType::StatusAns,
            Message::StatusDone { .. } => MessageType::StatusDone,
            Message::StatusUpdate { .. } => MessageType::StatusUpdate,
            Message::WorkerDown => MessageType::WorkerDown,
            Message::Connect { .. } => MessageType::Connect,
            Message::Variable { .. } => MessageType::Variable,
            Message::Shutdown => MessageType::Shutdown,
            Message::Hello => MessageType::Hello,
        }
    }

    /// The stream a message is written to by its sender.
    pub fn channel(&self) -> Channel {
        match self {
            Message::Variable { .. } | Message::Shutdown | Message::Hello => Channel::Info,
            _ => Channel::Task,
        }
    }

    fn payload_parts(&self) -> Result<Vec<Cow<'_, [u8]>>, CodecError> {
        let parts = match self {
            Message::Task { id, owner, payload } => vec![
                Cow::Owned(id.to_wire().to_vec()),
                Cow::Borrowed(owner.as_str().as_bytes()),
                Cow::Borrowed(payload.as_slice()),
            ],
            Message::Reply {
                id,
                destination,
                payload,
            } => vec![
                Cow::Owned(id.to_wire().to_vec()),
                Cow::Borrowed(destination.as_str().as_bytes()),
                Cow::Borrowed(payload.as_slice()),
            ],
            Message::Init(info) => vec![Cow::Owned(info.encode()?)],
            Message::InitReply(reply) => vec![Cow::Owned(reply.encode()?)],
            Message::ResendFuture { id } => vec![Cow::Owned(id.to_wire().to_vec())],
            Message::StatusReq { ids }
            | Message::StatusDone { ids }
            | Message::StatusUpdate { ids } => vec![Cow::Owned(ids.encode()?)],
            Message::StatusAns { statuses } => vec![Cow::Owned(statuses.encode()?)],
            Message::Connect { brokers } => vec![Cow::Owned(brokers.encode()?)],
            Message::Variable { key, value, source } => vec![
                Cow::Borrowed(key.as_bytes()),
                Cow::Borrowed(value.as_slice()),
                Cow::Borrowed(source.as_str().as_bytes()),
            ],
            Message::Request | Message::WorkerDown | Message::Shutdown | Message::Hello => {
                Vec::new()
            }
        };
        Ok(parts)
    }

    fn from_parts(msg_type: MessageType, parts: &[&[u8]]) -> Result<Self, CodecError> {
        let part = |i: usize| -> Result<&[u8], CodecError> {
            parts
                .get(i)
                .copied()
                .ok_or(CodecError::Frame("missing message part"))
        };
        let task_id = |i: usize| -> Result<TaskId, CodecError> {
            TaskId::from_wire(part(i)?).ok_or(CodecError::Frame("bad task id"))
        };
        let text = |i: usize| -> Result<String, CodecError> {
            String::from_utf8(part(i)?.to_vec()).map_err(|_| CodecError::Frame("invalid utf-8"))
        };

        Ok(match msg_type {
            MessageType::Task => Message::Task {
                id: task_id(0)?,
                owner: WorkerAddr(text(1)?),
                payload: part(2)?.to_vec(),
            },
            MessageType::Request => Message::Request,
            MessageType::Reply => Message::Reply {
                id: task_id(0)?,
                destination: WorkerAddr(text(1)?),
                payload: part(2)?.to_vec(),
            },
            MessageType::Init => Message::Init(WorkerInfo::decode(part(0)?)?),
            MessageType::InitReply => Message::InitReply(InitReply::decode(part(0)?)?),
            MessageType::ResendFuture => Message::ResendFuture { id: task_id(0)? },
            MessageType::StatusReq => Message::StatusReq {
                ids: Vec::decode(part(0)?)?,
            },
            MessageType::StatusAns => Message::StatusAns {
                statuses: Vec::decode(part(0)?)?,
            },
            MessageType::StatusDone => Message::StatusDone {
                ids: Vec::decode(part(0)?)?,
            },
            MessageType::StatusUpdate => Message::StatusUpdate {
                ids: Vec::decode(part(0)?)?,
            },
            MessageType::WorkerDown => Message::WorkerDown,
            MessageType::Connect => Message::Connect {
                brokers: Vec::decode(part(0)?)?,
            },
            MessageType::Variable => Message::Variable {
                key: text(0)?,
                value: part(1)?.to_vec(),
                source: WorkerAddr(text(2)?),
            },
            MessageType::Shutdown => Message::Shutdown,
            MessageType::Hello => Message::Hello,
        })
    }
}

/// A message together with the address of whoever sent it. On the wire this
/// is the multi-part frame `[sender, type, ...payload]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub sender: WorkerAddr,
    pub message: Message,
}

impl Envelope {
    pub fn new(sender: WorkerAddr, message: Message) -> Self {
        Self { sender, message }
    }

    /// Encodes the frame body: `flags | (varint len | part)*`. Bodies larger
    /// than `compress_above` are zstd-compressed as a whole.
    pub fn encode(&self, compress_above: Option<usize>) -> Result<Vec<u8>, CodecError> {
        let msg_type = [self.message.msg_type() as u8];
        let payload = self.message.payload_parts()?;
        let mut parts: Vec<&[u8]> = Vec::with_capacity(2 + payload.len());
        parts.push(self.sender.as_str().as_bytes());
        parts.push(&msg_type);
        parts.extend(payload.iter().map(|p| p.as_ref()));

        let mut body = Vec::with_capacity(parts.iter().map(|p| p.len() + 5).sum());
        for part in parts {
            let mut len_buf = unsigned_varint::encode::u32_buffer();
            body.extend_from_slice(unsigned_varint::encode::u32(part.len() as u32, &mut len_buf));
            body.extend_from_slice(part);
        }

        let mut frame = Vec::with_capacity(1 + body.len());
        match compress_above {
            Some(limit) if body.len() > limit => {
                frame.push(FLAG_COMPRESSED);
                frame.extend_from_slice(&codec::compress(&body)?);
            }
            _ => {
                frame.push(0);
                frame.extend_from_slice(&body);
            }
        }
        Ok(frame)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let (&flags, rest) = frame
            .split_first()
            .ok_or(CodecError::Frame("empty frame"))?;
        let body: Cow<'_, [u8]> = if flags & FLAG_COMPRESSED != 0 {
            Cow::Owned(codec::decompress(rest)?)
        } else {
            Cow::Borrowed(rest)
        };

        let mut parts = Vec::new();
        let mut cursor: &[u8] = &body;
        while !cursor.is_empty() {
            let (len, rest) = unsigned_varint::decode::u32(cursor)
                .map_err(|_| CodecError::Frame("bad part length"))?;
            let len = len as usize;
            if rest.len() < len {
                return Err(CodecError::Frame("truncated part"));
            }
            parts.push(&rest[..len]);
            cursor = &rest[len..];
        }

        if parts.len() < 2 {
            return Err(CodecError::Frame("missing header parts"));
        }
        let sender = String::from_utf8(parts[0].to_vec())
            .map_err(|_| CodecError::Frame("invalid utf-8"))?;
        let msg_type = match parts[1] {
            [byte] => MessageType::try_from(*byte)?,
            _ => return Err(CodecError::Frame("bad message type")),
        };
        Ok(Self {
            sender: WorkerAddr(sender),
            message: Message::from_parts(msg_type, &parts[2..])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::WorkerId;

    fn sender() -> WorkerAddr {
        WorkerAddr::from("127.0.0.1:4000")
    }

    #[test]
    fn task_frame_keeps_header_fields_outside_payload() {
        let id = TaskId::new(WorkerId(9), 3);
        let envelope = Envelope::new(
            sender(),
            Message::Task {
                id,
                owner: WorkerAddr::from("10.0.0.1:1"),
                payload: vec![1, 2, 3],
            },
        );
        let frame = envelope.encode(None).unwrap();
        assert_eq!(frame[0], 0);
        assert_eq!(Envelope::decode(&frame).unwrap(), envelope);
    }

    #[test]
    fn large_frames_are_compressed() {
        let envelope = Envelope::new(
            sender(),
            Message::Variable {
                key: "table".into(),
                value: vec![0u8; 10_000],
                source: sender(),
            },
        );
        let frame = envelope.encode(Some(1024)).unwrap();
        assert_eq!(frame[0] & FLAG_COMPRESSED, FLAG_COMPRESSED);
        assert!(frame.len() < 10_000);
        assert_eq!(Envelope::decode(&frame).unwrap(), envelope);
    }

    #[test]
    fn status_answers_carry_states() {
        let envelope = Envelope::new(
            sender(),
            Message::StatusAns {
                statuses: vec![
                    TaskStatus {
                        id: TaskId::new(WorkerId(1), 1),
                        state: AssignmentState::Lost,
                    },
                    TaskStatus {
                        id: TaskId::new(WorkerId(1), 2),
                        state: AssignmentState::Running,
                    },
                ],
            },
        );
        let frame = envelope.encode(None).unwrap();
        assert_eq!(Envelope::decode(&frame).unwrap(), envelope);
    }

    #[test]
    fn info_messages_use_info_stream() {
        assert_eq!(Message::Shutdown.channel(), Channel::Info);
        assert_eq!(Message::Hello.channel(), Channel::Info);
        assert_eq!(Message::Request.channel(), Channel::Task);
    }

    #[test]
    fn rejects_unknown_type() {
        let mut frame = Envelope::new(sender(), Message::Request)
            .encode(None)
            .unwrap();
        // body: flags | len(sender) sender | len(1) type
        let last = frame.len() - 1;
        frame[last] = 0x7f;
        assert_eq!(
            Envelope::decode(&frame).unwrap_err(),
            CodecError::UnknownMessageType(0x7f)
        );
    }

    #[test]
    fn rejects_truncated_parts() {
        let frame = Envelope::new(
            sender(),
            Message::ResendFuture {
                id: TaskId::new(WorkerId(2), 2),
            },
        )
        .encode(None)
        .unwrap();
        assert!(Envelope::decode(&frame[..frame.len() - 4]).is_err());
        assert!(Envelope::decode(&[]).is_err());
    }
}
