mod server;
mod state;

// The broker never runs a task and never decodes one. Everything it knows
// about a task is the id and owner carried in the frame header; the encoded
// envelope is forwarded byte for byte. Its whole job is to pair "I have a
// task" with "I have spare capacity" and to route replies back to owners.

// The state machine is kept free of IO: it consumes one decoded message at a
// time and answers with a list of effects (frames to send, peers to dial,
// terminate). The server owns the QUIC endpoint and one reader and writer
// task per stream, and feeds every event through a single channel into the
// loop that owns the state, so the state is never shared or locked.

pub use server::Broker;
pub use state::{BrokerState, ConnId, Effect};
