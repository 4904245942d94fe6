use byteorder::{ByteOrder, LittleEndian};
use quinn::{ReadExactError, RecvStream, SendStream};

use super::{wire::Envelope, MAX_FRAME_LEN};
use crate::error::NetError;

/// Writes length-prefixed frames onto one QUIC stream.
pub struct FrameSendStream {
    stream: SendStream,
    compress_above: Option<usize>,
}

impl FrameSendStream {
    pub fn new(stream: SendStream, compress_above: Option<usize>) -> Self {
        Self {
            stream,
            compress_above,
        }
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), NetError> {
        let body = envelope.encode(self.compress_above)?;
        self.send_raw(&body).await
    }

    /// Writes an already encoded frame body.
    pub async fn send_raw(&mut self, body: &[u8]) -> Result<(), NetError> {
        let len = body.len();
        let mut buf = vec![0u8; 4 + len];
        LittleEndian::write_u32(&mut buf[..4], len as u32);
        buf[4..].copy_from_slice(body);
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<(), NetError> {
        self.stream.finish().await?;
        Ok(())
    }
}

/// Reads the frames written by a [`FrameSendStream`].
pub struct FrameRecvStream(RecvStream);

impl FrameRecvStream {
    pub fn new(stream: RecvStream) -> Self {
        Self(stream)
    }

    /// Returns `Ok(None)` once the peer has finished the stream cleanly.
    pub async fn receive(&mut self) -> Result<Option<Envelope>, NetError> {
        let mut len_buf = [0u8; 4];
        match self.0.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(ReadExactError::FinishedEarly) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = LittleEndian::read_u32(&len_buf);
        if len > MAX_FRAME_LEN {
            return Err(NetError::FrameTooLarge(len));
        }
        let mut msg_buf = vec![0u8; len as usize];
        match self.0.read_exact(&mut msg_buf).await {
            Ok(()) => {}
            Err(ReadExactError::FinishedEarly) => return Err(NetError::Closed),
            Err(e) => return Err(e.into()),
        }
        Ok(Some(Envelope::decode(&msg_buf)?))
    }
}

/// Opens a unidirectional stream on `conn`, writes a single frame and
/// finishes the stream. Used for direct peer-to-peer replies.
pub async fn send_once(conn: &quinn::Connection, body: &[u8]) -> Result<(), NetError> {
    let mut stream = FrameSendStream::new(conn.open_uni().await?, None);
    stream.send_raw(body).await?;
    stream.finish().await
}
