//! Incremental record framing for the reliable stream.
//!
//! Records on the stream are self-delimiting: a one-byte type tag followed
//! by fixed or length-prefixed fields (see [`crate::protocol`]). There is no
//! outer length prefix, so the reader accumulates bytes in a
//! [`RecordDecoder`] and pulls complete records off the front as soon as
//! they are available.

use tokio::io::AsyncReadExt;

use crate::protocol::{ClientCommand, ProtocolError, ServerEvent};

/// Errors that can occur while reading records from a stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The stream carried bytes that do not form a valid record.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A self-delimiting record that can be peeled off the front of a buffer.
pub trait Record: Sized {
    /// Decode one record, or `Ok(None)` if `buf` holds only part of one.
    fn decode_prefix(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError>;
}

impl Record for ServerEvent {
    fn decode_prefix(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        ServerEvent::decode(buf)
    }
}

impl Record for ClientCommand {
    fn decode_prefix(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        ClientCommand::decode(buf)
    }
}

/// Accumulates stream bytes and yields complete records.
pub struct RecordDecoder<T> {
    buf: Vec<u8>,
    _record: std::marker::PhantomData<fn() -> T>,
}

impl<T: Record> Default for RecordDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record> RecordDecoder<T> {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            _record: std::marker::PhantomData,
        }
    }

    /// Append bytes received from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed by a record.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete record, if any.
    ///
    /// An error means the stream is corrupt; the buffered bytes are
    /// discarded because there is no way to find the next record boundary.
    pub fn next_record(&mut self) -> Result<Option<T>, ProtocolError> {
        match T::decode_prefix(&self.buf) {
            Ok(Some((record, used))) => {
                self.buf.drain(..used);
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.buf.clear();
                Err(e)
            }
        }
    }
}

/// Read records from `reader` until it closes, handing each to `on_record`.
///
/// Returns [`FrameError::ConnectionClosed`] on a clean end of stream, or the
/// first I/O or protocol error.
pub async fn read_records<T, R, F>(reader: &mut R, mut on_record: F) -> Result<(), FrameError>
where
    T: Record,
    R: AsyncReadExt + Unpin,
    F: FnMut(T),
{
    let mut decoder = RecordDecoder::<T>::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(FrameError::ConnectionClosed);
        }
        decoder.push(&chunk[..n]);
        while let Some(record) = decoder.next_record()? {
            on_record(record);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Writer;
    use tokio::io::AsyncWriteExt;

    fn encode_all(events: &[ServerEvent]) -> Vec<u8> {
        let mut w = Writer::new();
        for ev in events {
            ev.encode(&mut w).unwrap();
        }
        w.into_vec()
    }

    #[test]
    fn test_decoder_waits_for_complete_record() {
        let bytes = encode_all(&[ServerEvent::PlayerJoined {
            user_id: 3,
            room: "hall".into(),
        }]);
        let mut dec = RecordDecoder::<ServerEvent>::new();
        dec.push(&bytes[..4]);
        assert_eq!(dec.next_record().unwrap(), None);
        dec.push(&bytes[4..]);
        assert!(dec.next_record().unwrap().is_some());
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn test_decoder_clears_on_corrupt_stream() {
        let mut dec = RecordDecoder::<ServerEvent>::new();
        dec.push(&[200, 1, 2, 3]);
        assert!(dec.next_record().is_err());
        assert_eq!(dec.buffered(), 0);
    }

    #[tokio::test]
    async fn test_read_records_across_split_writes() {
        let events = vec![
            ServerEvent::LoggedIn { user_id: 1 },
            ServerEvent::DataMessage {
                sender: 2,
                payload: vec![9; 10_000],
            },
            ServerEvent::YouLeft { room: "r".into() },
        ];
        let bytes = encode_all(&events);
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            for piece in bytes.chunks(7) {
                server.write_all(piece).await.unwrap();
            }
        });

        let mut received = Vec::new();
        let result = read_records::<ServerEvent, _, _>(&mut client, |ev| received.push(ev)).await;
        writer.await.unwrap();

        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
        assert_eq!(received, events);
    }

    #[tokio::test]
    async fn test_read_records_reports_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(&[77]).await.unwrap();
        let result = read_records::<ServerEvent, _, _>(&mut client, |_| {}).await;
        assert!(matches!(result, Err(FrameError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_client_commands_frame_too() {
        let cmds = vec![
            ClientCommand::GetRooms,
            ClientCommand::JoinRoom { room: "x".into() },
        ];
        let mut bytes = Vec::new();
        for c in &cmds {
            bytes.extend(c.to_bytes().unwrap());
        }
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(&bytes).await.unwrap();
        drop(server);

        let mut received = Vec::new();
        let _ = read_records::<ClientCommand, _, _>(&mut client, |c| received.push(c)).await;
        assert_eq!(received, cmds);
    }
}
