//! Unreliable datagram channel.
//!
//! The server can only address datagrams to a client once it knows the
//! client's user id, so the channel starts after login: the client sends a
//! hello datagram (`[0][user id]`) every `hello_interval` until any reply
//! arrives, then switches to a receive loop.
//!
//! ```text
//! outbound  [send type][user id BE][payload]
//! group     [5][user id BE][u8 len][group][payload]
//! inbound   [0]                          hello acknowledged
//!           [3][sender BE][payload]      relayed data
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::codec::{Reader, Writer};
use crate::inbox::InboxSender;
use crate::protocol::{ClientCommand, ProtocolError, SendKind, ServerEvent, UserId};

/// Largest datagram the receive loop accepts.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// A decoded inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramIn {
    /// The server acknowledged our hello.
    HelloAck,
    /// Payload relayed from another room member.
    Data { sender: UserId, payload: Vec<u8> },
}

/// Write the hello datagram for `user_id` into `w`.
pub fn encode_hello(w: &mut Writer, user_id: UserId) {
    w.write_u8(0);
    w.write_i32_be(user_id);
}

/// Write a room broadcast datagram into `w`.
pub fn encode_datagram(w: &mut Writer, kind: SendKind, user_id: UserId, payload: &[u8]) {
    w.write_u8(kind.tag());
    w.write_i32_be(user_id);
    w.write_bytes(payload);
}

/// Write a group datagram into `w`.
pub fn encode_group_datagram(
    w: &mut Writer,
    user_id: UserId,
    group: &str,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let len = u8::try_from(group.len()).map_err(|_| ProtocolError::NameTooLong(group.len()))?;
    w.write_u8(ClientCommand::SEND_GROUP);
    w.write_i32_be(user_id);
    w.write_u8(len);
    w.write_bytes(group.as_bytes());
    w.write_bytes(payload);
    Ok(())
}

/// Decode an inbound datagram.
pub fn decode_datagram(buf: &[u8]) -> Result<DatagramIn, ProtocolError> {
    let mut r = Reader::new(buf);
    match r.read_u8()? {
        ServerEvent::LOGGED_IN => Ok(DatagramIn::HelloAck),
        ServerEvent::DATA_MESSAGE => {
            let sender = r.read_i32_be()?;
            Ok(DatagramIn::Data {
                sender,
                payload: r.read_rest().to_vec(),
            })
        }
        other => Err(ProtocolError::UnknownType(other)),
    }
}

/// Run the hello handshake and then the receive loop until `shutdown`
/// flips to `true` or the socket fails.
///
/// `ready` is set once the server has answered a hello; relayed data is
/// pushed to `inbox` as [`ServerEvent::DataMessage`].
pub async fn run_datagram_channel(
    socket: Arc<UdpSocket>,
    user_id: UserId,
    hello_interval: Duration,
    inbox: InboxSender,
    ready: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut hello = Writer::with_capacity(8);
    encode_hello(&mut hello, user_id);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut ticker = tokio::time::interval(hello_interval);

    // Handshake: resend hello until anything comes back.
    let first = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = socket.send(hello.as_slice()).await {
                    tracing::warn!("Datagram hello failed: {e}");
                    return;
                }
                tracing::debug!("Waiting for datagram response");
            }
            result = socket.recv(&mut buf) => {
                match result {
                    Ok(n) => break n,
                    Err(e) => {
                        tracing::debug!("Datagram receive error during hello: {e}");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    };

    ready.store(true, Ordering::Release);
    tracing::info!("Datagram channel ready for user {user_id}");
    handle_datagram(&buf[..first], &inbox);

    loop {
        tokio::select! {
            result = socket.recv(&mut buf) => {
                match result {
                    Ok(n) => handle_datagram(&buf[..n], &inbox),
                    // ICMP unreachable surfaces as a receive error on some
                    // platforms; the channel stays up.
                    Err(e) => tracing::debug!("Datagram receive error: {e}"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    ready.store(false, Ordering::Release);
}

fn handle_datagram(bytes: &[u8], inbox: &InboxSender) {
    match decode_datagram(bytes) {
        Ok(DatagramIn::HelloAck) => tracing::trace!("Datagram hello acknowledged"),
        Ok(DatagramIn::Data { sender, payload }) => {
            inbox.push(ServerEvent::DataMessage { sender, payload });
        }
        Err(e) => tracing::warn!("Dropping malformed datagram: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbox::Inbox;

    #[test]
    fn test_hello_layout() {
        let mut w = Writer::new();
        encode_hello(&mut w, 0x0102);
        assert_eq!(w.as_slice(), &[0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_outbound_layouts() {
        let mut w = Writer::new();
        encode_datagram(&mut w, SendKind::Others, 7, &[0xAA]);
        assert_eq!(w.as_slice(), &[3, 0, 0, 0, 7, 0xAA]);

        w.reset();
        encode_group_datagram(&mut w, 7, "g", &[0xBB]).unwrap();
        assert_eq!(w.as_slice(), &[5, 0, 0, 0, 7, 1, b'g', 0xBB]);
    }

    #[test]
    fn test_decode_inbound() {
        assert_eq!(decode_datagram(&[0]).unwrap(), DatagramIn::HelloAck);
        assert_eq!(
            decode_datagram(&[3, 0, 0, 0, 4, 1, 2]).unwrap(),
            DatagramIn::Data {
                sender: 4,
                payload: vec![1, 2]
            }
        );
        assert!(decode_datagram(&[3, 0]).is_err());
        assert!(decode_datagram(&[9]).is_err());
    }

    #[tokio::test]
    async fn test_handshake_then_receive() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server.local_addr().unwrap()).await.unwrap();

        let (tx, mut inbox) = Inbox::new(16);
        let ready = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_datagram_channel(
            Arc::new(client),
            42,
            Duration::from_millis(10),
            tx,
            Arc::clone(&ready),
            shutdown_rx,
        ));

        // Let a couple of hellos arrive before answering.
        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0, 0, 0, 0, 42]);
        server.send_to(&[0], from).await.unwrap();
        server.send_to(&[3, 0, 0, 0, 5, 0xCC], from).await.unwrap();

        let mut out = Vec::new();
        for _ in 0..100 {
            inbox.drain_into(&mut out);
            if !out.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ready.load(Ordering::Acquire));
        assert_eq!(
            out,
            vec![ServerEvent::DataMessage {
                sender: 5,
                payload: vec![0xCC]
            }]
        );

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(!ready.load(Ordering::Acquire));
    }
}
