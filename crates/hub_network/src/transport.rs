//! TCP transport: binding, dialing and the hello handshake.
//!
//! Provides the low-level plumbing the connection manager builds on. Every
//! connection is a [`Framed`] TCP stream using [`HubCodec`]. Right after the
//! socket opens, both ends send a Control frame whose first entry names
//! themselves; the connection is bound to the remote PeerId only once that
//! hello arrives.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::trace;

use crate::codec::{CodecError, Frame, HubCodec, PeerEntry};
use crate::error::HubError;
use crate::identity::PeerId;

/// A framed TCP stream carrying hub frames.
pub type FramedStream = Framed<TcpStream, HubCodec>;

/// A connection whose handshake has completed.
pub struct Established {
    pub framed: FramedStream,
    /// The remote's self entry, address normalized against `remote_addr`.
    pub remote: PeerEntry,
    /// The rest of the remote's hello.
    pub known_peers: Vec<PeerEntry>,
    /// Socket address observed for the remote end.
    pub remote_addr: SocketAddr,
    /// Whether this side dialed.
    pub outbound: bool,
}

/// Bind the hub listener.
pub async fn bind(addr: &str) -> Result<TcpListener, HubError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| HubError::BindError {
            addr: addr.to_string(),
            reason: e.to_string(),
        })
}

/// Open a TCP connection with a timeout.
pub async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream, HubError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(HubError::ConnectionFailed(format!("dial {addr}: {e}"))),
        Err(_) => Err(HubError::ConnectionFailed(format!(
            "dial {addr} timed out after {timeout:?}"
        ))),
    }
}

/// Exchange hellos over a fresh stream.
///
/// When `expected` is set the remote must present exactly that key, which
/// re-validates identity on every reconnect.
pub async fn handshake(
    stream: TcpStream,
    codec: HubCodec,
    hello: Frame,
    expected: Option<&PeerId>,
    timeout: Duration,
    outbound: bool,
) -> Result<Established, HubError> {
    let remote_addr = stream.peer_addr()?;
    let mut framed = Framed::new(stream, codec);
    framed.send(hello).await.map_err(link_error)?;

    let first = match tokio::time::timeout(timeout, framed.next()).await {
        Err(_) => {
            return Err(HubError::ConnectionFailed(format!(
                "no hello from {remote_addr} within {timeout:?}"
            )));
        }
        Ok(None) => {
            return Err(HubError::ConnectionFailed(format!(
                "{remote_addr} closed during handshake"
            )));
        }
        Ok(Some(frame)) => frame.map_err(link_error)?,
    };

    let Frame::Control(mut entries) = first else {
        return Err(HubError::ConnectionFailed(format!(
            "{remote_addr} sent a payload before its hello"
        )));
    };
    if entries.is_empty() {
        return Err(HubError::ConnectionFailed(format!(
            "empty hello from {remote_addr}"
        )));
    }

    let mut remote = entries.remove(0);
    if let Some(expected) = expected {
        if remote.peer_id != *expected {
            return Err(HubError::ConnectionFailed(format!(
                "{remote_addr} presented {} instead of {expected}",
                remote.peer_id
            )));
        }
    }
    remote.address = normalize_advertised(&remote.address, remote_addr);
    trace!(peer = %remote.peer_id, addr = %remote_addr, "hello received");

    Ok(Established {
        framed,
        remote,
        known_peers: entries,
        remote_addr,
        outbound,
    })
}

/// Replace an unspecified advertised host (`0.0.0.0`, `[::]`) with the IP we
/// actually see the peer connecting from.
pub fn normalize_advertised(advertised: &str, observed: SocketAddr) -> String {
    match advertised.parse::<SocketAddr>() {
        Ok(addr) if addr.ip().is_unspecified() => {
            SocketAddr::new(observed.ip(), addr.port()).to_string()
        }
        _ => advertised.to_string(),
    }
}

/// Map a codec error seen on a live link: socket failures are connection
/// failures, anything else is a malformed frame from the peer.
pub fn link_error(e: CodecError) -> HubError {
    match e {
        CodecError::Io(io) => HubError::ConnectionFailed(io.to_string()),
        other => HubError::MalformedFrame(other),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn peer(byte: u8) -> PeerId {
        PeerId::from_bytes(vec![byte; 32]).unwrap()
    }

    fn hello(byte: u8) -> Frame {
        Frame::Control(vec![
            PeerEntry::new(peer(byte), "0.0.0.0:41011"),
            PeerEntry::new(peer(99), "10.1.1.1:5"),
        ])
    }

    #[test]
    fn test_normalize_advertised() {
        let observed: SocketAddr = "192.168.1.7:55555".parse().unwrap();
        assert_eq!(normalize_advertised("0.0.0.0:41011", observed), "192.168.1.7:41011");
        assert_eq!(normalize_advertised("10.0.0.1:41011", observed), "10.0.0.1:41011");
        assert_eq!(normalize_advertised("node.local:1", observed), "node.local:1");
        assert_eq!(normalize_advertised("", observed), "");
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let first = bind("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap().to_string();
        let err = bind(&addr).await.unwrap_err();
        assert!(matches!(err, HubError::BindError { .. }));
    }

    #[tokio::test]
    async fn test_bind_invalid_address() {
        assert!(matches!(
            bind("not an address").await,
            Err(HubError::BindError { .. })
        ));
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = dial(&addr, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, HubError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_handshake_both_directions() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let codec = HubCodec::new(1024);

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handshake(stream, codec, hello(2), None, Duration::from_secs(2), false).await
        });

        let stream = dial(&addr, Duration::from_secs(2)).await.unwrap();
        let client = handshake(stream, codec, hello(1), Some(&peer(2)), Duration::from_secs(2), true)
            .await
            .unwrap();
        let server = server.await.unwrap().unwrap();

        assert_eq!(client.remote.peer_id, peer(2));
        assert!(client.outbound);
        assert_eq!(client.remote.address, "127.0.0.1:41011");
        assert_eq!(server.remote.peer_id, peer(1));
        assert!(!server.outbound);
        assert_eq!(server.known_peers, vec![PeerEntry::new(peer(99), "10.1.1.1:5")]);
    }

    #[tokio::test]
    async fn test_handshake_identity_mismatch() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let codec = HubCodec::new(1024);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = handshake(stream, codec, hello(3), None, Duration::from_secs(2), false).await;
        });

        let stream = dial(&addr, Duration::from_secs(2)).await.unwrap();
        let err = handshake(stream, codec, hello(1), Some(&peer(2)), Duration::from_secs(2), true)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HubError::ConnectionFailed(msg) if msg.contains("instead of")));
    }

    #[tokio::test]
    async fn test_handshake_rejects_payload_first() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let codec = HubCodec::new(1024);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, codec);
            let _ = framed.send(Frame::Payload(Bytes::from_static(b"hi"))).await;
            let _ = framed.next().await;
        });

        let stream = dial(&addr, Duration::from_secs(2)).await.unwrap();
        let result = handshake(stream, codec, hello(1), None, Duration::from_secs(2), true).await;
        assert!(matches!(result, Err(HubError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_handshake_times_out() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let stream = dial(&addr, Duration::from_secs(2)).await.unwrap();
        let result = handshake(
            stream,
            HubCodec::new(1024),
            hello(1),
            None,
            Duration::from_millis(100),
            true,
        )
        .await;
        assert!(matches!(result, Err(HubError::ConnectionFailed(msg)) if msg.contains("no hello")));
    }
}
