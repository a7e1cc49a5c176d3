//! Socket plumbing: encode/decode a `wire` message and carry it over a
//! `UnixSeqpacket`, with fds riding along as ancillary data. Lifted directly
//! from `peimage-service`'s request/response exchange — same fixed-size
//! scratch buffer, same `bincode::encode_into_slice`/`decode_from_slice`
//! pair, same `AncillaryMessageWriter`/`OwnedAncillaryMessage` dance.

use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;

use tokio_seqpacket::ancillary::{AncillaryMessageWriter, OwnedAncillaryMessage};
use tokio_seqpacket::{UnixSeqpacket, UnixSeqpacketListener};

const MESSAGE_BUF: usize = 4096;
const ANCILLARY_BUF: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Io(#[from] std::io::Error),
    Encode(#[from] bincode::error::EncodeError),
    Decode(#[from] bincode::error::DecodeError),
    MessageTooLarge,
    PeerClosed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub struct Listener {
    inner: UnixSeqpacketListener,
}

impl Listener {
    pub fn bind(path: impl AsRef<Path>, backlog: i32) -> Result<Self, Error> {
        Ok(Self {
            inner: UnixSeqpacketListener::bind_with_backlog(path, backlog)?,
        })
    }

    pub async fn accept(&self) -> Result<Connection, Error> {
        Ok(Connection {
            socket: self.inner.accept().await?,
        })
    }
}

pub struct Connection {
    socket: UnixSeqpacket,
}

impl Connection {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, Error> {
        Ok(Self {
            socket: UnixSeqpacket::connect(path).await?,
        })
    }

    /// Sends `msg` with no ancillary fds.
    pub async fn send<M: bincode::Encode>(&self, msg: &M) -> Result<(), Error> {
        self.send_with_fds(msg, &[]).await
    }

    pub async fn send_with_fds<M: bincode::Encode>(
        &self,
        msg: &M,
        fds: &[impl AsFd],
    ) -> Result<(), Error> {
        let mut buf = [0u8; MESSAGE_BUF];
        let n = bincode::encode_into_slice(msg, &mut buf, bincode::config::standard())
            .map_err(|_| Error::MessageTooLarge)?;

        if fds.is_empty() {
            self.socket.send(&buf[..n]).await?;
            return Ok(());
        }

        let mut ancillary_buf = [0u8; ANCILLARY_BUF];
        let mut ancillary = AncillaryMessageWriter::new(&mut ancillary_buf);
        ancillary.add_fds(fds)?;
        self.socket
            .send_vectored_with_ancillary(&[std::io::IoSlice::new(&buf[..n])], &mut ancillary)
            .await?;
        Ok(())
    }

    /// Receives one message plus whatever fds rode along with it.
    pub async fn recv<M: bincode::Decode<()>>(&self) -> Result<(M, Vec<OwnedFd>), Error> {
        let mut buf = [0u8; MESSAGE_BUF];
        let mut ancillary_buf = [0u8; ANCILLARY_BUF];
        let mut bufs = [std::io::IoSliceMut::new(&mut buf)];
        let (n, ancillary) = self
            .socket
            .recv_vectored_with_ancillary(&mut bufs, &mut ancillary_buf)
            .await?;
        if n == 0 {
            return Err(Error::PeerClosed);
        }

        let mut fds = Vec::new();
        for message in ancillary.into_messages() {
            if let OwnedAncillaryMessage::FileDescriptors(batch) = message {
                fds.extend(batch);
            }
        }

        let (msg, _) = bincode::decode_from_slice(&buf[..n], bincode::config::standard())?;
        Ok((msg, fds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ClientToServer, ServerToClient};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique_socket_path() -> std::path::PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("client-rpc-test-{}-{n}.sock", std::process::id()))
    }

    #[tokio::test]
    async fn round_trips_a_message_with_no_fds() {
        let path = unique_socket_path();
        let listener = Listener::bind(&path, 4).unwrap();
        let client = Connection::connect(&path).await.unwrap();
        let server = listener.accept().await.unwrap();

        client
            .send(&ClientToServer::NodeStateChange {
                state: crate::wire::WireNodeState::Ready,
            })
            .await
            .unwrap();
        let (msg, fds) = server.recv::<ClientToServer>().await.unwrap();
        assert!(fds.is_empty());
        assert!(matches!(
            msg,
            ClientToServer::NodeStateChange { state: crate::wire::WireNodeState::Ready }
        ));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn round_trips_a_message_with_an_fd() {
        let path = unique_socket_path();
        let listener = Listener::bind(&path, 4).unwrap();
        let client = Connection::connect(&path).await.unwrap();
        let server = listener.accept().await.unwrap();

        let memfd = rustix::fs::memfd_create("test", rustix::fs::MemfdFlags::empty()).unwrap();
        server
            .send_with_fds(&ServerToClient::Transport { offset: 0, size: 4096 }, &[&memfd])
            .await
            .unwrap();
        let (msg, fds) = client.recv::<ServerToClient>().await.unwrap();
        assert!(matches!(msg, ServerToClient::Transport { offset: 0, size: 4096 }));
        assert_eq!(fds.len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn peer_close_surfaces_as_peer_closed() {
        let path = unique_socket_path();
        let listener = Listener::bind(&path, 4).unwrap();
        let client = Connection::connect(&path).await.unwrap();
        let server = listener.accept().await.unwrap();
        drop(client);

        let err = server.recv::<ClientToServer>().await.unwrap_err();
        assert!(matches!(err, Error::PeerClosed) || matches!(err, Error::Io(_)));

        let _ = std::fs::remove_file(&path);
    }
}
