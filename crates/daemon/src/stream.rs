// SPDX-License-Identifier: MIT

//! Framed message stream (spec.md §4.C). Wraps one accepted SOCK_SEQPACKET
//! connection: peer-credential capture, timeout'd frame read/write, and
//! idempotent half-close shutdown.

use std::os::fd::AsRawFd;
use std::time::Duration;

use thiserror::Error;
use tokio_seqpacket::UnixSeqpacket;
use traffic_limitd_wire::{decode, encode, DecodeError, Message};

/// Credentials captured once at `init` via `SO_PEERCRED` (spec.md §3 "Framed
/// stream" attributes).
#[derive(Debug, Clone, Copy)]
pub struct PeerCredentials {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("peer closed the connection")]
    Closed,
    #[error("read/write timed out")]
    TimedOut,
    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Largest frame the daemon will ever read: a `REQ` is the biggest message
/// type it receives.
const MAX_FRAME: usize = traffic_limitd_wire::HEADER_LEN + 256;

/// One accepted connection. Owns the underlying socket; at most one read and
/// one write may be in flight at a time by construction (each call takes
/// `&mut self`), matching spec.md §4.C's state-enum invariant.
pub struct FramedStream {
    socket: UnixSeqpacket,
    peer: PeerCredentials,
    ended: bool,
}

impl FramedStream {
    /// Captures peer credentials and adopts ownership of `socket` (spec.md
    /// §4.C `init`).
    pub fn new(socket: UnixSeqpacket) -> Result<Self, StreamError> {
        let peer = peer_credentials(&socket)?;
        Ok(Self { socket, peer, ended: false })
    }

    pub fn peer(&self) -> PeerCredentials {
        self.peer
    }

    /// Receive exactly one frame (each SEQPACKET `recv` delivers one),
    /// decoded into a `Message`. `None` on a zero-length receive (peer
    /// half-closed the connection).
    pub async fn recv(&mut self, timeout: Duration) -> Result<Option<Message>, StreamError> {
        let mut buf = [0u8; MAX_FRAME];
        let n = tokio::time::timeout(timeout, self.socket.recv(&mut buf))
            .await
            .map_err(|_| StreamError::TimedOut)??;
        if n == 0 {
            self.ended = true;
            return Ok(None);
        }
        Ok(Some(decode(&buf[..n])?))
    }

    /// Send one message as a single frame (spec.md §4.C `write`).
    pub async fn send(&mut self, msg: &Message, timeout: Duration) -> Result<(), StreamError> {
        let frame = encode(msg);
        tokio::time::timeout(timeout, self.socket.send(&frame)).await.map_err(|_| StreamError::TimedOut)??;
        Ok(())
    }

    /// Drain any remaining receive frames, signal end-of-stream, and
    /// transition to `ENDED` (spec.md §4.C `shutdown`). Idempotent (spec.md
    /// §8 "`shutdown_stream()` is idempotent").
    pub async fn shutdown(&mut self) {
        if self.ended {
            return;
        }
        loop {
            let mut scratch = [0u8; MAX_FRAME];
            match tokio::time::timeout(Duration::from_millis(0), self.socket.recv(&mut scratch)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => break,
            }
        }
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
        self.ended = true;
    }
}

fn peer_credentials(socket: &UnixSeqpacket) -> Result<PeerCredentials, StreamError> {
    let fd = socket.as_raw_fd();
    let creds = nix::sys::socket::getsockopt(&unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, nix::sys::socket::sockopt::PeerCredentials)
        .map_err(|e| StreamError::Io(std::io::Error::from(e)))?;
    Ok(PeerCredentials { pid: creds.pid() as u32, uid: creds.uid(), gid: creds.gid() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (a, _b) = UnixSeqpacket::pair().unwrap();
        let mut stream = FramedStream::new(a).unwrap();
        stream.shutdown().await;
        stream.shutdown().await; // second call does nothing observable
    }

    #[tokio::test]
    async fn round_trips_a_proceed_frame() {
        let (a, b) = UnixSeqpacket::pair().unwrap();
        let mut server = FramedStream::new(a).unwrap();
        let mut client = FramedStream::new(b).unwrap();

        client.send(&Message::Proceed, Duration::from_millis(100)).await.unwrap();
        let received = server.recv(Duration::from_millis(100)).await.unwrap();
        assert_eq!(received, Some(Message::Proceed));
    }

    #[tokio::test]
    async fn recv_times_out_when_no_frame_arrives() {
        let (a, _b) = UnixSeqpacket::pair().unwrap();
        let mut server = FramedStream::new(a).unwrap();
        let result = server.recv(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(StreamError::TimedOut)));
    }
}
