//! Does all communication related stuff with the relay socket. The stream
//! runs in non-blocking mode so a heartbeat-driven game loop can poll it
//! once per frame without ever stalling on the network.

use bytes::{Buf, BytesMut};
use protocol::{Frame, FrameCodec};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

/// One polled connection to the relay.
pub struct RelayConnection {
    stream: TcpStream,
    codec: FrameCodec,
    /// Bytes accepted by `send_frame` that the kernel has not taken yet.
    outgoing: BytesMut,
}

impl RelayConnection {
    /// Connects and switches the socket to non-blocking mode.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<RelayConnection, String> {
        let stream =
            TcpStream::connect(addr).map_err(|e| format!("Could not reach the relay: {}", e))?;
        stream
            .set_nonblocking(true)
            .map_err(|e| format!("Could not make the socket non-blocking: {}", e))?;
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(?err, "Could not disable Nagle on the relay socket.");
        }
        Ok(RelayConnection {
            stream,
            codec: FrameCodec::new(),
            outgoing: BytesMut::new(),
        })
    }

    /// Queues a frame and pushes as much of the backlog out as the socket
    /// accepts right now. The rest goes out on later pumps.
    pub fn send_frame(&mut self, frame: &Frame) -> Result<(), String> {
        frame.encode(&mut self.outgoing);
        self.pump_outgoing()
    }

    /// Flushes pending bytes without queueing anything new.
    pub fn pump_outgoing(&mut self) -> Result<(), String> {
        while !self.outgoing.is_empty() {
            match self.stream.write(&self.outgoing) {
                Ok(0) => return Err("Connection closed by the relay".to_string()),
                Ok(n) => self.outgoing.advance(n),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(format!("Error writing to the relay: {}", err)),
            }
        }
        Ok(())
    }

    /// Polls for the next complete frame. `Ok(None)` means nothing is
    /// there right now, an error means the connection is gone.
    pub fn try_recv_frame(&mut self) -> Result<Option<Frame>, String> {
        loop {
            if let Some(frame) = self
                .codec
                .decode_next()
                .map_err(|e| format!("Corrupt data from the relay: {}", e))?
            {
                return Ok(Some(frame));
            }

            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err("Connection closed by the relay".to_string()),
                Ok(n) => self.codec.feed(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(format!("Error reading from the relay: {}", err)),
            }
        }
    }
}
