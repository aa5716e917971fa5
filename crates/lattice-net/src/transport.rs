//! TCP byte transport.
//!
//! A transport starts in raw mode for the fixed-width handshake fields,
//! then carries length-prefixed frames once the handshake installs an
//! encryptor. For connection loops it splits into independently owned
//! reader and writer halves.

use std::fmt;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use lattice_shared::error::WireError;

use crate::destination::Destination;
use crate::encryptor::TransportEncryptor;
use crate::framing::{read_frame, write_frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
}

pub struct TcpTransport {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    remote: SocketAddr,
    incoming: bool,
    state: TransportState,
    encryptor: Option<TransportEncryptor>,
}

impl TcpTransport {
    /// Open an outgoing transport.
    pub async fn connect(dest: &Destination) -> std::io::Result<Self> {
        debug!(dest = %dest, "Opening outgoing transport");
        let stream = TcpStream::connect(dest.socket_addr()).await?;
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader,
            writer,
            remote,
            incoming: false,
            state: TransportState::Connected,
            encryptor: None,
        })
    }

    /// Wrap an accepted incoming stream.
    pub fn from_stream(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader,
            writer,
            remote,
            incoming: true,
            state: TransportState::Connected,
            encryptor: None,
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn remote_destination(&self) -> Destination {
        Destination::from_socket_addr(self.remote)
    }

    pub fn incoming(&self) -> bool {
        self.incoming
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn install_encryptor(&mut self, encryptor: TransportEncryptor) {
        self.encryptor = Some(encryptor);
    }

    /// Write raw bytes, bypassing framing. Handshake only.
    pub async fn send_raw(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }

    /// Read exactly `len` raw bytes, bypassing framing. Handshake only.
    pub async fn recv_exact(&mut self, len: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Write a framed payload, encrypted if an encryptor is installed.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), WireError> {
        match &self.encryptor {
            Some(enc) => {
                let sealed = enc
                    .encrypt(payload)
                    .map_err(|e| WireError::Encode(e.to_string()))?;
                write_frame(&mut self.writer, &sealed).await
            }
            None => write_frame(&mut self.writer, payload).await,
        }
    }

    /// Read one framed payload, decrypted if an encryptor is installed.
    pub async fn recv_frame(&mut self) -> Result<Vec<u8>, WireError> {
        let payload = read_frame(&mut self.reader).await?;
        match &self.encryptor {
            Some(enc) => enc
                .decrypt(&payload)
                .map_err(|e| WireError::Decode(e.to_string())),
            None => Ok(payload),
        }
    }

    /// Shut down the transport. Terminal and idempotent.
    pub async fn disconnect(&mut self) {
        if self.state != TransportState::Disconnected {
            self.state = TransportState::Disconnected;
            let _ = self.writer.shutdown().await;
            debug!(transport = %self, "Transport disconnected");
        }
    }

    /// Split into reader and writer halves for the connection loops.
    /// Both halves share the installed encryptor.
    pub fn split(self) -> (TransportReader, TransportWriter) {
        (
            TransportReader {
                reader: self.reader,
                encryptor: self.encryptor.clone(),
            },
            TransportWriter {
                writer: self.writer,
                encryptor: self.encryptor,
            },
        )
    }
}

impl fmt::Display for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TCP/{}/{}",
            if self.incoming { "INCOMING" } else { "OUTGOING" },
            self.remote
        )
    }
}

pub struct TransportReader {
    reader: OwnedReadHalf,
    encryptor: Option<TransportEncryptor>,
}

impl TransportReader {
    pub async fn recv_frame(&mut self) -> Result<Vec<u8>, WireError> {
        let payload = read_frame(&mut self.reader).await?;
        match &self.encryptor {
            Some(enc) => enc
                .decrypt(&payload)
                .map_err(|e| WireError::Decode(e.to_string())),
            None => Ok(payload),
        }
    }
}

pub struct TransportWriter {
    writer: OwnedWriteHalf,
    encryptor: Option<TransportEncryptor>,
}

impl TransportWriter {
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), WireError> {
        match &self.encryptor {
            Some(enc) => {
                let sealed = enc
                    .encrypt(payload)
                    .map_err(|e| WireError::Encode(e.to_string()))?;
                write_frame(&mut self.writer, &sealed).await
            }
            None => write_frame(&mut self.writer, payload).await,
        }
    }

    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
