//! Coordinator over the external Softspoken-OT endpoint.
//!
//! The OT primitive itself runs in the client's native library; this side
//! speaks a small length-delimited framing on a dedicated port. One peer at
//! a time: the session manager grants exclusive ownership of the
//! coordinator to a single session, from `init` until `commitHash` or
//! destroy.
//!
//! Framing: a request frame is `0x01 ‖ count_be_u32 ‖ packed_choice_bits`
//! and is answered by one frame carrying the selected messages; a respond
//! frame is `0x02 ‖ payload` (both messages per position, back to back) and
//! has no answer.

use futures::{SinkExt, StreamExt};
use notary_core::utils::boolvec_to_u8vec;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum OtError {
    #[error("busy")]
    Busy,
    #[error("not connected")]
    NotConnected,
    #[error("OT peer closed the connection")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct OtManager {
    listener: TcpListener,
    conn: Mutex<Option<Framed<TcpStream, LengthDelimitedCodec>>>,
    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
}

impl OtManager {
    /// Binds the OT port. Failing to bind is fatal at startup.
    pub async fn bind(host: &str, port: u16) -> Result<Self, OtError> {
        let listener = TcpListener::bind((host, port)).await?;
        let (connected_tx, connected_rx) = watch::channel(false);
        Ok(Self {
            listener,
            conn: Mutex::new(None),
            connected_tx,
            connected_rx,
        })
    }

    /// Local address of the listener, useful when bound to port 0.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, OtError> {
        Ok(self.listener.local_addr()?)
    }

    /// Blocks until one peer connects. Only one connection at a time.
    pub async fn listen(&self) -> Result<(), OtError> {
        if self.is_connected() {
            return Err(OtError::Busy);
        }
        let (stream, addr) = self.listener.accept().await?;
        debug!(%addr, "OT peer connected");
        let mut codec = LengthDelimitedCodec::new();
        codec.set_max_frame_length(MAX_FRAME_LEN);
        *self.conn.lock().await = Some(Framed::new(stream, codec));
        let _ = self.connected_tx.send(true);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Waits until a peer is connected.
    async fn wait_connected(&self) -> Result<(), OtError> {
        let mut rx = self.connected_rx.clone();
        while !*rx.borrow() {
            rx.changed().await.map_err(|_| OtError::NotConnected)?;
        }
        Ok(())
    }

    /// Receives the messages selected by `choice_bits` (packed
    /// little-bit-endian on the wire).
    pub async fn request_data(&self, choice_bits: &[bool]) -> Result<Vec<u8>, OtError> {
        self.wait_connected().await?;
        let mut guard = self.conn.lock().await;
        let framed = guard.as_mut().ok_or(OtError::NotConnected)?;

        debug!(count = choice_bits.len(), "OT requesting blocks");
        let mut frame = Vec::with_capacity(5 + choice_bits.len() / 8 + 1);
        frame.push(0x01);
        frame.extend_from_slice(&(choice_bits.len() as u32).to_be_bytes());
        frame.extend_from_slice(&boolvec_to_u8vec(choice_bits));
        framed.send(frame.into()).await?;

        let reply = framed.next().await.ok_or(OtError::Closed)??;
        debug!(bytes = reply.len(), "OT request done");
        Ok(reply.to_vec())
    }

    /// Sends both messages for every position.
    pub async fn respond_with_data(&self, data: Vec<u8>) -> Result<(), OtError> {
        self.wait_connected().await?;
        let mut guard = self.conn.lock().await;
        let framed = guard.as_mut().ok_or(OtError::NotConnected)?;

        debug!(bytes = data.len(), "OT responding");
        let mut frame = Vec::with_capacity(1 + data.len());
        frame.push(0x02);
        frame.extend_from_slice(&data);
        framed.send(frame.into()).await?;
        Ok(())
    }

    pub async fn disconnect(&self) {
        *self.conn.lock().await = None;
        let _ = self.connected_tx.send(false);
    }

    /// Shuts the coordinator down at process exit.
    pub async fn finish(&self) {
        self.disconnect().await;
    }
}
