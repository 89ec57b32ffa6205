//! Tag verification: the adapter around the external AES-GCM MPC processes
//! and the signing of verified ciphertexts.

mod mpc;
mod signing;
mod verify;

pub use signing::TagSigningManager;
pub use verify::verify_tag;

use mpc::{check_port_mpc_range, run_encrypted_iv_mpc, run_powers_of_h_mpc};
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const SYSTEM_OWNER: &str = "_SYSTEM";

#[derive(Debug, thiserror::Error)]
pub enum TagError {
    #[error("tag verification mpc is busy")]
    Busy,
    #[error("tag verification MPC cannot be started due to misconfiguration")]
    Misconfigured,
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("internal error in tag verification")]
    Internal,
}

struct TvState {
    busy: bool,
    owner: String,
    started_at: Option<Instant>,
    iv_rx: Option<mpsc::Receiver<String>>,
    poh_rx: Option<mpsc::Receiver<String>>,
    iv_mask: Option<String>,
    poh_mask: Option<String>,
}

/// The outcome of one poll.
pub struct PollStatus {
    pub busy: bool,
    pub tag_mask: String,
    pub poh_mask: String,
}

/// Single owner across the whole server: no two sessions may run the
/// external MPC concurrently. Results arrive on two single-capacity
/// channels and are drained together on the completing poll.
pub struct TagVerificationManager {
    circuit_dir: PathBuf,
    port_iv: u16,
    port_poh: u16,
    state: Mutex<TvState>,
}

impl TagVerificationManager {
    pub fn new(circuit_dir: PathBuf, port_iv: u16, port_poh: u16) -> Self {
        Self {
            circuit_dir,
            port_iv,
            port_poh,
            state: Mutex::new(TvState {
                busy: false,
                owner: String::new(),
                started_at: None,
                iv_rx: None,
                poh_rx: None,
                iv_mask: None,
                poh_mask: None,
            }),
        }
    }

    /// Starts the IV and Powers-of-H MPC runs for `session_id`.
    pub async fn prep(
        &self,
        session_id: &str,
        server_iv_share: &[u8],
        server_write_key_share: &[u8],
        client_iv_share: &[u8],
        record_iv: &[u8],
    ) -> Result<(), TagError> {
        let mut state = self.state.lock().await;
        if state.busy {
            return Err(TagError::Busy);
        }

        if !check_port_mpc_range(self.port_iv).await || !check_port_mpc_range(self.port_poh).await
        {
            if state.owner.is_empty() {
                // a port is occupied and the manager is not running an MPC:
                // the system holds the ports
                state.owner = SYSTEM_OWNER.to_string();
                warn!(
                    "TagVerificationManager: one of the MPC ports is occupied by the system, \
                     please reconfigure the MPC ports."
                );
            }
            state.busy = true;
            return Err(TagError::Busy);
        }

        // xor the two server-IV shares into the record IV, then append the
        // explicit record IV for the full nonce
        let record_iv_full: Vec<u8> = server_iv_share
            .iter()
            .zip(client_iv_share)
            .map(|(a, b)| a ^ b)
            .chain(record_iv.iter().copied())
            .collect();
        let mpc_iv = format!("{}00000001", hex::encode(record_iv_full));
        let key_share = hex::encode(server_write_key_share);

        let (iv_tx, iv_rx) = mpsc::channel(1);
        let (poh_tx, poh_rx) = mpsc::channel(1);

        let circuit_dir = self.circuit_dir.clone();
        let port = self.port_iv;
        let key = key_share.clone();
        tokio::spawn(async move {
            let mask = run_encrypted_iv_mpc(port, &circuit_dir, &key, &mpc_iv)
                .await
                .unwrap_or_else(|e| {
                    warn!("MPC IV: {e}");
                    String::new()
                });
            let _ = iv_tx.send(mask).await;
        });

        let circuit_dir = self.circuit_dir.clone();
        let port = self.port_poh;
        tokio::spawn(async move {
            let mask = run_powers_of_h_mpc(port, &circuit_dir, &key_share)
                .await
                .unwrap_or_else(|e| {
                    warn!("MPC PoH: {e}");
                    String::new()
                });
            let _ = poh_tx.send(mask).await;
        });

        state.busy = true;
        state.owner = session_id.to_string();
        state.started_at = Some(Instant::now());
        state.iv_rx = Some(iv_rx);
        state.poh_rx = Some(poh_rx);
        state.iv_mask = None;
        state.poh_mask = None;

        Ok(())
    }

    /// Polls the MPC status. Only the owner sees results; on completion
    /// both channels are drained and ownership resets.
    pub async fn poll(&self, session_id: &str) -> Result<PollStatus, TagError> {
        let mut state = self.state.lock().await;

        if state.owner == SYSTEM_OWNER {
            return Err(TagError::Misconfigured);
        }
        if state.owner != session_id {
            return Ok(PollStatus {
                busy: state.busy,
                tag_mask: String::new(),
                poh_mask: String::new(),
            });
        }

        if state.iv_mask.is_none() {
            if let Some(rx) = state.iv_rx.as_mut() {
                if let Ok(mask) = rx.try_recv() {
                    state.iv_mask = Some(mask);
                }
            }
        }
        if state.poh_mask.is_none() {
            if let Some(rx) = state.poh_rx.as_mut() {
                if let Ok(mask) = rx.try_recv() {
                    state.poh_mask = Some(mask);
                }
            }
        }

        if state.iv_mask.is_none() || state.poh_mask.is_none() {
            return Ok(PollStatus {
                busy: true,
                tag_mask: String::new(),
                poh_mask: String::new(),
            });
        }

        let tag_mask = state.iv_mask.take().unwrap();
        let poh_mask = state.poh_mask.take().unwrap();
        state.busy = false;
        state.owner = String::new();
        state.iv_rx = None;
        state.poh_rx = None;
        if let Some(started) = state.started_at.take() {
            info!(
                "Tag verification MPC result obtained after {:?}",
                started.elapsed()
            );
        }

        Ok(PollStatus {
            busy: false,
            tag_mask,
            poh_mask,
        })
    }
}
