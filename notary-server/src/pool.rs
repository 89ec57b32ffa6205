//! Bank of pre-garbled circuits.
//!
//! A background worker keeps a few garblings of every protocol circuit
//! ready so that `init` never waits on garbling. Truth tables are written
//! to disk at garbling time and streamed to the client from the file,
//! never held in memory. A blob is exclusively owned by the session that
//! drew it, from the draw until the session is destroyed.

use notary_core::block::Block;
use notary_core::circuit::CircuitMeta;
use notary_core::garble::{garble, gates_to_blob};
use notary_core::utils::bits_to_bytes;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error};

/// How many garblings of each circuit the worker keeps ready. Circuit 6 is
/// drawn `c6_count` times per session, so its slot runs deeper.
const DEPTH: usize = 3;
const DEPTH_C6: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("garbling failed: {0}")]
    Garble(#[from] notary_core::garble::GarbleError),
}

/// One pre-garbled circuit: the input label pairs, the truth-table file and
/// the packed output decoding bits.
#[derive(Debug)]
pub struct PoolBlob {
    pub input_labels: Vec<[Block; 2]>,
    pub tt_path: PathBuf,
    pub decoding: Vec<u8>,
}

pub struct GarbledPool {
    circuits: Vec<Arc<CircuitMeta>>,
    slots: Vec<Mutex<VecDeque<PoolBlob>>>,
    refill: Notify,
    dir: PathBuf,
}

impl GarbledPool {
    /// Creates the pool and starts the refill worker. In no-sandbox mode
    /// the worker refills at a lower rate.
    pub fn new(
        circuits: Vec<Arc<CircuitMeta>>,
        dir: PathBuf,
        no_sandbox: bool,
    ) -> Result<Arc<Self>, PoolError> {
        std::fs::create_dir_all(&dir)?;
        let slots = circuits.iter().map(|_| Mutex::new(VecDeque::new())).collect();
        let pool = Arc::new(Self {
            circuits,
            slots,
            refill: Notify::new(),
            dir,
        });
        let worker = pool.clone();
        tokio::spawn(async move { worker.refill_loop(no_sandbox).await });
        Ok(pool)
    }

    pub fn circuits(&self) -> &[Arc<CircuitMeta>] {
        &self.circuits
    }

    /// Draws one garbling for each of the circuits 1..=5 and 7, and
    /// `c6_count` garblings of circuit 6. Blocks until the worker has
    /// produced enough. The result is indexed by circuit number minus one.
    pub async fn get_blobs(&self, c6_count: usize) -> Vec<Vec<PoolBlob>> {
        let mut out: Vec<Vec<PoolBlob>> = (0..self.circuits.len()).map(|_| Vec::new()).collect();
        for (i, slot) in self.slots.iter().enumerate() {
            let needed = if self.circuits[i].spec.id == 6 { c6_count } else { 1 };
            while out[i].len() < needed {
                {
                    let mut queue = slot.lock().await;
                    while out[i].len() < needed {
                        match queue.pop_front() {
                            Some(blob) => out[i].push(blob),
                            None => break,
                        }
                    }
                }
                if out[i].len() < needed {
                    // bounded wait so a wakeup lost to the check-then-await
                    // gap only costs one tick
                    let _ = tokio::time::timeout(
                        Duration::from_millis(200),
                        self.refill.notified(),
                    )
                    .await;
                }
            }
        }
        out
    }

    async fn refill_loop(self: Arc<Self>, no_sandbox: bool) {
        let pause = if no_sandbox {
            Duration::from_millis(500)
        } else {
            Duration::from_millis(50)
        };
        loop {
            let mut produced = false;
            for (i, slot) in self.slots.iter().enumerate() {
                let target = if self.circuits[i].spec.id == 6 { DEPTH_C6 } else { DEPTH };
                let len = slot.lock().await.len();
                if len >= target {
                    continue;
                }
                match self.garble_one(i).await {
                    Ok(blob) => {
                        slot.lock().await.push_back(blob);
                        self.refill.notify_waiters();
                        produced = true;
                    }
                    Err(e) => error!("pool garbling error: {e}"),
                }
            }
            if !produced {
                tokio::time::sleep(pause).await;
            }
        }
    }

    async fn garble_one(&self, index: usize) -> Result<PoolBlob, PoolError> {
        let meta = self.circuits[index].clone();
        let dir = self.dir.clone();
        let blob = tokio::task::spawn_blocking(move || -> Result<PoolBlob, PoolError> {
            let garbled = garble(&mut thread_rng(), &meta.circuit)?;
            let name: String = thread_rng()
                .sample_iter(&Alphanumeric)
                .take(12)
                .map(char::from)
                .collect();
            let tt_path = dir.join(format!("c{}-{}.tt", meta.spec.id, name));
            std::fs::write(&tt_path, gates_to_blob(&garbled.encrypted_gates))?;
            Ok(PoolBlob {
                input_labels: garbled.input_labels,
                tt_path,
                decoding: bits_to_bytes(&garbled.decoding),
            })
        })
        .await
        .expect("pool garbling task panicked")?;
        debug!(circuit = self.circuits[index].spec.id, "garbled one circuit");
        Ok(blob)
    }
}
