//! The per-session cryptographic state machine.
//!
//! Every client command maps to one step with a fixed sequence number; the
//! sequence check makes replay and reordering fatal. A step that fails
//! returns an error, which the HTTP dispatcher converts into a 500 and a
//! session-destroy signal; cleanup never depends on unwinding.

pub mod garbler;

mod evaluator;

use crate::ot::{OtError, OtManager};
use crate::pool::GarbledPool;
use crate::tag::{verify_tag, TagSigningManager, TagVerificationManager};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use garbler::Garbler;
use notary_core::ghash::{finished_mac, mxtables_to_ot_payload, GhashCore, GhashError};
use notary_core::point_addition::{Paillier2Pc, PointAdditionError};
use notary_core::prf::finish_hash;
use notary_core::utils::xor_bytes;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::generic_array::GenericArray;
use p256::elliptic_curve::sec1::FromEncodedPoint;
use p256::{EncodedPoint, PublicKey};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tracing::error;

/// Commands served through the generic session dispatcher.
pub const COMMANDS: &[&str] = &[
    "init",
    "getUploadProgress",
    "step1",
    "step2",
    "step3",
    "step4",
    "c1_step1",
    "c1_step2",
    "c1_step3",
    "c1_step4",
    "c1_step5",
    "c2_step1",
    "c2_step2",
    "c2_step3",
    "c2_step4",
    "c3_step1",
    "c3_step2",
    "c4_step1",
    "c4_step2",
    "c4_step3",
    "c5_pre1",
    "c5_step1",
    "c5_step2",
    "c5_step3",
    "c6_step1",
    "c6_pre2",
    "c6_step2",
    "c7_step1",
    "c7_step2",
    "ghash_step1",
    "ghash_step2",
    "ghash_step3",
    "commitHash",
    "prepTagVerification",
    "pollTagVerification",
    "tagVerification",
];

/// Uploads larger than this are aborted.
pub const MAX_BLOB_SIZE: u32 = 300 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("message {0} received out of order")]
    OutOfOrder(u16),
    #[error("message {0} sent twice")]
    Replayed(u16),
    #[error("malformed message body")]
    BadLength,
    #[error("decryption failed")]
    Decrypt,
    #[error("invalid client public key")]
    BadClientKey,
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("commitment mismatch")]
    CommitmentMismatch,
    #[error("dual execution outputs disagree")]
    OutputMismatch,
    #[error("blob upload exceeds the size cap")]
    BlobTooLarge,
    #[error("OT response arrived from {got}, expected {expected}")]
    WrongOtSource { expected: String, got: String },
    #[error("background OT task failed")]
    OtTaskFailed,
    #[error(transparent)]
    Ot(#[from] OtError),
    #[error(transparent)]
    PointAddition(#[from] PointAdditionError),
    #[error(transparent)]
    Ghash(#[from] GhashError),
    #[error(transparent)]
    Garble(#[from] notary_core::garble::GarbleError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("signing failed")]
    Signing,
    #[error("{0}")]
    Internal(String),
}

/// The result of a background OT exchange started by a `c*_step1` step and
/// consumed by the matching step 2.
struct OtStep {
    from: String,
    data: Vec<u8>,
}

pub struct Session {
    pub sid: String,
    signing_key: SigningKey,
    ot: Arc<OtManager>,
    gp: Arc<GarbledPool>,
    tv: Arc<TagVerificationManager>,
    ts: Arc<TagSigningManager>,
    destroy_tx: mpsc::UnboundedSender<String>,
    ot_release_tx: mpsc::UnboundedSender<String>,

    /// Symmetric key decrypting requests from the client.
    client_key: Option<[u8; 16]>,
    /// Symmetric key encrypting replies to the client.
    notary_key: Option<[u8; 16]>,
    storage_dir: Option<PathBuf>,
    msgs_seen: Vec<u16>,

    g: Option<Garbler>,
    p2pc: Option<Paillier2Pc>,
    ghash: GhashCore,
    ot_slot: Option<oneshot::Receiver<OtStep>>,

    pms_outer_hash_state: Option<[u8; 32]>,
    ms_outer_hash_state: Option<[u8; 32]>,
    swk_share: Option<[u8; 16]>,
    cwk_share: Option<[u8; 16]>,
    siv_share: Option<[u8; 4]>,
    civ_share: Option<[u8; 4]>,
    gctr_block_share: Option<[u8; 16]>,
    server_pubkey: Vec<u8>,
    notary_pms_share: Option<[u8; 32]>,
    ghash_inputs_blob: Vec<u8>,

    /// The client's salted commitment per circuit, 1-indexed.
    his_commitment: Vec<Vec<u8>>,
    /// The notary's encoded output per circuit, 1-indexed.
    encoded_output: Vec<Vec<u8>>,
    /// Withheld check value for circuit 6's commit-before-reveal.
    c6_check_value: Vec<u8>,

    stream_counter: Option<Arc<AtomicU32>>,

    tag_mask: String,
    poh_mask: String,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sid: String,
        signing_key: SigningKey,
        ot: Arc<OtManager>,
        gp: Arc<GarbledPool>,
        tv: Arc<TagVerificationManager>,
        ts: Arc<TagSigningManager>,
        destroy_tx: mpsc::UnboundedSender<String>,
        ot_release_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            sid,
            signing_key,
            ot,
            gp,
            tv,
            ts,
            destroy_tx,
            ot_release_tx,
            client_key: None,
            notary_key: None,
            storage_dir: None,
            msgs_seen: Vec::new(),
            g: None,
            p2pc: None,
            ghash: GhashCore::new(),
            ot_slot: None,
            pms_outer_hash_state: None,
            ms_outer_hash_state: None,
            swk_share: None,
            cwk_share: None,
            siv_share: None,
            civ_share: None,
            gctr_block_share: None,
            server_pubkey: Vec::new(),
            notary_pms_share: None,
            ghash_inputs_blob: Vec::new(),
            his_commitment: vec![Vec::new(); 8],
            encoded_output: vec![Vec::new(); 8],
            c6_check_value: Vec::new(),
            stream_counter: None,
            tag_mask: String::new(),
            poh_mask: String::new(),
        }
    }

    /// Dispatches one command to its step handler.
    pub async fn handle(&mut self, command: &str, body: &[u8]) -> Result<Vec<u8>, SessionError> {
        match command {
            "init" => self.init(body).await,
            "getUploadProgress" => self.get_upload_progress(),
            "step1" => self.step1(body),
            "step2" => self.step2(body),
            "step3" => self.step3(body),
            "step4" => self.step4(body),
            "c1_step1" => self.c1_step1(),
            "c1_step2" => self.c1_step2(body).await,
            "c1_step3" => self.c1_step3(body),
            "c1_step4" => self.c1_step4(body),
            "c1_step5" => self.c1_step5(body),
            "c2_step1" => self.c2_step1(),
            "c2_step2" => self.c2_step2(body).await,
            "c2_step3" => self.c2_step3(body),
            "c2_step4" => self.c2_step4(body),
            "c3_step1" => self.c3_step1(),
            "c3_step2" => self.c3_step2(body).await,
            "c4_step1" => self.c4_step1(body),
            "c4_step2" => self.c4_step2(body).await,
            "c4_step3" => self.c4_step3(body),
            "c5_pre1" => self.c5_pre1(body),
            "c5_step1" => self.c5_step1(),
            "c5_step2" => self.c5_step2(body).await,
            "c5_step3" => self.c5_step3(body),
            "c6_step1" => self.c6_step1(),
            "c6_pre2" => self.c6_pre2(body).await,
            "c6_step2" => self.c6_step2(body),
            "c7_step1" => self.c7_step1(body),
            "c7_step2" => self.c7_step2(body).await,
            "ghash_step1" => self.ghash_step1(body),
            "ghash_step2" => self.ghash_step2(),
            "ghash_step3" => self.ghash_step3(body),
            "commitHash" => self.commit_hash(body).await,
            "prepTagVerification" => self.prep_tag_verification(body).await,
            "pollTagVerification" => self.poll_tag_verification().await,
            "tagVerification" => self.tag_verification(body).await,
            other => Err(SessionError::UnknownCommand(other.to_string())),
        }
    }

    /// The first message from the client: 64 bytes of raw ECDH public key
    /// followed by a 2-byte big-endian count of circuit-6 executions.
    async fn init(&mut self, body: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(1)?;
        if body.len() != 66 {
            return Err(SessionError::BadLength);
        }
        let (client_key, notary_key) = self.symmetric_keys(&body[..64])?;
        self.client_key = Some(client_key);
        self.notary_key = Some(notary_key);

        let c6_count = u16::from_be_bytes([body[64], body[65]]) as usize;
        if !(1..=1026).contains(&c6_count) {
            return Err(SessionError::BadLength);
        }

        let dir = PathBuf::from(rand_string());
        std::fs::create_dir(&dir)?;
        self.storage_dir = Some(dir);

        let blobs = self.gp.get_blobs(c6_count).await;
        let metas = self.gp.circuits().to_vec();
        self.g = Some(Garbler::new(&metas, blobs, c6_count, &mut thread_rng()));

        // Paillier keygen is expensive; keep it off the async workers
        self.p2pc = Some(
            tokio::task::spawn_blocking(Paillier2Pc::new)
                .await
                .map_err(|_| SessionError::Internal("paillier keygen task failed".into()))?,
        );
        Ok(Vec::new())
    }

    /// Sequence 3: the truth tables of the notary's garblings, streamed to
    /// the client straight from the pool files.
    pub fn get_blob(&mut self) -> Result<Vec<PathBuf>, SessionError> {
        self.sequence_check(3)?;
        Ok(self.g()?.tt_paths())
    }

    /// Sequence 4: prepares the upload of the client's truth tables.
    /// Returns the target path and the live byte counter; the HTTP handler
    /// streams the body without holding the session lock so that
    /// getUploadProgress stays responsive.
    pub fn begin_set_blob(&mut self) -> Result<(PathBuf, Arc<AtomicU32>), SessionError> {
        self.sequence_check(4)?;
        let dir = self
            .storage_dir
            .as_ref()
            .ok_or_else(|| SessionError::Internal("no storage dir".into()))?;
        let counter = Arc::new(AtomicU32::new(0));
        self.stream_counter = Some(counter.clone());
        Ok((dir.join("blobForNotary"), counter))
    }

    /// Sequence 100, allowed any number of times between 4 and 9.
    fn get_upload_progress(&mut self) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(100)?;
        let counter = self
            .stream_counter
            .as_ref()
            .ok_or_else(|| SessionError::Internal("no upload in progress".into()))?;
        let bytes = counter.load(Ordering::Relaxed).to_le_bytes();
        self.encrypt_to_client(&bytes)
    }

    /// Sequences 5..8: the Paillier PMS-share 2PC.
    fn step1(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(5)?;
        let body = self.decrypt_from_client(encrypted)?;
        let (server_pubkey, resp) = self.p2pc()?.step1(&body)?;
        self.server_pubkey = server_pubkey;
        self.encrypt_to_client(&resp)
    }

    fn step2(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(6)?;
        let body = self.decrypt_from_client(encrypted)?;
        let resp = self.p2pc()?.step2(&body)?;
        self.encrypt_to_client(&resp)
    }

    fn step3(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(7)?;
        let body = self.decrypt_from_client(encrypted)?;
        let resp = self.p2pc()?.step3(&body)?;
        self.encrypt_to_client(&resp)
    }

    fn step4(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(8)?;
        let body = self.decrypt_from_client(encrypted)?;
        self.notary_pms_share = Some(self.p2pc()?.step4(&body)?);
        Ok(Vec::new())
    }

    /// Sequences 9..13: PRF(PMS) -> MS, capturing the PMS outer hash state.
    fn c1_step1(&mut self) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(9)?;
        let pms = self
            .notary_pms_share
            .ok_or_else(|| SessionError::Internal("no PMS share".into()))?;
        let mask = self.g()?.mask(1, 1);
        self.g_mut()?.set_inputs(1, &[&pms, &mask]);
        let out = self.c_step1(1)?;
        self.encrypt_to_client(&out)
    }

    async fn c1_step2(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(10)?;
        let body = self.decrypt_from_client(encrypted)?;
        let out = self.common_step2(1, &body).await?;
        self.encrypt_to_client(&out)
    }

    fn c1_step3(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(11)?;
        let body = self.decrypt_from_client(encrypted)?;
        if body.len() < 32 {
            return Err(SessionError::BadLength);
        }
        let (decommit, his_inner_hash) = body.split_at(body.len() - 32);
        let output = self.process_decommit(1, decommit)?;
        // unmask the output into the PMS outer hash state
        let state: [u8; 32] = xor_bytes(&output[0..32], &self.g()?.mask(1, 1))
            .try_into()
            .map_err(|_| SessionError::BadLength)?;
        self.pms_outer_hash_state = Some(state);
        let a1 = finish_hash(&state, his_inner_hash);
        self.encrypt_to_client(&a1)
    }

    fn c1_step4(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(12)?;
        let body = self.decrypt_from_client(encrypted)?;
        let state = self
            .pms_outer_hash_state
            .ok_or_else(|| SessionError::Internal("no PMS hash state".into()))?;
        let a2 = finish_hash(&state, &body);
        self.encrypt_to_client(&a2)
    }

    fn c1_step5(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(13)?;
        let body = self.decrypt_from_client(encrypted)?;
        let state = self
            .pms_outer_hash_state
            .ok_or_else(|| SessionError::Internal("no PMS hash state".into()))?;
        let p2 = finish_hash(&state, &body);
        self.encrypt_to_client(&p2)
    }

    /// Sequences 14..17: PRF(MS) -> verify_data and the MS outer state.
    fn c2_step1(&mut self) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(14)?;
        let state = self
            .pms_outer_hash_state
            .ok_or_else(|| SessionError::Internal("no PMS hash state".into()))?;
        let mask = self.g()?.mask(2, 1);
        self.g_mut()?.set_inputs(2, &[&state, &mask]);
        let out = self.c_step1(2)?;
        self.encrypt_to_client(&out)
    }

    async fn c2_step2(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(15)?;
        let body = self.decrypt_from_client(encrypted)?;
        let out = self.common_step2(2, &body).await?;
        self.encrypt_to_client(&out)
    }

    fn c2_step3(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(16)?;
        let body = self.decrypt_from_client(encrypted)?;
        if body.len() < 64 {
            return Err(SessionError::BadLength);
        }
        let (decommit, tail) = body.split_at(body.len() - 64);
        let output = self.process_decommit(2, decommit)?;
        let a1_inner = &tail[..32];
        let a1_inner_vd = &tail[32..];
        let state: [u8; 32] = xor_bytes(&output[0..32], &self.g()?.mask(2, 1))
            .try_into()
            .map_err(|_| SessionError::BadLength)?;
        self.ms_outer_hash_state = Some(state);
        let a1 = finish_hash(&state, a1_inner);
        let a1_vd = finish_hash(&state, a1_inner_vd);
        self.encrypt_to_client(&[a1.as_slice(), a1_vd.as_slice()].concat())
    }

    fn c2_step4(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(17)?;
        let body = self.decrypt_from_client(encrypted)?;
        if body.len() != 64 {
            return Err(SessionError::BadLength);
        }
        let state = self
            .ms_outer_hash_state
            .ok_or_else(|| SessionError::Internal("no MS hash state".into()))?;
        let a2 = finish_hash(&state, &body[..32]);
        let verify_data = &finish_hash(&state, &body[32..64])[..12];
        self.encrypt_to_client(&[a2.as_slice(), verify_data].concat())
    }

    /// Sequences 18..19: session key share derivation. The notary's masks
    /// become its TLS key shares.
    fn c3_step1(&mut self) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(18)?;
        let state = self
            .ms_outer_hash_state
            .ok_or_else(|| SessionError::Internal("no MS hash state".into()))?;
        let (m1, m2, m3, m4) = {
            let g = self.g()?;
            (g.mask(3, 1), g.mask(3, 2), g.mask(3, 3), g.mask(3, 4))
        };
        self.swk_share = Some(as_array_16(&m1)?);
        self.cwk_share = Some(as_array_16(&m2)?);
        self.siv_share = Some(as_array_4(&m3)?);
        self.civ_share = Some(as_array_4(&m4)?);
        self.g_mut()?.set_inputs(3, &[&state, &m1, &m2, &m3, &m4]);
        let out = self.c_step1(3)?;
        self.encrypt_to_client(&out)
    }

    async fn c3_step2(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(19)?;
        let body = self.decrypt_from_client(encrypted)?;
        let out = self.common_step2(3, &body).await?;
        self.encrypt_to_client(&out)
    }

    /// Sequences 20..22: Client-Finished MAC via the H-share cross OT.
    /// Circuit 3's decommitment piggy-backs on this message to save a
    /// round-trip; the notary does not need circuit 3's output since its
    /// masks already are its key shares.
    fn c4_step1(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(20)?;
        let body = self.decrypt_from_client(encrypted)?;
        let decommit_size = self.decommit_size(3)?;
        if body.len() != decommit_size {
            return Err(SessionError::BadLength);
        }
        self.process_decommit(3, &body)?;

        let swk = self.swk_share.unwrap_or_default();
        let cwk = self.cwk_share.unwrap_or_default();
        let siv = self.siv_share.unwrap_or_default();
        let civ = self.civ_share.unwrap_or_default();
        let (m1, m2) = {
            let g = self.g()?;
            (g.mask(4, 1), g.mask(4, 2))
        };
        self.g_mut()?
            .set_inputs(4, &[&swk, &cwk, &siv, &civ, &m1, &m2]);

        // The client's labels for the cwk/civ inputs of every circuit-6
        // execution ride along with circuit 4's OT response; this pins the
        // client's AES key share across all request blocks.
        let (client_labels, input_bits, notary_labels) = {
            let g = self.g()?;
            let mut payload = g.client_labels(4);
            payload.extend(g.c6_key_labels());
            (payload, g.input_bits(4).to_vec(), g.notary_labels(4))
        };
        self.spawn_ot_round(client_labels, input_bits, "c4_step1".to_string());
        self.encrypt_to_client(&notary_labels)
    }

    async fn c4_step2(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(21)?;
        let body = self.decrypt_from_client(encrypted)?;
        let out = self.common_step2(4, &body).await?;
        self.encrypt_to_client(&out)
    }

    fn c4_step3(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(22)?;
        let body = self.decrypt_from_client(encrypted)?;
        if body.len() < 16 {
            return Err(SessionError::BadLength);
        }
        let (decommit, enc_cf) = body.split_at(body.len() - 16);
        self.process_decommit(4, decommit)?;

        let h1 = u128::from_be_bytes(as_array_16(&self.g()?.mask(4, 1))?);
        let gctr = u128::from_be_bytes(as_array_16(&self.g()?.mask(4, 2))?);
        let enc_cf = u128::from_be_bytes(enc_cf.try_into().unwrap());

        let mac = finished_mac(&mut thread_rng(), h1, gctr, enc_cf);
        self.spawn_ot_respond(mxtables_to_ot_payload(&mac.ot_payload));
        self.ghash.absorb_finished_shares(mac.h1, mac.h2, mac.h3);
        self.encrypt_to_client(&mac.tag_share.to_be_bytes())
    }

    /// Sequences 23..26: Server-Finished MAC, analogous to circuit 4 but
    /// with shares that stay local to this exchange.
    fn c5_pre1(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(23)?;
        let body = self.decrypt_from_client(encrypted)?;
        let state = self
            .ms_outer_hash_state
            .ok_or_else(|| SessionError::Internal("no MS hash state".into()))?;
        let a1 = finish_hash(&state, &body);
        self.encrypt_to_client(&a1)
    }

    fn c5_step1(&mut self) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(24)?;
        let state = self
            .ms_outer_hash_state
            .ok_or_else(|| SessionError::Internal("no MS hash state".into()))?;
        let swk = self.swk_share.unwrap_or_default();
        let siv = self.siv_share.unwrap_or_default();
        let (m1, m2) = {
            let g = self.g()?;
            (g.mask(5, 1), g.mask(5, 2))
        };
        self.g_mut()?.set_inputs(5, &[&state, &swk, &siv, &m1, &m2]);
        if self.g()?.input_bits(5).len() / 8 != 84 {
            return Err(SessionError::Internal(
                "circuit 5 notary input is not 84 bytes".into(),
            ));
        }
        let out = self.c_step1(5)?;
        self.encrypt_to_client(&out)
    }

    async fn c5_step2(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(25)?;
        let body = self.decrypt_from_client(encrypted)?;
        let out = self.common_step2(5, &body).await?;
        self.encrypt_to_client(&out)
    }

    fn c5_step3(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(26)?;
        let body = self.decrypt_from_client(encrypted)?;
        if body.len() < 16 {
            return Err(SessionError::BadLength);
        }
        let (decommit, enc_sf) = body.split_at(body.len() - 16);
        self.process_decommit(5, decommit)?;

        let h1 = u128::from_be_bytes(as_array_16(&self.g()?.mask(5, 1))?);
        let gctr = u128::from_be_bytes(as_array_16(&self.g()?.mask(5, 2))?);
        let enc_sf = u128::from_be_bytes(enc_sf.try_into().unwrap());

        let mac = finished_mac(&mut thread_rng(), h1, gctr, enc_sf);
        self.spawn_ot_respond(mxtables_to_ot_payload(&mac.ot_payload));
        self.encrypt_to_client(&mac.tag_share.to_be_bytes())
    }

    /// Sequences 27..29: the parallel AES encrypted-counter circuits for
    /// the client's request.
    fn c6_step1(&mut self) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(27)?;
        let cwk = self.cwk_share.unwrap_or_default();
        let civ = self.civ_share.unwrap_or_default();
        let executions = self.g()?.c6_count();
        for _ in 0..executions {
            self.g_mut()?.set_inputs(6, &[&cwk, &civ]);
        }

        // The labels for the client's key/IV bits are omitted: the client
        // already received those active labels with circuit 4's OT.
        let (labels, input_bits, notary_labels) = {
            let g = self.g()?;
            (
                g.c6_client_labels_without_keys(),
                g.input_bits(6).to_vec(),
                g.notary_labels(6),
            )
        };
        self.spawn_ot_round(labels, input_bits, "c6_step1".to_string());
        self.encrypt_to_client(&notary_labels)
    }

    /// Circuit 6 reverses the usual order: the check value is computed now
    /// but withheld until the client commits.
    async fn c6_pre2(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(28)?;
        let body = self.decrypt_from_client(encrypted)?;
        // a placeholder commitment keeps the common step-2 parser happy
        let mut with_dummy = body;
        with_dummy.extend_from_slice(&[0u8; 32]);
        self.c6_check_value = self.common_step2(6, &with_dummy).await?;
        Ok(Vec::new())
    }

    fn c6_step2(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(29)?;
        let body = self.decrypt_from_client(encrypted)?;
        if body.len() != 32 {
            return Err(SessionError::BadLength);
        }
        self.his_commitment[6] = body;
        let check_value = self.c6_check_value.clone();
        self.encrypt_to_client(&check_value)
    }

    /// Sequences 30..31: the GCTR block for the request tag.
    fn c7_step1(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(30)?;
        let body = self.decrypt_from_client(encrypted)?;
        let decommit_size = self.decommit_size(6)?;
        if body.len() != decommit_size {
            return Err(SessionError::BadLength);
        }
        self.process_decommit(6, &body)?;

        let cwk = self.cwk_share.unwrap_or_default();
        let civ = self.civ_share.unwrap_or_default();
        let m1 = self.g()?.mask(7, 1);
        self.gctr_block_share = Some(as_array_16(&m1)?);
        self.g_mut()?.set_inputs(7, &[&cwk, &civ, &m1]);
        let out = self.c_step1(7)?;
        self.encrypt_to_client(&out)
    }

    async fn c7_step2(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(31)?;
        let body = self.decrypt_from_client(encrypted)?;
        let out = self.common_step2(7, &body).await?;
        self.encrypt_to_client(&out)
    }

    /// Sequences 32..34: the request-tag GHASH via power-share OT.
    fn ghash_step1(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(32)?;
        let body = self.decrypt_from_client(encrypted)?;
        let decommit_size = self.decommit_size(7)?;
        if body.len() != decommit_size + 2 {
            return Err(SessionError::BadLength);
        }
        self.process_decommit(7, &body[..decommit_size])?;

        let max_power_needed =
            u16::from_be_bytes([body[decommit_size], body[decommit_size + 1]]) as usize;
        self.ghash.set_max_power_needed(max_power_needed)?;

        let entries = self.ghash.step1(&mut thread_rng());
        if !entries.is_empty() {
            self.spawn_ot_respond(mxtables_to_ot_payload(&entries));
        }
        Ok(Vec::new())
    }

    /// Optional, only for requests longer than 339 blocks; a separate step
    /// because it needs its own round of communication.
    fn ghash_step2(&mut self) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(33)?;
        let entries = self.ghash.step2(&mut thread_rng());
        self.spawn_ot_respond(mxtables_to_ot_payload(&entries));
        Ok(Vec::new())
    }

    /// Block aggregation and the notary's share of the request tag.
    fn ghash_step3(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(34)?;
        let body = self.decrypt_from_client(encrypted)?;
        let block_count = self.ghash.max_power_needed();
        if body.len() < block_count * 16 {
            return Err(SessionError::BadLength);
        }
        let (inputs_blob, needs_aggregation) = body.split_at(block_count * 16);

        // ghash inputs = aad + client_request + length block
        let blocks: Vec<u128> = inputs_blob
            .chunks_exact(16)
            .map(|c| u128::from_be_bytes(c.try_into().unwrap()))
            .collect();
        let (output_share, entries, mult_count) =
            self.ghash.step3(&mut thread_rng(), &blocks)?;

        if !needs_aggregation.is_empty() {
            // the client sent bits for every small power and for every
            // corresponding aggregated value
            self.spawn_ot_respond(mxtables_to_ot_payload(&entries));
        } else if mult_count != 0 {
            return Err(SessionError::Internal(
                "client skipped a required block aggregation".into(),
            ));
        }

        self.ghash_inputs_blob = inputs_blob.to_vec();
        let gctr = self
            .gctr_block_share
            .ok_or_else(|| SessionError::Internal("no GCTR share".into()))?;
        let out = xor_bytes(&gctr, &output_share.to_be_bytes());
        self.encrypt_to_client(&out)
    }

    /// Sequence 35: the client commits to the server's response; the notary
    /// signs the session and releases the OT.
    async fn commit_hash(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(35)?;
        let body = self.decrypt_from_client(encrypted)?;
        if body.len() != 96 {
            return Err(SessionError::BadLength);
        }
        let his_commit_hash = &body[0..32];
        let his_key_share_hash = &body[32..64];
        let his_pms_share_hash = &body[64..96];

        let pms_share = self
            .notary_pms_share
            .ok_or_else(|| SessionError::Internal("no PMS share".into()))?;
        let cwk = self.cwk_share.unwrap_or_default();
        let civ = self.civ_share.unwrap_or_default();
        let swk = self.swk_share.unwrap_or_default();
        let siv = self.siv_share.unwrap_or_default();

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let time_bytes = timestamp.to_be_bytes();

        let mut message = Vec::new();
        message.extend_from_slice(his_commit_hash);
        message.extend_from_slice(his_key_share_hash);
        message.extend_from_slice(his_pms_share_hash);
        message.extend_from_slice(&self.ghash_inputs_blob);
        message.extend_from_slice(&self.server_pubkey);
        message.extend_from_slice(&pms_share);
        message.extend_from_slice(&cwk);
        message.extend_from_slice(&civ);
        message.extend_from_slice(&swk);
        message.extend_from_slice(&siv);
        message.extend_from_slice(&time_bytes);

        let digest = Sha256::digest(&message);
        let signature: Signature = self
            .signing_key
            .sign_prehash(&digest)
            .map_err(|_| SessionError::Signing)?;

        // the last step that needs Softspoken OT
        self.ot.disconnect().await;
        let _ = self.ot_release_tx.send(self.sid.clone());

        let mut reply = signature.to_bytes().to_vec();
        reply.extend_from_slice(&pms_share);
        reply.extend_from_slice(&cwk);
        reply.extend_from_slice(&civ);
        reply.extend_from_slice(&swk);
        reply.extend_from_slice(&siv);
        reply.extend_from_slice(&time_bytes);
        self.encrypt_to_client(&reply)
    }

    async fn prep_tag_verification(&mut self, body: &[u8]) -> Result<Vec<u8>, SessionError> {
        let req: PrepTagVerificationRequest = match serde_json::from_slice(body) {
            Ok(req) => req,
            Err(_) => return Ok(json_error("invalid body")),
        };
        let client_iv_share = match base64_decode(&req.client_iv_share) {
            Some(b) => b,
            None => return Ok(json_error("invalid client IV share")),
        };
        let record_iv = match base64_decode(&req.record_iv) {
            Some(b) => b,
            None => return Ok(json_error("invalid record IV")),
        };

        let siv = self.siv_share.unwrap_or_default();
        if client_iv_share.len() != siv.len() {
            return Ok(json_error("invalid client IV share"));
        }
        if record_iv.len() != 8 {
            return Ok(json_error("invalid record IV"));
        }
        let swk = self.swk_share.unwrap_or_default();

        match self
            .tv
            .prep(&self.sid, &siv, &swk, &client_iv_share, &record_iv)
            .await
        {
            Ok(()) => Ok(Vec::new()),
            Err(e) => Ok(json_error(&e.to_string())),
        }
    }

    async fn poll_tag_verification(&mut self) -> Result<Vec<u8>, SessionError> {
        let mut response = PollTagVerificationResponse {
            busy: false,
            complete: false,
            error: None,
        };
        match self.tv.poll(&self.sid).await {
            Ok(status) => {
                response.busy = status.busy;
                response.complete = !status.tag_mask.is_empty() && !status.poh_mask.is_empty();
                self.tag_mask = status.tag_mask;
                self.poh_mask = status.poh_mask;
            }
            Err(e) => {
                response.busy = true;
                response.error = Some(e.to_string());
            }
        }
        serde_json::to_vec(&response)
            .map_err(|_| SessionError::Internal("poll response marshalling".into()))
    }

    /// Sequence 36, the final step: external MPC-based tag verification
    /// followed by the ciphertext signature.
    async fn tag_verification(&mut self, body: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence_check(36)?;

        let mut response = TagVerificationResponse {
            ciphertext: None,
            signature: None,
            status: "failed".to_string(),
            error: None,
        };

        if self.tag_mask.is_empty() || self.poh_mask.is_empty() {
            response.error = Some("tag verification is not ready".to_string());
            return marshal(&response);
        }

        let req: TagVerificationRequest = match serde_json::from_slice(body) {
            Ok(req) => req,
            Err(_) => {
                response.error = Some("invalid body".to_string());
                return marshal(&response);
            }
        };

        let success = match verify_tag(
            &self.sid,
            &self.poh_mask,
            &self.tag_mask,
            &req.ciphertext,
            &req.aad,
            &req.tag_share,
        )
        .await
        {
            Ok(success) => success,
            Err(e) => {
                response.error = Some(e.to_string());
                return marshal(&response);
            }
        };

        response.ciphertext = Some(req.ciphertext.clone());
        if success {
            match self.ts.sign(&req.ciphertext) {
                Ok(signature) => {
                    response.status = "verified".to_string();
                    response.signature = Some(hex::encode(signature));
                }
                Err(e) => {
                    error!("tagVerification: {e}");
                    response.error = Some("failed to sign ciphertext".to_string());
                }
            }
        }
        marshal(&response)
    }

    /// Paths to remove when the session is destroyed.
    pub fn cleanup_paths(&self) -> (Option<PathBuf>, Vec<PathBuf>) {
        let tt = self.g.as_ref().map(|g| g.tt_paths()).unwrap_or_default();
        (self.storage_dir.clone(), tt)
    }

    // ---- internals ----

    fn g(&self) -> Result<&Garbler, SessionError> {
        self.g
            .as_ref()
            .ok_or_else(|| SessionError::Internal("session not initialized".into()))
    }

    fn g_mut(&mut self) -> Result<&mut Garbler, SessionError> {
        self.g
            .as_mut()
            .ok_or_else(|| SessionError::Internal("session not initialized".into()))
    }

    fn p2pc(&mut self) -> Result<&mut Paillier2Pc, SessionError> {
        self.p2pc
            .as_mut()
            .ok_or_else(|| SessionError::Internal("session not initialized".into()))
    }

    /// Computes the shared ECDH secret between the client's raw public key
    /// (X ‖ Y) and the session signing key, split into the two transport
    /// keys.
    fn symmetric_keys(&self, pk: &[u8]) -> Result<([u8; 16], [u8; 16]), SessionError> {
        let point = EncodedPoint::from_affine_coordinates(
            GenericArray::from_slice(&pk[0..32]),
            GenericArray::from_slice(&pk[32..64]),
            false,
        );
        let pubkey = Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
            .ok_or(SessionError::BadClientKey)?;
        let shared = p256::ecdh::diffie_hellman(
            self.signing_key.as_nonzero_scalar(),
            pubkey.as_affine(),
        );
        let secret = shared.raw_secret_bytes();
        Ok((
            secret[0..16].try_into().unwrap(),
            secret[16..32].try_into().unwrap(),
        ))
    }

    fn decrypt_from_client(&self, ct_with_nonce: &[u8]) -> Result<Vec<u8>, SessionError> {
        let key = self.client_key.ok_or(SessionError::Decrypt)?;
        if ct_with_nonce.len() < 12 {
            return Err(SessionError::Decrypt);
        }
        let cipher = Aes128Gcm::new_from_slice(&key).map_err(|_| SessionError::Decrypt)?;
        let nonce = Nonce::from_slice(&ct_with_nonce[..12]);
        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &ct_with_nonce[12..],
                    aad: &[],
                },
            )
            .map_err(|_| SessionError::Decrypt)
    }

    fn encrypt_to_client(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let key = self.notary_key.ok_or(SessionError::Decrypt)?;
        let cipher = Aes128Gcm::new_from_slice(&key).map_err(|_| SessionError::Decrypt)?;
        let nonce_bytes: [u8; 12] = thread_rng().gen();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| SessionError::Decrypt)?;
        let mut out = nonce_bytes.to_vec();
        out.extend(ciphertext);
        Ok(out)
    }

    /// Makes sure messages arrive in order and only once. Message 100
    /// (getUploadProgress) may repeat between 4 and 9; messages 1, 3 and 4
    /// may arrive without a predecessor; 34 follows 32 directly when the
    /// optional 33 was skipped.
    fn sequence_check(&mut self, seq_no: u16) -> Result<(), SessionError> {
        if seq_no == 100 {
            if self.msgs_seen.contains(&4) && !self.msgs_seen.contains(&9) {
                return Ok(());
            }
            return Err(SessionError::OutOfOrder(seq_no));
        }
        if self.msgs_seen.contains(&seq_no) {
            return Err(SessionError::Replayed(seq_no));
        }
        if !self.msgs_seen.contains(&(seq_no.wrapping_sub(1))) {
            let permitted = matches!(seq_no, 1 | 3 | 4)
                || (seq_no == 34 && self.msgs_seen.contains(&32));
            if !permitted {
                return Err(SessionError::OutOfOrder(seq_no));
            }
        }
        self.msgs_seen.push(seq_no);
        Ok(())
    }

    /// Shared first half of every circuit's dual execution: hand the client
    /// the notary's active labels, answer the client's OT request with both
    /// labels per client wire, and request the notary's own labels from the
    /// client's garbling.
    fn c_step1(&mut self, c: usize) -> Result<Vec<u8>, SessionError> {
        let (client_labels, input_bits, notary_labels) = {
            let g = self.g()?;
            (
                g.client_labels(c),
                g.input_bits(c).to_vec(),
                g.notary_labels(c),
            )
        };
        self.spawn_ot_round(client_labels, input_bits, format!("c{c}_step1"));
        Ok(notary_labels)
    }

    /// Shared second half: the client sends its active labels in the clear
    /// plus its commitment; the notary evaluates the client's circuit and
    /// reveals its encoded output together with its decoding tables.
    async fn common_step2(&mut self, c: usize, body: &[u8]) -> Result<Vec<u8>, SessionError> {
        let tt_blob = self.retrieve_blob_for_notary(c)?;
        let (executions, client_labels_size) = {
            let g = self.g()?;
            let exe = g.executions(c);
            (exe, g.meta(c).spec.client_input_size * 16 * exe)
        };
        if body.len() != client_labels_size + 32 {
            return Err(SessionError::BadLength);
        }
        let client_labels = &body[..client_labels_size];
        let commitment = body[client_labels_size..].to_vec();

        let notary_labels = self.await_ot_response(&format!("c{c}_step1")).await?;

        self.his_commitment[c] = commitment;
        let encoded = {
            let g = self.g()?;
            evaluator::evaluate_circuit(
                g.meta(c),
                executions,
                &notary_labels,
                client_labels,
                &tt_blob,
            )?
        };
        self.encoded_output[c] = encoded.clone();

        let mut out = encoded;
        out.extend(self.g()?.decoding_tables(c));
        Ok(out)
    }

    /// Awaits the OT exchange started by the matching step 1.
    async fn await_ot_response(&mut self, expected: &str) -> Result<Vec<u8>, SessionError> {
        let rx = self
            .ot_slot
            .take()
            .ok_or_else(|| SessionError::Internal("no OT exchange in flight".into()))?;
        let step = rx.await.map_err(|_| SessionError::OtTaskFailed)?;
        if step.from != expected {
            return Err(SessionError::WrongOtSource {
                expected: expected.to_string(),
                got: step.from,
            });
        }
        Ok(step.data)
    }

    /// Size of the client's decommitment for circuit `c`.
    fn decommit_size(&self, c: usize) -> Result<usize, SessionError> {
        Ok(self.encoded_output[c].len() + self.g()?.decoding_tables(c).len() + 32)
    }

    /// Verifies the client's decommitment against its earlier commitment,
    /// decodes both parties' outputs and checks they agree. Returns the
    /// decoded output with the field values in circuit-file order.
    fn process_decommit(&mut self, c: usize, decommit: &[u8]) -> Result<Vec<u8>, SessionError> {
        let my_decoding_table = self.g()?.decoding_tables(c);
        let encoded_len = self.encoded_output[c].len();
        if decommit.len() != encoded_len + my_decoding_table.len() + 32 {
            return Err(SessionError::BadLength);
        }
        let his_encoded_output = &decommit[..encoded_len];
        let his_decoding_table = &decommit[encoded_len..encoded_len + my_decoding_table.len()];
        let his_salt = &decommit[encoded_len + my_decoding_table.len()..];

        let commitment = Sha256::digest(
            [his_encoded_output, his_decoding_table, his_salt].concat(),
        );
        if self.his_commitment[c] != commitment.as_slice() {
            return Err(SessionError::CommitmentMismatch);
        }

        // decode his output and mine, and compare
        let his_plaintext = xor_bytes(&my_decoding_table, his_encoded_output);
        let my_plaintext = xor_bytes(his_decoding_table, &self.encoded_output[c]);
        if his_plaintext != my_plaintext {
            return Err(SessionError::OutputMismatch);
        }
        self.parse_plaintext_output(c, &my_plaintext)
    }

    /// Splits the decoded plaintext per execution and repacks the output
    /// bits into bytes so that the values appear in circuit-file order.
    fn parse_plaintext_output(&self, c: usize, pt: &[u8]) -> Result<Vec<u8>, SessionError> {
        use notary_core::utils::{bits_to_bytes, bytes_to_bits};
        let g = self.g()?;
        let spec = g.meta(c).spec;
        let executions = g.executions(c);
        if pt.len() % executions != 0 {
            return Err(SessionError::BadLength);
        }
        let chunk_size = pt.len() / executions;
        let mut output = Vec::new();
        for chunk in pt.chunks_exact(chunk_size) {
            // the plaintext is MSB-padded to whole bytes; drop the padding
            let bits = bytes_to_bits(chunk);
            if bits.len() < spec.output_size {
                return Err(SessionError::BadLength);
            }
            let bits = &bits[..spec.output_size];
            let mut offset = 0;
            for field in spec.outputs_sizes {
                output.extend(bits_to_bytes(&bits[offset..offset + field]));
                offset += field;
            }
        }
        Ok(output)
    }

    /// Reads circuit `c`'s truth tables out of the blob the client
    /// uploaded earlier.
    fn retrieve_blob_for_notary(&self, c: usize) -> Result<Vec<u8>, SessionError> {
        let (offset, size) = self.g()?.blob_offset(c);
        let dir = self
            .storage_dir
            .as_ref()
            .ok_or_else(|| SessionError::Internal("no storage dir".into()))?;
        let mut file = std::fs::File::open(dir.join("blobForNotary"))?;
        file.seek(SeekFrom::Start(offset as u64))?;
        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Spawns the OT exchange of a `c*_step1`: answer the client's label
    /// request, then request the notary's own labels. The result lands in
    /// the session's slot for the matching step 2; failures tear the
    /// session down through the destroy channel.
    fn spawn_ot_round(&mut self, payload: Vec<u8>, choice_bits: Vec<bool>, from: String) {
        let (tx, rx) = oneshot::channel();
        self.ot_slot = Some(rx);
        let ot = self.ot.clone();
        let sid = self.sid.clone();
        let destroy = self.destroy_tx.clone();
        let release = self.ot_release_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = ot.respond_with_data(payload).await {
                error!("OT respond failed: {e}");
                let _ = release.send(sid.clone());
                let _ = destroy.send(sid);
                return;
            }
            match ot.request_data(&choice_bits).await {
                Ok(data) => {
                    let _ = tx.send(OtStep { from, data });
                }
                Err(e) => {
                    error!("OT request failed: {e}");
                    let _ = release.send(sid.clone());
                    let _ = destroy.send(sid);
                }
            }
        });
    }

    /// Spawns a respond-only OT transfer (labels go out unencrypted).
    fn spawn_ot_respond(&self, payload: Vec<u8>) {
        let ot = self.ot.clone();
        let sid = self.sid.clone();
        let destroy = self.destroy_tx.clone();
        let release = self.ot_release_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = ot.respond_with_data(payload).await {
                error!("OT respond failed: {e}");
                let _ = release.send(sid.clone());
                let _ = destroy.send(sid);
            }
        });
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrepTagVerificationRequest {
    client_iv_share: String,
    record_iv: String,
}

#[derive(Serialize)]
struct PollTagVerificationResponse {
    busy: bool,
    complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TagVerificationRequest {
    ciphertext: Vec<String>,
    aad: String,
    tag_share: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TagVerificationResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    ciphertext: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn marshal(response: &TagVerificationResponse) -> Result<Vec<u8>, SessionError> {
    serde_json::to_vec(response)
        .map_err(|_| SessionError::Internal("response marshalling".into()))
}

fn json_error(message: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "error": message })).unwrap_or_default()
}

fn base64_decode(input: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input).ok()
}

fn as_array_16(v: &[u8]) -> Result<[u8; 16], SessionError> {
    v.try_into().map_err(|_| SessionError::BadLength)
}

fn as_array_4(v: &[u8]) -> Result<[u8; 4], SessionError> {
    v.try_into().map_err(|_| SessionError::BadLength)
}

/// Random 10-character alphanumeric token for scratch directory names.
pub fn rand_string() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_session() -> Session {
        // a session wired to dummy channels, enough to exercise the pure
        // parts of the state machine
        let (destroy_tx, _destroy_rx) = mpsc::unbounded_channel();
        let (release_tx, _release_rx) = mpsc::unbounded_channel();
        let ot = Arc::new(crate::ot::OtManager::bind("127.0.0.1", 0).await.unwrap());
        let pool = crate::pool::GarbledPool::new(
            Vec::new(),
            std::env::temp_dir().join("pool-sess-test"),
            false,
        )
        .unwrap();
        let tv = Arc::new(TagVerificationManager::new(
            std::path::PathBuf::from("tagCircuits"),
            10020,
            10030,
        ));
        let key = SigningKey::random(&mut thread_rng());
        let dir = std::env::temp_dir().join(format!("tagkey-{}", rand_string()));
        std::fs::create_dir_all(&dir).unwrap();
        let pem = p256::SecretKey::random(&mut thread_rng())
            .to_sec1_pem(p256::pkcs8::LineEnding::LF)
            .unwrap();
        let key_path = dir.join("signing.key");
        std::fs::write(&key_path, pem.as_bytes()).unwrap();
        let ts = Arc::new(TagSigningManager::new(&key_path).unwrap());

        Session::new(
            "test-sid".to_string(),
            key,
            ot,
            pool,
            tv,
            ts,
            destroy_tx,
            release_tx,
        )
    }

    #[tokio::test]
    async fn test_sequence_check_in_order() {
        let mut s = test_session().await;
        for seq in [1u16, 3, 4, 5, 6, 7] {
            s.sequence_check(seq).unwrap();
        }
        // 2 was never sent, but 3 is permitted without it
        assert!(s.msgs_seen.contains(&3));
    }

    #[tokio::test]
    async fn test_sequence_check_rejects_replay() {
        let mut s = test_session().await;
        s.sequence_check(1).unwrap();
        assert!(matches!(
            s.sequence_check(1),
            Err(SessionError::Replayed(1))
        ));
    }

    #[tokio::test]
    async fn test_sequence_check_rejects_gap() {
        let mut s = test_session().await;
        s.sequence_check(1).unwrap();
        assert!(matches!(
            s.sequence_check(6),
            Err(SessionError::OutOfOrder(6))
        ));
    }

    #[tokio::test]
    async fn test_sequence_check_skipped_ghash_step2() {
        let mut s = test_session().await;
        for seq in 1..=32u16 {
            if seq == 2 {
                continue;
            }
            s.sequence_check(seq).unwrap();
        }
        // 33 is optional: 34 may follow 32 directly
        s.sequence_check(34).unwrap();
    }

    #[tokio::test]
    async fn test_sequence_check_upload_progress_window() {
        let mut s = test_session().await;
        // before setBlob: rejected
        assert!(s.sequence_check(100).is_err());
        for seq in [1u16, 3, 4] {
            s.sequence_check(seq).unwrap();
        }
        // repeatable between 4 and 9
        s.sequence_check(100).unwrap();
        s.sequence_check(100).unwrap();
        for seq in 5..=9u16 {
            s.sequence_check(seq).unwrap();
        }
        assert!(s.sequence_check(100).is_err());
    }

    #[tokio::test]
    async fn test_transport_crypto_roundtrip() {
        let mut s = test_session().await;
        s.client_key = Some([7u8; 16]);
        s.notary_key = Some([9u8; 16]);
        let ct = s.encrypt_to_client(b"hello notary").unwrap();
        // the notary's own replies decrypt under the notary key
        s.client_key = s.notary_key;
        let pt = s.decrypt_from_client(&ct).unwrap();
        assert_eq!(pt, b"hello notary");
    }

    #[tokio::test]
    async fn test_commit_hash_signature_layout() {
        use p256::ecdsa::signature::hazmat::PrehashVerifier;

        let mut s = test_session().await;
        s.client_key = Some([1u8; 16]);
        s.notary_key = Some([2u8; 16]);
        // state a completed run would have left behind
        s.notary_pms_share = Some([3u8; 32]);
        s.cwk_share = Some([4u8; 16]);
        s.civ_share = Some([5u8; 4]);
        s.swk_share = Some([6u8; 16]);
        s.siv_share = Some([7u8; 4]);
        s.server_pubkey = vec![8u8; 65];
        s.ghash_inputs_blob = vec![9u8; 48];
        s.msgs_seen = (1..=34).collect();

        let commit_body = {
            // the client's three 32-byte hashes, encrypted under its key
            let cipher = Aes128Gcm::new_from_slice(&[1u8; 16]).unwrap();
            let nonce = [0u8; 12];
            let mut hashes = Vec::new();
            hashes.extend_from_slice(&[10u8; 32]);
            hashes.extend_from_slice(&[11u8; 32]);
            hashes.extend_from_slice(&[12u8; 32]);
            let ct = cipher
                .encrypt(Nonce::from_slice(&nonce), hashes.as_slice())
                .unwrap();
            let mut body = nonce.to_vec();
            body.extend(ct);
            body
        };

        let verifying_key = *s.signing_key.verifying_key();
        let encrypted_reply = s.commit_hash(&commit_body).await.unwrap();

        // decrypt with the notary transport key
        let cipher = Aes128Gcm::new_from_slice(&[2u8; 16]).unwrap();
        let reply = cipher
            .decrypt(
                Nonce::from_slice(&encrypted_reply[..12]),
                &encrypted_reply[12..],
            )
            .unwrap();

        // signature[64] ‖ pms[32] ‖ cwk[16] ‖ civ[4] ‖ swk[16] ‖ siv[4] ‖ ts[8]
        assert_eq!(reply.len(), 64 + 32 + 16 + 4 + 16 + 4 + 8);
        assert_eq!(&reply[64..96], &[3u8; 32]);
        assert_eq!(&reply[96..112], &[4u8; 16]);
        assert_eq!(&reply[112..116], &[5u8; 4]);
        assert_eq!(&reply[116..132], &[6u8; 16]);
        assert_eq!(&reply[132..136], &[7u8; 4]);
        let time_bytes = &reply[136..144];

        // the signature must verify over the documented concatenation
        let mut message = Vec::new();
        message.extend_from_slice(&[10u8; 32]);
        message.extend_from_slice(&[11u8; 32]);
        message.extend_from_slice(&[12u8; 32]);
        message.extend_from_slice(&[9u8; 48]);
        message.extend_from_slice(&[8u8; 65]);
        message.extend_from_slice(&[3u8; 32]);
        message.extend_from_slice(&[4u8; 16]);
        message.extend_from_slice(&[5u8; 4]);
        message.extend_from_slice(&[6u8; 16]);
        message.extend_from_slice(&[7u8; 4]);
        message.extend_from_slice(time_bytes);
        let digest = Sha256::digest(&message);
        let signature = Signature::from_slice(&reply[..64]).unwrap();
        verifying_key.verify_prehash(&digest, &signature).unwrap();
    }

    #[tokio::test]
    async fn test_decrypt_rejects_tampered_ciphertext() {
        let mut s = test_session().await;
        s.client_key = Some([7u8; 16]);
        s.notary_key = Some([7u8; 16]);
        let mut ct = s.encrypt_to_client(b"payload").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 1;
        assert!(matches!(
            s.decrypt_from_client(&ct),
            Err(SessionError::Decrypt)
        ));
    }
}
