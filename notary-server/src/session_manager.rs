//! Creation, lookup and destruction of sessions, plus the cross-session
//! exclusivity of the OT coordinator.
//!
//! The session map is read on every request and written only on create and
//! delete. Destroy and OT-release signals arrive on dedicated unbounded
//! channels so that a failing step can fire them without blocking; a
//! background collector reaps sessions after 1200 s of inactivity or
//! 2400 s of total age.

use crate::error::NotaryServerError;
use crate::keys::KeyManager;
use crate::ot::OtManager;
use crate::pool::GarbledPool;
use crate::session::Session;
use crate::tag::{TagSigningManager, TagVerificationManager};
use p256::ecdsa::SigningKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{error, info, warn};

const STALE_INACTIVE_SECS: i64 = 1200;
const STALE_TOTAL_SECS: i64 = 2400;

pub struct SessionEntry {
    pub session: Mutex<Session>,
    last_seen: AtomicI64,
    created: i64,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    /// The sid currently owning the OT coordinator, if any.
    ot_owner: StdMutex<Option<String>>,
    destroy_tx: mpsc::UnboundedSender<String>,
    ot_release_tx: mpsc::UnboundedSender<String>,
    ot: Arc<OtManager>,
    tag_verification: Arc<TagVerificationManager>,
    tag_signer: Arc<TagSigningManager>,
    pool: Arc<GarbledPool>,
    keys: Arc<KeyManager>,
}

impl SessionManager {
    /// Builds the manager and starts its background monitors.
    pub fn new(
        ot: Arc<OtManager>,
        tag_verification: Arc<TagVerificationManager>,
        tag_signer: Arc<TagSigningManager>,
        pool: Arc<GarbledPool>,
        keys: Arc<KeyManager>,
    ) -> Arc<Self> {
        let (destroy_tx, destroy_rx) = mpsc::unbounded_channel();
        let (ot_release_tx, ot_release_rx) = mpsc::unbounded_channel();
        let sm = Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            ot_owner: StdMutex::new(None),
            destroy_tx,
            ot_release_tx,
            ot,
            tag_verification,
            tag_signer,
            pool,
            keys,
        });
        tokio::spawn(sm.clone().monitor_sessions());
        tokio::spawn(sm.clone().monitor_destroy(destroy_rx));
        tokio::spawn(sm.clone().monitor_ot_release(ot_release_rx));
        sm
    }

    /// Creates a new session. Refused while another session owns the OT
    /// coordinator or the sid is already taken; ownership is acquired here
    /// and released on commitHash or destroy.
    pub async fn add_session(&self, sid: &str) -> Result<Vec<u8>, NotaryServerError> {
        if self.sessions.read().await.contains_key(sid) {
            warn!("cannot create session {sid}: it already exists");
            return Err(NotaryServerError::OtBusy);
        }
        {
            let mut owner = self.ot_owner.lock().expect("ot owner lock");
            if owner.is_some() {
                warn!("cannot create session {sid}: OT is busy");
                return Err(NotaryServerError::OtBusy);
            }
            *owner = Some(sid.to_string());
        }

        let (signing_key, key_data) = match self.keys.issue_session_key() {
            Ok(pair) => pair,
            Err(e) => {
                *self.ot_owner.lock().expect("ot owner lock") = None;
                return Err(e.into());
            }
        };
        let session = self.build_session(sid, signing_key);
        let now = unix_now();
        let entry = Arc::new(SessionEntry {
            session: Mutex::new(session),
            last_seen: AtomicI64::new(now),
            created: now,
        });
        self.sessions
            .write()
            .await
            .insert(sid.to_string(), entry);

        // wait for the OT peer in the background; a listener failure tears
        // the session down
        let ot = self.ot.clone();
        let destroy = self.destroy_tx.clone();
        let owner = sid.to_string();
        tokio::spawn(async move {
            if let Err(e) = ot.listen().await {
                error!("OT listen failed for {owner}: {e}");
                let _ = destroy.send(owner);
                return;
            }
            info!("new OT owner: {owner}");
        });

        Ok(key_data)
    }

    fn build_session(&self, sid: &str, signing_key: SigningKey) -> Session {
        Session::new(
            sid.to_string(),
            signing_key,
            self.ot.clone(),
            self.pool.clone(),
            self.tag_verification.clone(),
            self.tag_signer.clone(),
            self.destroy_tx.clone(),
            self.ot_release_tx.clone(),
        )
    }

    /// Looks up a session and refreshes its last-seen time.
    pub async fn get_session(&self, sid: &str) -> Option<Arc<SessionEntry>> {
        let entry = self.sessions.read().await.get(sid).cloned()?;
        entry.last_seen.store(unix_now(), Ordering::Relaxed);
        Some(entry)
    }

    /// Signals that a session must be destroyed (fire-and-forget).
    pub fn signal_destroy(&self, sid: &str) {
        let _ = self.destroy_tx.send(sid.to_string());
    }

    /// Signals that a session released the OT coordinator.
    pub fn signal_ot_release(&self, sid: &str) {
        let _ = self.ot_release_tx.send(sid.to_string());
    }

    /// Removes the session and every file it owns.
    async fn remove_session(&self, sid: &str) {
        let owned_ot = {
            let mut owner = self.ot_owner.lock().expect("ot owner lock");
            if owner.as_deref() == Some(sid) {
                *owner = None;
                true
            } else {
                false
            }
        };
        if owned_ot {
            // drop the connection so the next session can listen
            self.ot.disconnect().await;
        }
        let Some(entry) = self.sessions.write().await.remove(sid) else {
            warn!("cannot remove session {sid}: it does not exist");
            return;
        };

        let (storage_dir, tt_paths) = entry.session.lock().await.cleanup_paths();
        if let Some(dir) = storage_dir {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!("error while removing session {sid} storage: {e}");
            }
        }
        for path in tt_paths {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("error while removing session {sid} truth table: {e}");
            }
        }
        info!("removed session {sid}");
    }

    /// Reaps sessions which have been inactive or alive for too long.
    async fn monitor_sessions(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tick.tick().await;
            let now = unix_now();
            let stale: Vec<String> = self
                .sessions
                .read()
                .await
                .iter()
                .filter(|(_, entry)| {
                    now - entry.last_seen.load(Ordering::Relaxed) > STALE_INACTIVE_SECS
                        || now - entry.created > STALE_TOTAL_SECS
                })
                .map(|(sid, _)| sid.clone())
                .collect();
            for sid in stale {
                info!("will remove stale session {sid}");
                self.remove_session(&sid).await;
            }
        }
    }

    async fn monitor_destroy(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(sid) = rx.recv().await {
            info!("destroy signal for sid {sid}");
            self.remove_session(&sid).await;
        }
    }

    async fn monitor_ot_release(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(sid) = rx.recv().await {
            let mut owner = self.ot_owner.lock().expect("ot owner lock");
            if owner.as_deref() == Some(sid.as_str()) {
                *owner = None;
                info!("OT released by sid {sid}");
            }
        }
    }

    /// Destroys every session at shutdown.
    pub async fn cleanup(&self) {
        let sids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for sid in sids {
            self.remove_session(&sid).await;
        }
        self.ot.finish().await;
    }

    #[cfg(test)]
    pub fn ot_owner(&self) -> Option<String> {
        self.ot_owner.lock().expect("ot owner lock").clone()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
