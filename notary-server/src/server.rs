//! The HTTP surface of the notary.
//!
//! One multiplexer serves every session command plus the auxiliary
//! endpoints; session commands are `/<command>?<sid>` with
//! `application/octet-stream` bodies. All responses carry permissive CORS
//! headers. A second, admin-only listener accepts the URL-fetcher document
//! once per process run.

use axum::body::StreamBody;
use axum::extract::{BodyStream, Query, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use eyre::{eyre, WrapErr};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, RwLock};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info};

use crate::config::NotaryServerProperties;
use crate::error::NotaryServerError;
use crate::keys::KeyManager;
use crate::ot::OtManager;
use crate::pool::GarbledPool;
use crate::session::{COMMANDS, MAX_BLOB_SIZE};
use crate::session_manager::SessionManager;
use crate::tag::{TagSigningManager, TagVerificationManager};
use crate::zkey::ZkeyHandler;
use notary_core::circuit::CircuitMeta;

/// Global state threaded through every handler, constructed once at
/// process start.
#[derive(Clone)]
pub struct NotaryGlobals {
    pub sm: Arc<SessionManager>,
    pub zkey: Arc<ZkeyHandler>,
    pub keys: Arc<KeyManager>,
    pub tag_signer: Arc<TagSigningManager>,
    pub url_fetcher_doc: Arc<RwLock<Vec<u8>>>,
}

/// Starts the notary. Blocks until SIGINT/SIGTERM, then drains HTTP for up
/// to five seconds and destroys all sessions.
pub async fn run_server(config: &NotaryServerProperties) -> Result<(), NotaryServerError> {
    check_tag_verification_circuits(&config.tag_circuits_dir)?;
    let tag_signer = Arc::new(TagSigningManager::new(&config.signing_key_path)?);
    let keys = Arc::new(KeyManager::new()?);

    let ot = Arc::new(
        OtManager::bind(&config.host, config.ot_port)
            .await
            .map_err(|e| eyre!("failed to bind the OT port: {e}"))?,
    );

    assemble_circuits(&config.circuits_dir)?;
    let circuits = CircuitMeta::load_all(&config.circuits_dir)
        .map_err(|e| eyre!("failed to load circuits: {e}"))?;
    let pool = GarbledPool::new(circuits, config.pool_dir.clone(), config.no_sandbox)
        .map_err(|e| eyre!("failed to start the garbled pool: {e}"))?;

    let tag_verification = Arc::new(TagVerificationManager::new(
        config.tag_circuits_dir.clone(),
        config.iv_port_begin,
        config.poh_port_begin,
    ));
    let zkey = Arc::new(ZkeyHandler::new(&config.zkey_dir)?);

    let sm = SessionManager::new(ot, tag_verification, tag_signer.clone(), pool, keys.clone());

    let globals = NotaryGlobals {
        sm: sm.clone(),
        zkey,
        keys,
        tag_signer,
        url_fetcher_doc: Arc::new(RwLock::new(Vec::new())),
    };

    if !config.no_sandbox {
        tokio::spawn(await_url_fetcher_doc(
            globals.url_fetcher_doc.clone(),
            config.admin_port,
        ));
    }

    let router = build_router(globals, config.no_sandbox);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| eyre!("failed to parse the listen address: {e}"))?;
    info!("Listening on {addr}");

    axum::Server::try_bind(&addr)
        .map_err(|e| eyre!("failed to bind the listener: {e}"))?
        .http1_header_read_timeout(Duration::from_secs(60))
        .serve(router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| eyre!("server error: {e}"))?;

    info!("exiting...");
    sm.cleanup().await;
    Ok(())
}

/// Builds the multiplexer. The URL-fetcher document endpoint only exists in
/// sandboxed mode; getPubKey stays available for debugging either way.
pub fn build_router(globals: NotaryGlobals, no_sandbox: bool) -> Router {
    let mut router = Router::new()
        .route("/ping", any(ping))
        .route("/getPubKey", any(get_pub_key))
        .route("/getBlob", any(get_blob))
        .route("/setBlob", any(set_blob))
        .route("/zkey_sizes", get(zkey_sizes))
        .route("/zkey", get(zkey_keys))
        .route("/signing-key.pem", get(serve_signing_key));
    if !no_sandbox {
        router = router.route("/getURLFetcherDoc", any(get_url_fetcher_doc));
    }
    router
        // every other request ends up in the session dispatcher
        .fallback(session_command)
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(300)))
        .with_state(globals)
}

fn octet_response(body: Vec<u8>) -> Response {
    debug!("wrote response of size: {}", body.len());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response()
}

async fn ping() -> Response {
    octet_response(Vec::new())
}

async fn get_pub_key(State(globals): State<NotaryGlobals>) -> Response {
    octet_response(globals.keys.master_pub_key_pem().to_vec())
}

async fn get_url_fetcher_doc(State(globals): State<NotaryGlobals>) -> Response {
    octet_response(globals.url_fetcher_doc.read().await.clone())
}

async fn zkey_sizes(State(globals): State<NotaryGlobals>) -> Response {
    globals.zkey.supported_block_sizes()
}

async fn zkey_keys(
    State(globals): State<NotaryGlobals>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    globals.zkey.get_keys(params.get("size").map(|s| s.as_str()))
}

async fn serve_signing_key(State(globals): State<NotaryGlobals>) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-pem-file".to_string()),
            (
                header::LAST_MODIFIED,
                httpdate::fmt_http_date(globals.tag_signer.last_modified()),
            ),
        ],
        globals.tag_signer.public_key_pem().to_vec(),
    )
        .into_response()
}

/// Dispatches a session command by path, routed by sid. `init` creates the
/// session (409 while the OT is owned elsewhere) and prepends the session
/// public key to the reply. A failing step destroys the session.
async fn session_command(
    State(globals): State<NotaryGlobals>,
    uri: Uri,
    body: axum::body::Bytes,
) -> Response {
    let command = uri.path().trim_start_matches('/').to_string();
    let sid = uri.query().unwrap_or("").to_string();

    if !COMMANDS.contains(&command.as_str()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if sid.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    debug!("got request {command} for session {sid}");

    let mut prefix = Vec::new();
    if command == "init" {
        match globals.sm.add_session(&sid).await {
            Ok(key_data) => prefix = key_data,
            Err(e) => return e.into_response(),
        }
    }

    let Some(entry) = globals.sm.get_session(&sid).await else {
        return NotaryServerError::SessionNotFound(sid).into_response();
    };

    let result = {
        let mut session = entry.session.lock().await;
        session.handle(&command, &body).await
    };

    match result {
        Ok(out) => {
            if command == "tagVerification" {
                // the final message of the session
                globals.sm.signal_destroy(&sid);
                globals.sm.signal_ot_release(&sid);
            }
            let mut reply = prefix;
            reply.extend(out);
            octet_response(reply)
        }
        Err(e) => {
            error!("session {sid} failed on {command}: {e}");
            globals.sm.signal_destroy(&sid);
            globals.sm.signal_ot_release(&sid);
            NotaryServerError::Session(e).into_response()
        }
    }
}

/// Streams the notary's truth tables straight from the pool files.
async fn get_blob(State(globals): State<NotaryGlobals>, uri: Uri) -> Response {
    let sid = uri.query().unwrap_or("").to_string();
    debug!("in getBlob for session {sid}");
    let Some(entry) = globals.sm.get_session(&sid).await else {
        return NotaryServerError::SessionNotFound(sid).into_response();
    };
    let paths = {
        let mut session = entry.session.lock().await;
        match session.get_blob() {
            Ok(paths) => paths,
            Err(e) => {
                error!("session {sid} failed on getBlob: {e}");
                globals.sm.signal_destroy(&sid);
                globals.sm.signal_ot_release(&sid);
                return NotaryServerError::Session(e).into_response();
            }
        }
    };

    let stream = futures::stream::iter(paths)
        .then(tokio::fs::File::open)
        .map_ok(ReaderStream::new)
        .try_flatten();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        StreamBody::new(stream),
    )
        .into_response()
}

/// Streams the client's truth-table upload to the session's scratch file.
/// The session lock is held only for the sequence check, so that
/// getUploadProgress can observe the live counter.
async fn set_blob(
    State(globals): State<NotaryGlobals>,
    uri: Uri,
    mut body: BodyStream,
) -> Response {
    let sid = uri.query().unwrap_or("").to_string();
    debug!("in setBlob for session {sid}");
    let Some(entry) = globals.sm.get_session(&sid).await else {
        return NotaryServerError::SessionNotFound(sid).into_response();
    };
    let begun = {
        let mut session = entry.session.lock().await;
        session.begin_set_blob()
    };
    let (path, counter) = match begun {
        Ok(pair) => pair,
        Err(e) => {
            error!("session {sid} failed on setBlob: {e}");
            globals.sm.signal_destroy(&sid);
            globals.sm.signal_ot_release(&sid);
            return NotaryServerError::Session(e).into_response();
        }
    };

    let result: Result<(), NotaryServerError> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
            .map_err(|e| NotaryServerError::Session(e.into()))?;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                NotaryServerError::BadRequest(format!("failed to read upload: {e}"))
            })?;
            let total = counter.fetch_add(chunk.len() as u32, Ordering::Relaxed)
                + chunk.len() as u32;
            if total > MAX_BLOB_SIZE {
                return Err(NotaryServerError::Session(
                    crate::session::SessionError::BlobTooLarge,
                ));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| NotaryServerError::Session(e.into()))?;
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => octet_response(Vec::new()),
        Err(e) => {
            error!("session {sid} failed while uploading blob: {e}");
            globals.sm.signal_destroy(&sid);
            globals.sm.signal_ot_release(&sid);
            e.into_response()
        }
    }
}

/// Admin listener: waits for exactly one URL-fetcher document, then shuts
/// down gracefully.
async fn await_url_fetcher_doc(doc: Arc<RwLock<Vec<u8>>>, admin_port: u16) {
    let (tx, rx) = oneshot::channel::<()>();
    let tx = Arc::new(std::sync::Mutex::new(Some(tx)));

    let router = Router::new().route(
        "/setURLFetcherDoc",
        post(move |body: axum::body::Bytes| {
            let doc = doc.clone();
            let tx = tx.clone();
            async move {
                let preview = String::from_utf8_lossy(&body[..body.len().min(100)]).into_owned();
                *doc.write().await = body.to_vec();
                info!("got URLFetcher doc {preview}");
                if let Some(tx) = tx.lock().expect("signal lock").take() {
                    let _ = tx.send(());
                }
                StatusCode::OK
            }
        }),
    );

    let addr: SocketAddr = match format!("0.0.0.0:{admin_port}").parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("bad admin address: {e}");
            return;
        }
    };
    let shutdown = async move {
        let _ = rx.await;
        // linger so the response gets written
        tokio::time::sleep(Duration::from_secs(5)).await;
    };
    if let Err(e) = axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("admin listener error: {e}");
    }
}

/// Circuits ship as human-readable `.casm`; an external script assembles
/// them into Bristol-fashion `c*.out` files on first run.
fn assemble_circuits(circuits_dir: &Path) -> Result<(), NotaryServerError> {
    if circuits_dir.join("c1.out").exists() {
        return Ok(());
    }
    info!("Assembling circuits. This will take a few seconds...");
    let status = std::process::Command::new("node")
        .arg("assemble.js")
        .current_dir(circuits_dir)
        .status()
        .map_err(|e| {
            eyre!("could not run: node assemble.js. Please make sure that node is installed: {e}")
        })?;
    if !status.success() {
        return Err(eyre!("node assemble.js failed with {status}").into());
    }
    info!("Finished assembling circuits.");
    Ok(())
}

/// All four tag-verification circuits must be present at startup.
fn check_tag_verification_circuits(dir: &Path) -> Result<(), NotaryServerError> {
    for circuit in [
        "aes128_full.txt",
        "gcm_shares_200.txt",
        "xor128.txt",
        "xor25600.txt",
    ] {
        let path = dir.join(circuit);
        std::fs::metadata(&path)
            .wrap_err_with(|| format!("missing tag verification circuit {}", path.display()))?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    // a second signal aborts without draining
    tokio::spawn(async {
        let _ = tokio::signal::ctrl_c().await;
        error!("terminating...");
        std::process::exit(1);
    });
}
