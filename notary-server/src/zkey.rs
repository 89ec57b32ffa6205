//! ZK proving/verifying key pairs served to clients.
//!
//! Keys live on disk as `<N>.zkey` (proving) and `<N>.json` (verifying)
//! where N is the AES block count the pair supports. Only complete pairs
//! are loaded. `/zkey` replies are streamed in 8 KiB chunks.

use axum::body::StreamBody;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use eyre::Result;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::Path;
use std::time::SystemTime;
use tracing::{info, warn};

const CHUNK_SIZE: usize = 8192;

pub struct ZkeyHandler {
    proving_keys: HashMap<usize, Vec<u8>>,
    verifying_keys: HashMap<usize, Vec<u8>>,
    last_modified: SystemTime,
}

#[derive(Serialize)]
struct SupportedBlockSizes {
    sizes: Vec<usize>,
}

#[derive(Serialize)]
struct GetKeysResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pk: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vk: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ZkeyHandler {
    pub fn new(zkey_dir: &Path) -> Result<Self> {
        let keys_re = Regex::new(r"^[1-9][0-9]*\.(zkey|json)$")?;

        // count names: a size is loadable once both its zkey and json exist
        let mut key_counter: HashMap<usize, usize> = HashMap::new();
        for entry in std::fs::read_dir(zkey_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if keys_re.is_match(&name) {
                let stem = name.split('.').next().unwrap();
                if let Ok(size) = stem.parse::<usize>() {
                    *key_counter.entry(size).or_insert(0) += 1;
                }
            }
        }

        let mut proving_keys = HashMap::new();
        let mut verifying_keys = HashMap::new();
        for (size, count) in key_counter {
            if count != 2 {
                continue;
            }
            info!("Loading ZK key pair for {size} AES blocks");
            let pkey = match std::fs::read(zkey_dir.join(format!("{size}.zkey"))) {
                Ok(k) => k,
                Err(e) => {
                    warn!("Failed to read {size}.zkey, skipping. Reason: {e}");
                    continue;
                }
            };
            let vkey = match std::fs::read(zkey_dir.join(format!("{size}.json"))) {
                Ok(k) => k,
                Err(e) => {
                    warn!("Failed to read {size}.json, skipping. Reason: {e}");
                    continue;
                }
            };
            proving_keys.insert(size, pkey);
            verifying_keys.insert(size, vkey);
        }
        info!("Loaded {} ZK key pairs", proving_keys.len());

        Ok(Self {
            proving_keys,
            verifying_keys,
            last_modified: SystemTime::now(),
        })
    }

    pub fn supported_block_sizes(&self) -> Response {
        let sizes: Vec<usize> = self.proving_keys.keys().copied().collect();
        Json(SupportedBlockSizes { sizes }).into_response()
    }

    pub fn get_keys(&self, size_param: Option<&str>) -> Response {
        let Some(size_str) = size_param else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        let Ok(size) = size_str.parse::<usize>() else {
            return StatusCode::BAD_REQUEST.into_response();
        };

        let (Some(pkey), Some(vkey)) =
            (self.proving_keys.get(&size), self.verifying_keys.get(&size))
        else {
            let body = serde_json::to_vec(&GetKeysResponse {
                pk: None,
                vk: None,
                size: None,
                error: Some(format!("no keys of size {size}")),
            })
            .unwrap_or_default();
            return (
                StatusCode::NOT_FOUND,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response();
        };

        let body = match serde_json::to_vec(&GetKeysResponse {
            pk: Some(pkey.clone()),
            vk: Some(vkey.clone()),
            size: Some(size),
            error: None,
        }) {
            Ok(b) => b,
            Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        };

        let content_length = body.len();
        let chunks: Vec<Result<Vec<u8>, Infallible>> = body
            .chunks(CHUNK_SIZE)
            .map(|c| Ok(c.to_vec()))
            .collect();
        let stream = futures::stream::iter(chunks);

        let mut response = StreamBody::new(stream).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
        if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(self.last_modified)) {
            headers.insert(header::LAST_MODIFIED, value);
        }
        if let Ok(value) =
            HeaderValue::from_str(&format!("attachment; filename=\"zkey-{size}.json\""))
        {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
        if let Ok(value) = HeaderValue::from_str(&content_length.to_string()) {
            headers.insert("x-content-length", value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loads_only_complete_pairs() {
        let dir = std::env::temp_dir().join(format!("zkey-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("1.zkey"), b"pk1").unwrap();
        std::fs::write(dir.join("1.json"), b"vk1").unwrap();
        std::fs::write(dir.join("5.zkey"), b"pk5").unwrap();
        std::fs::write(dir.join("notakey.json"), b"x").unwrap();

        let handler = ZkeyHandler::new(&dir).unwrap();
        assert_eq!(handler.proving_keys.len(), 1);
        assert!(handler.proving_keys.contains_key(&1));
        assert!(!handler.proving_keys.contains_key(&5));

        std::fs::remove_dir_all(&dir).unwrap();
    }

}
