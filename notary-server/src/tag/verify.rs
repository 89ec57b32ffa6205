//! Final tag verification through the bundled Python checker.

use super::TagError;
use regex::Regex;
use sha1::{Digest, Sha1};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::warn;

/// Verifies the AES-GCM tag of the client's request with the precomputed
/// masks. Inputs are validated strictly before anything touches the
/// filesystem; the checker runs with a 60 second hard timeout in a
/// scratch directory derived from the session id.
pub async fn verify_tag(
    id: &str,
    poh_mask: &str,
    tag_mask: &str,
    ciphertext: &[String],
    aad: &str,
    tag_share: &str,
) -> Result<bool, TagError> {
    let poh_mask_re = Regex::new(r"^(?:[01]+\n)+[01]+$").expect("static regex");
    let tag_mask_re = Regex::new(r"^[01]+$").expect("static regex");
    let tag_share_re = Regex::new(r"^-?[0-9]+$").expect("static regex");

    // Powers-of-H mask: lines of 0/1
    if !poh_mask_re.is_match(poh_mask) {
        return Err(TagError::InvalidInput(
            "unexpected Powers of H mask format in tag verification",
        ));
    }
    // IV tag mask: a single 0/1 string
    if !tag_mask_re.is_match(tag_mask) {
        return Err(TagError::InvalidInput(
            "unexpected IV tag mask format in tag verification",
        ));
    }
    // ciphertext: decimal bytes
    for s in ciphertext {
        if s.parse::<u8>().is_err() {
            return Err(TagError::InvalidInput(
                "unexpected value in cipher text array in tag verification",
            ));
        }
    }
    // AAD: hex
    if hex::decode(aad).is_err() {
        return Err(TagError::InvalidInput(
            "unexpected AAD format in tag verification",
        ));
    }
    // tag share: a decimal integer
    if !tag_share_re.is_match(tag_share) {
        return Err(TagError::InvalidInput(
            "unexpected tag share format in tag verification",
        ));
    }

    // scratch directory named after the session id
    let name = hex::encode(Sha1::digest(id.as_bytes()));
    let dir = Path::new(&name).to_path_buf();
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!("tag verification scratch dir: {e}");
        return Err(TagError::Internal);
    }

    let result = run_checker(&dir, poh_mask, tag_mask, ciphertext, aad, tag_share).await;

    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
        warn!("tag verification cleanup: {e}");
    }
    result
}

async fn run_checker(
    dir: &Path,
    poh_mask: &str,
    tag_mask: &str,
    ciphertext: &[String],
    aad: &str,
    tag_share: &str,
) -> Result<bool, TagError> {
    let poh_path = dir.join("poh");
    let eiv_path = dir.join("eiv");
    let ciphertext_path = dir.join("ciphertext");

    let ciphertext_json = serde_json::to_vec(ciphertext).map_err(|_| TagError::Internal)?;
    for (path, content) in [
        (&poh_path, poh_mask.as_bytes().to_vec()),
        (&eiv_path, tag_mask.as_bytes().to_vec()),
        (&ciphertext_path, ciphertext_json),
    ] {
        if let Err(e) = tokio::fs::write(path, content).await {
            warn!("tag verification write: {e}");
            return Err(TagError::Internal);
        }
    }

    let cwd = std::env::current_dir().map_err(|_| TagError::Internal)?;
    let script = cwd.join("src").join("verify_tag.py");

    let output = Command::new("python3")
        .arg(script)
        .arg(&poh_path)
        .arg(&eiv_path)
        .arg(&ciphertext_path)
        .arg(aad)
        .arg(tag_share)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(Duration::from_secs(60), output).await {
        Ok(Ok(output)) => {
            if !output.status.success() {
                warn!(
                    "Tag verification error: {}",
                    String::from_utf8_lossy(&output.stdout)
                );
            }
            Ok(output.status.success())
        }
        Ok(Err(e)) => {
            warn!("Tag verification error: {e}");
            Ok(false)
        }
        Err(_) => {
            warn!("Tag verification timed out");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_malformed_inputs() {
        let ct = vec!["12".to_string(), "200".to_string()];
        // bad PoH mask
        assert!(matches!(
            verify_tag("sid", "01x\n01", "0101", &ct, "00ff", "123").await,
            Err(TagError::InvalidInput(_))
        ));
        // bad tag mask
        assert!(matches!(
            verify_tag("sid", "01\n01", "01b1", &ct, "00ff", "123").await,
            Err(TagError::InvalidInput(_))
        ));
        // bad ciphertext byte
        let bad_ct = vec!["256".to_string()];
        assert!(matches!(
            verify_tag("sid", "01\n01", "0101", &bad_ct, "00ff", "123").await,
            Err(TagError::InvalidInput(_))
        ));
        // bad aad
        assert!(matches!(
            verify_tag("sid", "01\n01", "0101", &ct, "zz", "123").await,
            Err(TagError::InvalidInput(_))
        ));
        // bad tag share
        assert!(matches!(
            verify_tag("sid", "01\n01", "0101", &ct, "00ff", "12a3").await,
            Err(TagError::InvalidInput(_))
        ));
    }
}
