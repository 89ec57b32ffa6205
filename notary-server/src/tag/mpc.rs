//! Launchers for the external AES-GCM MPC server processes.
//!
//! The encrypted-IV and Powers-of-H MPCs each occupy four consecutive TCP
//! ports and are driven by helper binaries bundled with the deployment.
//! Each helper prints the resulting mask on stdout and exits.

use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;

/// A range is free when nothing accepts on any of its four ports.
pub async fn check_port_mpc_range(port: u16) -> bool {
    for p in port..port + 4 {
        let connect = TcpStream::connect(("0.0.0.0", p));
        if let Ok(Ok(conn)) = tokio::time::timeout(Duration::from_secs(1), connect).await {
            drop(conn);
            return false;
        }
    }
    true
}

/// Runs the encrypted-IV MPC server and returns the tag mask.
pub async fn run_encrypted_iv_mpc(
    port: u16,
    circuit_dir: &Path,
    server_key_share: &str,
    iv: &str,
) -> Result<String, std::io::Error> {
    let output = Command::new("aesmpc-iv-server")
        .arg(port.to_string())
        .arg(circuit_dir)
        .arg(server_key_share)
        .arg(iv)
        .output()
        .await?;
    if !output.status.success() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_owned())
}

/// Runs the Powers-of-H MPC server and returns the masked powers.
pub async fn run_powers_of_h_mpc(
    port: u16,
    circuit_dir: &Path,
    server_key_share: &str,
) -> Result<String, std::io::Error> {
    let output = Command::new("aesmpc-poh-server")
        .arg(port.to_string())
        .arg(circuit_dir)
        .arg(server_key_share)
        .output()
        .await?;
    if !output.status.success() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_port_range_detects_listener() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!check_port_mpc_range(port).await);
    }
}
