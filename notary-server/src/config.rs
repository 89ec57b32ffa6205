use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "notary-server")]
pub struct CliFields {
    /// Must be set when not running in a sandboxed environment.
    #[structopt(long)]
    pub no_sandbox: bool,
}

/// Runtime properties of the notary server. Everything except the sandbox
/// flag is fixed by the deployment layout.
#[derive(Debug, Clone)]
pub struct NotaryServerProperties {
    pub no_sandbox: bool,
    /// Main listener, serving clients.
    pub host: String,
    pub port: u16,
    /// Admin listener for the URL-fetcher document upload.
    pub admin_port: u16,
    /// Port the Softspoken-OT endpoint listens on.
    pub ot_port: u16,
    /// First of four consecutive ports of the encrypted-IV MPC.
    pub iv_port_begin: u16,
    /// First of four consecutive ports of the Powers-of-H MPC.
    pub poh_port_begin: u16,
    pub circuits_dir: PathBuf,
    pub tag_circuits_dir: PathBuf,
    pub zkey_dir: PathBuf,
    pub signing_key_path: PathBuf,
    pub pool_dir: PathBuf,
}

impl NotaryServerProperties {
    pub fn new(cli: &CliFields) -> Self {
        Self {
            no_sandbox: cli.no_sandbox,
            host: "0.0.0.0".to_string(),
            port: 10011,
            admin_port: 10012,
            ot_port: 12345,
            iv_port_begin: 10020,
            poh_port_begin: 10030,
            circuits_dir: PathBuf::from("circuits"),
            tag_circuits_dir: PathBuf::from("tagCircuits"),
            zkey_dir: PathBuf::from("zkey-content"),
            signing_key_path: PathBuf::from("signing.key"),
            pool_dir: PathBuf::from("garbled-pool"),
        }
    }
}

impl Default for NotaryServerProperties {
    fn default() -> Self {
        Self::new(&CliFields { no_sandbox: false })
    }
}
