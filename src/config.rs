use std::path::PathBuf;

/// Authenticator model identifier. All zero: the engine never claims a
/// vendor model, which is also what the "none" attestation transform writes.
pub const AAGUID: [u8; 16] = [0u8; 16];

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const MIN_TIMEOUT_SECS: u64 = 15;
pub const MAX_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_COUNTER_STEP: u32 = 1;

/// Smallest ATT payload a BLE central has to accept.
pub const DEFAULT_BLE_FRAGMENT_LEN: usize = 20;
pub const BLE_KEEPALIVE_INTERVAL_MS: u64 = 100;
pub const BLE_OPERATION_TIMEOUT_SECS: u64 = 30;

pub const CONSENT_TIMEOUT_SECS: u64 = 30;

#[derive(clap::Parser, Debug, Clone)]
#[command(name = "fidolink", version, about)]
pub struct Config {
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Where credentials and keys are kept (defaults to the XDG data dir).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
    /// Origin reported in the collected client data.
    #[arg(long, default_value = "https://localhost", global = true)]
    pub origin: String,
    #[arg(long, default_value = "pinentry", global = true)]
    pub pinentry: String,
    /// TPM device; enables hardware-backed keys when present.
    #[arg(long, global = true)]
    pub tpm_device: Option<String>,
    /// DER certificate presented as the attestation chain of hardware keys.
    #[arg(long, global = true)]
    pub attestation_cert: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_COUNTER_STEP, global = true)]
    pub counter_step: u32,
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS, global = true)]
    pub default_timeout: u64,
    #[arg(long, default_value_t = MIN_TIMEOUT_SECS, global = true)]
    pub min_timeout: u64,
    #[arg(long, default_value_t = MAX_TIMEOUT_SECS, global = true)]
    pub max_timeout: u64,
    /// Refuse requests that require user verification.
    #[arg(long, global = true)]
    pub no_user_verification: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Create a credential for a relying party.
    Register {
        #[arg(long)]
        rp_id: String,
        #[arg(long)]
        rp_name: Option<String>,
        #[arg(long)]
        user_name: String,
        #[arg(long)]
        display_name: Option<String>,
        /// Ask for the attestation statement instead of "none".
        #[arg(long)]
        direct_attestation: bool,
        #[arg(long)]
        require_user_verification: bool,
        /// Timeout in seconds, clamped to the configured bounds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Produce an assertion with a stored credential.
    Authenticate {
        #[arg(long)]
        rp_id: String,
        /// Base64url credential id to restrict the assertion to (repeatable).
        #[arg(long = "credential")]
        credentials: Vec<String>,
        #[arg(long)]
        require_user_verification: bool,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List the credentials stored for a relying party.
    List {
        #[arg(long)]
        rp_id: String,
    },
    /// Delete all stored credentials and keys, then exit.
    Wipe,
}

impl Config {
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        Ok(directories::ProjectDirs::from("", "", "fidolink")
            .ok_or_else(|| anyhow::anyhow!("cannot determine XDG data dir"))?
            .data_dir()
            .to_path_buf())
    }
}
