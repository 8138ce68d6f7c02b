pub mod authenticator;
pub mod ble;
pub mod client;
pub mod config;
pub mod ctap2;
pub mod diagnostics;
pub mod error;
pub mod key;
pub mod operation;
pub mod store;
pub mod tpm;
pub mod up;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

use authenticator::{Authenticator, AuthenticatorSetting};
use client::WebAuthnClient;
use client::types::{
    AttestationConveyancePreference, AuthenticatorSelectionCriteria, PublicKeyCredentialCreationOptions,
    PublicKeyCredentialDescriptor, PublicKeyCredentialParameters, PublicKeyCredentialRequestOptions,
    PublicKeyCredentialRpEntity, PublicKeyCredentialUserEntity, UserVerificationRequirement,
};
use config::{Command, Config};
use ctap2::cose::COSE_ALG_ES256;
use key::{KeySupport, KeySupportChooser, KeyVault, SoftwareKeySupport};
use store::{CredentialStore, SharedStore};

pub use error::{Error, ErrorReason, Result, WebAuthnError};

const MASTER_KEY_FILE: &str = "master.key";
const SEALED_MASTER_KEY_FILE: &str = "master_key.blob";
const CREDENTIALS_DIR: &str = "credentials";
const SOFTWARE_KEYS_DIR: &str = "keys";
const TPM_KEYS_DIR: &str = "tpm-keys";

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Delete every stored credential and key. The master key is kept so a
/// later run can still open an empty store.
pub async fn wipe(cfg: Config) -> anyhow::Result<()> {
    init_tracing(cfg.verbose);
    let data_dir = cfg.data_dir()?;
    for sub in [CREDENTIALS_DIR, SOFTWARE_KEYS_DIR, TPM_KEYS_DIR] {
        let dir = data_dir.join(sub);
        let mut count = 0usize;
        if dir.exists() {
            for entry in std::fs::read_dir(&dir)? {
                std::fs::remove_file(entry?.path())?;
                count += 1;
            }
        }
        println!("Deleted {count} file(s) from {}", dir.display());
    }
    Ok(())
}

pub async fn run(cfg: Config) -> anyhow::Result<()> {
    if matches!(cfg.command, Command::Wipe) {
        return wipe(cfg).await;
    }
    init_tracing(cfg.verbose);
    tracing::info!("Starting fidolink");

    diagnostics::check(&cfg)?;

    let data_dir = cfg.data_dir()?;
    std::fs::create_dir_all(&data_dir)?;

    // Single-instance lock
    let lock_path = data_dir.join("fidolink.lock");
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    let mut instance_lock = fd_lock::RwLock::new(lock_file);
    let _guard = instance_lock
        .try_write()
        .map_err(|_| anyhow::anyhow!("fidolink is already running (lock: {})", lock_path.display()))?;

    let tpm = match &cfg.tpm_device {
        Some(device) => Some(
            tpm::TpmContext::new(device).map_err(|e| anyhow::anyhow!("Failed to initialize TPM: {e}"))?,
        ),
        None => None,
    };

    let master_key = load_or_create_master_key(tpm.as_ref(), &data_dir).await?;
    tracing::info!(sealed = tpm.is_some(), "Master key ready");

    let store = open_store(master_key, &data_dir)?;
    let chooser = key_supports(&cfg, tpm, master_key, &data_dir)?;
    let consent = Arc::new(up::PinentryConsent::new(cfg.pinentry.clone()));
    let setting = AuthenticatorSetting {
        counter_step: cfg.counter_step,
        allow_user_verification: !cfg.no_user_verification,
        ..AuthenticatorSetting::default()
    };
    let authenticator = Authenticator::new(setting, consent, store.clone(), chooser);
    let client = WebAuthnClient::new(authenticator, cfg.origin.clone()).with_timeouts(
        Duration::from_secs(cfg.default_timeout),
        Duration::from_secs(cfg.min_timeout),
        Duration::from_secs(cfg.max_timeout),
    );

    match cfg.command {
        Command::Register {
            rp_id,
            rp_name,
            user_name,
            display_name,
            direct_attestation,
            require_user_verification,
            timeout,
        } => {
            let mut user_id = vec![0u8; 16];
            rand::thread_rng().fill_bytes(&mut user_id);
            let options = PublicKeyCredentialCreationOptions {
                rp: PublicKeyCredentialRpEntity { name: rp_name.unwrap_or_else(|| rp_id.clone()), id: Some(rp_id) },
                user: PublicKeyCredentialUserEntity {
                    id: user_id,
                    display_name: display_name.unwrap_or_else(|| user_name.clone()),
                    name: user_name,
                },
                challenge: random_challenge(),
                pub_key_cred_params: vec![PublicKeyCredentialParameters::public_key(COSE_ALG_ES256)],
                timeout,
                exclude_credentials: Vec::new(),
                authenticator_selection: Some(AuthenticatorSelectionCriteria {
                    user_verification: requirement(require_user_verification),
                    ..AuthenticatorSelectionCriteria::default()
                }),
                attestation: if direct_attestation {
                    AttestationConveyancePreference::Direct
                } else {
                    AttestationConveyancePreference::None
                },
            };
            let credential = client.create(options).await?;
            println!("{}", serde_json::to_string_pretty(&credential)?);
        }
        Command::Authenticate { rp_id, credentials, require_user_verification, timeout } => {
            let allow_credentials = credentials
                .iter()
                .map(|id| {
                    URL_SAFE_NO_PAD
                        .decode(id)
                        .map(PublicKeyCredentialDescriptor::new)
                        .map_err(|e| anyhow::anyhow!("invalid credential id {id}: {e}"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            let options = PublicKeyCredentialRequestOptions {
                challenge: random_challenge(),
                timeout,
                rp_id: Some(rp_id),
                allow_credentials,
                user_verification: requirement(require_user_verification),
            };
            let assertion = client.get(options).await?;
            println!("{}", serde_json::to_string_pretty(&assertion)?);
        }
        Command::List { rp_id } => {
            let store = lock(&store);
            for source in store.load_all(&rp_id) {
                let entry = serde_json::json!({
                    "id": URL_SAFE_NO_PAD.encode(&source.id),
                    "user": source.other_ui,
                    "userHandle": URL_SAFE_NO_PAD.encode(&source.user_handle),
                    "signCount": source.sign_count,
                    "createdAt": source.created_at,
                });
                println!("{entry}");
            }
        }
        Command::Wipe => {}
    }
    Ok(())
}

fn requirement(required: bool) -> UserVerificationRequirement {
    if required {
        UserVerificationRequirement::Required
    } else {
        UserVerificationRequirement::Discouraged
    }
}

fn random_challenge() -> Vec<u8> {
    let mut challenge = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

fn open_store(master_key: [u8; 32], data_dir: &Path) -> Result<SharedStore> {
    let creds_dir = data_dir.join(CREDENTIALS_DIR);
    std::fs::create_dir_all(&creds_dir)?;
    let store = CredentialStore::load(master_key, creds_dir)?;
    tracing::info!(count = store.credential_count(), "Credential store loaded");
    Ok(store::shared(store))
}

/// TPM-backed keys first when a TPM is configured, software keys after.
fn key_supports(
    cfg: &Config,
    tpm: Option<tpm::TpmContext>,
    master_key: [u8; 32],
    data_dir: &Path,
) -> Result<KeySupportChooser> {
    let mut supports: Vec<Arc<dyn KeySupport>> = Vec::new();
    if let Some(tpm) = tpm {
        let blobs = KeyVault::open(master_key, data_dir.join(TPM_KEYS_DIR))?;
        let mut support = tpm::TpmKeySupport::new(tpm, blobs);
        if let Some(cert) = &cfg.attestation_cert {
            support = support.with_certificate_chain(vec![std::fs::read(cert)?]);
        }
        supports.push(Arc::new(support));
    }
    let vault = KeyVault::open(master_key, data_dir.join(SOFTWARE_KEYS_DIR))?;
    supports.push(Arc::new(SoftwareKeySupport::new(vault)));
    Ok(KeySupportChooser::new(supports))
}

async fn load_or_create_master_key(tpm: Option<&tpm::TpmContext>, data_dir: &Path) -> Result<[u8; 32]> {
    match tpm {
        Some(tpm) => load_or_seal_master_key(tpm.clone(), data_dir.join(SEALED_MASTER_KEY_FILE)).await,
        None => load_or_create_plain_master_key(&data_dir.join(MASTER_KEY_FILE)),
    }
}

async fn load_or_seal_master_key(tpm: tpm::TpmContext, path: PathBuf) -> Result<[u8; 32]> {
    let join = tokio::task::spawn_blocking(move || -> Result<[u8; 32]> {
        if path.exists() {
            let blob = tpm::keys::KeyBlob::from_bytes(&std::fs::read(&path)?)?;
            return Ok(tpm.with_ctx(|ctx, primary| tpm::seal::unseal_master_key(ctx, primary, &blob))?);
        }
        let (blob, key) = tpm.with_ctx(tpm::seal::seal_master_key)?;
        std::fs::write(&path, blob.to_bytes())?;
        Ok(key)
    });
    join.await.map_err(|e| Error::Internal(format!("master key task failed: {e}")))?
}

fn load_or_create_plain_master_key(path: &Path) -> Result<[u8; 32]> {
    if path.exists() {
        let bytes = std::fs::read(path)?;
        return bytes
            .try_into()
            .map_err(|_| Error::Internal(format!("{} is not a 32-byte key", path.display())));
    }
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    write_private(path, &key)?;
    tracing::warn!(path = %path.display(), "Created unsealed master key; configure a TPM to seal it");
    Ok(key)
}

fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_master_key_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MASTER_KEY_FILE);
        let first = load_or_create_plain_master_key(&path).unwrap();
        let second = load_or_create_plain_master_key(&path).unwrap();
        assert_eq!(first, second, "second load must read the stored key");
    }

    #[test]
    fn test_plain_master_key_rejects_wrong_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MASTER_KEY_FILE);
        std::fs::write(&path, [1u8; 7]).unwrap();
        assert!(matches!(load_or_create_plain_master_key(&path), Err(Error::Internal(_))));
    }

    #[test]
    fn test_lock_survives_poison() {
        let m = Arc::new(Mutex::new(1));
        let m2 = m.clone();
        let _ = std::thread::spawn(move || {
            let _g = m2.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert_eq!(*lock(&m), 1);
    }
}
