use crate::config::Config;

pub fn check(cfg: &Config) -> anyhow::Result<()> {
    let mut errors: Vec<String> = Vec::new();

    // Check 1: pinentry binary found
    if let Err(e) = std::process::Command::new(&cfg.pinentry).arg("--version").output() {
        errors.push(format!(
            "pinentry binary not found: '{}': {e}\n  \
             → install pinentry or pass --pinentry /path/to/pinentry",
            cfg.pinentry
        ));
    }

    // Check 2: TPM device readable, when one is configured
    if let Some(device) = cfg.tpm_device.as_deref().filter(|d| !d.contains(':')) {
        if let Err(e) = std::fs::OpenOptions::new().read(true).open(device) {
            errors.push(format!(
                "cannot open {device}: {e}\n  \
                 → add yourself to the 'tss' group: sudo usermod -aG tss $USER"
            ));
        }
    }

    // Check 3: attestation certificate readable and only used with a TPM
    if let Some(cert) = &cfg.attestation_cert {
        if cfg.tpm_device.is_none() {
            errors.push("--attestation-cert requires --tpm-device".to_string());
        }
        match std::fs::metadata(cert) {
            Ok(meta) if meta.len() > 0 => {}
            Ok(_) => errors.push(format!("attestation certificate {} is empty", cert.display())),
            Err(e) => errors.push(format!("cannot read {}: {e}", cert.display())),
        }
    }

    // Check 4: timeout bounds
    if cfg.min_timeout > cfg.max_timeout {
        errors.push(format!(
            "--min-timeout ({}) is larger than --max-timeout ({})",
            cfg.min_timeout, cfg.max_timeout
        ));
    }

    if errors.is_empty() {
        return Ok(());
    }

    for err in &errors {
        eprintln!("ERROR: {err}");
    }
    anyhow::bail!("{} preflight check(s) failed", errors.len());
}
