//! Hookwire Audit Verifier - checks a persisted audit log end to end.
//!
//! Usage: `hookwire-verify [path/to/audit.jsonl]`. Without an argument the
//! log is read from `$DATA_DIR/audit.jsonl`.
//!
//! Exits non-zero when the chain is broken so that automation depending on
//! audit completeness stops instead of carrying on.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hookwire::audit::AuditLog;
use hookwire::storage::AUDIT_FILE;
use hookwire::{Config, RelayError};

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    let path = match std::env::args_os().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => match Config::from_env().data_dir {
            Some(dir) => dir.join(AUDIT_FILE),
            None => bail!("no audit log path given and DATA_DIR is not set"),
        },
    };

    if !path.exists() {
        bail!("audit log {} does not exist", path.display());
    }

    let log = AuditLog::open(&path)
        .with_context(|| format!("Failed to read audit log {}", path.display()))?;

    match log.verify_chain() {
        Ok(entries) => {
            info!(path = %path.display(), entries, "audit_chain_ok");
            Ok(())
        }
        Err(RelayError::ChainIntegrity { sequence_no, reason }) => {
            error!(
                path = %path.display(),
                sequence_no,
                reason = %reason,
                "audit_chain_integrity_failure"
            );
            bail!("audit chain broken at sequence {sequence_no}: {reason}")
        }
        Err(e) => Err(e).context("Audit verification failed"),
    }
}
