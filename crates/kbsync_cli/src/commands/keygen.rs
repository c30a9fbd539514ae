//! Keygen command implementation.

use kbsync_crypto::MasterKey;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Generates a master key and writes it base64-encoded to `out`.
///
/// The file is created owner-readable only where the platform supports it.
pub fn run(out: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let key = MasterKey::generate();
    let fingerprint = key.fingerprint()?;

    let mut options = OpenOptions::new();
    options.write(true);
    if force {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(out)
        .map_err(|e| format!("cannot create {}: {e}", out.display()))?;
    file.write_all(key.to_base64().as_bytes())?;
    file.sync_all()?;
    info!(path = %out.display(), fingerprint = %fingerprint, "generated master key");

    println!("✓ Key written to {}", out.display());
    println!("  Fingerprint: {fingerprint}");
    println!("  Copy this file to every device that shares the encrypted backend.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_loadable_key_once() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("master.key");

        run(&out, false).unwrap();
        let first = std::fs::read_to_string(&out).unwrap();
        assert!(MasterKey::from_base64(first.trim()).is_ok());

        assert!(run(&out, false).is_err());
        run(&out, true).unwrap();
        assert_ne!(std::fs::read_to_string(&out).unwrap(), first);
    }
}
