//! Init command implementation.

use crate::context::Context;
use kbsync_engine::{BackendSettings, SyncSettings};

/// Writes a default configuration and creates the device id.
pub fn run(context: &Context, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = context.config_path();
    if path.exists() && !force {
        return Err(format!("{} already exists (use --force to overwrite)", path.display()).into());
    }

    let settings = SyncSettings {
        backend: Some(BackendSettings::Webdav {
            url: "https://dav.example.com/remote.php/dav".into(),
            username: String::new(),
            password: String::new(),
            base_path: "/kbsync".into(),
        }),
        ..SyncSettings::default()
    };
    context.save_settings(&settings)?;
    let device_id = context.device_id()?;

    println!("✓ Wrote {}", path.display());
    println!("  Device: {device_id}");
    println!("  Edit the [backend] section, then run `kbsync sync`.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let context = Context::new(dir.path().join("kbsync.toml"), dir.path().join("data"));

        run(&context, false).unwrap();
        assert!(run(&context, false).is_err());
        run(&context, true).unwrap();

        let settings = context.load_settings().unwrap();
        assert!(matches!(settings.backend, Some(BackendSettings::Webdav { .. })));
        assert_eq!(settings.sync_interval_minutes, 5);
        assert!(dir.path().join("data/device_id").exists());
    }
}
