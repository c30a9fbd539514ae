//! Status command implementation.

use crate::context::Context;
use serde::Serialize;

/// Local and remote sync state.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// This device's id.
    pub device_id: String,
    /// Items in the local store, tombstones included.
    pub local_items: usize,
    /// Items waiting to be pushed.
    pub pending_changes: usize,
    /// Whether this device has synced with the backend before.
    pub has_synced: bool,
    /// Whether the backend holds data.
    pub remote_has_data: bool,
    /// Whether a first sync would merge local items into remote data.
    pub would_merge: bool,
    /// Current lock holder, if the lock is held.
    pub lock_owner: Option<String>,
    /// Whether the backend answered the lock check.
    pub reachable: bool,
}

/// Prints pending changes and remote state.
pub fn run(context: &Context, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let session = context.session()?;
    let engine = &session.engine;
    let status = engine.status()?;
    let check = engine.first_sync_check()?;

    let report = StatusReport {
        device_id: engine.device_id(),
        local_items: session.store.len(),
        pending_changes: status.pending_changes,
        has_synced: !check.is_first_sync(),
        remote_has_data: check.remote_has_data,
        would_merge: check.would_merge(),
        lock_owner: status
            .lock
            .as_ref()
            .filter(|lock| lock.locked)
            .and_then(|lock| lock.owner.clone()),
        reachable: status.lock.is_some(),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => {
            println!("Device:          {}", report.device_id);
            println!("Local store:     {}", session.store.path().display());
            println!("Local items:     {}", report.local_items);
            println!("Pending changes: {}", report.pending_changes);
            if !report.reachable {
                println!("Backend:         unreachable");
                return Ok(());
            }
            println!("Synced before:   {}", if report.has_synced { "yes" } else { "no" });
            println!("Remote data:     {}", if report.remote_has_data { "yes" } else { "no" });
            match &report.lock_owner {
                Some(owner) => println!("Lock:            held by {owner}"),
                None => println!("Lock:            free"),
            }
            if report.would_merge {
                println!();
                println!("Note: the first sync will merge local items into existing remote data.");
            }
        }
    }
    Ok(())
}
