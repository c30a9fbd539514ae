//! Sync command implementation.

use crate::context::Context;
use kbsync_engine::SyncCycleResult;
use kbsync_protocol::ConflictResolution;
use serde::Serialize;

/// Machine-readable session summary.
#[derive(Debug, Serialize)]
pub struct SyncReport {
    /// Whether the session finished without errors.
    pub success: bool,
    /// Items uploaded.
    pub pushed: usize,
    /// Remote changes applied.
    pub pulled: usize,
    /// Conflicts encountered.
    pub conflicts: usize,
    /// Conflict copies created, by original item id.
    pub conflict_copies: Vec<(String, String)>,
    /// Errors, fatal and per-item.
    pub errors: Vec<String>,
    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl From<&SyncCycleResult> for SyncReport {
    fn from(result: &SyncCycleResult) -> Self {
        Self {
            success: result.success,
            pushed: result.pushed,
            pulled: result.pulled,
            conflicts: result.conflicts,
            conflict_copies: result
                .resolved_conflicts
                .iter()
                .filter_map(|conflict| match &conflict.resolution {
                    ConflictResolution::CopiedLocal { copy_id } => {
                        Some((conflict.item_id.clone(), copy_id.clone()))
                    }
                    _ => None,
                })
                .collect(),
            errors: result.errors.clone(),
            duration_ms: result.duration.as_millis() as u64,
        }
    }
}

/// Runs one sync session.
pub fn run(context: &Context, full: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let session = context.session()?;
    if !session.settings.enabled {
        return Err("sync is disabled in the configuration".into());
    }

    if full {
        let queued = session.engine.force_full_sync()?;
        println!("Queued {queued} items for a full sync");
    }

    let result = session.engine.sync();
    let report = SyncReport::from(&result);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text_output(&report),
    }

    if !report.success {
        return Err(format!("sync finished with {} error(s)", report.errors.len()).into());
    }
    Ok(())
}

fn print_text_output(report: &SyncReport) {
    if report.success {
        println!("✓ Sync complete in {} ms", report.duration_ms);
    } else {
        println!("✗ Sync failed after {} ms", report.duration_ms);
    }
    println!("  Pushed:    {}", report.pushed);
    println!("  Pulled:    {}", report.pulled);
    println!("  Conflicts: {}", report.conflicts);
    for (original, copy) in &report.conflict_copies {
        println!("    {original} -> kept local edit as {copy}");
    }
    for error in &report.errors {
        println!("  Error: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbsync_protocol::Conflict;
    use std::time::Duration;

    #[test]
    fn report_lists_conflict_copies() {
        let result = SyncCycleResult {
            success: true,
            pushed: 2,
            conflicts: 2,
            resolved_conflicts: vec![
                Conflict::new(
                    "n1",
                    "note",
                    "l",
                    "r",
                    ConflictResolution::CopiedLocal {
                        copy_id: "n1-copy".into(),
                    },
                ),
                Conflict::new("n2", "note", "l", "r", ConflictResolution::AcceptedRemote),
            ],
            duration: Duration::from_millis(12),
            ..SyncCycleResult::default()
        };

        let report = SyncReport::from(&result);
        assert_eq!(report.conflict_copies, [("n1".to_string(), "n1-copy".to_string())]);
        assert_eq!(report.duration_ms, 12);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["pushed"], 2);
    }
}
