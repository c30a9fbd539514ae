//! Watch command implementation.

use crate::context::Context;
use kbsync_engine::{SchedulerStatus, SyncScheduler};
use tokio::runtime::Runtime;
use tracing::{info, warn};

/// Runs the scheduler until Ctrl-C.
pub fn run(context: &Context) -> Result<(), Box<dyn std::error::Error>> {
    // The blocking HTTP client must be built and dropped outside the runtime.
    let session = context.session()?;
    if !session.settings.enabled {
        return Err("sync is disabled in the configuration".into());
    }
    let config = session.settings.to_scheduler_config();
    let engine = session.engine.clone();

    let runtime = Runtime::new()?;
    runtime.block_on(async move {
        let scheduler = SyncScheduler::new(engine, config);
        let mut states = scheduler.subscribe();
        scheduler.start()?;
        println!("Watching; press Ctrl-C to stop.");

        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!(error = %e, "could not listen for Ctrl-C");
                    }
                    break;
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = states.borrow_and_update().clone();
                    report(&state);
                }
            }
        }

        scheduler.stop();
        info!("scheduler stopped");
        Ok::<_, Box<dyn std::error::Error>>(())
    })?;

    drop(runtime);
    drop(session);
    Ok(())
}

fn report(state: &kbsync_engine::SchedulerState) {
    match state.status {
        SchedulerStatus::Syncing => {
            if let Some(progress) = &state.progress {
                println!("… {}: {}", progress.phase, progress.message);
            }
        }
        SchedulerStatus::Idle | SchedulerStatus::Error => {
            if let Some(result) = &state.last_sync_result {
                let mark = if result.success { "✓" } else { "✗" };
                println!(
                    "{mark} pushed {}, pulled {}, conflicts {}, errors {}",
                    result.pushed,
                    result.pulled,
                    result.conflicts,
                    result.errors.len()
                );
            }
        }
        SchedulerStatus::Offline => println!("Backend offline, waiting"),
    }
}
