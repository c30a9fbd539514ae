//! The sync session state machine.

use crate::adapter::StorageAdapter;
use crate::config::SyncConfig;
use crate::conflict::conflict_copy_payload;
use crate::error::{SyncError, SyncResult};
use crate::progress::{SyncPhase, SyncProgress};
use crate::store::LocalStore;
use kbsync_crypto::{content_hash, CryptoEngine};
use kbsync_protocol::{
    now_millis, ChangeRecord, Conflict, ConflictPolicy, ConflictResolution, Item, LockStatus,
    RemoteMeta, SyncCursor, SyncStatus,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Cumulative statistics over the engine's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Sessions that finished without errors.
    pub cycles_completed: u64,
    /// Sessions that recorded at least one error.
    pub cycles_failed: u64,
    /// Items pushed.
    pub items_pushed: u64,
    /// Remote changes applied.
    pub items_pulled: u64,
    /// Conflicts encountered.
    pub conflicts_encountered: u64,
    /// End of the last session, Unix millis.
    pub last_sync_time: Option<i64>,
    /// First error of the last failed session.
    pub last_error: Option<String>,
}

/// Outcome of one session.
///
/// `success` is true only if `errors` is empty; counts reflect partial
/// progress either way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCycleResult {
    /// Whether the session finished without any error.
    pub success: bool,
    /// Items uploaded.
    pub pushed: usize,
    /// Remote changes applied locally.
    pub pulled: usize,
    /// Conflicts encountered.
    pub conflicts: usize,
    /// How each conflict was settled.
    pub resolved_conflicts: Vec<Conflict>,
    /// Human-readable errors, fatal and per-item.
    pub errors: Vec<String>,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Whether the backend already held data written by an earlier session.
    pub remote_has_data: bool,
}

/// Snapshot of engine and backend state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    /// Phase of the current or last session.
    pub phase: SyncPhase,
    /// Items waiting to be pushed.
    pub pending_changes: usize,
    /// Remote lock, if the backend could be read.
    pub lock: Option<LockStatus>,
}

/// Facts for deciding whether a first sync needs user confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirstSyncCheck {
    /// This device has consumed the remote change log before.
    pub has_local_cursor: bool,
    /// The backend holds data written by some device.
    pub remote_has_data: bool,
    /// Local items waiting to be pushed.
    pub pending_local: usize,
}

impl FirstSyncCheck {
    /// Returns true if this device has never synced with the backend.
    pub fn is_first_sync(&self) -> bool {
        !self.has_local_cursor
    }

    /// Returns true if a first sync would merge local items into
    /// existing remote data.
    pub fn would_merge(&self) -> bool {
        self.is_first_sync() && self.remote_has_data && self.pending_local > 0
    }
}

/// Clears the running flag when a session ends, even by panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Replicates a [`LocalStore`] against a [`StorageAdapter`].
///
/// One call to [`sync`](Self::sync) runs one complete session. Sessions
/// on the same engine never overlap; items are processed strictly in
/// order.
pub struct SyncEngine {
    config: RwLock<SyncConfig>,
    adapter: Arc<dyn StorageAdapter>,
    store: Arc<dyn LocalStore>,
    crypto: Arc<CryptoEngine>,
    phase: RwLock<SyncPhase>,
    stats: RwLock<SyncStats>,
    progress: RwLock<Option<mpsc::Sender<SyncProgress>>>,
    running: AtomicBool,
}

impl SyncEngine {
    /// Creates an engine.
    pub fn new(
        config: SyncConfig,
        adapter: Arc<dyn StorageAdapter>,
        store: Arc<dyn LocalStore>,
        crypto: Arc<CryptoEngine>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            adapter,
            store,
            crypto,
            phase: RwLock::new(SyncPhase::Done),
            stats: RwLock::new(SyncStats::default()),
            progress: RwLock::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> SyncConfig {
        self.config.read().clone()
    }

    /// Replaces the configuration. Takes effect at the next session.
    pub fn set_config(&self, config: SyncConfig) {
        *self.config.write() = config;
    }

    /// This device's id.
    pub fn device_id(&self) -> String {
        self.config.read().device_id.clone()
    }

    /// Phase of the current or last session.
    pub fn phase(&self) -> SyncPhase {
        *self.phase.read()
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns true while a session runs.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Routes progress events to `sender`, or stops reporting with `None`.
    pub fn set_progress_sender(&self, sender: Option<mpsc::Sender<SyncProgress>>) {
        *self.progress.write() = sender;
    }

    /// Number of local items waiting to be pushed.
    pub fn pending_count(&self) -> SyncResult<usize> {
        self.store.pending_count()
    }

    /// Engine phase, pending count and remote lock state.
    pub fn status(&self) -> SyncResult<EngineStatus> {
        Ok(EngineStatus {
            phase: self.phase(),
            pending_changes: self.store.pending_count()?,
            lock: self.adapter.check_lock(),
        })
    }

    /// Gathers the facts needed before a first sync.
    pub fn first_sync_check(&self) -> SyncResult<FirstSyncCheck> {
        let device_id = self.device_id();
        let has_local_cursor = self
            .adapter
            .get_sync_cursor(&device_id)
            .is_some_and(|cursor| !cursor.position.is_empty());
        Ok(FirstSyncCheck {
            has_local_cursor,
            remote_has_data: self.adapter.has_existing_data(),
            pending_local: self.store.pending_count()?,
        })
    }

    /// Queues every local item for upload and rewinds this device's
    /// cursor so the next session replays the whole change log.
    pub fn force_full_sync(&self) -> SyncResult<usize> {
        let queued = self.store.mark_all_for_sync()?;
        let cursor = SyncCursor::new("", now_millis());
        if !self.adapter.set_sync_cursor(&self.device_id(), &cursor) {
            return Err(SyncError::transport_retryable("could not reset sync cursor"));
        }
        info!(queued, "forced full sync");
        Ok(queued)
    }

    /// Forgets all remote revisions so every live item is uploaded to a
    /// freshly configured backend.
    pub fn reset_for_new_backend(&self) -> SyncResult<usize> {
        let queued = self.store.reset_sync_status()?;
        info!(queued, "reset local sync state for new backend");
        Ok(queued)
    }

    /// Runs one sync session.
    ///
    /// Never panics and never returns an error: fatal and per-item
    /// failures are reported in [`SyncCycleResult::errors`].
    pub fn sync(&self) -> SyncCycleResult {
        let start = Instant::now();
        let mut result = SyncCycleResult::default();

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            result.errors.push(SyncError::AlreadyRunning.to_string());
            result.duration = start.elapsed();
            return result;
        }
        let _guard = RunningGuard(&self.running);

        let config = self.config();
        info!(device_id = %config.device_id, backend = self.adapter.kind(), "sync session started");

        match self.run_session(&config, &mut result) {
            Ok(()) => self.set_phase(SyncPhase::Done, "sync complete"),
            Err(e) => {
                error!(error = %e, "sync session aborted");
                result.errors.push(e.to_string());
                self.emit(SyncProgress::new(SyncPhase::Error, e.to_string()));
                *self.phase.write() = SyncPhase::Error;
            }
        }

        result.success = result.errors.is_empty();
        result.duration = start.elapsed();
        self.record_stats(&result);

        info!(
            success = result.success,
            pushed = result.pushed,
            pulled = result.pulled,
            conflicts = result.conflicts,
            errors = result.errors.len(),
            duration_ms = result.duration.as_millis() as u64,
            "sync session finished"
        );
        result
    }

    /// Connects, locks and runs the locked part of the session. The lock
    /// is released on every path once acquired.
    fn run_session(&self, config: &SyncConfig, result: &mut SyncCycleResult) -> SyncResult<()> {
        self.set_phase(SyncPhase::Connecting, "connecting to backend");
        if !self.adapter.test_connection() {
            return Err(SyncError::NotConnected(self.adapter.kind().to_string()));
        }
        let meta = self
            .adapter
            .get_remote_meta()
            .ok_or_else(|| SyncError::transport_retryable("could not read remote metadata"))?;
        if !meta.is_compatible() {
            return Err(SyncError::IncompatibleRemote(meta.version.clone()));
        }
        result.remote_has_data = meta.last_sync_time.is_some() || self.adapter.has_existing_data();

        self.set_phase(SyncPhase::AcquiringLock, "acquiring sync lock");
        if !self.adapter.acquire_lock(&config.device_id, config.lock_timeout) {
            let owner = self.adapter.check_lock().and_then(|status| status.owner);
            return Err(SyncError::LockUnavailable { owner });
        }

        let outcome = self.run_locked(config, &meta, result);

        if !self.adapter.release_lock(&config.device_id) {
            warn!(device_id = %config.device_id, "failed to release sync lock, it will expire");
        }
        outcome
    }

    fn run_locked(
        &self,
        config: &SyncConfig,
        meta: &RemoteMeta,
        result: &mut SyncCycleResult,
    ) -> SyncResult<()> {
        // Storage-level lock writes are last-writer-wins; confirm we won.
        let status = self.adapter.check_lock();
        if !status
            .as_ref()
            .is_some_and(|status| status.is_held_by(&config.device_id))
        {
            return Err(SyncError::LockUnavailable {
                owner: status.and_then(|status| status.owner),
            });
        }

        self.set_phase(SyncPhase::VerifyingKey, "verifying encryption key");
        self.verify_key(config, meta)?;

        self.set_phase(SyncPhase::Pushing, "uploading local changes");
        self.push(config, result)?;

        self.set_phase(SyncPhase::Pulling, "applying remote changes");
        self.pull(config, result)?;

        self.set_phase(SyncPhase::Committing, "updating remote metadata");
        self.commit(config, result);
        Ok(())
    }

    fn verify_key(&self, config: &SyncConfig, meta: &RemoteMeta) -> SyncResult<()> {
        if !config.encryption_enabled {
            return Ok(());
        }
        let local = self.crypto.key_fingerprint()?.ok_or(SyncError::MissingKey)?;
        match &meta.key_identifier {
            Some(remote) if *remote != local => Err(SyncError::KeyMismatch {
                local,
                remote: remote.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                debug!("remote has no key fingerprint yet");
                Ok(())
            }
        }
    }

    fn push(&self, config: &SyncConfig, result: &mut SyncCycleResult) -> SyncResult<()> {
        let pending: Vec<Item> = self
            .store
            .get_pending_sync()?
            .into_iter()
            .filter(|item| config.modules.includes_type(&item.item_type))
            .collect();
        let remote_changed = if pending.iter().any(|item| !item.is_deleted()) {
            self.unpulled_changes(config)
        } else {
            HashMap::new()
        };
        let (deferred, pending): (Vec<Item>, Vec<Item>) = pending.into_iter().partition(|item| {
            item.sync_status == SyncStatus::Modified
                && remote_changed
                    .get(&item.id)
                    .is_some_and(|change| !is_echo_of(item, change))
        });
        for item in &deferred {
            debug!(item_id = %item.id, "changed remotely too, resolving during pull");
        }
        let total = pending.len();
        debug!(total, deferred = deferred.len(), "pending items");

        let mut processed = 0;
        for chunk in pending.chunks(config.push_batch_size.max(1)) {
            let mut outgoing = Vec::with_capacity(chunk.len());
            for item in chunk {
                match self.prepare_outgoing(config, item) {
                    Ok(prepared) => outgoing.push(prepared),
                    Err(e) => {
                        warn!(item_id = %item.id, error = %e, "cannot push item");
                        result.errors.push(format!("push {}: {e}", item.id));
                    }
                }
            }

            let outcomes = if outgoing.is_empty() {
                Vec::new()
            } else {
                self.adapter.put_items(&outgoing)
            };
            for (item, outcome) in chunk
                .iter()
                .filter(|item| outgoing.iter().any(|o| o.id == item.id))
                .zip(outcomes)
            {
                match outcome.remote_rev {
                    Some(rev) => match self.mark_pushed(item, &rev) {
                        Ok(()) => result.pushed += 1,
                        Err(e) => result.errors.push(format!("push {}: {e}", item.id)),
                    },
                    None => {
                        let reason = outcome.error.unwrap_or_else(|| "upload failed".into());
                        warn!(item_id = %item.id, reason = %reason, "push failed");
                        result.errors.push(format!("push {}: {reason}", item.id));
                    }
                }
            }

            processed += chunk.len();
            self.emit(
                SyncProgress::new(SyncPhase::Pushing, "uploading local changes")
                    .with_count(processed, Some(total)),
            );
        }
        Ok(())
    }

    /// Latest change per item that this device has not pulled yet.
    ///
    /// Pushing a differing local edit over such a change would overwrite
    /// it before pull gets a chance to resolve the conflict. Listing
    /// failures yield an empty map.
    fn unpulled_changes(&self, config: &SyncConfig) -> HashMap<String, ChangeRecord> {
        let mut changes = HashMap::new();
        let mut cursor = self.start_cursor(config);
        for _ in 0..config.max_pull_pages {
            let Some(page) = self
                .adapter
                .list_changes(cursor.as_deref(), config.page_limit)
            else {
                break;
            };
            changes.extend(
                page.changes
                    .into_iter()
                    .map(|change| (change.item_id.clone(), change)),
            );
            match page.next_cursor {
                Some(next) if page.has_more => cursor = Some(next),
                _ => break,
            }
        }
        changes
    }

    fn start_cursor(&self, config: &SyncConfig) -> Option<String> {
        self.adapter
            .get_sync_cursor(&config.device_id)
            .map(|cursor| cursor.position)
            .filter(|position| !position.is_empty())
    }

    /// Copy of `item` as it travels to the backend.
    fn prepare_outgoing(&self, config: &SyncConfig, item: &Item) -> SyncResult<Item> {
        let mut outgoing = item.clone();
        if config.must_encrypt(&item.item_type) {
            if !self.crypto.has_key() {
                return Err(SyncError::MissingKey);
            }
            outgoing.payload = self.crypto.encrypt_string(&item.payload)?;
            outgoing.encryption_applied = true;
        }
        Ok(outgoing)
    }

    fn mark_pushed(&self, item: &Item, rev: &str) -> SyncResult<()> {
        // An edit made while the upload was in flight stays pending.
        let current = self.store.get_by_id(&item.id)?;
        if current.is_some_and(|current| current.local_rev != item.local_rev) {
            debug!(item_id = %item.id, "item changed during push, leaving it pending");
            return Ok(());
        }
        self.store.mark_synced(&item.id, rev)?;
        debug!(item_id = %item.id, rev, "pushed");
        Ok(())
    }

    fn pull(&self, config: &SyncConfig, result: &mut SyncCycleResult) -> SyncResult<()> {
        let mut cursor = self.start_cursor(config);
        let mut held = false;

        let mut pages = 0;
        loop {
            if pages >= config.max_pull_pages {
                warn!(pages, "pull page limit reached, resuming next session");
                break;
            }
            pages += 1;

            let Some(page) = self
                .adapter
                .list_changes(cursor.as_deref(), config.page_limit)
            else {
                result.errors.push("could not list remote changes".into());
                break;
            };

            // Position of the last change handled before the first failure
            // on this page.
            let mut consumed = None;
            let mut failed = false;
            for change in &page.changes {
                if config.modules.includes_type(&change.item_type) {
                    if let Err(e) = self.apply_change(config, change, result) {
                        warn!(item_id = %change.item_id, error = %e, "could not apply remote change");
                        result.errors.push(format!("pull {}: {e}", change.item_id));
                        failed = true;
                    }
                }
                if !failed {
                    consumed = Some(change.change_id.clone());
                }
            }

            // Once a change fails the stored cursor stops short of it so the
            // next session replays it. Later pages are still applied.
            let save = match (held, failed) {
                (true, _) => None,
                (false, true) => {
                    held = true;
                    consumed
                }
                (false, false) => page.next_cursor.clone(),
            };
            if let Some(position) = save {
                let saved = SyncCursor::new(position, now_millis());
                if !self.adapter.set_sync_cursor(&config.device_id, &saved) {
                    result.errors.push("could not persist sync cursor".into());
                }
            }
            if let Some(next) = &page.next_cursor {
                cursor = Some(next.clone());
            }

            self.emit(
                SyncProgress::new(SyncPhase::Pulling, "applying remote changes")
                    .with_count(result.pulled, None),
            );

            if !page.has_more {
                break;
            }
            if page.next_cursor.is_none() {
                warn!("backend reported more changes without a cursor");
                break;
            }
        }
        Ok(())
    }

    fn apply_change(
        &self,
        config: &SyncConfig,
        change: &ChangeRecord,
        result: &mut SyncCycleResult,
    ) -> SyncResult<()> {
        let local = self.store.get_by_id(&change.item_id)?;

        if let Some(local) = &local {
            if is_echo(local, &change.content_hash, change.deleted_time.is_some()) {
                debug!(item_id = %change.item_id, "skipping self-echo");
                return Ok(());
            }
            match local.sync_status {
                SyncStatus::Modified if is_echo_of(local, change) => return Ok(()),
                SyncStatus::Modified | SyncStatus::Conflict => {
                    return self.resolve_conflict(config, local, change, result)
                }
                SyncStatus::Deleted => {
                    debug!(item_id = %change.item_id, "local deletion pending, keeping it");
                    return Ok(());
                }
                SyncStatus::Clean => {}
            }
        }

        let remote = self.fetch_plaintext(&change.item_id)?;
        if let Some(local) = &local {
            if is_echo(local, &remote.content_hash, remote.is_deleted()) {
                debug!(item_id = %change.item_id, "skipping repeated change");
                return Ok(());
            }
        }

        if self.upsert(local.as_ref(), remote, change)? {
            result.pulled += 1;
        }
        Ok(())
    }

    /// Fetches a remote item and decrypts its payload.
    fn fetch_plaintext(&self, id: &str) -> SyncResult<Item> {
        self.open(self.fetch(id)?)
    }

    fn fetch(&self, id: &str) -> SyncResult<Item> {
        self.adapter
            .get_item(id)
            .ok_or_else(|| SyncError::ItemNotFound(id.to_string()))
    }

    /// Decrypts a fetched item and checks its payload against its hash.
    fn open(&self, mut remote: Item) -> SyncResult<Item> {
        let id = remote.id.clone();
        if remote.encryption_applied {
            if !self.crypto.has_key() {
                return Err(SyncError::MissingKey);
            }
            remote.payload = self.crypto.decrypt_string(&remote.payload)?;
            remote.encryption_applied = false;
        }
        let actual = content_hash(remote.payload.as_bytes());
        if actual != remote.content_hash {
            return Err(SyncError::Protocol(format!(
                "content hash mismatch for {id}"
            )));
        }
        Ok(remote)
    }

    /// Writes a decrypted remote item into the store. Returns false if
    /// nothing was applied.
    fn upsert(&self, local: Option<&Item>, remote: Item, change: &ChangeRecord) -> SyncResult<bool> {
        let rev = remote
            .remote_rev
            .clone()
            .unwrap_or_else(|| change.change_id.clone());
        let id = remote.id.clone();

        match local {
            Some(local) if remote.is_deleted() => {
                if !local.is_deleted() {
                    self.store.soft_delete(&id)?;
                }
                self.store.mark_synced(&id, &rev)?;
            }
            Some(local) if local.is_deleted() => {
                // Revived on another device.
                self.store.create_with_id(remote)?;
                self.store.mark_synced(&id, &rev)?;
            }
            Some(_) => {
                self.store.update(&id, &remote.payload)?;
                self.store.mark_synced(&id, &rev)?;
            }
            None if remote.is_deleted() => {
                debug!(item_id = %id, "ignoring tombstone for unknown item");
                return Ok(false);
            }
            None => {
                self.store.create_with_id(remote)?;
                self.store.mark_synced(&id, &rev)?;
            }
        }
        debug!(item_id = %id, rev, "pulled");
        Ok(true)
    }

    fn resolve_conflict(
        &self,
        config: &SyncConfig,
        local: &Item,
        change: &ChangeRecord,
        result: &mut SyncCycleResult,
    ) -> SyncResult<()> {
        let record = |resolution| {
            Conflict::new(
                &local.id,
                &local.item_type,
                &local.content_hash,
                &change.content_hash,
                resolution,
            )
        };

        let remote = match self.fetch(&local.id) {
            Ok(remote) => remote,
            Err(e) => {
                // The local edit stays as it was and the change is retried.
                result.conflicts += 1;
                result
                    .resolved_conflicts
                    .push(record(ConflictResolution::Unresolved));
                return Err(e);
            }
        };

        if local.remote_rev.is_some() && local.remote_rev == remote.remote_rev {
            debug!(item_id = %local.id, "remote unchanged since last sync, local edit is newer");
            return Ok(());
        }
        if remote.content_hash == local.content_hash && remote.is_deleted() == local.is_deleted() {
            let rev = remote
                .remote_rev
                .clone()
                .unwrap_or_else(|| change.change_id.clone());
            self.store.mark_synced(&local.id, &rev)?;
            return Ok(());
        }

        result.conflicts += 1;
        info!(item_id = %local.id, policy = %config.conflict_policy, "resolving conflict");

        if config.conflict_policy == ConflictPolicy::LocalWins {
            result
                .resolved_conflicts
                .push(record(ConflictResolution::KeptLocal));
            return Ok(());
        }

        let remote = match self.open(remote) {
            Ok(remote) => remote,
            Err(e) => {
                self.store.mark_conflict(&local.id)?;
                result
                    .resolved_conflicts
                    .push(record(ConflictResolution::Unresolved));
                return Err(e);
            }
        };

        let resolution = match config.conflict_policy {
            ConflictPolicy::CreateCopy => {
                let payload = conflict_copy_payload(&local.item_type, &local.payload);
                let copy = self.store.create(&local.item_type, &payload)?;
                info!(item_id = %local.id, copy_id = %copy.id, "kept local edit as conflict copy");
                ConflictResolution::CopiedLocal { copy_id: copy.id }
            }
            _ => ConflictResolution::AcceptedRemote,
        };

        if self.upsert(Some(local), remote, change)? {
            result.pulled += 1;
        }
        result.resolved_conflicts.push(record(resolution));
        Ok(())
    }

    fn commit(&self, config: &SyncConfig, result: &mut SyncCycleResult) {
        let Some(mut meta) = self.adapter.get_remote_meta() else {
            result.errors.push("could not read remote metadata".into());
            return;
        };
        meta.last_sync_time = Some(now_millis());
        if config.encryption_enabled {
            match self.crypto.key_fingerprint() {
                Ok(Some(fingerprint)) => meta.key_identifier = Some(fingerprint),
                Ok(None) => {}
                Err(e) => result.errors.push(format!("commit: {e}")),
            }
        }
        if !self.adapter.put_remote_meta(&meta) {
            result.errors.push("could not write remote metadata".into());
        }
    }

    fn set_phase(&self, phase: SyncPhase, message: &str) {
        *self.phase.write() = phase;
        info!(phase = %phase, "{message}");
        self.emit(SyncProgress::new(phase, message));
    }

    fn emit(&self, progress: SyncProgress) {
        if let Some(sender) = self.progress.read().as_ref() {
            // Events are dropped while the consumer lags.
            let _ = sender.try_send(progress);
        }
    }

    fn record_stats(&self, result: &SyncCycleResult) {
        let mut stats = self.stats.write();
        if result.success {
            stats.cycles_completed += 1;
            stats.last_error = None;
        } else {
            stats.cycles_failed += 1;
            stats.last_error = result.errors.first().cloned();
        }
        stats.items_pushed += result.pushed as u64;
        stats.items_pulled += result.pulled as u64;
        stats.conflicts_encountered += result.conflicts as u64;
        stats.last_sync_time = Some(now_millis());
    }
}

/// A change that matches what the clean local copy already holds.
fn is_echo(local: &Item, hash: &str, deleted: bool) -> bool {
    local.sync_status == SyncStatus::Clean
        && local.content_hash == hash
        && local.is_deleted() == deleted
}

/// A change carrying exactly the content `item` holds.
fn is_echo_of(item: &Item, change: &ChangeRecord) -> bool {
    item.content_hash == change.content_hash && item.is_deleted() == change.deleted_time.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::store::MemoryStore;
    use kbsync_crypto::MasterKey;

    fn clean(id: &str, payload: &str) -> Item {
        let mut item = Item::with_id(id, "note", payload);
        item.sync_status = SyncStatus::Clean;
        item
    }

    fn engine(adapter: Arc<MemoryAdapter>, store: Arc<MemoryStore>) -> SyncEngine {
        SyncEngine::new(
            SyncConfig::new("device-a"),
            adapter,
            store,
            Arc::new(CryptoEngine::new()),
        )
    }

    #[test]
    fn echo_requires_clean_matching_state() {
        let item = clean("a", "x");
        assert!(is_echo(&item, &item.content_hash, false));
        assert!(!is_echo(&item, &item.content_hash, true));
        assert!(!is_echo(&item, "other", false));

        let modified = Item::with_id("b", "note", "x");
        assert!(!is_echo(&modified, &modified.content_hash, false));
    }

    #[test]
    fn first_sync_check_reports_merge() {
        let adapter = Arc::new(MemoryAdapter::new());
        adapter.seed_item(&clean("r", "remote"));
        let store = Arc::new(MemoryStore::from_items([Item::with_id("l", "note", "local")]));
        let engine = engine(adapter, store);

        let check = engine.first_sync_check().unwrap();
        assert!(check.is_first_sync());
        assert!(check.would_merge());
    }

    #[test]
    fn force_full_sync_requeues_and_rewinds() {
        let adapter = Arc::new(MemoryAdapter::new());
        let store = Arc::new(MemoryStore::from_items([clean("a", "1"), clean("b", "2")]));
        let engine = engine(adapter.clone(), store.clone());
        adapter.set_sync_cursor("device-a", &SyncCursor::new("0000000000000009", 1));

        assert_eq!(engine.force_full_sync().unwrap(), 2);
        assert_eq!(store.pending_count().unwrap(), 2);
        assert_eq!(
            adapter.get_sync_cursor("device-a").unwrap().position,
            ""
        );
    }

    #[test]
    fn second_concurrent_session_is_refused() {
        let adapter = Arc::new(MemoryAdapter::new());
        let engine = engine(adapter, Arc::new(MemoryStore::new()));
        engine.running.store(true, Ordering::SeqCst);

        let result = engine.sync();
        assert!(!result.success);
        assert_eq!(result.errors, [SyncError::AlreadyRunning.to_string()]);
    }

    #[test]
    fn missing_key_fails_sensitive_push_only() {
        let adapter = Arc::new(MemoryAdapter::new());
        let store = Arc::new(MemoryStore::from_items([
            Item::with_id("v", "vault_entry", r#"{"name":"bank"}"#),
            Item::with_id("n", "note", r#"{"title":"hi"}"#),
        ]));
        let engine = engine(adapter.clone(), store);

        let result = engine.sync();
        assert_eq!(result.pushed, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("push v"));
        assert!(adapter.item("v").is_none());
    }

    #[test]
    fn sensitive_items_are_encrypted_even_without_global_encryption() {
        let adapter = Arc::new(MemoryAdapter::new());
        let store = Arc::new(MemoryStore::from_items([Item::with_id(
            "v",
            "vault_entry",
            r#"{"name":"bank","password":"hunter2"}"#,
        )]));
        let engine = SyncEngine::new(
            SyncConfig::new("device-a"),
            adapter.clone(),
            store.clone(),
            Arc::new(CryptoEngine::with_key(MasterKey::generate())),
        );

        let result = engine.sync();
        assert!(result.success, "{:?}", result.errors);

        let remote = adapter.item("v").unwrap();
        assert!(remote.encryption_applied);
        assert!(!remote.payload.contains("hunter2"));
        assert_eq!(
            remote.content_hash,
            store.get_by_id("v").unwrap().unwrap().content_hash
        );
        assert!(adapter.meta().unwrap().key_identifier.is_none());
    }

    #[test]
    fn stats_accumulate() {
        let adapter = Arc::new(MemoryAdapter::new());
        let store = Arc::new(MemoryStore::from_items([Item::with_id("a", "note", "1")]));
        let engine = engine(adapter.clone(), store);

        assert!(engine.sync().success);
        adapter.set_offline(true);
        assert!(!engine.sync().success);

        let stats = engine.stats();
        assert_eq!(stats.cycles_completed, 1);
        assert_eq!(stats.cycles_failed, 1);
        assert_eq!(stats.items_pushed, 1);
        assert!(stats.last_error.is_some());
        assert_eq!(engine.phase(), SyncPhase::Error);
    }
}
