//! Conflict detection and resolution between local and remote snapshots.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::SyncSettings;
use crate::db::LocalStore;
use crate::models::{
    attempt_is_final, snapshot_updated_at, Conflict, ConflictType, EntityKind, Resolution,
    ResolutionRule, ResolutionStrategy, ResolutionWinner, Snapshot, SyncLogEntry, SyncLogStatus,
};
use crate::remote::RemoteStore;
use crate::util::{now_ms, parse_timestamp_ms};
use crate::Result;

/// Default clock-skew tolerance in milliseconds
pub const DEFAULT_TOLERANCE_MS: i64 = 1_000;

/// Decides whether two snapshots of a record diverge and which one wins.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    strategies: BTreeMap<EntityKind, ResolutionStrategy>,
    tolerance_ms: i64,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

impl ConflictResolver {
    /// Create a resolver with an explicit strategy table
    pub fn new(strategies: BTreeMap<EntityKind, ResolutionStrategy>, tolerance_ms: i64) -> Self {
        Self {
            strategies,
            tolerance_ms: tolerance_ms.max(0),
        }
    }

    /// Create a resolver from sync settings (defaults plus overrides)
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(settings.strategy_table(), settings.conflict_tolerance_ms)
    }

    /// Strategy for an entity; `timestamp_wins` when unconfigured
    pub fn strategy_for(&self, entity: EntityKind) -> ResolutionStrategy {
        self.strategies.get(&entity).copied().unwrap_or_default()
    }

    /// Clock-skew tolerance in milliseconds
    pub const fn tolerance_ms(&self) -> i64 {
        self.tolerance_ms
    }

    /// Compare two snapshots of the same record.
    ///
    /// Returns `None` when either side is absent or the snapshots agree.
    pub fn detect_conflict(
        &self,
        entity: EntityKind,
        local: Option<&Snapshot>,
        remote: Option<&Snapshot>,
    ) -> Option<Conflict> {
        let local = entity.normalize(local?);
        let remote = entity.normalize(remote?);

        let key_fields_match = std::iter::once("updated_at")
            .chain(entity.content_fields().iter().copied())
            .all(|field| local.get(field) == remote.get(field));
        if key_fields_match {
            return None;
        }

        let diverged = match entity {
            EntityKind::Attempt => self.attempts_diverge(&local, &remote),
            _ => self.beyond_tolerance(
                snapshot_updated_at(&local),
                snapshot_updated_at(&remote),
            ),
        };
        if !diverged {
            return None;
        }

        let record_id = crate::models::snapshot_id(&local)
            .or_else(|| crate::models::snapshot_id(&remote))?
            .to_string();

        Some(Conflict {
            id: Uuid::now_v7(),
            entity,
            record_id,
            local,
            remote,
            conflict_type: ConflictType::UpdateConflict,
            detected_at: now_ms(),
        })
    }

    fn attempts_diverge(&self, local: &Snapshot, remote: &Snapshot) -> bool {
        match (attempt_is_final(local), attempt_is_final(remote)) {
            // Pushing a submission over a draft is the normal path
            (true, false) => false,
            // A draft must never regress a remote submission
            (false, true) => true,
            (true, true) => self.beyond_tolerance(
                parse_timestamp_ms(local.get("completed_at")),
                parse_timestamp_ms(remote.get("completed_at")),
            ),
            (false, false) => {
                let local_answers = answers(local);
                let remote_answers = answers(remote);
                local_answers
                    .iter()
                    .any(|(key, value)| remote_answers.get(key).is_some_and(|other| other != value))
            }
        }
    }

    fn beyond_tolerance(&self, left: Option<i64>, right: Option<i64>) -> bool {
        match (left, right) {
            (Some(left), Some(right)) => left.abs_diff(right) > self.tolerance_ms.unsigned_abs(),
            (None, None) => false,
            _ => true,
        }
    }

    /// Decide the authoritative snapshot for a conflict without touching
    /// either store.
    pub fn plan(&self, conflict: &Conflict) -> Resolution {
        let strategy = self.strategy_for(conflict.entity);
        let (winner, mut resolved, mut description) = match strategy.rule {
            ResolutionRule::LocalWins => (
                ResolutionWinner::Local,
                conflict.local.clone(),
                "local snapshot kept".to_string(),
            ),
            ResolutionRule::RemoteWins => (
                ResolutionWinner::Remote,
                conflict.remote.clone(),
                "remote snapshot kept".to_string(),
            ),
            ResolutionRule::TimestampWins => by_timestamp(conflict),
            ResolutionRule::MergeData if conflict.entity == EntityKind::Attempt => {
                merge_attempts(conflict)
            }
            ResolutionRule::MergeData => {
                tracing::warn!(
                    "merge_data is not supported for {}; falling back to timestamp_wins",
                    conflict.entity
                );
                let (winner, resolved, description) = by_timestamp(conflict);
                (winner, resolved, format!("{description} (merge unsupported)"))
            }
        };

        let mut winner = winner;
        if strategy.preserve_user_data
            && winner == ResolutionWinner::Remote
            && preserve_user_data(conflict, &mut resolved)
        {
            winner = ResolutionWinner::Merged;
            resolved.insert("updated_at".to_string(), Value::from(latest_updated_at(conflict)));
            description.push_str("; user-authored fields preserved from local");
        }

        Resolution {
            conflict_id: conflict.id,
            rule: strategy.rule,
            winner,
            resolved,
            description,
        }
    }

    /// Write a planned resolution to the stores and record it in the audit log.
    pub async fn apply(
        &self,
        conflict: &Conflict,
        resolution: &Resolution,
        remote: &dyn RemoteStore,
        local: &LocalStore,
    ) -> Result<()> {
        let result = write_resolution(conflict, resolution, remote, local).await;

        let entry = SyncLogEntry::new(
            "conflict_resolution",
            conflict.entity.table_name(),
            conflict.record_id.as_str(),
            if result.is_ok() {
                SyncLogStatus::Success
            } else {
                SyncLogStatus::Failed
            },
        )
        .with_details(format!("{}: {}", resolution.rule, resolution.description));
        let entry = match &result {
            Ok(()) => entry,
            Err(error) => entry.with_error(error.to_string()),
        };
        if let Err(error) = local.append_log(&entry).await {
            tracing::warn!("Failed to record conflict resolution: {error}");
        }

        match &result {
            Ok(()) => tracing::info!(
                "Resolved {} conflict on {} with {}: {}",
                conflict.entity,
                conflict.record_id,
                resolution.rule,
                resolution.description
            ),
            Err(error) => tracing::warn!(
                "Conflict resolution on {} {} failed: {error}",
                conflict.entity,
                conflict.record_id
            ),
        }
        result
    }

    /// Plan and apply a resolution.
    pub async fn resolve_conflict(
        &self,
        conflict: &Conflict,
        remote: &dyn RemoteStore,
        local: &LocalStore,
    ) -> Result<Resolution> {
        let resolution = self.plan(conflict);
        self.apply(conflict, &resolution, remote, local).await?;
        Ok(resolution)
    }
}

async fn write_resolution(
    conflict: &Conflict,
    resolution: &Resolution,
    remote: &dyn RemoteStore,
    local: &LocalStore,
) -> Result<()> {
    let entity = conflict.entity;
    let resolved = &resolution.resolved;

    match resolution.winner {
        ResolutionWinner::Local => {
            remote.sync_one_record(entity, resolved).await?;
            local
                .mark_synced(entity, &conflict.record_id, snapshot_updated_at(&conflict.local))
                .await?;
        }
        ResolutionWinner::Remote => {
            local.upsert_record(entity, resolved, true).await?;
        }
        ResolutionWinner::Merged => {
            local.upsert_record(entity, resolved, false).await?;
            remote.sync_one_record(entity, resolved).await?;
            local
                .mark_synced(entity, &conflict.record_id, snapshot_updated_at(resolved))
                .await?;
        }
    }
    Ok(())
}

fn answers(snapshot: &Snapshot) -> Map<String, Value> {
    match snapshot.get("answers") {
        Some(Value::Object(answers)) => answers.clone(),
        _ => Map::new(),
    }
}

fn latest_updated_at(conflict: &Conflict) -> i64 {
    snapshot_updated_at(&conflict.local)
        .max(snapshot_updated_at(&conflict.remote))
        .unwrap_or_else(now_ms)
}

fn by_timestamp(conflict: &Conflict) -> (ResolutionWinner, Snapshot, String) {
    let local = snapshot_updated_at(&conflict.local);
    let remote = snapshot_updated_at(&conflict.remote);
    if local > remote {
        (
            ResolutionWinner::Local,
            conflict.local.clone(),
            "local snapshot is newer".to_string(),
        )
    } else {
        (
            ResolutionWinner::Remote,
            conflict.remote.clone(),
            "remote snapshot is newer or equal".to_string(),
        )
    }
}

fn merge_attempts(conflict: &Conflict) -> (ResolutionWinner, Snapshot, String) {
    match (
        attempt_is_final(&conflict.local),
        attempt_is_final(&conflict.remote),
    ) {
        (true, false) => (
            ResolutionWinner::Local,
            conflict.local.clone(),
            "local submission kept".to_string(),
        ),
        (false, true) => (
            ResolutionWinner::Remote,
            conflict.remote.clone(),
            "remote submission kept".to_string(),
        ),
        (true, true) => (
            ResolutionWinner::Local,
            conflict.local.clone(),
            "both sides submitted; local submission kept".to_string(),
        ),
        (false, false) => {
            let mut merged_answers = answers(&conflict.remote);
            merged_answers.extend(answers(&conflict.local));

            let mut merged = conflict.local.clone();
            merged.insert("answers".to_string(), Value::Object(merged_answers));
            merged.insert(
                "updated_at".to_string(),
                Value::from(latest_updated_at(conflict)),
            );
            (
                ResolutionWinner::Merged,
                merged,
                "answers merged; local answers kept on overlap".to_string(),
            )
        }
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(text)) => text.trim().is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

/// Copy user-authored fields the remote winner lacks from the local side.
///
/// Returns whether anything was copied.
fn preserve_user_data(conflict: &Conflict, resolved: &mut Snapshot) -> bool {
    let mut changed = false;

    for field in conflict.entity.user_authored_fields() {
        let local_value = conflict.local.get(*field);
        if is_blank(local_value) {
            continue;
        }

        if is_blank(resolved.get(*field)) {
            if let Some(value) = local_value {
                resolved.insert((*field).to_string(), value.clone());
                changed = true;
            }
            continue;
        }

        if conflict.entity == EntityKind::Attempt && *field == "answers" && !attempt_is_final(resolved)
        {
            let mut merged = answers(resolved);
            for (key, value) in answers(&conflict.local) {
                if !merged.contains_key(&key) {
                    merged.insert(key, value);
                    changed = true;
                }
            }
            resolved.insert("answers".to_string(), Value::Object(merged));
        }
    }

    changed
}
