//! Last-write-wins merge of the local journal with a remote copy.

use resilience_core::MoodEntry;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Local order preserved, remote-only entries appended by timestamp.
    pub merged: Vec<MoodEntry>,
    /// Entries that came from (or were overwritten by) the remote.
    pub pulled: usize,
    /// Entries the remote has never seen.
    pub local_only: Vec<Uuid>,
    /// Entries where the local copy beats a stale remote copy.
    pub local_newer: Vec<Uuid>,
}

impl MergeOutcome {
    /// Whether the merge changed anything locally.
    pub fn changed(&self) -> bool {
        self.pulled > 0
    }
}

/// Merge by entry id. The copy with the later `updated_at` wins; on a tie
/// the local copy is kept.
pub fn merge_last_write_wins(local: &[MoodEntry], remote: Vec<MoodEntry>) -> MergeOutcome {
    let mut remote_by_id: HashMap<Uuid, MoodEntry> =
        remote.into_iter().map(|e| (e.id, e)).collect();

    let mut outcome = MergeOutcome::default();
    for entry in local {
        match remote_by_id.remove(&entry.id) {
            Some(theirs) if theirs.updated_at > entry.updated_at => {
                outcome.merged.push(theirs);
                outcome.pulled += 1;
            }
            Some(theirs) => {
                if theirs != *entry {
                    outcome.local_newer.push(entry.id);
                }
                outcome.merged.push(entry.clone());
            }
            None => {
                outcome.local_only.push(entry.id);
                outcome.merged.push(entry.clone());
            }
        }
    }

    let mut remote_only: Vec<MoodEntry> = remote_by_id.into_values().collect();
    remote_only.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
    outcome.pulled += remote_only.len();
    outcome.merged.extend(remote_only);
    outcome
}
