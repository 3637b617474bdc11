use std::collections::HashMap;

use common::{
    storage::types::chunk_record::StoredFingerprint, utils::fingerprint::FileFingerprint,
};
use tracing::debug;

/// Files on disk partitioned against the committed snapshot. Only `new`
/// and `modified` flow to the embedding stage; `incomplete` gets a
/// metadata-only repair; `unchanged` is left alone.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub new: Vec<FileFingerprint>,
    pub modified: Vec<FileFingerprint>,
    pub unchanged: Vec<FileFingerprint>,
    pub incomplete: Vec<FileFingerprint>,
}

impl ChangeSet {
    pub fn needs_embedding(&self) -> bool {
        !self.new.is_empty() || !self.modified.is_empty()
    }
}

/// Diffs current fingerprints against the stored snapshot.
///
/// A path absent from the snapshot is new. A complete snapshot entry is
/// compared field by field; any difference among hash, size, and mtime
/// means the file is re-embedded. Entries missing metadata are
/// incomplete and only repaired, unless their stored hash is present and
/// disagrees with the file on disk, which is a genuine modification.
pub fn classify(
    current: Vec<FileFingerprint>,
    snapshot: &HashMap<String, StoredFingerprint>,
) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for fingerprint in current {
        match snapshot.get(&fingerprint.path) {
            None => changes.new.push(fingerprint),
            Some(stored) if stored.is_complete() => {
                if stored.matches(&fingerprint) {
                    changes.unchanged.push(fingerprint);
                } else {
                    changes.modified.push(fingerprint);
                }
            }
            Some(stored) => {
                let hash_disagrees = stored
                    .content_hash
                    .as_deref()
                    .is_some_and(|hash| !hash.is_empty() && hash != fingerprint.content_hash);
                if hash_disagrees {
                    changes.modified.push(fingerprint);
                } else {
                    changes.incomplete.push(fingerprint);
                }
            }
        }
    }

    debug!(
        new = changes.new.len(),
        modified = changes.modified.len(),
        unchanged = changes.unchanged.len(),
        incomplete = changes.incomplete.len(),
        "change detection finished"
    );

    changes
}
