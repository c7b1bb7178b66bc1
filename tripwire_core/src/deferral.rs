use crate::record::ProbeRecord;
use std::collections::HashMap;

/// Holds probe records whose target module is not currently present, keyed
/// by the module-name fingerprint.
///
/// Records in here were never armed: discarding them needs no registrar
/// interaction. The table itself is not synchronized; the tracker guards it
/// with the deferred-domain lock.
#[derive(Debug, Default)]
pub struct DeferralTable {
    entries: HashMap<u32, Vec<ProbeRecord>>,
}

impl DeferralTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a record until its module arrives.
    pub fn insert(&mut self, record: ProbeRecord) {
        self.entries
            .entry(record.fingerprint())
            .or_default()
            .push(record);
    }

    /// Removes and returns every record whose fingerprint matches, in
    /// insertion order. Used when the matching module arrives.
    pub fn take_matching(&mut self, fingerprint: u32) -> Vec<ProbeRecord> {
        self.entries.remove(&fingerprint).unwrap_or_default()
    }

    /// Removes and returns everything; used on a global clear.
    pub fn drain_all(&mut self) -> Vec<ProbeRecord> {
        self.entries.drain().flat_map(|(_, records)| records).collect()
    }

    /// Number of parked records across all fingerprints.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
