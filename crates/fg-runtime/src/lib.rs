#![forbid(unsafe_code)]

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    /// Provider session open/close.
    Session,
    /// Pipeline and tensor graph assembly.
    Graph,
    /// Placeholder mapping activity.
    Binding,
    /// Per-frame execute outcomes.
    Execution,
    /// Device-layer events (asset loads, capture).
    Device,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

/// Append-only record of engine activity. The engine has no global logger;
/// callers inspect the ledger of the provider that did the work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    pub fn entries_of(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> + '_ {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use super::{EvidenceKind, EvidenceLedger};

    #[test]
    fn ledger_records_entries_in_order() {
        let mut ledger = EvidenceLedger::new();
        ledger.record(EvidenceKind::Session, "session opened 640x480");
        ledger.record(EvidenceKind::Execution, "pipeline 1 executed 3 operators");

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.entries()[0].kind, EvidenceKind::Session);
        assert_eq!(ledger.entries()[1].kind, EvidenceKind::Execution);
    }

    #[test]
    fn entries_can_be_filtered_by_kind() {
        let mut ledger = EvidenceLedger::new();
        ledger.record(EvidenceKind::Graph, "pipeline 1 created");
        ledger.record(EvidenceKind::Execution, "pipeline 1 executed");
        ledger.record(EvidenceKind::Execution, "pipeline 1 executed");

        assert_eq!(ledger.entries_of(EvidenceKind::Execution).count(), 2);
        assert_eq!(ledger.entries_of(EvidenceKind::Device).count(), 0);
    }
}
