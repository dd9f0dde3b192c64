//! Retention policies for committed cache entries.

use crate::fingerprint::Fingerprint;
use crate::package::PackageRef;

/// What a policy gets to see about each committed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySummary {
  pub fingerprint: Fingerprint,
  pub package: PackageRef,
  pub created_at_unix: u64,
}

/// Decides which committed entries to evict.
pub trait RetentionPolicy: Send + Sync {
  fn select_evictions(&self, entries: &[EntrySummary]) -> Vec<Fingerprint>;
}

/// Never evicts anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAll;

impl RetentionPolicy for KeepAll {
  fn select_evictions(&self, _entries: &[EntrySummary]) -> Vec<Fingerprint> {
    Vec::new()
  }
}

/// Keeps the newest `max` entries.
#[derive(Debug, Clone, Copy)]
pub struct MaxEntries(pub usize);

impl RetentionPolicy for MaxEntries {
  fn select_evictions(&self, entries: &[EntrySummary]) -> Vec<Fingerprint> {
    let mut by_age: Vec<&EntrySummary> = entries.iter().collect();
    // Newest first; fingerprint breaks ties so the choice is stable
    by_age.sort_by(|a, b| {
      b.created_at_unix
        .cmp(&a.created_at_unix)
        .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });
    by_age.into_iter().skip(self.0).map(|e| e.fingerprint).collect()
  }
}

/// Outcome of a garbage collection pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcStats {
  pub entries_scanned: usize,
  pub entries_evicted: usize,
  pub staging_removed: usize,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn summary(byte: u8, created: u64) -> EntrySummary {
    EntrySummary {
      fingerprint: Fingerprint([byte; 32]),
      package: PackageRef::new(format!("p{}", byte), "1.0"),
      created_at_unix: created,
    }
  }

  #[test]
  fn keep_all_evicts_nothing() {
    assert!(KeepAll.select_evictions(&[summary(1, 10), summary(2, 20)]).is_empty());
  }

  #[test]
  fn max_entries_evicts_oldest() {
    let entries = [summary(1, 10), summary(2, 30), summary(3, 20)];
    assert_eq!(MaxEntries(2).select_evictions(&entries), vec![Fingerprint([1; 32])]);
    assert_eq!(MaxEntries(0).select_evictions(&entries).len(), 3);
    assert!(MaxEntries(5).select_evictions(&entries).is_empty());
  }
}
