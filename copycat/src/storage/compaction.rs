//! Minor and major compaction of sealed log segments.
//!
//! Minor compaction rewrites a single sealed segment, dropping entries the state machine has
//! flagged cleanable; the rewrite carries the same id and first index with the version bumped,
//! and atomically replaces the original. Major compaction merges runs of contiguous sealed
//! segments into one. Neither ever touches a segment above `min(commit_index, global_index)`,
//! so in-flight replication and uncommitted entries are never disturbed.

use std::collections::BTreeSet;

use super::log::LogInner;
use super::log::LogOptions;
use super::segment::Segment;
use super::StorageResult;

/// A summary of the work performed by one compaction pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    /// Segments rewritten in place by minor compaction.
    pub minor_rewritten: usize,
    /// Segments consumed by major compaction merges.
    pub major_merged: usize,
    /// Entries dropped across both passes.
    pub dropped: usize,
}

pub(super) fn run(options: &LogOptions, inner: &mut LogInner) -> StorageResult<CompactionReport> {
    let bound = inner.commit_index.min(inner.global_index);
    let mut report = CompactionReport::default();
    if bound == 0 {
        return Ok(report);
    }

    minor(options, inner, bound, &mut report)?;
    major(options, inner, bound, &mut report)?;
    Ok(report)
}

/// Whether every entry of the segment sits at or below the compaction bound.
fn fully_below(segment: &Segment, bound: u64) -> bool {
    segment.last_index().map(|last| last <= bound).unwrap_or(true)
}

fn cleanable_range(cleaned: &BTreeSet<u64>, segment: &Segment) -> usize {
    match segment.last_index() {
        Some(last) => cleaned.range(segment.first_index()..=last).count(),
        None => 0,
    }
}

/// Rewrite sealed segments that have cleanable entries, dropping those entries.
fn minor(
    options: &LogOptions,
    inner: &mut LogInner,
    bound: u64,
    report: &mut CompactionReport,
) -> StorageResult<()> {
    let candidates: Vec<u64> = inner
        .sealed
        .iter()
        .filter(|(_, seg)| fully_below(seg, bound) && cleanable_range(&inner.cleaned, seg) > 0)
        .map(|(first, _)| *first)
        .collect();

    for first in candidates {
        let old = match inner.sealed.remove(&first) {
            Some(segment) => segment,
            None => continue,
        };
        let mut rewritten = Segment::create(
            &options.directory,
            &options.name,
            old.id(),
            old.version() + 1,
            old.first_index(),
            options.max_entry_size,
            options.max_segment_size,
            options.max_entries_per_segment,
            inner.pool.clone(),
        )?;

        let last = old.last_index().unwrap_or(first);
        for index in first..=last {
            if inner.cleaned.contains(&index) {
                continue;
            }
            if let Some(frame) = old.frame_at(index)? {
                rewritten.append_compacted(index - first, frame)?;
            }
        }
        rewritten.seal()?;

        let dropped = cleanable_range(&inner.cleaned, &old);
        report.minor_rewritten += 1;
        report.dropped += dropped;
        for index in first..=last {
            inner.cleaned.remove(&index);
        }

        tracing::debug!(
            id = rewritten.id(),
            version = rewritten.version(),
            dropped,
            "minor compaction rewrote segment"
        );
        inner.sealed.insert(first, rewritten);
        old.delete()?;
    }
    Ok(())
}

/// Merge runs of contiguous sealed segments fully below the bound into single segments.
fn major(
    options: &LogOptions,
    inner: &mut LogInner,
    bound: u64,
    report: &mut CompactionReport,
) -> StorageResult<()> {
    loop {
        // Find the first run of at least two adjacent segments that are contiguous, fully below
        // the bound, and small enough to merge into one segment.
        let mut run: Vec<u64> = Vec::new();
        let mut run_bytes: u64 = 0;
        let mut run_entries: u64 = 0;
        let mut prev_last: Option<u64> = None;
        for (first, segment) in inner.sealed.iter() {
            if !fully_below(segment, bound) {
                break;
            }
            let contiguous = prev_last.map(|last| last + 1 == *first).unwrap_or(true);
            let fits = run_bytes + segment.size() as u64 <= options.max_segment_size as u64
                && run_entries + segment.present() <= options.max_entries_per_segment as u64;
            if !contiguous || !fits {
                if run.len() >= 2 {
                    break;
                }
                // Start a fresh run at this segment.
                run.clear();
                run_bytes = 0;
                run_entries = 0;
            }
            run.push(*first);
            run_bytes += segment.size() as u64;
            run_entries += segment.present();
            prev_last = segment.last_index();
        }
        if run.len() < 2 {
            return Ok(());
        }

        let inputs: Vec<Segment> =
            run.iter().filter_map(|first| inner.sealed.remove(first)).collect();
        let head = &inputs[0];
        let version = inputs.iter().map(Segment::version).max().unwrap_or(1) + 1;
        let merged_first = head.first_index();
        let mut merged = Segment::create(
            &options.directory,
            &options.name,
            head.id(),
            version,
            merged_first,
            options.max_entry_size,
            options.max_segment_size,
            options.max_entries_per_segment,
            inner.pool.clone(),
        )?;

        for segment in &inputs {
            let first = segment.first_index();
            let last = match segment.last_index() {
                Some(last) => last,
                None => continue,
            };
            for index in first..=last {
                if inner.cleaned.contains(&index) {
                    report.dropped += 1;
                    continue;
                }
                if let Some(frame) = segment.frame_at(index)? {
                    merged.append_compacted(index - merged_first, frame)?;
                }
            }
            for index in first..=last {
                inner.cleaned.remove(&index);
            }
        }
        merged.seal()?;

        tracing::debug!(
            id = merged.id(),
            version = merged.version(),
            inputs = inputs.len(),
            "major compaction merged segments"
        );
        report.major_merged += inputs.len();
        inner.sealed.insert(merged_first, merged);
        for segment in inputs {
            segment.delete()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::log::Log;
    use super::super::log::LogOptions;
    use super::*;
    use crate::raft::Entry;
    use crate::raft::EntryPayload;
    use crate::raft::KeepAliveEntry;
    use crate::LogId;

    fn options(dir: &std::path::Path) -> LogOptions {
        LogOptions {
            name: "test".into(),
            directory: dir.to_path_buf(),
            max_entry_size: 1024,
            max_segment_size: 64 * 1024,
            max_entries_per_segment: 4,
        }
    }

    fn entry(index: u64) -> Entry<u64> {
        Entry {
            log_id: LogId::new(1, index),
            payload: EntryPayload::KeepAlive(KeepAliveEntry {
                session: index,
                timestamp: index as i64,
            }),
        }
    }

    #[test]
    fn test_minor_compaction_drops_cleaned_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log: Log<u64> = Log::open(options(dir.path())).unwrap();
        for i in 1..=12 {
            log.append(&entry(i)).unwrap();
        }
        // Segments [1..=4], [5..=8] sealed; current [9..].
        log.mark_clean(2);
        log.mark_clean(3);
        log.mark_clean(6);
        log.set_commit_bounds(12, 12);

        let report = log.compact().unwrap();
        assert_eq!(report.dropped, 3);
        assert!(report.minor_rewritten >= 1);

        // Cleaned entries are gone; everything else survives at its index.
        assert!(log.get(2).unwrap().is_none());
        assert!(log.get(3).unwrap().is_none());
        assert!(log.get(6).unwrap().is_none());
        for i in [1, 4, 5, 7, 8, 9, 10, 11, 12] {
            assert_eq!(log.get(i).unwrap().unwrap(), entry(i), "index {}", i);
        }
        assert_eq!(log.last_index(), 12);
        assert_eq!(log.cleanable(), 0);
    }

    #[test]
    fn test_compaction_never_crosses_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let log: Log<u64> = Log::open(options(dir.path())).unwrap();
        for i in 1..=12 {
            log.append(&entry(i)).unwrap();
        }
        log.mark_clean(6);
        // Global index lags behind: segment [5..=8] must not be rewritten.
        log.set_commit_bounds(12, 4);

        log.compact().unwrap();
        assert_eq!(log.get(6).unwrap().unwrap(), entry(6));

        // Once replication catches up the entry is dropped.
        log.set_commit_bounds(12, 12);
        log.compact().unwrap();
        assert!(log.get(6).unwrap().is_none());
    }

    #[test]
    fn test_rewritten_segments_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log: Log<u64> = Log::open(options(dir.path())).unwrap();
            for i in 1..=12 {
                log.append(&entry(i)).unwrap();
            }
            log.mark_clean(2);
            log.set_commit_bounds(12, 12);
            log.compact().unwrap();
        }

        // Reconciliation keeps the higher-version rewrites and discards nothing else.
        let log: Log<u64> = Log::open(options(dir.path())).unwrap();
        assert_eq!(log.last_index(), 12);
        assert!(log.get(2).unwrap().is_none());
        assert_eq!(log.get(4).unwrap().unwrap(), entry(4));
    }

    #[test]
    fn test_major_compaction_merges_contiguous_segments() {
        let dir = tempfile::tempdir().unwrap();
        let log: Log<u64> = Log::open(options(dir.path())).unwrap();
        for i in 1..=12 {
            log.append(&entry(i)).unwrap();
        }
        // Drop enough entries that both sealed segments fit in one.
        for i in [1, 2, 3, 5, 6, 7] {
            log.mark_clean(i);
        }
        log.set_commit_bounds(12, 12);

        let report = log.compact().unwrap();
        assert_eq!(report.dropped, 6);
        assert_eq!(report.major_merged, 2);

        for i in [4, 8, 9, 10, 11, 12] {
            assert_eq!(log.get(i).unwrap().unwrap(), entry(i), "index {}", i);
        }
        for i in [1, 2, 3, 5, 6, 7] {
            assert!(log.get(i).unwrap().is_none(), "index {}", i);
        }
    }
}
