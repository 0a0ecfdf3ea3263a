// sambx: Duplicate removal and SAM serialization for barcoded paired-end alignments.
//
// Copyrights in this project are retained by contributors. No copyright assignment
// is required to contribute to this project.
//
// Except as otherwise noted (below and/or in individual files), this
// project is licensed under the Apache License, Version 2.0
// <LICENSE-APACHE> or <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license, <LICENSE-MIT> or <http://opensource.org/licenses/MIT>,
// at your option.
//

//! Total ordering and duplicate removal for [AlignedRead] batches.
//!
//! [record_cmp] orders records by barcode, chromosome, position, and finally
//! identifier, so that exact duplicates end up adjacent. [remove_duplicates]
//! then collapses adjacent duplicates in a single pass. The duplicate
//! predicate [is_dup] is stricter than the sort key: it additionally requires
//! the mate index, orientation, and score to match, so records that merely
//! share coordinates survive.

use std::cmp::Ordering;

use crate::AlignedRead;

/// Total order over records: barcode, then chromosome, then position, then
/// identifier.
pub fn record_cmp(r1: &AlignedRead, r2: &AlignedRead) -> Ordering {
    r1.bc
        .cmp(&r2.bc)
        .then_with(|| r1.chrom.cmp(&r2.chrom))
        .then_with(|| r1.pos.cmp(&r2.pos))
        .then_with(|| r1.ident.cmp(&r2.ident))
}

/// Sort a batch in place by [record_cmp].
pub fn sort_records(records: &mut [AlignedRead]) {
    records.sort_unstable_by(record_cmp);
}

/// True iff `r2` is an exact duplicate of `r1`.
///
/// Scores are compared bit-exactly.
pub fn is_dup(r1: &AlignedRead, r2: &AlignedRead) -> bool {
    r1.ident == r2.ident
        && r1.chrom == r2.chrom
        && r1.pos == r2.pos
        && r1.mate == r2.mate
        && r1.rev == r2.rev
        && r1.score.to_bits() == r2.score.to_bits()
}

/// Collapse adjacent duplicates, keeping the first occurrence of each.
///
/// Consumes the batch and returns the surviving records followed by one
/// terminator record (`bc == 0`, see [AlignedRead]) for callers that scan
/// without a separate length.
///
/// The input must already be sorted into adjacency, at least by barcode,
/// chromosome, and position (see [sort_records]); duplicates that are not
/// adjacent survive. The input must not carry a terminator of its own.
///
/// ## Usage
///
/// ```rust
/// use sambx::AlignedRead;
/// use sambx::dedup::{remove_duplicates, sort_records};
///
/// let rec = AlignedRead { ident: "read1".to_string(), bc: 27, pos: 100, ..Default::default() };
/// let mut records = vec![rec.clone(), rec.clone(), rec];
///
/// sort_records(&mut records);
/// let records = remove_duplicates(records);
///
/// // One survivor plus the terminator.
/// assert_eq!(records.len(), 2);
/// assert_eq!(records[0].ident, "read1");
/// assert_eq!(records[1].bc, 0);
/// ```
pub fn remove_duplicates(records: Vec<AlignedRead>) -> Vec<AlignedRead> {
    let n_records = records.len();
    let mut records_no_dups: Vec<AlignedRead> = Vec::with_capacity(n_records + 1);

    let mut iter = records.into_iter().peekable();
    while let Some(rec) = iter.next() {
        while iter.peek().is_some_and(|next| is_dup(&rec, next)) {
            iter.next();
        }
        records_no_dups.push(rec);
    }

    log::debug!(
        "removed {} duplicate records",
        n_records - records_no_dups.len()
    );

    records_no_dups.push(AlignedRead::default());
    records_no_dups
}

// Tests
#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::is_dup;
    use super::record_cmp;
    use super::remove_duplicates;
    use super::sort_records;
    use crate::AlignedRead;
    use crate::Mate;

    fn read(ident: &str, bc: u64, chrom: u32, pos: u32) -> AlignedRead {
        AlignedRead {
            ident: ident.to_string(),
            bc,
            chrom,
            pos,
            score: 5.0,
            ..Default::default()
        }
    }

    #[test]
    fn sort_orders_by_barcode_chrom_pos_ident() {
        let mut records = vec![
            read("r2", 3, 0, 50),
            read("r1", 2, 1, 10),
            read("r1", 2, 0, 999),
            read("r0", 2, 1, 10),
            read("r9", 1, 5, 1),
        ];

        sort_records(&mut records);

        let keys: Vec<(u64, u32, u32, &str)> = records
            .iter()
            .map(|r| (r.bc, r.chrom, r.pos, r.ident.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                (1, 5, 1, "r9"),
                (2, 0, 999, "r1"),
                (2, 1, 10, "r0"),
                (2, 1, 10, "r1"),
                (3, 0, 50, "r2"),
            ]
        );
    }

    #[test]
    fn comparator_is_antisymmetric() {
        let a = read("r1", 2, 0, 100);
        let b = read("r1", 2, 0, 200);

        assert_eq!(record_cmp(&a, &b), Ordering::Less);
        assert_eq!(record_cmp(&b, &a), Ordering::Greater);
        assert_eq!(record_cmp(&a, &a), Ordering::Equal);
    }

    #[test]
    fn duplicate_predicate_is_stricter_than_sort_key() {
        let a = read("r1", 2, 0, 100);

        let mut same_key = a.clone();
        same_key.rev = true;
        assert_eq!(record_cmp(&a, &same_key), Ordering::Equal);
        assert!(!is_dup(&a, &same_key));

        let mut other_mate = a.clone();
        other_mate.mate = Mate::Second;
        assert!(!is_dup(&a, &other_mate));

        let mut other_score = a.clone();
        other_score.score = 6.0;
        assert!(!is_dup(&a, &other_score));

        assert!(is_dup(&a, &a.clone()));
    }

    #[test]
    fn triplicate_collapses_to_one() {
        let rec = read("r1", 2, 0, 100);
        let mut records = vec![rec.clone(), rec.clone(), rec];
        sort_records(&mut records);

        let records = remove_duplicates(records);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ident, "r1");
        assert_eq!(records[1].bc, 0);
    }

    #[test]
    fn first_occurrence_survives() {
        let mut first = read("r1", 2, 0, 100);
        first.seq = b"AAAA".to_vec();
        let mut second = first.clone();
        second.seq = b"CCCC".to_vec();

        let records = remove_duplicates(vec![first, second]);

        assert_eq!(records[0].seq, b"AAAA".to_vec());
    }

    #[test]
    fn dedup_is_idempotent() {
        let rec = read("r1", 2, 0, 100);
        let other = read("r2", 2, 0, 200);
        let mut records = vec![rec.clone(), rec, other];
        sort_records(&mut records);

        let mut once = remove_duplicates(records);
        once.pop();

        let expected: Vec<(String, u64)> =
            once.iter().map(|r| (r.ident.clone(), r.bc)).collect();
        let mut twice = remove_duplicates(once);
        twice.pop();

        let got: Vec<(String, u64)> =
            twice.iter().map(|r| (r.ident.clone(), r.bc)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn non_adjacent_duplicates_survive() {
        let rec = read("r1", 2, 0, 100);
        let other = read("r2", 2, 0, 200);

        // Unsorted input: the two copies of r1 are separated.
        let records = remove_duplicates(vec![rec.clone(), other, rec]);

        assert_eq!(records.len(), 4);
    }
}
