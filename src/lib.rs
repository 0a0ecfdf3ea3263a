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

//! sambx is a library for:
//!
//!   - Deduplicating barcoded paired-end alignment records produced by an
//!     alignment engine.
//!   - Sorting the surviving records into a deterministic order by barcode,
//!     chromosome, and position.
//!   - Formatting the sorted records as [SAM](https://samtools.github.io/hts-specs/SAMv1.pdf)
//!     alignment lines.
//!
//! The alignment engine itself, barcode encoding, and file handling are left
//! to the caller; sambx consumes [AlignedRead] values and writes bytes to
//! anything that implements [Write](std::io::Write).
//!
//! ## Rust API
//!
//! [write_sam] runs the whole pipeline (sort, deduplicate, format) over an
//! owned batch of records. For use cases requiring access to a single output
//! line at a time, [SamPrinter](printer::SamPrinter) iterates over the
//! formatted lines of a batch, and
//! [write_sam_record](printer::sam::write_sam_record) formats one record.
//!
//! Chromosome names, barcode decoding, per-mate read lengths, and the
//! optional read group are supplied through the [SamRefs](printer::SamRefs)
//! trait; [RefTables](printer::RefTables) is a ready-made table-backed
//! implementation.
//!
//! Records are matched to their mates by identity hashes memoized on the
//! record, see [AlignedRead::hash] and [AlignedRead::mate_hash].

use std::cell::OnceCell;
use std::hash::{Hash, Hasher};
use std::io::Write;

use crate::printer::SamPrinter;
use crate::printer::SamRefs;

pub mod dedup;
pub mod printer;

type E = Box<dyn std::error::Error>;

/// Which read of a pair a record represents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mate {
    #[default]
    First,
    Second,
}

impl Mate {
    /// 0 for the first mate, 1 for the second.
    pub fn ordinal(self) -> u32 {
        match self {
            Mate::First => 0,
            Mate::Second => 1,
        }
    }

    /// The opposite mate.
    pub fn other(self) -> Mate {
        match self {
            Mate::First => Mate::Second,
            Mate::Second => Mate::First,
        }
    }
}

/// A single CIGAR operation type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CigarOp {
    Match,
    Insert,
    Delete,
    SoftClip,
    HardClip,
}

/// Alignment detail carried by a record: the CIGAR as (length, operation)
/// pairs and the edit distance to the reference.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Alignment {
    pub cigar: Vec<(u32, CigarOp)>,
    pub edit_dist: u32,
}

/// One aligned read of a barcoded pair.
///
/// Constructed by the alignment engine; sambx only sorts, deduplicates, and
/// formats these. Both mates of a pair share `ident`; `seq`/`qual` hold this
/// mate's bases and qualities while `mate_seq`/`mate_qual` hold the other
/// mate's, so an unmapped mate can still be emitted from the record that did
/// align. The number of bytes serialized from each buffer is the fixed
/// per-mate read length from [SamRefs](printer::SamRefs), not the buffer
/// length.
///
/// Barcode 0 is reserved: [remove_duplicates](dedup::remove_duplicates)
/// appends a default record (`bc == 0`) as a terminator and
/// [SamPrinter](printer::SamPrinter) stops at it.
///
/// The `hash` and `mate_hash` fields memoize the identity hashes; they are
/// managed by [AlignedRead::hash] and [AlignedRead::mate_hash] and should not
/// be set by callers.
#[derive(Clone, Debug, Default)]
pub struct AlignedRead {
    /// Read-pair identifier, shared by both mates.
    pub ident: String,
    /// Which mate of the pair this record is.
    pub mate: Mate,
    /// 2-bit packed barcode token. 0 is reserved as the batch terminator.
    pub bc: u64,
    /// Reference sequence index.
    pub chrom: u32,
    /// Genomic coordinate, emitted as-is.
    pub pos: u32,
    /// Alignment orientation.
    pub rev: bool,
    /// Alignment score, only compared for duplicate detection.
    pub score: f64,
    /// CIGAR and edit distance.
    pub aln: Alignment,
    /// Bases of this mate.
    pub seq: Vec<u8>,
    /// Qualities of this mate.
    pub qual: Vec<u8>,
    /// Bases of the other mate.
    pub mate_seq: Vec<u8>,
    /// Qualities of the other mate.
    pub mate_qual: Vec<u8>,
    /// Memoized identity hash.
    pub hash: OnceCell<u32>,
    /// Memoized identity hash of the mate.
    pub mate_hash: OnceCell<u32>,
}

/// Deterministic 32-bit hash of a read-pair identifier.
pub fn hash_ident(ident: &str) -> u32 {
    let mut hasher = ahash::AHasher::default();
    ident.hash(&mut hasher);
    hasher.finish() as u32
}

impl AlignedRead {
    /// Identity hash of this record, a pure function of `(ident, mate)`.
    ///
    /// Computed on first use and memoized; later calls return the cached
    /// value even if other fields have been mutated in between.
    pub fn hash(&self) -> u32 {
        *self
            .hash
            .get_or_init(|| hash_ident(&self.ident).wrapping_mul(self.mate.ordinal() + 1))
    }

    /// The identity hash this record's mate would have.
    ///
    /// Computable without the mate record present. Memoized separately from
    /// [AlignedRead::hash].
    pub fn mate_hash(&self) -> u32 {
        *self
            .mate_hash
            .get_or_init(|| hash_ident(&self.ident).wrapping_mul(2 - self.mate.ordinal()))
    }

    /// True iff `other` is the same read as this record.
    ///
    /// The hashes are compared first as a cheap filter; the identifier
    /// strings are the authority, so hash collisions never produce a false
    /// positive.
    pub fn is_same(&self, other: &AlignedRead) -> bool {
        self.hash() == other.hash() && self.mate == other.mate && self.ident == other.ident
    }

    /// True iff `other` is the mate of this record.
    pub fn is_mate(&self, other: &AlignedRead) -> bool {
        self.mate_hash() == other.hash() && self.mate != other.mate && self.ident == other.ident
    }
}

/// Sort, deduplicate, and format a batch of records as SAM lines.
///
/// Consumes the batch, sorts it with [sort_records](dedup::sort_records),
/// collapses exact duplicates with
/// [remove_duplicates](dedup::remove_duplicates), and writes one line per
/// surviving record to `conn_out` in the post-sort order. Records whose mate
/// is not in the batch additionally produce an unmapped placeholder line for
/// the missing mate.
///
/// `gamma` is the global error probability estimate, `0 <= gamma < 1`.
///
/// ## Errors and panics
///
/// Fails fast without writing any output if `gamma` is NaN or out of domain.
/// A record whose sequence cannot be reverse-complemented terminates the
/// pipeline with [SamPrintError](printer::sam::SamPrintError); the line it
/// would have produced is not written.
///
/// ## Usage
///
/// ```rust
/// use sambx::{write_sam, AlignedRead, Alignment, CigarOp, Mate};
/// use sambx::printer::RefTables;
///
/// let refs = RefTables {
///     chroms: vec![("chr1".to_string(), 1000)],
///     bc_len: 4,
///     mate1_len: 8,
///     mate2_len: 6,
///     read_group: None,
/// };
///
/// let r1 = AlignedRead {
///     ident: "read1".to_string(),
///     mate: Mate::First,
///     bc: 27,
///     chrom: 0,
///     pos: 100,
///     rev: false,
///     score: 10.0,
///     aln: Alignment { cigar: vec![(8, CigarOp::Match)], edit_dist: 0 },
///     seq: b"ACGTACGT".to_vec(),
///     qual: b"FFFFFFFF".to_vec(),
///     mate_seq: b"GGGTTT".to_vec(),
///     mate_qual: b"ABCDEF".to_vec(),
///     ..Default::default()
/// };
/// let r2 = AlignedRead {
///     ident: "read1".to_string(),
///     mate: Mate::Second,
///     bc: 27,
///     chrom: 0,
///     pos: 150,
///     rev: true,
///     score: 9.0,
///     aln: Alignment { cigar: vec![(6, CigarOp::Match)], edit_dist: 1 },
///     seq: b"GGGTTT".to_vec(),
///     qual: b"ABCDEF".to_vec(),
///     mate_seq: b"ACGTACGT".to_vec(),
///     mate_qual: b"FFFFFFFF".to_vec(),
///     ..Default::default()
/// };
///
/// // A second aligner hit at the same coordinates is an exact duplicate.
/// let records = vec![r2, r1.clone(), r1];
///
/// let mut output: Vec<u8> = Vec::new();
/// write_sam(records, 0.98, &refs, &mut output).unwrap();
///
/// let mut expected: Vec<u8> = Vec::new();
/// expected.append(&mut b"read1\t99\tchr1\t100\t39\t8M\t=\t150\t56\tACGTACGT\tFFFFFFFF\tNM:i:0\tBX:Z:ACGT-1\tXG:f:0.98\n".to_vec());
/// expected.append(&mut b"read1\t147\tchr1\t150\t39\t6M\t=\t100\t-56\tAAACCC\tFEDCBA\tNM:i:1\tBX:Z:ACGT-1\tXG:f:0.98\n".to_vec());
///
/// assert_eq!(output, expected);
/// ```
pub fn write_sam<W: Write, R: SamRefs>(
    records: Vec<AlignedRead>,
    gamma: f64,
    refs: &R,
    conn_out: &mut W,
) -> Result<(), E> {
    let mut records = records;
    log::debug!("formatting a batch of {} records", records.len());

    dedup::sort_records(&mut records);
    let records = dedup::remove_duplicates(records);

    let printer = SamPrinter::new(&records, gamma, refs)?;
    for line in printer {
        conn_out.write_all(&line?)?;
    }
    conn_out.flush()?;

    Ok(())
}
