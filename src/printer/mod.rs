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

//! Printer for formatting sorted, deduplicated [AlignedRead] batches as SAM
//! lines.
//!
//! Returns 1 line at a time using next(). Mates are resolved within the
//! batch through the memoized identity hashes; a record whose mate is not in
//! the batch is followed by the unmapped placeholder line for the missing
//! mate, built from the record's own `mate_seq`/`mate_qual` buffers.
//!
//! ## Usage
//!
//! ```rust
//! use sambx::{AlignedRead, Alignment, CigarOp, Mate};
//! use sambx::printer::{RefTables, SamPrinter};
//!
//! let refs = RefTables {
//!     chroms: vec![("chr1".to_string(), 1000)],
//!     bc_len: 4,
//!     mate1_len: 4,
//!     mate2_len: 4,
//!     read_group: None,
//! };
//!
//! // One aligned read whose mate did not align.
//! let records = vec![AlignedRead {
//!     ident: "read7".to_string(),
//!     mate: Mate::First,
//!     bc: 27,
//!     chrom: 0,
//!     pos: 100,
//!     score: 11.0,
//!     aln: Alignment { cigar: vec![(4, CigarOp::Match)], edit_dist: 2 },
//!     seq: b"ACGT".to_vec(),
//!     qual: b"IIII".to_vec(),
//!     mate_seq: b"TTTT".to_vec(),
//!     mate_qual: b"8888".to_vec(),
//!     ..Default::default()
//! }];
//!
//! let printer = SamPrinter::new(&records, 0.9, &refs).unwrap();
//! let lines = printer.collect::<Result<Vec<Vec<u8>>, _>>().unwrap();
//!
//! // The aligned line and the placeholder for the unmapped mate.
//! assert_eq!(lines.len(), 2);
//! assert_eq!(lines[0], b"read7\t73\tchr1\t100\t23\t4M\t*\t0\t0\tACGT\tIIII\tNM:i:2\tBX:Z:ACGT-1\tXG:f:0.9\n".to_vec());
//! assert_eq!(lines[1], b"read7\t135\t*\t0\t255\t*\tchr1\t100\t0\tTTTT\t8888\tBX:Z:ACGT-1\n".to_vec());
//! ```

use indexmap::IndexMap;

use crate::AlignedRead;
use crate::Mate;

// Format specific implementation
pub mod sam;

use sam::write_sam_record;
pub use sam::SamPrintError;

type E = Box<dyn std::error::Error>;

/// Lookups the alignment engine configuration provides to the printer.
///
/// These replace upstream state the printer has no business owning:
/// chromosome naming, barcode decoding, the fixed per-mate read lengths, and
/// the optional read group. Implementations must be pure and total for all
/// values the batch can contain.
pub trait SamRefs {
    /// Name of the reference sequence with index `chrom`.
    fn chrom_name(&self, chrom: u32) -> &str;

    /// Textual form of the 2-bit packed barcode `bc`.
    fn decode_barcode(&self, bc: u64) -> String;

    /// Fixed read length of the given mate.
    fn read_len(&self, mate: Mate) -> usize;

    /// Read-group identifier for the `RG:Z:` tag, if configured.
    fn read_group(&self) -> Option<&str>;
}

/// Table-backed [SamRefs] implementation.
///
/// `chroms` pairs reference names with their lengths in index order (the
/// lengths are only consumed by [build_sam_header](sam::build_sam_header)).
/// Barcodes are decoded as `bc_len` bases packed 2 bits per base, low bits
/// holding the last base.
#[derive(Clone, Debug, Default)]
pub struct RefTables {
    pub chroms: Vec<(String, usize)>,
    pub bc_len: usize,
    pub mate1_len: usize,
    pub mate2_len: usize,
    pub read_group: Option<String>,
}

impl SamRefs for RefTables {
    fn chrom_name(&self, chrom: u32) -> &str {
        &self.chroms[chrom as usize].0
    }

    fn decode_barcode(&self, bc: u64) -> String {
        let mut bases = vec!['A'; self.bc_len];
        let mut bc = bc;
        for i in (0..self.bc_len).rev() {
            bases[i] = ['A', 'C', 'G', 'T'][(bc & 3) as usize];
            bc >>= 2;
        }
        bases.into_iter().collect()
    }

    fn read_len(&self, mate: Mate) -> usize {
        match mate {
            Mate::First => self.mate1_len,
            Mate::Second => self.mate2_len,
        }
    }

    fn read_group(&self) -> Option<&str> {
        self.read_group.as_deref()
    }
}

/// Iterator over the SAM lines of a sorted, deduplicated batch.
///
/// Construction validates `gamma` so that a bad configuration fails before
/// any line is produced. The batch may end with the terminator record
/// appended by [remove_duplicates](crate::dedup::remove_duplicates);
/// iteration stops at the first record with barcode 0.
#[derive(Debug)]
pub struct SamPrinter<'a, R: SamRefs> {
    // Inputs
    records: &'a [AlignedRead],
    refs: &'a R,
    gamma: f64,

    // Internals
    by_hash: IndexMap<u32, Vec<usize>>,
    index: usize,
    pending: Option<Vec<u8>>,
}

impl<'a, R: SamRefs> SamPrinter<'a, R> {
    pub fn new(records: &'a [AlignedRead], gamma: f64, refs: &'a R) -> Result<Self, E> {
        if gamma.is_nan() || !(0.0..1.0).contains(&gamma) {
            return Err(Box::new(SamPrintError::BadGamma(gamma)));
        }

        let end = records
            .iter()
            .position(|rec| rec.bc == 0)
            .unwrap_or(records.len());
        let records = &records[..end];

        let mut by_hash: IndexMap<u32, Vec<usize>> = IndexMap::new();
        for (i, rec) in records.iter().enumerate() {
            by_hash.entry(rec.hash()).or_default().push(i);
        }

        Ok(SamPrinter {
            records,
            refs,
            gamma,
            by_hash,
            index: 0,
            pending: None,
        })
    }

    /// The mate of `rec` within the batch, if it aligned.
    fn find_mate(&self, rec: &AlignedRead) -> Option<&'a AlignedRead> {
        let records = self.records;
        let candidates = self.by_hash.get(&rec.mate_hash())?;
        candidates
            .iter()
            .map(|&i| &records[i])
            .find(|other| rec.is_mate(other))
    }
}

impl<R: SamRefs> Iterator for SamPrinter<'_, R> {
    type Item = Result<Vec<u8>, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(line) = self.pending.take() {
            return Some(Ok(line));
        }
        if self.index >= self.records.len() {
            return None;
        }

        let records = self.records;
        let rec = &records[self.index];
        self.index += 1;

        let mate = self.find_mate(rec);

        let mut line: Vec<u8> = Vec::new();
        if let Err(e) = write_sam_record(Some(rec), mate, self.gamma, self.refs, &mut line) {
            return Some(Err(e));
        }

        if mate.is_none() {
            let mut placeholder: Vec<u8> = Vec::new();
            if let Err(e) =
                write_sam_record(None, Some(rec), self.gamma, self.refs, &mut placeholder)
            {
                return Some(Err(e));
            }
            self.pending = Some(placeholder);
        }

        Some(Ok(line))
    }
}
