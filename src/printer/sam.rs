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

//! Formatting of single [AlignedRead] records as SAM alignment lines, and
//! SAM header construction.

use std::cmp::Ordering;
use std::io::Write;
use std::num::NonZeroUsize;

use bstr::BString;
use indexmap::map::IndexMap;
use noodles_sam::{
    self as sam,
    alignment::record::Flags,
    header::record::value::{map::ReadGroup, map::ReferenceSequence, Map},
};

use super::SamRefs;
use crate::AlignedRead;
use crate::CigarOp;
use crate::Mate;

type E = Box<dyn std::error::Error>;

/// Formatting failures for a single record.
///
/// All of these are rejected before any bytes reach the output sink.
#[derive(Debug, Clone, PartialEq)]
pub enum SamPrintError {
    /// Neither the record nor its mate was given.
    NoRecords,
    /// The error probability was NaN or outside `[0, 1)`.
    BadGamma(f64),
    /// A sequence symbol outside `ACGTN` cannot be reverse-complemented;
    /// the record is malformed upstream.
    BadNucleotide(u8),
}

impl std::fmt::Display for SamPrintError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SamPrintError::NoRecords => write!(f, "need a record or its mate to format"),
            SamPrintError::BadGamma(gamma) => {
                write!(f, "error probability {} is outside [0, 1)", gamma)
            }
            SamPrintError::BadNucleotide(symbol) => {
                write!(f, "cannot reverse-complement symbol {:#04x}", symbol)
            }
        }
    }
}

impl std::error::Error for SamPrintError {}

/// Reference span of a CIGAR: total length of match and delete operations.
fn reference_span(cigar: &[(u32, CigarOp)]) -> i64 {
    cigar
        .iter()
        .filter(|(_, op)| matches!(op, CigarOp::Match | CigarOp::Delete))
        .map(|(len, _)| *len as i64)
        .sum()
}

fn complement(symbol: u8) -> Result<u8, SamPrintError> {
    match symbol {
        b'A' => Ok(b'T'),
        b'C' => Ok(b'G'),
        b'G' => Ok(b'C'),
        b'T' => Ok(b'A'),
        b'N' => Ok(b'N'),
        other => Err(SamPrintError::BadNucleotide(other)),
    }
}

// Note: hard clips are emitted as soft clips.
fn op_char(op: CigarOp) -> char {
    match op {
        CigarOp::Match => 'M',
        CigarOp::Insert => 'I',
        CigarOp::Delete => 'D',
        CigarOp::SoftClip | CigarOp::HardClip => 'S',
    }
}

/// Mapping quality from the error probability estimate, capped at 254.
fn mapq(gamma: f64) -> u32 {
    let gamma_phred = -10.0 * (1.0 - gamma).ln();
    if gamma_phred > 253.0 {
        254
    } else {
        gamma_phred.round() as u32
    }
}

/// Renders `x` the way C's `%.5g` does: 5 significant digits, trailing
/// zeros trimmed, two-digit exponent below 1e-4.
fn format_sig(x: f64) -> String {
    const SIG: i32 = 5;

    if x == 0.0 {
        return "0".to_string();
    }

    let exp = x.abs().log10().floor() as i32;
    if exp < -4 || exp >= SIG {
        let formatted = format!("{:.*e}", (SIG - 1) as usize, x);
        let (mantissa, exponent) = formatted.split_once('e').unwrap_or((&formatted, "0"));
        let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
        let exponent: i32 = exponent.parse().unwrap_or(0);
        let exp_sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, exp_sign, exponent.abs())
    } else {
        let decimals = (SIG - 1 - exp).max(0) as usize;
        let mut out = format!("{:.*}", decimals, x);
        if out.contains('.') {
            while out.ends_with('0') {
                out.pop();
            }
            if out.ends_with('.') {
                out.pop();
            }
        }
        out
    }
}

/// Format one record as a SAM line.
///
/// `rec` is the record being emitted and `mate` its mate, either of which
/// may be absent (but not both). When `rec` is absent the line is the
/// unmapped placeholder for `mate`'s missing partner, built from the mate's
/// buffers. `gamma` is the global error probability estimate.
///
/// The line is assembled in memory and written to `conn` with a single
/// `write_all` call, so nothing is written when formatting fails.
///
/// Reversed records have their sequence reverse-complemented and their
/// quality string reversed. Hard clips in the CIGAR are emitted as soft
/// clips. The `NM`, `BX`, and `XG` tags are attached to mapped lines, `BX`
/// alone to unmapped ones, and `RG` whenever [SamRefs::read_group] is
/// configured (truncated at the first whitespace).
///
/// ## Errors and panics
///
/// Terminates with [SamPrintError] if both `rec` and `mate` are None, if
/// `gamma` is NaN or outside `[0, 1)`, or if a reversed sequence contains a
/// symbol outside `ACGTN`.
pub fn write_sam_record<W: Write, R: SamRefs>(
    rec: Option<&AlignedRead>,
    mate: Option<&AlignedRead>,
    gamma: f64,
    refs: &R,
    conn: &mut W,
) -> Result<(), E> {
    if gamma.is_nan() || !(0.0..1.0).contains(&gamma) {
        return Err(Box::new(SamPrintError::BadGamma(gamma)));
    }

    let (ident, chrom, pos, quality, read_len, bc, seq, qual) = match (rec, mate) {
        (Some(rec), _) => (
            rec.ident.as_str(),
            refs.chrom_name(rec.chrom),
            rec.pos,
            mapq(gamma),
            refs.read_len(rec.mate),
            rec.bc,
            rec.seq.as_slice(),
            rec.qual.as_slice(),
        ),
        (None, Some(mate)) => (
            mate.ident.as_str(),
            "*",
            0,
            255,
            refs.read_len(mate.mate.other()),
            mate.bc,
            mate.mate_seq.as_slice(),
            mate.mate_qual.as_slice(),
        ),
        (None, None) => return Err(Box::new(SamPrintError::NoRecords)),
    };

    let mut flag = Flags::SEGMENTED;
    if let Some(rec) = rec {
        if rec.rev {
            flag |= Flags::REVERSE_COMPLEMENTED;
        }
        flag |= match rec.mate {
            Mate::First => Flags::FIRST_SEGMENT,
            Mate::Second => Flags::LAST_SEGMENT,
        };
    } else if let Some(mate) = mate {
        flag |= Flags::UNMAPPED;
        flag |= match mate.mate {
            Mate::First => Flags::LAST_SEGMENT,
            Mate::Second => Flags::FIRST_SEGMENT,
        };
    }
    if let Some(mate) = mate {
        flag |= Flags::PROPERLY_SEGMENTED;
        if mate.rev {
            flag |= Flags::MATE_REVERSE_COMPLEMENTED;
        }
    } else {
        flag |= Flags::MATE_UNMAPPED;
    }

    let mut line: Vec<u8> = Vec::new();

    // basics
    write!(line, "{}\t{}\t{}\t{}\t{}\t", ident, flag.bits(), chrom, pos, quality)?;

    // cigar
    match rec {
        Some(rec) => {
            for (len, op) in &rec.aln.cigar {
                write!(line, "{}{}", len, op_char(*op))?;
            }
        }
        None => line.push(b'*'),
    }

    // mate mapping
    match mate {
        Some(mate) => {
            let same_chrom = rec.is_some_and(|rec| rec.chrom == mate.chrom);
            let mate_chrom = if same_chrom {
                "="
            } else {
                refs.chrom_name(mate.chrom)
            };
            write!(line, "\t{}\t{}", mate_chrom, mate.pos)?;

            match rec {
                Some(rec) if same_chrom => {
                    if rec.aln.cigar.is_empty() || mate.aln.cigar.is_empty() {
                        write!(line, "\t0")?;
                    } else {
                        let p0 = rec.pos as i64
                            + if rec.rev { reference_span(&rec.aln.cigar) - 1 } else { 0 };
                        let p1 = mate.pos as i64
                            + if mate.rev { reference_span(&mate.aln.cigar) - 1 } else { 0 };
                        let shift = match p0.cmp(&p1) {
                            Ordering::Greater => 1,
                            Ordering::Less => -1,
                            Ordering::Equal => 0,
                        };
                        write!(line, "\t{}", -(p0 - p1 + shift))?;
                    }
                }
                _ => write!(line, "\t0")?,
            }
        }
        None => write!(line, "\t*\t0\t0")?,
    }

    // seq and qual
    line.push(b'\t');
    if rec.is_some_and(|rec| rec.rev) {
        for i in (0..read_len).rev() {
            line.push(complement(seq[i])?);
        }
        line.push(b'\t');
        for i in (0..read_len).rev() {
            line.push(qual[i]);
        }
    } else {
        line.extend_from_slice(&seq[..read_len]);
        line.push(b'\t');
        line.extend_from_slice(&qual[..read_len]);
    }

    // tags
    let bc_str = refs.decode_barcode(bc);
    match rec {
        Some(rec) => write!(
            line,
            "\tNM:i:{}\tBX:Z:{}-1\tXG:f:{}",
            rec.aln.edit_dist,
            bc_str,
            format_sig(gamma)
        )?,
        None => write!(line, "\tBX:Z:{}-1", bc_str)?,
    }

    if let Some(rg_id) = refs.read_group() {
        let rg_id = rg_id.split(char::is_whitespace).next().unwrap_or("");
        write!(line, "\tRG:Z:{}", rg_id)?;
    }
    line.push(b'\n');

    conn.write_all(&line)?;
    Ok(())
}

/// Build a SAM header with one `@SQ` per chromosome and an optional `@RG`.
///
/// `chroms` pairs each chromosome name with its length in the order used by
/// the record `chrom` indexes. The read-group identifier is truncated at the
/// first whitespace, matching the `RG:Z:` tag on the alignment lines.
pub fn build_sam_header(
    chroms: &[(String, usize)],
    read_group: Option<&str>,
) -> Result<sam::Header, E> {
    let refs = chroms
        .iter()
        .map(|(name, len)| {
            (
                BString::from(name.clone()),
                Map::<ReferenceSequence>::new(
                    NonZeroUsize::try_from(*len).unwrap_or(NonZeroUsize::MIN),
                ),
            )
        })
        .collect::<IndexMap<BString, Map<ReferenceSequence>>>();

    let mut builder = sam::Header::builder()
        .set_header(Default::default())
        .set_reference_sequences(refs);

    if let Some(rg_id) = read_group {
        let rg_id = rg_id.split(char::is_whitespace).next().unwrap_or("");
        builder = builder.add_read_group(BString::from(rg_id), Map::<ReadGroup>::default());
    }

    Ok(builder.build())
}

/// Serialize a header built with [build_sam_header].
pub fn write_sam_header<W: Write>(header: &sam::Header, conn: &mut W) -> Result<(), E> {
    let mut writer = sam::io::Writer::new(conn);
    writer.write_header(header)?;
    Ok(())
}

// Tests
#[cfg(test)]
mod tests {
    use super::build_sam_header;
    use super::format_sig;
    use super::write_sam_header;
    use super::write_sam_record;
    use super::SamPrintError;
    use crate::printer::RefTables;
    use crate::AlignedRead;
    use crate::Alignment;
    use crate::CigarOp;
    use crate::Mate;

    fn refs() -> RefTables {
        RefTables {
            chroms: vec![("chr1".to_string(), 1000), ("chr2".to_string(), 500)],
            bc_len: 4,
            mate1_len: 8,
            mate2_len: 6,
            read_group: None,
        }
    }

    fn pair() -> (AlignedRead, AlignedRead) {
        let r1 = AlignedRead {
            ident: "read1".to_string(),
            mate: Mate::First,
            bc: 27,
            chrom: 0,
            pos: 100,
            rev: false,
            score: 10.0,
            aln: Alignment { cigar: vec![(8, CigarOp::Match)], edit_dist: 0 },
            seq: b"ACGTACGT".to_vec(),
            qual: b"FFFFFFFF".to_vec(),
            mate_seq: b"GGGTTT".to_vec(),
            mate_qual: b"ABCDEF".to_vec(),
            ..Default::default()
        };
        let r2 = AlignedRead {
            ident: "read1".to_string(),
            mate: Mate::Second,
            bc: 27,
            chrom: 0,
            pos: 150,
            rev: true,
            score: 9.0,
            aln: Alignment { cigar: vec![(6, CigarOp::Match)], edit_dist: 1 },
            seq: b"GGGTTT".to_vec(),
            qual: b"ABCDEF".to_vec(),
            mate_seq: b"ACGTACGT".to_vec(),
            mate_qual: b"FFFFFFFF".to_vec(),
            ..Default::default()
        };
        (r1, r2)
    }

    fn fields(line: &[u8]) -> Vec<String> {
        String::from_utf8(line.to_vec())
            .unwrap()
            .trim_end()
            .split('\t')
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn mapped_pair_lines() {
        let (r1, r2) = pair();
        let refs = refs();

        let mut got: Vec<u8> = Vec::new();
        write_sam_record(Some(&r1), Some(&r2), 0.98, &refs, &mut got).unwrap();

        let expected: Vec<u8> = b"read1\t99\tchr1\t100\t39\t8M\t=\t150\t56\tACGTACGT\tFFFFFFFF\tNM:i:0\tBX:Z:ACGT-1\tXG:f:0.98\n".to_vec();
        assert_eq!(got, expected);

        let mut got: Vec<u8> = Vec::new();
        write_sam_record(Some(&r2), Some(&r1), 0.98, &refs, &mut got).unwrap();

        let expected: Vec<u8> = b"read1\t147\tchr1\t150\t39\t6M\t=\t100\t-56\tAAACCC\tFEDCBA\tNM:i:1\tBX:Z:ACGT-1\tXG:f:0.98\n".to_vec();
        assert_eq!(got, expected);
    }

    #[test]
    fn unmapped_placeholder_line() {
        let rec = AlignedRead {
            ident: "read7".to_string(),
            mate: Mate::First,
            bc: 27,
            chrom: 0,
            pos: 100,
            aln: Alignment { cigar: vec![(8, CigarOp::Match)], edit_dist: 2 },
            seq: b"ACGTACGT".to_vec(),
            qual: b"IIIIIIII".to_vec(),
            mate_seq: b"TTTTTT".to_vec(),
            mate_qual: b"888888".to_vec(),
            ..Default::default()
        };

        let mut got: Vec<u8> = Vec::new();
        write_sam_record(None, Some(&rec), 0.9, &refs(), &mut got).unwrap();

        let expected: Vec<u8> =
            b"read7\t135\t*\t0\t255\t*\tchr1\t100\t0\tTTTTTT\t888888\tBX:Z:ACGT-1\n".to_vec();
        assert_eq!(got, expected);
    }

    #[test]
    fn hard_clips_become_soft_clips() {
        let (mut r1, _) = pair();
        r1.aln.cigar = vec![(5, CigarOp::HardClip), (10, CigarOp::Match)];

        let mut got: Vec<u8> = Vec::new();
        write_sam_record(Some(&r1), None, 0.5, &refs(), &mut got).unwrap();

        assert_eq!(fields(&got)[5], "5S10M");
    }

    #[test]
    fn mapq_is_rounded_and_capped() {
        let (r1, _) = pair();
        let refs = refs();

        let mut got: Vec<u8> = Vec::new();
        write_sam_record(Some(&r1), None, 0.0, &refs, &mut got).unwrap();
        assert_eq!(fields(&got)[4], "0");

        let mut got: Vec<u8> = Vec::new();
        write_sam_record(Some(&r1), None, 0.9, &refs, &mut got).unwrap();
        assert_eq!(fields(&got)[4], "23");

        let mut got: Vec<u8> = Vec::new();
        write_sam_record(Some(&r1), None, 1.0 - 1e-12, &refs, &mut got).unwrap();
        assert_eq!(fields(&got)[4], "254");
    }

    #[test]
    fn tlen_is_zero_for_empty_cigar_and_equal_outer_coordinates() {
        let (mut r1, mut r2) = pair();

        r2.aln.cigar.clear();
        let mut got: Vec<u8> = Vec::new();
        write_sam_record(Some(&r1), Some(&r2), 0.5, &refs(), &mut got).unwrap();
        assert_eq!(fields(&got)[8], "0");

        // Same outer coordinate on both sides.
        r2.aln.cigar = vec![(6, CigarOp::Match)];
        r2.rev = false;
        r2.pos = 100;
        r1.rev = false;
        let mut got: Vec<u8> = Vec::new();
        write_sam_record(Some(&r1), Some(&r2), 0.5, &refs(), &mut got).unwrap();
        assert_eq!(fields(&got)[8], "0");
    }

    #[test]
    fn mate_on_other_chromosome() {
        let (r1, mut r2) = pair();
        r2.chrom = 1;

        let mut got: Vec<u8> = Vec::new();
        write_sam_record(Some(&r1), Some(&r2), 0.5, &refs(), &mut got).unwrap();

        let fields = fields(&got);
        assert_eq!(fields[6], "chr2");
        assert_eq!(fields[8], "0");
    }

    #[test]
    fn invalid_nucleotide_is_an_error() {
        let (_, mut r2) = pair();
        r2.seq = b"GGGTTX".to_vec();

        let mut got: Vec<u8> = Vec::new();
        let err = write_sam_record(Some(&r2), None, 0.5, &refs(), &mut got).unwrap_err();

        assert_eq!(
            err.downcast_ref::<SamPrintError>(),
            Some(&SamPrintError::BadNucleotide(b'X'))
        );
        assert!(got.is_empty());
    }

    #[test]
    fn preconditions_are_rejected_before_output() {
        let (r1, _) = pair();
        let refs = refs();

        let mut got: Vec<u8> = Vec::new();
        let err = write_sam_record(Some(&r1), None, f64::NAN, &refs, &mut got).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SamPrintError>(),
            Some(SamPrintError::BadGamma(_))
        ));
        assert!(got.is_empty());

        let err = write_sam_record(Some(&r1), None, 1.0, &refs, &mut got).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SamPrintError>(),
            Some(SamPrintError::BadGamma(_))
        ));
        assert!(got.is_empty());

        let err = write_sam_record(None, None, 0.5, &refs, &mut got).unwrap_err();
        assert_eq!(
            err.downcast_ref::<SamPrintError>(),
            Some(&SamPrintError::NoRecords)
        );
        assert!(got.is_empty());
    }

    #[test]
    fn read_group_is_truncated_at_whitespace() {
        let (r1, _) = pair();
        let mut refs = refs();
        refs.read_group = Some("rg1 20260829".to_string());

        let mut got: Vec<u8> = Vec::new();
        write_sam_record(Some(&r1), None, 0.5, &refs, &mut got).unwrap();

        assert!(got.ends_with(b"\tRG:Z:rg1\n"));
    }

    #[test]
    fn gamma_is_formatted_like_printf_g() {
        assert_eq!(format_sig(0.0), "0");
        assert_eq!(format_sig(0.5), "0.5");
        assert_eq!(format_sig(0.98), "0.98");
        assert_eq!(format_sig(0.123456), "0.12346");
        assert_eq!(format_sig(0.9999999), "1");
        assert_eq!(format_sig(0.000012345), "1.2345e-05");
    }

    #[test]
    fn header_carries_chromosomes_and_read_group() {
        let refs = refs();
        let header = build_sam_header(&refs.chroms, Some("rg1 20260829")).unwrap();

        assert_eq!(header.reference_sequences().len(), 2);
        assert_eq!(header.read_groups().len(), 1);
        assert!(header.read_groups().contains_key(&bstr::BString::from("rg1")));

        let mut bytes: Vec<u8> = Vec::new();
        write_sam_header(&header, &mut bytes).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("@HD"));
        assert!(text.contains("SN:chr1"));
        assert!(text.contains("LN:1000"));
        assert!(text.contains("@RG"));
    }
}
