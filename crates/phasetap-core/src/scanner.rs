//! Signature scanner.
//!
//! Scans the target image's bytes for every signature in a table and
//! produces exactly one [`InjectionSite`] per signature. Zero matches and
//! two-or-more matches are both hard failures, surfaced with distinct
//! errors so a human can tell "binary revision changed" apart from
//! "signature no longer unique".

use memchr::memchr_iter;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::signature::{SignatureId, SignatureSpec};

/// One located signature: the patch-site address, the displaced original
/// bytes, any derived absolute address and any auxiliary captures.
#[derive(Debug, Clone)]
pub struct InjectionSite {
    pub id: SignatureId,
    /// Absolute patch-site (or function-entry) address.
    pub address: u64,
    /// Original bytes replayed by the generated stub, captured verbatim.
    pub captured: Vec<u8>,
    /// Absolute address derived from a rel32 operand adjacent to the match.
    pub derived: Option<u64>,
    /// Auxiliary instruction runs, captured verbatim.
    pub extra: Vec<Vec<u8>>,
    /// Secondary patch-site address for signatures that displace a second
    /// instruction run.
    pub extra_address: Option<u64>,
}

/// The complete, validated set of sites: one per table entry, in table
/// order.
#[derive(Debug)]
pub struct SiteSet {
    sites: Vec<InjectionSite>,
}

impl SiteSet {
    pub fn site(&self, id: SignatureId) -> &InjectionSite {
        &self.sites[id as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &InjectionSite> {
        self.sites.iter()
    }
}

/// Scan `image` (mapped at absolute address `base`) for every signature.
///
/// Each signature is matched over its full admissible range
/// `0..=len - window`; the bound is derived from the signature's own
/// window, and the scan does not stop at the first full set of matches, so
/// a duplicate appearing after the last first-match is still detected.
pub fn scan(image: &[u8], base: u64, specs: &[SignatureSpec]) -> Result<SiteSet> {
    let mut sites = Vec::with_capacity(specs.len());

    for (index, spec) in specs.iter().enumerate() {
        debug_assert_eq!(spec.id as usize, index);
        let site = scan_one(image, base, spec)?;
        trace!(
            signature = %spec.id,
            address = format_args!("{:#x}", site.address),
            "signature matched"
        );
        sites.push(site);
    }

    debug!(count = sites.len(), "all signatures matched exactly once");
    Ok(SiteSet { sites })
}

fn scan_one(image: &[u8], base: u64, spec: &SignatureSpec) -> Result<InjectionSite> {
    if image.len() < spec.window {
        return Err(Error::PatternNotFound(spec.id));
    }
    let last = image.len() - spec.window;

    let mut found: Option<usize> = None;
    let (anchor_offset, anchor_byte) = spec.pattern[0];
    debug_assert_eq!(anchor_offset, 0);

    for position in memchr_iter(anchor_byte, &image[..=last]) {
        if !matches_at(image, position, spec.pattern) {
            continue;
        }
        if found.is_some() {
            return Err(Error::DuplicatePattern(spec.id));
        }
        found = Some(position);
    }

    let position = found.ok_or(Error::PatternNotFound(spec.id))?;
    Ok(capture_site(image, base, position, spec))
}

fn matches_at(image: &[u8], position: usize, pattern: &[(usize, u8)]) -> bool {
    pattern
        .iter()
        .all(|&(offset, byte)| image[position + offset] == byte)
}

fn capture_site(image: &[u8], base: u64, position: usize, spec: &SignatureSpec) -> InjectionSite {
    let match_addr = base + position as u64;
    let slice_at = |offset: usize, len: usize| image[position + offset..position + offset + len].to_vec();

    let captured = spec
        .capture
        .map(|c| slice_at(c.offset, c.len))
        .unwrap_or_default();

    let derived = spec.operand.map(|op| {
        let o = position + op.offset;
        let value = i32::from_le_bytes([image[o], image[o + 1], image[o + 2], image[o + 3]]);
        (match_addr + (op.offset + op.tail) as u64).wrapping_add_signed(value as i64)
    });

    InjectionSite {
        id: spec.id,
        address: match_addr.wrapping_add_signed(spec.site_offset as i64),
        captured,
        derived,
        extra: spec.extra.iter().map(|e| slice_at(e.offset, e.len)).collect(),
        extra_address: spec
            .extra_site
            .map(|off| match_addr.wrapping_add_signed(off as i64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{CaptureRule, OperandRule, x86_64};

    const BASE: u64 = 0x40_0000;

    /// Plant a signature's constraint bytes at `position` in `buf`.
    fn plant(buf: &mut [u8], position: usize, spec: &SignatureSpec) {
        for &(offset, byte) in spec.pattern {
            buf[position + offset] = byte;
        }
    }

    /// A buffer that holds no stray anchor bytes.
    fn blank(len: usize) -> Vec<u8> {
        vec![0x90; len]
    }

    fn plant_all(buf: &mut [u8]) -> Vec<usize> {
        // Positions spaced wider than any window so the sparse patterns
        // cannot bleed into each other.
        let positions: Vec<usize> = (0..x86_64::SIGNATURES.len()).map(|i| 512 + i * 512).collect();
        for (spec, &pos) in x86_64::SIGNATURES.iter().zip(&positions) {
            plant(buf, pos, spec);
        }
        positions
    }

    #[test]
    fn test_exactly_one_site_per_signature() {
        let mut buf = blank(8192);
        let positions = plant_all(&mut buf);
        let sites = scan(&buf, BASE, &x86_64::SIGNATURES).unwrap();

        for (spec, &pos) in x86_64::SIGNATURES.iter().zip(&positions) {
            let site = sites.site(spec.id);
            let expected = (BASE + pos as u64).wrapping_add_signed(spec.site_offset as i64);
            assert_eq!(site.address, expected, "{}", spec.id);
            if let Some(c) = spec.capture {
                assert_eq!(site.captured.len(), c.len);
            } else {
                assert!(site.captured.is_empty());
            }
        }
    }

    #[test]
    fn test_derived_address_formula() {
        let mut buf = blank(8192);
        let positions = plant_all(&mut buf);

        // Write a known rel32 operand into the LoadDone match window.
        let spec = &x86_64::SIGNATURES[SignatureId::LoadDone as usize];
        let op = spec.operand.unwrap();
        let pos = positions[SignatureId::LoadDone as usize];
        let value: i32 = -0x1234;
        buf[pos + op.offset..pos + op.offset + 4].copy_from_slice(&value.to_le_bytes());

        let sites = scan(&buf, BASE, &x86_64::SIGNATURES).unwrap();
        let derived = sites.site(SignatureId::LoadDone).derived.unwrap();
        let expected = (BASE + (pos + op.offset + op.tail) as u64).wrapping_add_signed(value as i64);
        assert_eq!(derived, expected);
    }

    #[test]
    fn test_captured_bytes_are_verbatim() {
        let mut buf = blank(8192);
        let positions = plant_all(&mut buf);

        let spec = &x86_64::SIGNATURES[SignatureId::MenuLoad as usize];
        let c = spec.capture.unwrap();
        let pos = positions[SignatureId::MenuLoad as usize];
        for i in 0..c.len {
            buf[pos + c.offset + i] = 0xa0 + i as u8;
        }

        let sites = scan(&buf, BASE, &x86_64::SIGNATURES).unwrap();
        let captured = &sites.site(SignatureId::MenuLoad).captured;
        assert_eq!(captured.as_slice(), &buf[pos + c.offset..pos + c.offset + c.len]);
    }

    #[test]
    fn test_missing_signature_names_the_signature() {
        let mut buf = blank(8192);
        let positions = plant_all(&mut buf);

        // Break the MapLoadDone pattern.
        let spec = &x86_64::SIGNATURES[SignatureId::MapLoadDone as usize];
        let pos = positions[SignatureId::MapLoadDone as usize];
        buf[pos + spec.pattern[1].0] ^= 0xff;

        match scan(&buf, BASE, &x86_64::SIGNATURES) {
            Err(Error::PatternNotFound(id)) => assert_eq!(id, SignatureId::MapLoadDone),
            other => panic!("expected PatternNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_signature_is_rejected() {
        let mut buf = blank(8192);
        let _ = plant_all(&mut buf);

        // Second LoadDone occurrence late in the buffer, after every other
        // signature's single match.
        let spec = &x86_64::SIGNATURES[SignatureId::LoadDone as usize];
        plant(&mut buf, 7000, spec);

        match scan(&buf, BASE, &x86_64::SIGNATURES) {
            Err(Error::DuplicatePattern(id)) => assert_eq!(id, SignatureId::LoadDone),
            other => panic!("expected DuplicatePattern, got {:?}", other),
        }
    }

    #[test]
    fn test_image_smaller_than_window_fails_closed() {
        let buf = blank(16);
        assert!(matches!(
            scan(&buf, BASE, &x86_64::SIGNATURES),
            Err(Error::PatternNotFound(_))
        ));
    }

    #[test]
    fn test_match_at_scan_bound_is_found() {
        // A match whose window ends exactly at the image end must be found;
        // the bound is derived from the window, not a fixed constant.
        let spec = SignatureSpec {
            id: SignatureId::LoadDone,
            pattern: &[(0, 0xe8), (3, 0x7b)],
            window: 8,
            site_offset: 0,
            capture: Some(CaptureRule { offset: 4, len: 4 }),
            operand: None,
            extra: &[],
            extra_site: None,
        };
        let mut buf = blank(64);
        plant(&mut buf, 56, &spec); // window [56, 64) touches the last byte
        let sites = scan(&buf, BASE, std::slice::from_ref(&spec)).unwrap();
        assert_eq!(sites.site(SignatureId::LoadDone).address, BASE + 56);
    }

    #[test]
    fn test_extra_captures_and_secondary_site() {
        let mut buf = blank(8192);
        let positions = plant_all(&mut buf);

        let spec = &x86_64::SIGNATURES[SignatureId::MapLoad as usize];
        let pos = positions[SignatureId::MapLoad as usize];
        let sites = scan(&buf, BASE, &x86_64::SIGNATURES).unwrap();
        let site = sites.site(SignatureId::MapLoad);

        assert_eq!(site.extra.len(), spec.extra.len());
        assert_eq!(site.extra[0].len(), spec.extra[0].len);
        assert_eq!(
            site.extra_address,
            Some(BASE + pos as u64 + spec.extra_site.unwrap() as u64)
        );
    }

    #[test]
    fn test_operand_formula_matches_call_semantics() {
        // For a rel32 call, derived == call target. Build a miniature image
        // with `e8 <rel32>` and check the derivation lands on the callee.
        let spec = SignatureSpec {
            id: SignatureId::LoadDone,
            pattern: &[(0, 0xe8)],
            window: 5,
            site_offset: 0,
            capture: None,
            operand: Some(OperandRule { offset: 1, tail: 4 }),
            extra: &[],
            extra_site: None,
        };
        let mut buf = blank(64);
        let call_at = 10usize;
        let callee = 40usize;
        buf[call_at] = 0xe8;
        let rel = (callee as i64 - (call_at as i64 + 5)) as i32;
        buf[call_at + 1..call_at + 5].copy_from_slice(&rel.to_le_bytes());

        let sites = scan(&buf, BASE, std::slice::from_ref(&spec)).unwrap();
        assert_eq!(
            sites.site(SignatureId::LoadDone).derived,
            Some(BASE + callee as u64)
        );
    }
}
