#![allow(dead_code)]

use std::collections::HashSet;

use repdf::document::{Document, ParseOptions, SaveOptions};
use repdf::model::Object;
use repdf::{parse, serialize};

pub fn parse_bytes(input: &[u8]) -> Document {
    parse(input, &ParseOptions::default()).expect("failed to parse PDF")
}

pub fn write_default(doc: &mut Document) -> Vec<u8> {
    serialize(doc, &SaveOptions::default(), None).expect("failed to serialize PDF")
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

pub fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

pub const SAMPLE_CONTENT: &[u8] = b"BT /F1 24 Tf 72 712 Td (Hello, world!) Tj ET";

/// A small classic-xref file: catalog, one-page tree, a content stream,
/// and a shared resources dictionary.
pub fn sample_pdf() -> Vec<u8> {
    let mut out = b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n".to_vec();
    out.extend_from_slice(
        b"1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n\
          2 0 obj\n<< /Type /Pages /Kids [ 3 0 R ] /Count 1 >>\nendobj\n\
          3 0 obj\n<< /Type /Page /Parent 2 0 R /MediaBox [ 0 0 612 792 ] \
          /Resources 5 0 R /Contents 4 0 R >>\nendobj\n",
    );
    out.extend_from_slice(
        format!("4 0 obj\n<< /Length {} >>\nstream\n", SAMPLE_CONTENT.len()).as_bytes(),
    );
    out.extend_from_slice(SAMPLE_CONTENT);
    out.extend_from_slice(b"\nendstream\nendobj\n");
    out.extend_from_slice(
        b"5 0 obj\n<< /Font << /F1 << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> >> >>\n\
          endobj\n",
    );
    out.extend_from_slice(b"trailer\n<< /Root 1 0 R /Size 6 >>\nstartxref\n0\n%%EOF\n");
    out
}

/// Structural equivalence modulo object renumbering: references are
/// chased on both sides before comparing, with a visited set so page
/// `Parent` cycles terminate.
pub fn assert_equivalent(a: &Document, b: &Document) {
    let mut visited = HashSet::new();

    let skip = |key: &str| key == "Size" || key == "Prev";
    let a_keys: HashSet<&String> = a.trailer.keys().filter(|k| !skip(k)).collect();
    let b_keys: HashSet<&String> = b.trailer.keys().filter(|k| !skip(k)).collect();
    assert_eq!(a_keys, b_keys, "trailer key sets differ");

    for key in a_keys {
        assert!(
            equivalent(a, &a.trailer[key], b, &b.trailer[key], &mut visited),
            "trailer entry {key} differs after round-trip"
        );
    }
}

fn equivalent(
    da: &Document,
    a: &Object,
    db: &Document,
    b: &Object,
    visited: &mut HashSet<((u32, u16), (u32, u16))>,
) -> bool {
    let (a, ka) = chase(da, a);
    let (b, kb) = chase(db, b);
    if let (Some(ka), Some(kb)) = (ka, kb) {
        if !visited.insert((ka, kb)) {
            return true;
        }
    }

    match (a, b) {
        (Object::Null, Object::Null) => true,
        (Object::Boolean(x), Object::Boolean(y)) => x == y,
        (Object::Integer(x), Object::Integer(y)) => x == y,
        (Object::Real(x), Object::Real(y)) => x == y,
        (Object::String(x), Object::String(y)) => x == y,
        (Object::HexString(x), Object::HexString(y)) => x == y,
        (Object::Name(x), Object::Name(y)) => x == y,
        (Object::Array(xs), Object::Array(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys)
                    .all(|(x, y)| equivalent(da, x, db, y, visited))
        }
        (Object::Dictionary(xd), Object::Dictionary(yd)) => {
            dicts_equivalent(da, xd, db, yd, visited)
        }
        (
            Object::Stream {
                dict: xd, data: xb, ..
            },
            Object::Stream {
                dict: yd, data: yb, ..
            },
        ) => xb == yb && dicts_equivalent(da, xd, db, yd, visited),
        _ => false,
    }
}

fn dicts_equivalent(
    da: &Document,
    xd: &std::collections::HashMap<String, Object>,
    db: &Document,
    yd: &std::collections::HashMap<String, Object>,
    visited: &mut HashSet<((u32, u16), (u32, u16))>,
) -> bool {
    let x_keys: HashSet<&String> = xd.keys().collect();
    let y_keys: HashSet<&String> = yd.keys().collect();
    if x_keys != y_keys {
        return false;
    }
    x_keys
        .into_iter()
        .all(|key| equivalent(da, &xd[key], db, &yd[key], visited))
}

fn chase<'a>(doc: &'a Document, mut obj: &'a Object) -> (&'a Object, Option<(u32, u16)>) {
    let mut key = None;
    for _ in 0..32 {
        match obj.as_reference() {
            Some(k) => match doc.get(k.0, k.1) {
                Some(target) => {
                    key = Some(k);
                    obj = target;
                }
                None => break,
            },
            None => break,
        }
    }
    (obj, key)
}
