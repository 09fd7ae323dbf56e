mod common;

use repdf::document::{Document, SaveOptions};
use repdf::model::{Dict, Object, StreamFlags};
use repdf::serialize;

use crate::common::{contains, count_occurrences, parse_bytes, write_default, SAMPLE_CONTENT};

#[test]
fn empty_document_has_the_documented_layout() {
    let mut doc = Document::new();
    let out = serialize(&mut doc, &SaveOptions::default(), Some(946_684_800)).expect("serialize");

    assert!(out.starts_with(b"%PDF-1.4\n%\xBF\xF7\xA2\xFE\n\n"));
    assert!(contains(&out, b"/Type /Catalog"));
    assert!(contains(&out, b"/Type /Pages"));
    assert!(contains(&out, b"/Count 0"));
    assert!(contains(&out, b"/Kids [ ]"));
    assert!(contains(&out, b"/CreationDate (D:20000101000000+00'00')"));
    assert!(contains(&out, b"/Info "));
    assert!(contains(&out, b"startxref\n"));
    assert!(out.ends_with(b"%%EOF\n"));
}

#[test]
fn classic_xref_offsets_point_at_object_headers() {
    let mut doc = parse_bytes(&common::sample_pdf());
    let out = write_default(&mut doc);

    // startxref points at the xref keyword.
    let startxref_pos = find(&out, b"startxref\n").expect("startxref");
    let offset_text = &out[startxref_pos + 10..];
    let end = offset_text
        .iter()
        .position(|&b| b == b'\n')
        .expect("offset line");
    let xref_offset: usize = std::str::from_utf8(&offset_text[..end])
        .expect("utf8")
        .parse()
        .expect("offset");
    assert!(out[xref_offset..].starts_with(b"xref\n"));

    // Every in-use entry points at the matching `N 0 obj` header.
    let table = &out[xref_offset + 5..];
    let header_end = table.iter().position(|&b| b == b'\n').expect("subsection");
    let mut parts = std::str::from_utf8(&table[..header_end]).expect("utf8").split(' ');
    let first: usize = parts.next().unwrap().parse().expect("first");
    let count: usize = parts.next().unwrap().parse().expect("count");
    assert_eq!(first, 0);

    let entries = &table[header_end + 1..];
    for i in 1..count {
        let entry = &entries[i * 20..i * 20 + 20];
        let offset: usize = std::str::from_utf8(&entry[..10])
            .expect("utf8")
            .parse()
            .expect("entry offset");
        assert_eq!(entry[17], b'n');
        let header = format!("{i} 0 obj\n");
        assert!(
            out[offset..].starts_with(header.as_bytes()),
            "xref entry {i} does not point at its object header"
        );
    }
}

#[test]
fn shared_objects_are_emitted_once_and_referenced() {
    // Two pages share one resources dictionary and one content stream.
    let mut input = b"%PDF-1.4\n1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n\
                      2 0 obj\n<< /Type /Pages /Kids [ 3 0 R 4 0 R ] /Count 2 >>\nendobj\n\
                      3 0 obj\n<< /Type /Page /Parent 2 0 R /Resources 6 0 R /Contents 5 0 R >>\nendobj\n\
                      4 0 obj\n<< /Type /Page /Parent 2 0 R /Resources 6 0 R /Contents 5 0 R >>\nendobj\n"
        .to_vec();
    input.extend_from_slice(
        format!("5 0 obj\n<< /Length {} >>\nstream\n", SAMPLE_CONTENT.len()).as_bytes(),
    );
    input.extend_from_slice(SAMPLE_CONTENT);
    input.extend_from_slice(b"\nendstream\nendobj\n");
    input.extend_from_slice(
        b"6 0 obj\n<< /Font << /F1 << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> >> >>\nendobj\n",
    );
    input.extend_from_slice(b"trailer\n<< /Root 1 0 R /Size 7 >>\n%%EOF\n");

    let mut doc = parse_bytes(&input);
    let out = write_default(&mut doc);

    assert_eq!(count_occurrences(&out, b"endstream"), 1);
    assert_eq!(count_occurrences(&out, b"/BaseFont /Helvetica"), 1);
    assert_eq!(count_occurrences(&out, b"/Resources "), 2);
    assert_eq!(count_occurrences(&out, b"/Contents "), 2);
}

#[test]
fn font_dicts_are_promoted_to_indirect_objects() {
    // The F1 font is inline in the input; Type /Font dicts become their
    // own objects on output.
    let mut doc = parse_bytes(&common::sample_pdf());
    let out = write_default(&mut doc);
    let reparsed = parse_bytes(&out);

    let font = reparsed
        .objects
        .values()
        .filter_map(Object::as_dict)
        .find(|d| d.get("Type").and_then(Object::as_name) == Some("Font"))
        .expect("font object");
    assert_eq!(font.get("BaseFont"), Some(&Object::name("Helvetica")));
    assert!(contains(&out, b"/F1 "));
}

#[test]
fn xref_stream_mode_emits_offsets_that_parse() {
    let mut doc = parse_bytes(&common::sample_pdf());
    let options = SaveOptions {
        use_object_streams: true,
        ..SaveOptions::default()
    };
    let out = serialize(&mut doc, &options, None).expect("serialize");

    // startxref points at the xref stream's object header.
    let startxref_pos = find(&out, b"startxref\n").expect("startxref");
    let offset_text = &out[startxref_pos + 10..];
    let end = offset_text
        .iter()
        .position(|&b| b == b'\n')
        .expect("offset line");
    let xref_offset: usize = std::str::from_utf8(&offset_text[..end])
        .expect("utf8")
        .parse()
        .expect("offset");
    let at_offset = &out[xref_offset..];
    assert!(at_offset.iter().take_while(|&&b| b != b' ').all(u8::is_ascii_digit));
    assert!(contains(&at_offset[..200.min(at_offset.len())], b"/Type /XRef"));
    assert!(contains(&out, b"/Index [ 0 "));
    assert!(contains(&out, b"/W [ 1 4 2 ]"));
    assert!(!contains(&out, b"trailer <<"));
}

#[test]
fn streams_never_appear_inline() {
    // An inline stream buried in an array still comes out as its own
    // indirect object.
    let mut doc = Document::new();
    let inline_stream = Object::Stream {
        dict: Dict::new(),
        data: b"q Q".to_vec(),
        flags: StreamFlags::default(),
    };
    let holder_id = doc.add_object(Object::Array(vec![inline_stream, Object::Integer(7)]));
    {
        let catalog = doc
            .get_mut(1, 0)
            .and_then(Object::as_dict_mut)
            .expect("catalog");
        catalog.insert(
            "Names".to_string(),
            Object::reference(holder_id.0, holder_id.1),
        );
    }

    let out = write_default(&mut doc);
    let reparsed = parse_bytes(&out);
    let holder = reparsed
        .objects
        .values()
        .find_map(Object::as_array)
        .expect("holder array");
    assert!(
        matches!(holder[0], Object::Reference { .. }),
        "stream should be referenced from the array"
    );
    let stream_count = reparsed
        .objects
        .values()
        .filter(|obj| matches!(obj, Object::Stream { .. }))
        .count();
    assert_eq!(stream_count, 1);
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
