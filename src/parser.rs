use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;

use log::warn;
use memchr::memmem;

use crate::document::{validate, Document, ParseOptions, DEFAULT_BINARY_MARKER};
use crate::error::{PdfError, Result};
use crate::filters;
use crate::model::{Dict, Object, StreamFlags};
use crate::tokenizer::{Lexer, Token};

/// Keys that belong to an individual xref stream or trailer record and
/// never survive the merge into the document-level trailer.
const TRAILER_SKIP_KEYS: &[&str] = &[
    "Length",
    "Filter",
    "DecodeParms",
    "Index",
    "Prev",
    "W",
    "Type",
];

/// Parse a complete PDF file into a mutable [`Document`].
///
/// The whole buffer is scanned front to back and every `N M obj` body is
/// registered; xref tables are validated for shape but their offsets are
/// not trusted. The `startxref` value only picks which trailer in the
/// `Prev` chain is active.
pub fn parse(input: &[u8], options: &ParseOptions) -> Result<Document> {
    let header = read_header(input)?;
    let mut lexer = Lexer::new(input);
    lexer.set_position(header.body_start);
    lexer.set_decode_name_escapes(header.version >= (1, 2));

    let mut parser = Parser::new(lexer);
    parser.scan()?;
    parser.expand_object_streams();
    let trailer = parser.merge_trailers()?;
    verify_references(&parser.objects, &trailer);

    let mut document = Document::from_parts(parser.objects, trailer, header.version, header.marker);
    validate(&mut document, options.validation)?;
    Ok(document)
}

struct Header {
    version: (u8, u8),
    marker: [u8; 4],
    body_start: usize,
}

fn read_header(input: &[u8]) -> Result<Header> {
    if !input.starts_with(b"%PDF-") {
        return Err(PdfError::MalformedHeader);
    }
    if memmem::rfind(input, b"%%EOF").is_none() {
        return Err(PdfError::MalformedHeader);
    }

    let mut pos = b"%PDF-".len();
    let major = read_version_digit(input, &mut pos)?;
    if input.get(pos) != Some(&b'.') {
        return Err(PdfError::MalformedHeader);
    }
    pos += 1;
    let minor = read_version_digit(input, &mut pos)?;

    // The comment on the following line conventionally holds four bytes
    // with the high bit set so transfer tools treat the file as binary.
    let mut marker = DEFAULT_BINARY_MARKER;
    let line_end = next_line_start(input, pos);
    if input.get(line_end) == Some(&b'%') {
        let candidate = &input[line_end + 1..];
        if candidate.len() >= 4 && candidate[..4].iter().all(|b| b & 0x80 != 0) {
            marker = [candidate[0], candidate[1], candidate[2], candidate[3]];
        }
    }

    Ok(Header {
        version: (major, minor),
        marker,
        body_start: pos,
    })
}

fn read_version_digit(input: &[u8], pos: &mut usize) -> Result<u8> {
    match input.get(*pos) {
        Some(b) if b.is_ascii_digit() => {
            *pos += 1;
            Ok(b - b'0')
        }
        _ => Err(PdfError::MalformedHeader),
    }
}

fn next_line_start(input: &[u8], from: usize) -> usize {
    let mut pos = from;
    while pos < input.len() && input[pos] != b'\n' && input[pos] != b'\r' {
        pos += 1;
    }
    if pos < input.len() && input[pos] == b'\r' {
        pos += 1;
    }
    if pos < input.len() && input[pos] == b'\n' {
        pos += 1;
    }
    pos
}

pub(crate) struct Parser<'a> {
    lexer: Lexer<'a>,
    buffer: VecDeque<(Token, Range<usize>)>,
    objects: HashMap<(u32, u16), Object>,
    /// Trailer candidates: classic `trailer` dicts and `/XRef` stream
    /// dicts, each with the byte offset they were found at.
    trailers: Vec<(usize, Dict)>,
    startxref: Option<usize>,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(lexer: Lexer<'a>) -> Self {
        Self {
            lexer,
            buffer: VecDeque::new(),
            objects: HashMap::new(),
            trailers: Vec::new(),
            startxref: None,
        }
    }

    fn scan(&mut self) -> Result<()> {
        while let Some((token, span)) = self.next_tok() {
            match token {
                Token::Integer(obj_num) => self.parse_top_level_integer(obj_num, span.start)?,
                Token::Keyword(kw) if kw == "xref" => self.parse_xref_table(span.start)?,
                Token::Keyword(kw) if kw == "trailer" => self.parse_trailer(span.start)?,
                Token::Keyword(kw) if kw == "startxref" => self.parse_startxref(span.start)?,
                Token::Keyword(kw) if kw == "obj" || kw == "R" => {
                    return Err(PdfError::InvalidIndirect { offset: span.start });
                }
                other => {
                    return Err(PdfError::parse(
                        span.start,
                        format!("unexpected {} at top level", describe(&other)),
                    ));
                }
            }
        }
        Ok(())
    }

    fn parse_top_level_integer(&mut self, obj_num: i64, offset: usize) -> Result<()> {
        let gen_num = match self.peek(0) {
            Some(Token::Integer(v)) => Some(*v),
            _ => None,
        };
        let keyword = match self.peek(1) {
            Some(Token::Keyword(kw)) => Some(kw.clone()),
            _ => None,
        };
        match (gen_num, keyword.as_deref()) {
            (Some(gen_num), Some("obj")) => {
                let _ = self.next_tok();
                let _ = self.next_tok();
                let obj_num = u32::try_from(obj_num)
                    .map_err(|_| PdfError::parse(offset, "object number out of range"))?;
                let gen_num = u16::try_from(gen_num)
                    .map_err(|_| PdfError::parse(offset, "generation number out of range"))?;
                self.parse_indirect_object(obj_num, gen_num, offset)
            }
            (Some(_), Some("R")) => Err(PdfError::parse(
                offset,
                "stray indirect reference at top level",
            )),
            _ => Err(PdfError::parse(offset, "unexpected integer at top level")),
        }
    }

    fn parse_indirect_object(&mut self, obj_num: u32, gen_num: u16, offset: usize) -> Result<()> {
        let mut body = self.parse_object()?;

        if matches!(self.peek(0), Some(Token::Keyword(kw)) if kw == "stream") {
            let _ = self.next_tok();
            let Object::Dictionary(dict) = body else {
                return Err(PdfError::parse(
                    offset,
                    "stream keyword not preceded by a dictionary",
                ));
            };
            body = self.read_stream_body(dict, offset)?;
        }

        // An xref stream doubles as a trailer candidate at this offset.
        if let Object::Stream { dict, .. } = &body {
            if dict.get("Type").and_then(Object::as_name) == Some("XRef") {
                self.trailers.push((offset, dict.clone()));
            }
        }

        let mut warned = false;
        loop {
            match self.peek(0) {
                Some(Token::Keyword(kw)) if kw == "endobj" => {
                    let _ = self.next_tok();
                    break;
                }
                Some(_) => {
                    if !warned {
                        warn!(
                            "object {} {} at byte {}: extra tokens before endobj",
                            obj_num, gen_num, offset
                        );
                        warned = true;
                    }
                    let _ = self.next_tok();
                }
                None => {
                    warn!(
                        "object {} {} at byte {}: endobj missing at end of input",
                        obj_num, gen_num, offset
                    );
                    break;
                }
            }
        }

        self.objects.insert((obj_num, gen_num), body);
        Ok(())
    }

    pub(crate) fn parse_object(&mut self) -> Result<Object> {
        let position = self.lexer.position();
        let Some((token, span)) = self.next_tok() else {
            return Err(PdfError::parse(position, "unexpected end of input"));
        };
        self.parse_object_from(token, span)
    }

    fn parse_object_from(&mut self, token: Token, span: Range<usize>) -> Result<Object> {
        match token {
            Token::Null => Ok(Object::Null),
            Token::Boolean(v) => Ok(Object::Boolean(v)),
            Token::Integer(v) => self.parse_number_or_ref(v),
            Token::Real(v) => Ok(Object::Real(v)),
            Token::String(v) => Ok(Object::String(v)),
            Token::HexString(v) => Ok(Object::HexString(v)),
            Token::Name(v) => Ok(Object::Name(v)),
            Token::ArrayStart => self.parse_array(span.start),
            Token::DictStart => self.parse_dict(span.start),
            Token::Keyword(kw) if kw == "obj" || kw == "R" => {
                Err(PdfError::InvalidIndirect { offset: span.start })
            }
            Token::Keyword(kw) => Err(PdfError::parse(
                span.start,
                format!("unexpected keyword {kw}"),
            )),
            Token::ArrayEnd => Err(PdfError::parse(span.start, "unbalanced ]")),
            Token::DictEnd => Err(PdfError::parse(span.start, "unbalanced >>")),
            Token::Delim(b) => Err(PdfError::parse(
                span.start,
                format!("unexpected delimiter {:?}", b as char),
            )),
        }
    }

    fn parse_number_or_ref(&mut self, first: i64) -> Result<Object> {
        let second = match self.peek(0) {
            Some(Token::Integer(v)) => Some(*v),
            _ => None,
        };
        if let Some(second) = second {
            if matches!(self.peek(1), Some(Token::Keyword(kw)) if kw == "R") {
                let _ = self.next_tok();
                let _ = self.next_tok();
                return Ok(Object::Reference {
                    obj_num: first as u32,
                    gen_num: second as u16,
                });
            }
        }
        Ok(Object::Integer(first))
    }

    fn parse_array(&mut self, open_offset: usize) -> Result<Object> {
        let mut items = Vec::new();
        loop {
            match self.peek(0) {
                Some(Token::ArrayEnd) => {
                    let _ = self.next_tok();
                    return Ok(Object::Array(items));
                }
                Some(_) => items.push(self.parse_object()?),
                None => return Err(PdfError::parse(open_offset, "unbalanced [")),
            }
        }
    }

    fn parse_dict(&mut self, open_offset: usize) -> Result<Object> {
        let mut dict = Dict::new();
        loop {
            if matches!(self.peek(0), Some(Token::DictEnd)) {
                let _ = self.next_tok();
                return Ok(Object::Dictionary(dict));
            }
            let Some((token, span)) = self.next_tok() else {
                return Err(PdfError::parse(open_offset, "unbalanced <<"));
            };
            let Token::Name(key) = token else {
                return Err(PdfError::parse(span.start, "dictionary key is not a name"));
            };
            let value = self.parse_object()?;
            dict.insert(key, value);
        }
    }

    fn read_stream_body(&mut self, mut dict: Dict, obj_offset: usize) -> Result<Object> {
        let declared = match dict.get("Length") {
            Some(Object::Integer(v)) => usize::try_from(*v).ok(),
            // Referenced lengths resolve when the target object was
            // already parsed; otherwise the endstream scan takes over.
            Some(Object::Reference { obj_num, gen_num }) => self
                .objects
                .get(&(*obj_num, *gen_num))
                .and_then(Object::as_i64)
                .and_then(|v| usize::try_from(v).ok()),
            _ => None,
        };

        let body_start = self.lexer.position();
        let mut data = None;
        if let Some(len) = declared {
            let candidate = self.lexer.consume_stream(len);
            if candidate.len() == len && self.lexer.endstream_follows() {
                data = Some(candidate);
            } else {
                self.lexer.set_position(body_start);
            }
        }
        let data = match data {
            Some(data) => data,
            None => self
                .lexer
                .consume_stream_until_endstream()
                .ok_or(PdfError::StreamTruncated { offset: obj_offset })?,
        };

        match self.next_tok() {
            Some((Token::Keyword(kw), _)) if kw == "endstream" => {}
            _ => return Err(PdfError::StreamTruncated { offset: obj_offset }),
        }

        match declared {
            Some(len) if len != data.len() => warn!(
                "stream at byte {}: declared Length {} but body has {} bytes; using actual",
                obj_offset,
                len,
                data.len()
            ),
            None if dict.contains_key("Length") => warn!(
                "stream at byte {}: unusable Length entry; recovered {} bytes by scanning",
                obj_offset,
                data.len()
            ),
            _ => {}
        }
        dict.insert("Length".to_string(), Object::Integer(data.len() as i64));

        let (data, was_compressed) = filters::decode_stream(&mut dict, data, obj_offset)?;
        Ok(Object::Stream {
            dict,
            data,
            flags: StreamFlags {
                was_compressed,
                ..StreamFlags::default()
            },
        })
    }

    /// Classic xref table: subsection headers `first count` followed by
    /// `count` fixed 20-byte entries. Shape is enforced, offsets are
    /// discarded; object positions come from the forward scan.
    fn parse_xref_table(&mut self, xref_offset: usize) -> Result<()> {
        loop {
            let first = match self.peek(0) {
                Some(Token::Integer(v)) => *v,
                _ => break,
            };
            let _ = self.next_tok();
            let count = match self.next_tok() {
                Some((Token::Integer(v), _)) if v >= 0 => v as usize,
                _ => {
                    return Err(PdfError::parse(
                        xref_offset,
                        format!("xref subsection {first} has no entry count"),
                    ));
                }
            };
            debug_assert!(self.buffer.is_empty());

            let input = self.lexer.input();
            let mut pos = self.lexer.position();
            while pos < input.len() && matches!(input[pos], b' ' | b'\r' | b'\n') {
                pos += 1;
            }
            for _ in 0..count {
                let Some(entry) = input.get(pos..pos + 20) else {
                    return Err(PdfError::parse(pos, "truncated xref subsection"));
                };
                let shape_ok = entry[..10].iter().all(u8::is_ascii_digit)
                    && entry[10] == b' '
                    && entry[11..16].iter().all(u8::is_ascii_digit)
                    && entry[16] == b' '
                    && matches!(entry[17], b'n' | b'f')
                    && entry[18..].iter().all(|&b| matches!(b, b' ' | b'\r' | b'\n'));
                if !shape_ok {
                    return Err(PdfError::parse(pos, "malformed xref entry"));
                }
                pos += 20;
            }
            self.lexer.set_position(pos);
        }
        Ok(())
    }

    fn parse_trailer(&mut self, offset: usize) -> Result<()> {
        match self.next_tok() {
            Some((Token::DictStart, span)) => {
                let dict = self.parse_dict(span.start)?;
                let Object::Dictionary(dict) = dict else {
                    unreachable!()
                };
                self.trailers.push((offset, dict));
                Ok(())
            }
            _ => Err(PdfError::parse(
                offset,
                "trailer keyword not followed by a dictionary",
            )),
        }
    }

    fn parse_startxref(&mut self, offset: usize) -> Result<()> {
        match self.next_tok() {
            Some((Token::Integer(v), _)) if v >= 0 => {
                self.startxref = Some(v as usize);
                Ok(())
            }
            _ => Err(PdfError::parse(offset, "garbled startxref")),
        }
    }

    /// Pull compressed objects out of `/ObjStm` streams. Entries only
    /// fill gaps: in incremental files a direct object supersedes a stale
    /// object-stream copy, so already parsed objects are never replaced.
    fn expand_object_streams(&mut self) {
        let mut stream_keys: Vec<(u32, u16)> = self
            .objects
            .iter()
            .filter_map(|(key, obj)| match obj {
                Object::Stream { dict, .. }
                    if dict.get("Type").and_then(Object::as_name) == Some("ObjStm") =>
                {
                    Some(*key)
                }
                _ => None,
            })
            .collect();
        stream_keys.sort_unstable();

        let mut updates: HashMap<(u32, u16), Object> = HashMap::new();
        for key in stream_keys {
            let Some(Object::Stream { dict, data, .. }) = self.objects.get(&key) else {
                continue;
            };
            if filters::has_filter(dict) {
                warn!(
                    "object stream {} {} still carries an undecoded filter; skipping",
                    key.0, key.1
                );
                continue;
            }
            let n = dict.get("N").and_then(Object::as_i64).unwrap_or(0) as usize;
            let first = dict.get("First").and_then(Object::as_i64).unwrap_or(0) as usize;
            if n == 0 || first == 0 || data.len() < first {
                warn!("object stream {} {} has an unusable N/First pair", key.0, key.1);
                continue;
            }

            let mut header_lexer = Lexer::new(&data[..first]);
            let mut entries = Vec::with_capacity(n);
            for _ in 0..n {
                let obj_num = match header_lexer.next_token() {
                    Some(Token::Integer(v)) => v as u32,
                    _ => break,
                };
                let offset = match header_lexer.next_token() {
                    Some(Token::Integer(v)) => v as usize,
                    _ => break,
                };
                entries.push((obj_num, offset));
            }

            for (obj_num, offset) in entries {
                let target = (obj_num, 0);
                let pos = first + offset;
                if pos >= data.len()
                    || self.objects.contains_key(&target)
                    || updates.contains_key(&target)
                {
                    continue;
                }
                match parse_object_at(data, pos) {
                    Ok(obj) => {
                        updates.insert(target, obj);
                    }
                    Err(err) => {
                        warn!(
                            "object stream {} {}: entry {} failed to parse: {}",
                            key.0, key.1, obj_num, err
                        );
                    }
                }
            }
        }

        for (key, obj) in updates {
            self.objects.insert(key, obj);
        }
    }

    /// Pick the trailer nearest the startxref hint, walk its `Prev`
    /// chain (nearest-offset again), and merge earlier-wins per key.
    fn merge_trailers(&mut self) -> Result<Dict> {
        if self.trailers.is_empty() {
            return Err(PdfError::TrailerMissing);
        }
        let hint = self.startxref.unwrap_or(self.lexer.input().len());
        let mut used: HashSet<usize> = HashSet::new();
        let nearest = |target: usize, used: &HashSet<usize>| -> Option<usize> {
            self.trailers
                .iter()
                .enumerate()
                .filter(|(i, _)| !used.contains(i))
                .min_by_key(|(_, (offset, _))| offset.abs_diff(target))
                .map(|(i, _)| i)
        };

        let mut current = nearest(hint, &used).ok_or(PdfError::TrailerMissing)?;
        used.insert(current);
        let mut merged = Dict::new();
        for (key, value) in &self.trailers[current].1 {
            if !TRAILER_SKIP_KEYS.contains(&key.as_str()) {
                merged.insert(key.clone(), value.clone());
            }
        }

        while let Some(prev) = self.trailers[current].1.get("Prev").and_then(Object::as_i64) {
            let Some(next) = nearest(prev as usize, &used) else {
                break;
            };
            used.insert(next);
            for (key, value) in &self.trailers[next].1 {
                if TRAILER_SKIP_KEYS.contains(&key.as_str()) || merged.contains_key(key) {
                    continue;
                }
                merged.insert(key.clone(), value.clone());
            }
            current = next;
        }

        if merged.is_empty() {
            return Err(PdfError::TrailerMissing);
        }
        Ok(merged)
    }

    fn next_tok(&mut self) -> Option<(Token, Range<usize>)> {
        if let Some(entry) = self.buffer.pop_front() {
            return Some(entry);
        }
        self.lexer.next_spanned()
    }

    fn peek(&mut self, n: usize) -> Option<&Token> {
        while self.buffer.len() <= n {
            let entry = self.lexer.next_spanned()?;
            self.buffer.push_back(entry);
        }
        self.buffer.get(n).map(|(token, _)| token)
    }
}

/// Parse one direct object at an offset inside a decoded buffer. Used
/// for object-stream bodies.
pub(crate) fn parse_object_at(data: &[u8], offset: usize) -> Result<Object> {
    let mut lexer = Lexer::new(data);
    lexer.set_position(offset);
    let mut parser = Parser::new(lexer);
    parser.parse_object()
}

/// Post-parse resolver check: every reference placeholder either has a
/// registered target or gets a warning here. Unpatched placeholders are
/// kept and later written out as `(ID GEN R)` literals.
fn verify_references(objects: &HashMap<(u32, u16), Object>, trailer: &Dict) {
    let mut missing: HashSet<(u32, u16)> = HashSet::new();
    let mut stack: Vec<&Object> = trailer.values().collect();
    stack.extend(objects.values());

    while let Some(obj) = stack.pop() {
        match obj {
            Object::Reference { obj_num, gen_num } => {
                if !objects.contains_key(&(*obj_num, *gen_num)) {
                    missing.insert((*obj_num, *gen_num));
                }
            }
            Object::Array(items) => stack.extend(items),
            Object::Dictionary(dict) => stack.extend(dict.values()),
            Object::Stream { dict, .. } => stack.extend(dict.values()),
            _ => {}
        }
    }

    let mut missing: Vec<(u32, u16)> = missing.into_iter().collect();
    missing.sort_unstable();
    for (obj_num, gen_num) in missing {
        warn!("unresolved reference {obj_num} {gen_num} R; keeping placeholder");
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Null => "null".to_string(),
        Token::Boolean(_) => "boolean".to_string(),
        Token::Integer(_) => "integer".to_string(),
        Token::Real(_) => "real".to_string(),
        Token::String(_) => "string".to_string(),
        Token::HexString(_) => "hex string".to_string(),
        Token::Name(name) => format!("name /{name}"),
        Token::Keyword(kw) => format!("keyword {kw}"),
        Token::Delim(b) => format!("delimiter {:?}", *b as char),
        Token::DictStart => "<<".to_string(),
        Token::DictEnd => ">>".to_string(),
        Token::ArrayStart => "[".to_string(),
        Token::ArrayEnd => "]".to_string(),
    }
}
