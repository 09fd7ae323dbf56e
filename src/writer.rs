use std::collections::{HashMap, HashSet};

use log::warn;

use crate::document::{
    pdf_date, validate, Document, EffectiveSaveOptions, SaveOptions, DEFAULT_BINARY_MARKER,
};
use crate::error::{PdfError, Result};
use crate::filters;
use crate::minify;
use crate::model::{sorted_keys, Dict, Object};
use crate::tokenizer::{is_delim, is_whitespace};

/// Dict-valued entries under these keys always become indirect objects.
const INDIRECT_WHEN_DICT_KEYS: &[&str] = &[
    "AN", "Annotation", "B", "C", "CI", "DocMDP", "F", "FontDescriptor", "I", "IX", "K", "Lock",
    "N", "P", "Pg", "RI", "SE", "SV", "V",
];

/// Composite entries under these keys always become indirect objects.
const INDIRECT_ALWAYS_KEYS: &[&str] = &[
    "Data", "First", "ID", "Last", "Next", "Obj", "Parent", "ParentTree", "Popup", "Prev", "Root",
    "StmOwn", "Threads", "Widths",
];

/// Every dict element of an array under these keys becomes indirect.
const INDIRECT_ARRAY_ELEMENT_KEYS: &[&str] = &[
    "Annots", "B", "C", "CO", "Fields", "K", "Kids", "O", "Pages", "TrapRegions",
];

const OBJSTM_MAX_OBJECTS: usize = 65_535;
const OBJSTM_MAX_BODY: usize = 1 << 20;
const MINIFIED_LINE_LIMIT: usize = 255;

/// Serialize the document into a complete PDF file. Indirect objects are
/// renumbered from the enumeration traversal, so object ids from a
/// previous parse do not survive. A non-zero `timestamp` (epoch seconds)
/// stamps `Info/ModDate` and fills in a missing `Info/CreationDate`.
pub fn serialize(
    doc: &mut Document,
    options: &SaveOptions,
    timestamp: Option<i64>,
) -> Result<Vec<u8>> {
    let eff = options.effective();
    validate(doc, eff.validation)?;

    match timestamp {
        Some(epoch) if epoch != 0 => apply_timestamp(doc, epoch),
        _ => {}
    }

    let plan = enumerate(doc);
    minify_content_streams(doc, &plan, &eff)?;

    let version_minor = if eff.object_streams {
        doc.version.1.max(5)
    } else {
        4
    };
    let marker = if eff.preserve_binary_signature {
        doc.binary_marker
    } else {
        DEFAULT_BINARY_MARKER
    };

    let mut out = Vec::new();
    out.extend_from_slice(format!("%PDF-1.{version_minor}\n%").as_bytes());
    out.extend_from_slice(&marker);
    out.extend_from_slice(b"\n\n");

    let writer = ObjectWriter {
        renumber: &plan.renumber,
    };
    if eff.object_streams {
        emit_with_object_streams(&mut out, doc, &plan, &writer, &eff)?;
    } else {
        emit_classic(&mut out, doc, &plan, &writer, &eff)?;
    }
    Ok(out)
}

fn apply_timestamp(doc: &mut Document, epoch: i64) {
    let date = Object::String(pdf_date(epoch).into_bytes());
    if let Some(Object::Dictionary(info)) = doc.trailer.get_mut("Info") {
        info.entry("CreationDate".to_string())
            .or_insert_with(|| date.clone());
        info.insert("ModDate".to_string(), date);
        return;
    }
    if let Some(key) = doc.trailer.get("Info").and_then(Object::as_reference) {
        if let Some(info) = doc.objects.get_mut(&key).and_then(Object::as_dict_mut) {
            info.entry("CreationDate".to_string())
                .or_insert_with(|| date.clone());
            info.insert("ModDate".to_string(), date);
            return;
        }
    }
    let mut info = Dict::new();
    info.insert("CreationDate".to_string(), date.clone());
    info.insert("ModDate".to_string(), date);
    let id = doc.add_object(Object::Dictionary(info));
    doc.trailer
        .insert("Info".to_string(), Object::reference(id.0, id.1));
}

// ── Enumeration ──────────────────────────────────────────────────────

struct Plan {
    /// Object keys in output order; position i becomes output id i + 1.
    order: Vec<(u32, u16)>,
    renumber: HashMap<(u32, u16), u32>,
    /// Streams referenced from a `Contents` entry.
    content_streams: HashSet<(u32, u16)>,
}

struct Enumerator {
    seen: HashSet<(u32, u16)>,
    processed: HashSet<(u32, u16)>,
    order: Vec<(u32, u16)>,
    content_streams: HashSet<(u32, u16)>,
}

/// Decide which nodes are emitted as numbered indirect objects and in
/// what order: fixed-role seeds first, then depth-first discovery from
/// `Root` with the promotion rules applied to inline values. Promoted
/// values are moved into the object table and replaced by a reference.
fn enumerate(doc: &mut Document) -> Plan {
    let mut en = Enumerator {
        seen: HashSet::new(),
        processed: HashSet::new(),
        order: Vec::new(),
        content_streams: HashSet::new(),
    };

    let mut seeds: Vec<(u32, u16)> = Vec::new();

    // Trailer-level seeds. An inline catalog or info dict becomes its
    // own object here.
    let mut trailer = std::mem::take(&mut doc.trailer);
    for key in ["Root", "Info"] {
        if let Some(value) = trailer.get_mut(key) {
            en.seed_value(value, doc, &mut seeds);
        }
    }
    doc.trailer = trailer;

    // Fixed-role nodes under the catalog, in seed order.
    if let Some(root_key) = doc.trailer.get("Root").and_then(Object::as_reference) {
        if let Some(mut catalog) = doc.objects.remove(&root_key) {
            if let Some(dict) = catalog.as_dict_mut() {
                for name in [
                    "Dests",
                    "Metadata",
                    "Outlines",
                    "Pages",
                    "Threads",
                    "StructTreeRoot",
                ] {
                    if let Some(value) = dict.get_mut(name) {
                        en.seed_value(value, doc, &mut seeds);
                    }
                }
                match dict.get_mut("OCProperties") {
                    Some(Object::Dictionary(ocp)) => en.seed_ocgs(ocp, doc, &mut seeds),
                    Some(Object::Reference { obj_num, gen_num }) => {
                        let key = (*obj_num, *gen_num);
                        if let Some(mut ocp) = doc.objects.remove(&key) {
                            if let Some(ocp) = ocp.as_dict_mut() {
                                en.seed_ocgs(ocp, doc, &mut seeds);
                            }
                            doc.objects.insert(key, ocp);
                        }
                    }
                    _ => {}
                }
            }
            doc.objects.insert(root_key, catalog);
        }
    }

    for seed in seeds {
        en.process(seed, doc);
    }

    // Remaining trailer values (Encrypt, ID, ...) only discover targets;
    // the trailer itself stays direct and outside the promotion rules.
    let mut trailer = std::mem::take(&mut doc.trailer);
    for key in sorted_keys(&trailer).into_iter().cloned().collect::<Vec<_>>() {
        if let Some(value) = trailer.get_mut(&key) {
            en.walk(value, doc);
        }
    }
    doc.trailer = trailer;

    let renumber = en
        .order
        .iter()
        .enumerate()
        .map(|(i, key)| (*key, i as u32 + 1))
        .collect();
    Plan {
        order: en.order,
        renumber,
        content_streams: en.content_streams,
    }
}

impl Enumerator {
    fn visit(&mut self, key: (u32, u16)) {
        if self.seen.insert(key) {
            self.order.push(key);
        }
    }

    fn process(&mut self, key: (u32, u16), doc: &mut Document) {
        if !self.processed.insert(key) {
            return;
        }
        let Some(mut body) = doc.objects.remove(&key) else {
            return;
        };
        self.walk(&mut body, doc);
        doc.objects.insert(key, body);
    }

    fn seed_value(&mut self, value: &mut Object, doc: &mut Document, seeds: &mut Vec<(u32, u16)>) {
        match value {
            Object::Reference { obj_num, gen_num } => {
                let key = (*obj_num, *gen_num);
                if doc.objects.contains_key(&key) {
                    self.visit(key);
                    seeds.push(key);
                }
            }
            v if v.is_composite() => {
                let key = self.promote(v, doc);
                seeds.push(key);
            }
            _ => {}
        }
    }

    fn seed_ocgs(&mut self, ocp: &mut Dict, doc: &mut Document, seeds: &mut Vec<(u32, u16)>) {
        if let Some(Object::Array(items)) = ocp.get_mut("OCGs") {
            for item in items {
                self.seed_value(item, doc, seeds);
            }
        }
    }

    /// Move an inline value into the object table and leave a reference
    /// in its place.
    fn promote(&mut self, slot: &mut Object, doc: &mut Document) -> (u32, u16) {
        let taken = std::mem::replace(slot, Object::Null);
        let key = doc.add_object(taken);
        *slot = Object::reference(key.0, key.1);
        self.visit(key);
        key
    }

    fn promote_and_process(&mut self, slot: &mut Object, doc: &mut Document) {
        let key = self.promote(slot, doc);
        self.process(key, doc);
    }

    fn walk(&mut self, obj: &mut Object, doc: &mut Document) {
        match obj {
            Object::Reference { obj_num, gen_num } => {
                let key = (*obj_num, *gen_num);
                if doc.objects.contains_key(&key) {
                    self.visit(key);
                    self.process(key, doc);
                }
            }
            Object::Array(items) => {
                for item in items {
                    if matches!(item, Object::Stream { .. }) {
                        self.promote_and_process(item, doc);
                    } else {
                        self.walk(item, doc);
                    }
                }
            }
            Object::Dictionary(dict) => self.walk_dict(dict, doc),
            Object::Stream { dict, .. } => self.walk_dict(dict, doc),
            _ => {}
        }
    }

    fn walk_dict(&mut self, dict: &mut Dict, doc: &mut Document) {
        let parent_s = dict
            .get("S")
            .and_then(Object::as_name)
            .map(str::to_string);
        let parent_is_ext_g_state =
            dict.get("Type").and_then(Object::as_name) == Some("ExtGState");

        let keys: Vec<String> = sorted_keys(dict).into_iter().cloned().collect();
        for key in keys {
            if key == "Contents" {
                self.mark_content_streams(dict.get(&key));
            }
            let Some(value) = dict.get_mut(&key) else {
                continue;
            };

            if should_promote(&key, value, parent_s.as_deref()) {
                self.promote_and_process(value, doc);
                continue;
            }

            if let Object::Array(items) = value {
                if INDIRECT_ARRAY_ELEMENT_KEYS.contains(&key.as_str()) {
                    for item in items {
                        if matches!(item, Object::Dictionary(_) | Object::Stream { .. }) {
                            self.promote_and_process(item, doc);
                        } else {
                            self.walk(item, doc);
                        }
                    }
                    continue;
                }
                if parent_is_ext_g_state && key == "Font" {
                    for (i, item) in items.iter_mut().enumerate() {
                        if i == 0 && matches!(item, Object::Dictionary(_)) {
                            self.promote_and_process(item, doc);
                        } else {
                            self.walk(item, doc);
                        }
                    }
                    continue;
                }
            }

            self.walk(value, doc);
        }
    }

    fn mark_content_streams(&mut self, value: Option<&Object>) {
        match value {
            Some(Object::Reference { obj_num, gen_num }) => {
                self.content_streams.insert((*obj_num, *gen_num));
            }
            Some(Object::Array(items)) => {
                for item in items {
                    if let Some(key) = item.as_reference() {
                        self.content_streams.insert(key);
                    }
                }
            }
            _ => {}
        }
    }
}

fn should_promote(key: &str, value: &Object, parent_s: Option<&str>) -> bool {
    if matches!(value, Object::Stream { .. }) {
        return true;
    }
    if !value.is_composite() {
        return false;
    }
    let is_dict = matches!(value, Object::Dictionary(_));
    if is_dict && INDIRECT_WHEN_DICT_KEYS.contains(&key) {
        return true;
    }
    if INDIRECT_ALWAYS_KEYS.contains(&key) {
        return true;
    }
    if let Object::Dictionary(dict) = value {
        if dict.contains_key("Kids") {
            return true;
        }
        if matches!(
            dict.get("Type").and_then(Object::as_name),
            Some("Filespec") | Some("Font")
        ) {
            return true;
        }
    }
    if parent_s == Some("Thread") && key == "D" {
        return true;
    }
    if parent_s == Some("Hide") && key == "T" {
        return true;
    }
    false
}

fn minify_content_streams(
    doc: &mut Document,
    plan: &Plan,
    eff: &EffectiveSaveOptions,
) -> Result<()> {
    for key in &plan.order {
        let Some(Object::Stream { dict, data, flags }) = doc.objects.get_mut(key) else {
            continue;
        };
        let wanted = flags.minify || (eff.minify && plan.content_streams.contains(key));
        if !wanted {
            continue;
        }
        if filters::has_filter(dict) {
            warn!(
                "content stream {} {} still carries a filter; not minifying",
                key.0, key.1
            );
            continue;
        }
        let minified = minify::minify_content(data)?;
        dict.insert("Length".to_string(), Object::Integer(minified.len() as i64));
        *data = minified;
    }
    Ok(())
}

// ── Direct-object emission ───────────────────────────────────────────

struct ObjectWriter<'a> {
    renumber: &'a HashMap<(u32, u16), u32>,
}

impl ObjectWriter<'_> {
    fn write_value(&self, out: &mut Vec<u8>, obj: &Object, indent: usize) -> Result<()> {
        match obj {
            Object::Null => out.extend_from_slice(b"null"),
            Object::Boolean(true) => out.extend_from_slice(b"true"),
            Object::Boolean(false) => out.extend_from_slice(b"false"),
            Object::Integer(v) => out.extend_from_slice(v.to_string().as_bytes()),
            Object::Real(v) => out.extend_from_slice(format_real(*v).as_bytes()),
            Object::String(s) => write_literal_string(out, s),
            Object::HexString(s) => write_hex_string(out, s),
            Object::Name(name) => write_name(out, name),
            Object::Reference { obj_num, gen_num } => {
                self.write_reference(out, *obj_num, *gen_num)
            }
            Object::Array(items) => {
                if items.iter().any(Object::is_composite) {
                    out.extend_from_slice(b"[\n");
                    for item in items {
                        push_indent(out, indent + 2);
                        self.write_value(out, item, indent + 2)?;
                        out.push(b'\n');
                    }
                    push_indent(out, indent);
                    out.push(b']');
                } else {
                    out.extend_from_slice(b"[ ");
                    for item in items {
                        self.write_value(out, item, indent)?;
                        out.push(b' ');
                    }
                    out.push(b']');
                }
            }
            Object::Dictionary(dict) => {
                out.extend_from_slice(b"<<\n");
                for key in sorted_keys(dict) {
                    push_indent(out, indent + 2);
                    write_name(out, key);
                    out.push(b' ');
                    self.write_value(out, &dict[key], indent + 2)?;
                    out.push(b'\n');
                }
                push_indent(out, indent);
                out.extend_from_slice(b">>");
            }
            Object::Stream { .. } => {
                // The enumerator promotes every stream; one here means
                // the plan is broken.
                return Err(PdfError::Validation(
                    "stream value reached the direct-object writer".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn write_reference(&self, out: &mut Vec<u8>, obj_num: u32, gen_num: u16) {
        match self.renumber.get(&(obj_num, gen_num)) {
            Some(id) => out.extend_from_slice(format!("{id} 0 R").as_bytes()),
            // Unresolved placeholder: emitted as a literal string.
            None => out.extend_from_slice(format!("({obj_num} {gen_num} R)").as_bytes()),
        }
    }

    fn write_value_min(&self, mw: &mut MinWriter, obj: &Object) -> Result<()> {
        match obj {
            Object::Null => mw.token(b"null"),
            Object::Boolean(true) => mw.token(b"true"),
            Object::Boolean(false) => mw.token(b"false"),
            Object::Integer(v) => mw.token(v.to_string().as_bytes()),
            Object::Real(v) => mw.token(format_real(*v).as_bytes()),
            Object::String(s) => {
                let mut buf = Vec::new();
                write_literal_string(&mut buf, s);
                mw.token(&buf);
            }
            Object::HexString(s) => {
                let mut buf = Vec::new();
                write_hex_string(&mut buf, s);
                mw.token(&buf);
            }
            Object::Name(name) => {
                let mut buf = Vec::new();
                write_name(&mut buf, name);
                mw.token(&buf);
            }
            Object::Reference { obj_num, gen_num } => match self.renumber.get(&(*obj_num, *gen_num))
            {
                Some(id) => {
                    mw.token(id.to_string().as_bytes());
                    mw.token(b"0");
                    mw.token(b"R");
                }
                None => mw.token(format!("({obj_num} {gen_num} R)").as_bytes()),
            },
            Object::Array(items) => {
                mw.token(b"[");
                for item in items {
                    self.write_value_min(mw, item)?;
                }
                mw.token(b"]");
            }
            Object::Dictionary(dict) => {
                mw.token(b"<<");
                for key in sorted_keys(dict) {
                    let mut buf = Vec::new();
                    write_name(&mut buf, key);
                    mw.token(&buf);
                    self.write_value_min(mw, &dict[key])?;
                }
                mw.token(b">>");
            }
            Object::Stream { .. } => {
                return Err(PdfError::Validation(
                    "stream value reached the minified writer".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Dict plus payload, with the compression policy applied and
    /// `Length` recomputed. Only used for top-level indirect objects.
    fn write_stream(
        &self,
        out: &mut Vec<u8>,
        dict: &Dict,
        data: &[u8],
        flags: crate::model::StreamFlags,
        eff: &EffectiveSaveOptions,
    ) -> Result<()> {
        let mut dict = dict.clone();
        // Streams still carrying an opaque filter chain pass through as
        // stored; stacking another FlateDecode on them helps nobody.
        let compress = !(flags.force_decompress || eff.decompress)
            && (flags.force_compress || eff.compress || flags.was_compressed)
            && !filters::has_filter(&dict);
        let payload = if compress {
            let deflated = filters::deflate(data)?;
            filters::prepend_flate(&mut dict);
            deflated
        } else {
            data.to_vec()
        };
        dict.insert("Length".to_string(), Object::Integer(payload.len() as i64));

        self.write_value(out, &Object::Dictionary(dict), 0)?;
        out.extend_from_slice(b"\nstream\n");
        out.extend_from_slice(&payload);
        if payload.last() != Some(&b'\n') {
            out.push(b'\n');
        }
        out.extend_from_slice(b"endstream");
        Ok(())
    }

    fn write_indirect(
        &self,
        out: &mut Vec<u8>,
        id: u32,
        obj: &Object,
        eff: &EffectiveSaveOptions,
    ) -> Result<()> {
        out.extend_from_slice(format!("{id} 0 obj\n").as_bytes());
        match obj {
            Object::Stream { dict, data, flags } => {
                self.write_stream(out, dict, data, *flags, eff)?
            }
            other => self.write_value(out, other, 0)?,
        }
        out.extend_from_slice(b"\nendobj\n\n");
        Ok(())
    }
}

/// Minified token emitter: single spaces only where tokenization needs
/// them, lines broken before they reach the limit. Shared with the
/// content-stream minifier.
pub(crate) struct MinWriter {
    out: Vec<u8>,
    line: usize,
}

impl MinWriter {
    pub(crate) fn new() -> Self {
        MinWriter {
            out: Vec::new(),
            line: 0,
        }
    }

    pub(crate) fn token(&mut self, tok: &[u8]) {
        if tok.is_empty() {
            return;
        }
        if self.line > 0 && self.line + tok.len() >= MINIFIED_LINE_LIMIT {
            self.out.push(b'\n');
            self.line = 0;
        } else if needs_separator(self.out.last().copied(), tok[0]) {
            self.out.push(b' ');
            self.line += 1;
        }
        self.out.extend_from_slice(tok);
        match memchr::memrchr(b'\n', tok) {
            Some(last_newline) => self.line = tok.len() - last_newline - 1,
            None => self.line += tok.len(),
        }
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.out
    }
}

fn needs_separator(prev: Option<u8>, next: u8) -> bool {
    match prev {
        Some(prev) => !is_delim(prev) && !is_whitespace(prev) && !is_delim(next),
        None => false,
    }
}

fn push_indent(out: &mut Vec<u8>, indent: usize) {
    out.extend(std::iter::repeat(b' ').take(indent));
}

fn write_name(out: &mut Vec<u8>, name: &str) {
    out.push(b'/');
    for &b in name.as_bytes() {
        if is_delim(b) || is_whitespace(b) || b == b'#' {
            out.extend_from_slice(format!("#{b:02X}").as_bytes());
        } else {
            out.push(b);
        }
    }
}

fn write_literal_string(out: &mut Vec<u8>, s: &[u8]) {
    out.push(b'(');
    for &b in s {
        match b {
            b'\\' | b'(' | b')' => {
                out.push(b'\\');
                out.push(b);
            }
            // A raw CR would be normalized away on the next parse.
            b'\r' => out.extend_from_slice(b"\\r"),
            _ => out.push(b),
        }
    }
    out.push(b')');
}

fn write_hex_string(out: &mut Vec<u8>, s: &[u8]) {
    out.push(b'<');
    for &b in s {
        out.extend_from_slice(format!("{b:02x}").as_bytes());
    }
    out.push(b'>');
}

/// No trailing zeros, no exponent; integral reals keep one decimal.
fn format_real(f: f64) -> String {
    if f == f.trunc() && f.abs() < 1e15 {
        format!("{f:.1}")
    } else {
        let s = format!("{f:.6}");
        let s = s.trim_end_matches('0');
        s.trim_end_matches('.').to_string()
    }
}

// ── Classic xref table ───────────────────────────────────────────────

fn emit_classic(
    out: &mut Vec<u8>,
    doc: &Document,
    plan: &Plan,
    writer: &ObjectWriter<'_>,
    eff: &EffectiveSaveOptions,
) -> Result<()> {
    let mut emitted: HashSet<u32> = HashSet::new();
    let mut offsets = Vec::with_capacity(plan.order.len());
    for (idx, key) in plan.order.iter().enumerate() {
        let id = idx as u32 + 1;
        if !emitted.insert(id) {
            return Err(PdfError::DoubleEmit(id));
        }
        let Some(obj) = doc.objects.get(key) else {
            return Err(PdfError::Validation(format!(
                "enumerated object {} {} disappeared",
                key.0, key.1
            )));
        };
        offsets.push(out.len());
        writer.write_indirect(out, id, obj, eff)?;
    }

    let xref_offset = out.len();
    let size = plan.order.len() + 1;
    out.extend_from_slice(format!("xref\n0 {size}\n").as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for offset in &offsets {
        out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }

    let mut trailer = doc.trailer.clone();
    trailer.insert("Size".to_string(), Object::Integer(size as i64));
    trailer.remove("Prev");
    out.extend_from_slice(b"trailer ");
    writer.write_value(out, &Object::Dictionary(trailer), 0)?;
    out.extend_from_slice(format!("\nstartxref\n{xref_offset}\n%%EOF\n").as_bytes());
    Ok(())
}

// ── Xref stream + object streams ─────────────────────────────────────

enum XrefEntry {
    Free,
    Regular { offset: usize },
    Packed { objstm_id: u32, index: u16 },
}

struct ObjStm {
    pairs: Vec<(u32, usize)>,
    body: Vec<u8>,
}

impl ObjStm {
    fn header(&self) -> Vec<u8> {
        let mut header = String::new();
        for (id, offset) in &self.pairs {
            header.push_str(&format!("{id} {offset} "));
        }
        header.into_bytes()
    }

    fn projected_size(&self, next_body: usize) -> usize {
        self.header().len() + self.body.len() + next_body + 2
    }
}

fn emit_with_object_streams(
    out: &mut Vec<u8>,
    doc: &Document,
    plan: &Plan,
    writer: &ObjectWriter<'_>,
    eff: &EffectiveSaveOptions,
) -> Result<()> {
    let total = plan.order.len() as u32;
    let encrypt_key = doc.trailer.get("Encrypt").and_then(Object::as_reference);

    // Packing pass: everything that is not a stream and not the
    // encryption dict goes into an object stream, in enumeration order.
    let mut objstms: Vec<ObjStm> = Vec::new();
    let mut entries: HashMap<u32, XrefEntry> = HashMap::new();
    for (idx, key) in plan.order.iter().enumerate() {
        let id = idx as u32 + 1;
        let Some(obj) = doc.objects.get(key) else {
            return Err(PdfError::Validation(format!(
                "enumerated object {} {} disappeared",
                key.0, key.1
            )));
        };
        let packable = !matches!(obj, Object::Stream { .. }) && encrypt_key != Some(*key);
        if !packable {
            continue;
        }

        let mut mw = MinWriter::new();
        writer.write_value_min(&mut mw, obj)?;
        let body = mw.into_bytes();

        let start_new = match objstms.last() {
            None => true,
            Some(current) => {
                current.pairs.len() >= OBJSTM_MAX_OBJECTS
                    || current.projected_size(body.len()) > OBJSTM_MAX_BODY
            }
        };
        if start_new {
            objstms.push(ObjStm {
                pairs: Vec::new(),
                body: Vec::new(),
            });
        }
        let objstm_id = total + objstms.len() as u32;
        if let Some(current) = objstms.last_mut() {
            if !current.body.is_empty() {
                current.body.push(b' ');
            }
            let index = current.pairs.len() as u16;
            current.pairs.push((id, current.body.len()));
            current.body.extend_from_slice(&body);
            entries.insert(id, XrefEntry::Packed { objstm_id, index });
        }
    }

    // Unpacked bodies, in order.
    let mut emitted: HashSet<u32> = HashSet::new();
    for (idx, key) in plan.order.iter().enumerate() {
        let id = idx as u32 + 1;
        if entries.contains_key(&id) {
            continue;
        }
        if !emitted.insert(id) {
            return Err(PdfError::DoubleEmit(id));
        }
        let Some(obj) = doc.objects.get(key) else {
            return Err(PdfError::Validation(format!(
                "enumerated object {} {} disappeared",
                key.0, key.1
            )));
        };
        entries.insert(id, XrefEntry::Regular { offset: out.len() });
        writer.write_indirect(out, id, obj, eff)?;
    }

    // The object streams themselves. Their dicts are written by hand:
    // the `Extends` target is an output id with no source-object key, so
    // it cannot go through the renumber map.
    for (i, objstm) in objstms.iter().enumerate() {
        let id = total + i as u32 + 1;
        let header = objstm.header();
        let mut data = header.clone();
        data.extend_from_slice(&objstm.body);

        let payload = if eff.decompress {
            data
        } else {
            filters::deflate(&data)?
        };

        entries.insert(id, XrefEntry::Regular { offset: out.len() });
        out.extend_from_slice(format!("{id} 0 obj\n<<\n").as_bytes());
        if i > 0 {
            out.extend_from_slice(format!("  /Extends {} 0 R\n", total + i as u32).as_bytes());
        }
        if !eff.decompress {
            out.extend_from_slice(b"  /Filter /FlateDecode\n");
        }
        out.extend_from_slice(format!("  /First {}\n", header.len()).as_bytes());
        out.extend_from_slice(format!("  /Length {}\n", payload.len()).as_bytes());
        out.extend_from_slice(format!("  /N {}\n", objstm.pairs.len()).as_bytes());
        out.extend_from_slice(b"  /Type /ObjStm\n>>\nstream\n");
        out.extend_from_slice(&payload);
        if payload.last() != Some(&b'\n') {
            out.push(b'\n');
        }
        out.extend_from_slice(b"endstream\nendobj\n\n");
    }

    // Finally the cross-reference stream, W = [1 4 2].
    let xref_id = total + objstms.len() as u32 + 1;
    let size = xref_id + 1;
    let xref_offset = out.len();
    entries.insert(
        xref_id,
        XrefEntry::Regular {
            offset: xref_offset,
        },
    );
    entries.insert(0, XrefEntry::Free);

    let mut rows = Vec::with_capacity(size as usize * 7);
    for id in 0..size {
        match entries.get(&id) {
            Some(XrefEntry::Free) | None => {
                rows.push(0u8);
                rows.extend_from_slice(&0u32.to_be_bytes());
                rows.extend_from_slice(&0xFFFFu16.to_be_bytes());
            }
            Some(XrefEntry::Regular { offset }) => {
                rows.push(1u8);
                rows.extend_from_slice(&(*offset as u32).to_be_bytes());
                rows.extend_from_slice(&0u16.to_be_bytes());
            }
            Some(XrefEntry::Packed { objstm_id, index }) => {
                rows.push(2u8);
                rows.extend_from_slice(&objstm_id.to_be_bytes());
                rows.extend_from_slice(&index.to_be_bytes());
            }
        }
    }

    let mut dict = doc.trailer.clone();
    dict.remove("Prev");
    dict.insert("Type".to_string(), Object::name("XRef"));
    dict.insert("Size".to_string(), Object::Integer(size as i64));
    dict.insert(
        "W".to_string(),
        Object::Array(vec![
            Object::Integer(1),
            Object::Integer(4),
            Object::Integer(2),
        ]),
    );
    dict.insert(
        "Index".to_string(),
        Object::Array(vec![Object::Integer(0), Object::Integer(size as i64)]),
    );
    let payload = if eff.decompress {
        rows
    } else {
        let deflated = filters::deflate(&rows)?;
        dict.insert("Filter".to_string(), Object::name(filters::FLATE_DECODE));
        deflated
    };
    dict.insert("Length".to_string(), Object::Integer(payload.len() as i64));

    out.extend_from_slice(format!("{xref_id} 0 obj\n").as_bytes());
    writer.write_value(out, &Object::Dictionary(dict), 0)?;
    out.extend_from_slice(b"\nstream\n");
    out.extend_from_slice(&payload);
    if payload.last() != Some(&b'\n') {
        out.push(b'\n');
    }
    out.extend_from_slice(b"endstream\nendobj\n\n");

    out.extend_from_slice(format!("startxref\n{xref_offset}\n%%EOF\n").as_bytes());
    Ok(())
}
