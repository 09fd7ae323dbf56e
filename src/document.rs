use std::collections::{HashMap, HashSet};

use log::warn;

use crate::error::{PdfError, Result};
use crate::model::{Dict, Object};

/// Default four-byte binary marker emitted on the comment line after the
/// `%PDF-1.N` header. Any four bytes with the high bit set would do.
pub const DEFAULT_BINARY_MARKER: [u8; 4] = [0xBF, 0xF7, 0xA2, 0xFE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Validation {
    /// Report violations through the log and carry on.
    #[default]
    Warn,
    /// Violations fail the operation.
    Strict,
    /// Do not check at all.
    Skip,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    pub validation: Validation,
}

/// Serialization switches. Positive and negative flags can both be set
/// (`optimize` plus `no_minify`, say); a negation always wins over the
/// matching positive flag, including the ones implied by `optimize`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    pub compress: bool,
    pub no_compress: bool,
    /// Force every stream uncompressed on write.
    pub decompress: bool,
    pub minify: bool,
    pub no_minify: bool,
    pub use_object_streams: bool,
    pub no_object_streams: bool,
    /// Shorthand for compress + minify + use_object_streams.
    pub optimize: bool,
    pub no_optimize: bool,
    /// Re-emit the binary marker found in the parsed file instead of the
    /// default one.
    pub preserve_binary_signature: bool,
    pub validation: Validation,
}

impl SaveOptions {
    pub fn optimized() -> Self {
        SaveOptions {
            optimize: true,
            ..SaveOptions::default()
        }
    }

    pub(crate) fn effective(&self) -> EffectiveSaveOptions {
        let optimize = self.optimize && !self.no_optimize;
        EffectiveSaveOptions {
            compress: (self.compress || optimize) && !self.no_compress && !self.decompress,
            decompress: self.decompress,
            minify: (self.minify || optimize) && !self.no_minify,
            object_streams: (self.use_object_streams || optimize) && !self.no_object_streams,
            preserve_binary_signature: self.preserve_binary_signature,
            validation: self.validation,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct EffectiveSaveOptions {
    pub compress: bool,
    pub decompress: bool,
    pub minify: bool,
    pub object_streams: bool,
    pub preserve_binary_signature: bool,
    pub validation: Validation,
}

/// A parsed or constructed PDF document: the merged trailer dictionary
/// plus the table of indirect objects it hangs off. Object numbers are
/// only meaningful until the next serialization, which renumbers from
/// scratch.
#[derive(Debug, Clone)]
pub struct Document {
    pub objects: HashMap<(u32, u16), Object>,
    pub trailer: Dict,
    pub version: (u8, u8),
    pub binary_marker: [u8; 4],
    next_obj_num: u32,
}

impl Document {
    /// Empty document: a catalog and a pageless page tree.
    pub fn new() -> Document {
        let mut objects = HashMap::new();

        let mut pages = Dict::new();
        pages.insert("Type".to_string(), Object::name("Pages"));
        pages.insert("Kids".to_string(), Object::Array(Vec::new()));
        pages.insert("Count".to_string(), Object::Integer(0));
        objects.insert((2, 0), Object::Dictionary(pages));

        let mut catalog = Dict::new();
        catalog.insert("Type".to_string(), Object::name("Catalog"));
        catalog.insert("Pages".to_string(), Object::reference(2, 0));
        objects.insert((1, 0), Object::Dictionary(catalog));

        let mut trailer = Dict::new();
        trailer.insert("Root".to_string(), Object::reference(1, 0));

        Document {
            objects,
            trailer,
            version: (1, 4),
            binary_marker: DEFAULT_BINARY_MARKER,
            next_obj_num: 3,
        }
    }

    pub(crate) fn from_parts(
        objects: HashMap<(u32, u16), Object>,
        trailer: Dict,
        version: (u8, u8),
        binary_marker: [u8; 4],
    ) -> Document {
        let next_obj_num = objects.keys().map(|&(num, _)| num).max().unwrap_or(0) + 1;
        Document {
            objects,
            trailer,
            version,
            binary_marker,
            next_obj_num,
        }
    }

    pub fn new_object_id(&mut self) -> (u32, u16) {
        let id = (self.next_obj_num, 0);
        self.next_obj_num += 1;
        id
    }

    pub fn add_object(&mut self, obj: Object) -> (u32, u16) {
        let id = self.new_object_id();
        self.objects.insert(id, obj);
        id
    }

    pub fn get(&self, obj_num: u32, gen_num: u16) -> Option<&Object> {
        self.objects.get(&(obj_num, gen_num))
    }

    pub fn get_mut(&mut self, obj_num: u32, gen_num: u16) -> Option<&mut Object> {
        self.objects.get_mut(&(obj_num, gen_num))
    }

    /// Follow a reference one step; unresolvable references come back
    /// unchanged, direct objects pass through.
    pub fn resolve<'a>(&'a self, obj: &'a Object) -> &'a Object {
        match obj {
            Object::Reference { obj_num, gen_num } => {
                self.objects.get(&(*obj_num, *gen_num)).unwrap_or(obj)
            }
            _ => obj,
        }
    }

    pub fn catalog(&self) -> Option<&Dict> {
        let root = self.trailer.get("Root")?;
        self.resolve(root).as_dict()
    }

    /// Number of `/Page` leaves reachable from the root page tree node.
    pub fn page_count(&self) -> i64 {
        let Some(catalog) = self.catalog() else {
            return 0;
        };
        let Some(pages) = catalog.get("Pages").map(|p| self.resolve(p)) else {
            return 0;
        };
        let Some(pages) = pages.as_dict() else {
            return 0;
        };
        let mut seen = HashSet::new();
        count_page_leaves(self, pages, &mut seen)
    }
}

impl Default for Document {
    fn default() -> Self {
        Document::new()
    }
}

fn count_page_leaves(doc: &Document, node: &Dict, seen: &mut HashSet<(u32, u16)>) -> i64 {
    let mut count = 0;
    let kids = node.get("Kids").map(|k| doc.resolve(k));
    let Some(kids) = kids.and_then(Object::as_array) else {
        return 0;
    };
    for kid in kids {
        if let Some(key) = kid.as_reference() {
            if !seen.insert(key) {
                continue;
            }
        }
        let Some(kid) = doc.resolve(kid).as_dict() else {
            continue;
        };
        match kid.get("Type").and_then(Object::as_name) {
            Some("Pages") => count += count_page_leaves(doc, kid, seen),
            Some("Page") => count += 1,
            _ => {}
        }
    }
    count
}

/// Catalog and page-tree invariants. Violations warn by default and fail
/// under [`Validation::Strict`]; a wrong page-tree `Count` is repaired
/// in place with a warning either way.
pub(crate) fn validate(doc: &mut Document, mode: Validation) -> Result<()> {
    if mode == Validation::Skip {
        return Ok(());
    }

    let mut problems: Vec<String> = Vec::new();
    let mut count_repair: Option<((u32, u16), i64)> = None;

    match doc.trailer.get("Root") {
        None => problems.push("trailer has no Root entry".to_string()),
        Some(root) => match doc.resolve(root).as_dict() {
            None => problems.push("Root does not resolve to a dictionary".to_string()),
            Some(catalog) => {
                if catalog.get("Type").and_then(Object::as_name) != Some("Catalog") {
                    problems.push("catalog Type is not /Catalog".to_string());
                }
                match catalog.get("Pages") {
                    None => problems.push("catalog has no Pages entry".to_string()),
                    Some(pages_entry) => {
                        let pages_key = pages_entry.as_reference();
                        match doc.resolve(pages_entry).as_dict() {
                            None => {
                                problems.push("Pages does not resolve to a dictionary".to_string())
                            }
                            Some(pages) => {
                                if pages.get("Type").and_then(Object::as_name) != Some("Pages") {
                                    problems.push("page tree root Type is not /Pages".to_string());
                                }
                                if pages.contains_key("Parent") {
                                    problems
                                        .push("page tree root must not have a Parent".to_string());
                                }
                                let mut seen = HashSet::new();
                                let leaves = count_page_leaves(doc, pages, &mut seen);
                                let declared = pages.get("Count").and_then(Object::as_i64);
                                if declared != Some(leaves) {
                                    match pages_key {
                                        Some(key) => count_repair = Some((key, leaves)),
                                        None => problems.push(format!(
                                            "page tree Count is {declared:?}, expected {leaves}"
                                        )),
                                    }
                                }
                            }
                        }
                    }
                }
            }
        },
    }

    if let Some((key, leaves)) = count_repair {
        warn!(
            "page tree {} {} Count corrected to {}",
            key.0, key.1, leaves
        );
        if let Some(dict) = doc.objects.get_mut(&key).and_then(Object::as_dict_mut) {
            dict.insert("Count".to_string(), Object::Integer(leaves));
        }
    }

    for problem in &problems {
        warn!("validation: {problem}");
    }
    if mode == Validation::Strict && !problems.is_empty() {
        return Err(PdfError::Validation(problems.join("; ")));
    }
    Ok(())
}

/// PDF timestamp from epoch seconds, always rendered in UTC:
/// `D:YYYYMMDDHHMMSS+00'00'`.
pub fn pdf_date(epoch_secs: i64) -> String {
    let days = epoch_secs.div_euclid(86_400);
    let rem = epoch_secs.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    format!(
        "D:{year:04}{month:02}{day:02}{:02}{:02}{:02}+00'00'",
        rem / 3_600,
        (rem / 60) % 60,
        rem % 60
    )
}

// Gregorian date from days since the epoch (Hinnant's civil_from_days).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
