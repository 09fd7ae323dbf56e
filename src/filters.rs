use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::warn;

use crate::error::{PdfError, Result};
use crate::model::{Dict, Object};

pub const FLATE_DECODE: &str = "FlateDecode";

pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| PdfError::Inflate(err.to_string()))?;
    Ok(out)
}

pub fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(data)
        .map_err(|err| PdfError::Deflate(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| PdfError::Deflate(err.to_string()))
}

/// True when `/Filter` is the name `/FlateDecode` or an array whose
/// first element is. Streams with a predictor in `/DecodeParms` are left
/// alone; inflating them without un-predicting would corrupt the data.
pub fn first_filter_is_flate(dict: &Dict) -> bool {
    if has_predictor(dict) {
        return false;
    }
    match dict.get("Filter") {
        Some(Object::Name(name)) => name == FLATE_DECODE,
        Some(Object::Array(items)) => {
            matches!(items.first(), Some(Object::Name(name)) if name == FLATE_DECODE)
        }
        _ => false,
    }
}

pub fn has_filter(dict: &Dict) -> bool {
    match dict.get("Filter") {
        Some(Object::Name(_)) => true,
        Some(Object::Array(items)) => !items.is_empty(),
        _ => false,
    }
}

fn has_predictor(dict: &Dict) -> bool {
    let params = match dict.get("DecodeParms") {
        Some(Object::Dictionary(d)) => Some(d),
        Some(Object::Array(items)) => match items.first() {
            Some(Object::Dictionary(d)) => Some(d),
            _ => None,
        },
        _ => None,
    };
    matches!(
        params.and_then(|d| d.get("Predictor")).and_then(Object::as_i64),
        Some(p) if p > 1
    )
}

/// Remove the leading `/FlateDecode` from the filter chain, deleting the
/// `/Filter` key outright when it was the only filter.
pub fn strip_first_filter(dict: &mut Dict) {
    match dict.get_mut("Filter") {
        Some(Object::Name(_)) => {
            dict.remove("Filter");
            dict.remove("DecodeParms");
        }
        Some(Object::Array(items)) => {
            if !items.is_empty() {
                items.remove(0);
            }
            if items.is_empty() {
                dict.remove("Filter");
                dict.remove("DecodeParms");
            }
        }
        _ => {}
    }
}

/// Prepend `/FlateDecode` to the filter chain for a stream being
/// recompressed on write.
pub fn prepend_flate(dict: &mut Dict) {
    match dict.remove("Filter") {
        None => {
            dict.insert("Filter".to_string(), Object::name(FLATE_DECODE));
        }
        Some(Object::Name(name)) => {
            dict.insert(
                "Filter".to_string(),
                Object::Array(vec![Object::name(FLATE_DECODE), Object::Name(name)]),
            );
        }
        Some(Object::Array(mut items)) => {
            items.insert(0, Object::name(FLATE_DECODE));
            dict.insert("Filter".to_string(), Object::Array(items));
        }
        Some(other) => {
            // Malformed filter entry; leave it in place behind the new one.
            dict.insert(
                "Filter".to_string(),
                Object::Array(vec![Object::name(FLATE_DECODE), other]),
            );
        }
    }
}

/// Decode a freshly parsed stream in place. Only FlateDecode is decoded;
/// every other filter passes through opaquely.
pub fn decode_stream(dict: &mut Dict, data: Vec<u8>, offset: usize) -> Result<(Vec<u8>, bool)> {
    if first_filter_is_flate(dict) {
        let inflated = inflate(&data)?;
        strip_first_filter(dict);
        dict.insert("Length".to_string(), Object::Integer(inflated.len() as i64));
        return Ok((inflated, true));
    }
    if has_filter(dict) {
        warn!(
            "stream at byte {} carries an unsupported filter; passing bytes through",
            offset
        );
    }
    Ok((data, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflate_inverts_deflate() {
        let original = b"BT /F1 12 Tf 72 720 Td (Hello) Tj ET".to_vec();
        let packed = deflate(&original).expect("deflate");
        assert_eq!(inflate(&packed).expect("inflate"), original);
    }

    #[test]
    fn inflate_rejects_garbage() {
        assert!(matches!(inflate(b"not zlib"), Err(PdfError::Inflate(_))));
    }

    #[test]
    fn flate_detected_as_name_and_array_head() {
        let mut dict = Dict::new();
        dict.insert("Filter".to_string(), Object::name(FLATE_DECODE));
        assert!(first_filter_is_flate(&dict));

        dict.insert(
            "Filter".to_string(),
            Object::Array(vec![Object::name(FLATE_DECODE), Object::name("DCTDecode")]),
        );
        assert!(first_filter_is_flate(&dict));

        dict.insert("Filter".to_string(), Object::name("LZWDecode"));
        assert!(!first_filter_is_flate(&dict));
    }

    #[test]
    fn predictor_streams_are_left_encoded() {
        let mut dict = Dict::new();
        dict.insert("Filter".to_string(), Object::name(FLATE_DECODE));
        let mut parms = Dict::new();
        parms.insert("Predictor".to_string(), Object::Integer(12));
        dict.insert("DecodeParms".to_string(), Object::Dictionary(parms));
        assert!(!first_filter_is_flate(&dict));
    }

    #[test]
    fn strip_removes_lone_filter_and_pops_chain_head() {
        let mut dict = Dict::new();
        dict.insert("Filter".to_string(), Object::name(FLATE_DECODE));
        strip_first_filter(&mut dict);
        assert!(!dict.contains_key("Filter"));

        dict.insert(
            "Filter".to_string(),
            Object::Array(vec![Object::name(FLATE_DECODE), Object::name("DCTDecode")]),
        );
        strip_first_filter(&mut dict);
        assert_eq!(
            dict.get("Filter"),
            Some(&Object::Array(vec![Object::name("DCTDecode")]))
        );
    }

    #[test]
    fn prepend_builds_chain_in_front_of_existing_filter() {
        let mut dict = Dict::new();
        prepend_flate(&mut dict);
        assert_eq!(dict.get("Filter"), Some(&Object::name(FLATE_DECODE)));

        let mut dict = Dict::new();
        dict.insert("Filter".to_string(), Object::name("DCTDecode"));
        prepend_flate(&mut dict);
        assert_eq!(
            dict.get("Filter"),
            Some(&Object::Array(vec![
                Object::name(FLATE_DECODE),
                Object::name("DCTDecode"),
            ]))
        );
    }
}
