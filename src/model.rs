use std::collections::HashMap;

pub type Dict = HashMap<String, Object>;

/// Per-stream hints carried alongside the data. Never serialized; they
/// control whether a stream is recompressed or minified on write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamFlags {
    /// The stream arrived FlateDecode-compressed and was inflated on read.
    pub was_compressed: bool,
    pub force_compress: bool,
    pub force_decompress: bool,
    pub minify: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    /// Literal string with escapes resolved and CR/CRLF normalized to LF.
    String(Vec<u8>),
    /// Hex string, decoded to bytes; odd trailing nibble padded with zero.
    HexString(Vec<u8>),
    Name(String),
    Array(Vec<Object>),
    Dictionary(Dict),
    Stream {
        dict: Dict,
        data: Vec<u8>,
        flags: StreamFlags,
    },
    Reference {
        obj_num: u32,
        gen_num: u16,
    },
}

impl Object {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Object::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Object::Real(v) => Some(*v),
            Object::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Object::Name(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&[u8]> {
        match self {
            Object::String(v) | Object::HexString(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Object::Dictionary(v) => Some(v),
            Object::Stream { dict, .. } => Some(dict),
            _ => None,
        }
    }

    pub fn as_dict_mut(&mut self) -> Option<&mut Dict> {
        match self {
            Object::Dictionary(v) => Some(v),
            Object::Stream { dict, .. } => Some(dict),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Object]> {
        match self {
            Object::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<(u32, u16)> {
        match self {
            Object::Reference { obj_num, gen_num } => Some((*obj_num, *gen_num)),
            _ => None,
        }
    }

    /// Arrays, dictionaries and streams; everything else serializes on
    /// one line and is never promoted to an indirect object.
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            Object::Array(_) | Object::Dictionary(_) | Object::Stream { .. }
        )
    }

    pub fn reference(obj_num: u32, gen_num: u16) -> Object {
        Object::Reference { obj_num, gen_num }
    }

    pub fn name(name: &str) -> Object {
        Object::Name(name.to_string())
    }
}

/// Canonical dictionary key order used by the enumerator and both
/// writer modes: case-folded lexicographic, raw bytes as tiebreak.
pub fn sorted_keys(dict: &Dict) -> Vec<&String> {
    let mut keys: Vec<&String> = dict.keys().collect();
    keys.sort_by(|a, b| {
        let fold = |s: &str| s.as_bytes().to_ascii_lowercase();
        fold(a).cmp(&fold(b)).then_with(|| a.as_bytes().cmp(b.as_bytes()))
    });
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_match_variants() {
        assert_eq!(Object::Integer(7).as_i64(), Some(7));
        assert_eq!(Object::Integer(7).as_f64(), Some(7.0));
        assert_eq!(Object::Real(1.5).as_f64(), Some(1.5));
        assert_eq!(Object::name("Pages").as_name(), Some("Pages"));
        assert_eq!(Object::reference(3, 0).as_reference(), Some((3, 0)));
        assert!(Object::Null.as_dict().is_none());
    }

    #[test]
    fn stream_dict_is_reachable_through_as_dict() {
        let mut dict = Dict::new();
        dict.insert("Length".to_string(), Object::Integer(0));
        let stream = Object::Stream {
            dict,
            data: Vec::new(),
            flags: StreamFlags::default(),
        };
        assert!(stream.as_dict().unwrap().contains_key("Length"));
    }

    #[test]
    fn key_order_is_case_folded_with_raw_tiebreak() {
        let mut dict = Dict::new();
        for key in ["b", "A", "a", "B"] {
            dict.insert(key.to_string(), Object::Null);
        }
        let keys: Vec<&str> = sorted_keys(&dict).into_iter().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["A", "a", "B", "b"]);
    }
}
