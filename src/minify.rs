use crate::error::{PdfError, Result};
use crate::tokenizer::{Lexer, Token};
use crate::writer::MinWriter;

/// Re-emit a content stream with minimal whitespace and verify the
/// result tokenizes back to the same sequence. Content streams hold only
/// direct values, operator keywords, and inline images; every token is
/// re-emitted with its original spelling, so minification never changes
/// a literal, only the space between them (and drops comments).
///
/// The verify step failing is fatal: a stream that does not re-parse
/// identically must not replace the original.
pub fn minify_content(input: &[u8]) -> Result<Vec<u8>> {
    let spans = tokenize_spans(input);
    let mut mw = MinWriter::new();
    for &(start, end) in &spans {
        mw.token(&input[start..end]);
    }
    let out = mw.into_bytes();

    let check = tokenize_spans(&out);
    let matches = spans.len() == check.len()
        && spans
            .iter()
            .zip(&check)
            .all(|(a, b)| input[a.0..a.1] == out[b.0..b.1]);
    if !matches {
        return Err(PdfError::RoundTrip);
    }
    Ok(out)
}

/// Raw byte spans of every token. An inline image becomes one opaque
/// span running from its `ID` operator through the terminating `EI`.
fn tokenize_spans(input: &[u8]) -> Vec<(usize, usize)> {
    let mut lexer = Lexer::new(input);
    let mut spans = Vec::new();
    while let Some((token, span)) = lexer.next_spanned() {
        if matches!(&token, Token::Keyword(kw) if kw == "ID") {
            lexer.skip_inline_image_data();
            spans.push((span.start, lexer.position()));
            continue;
        }
        spans.push((span.start, span.end));
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_collapses_between_tokens() {
        let out = minify_content(b"BT  /F1 12   Tf\n( Hi )   Tj  ET\n").expect("minify");
        assert_eq!(out, b"BT/F1 12 Tf( Hi )Tj ET".to_vec());
    }

    #[test]
    fn comments_are_dropped() {
        let out = minify_content(b"q % push state\nQ\n").expect("minify");
        assert_eq!(out, b"q Q".to_vec());
    }

    #[test]
    fn string_and_number_spellings_are_preserved() {
        let out = minify_content(b"0.50  0 .5  Td (a\\)b) Tj").expect("minify");
        assert_eq!(out, b"0.50 0 .5 Td(a\\)b)Tj".to_vec());
    }

    #[test]
    fn minify_is_idempotent() {
        let first = minify_content(b"BT /F1 24 Tf 10 20 Td (x) Tj ET").expect("minify");
        let second = minify_content(&first).expect("minify");
        assert_eq!(first, second);
    }

    #[test]
    fn inline_image_bytes_survive_verbatim() {
        let input = b"BI /W 1 /H 1 ID \x00\x80\xff EI Q";
        let out = minify_content(input).expect("minify");
        assert!(memchr::memmem::find(&out, b"ID \x00\x80\xff EI").is_some());
        assert!(out.ends_with(b"EI Q") || out.ends_with(b"Q"));
    }

    #[test]
    fn adjacent_delimiters_need_no_space() {
        let out = minify_content(b"[ (a) (b) ] TJ << /A /B >> x").expect("minify");
        assert_eq!(out, b"[(a)(b)]TJ<</A/B>>x".to_vec());
    }
}
