//! Zero-width tag codec
//!
//! Encodes a packed 64-bit payload into a run of invisible Unicode
//! codepoints and recovers it from generated text. The alphabet is fixed:
//! a start marker, one bit per zero/one codepoint, and an end marker, so a
//! tag is self-delimiting even when embedded between visible words.

use crate::error::WatermarkError;

/// Marks the beginning of an embedded tag.
pub const START_CHAR: char = '\u{2063}';
/// Marks the end of an embedded tag.
pub const END_CHAR: char = '\u{2064}';
/// Encodes a zero bit.
pub const ZERO_CHAR: char = '\u{200b}';
/// Encodes a one bit.
pub const ONE_CHAR: char = '\u{200c}';
/// Reserved alphabet member, accepted (and stripped) but never emitted.
pub const RESERVED_CHAR: char = '\u{200d}';
/// WORD JOINER, stripped alongside the tag alphabet even though this crate
/// never emits it itself.
pub const WORD_JOINER_CHAR: char = '\u{2060}';

const PAYLOAD_BITS: u32 = 64;

fn is_stripped(c: char) -> bool {
    matches!(c, START_CHAR | END_CHAR | ZERO_CHAR | ONE_CHAR | RESERVED_CHAR | WORD_JOINER_CHAR)
}

/// Render a packed 64-bit payload as a zero-width tag string, MSB first.
pub fn encode_payload_to_tag(payload: u64) -> String {
    let mut tag = String::with_capacity(2 + PAYLOAD_BITS as usize);
    tag.push(START_CHAR);
    for bit_index in (0..PAYLOAD_BITS).rev() {
        let bit = (payload >> bit_index) & 1;
        tag.push(if bit == 1 { ONE_CHAR } else { ZERO_CHAR });
    }
    tag.push(END_CHAR);
    tag
}

/// A single decoded tag and the byte range in `text` it was read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedTag {
    pub payload: u64,
    pub start_byte: usize,
    pub end_byte: usize,
}

/// Scan `text` for zero-width tags, returning each complete `start..end` run
/// found in order of appearance. Malformed runs (wrong bit count, unterminated
/// start marker) are skipped rather than erroring, matching how a detector
/// should tolerate truncated or damaged text.
pub fn decode_tags_from_text(text: &str) -> Vec<DecodedTag> {
    let mut tags = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some((start_idx, c)) = chars.next() {
        if c != START_CHAR {
            continue;
        }
        let mut bits: Vec<u64> = Vec::with_capacity(PAYLOAD_BITS as usize);
        let mut end_byte = None;

        while let Some(&(idx, next_c)) = chars.peek() {
            match next_c {
                ZERO_CHAR => {
                    bits.push(0);
                    chars.next();
                }
                ONE_CHAR => {
                    bits.push(1);
                    chars.next();
                }
                RESERVED_CHAR => {
                    chars.next();
                }
                END_CHAR => {
                    end_byte = Some(idx + next_c.len_utf8());
                    chars.next();
                    break;
                }
                START_CHAR => break, // unterminated run; abandon and let outer loop restart here
                _ => break,
            }
        }

        if let Some(end_byte) = end_byte {
            if bits.len() as u32 == PAYLOAD_BITS {
                let mut payload: u64 = 0;
                for bit in bits {
                    payload = (payload << 1) | bit;
                }
                tags.push(DecodedTag { payload, start_byte: start_idx, end_byte });
            }
        }
    }

    tags
}

/// Remove every zero-width tag alphabet codepoint from `text`, tagged or not.
///
/// Used both to present clean text to opt-out users and to sanitize input
/// before statistical scoring (stray zero-width characters would otherwise
/// shift token boundaries).
pub fn strip(text: &str) -> String {
    text.chars().filter(|c| !is_stripped(*c)).collect()
}

/// Streaming injector: splices a fixed `tag` string into a codepoint stream
/// every `repeat_interval_tokens` codepoints.
///
/// `carry` counts codepoints remaining until the next injection, starting
/// at `repeat_interval_tokens` and reset on every injection. Calls to
/// [`Self::inject_delta`] may span any number of codepoints in either
/// direction, so `carry` (not a per-call counter) is what tracks distance.
#[derive(Clone, Debug)]
pub struct TagInjector {
    pub tag: String,
    pub repeat_interval_tokens: u32,
    carry: i64,
    emitted_any: bool,
}

impl TagInjector {
    pub fn new(tag: String, repeat_interval_tokens: u32) -> Self {
        Self { tag, repeat_interval_tokens, carry: repeat_interval_tokens as i64, emitted_any: false }
    }

    /// Feed one piece of newly generated text, returning it with the tag
    /// spliced in at every codepoint where `carry` reaches zero.
    ///
    /// If `finalize` is true, no tag was emitted by this call, and no tag
    /// has ever been emitted by this injector, one final tag is appended.
    pub fn inject_delta(&mut self, piece: &str, finalize: bool) -> String {
        let mut out = String::with_capacity(piece.len());
        let mut emitted_this_call = false;

        for c in piece.chars() {
            out.push(c);
            self.carry -= 1;
            if self.carry <= 0 {
                out.push_str(&self.tag);
                self.carry = self.repeat_interval_tokens as i64;
                self.emitted_any = true;
                emitted_this_call = true;
            }
        }

        if finalize && !emitted_this_call && !self.emitted_any {
            out.push_str(&self.tag);
            self.emitted_any = true;
        }

        out
    }
}

/// Inject a single tag into already-complete text (non-streaming response path).
///
/// Placed after the first whitespace-delimited word so the tag never sits
/// at the very start of the visible output. Falls back to appending at the
/// end if the text has no whitespace at all.
pub fn inject_tag_nonstream(text: &str, payload: u64) -> Result<String, WatermarkError> {
    if text.is_empty() {
        return Err(WatermarkError::InvalidArgument("cannot tag empty text".to_string()));
    }
    let tag = encode_payload_to_tag(payload);
    match text.find(char::is_whitespace) {
        Some(idx) => {
            let split = idx + 1; // include the whitespace byte itself before the tag
            let mut out = String::with_capacity(text.len() + tag.len());
            out.push_str(&text[..split]);
            out.push_str(&tag);
            out.push_str(&text[split..]);
            Ok(out)
        }
        None => Ok(format!("{text}{tag}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_simple_payload() {
        let payload = 0xDEAD_BEEF_1234_5678u64;
        let tag = encode_payload_to_tag(payload);
        let found = decode_tags_from_text(&format!("hello {tag} world"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].payload, payload);
    }

    #[test]
    fn strip_removes_all_tag_chars() {
        let tag = encode_payload_to_tag(42);
        let text = format!("abc{tag}def");
        let stripped = strip(&text);
        assert_eq!(stripped, "abcdef");
    }

    #[test]
    fn truncated_tag_is_ignored() {
        let tag = encode_payload_to_tag(7);
        let truncated = &tag[..tag.len() - 3]; // drop the end marker and last bit
        let found = decode_tags_from_text(truncated);
        assert!(found.is_empty());
    }

    #[test]
    fn multiple_tags_all_decoded() {
        let a = encode_payload_to_tag(1);
        let b = encode_payload_to_tag(2);
        let text = format!("{a} middle {b}");
        let found = decode_tags_from_text(&text);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].payload, 1);
        assert_eq!(found[1].payload, 2);
    }

    #[test]
    fn inject_nonstream_places_tag_after_first_word() {
        let out = inject_tag_nonstream("hello world", 9).unwrap();
        assert!(out.starts_with("hello "));
        assert!(out.contains(START_CHAR));
        let found = decode_tags_from_text(&out);
        assert_eq!(found[0].payload, 9);
    }

    #[test]
    fn injector_emits_every_interval_codepoints() {
        let mut injector = TagInjector::new("<t>".to_string(), 5);
        let piece: String = std::iter::repeat('a').take(12).collect();
        let out = injector.inject_delta(&piece, false);
        assert_eq!(out.matches("<t>").count(), 2); // floor(12 / 5)
    }

    #[test]
    fn injector_finalize_emits_once_for_short_output() {
        let mut injector = TagInjector::new("<t>".to_string(), 160);
        let out = injector.inject_delta("hi", true);
        assert_eq!(out.matches("<t>").count(), 1);
    }

    #[test]
    fn injector_finalize_is_noop_once_a_tag_was_emitted() {
        let mut injector = TagInjector::new("<t>".to_string(), 3);
        let first = injector.inject_delta("abcdef", false);
        assert_eq!(first.matches("<t>").count(), 2); // floor(6 / 3)
        let second = injector.inject_delta("g", true);
        assert_eq!(second.matches("<t>").count(), 0);
    }

    #[test]
    fn injector_distance_between_insertions_matches_interval() {
        let mut injector = TagInjector::new("|".to_string(), 4);
        let piece: String = std::iter::repeat('x').take(9).collect();
        let out = injector.inject_delta(&piece, false);
        let positions: Vec<usize> = out.match_indices('|').map(|(i, _)| i).collect();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[1] - positions[0], 5); // 4 'x' chars + the marker byte
    }
}
