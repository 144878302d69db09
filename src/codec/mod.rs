//! Message framing over the A–Z wire alphabet.
//!
//! # Wire grammar
//! A transmission is a stream of letters interpreted against the current
//! [`CodecState`].  Control letters move between the four symbol tables,
//! enter hex escapes, announce keys and frame messages:
//!
//! ```text
//! key announcement  <to alt> Y <name as text> <to alt> Y
//! section select    <to alt+shift> A <id>        id: D default, H header, C checksum
//! end of message    <to alt+shift> E
//! end of stream     <to alt+shift> F
//! hex byte          <to alt+hex> <hi nibble A..P> <lo nibble A..P>
//! ```
//!
//! The first announcement of a transmission is sent in clear; everything
//! after it is enciphered, including later announcements, which travel
//! under the key they replace.
//!
//! # Headers
//! A header section holds `key value key value ...`, space-joined, keys in
//! ascending order.  Known keys are [`HEADER_CONTENT_TYPE`] and
//! [`HEADER_FILENAME`].
//!
//! # Checksum
//! CRC-32 (IEEE) over every byte of the default section, sent big-endian as
//! four hex bytes inside a checksum section just before end of message.

pub mod decoder;
pub mod encoder;
pub mod sink;

pub use decoder::Decoder;
pub use encoder::{Encoder, MessageWriter};
pub use sink::{channel, ChannelSink, ChecksumStatus, Collector, Event, MessageInfo, MessageSink, ReceivedMessage};

use std::collections::BTreeMap;
use std::io;

use thiserror::Error;

use crate::cipher::CipherError;
use crate::keystore::KeyStoreError;
use crate::state::{CodecState, CTRL_BELL, CTRL_KEY, CTRL_NEWLINE, CTRL_SECTION, CTRL_TAB};
use crate::tables::{self, Table};

pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_FILENAME: &str = "Filename";

/// Longest symbol run the encoder emits as one indivisible unit: up to three
/// mode letters plus a four-byte UTF-8 character as eight nibbles.
pub const MAX_UNIT_LEN: usize = 11;

/// Default longest key name the codec will announce.
pub const DEFAULT_MAX_KEY_NAME_LEN: usize = 8;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Key store exhausted, no key left to rotate to")]
    KeyExhausted,
    #[error("Announced key not found in store: {0}")]
    KeyNotFound(String),
    #[error("Malformed hex escape at symbol {symbol}")]
    MalformedHexEscape { symbol: char },
    #[error("Key {name} too short: {size} symbols, need at least {needed}")]
    KeyTooShort { name: String, size: usize, needed: usize },
    #[error("Key name {name:?} cannot be announced (1-{max} letters A-Z)")]
    InvalidKeyName { name: String, max: usize },
    #[error("Message sink closed")]
    SinkClosed,
    #[error("Codec is closed")]
    Closed,
    #[error("Key store error: {0}")]
    KeyStore(#[from] KeyStoreError),
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Options ──────────────────────────────────────────────────────────────────

/// Codec configuration shared by encoder and decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecOptions {
    /// Longest key name that may be announced in band.
    pub max_key_name_len: usize,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self { max_key_name_len: DEFAULT_MAX_KEY_NAME_LEN }
    }
}

impl CodecOptions {
    /// Key symbols kept back for the next key announcement.
    ///
    /// Worst case per name letter is two mode letters plus the letter; the
    /// framing around the name (alt entry, two `Y`, table changes) needs at
    /// most eight more.  The five-symbol abort sequence fits in the same
    /// margin.
    pub fn reserved_key_len(&self) -> usize {
        3 * self.max_key_name_len + 8
    }

    /// Smallest key that can carry one unit after its own reserve.
    pub fn min_key_len(&self) -> usize {
        self.reserved_key_len() + MAX_UNIT_LEN
    }

    pub fn check_key_name(&self, name: &str) -> Result<(), CodecError> {
        let ok = !name.is_empty()
            && name.len() <= self.max_key_name_len
            && name.bytes().all(|b| b.is_ascii_uppercase());
        if ok {
            Ok(())
        } else {
            Err(CodecError::InvalidKeyName { name: name.to_owned(), max: self.max_key_name_len })
        }
    }
}

// ── Sections ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Section {
    #[default]
    Default,
    Header,
    Checksum,
}

impl Section {
    pub fn id(self) -> u8 {
        match self {
            Section::Default  => b'D',
            Section::Header   => b'H',
            Section::Checksum => b'C',
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            b'D' => Some(Section::Default),
            b'H' => Some(Section::Header),
            b'C' => Some(Section::Checksum),
            _    => None,
        }
    }
}

// ── Content types and headers ────────────────────────────────────────────────

/// Whether `content_type` is carried on the text path.
pub fn is_text_content_type(content_type: &str) -> bool {
    let ct = content_type.trim().to_ascii_lowercase();
    ct.starts_with("text")
        || matches!(ct.as_str(), "application/json" | "application/xml" | "json" | "txt" | "xml")
}

pub fn format_headers(headers: &BTreeMap<String, String>) -> String {
    headers.iter()
        .flat_map(|(k, v)| [k.as_str(), v.as_str()])
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse `key value key value ...`.  An odd token count keeps every complete
/// pair and reports the dangling key.
pub fn parse_headers(text: &str) -> (BTreeMap<String, String>, Option<String>) {
    let tokens: Vec<&str> = text.split(' ').filter(|t| !t.is_empty()).collect();
    let headers = tokens.chunks_exact(2)
        .map(|kv| (kv[0].to_owned(), kv[1].to_owned()))
        .collect();
    let error = (tokens.len() % 2 == 1).then(|| {
        format!("odd header token count {}, dangling key {:?}", tokens.len(), tokens[tokens.len() - 1])
    });
    (headers, error)
}

// ── Symbol builders ──────────────────────────────────────────────────────────
//
// Each builder appends one unit to `out` and advances `state` to the mode
// the decoder will be in after reading it.

pub(crate) fn hex_state(state: &CodecState) -> CodecState {
    CodecState::new(true, state.shift, true)
}

pub(crate) fn push_control(state: &mut CodecState, letter: u8, out: &mut Vec<u8>) {
    state.transition_into(CodecState::control(), out);
    out.push(letter);
}

pub(crate) fn push_section(state: &mut CodecState, section: Section, out: &mut Vec<u8>) {
    push_control(state, CTRL_SECTION, out);
    out.push(section.id());
}

pub(crate) fn push_hex_byte(state: &mut CodecState, byte: u8, out: &mut Vec<u8>) {
    state.transition_into(hex_state(state), out);
    out.push(b'A' + (byte >> 4));
    out.push(b'A' + (byte & 0x0F));
}

pub(crate) fn push_char(state: &mut CodecState, ch: char, out: &mut Vec<u8>) {
    match ch {
        '\n' => {
            state.transition_into(CodecState::for_table(Table::Al), out);
            out.push(CTRL_NEWLINE);
        }
        '\t'   => push_control(state, CTRL_TAB, out),
        '\x07' => push_control(state, CTRL_BELL, out),
        _ => match tables::locate(ch) {
            Some((table, letter)) => {
                state.transition_into(CodecState::for_table(table), out);
                out.push(letter);
            }
            None => {
                let mut utf8 = [0u8; 4];
                for &b in ch.encode_utf8(&mut utf8).as_bytes() {
                    push_hex_byte(state, b, out);
                }
            }
        },
    }
}

/// Announce `name` starting from `state`.  Returns the symbols and the state
/// they leave behind; the receiver switches keys right after the closing
/// `Y`, so whatever follows is built from that state under the new key.
pub(crate) fn key_announcement(state: CodecState, name: &str) -> (Vec<u8>, CodecState) {
    let mut s = state;
    let mut out = Vec::with_capacity(3 * name.len() + 8);
    s.transition_into(CodecState::new(true, s.shift, false), &mut out);
    out.push(CTRL_KEY);
    for ch in name.chars() {
        push_char(&mut s, ch, &mut out);
    }
    s.transition_into(CodecState::new(true, s.shift, false), &mut out);
    out.push(CTRL_KEY);
    (out, s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CTRL_END_MESSAGE;

    fn text(state: CodecState, s: &str) -> (Vec<u8>, CodecState) {
        let mut st = state;
        let mut out = Vec::new();
        for ch in s.chars() {
            push_char(&mut st, ch, &mut out);
        }
        (out, st)
    }

    #[test]
    fn same_table_needs_no_control_letters() {
        let (out, st) = text(CodecState::default(), "HELLO WORLD");
        assert_eq!(out, b"HELLOQWORLD");
        assert_eq!(st, CodecState::default());
    }

    #[test]
    fn alternating_tables_use_minimal_toggles() {
        let (out, _) = text(CodecState::default(), "A1B2");
        assert_eq!(out, b"AZBZBZC");
        let (out, _) = text(CodecState::default(), "Ab");
        assert_eq!(out, b"AZXZB");
        let (out, _) = text(CodecState::default(), "a!");
        // AL -> BL only needs alt
        assert_eq!(out, b"ZXZAZR");
    }

    #[test]
    fn newline_tab_and_bell() {
        let (out, st) = text(CodecState::default(), "A\nB");
        assert_eq!(out, b"AZXZQZXZB");
        assert_eq!(st, CodecState::default());
        let (out, _) = text(CodecState::default(), "\t\x07");
        assert_eq!(out, b"ZXCB");
    }

    #[test]
    fn unmapped_characters_fall_back_to_hex() {
        let (out, st) = text(CodecState::default(), "@");
        // '@' = 0x40
        assert_eq!(out, b"ZWEA");
        assert_eq!(st, CodecState::new(true, false, true));
        let (out, _) = text(CodecState::default(), "é");
        // U+00E9 = C3 A9
        assert_eq!(out, b"ZWMDKJ");
    }

    #[test]
    fn control_units_leave_hex_first() {
        let mut st = CodecState::new(true, false, true);
        let mut out = Vec::new();
        push_control(&mut st, CTRL_END_MESSAGE, &mut out);
        assert_eq!(out, b"XWE");
        let mut out = Vec::new();
        push_section(&mut st, Section::Header, &mut out);
        assert_eq!(out, b"AH");
    }

    #[test]
    fn announcement_and_resume_fit_reserve() {
        let opts = CodecOptions::default();
        let states = [
            CodecState::default(),
            CodecState::new(false, true, false),
            CodecState::new(true, false, false),
            CodecState::new(true, true, false),
            CodecState::new(true, false, true),
            CodecState::new(true, true, true),
        ];
        for st in states {
            for name in ["A", "QZQZQZQZ", "ABCDEFGH", "ZULU"] {
                let (ann, after) = key_announcement(st, name);
                assert!(ann.len() <= opts.reserved_key_len(), "{name} from {st:?}: {}", ann.len());
                let mut replay = st;
                replay.set_from_bytes(&ann);
                assert_eq!(replay, after);
                assert!(!after.hex);
                // any unit rebuilt from here still fits MAX_UNIT_LEN
                let mut s = after;
                let mut unit = Vec::new();
                push_char(&mut s, '\u{1F600}', &mut unit);
                assert!(unit.len() <= MAX_UNIT_LEN);
            }
        }
        let (ann, _) = key_announcement(CodecState::default(), "ABCDE");
        assert_eq!(ann, b"ZYZABCDEZY");
    }

    #[test]
    fn text_content_types() {
        for ct in ["text/plain", "TEXT/HTML", "application/json", "APPLICATION/JSON", "json", "TXT", "xml", "application/xml"] {
            assert!(is_text_content_type(ct), "{ct}");
        }
        for ct in ["application/octet-stream", "image/png", "application/jsonx", "xmlish"] {
            assert!(!is_text_content_type(ct), "{ct}");
        }
    }

    #[test]
    fn header_line_roundtrip_and_odd_tokens() {
        let mut h = BTreeMap::new();
        h.insert(HEADER_FILENAME.to_owned(), "TEST.JSON".to_owned());
        h.insert(HEADER_CONTENT_TYPE.to_owned(), "APPLICATION/JSON".to_owned());
        let line = format_headers(&h);
        assert_eq!(line, "Content-Type APPLICATION/JSON Filename TEST.JSON");
        assert_eq!(parse_headers(&line), (h, None));

        let (partial, err) = parse_headers("Filename A.TXT Content-Type");
        assert_eq!(partial.len(), 1);
        assert_eq!(partial["Filename"], "A.TXT");
        assert!(err.unwrap().contains("Content-Type"));
    }

    #[test]
    fn reserve_grows_with_name_length() {
        let short = CodecOptions { max_key_name_len: 5 };
        assert_eq!(short.reserved_key_len(), 23);
        assert_eq!(CodecOptions::default().reserved_key_len(), 32);
        assert!(short.check_key_name("ABCDE").is_ok());
        assert!(short.check_key_name("ABCDEF").is_err());
        assert!(short.check_key_name("ab").is_err());
    }
}
