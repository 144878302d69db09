//! Streaming decoder: enciphered A–Z letters in, messages out.
//!
//! Input is processed one symbol at a time and may be split anywhere across
//! [`Decoder::write`] calls.  Anything that is not an uppercase letter is
//! dropped, so grouped or line-wrapped text decodes like the bare stream.
//!
//! Per symbol, in order: decrypt (once a key is open), section id after a
//! section select, hex nibble, `Z`, alt-only controls, alt+shift controls,
//! newline, then a table lookup.  Looked-up characters go to the key-name
//! buffer while key mode is on, otherwise to the open message's current
//! section.

use std::collections::BTreeMap;
use std::io::{self, Write};

use crc32fast::Hasher;
use log::{debug, info, warn};

use super::sink::{ChecksumStatus, MessageInfo, MessageSink};
use super::{parse_headers, CodecError, CodecOptions, Section};
use crate::cipher::{Cipher, Direction};
use crate::keystore::{KeyStore, KeyStoreError};
use crate::state::{
    CodecState, CTRL_ALT, CTRL_BELL, CTRL_END_MESSAGE, CTRL_END_TRANSMISSION, CTRL_HEX, CTRL_KEY,
    CTRL_NEWLINE, CTRL_RESERVED, CTRL_SECTION, CTRL_SHIFT, CTRL_TAB,
};
use crate::tables;

/// A message being received.
struct Incoming {
    id:             usize,
    section:        Section,
    headers:        BTreeMap<String, String>,
    header_error:   Option<String>,
    header_buf:     Vec<u8>,
    checksum_buf:   Vec<u8>,
    checksum_seen:  bool,
    crc:            Hasher,
    content_len:    usize,
}

impl Incoming {
    fn new(id: usize) -> Self {
        Self {
            id,
            section:       Section::Default,
            headers:       BTreeMap::new(),
            header_error:  None,
            header_buf:    Vec::new(),
            checksum_buf:  Vec::new(),
            checksum_seen: false,
            crc:           Hasher::new(),
            content_len:   0,
        }
    }

    fn checksum_status(&self) -> ChecksumStatus {
        if !self.checksum_seen {
            return ChecksumStatus::Absent;
        }
        let Ok(bytes) = <[u8; 4]>::try_from(self.checksum_buf.as_slice()) else {
            return ChecksumStatus::Malformed;
        };
        let expected = u32::from_be_bytes(bytes);
        let actual = self.crc.clone().finalize();
        if expected == actual {
            ChecksumStatus::Match { crc32: actual }
        } else {
            ChecksumStatus::Mismatch { expected, actual }
        }
    }
}

pub struct Decoder<S: MessageSink> {
    cipher:         Cipher,
    sink:           S,
    options:        CodecOptions,
    state:          CodecState,
    section_select: bool,
    key_mode:       bool,
    key_name:       Vec<u8>,
    /// High nibble waiting for its partner.
    nibble:         Option<u8>,
    message:        Option<Incoming>,
    /// Default-section bytes not yet handed to the sink.
    pending:        Vec<u8>,
    next_id:        usize,
    closed:         bool,
    symbols:        u64,
}

impl<S: MessageSink> Decoder<S> {
    pub fn new(cipher: Cipher, sink: S) -> Self {
        Self::with_options(cipher, sink, CodecOptions::default())
    }

    pub fn with_store(store: Box<dyn KeyStore>, sink: S) -> Self {
        Self::new(Cipher::new(store, Direction::Decrypt), sink)
    }

    pub fn with_options(cipher: Cipher, sink: S, options: CodecOptions) -> Self {
        debug_assert_eq!(cipher.direction(), Direction::Decrypt);
        Self {
            cipher,
            sink,
            options,
            state:          CodecState::default(),
            section_select: false,
            key_mode:       false,
            key_name:       Vec::new(),
            nibble:         None,
            message:        None,
            pending:        Vec::new(),
            next_id:        0,
            closed:         false,
            symbols:        0,
        }
    }

    pub fn state(&self) -> CodecState { self.state }
    pub fn key_name(&self) -> Option<&str> { self.cipher.key_name() }
    pub fn sink(&self) -> &S { &self.sink }
    pub fn is_closed(&self) -> bool { self.closed }

    pub fn into_sink(mut self) -> S {
        if let Err(e) = self.close() {
            warn!("decoder closed with error: {e}");
        }
        self.sink
    }

    /// Feed wire symbols.  Returns the number of bytes consumed, always all
    /// of `input` on success.
    pub fn write(&mut self, input: &[u8]) -> Result<usize, CodecError> {
        if self.closed {
            return Err(CodecError::Closed);
        }
        for &raw in input {
            if !raw.is_ascii_uppercase() {
                continue;
            }
            self.symbols += 1;
            let mut symbol = [raw];
            if self.cipher.has_key() {
                self.cipher.transform(&mut symbol)?;
            }
            self.symbol(symbol[0])?;
        }
        self.flush_content()?;
        Ok(input.len())
    }

    /// Close any open message as incomplete and end the sink's stream.
    /// Calling it again does nothing.
    pub fn close(&mut self) -> Result<(), CodecError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = if self.message.is_some() {
            warn!("decoder closed inside a message, delivering it incomplete");
            self.close_message(false)
        } else {
            Ok(())
        };
        self.cipher.close_key();
        self.sink.finish();
        debug!("decoder closed after {} symbols, {} message(s)", self.symbols, self.next_id);
        result
    }

    // ── Symbol dispatch ──────────────────────────────────────────────────────

    fn symbol(&mut self, s: u8) -> Result<(), CodecError> {
        if self.section_select {
            self.section_select = false;
            let section = Section::from_id(s).unwrap_or_else(|| {
                warn!("unknown section id {}, using default", s as char);
                Section::Default
            });
            return self.enter_section(section);
        }
        if self.state.is_nibble(s) {
            return self.push_nibble(s - b'A');
        }
        let (alt, shift) = (self.state.alt, self.state.shift);
        match s {
            CTRL_ALT => self.state.alt = !alt,
            CTRL_SHIFT if alt => self.state.shift = !shift,
            CTRL_HEX if alt => {
                if self.state.hex && self.nibble.is_some() {
                    return self.malformed(s);
                }
                self.state.hex = !self.state.hex;
            }
            CTRL_KEY if alt => self.toggle_key_mode()?,
            _ if self.state.hex => return self.malformed(s),
            CTRL_SECTION if alt && shift => self.section_select = true,
            CTRL_BELL if alt && shift => self.push_char('\x07')?,
            CTRL_TAB if alt && shift => self.push_char('\t')?,
            CTRL_END_MESSAGE if alt && shift => self.end_message()?,
            CTRL_END_TRANSMISSION if alt && shift => self.end_transmission()?,
            _ if alt && shift && CTRL_RESERVED.contains(&s) => {}
            CTRL_NEWLINE if !alt && shift => self.push_char('\n')?,
            _ => match tables::decode(alt, shift, s) {
                Some(ch) => self.push_char(ch)?,
                None => debug!("dropping unmapped symbol {} in {:?}", s as char, self.state.table()),
            },
        }
        Ok(())
    }

    fn malformed(&mut self, s: u8) -> Result<(), CodecError> {
        warn!("malformed hex escape at {}, aborting message", s as char);
        self.nibble = None;
        self.state.hex = false;
        if self.message.is_some() {
            self.close_message(false)?;
        }
        Err(CodecError::MalformedHexEscape { symbol: s as char })
    }

    fn push_nibble(&mut self, n: u8) -> Result<(), CodecError> {
        match self.nibble.take() {
            None => {
                self.nibble = Some(n);
                Ok(())
            }
            Some(hi) => self.push_bytes(&[(hi << 4) | n]),
        }
    }

    fn push_char(&mut self, ch: char) -> Result<(), CodecError> {
        let mut utf8 = [0u8; 4];
        let len = ch.encode_utf8(&mut utf8).len();
        self.push_bytes(&utf8[..len])
    }

    fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        if self.key_mode {
            self.key_name.extend_from_slice(bytes);
            return Ok(());
        }
        let msg = self.ensure_message()?;
        match msg.section {
            Section::Default => {
                msg.crc.update(bytes);
                msg.content_len += bytes.len();
            }
            Section::Header => {
                msg.header_buf.extend_from_slice(bytes);
                return Ok(());
            }
            Section::Checksum => {
                msg.checksum_buf.extend_from_slice(bytes);
                return Ok(());
            }
        }
        self.pending.extend_from_slice(bytes);
        Ok(())
    }

    // ── Keys ─────────────────────────────────────────────────────────────────

    fn toggle_key_mode(&mut self) -> Result<(), CodecError> {
        if !self.key_mode {
            self.key_mode = true;
            self.key_name.clear();
            return Ok(());
        }
        self.key_mode = false;
        let name = String::from_utf8_lossy(&self.key_name).into_owned();
        self.key_name.clear();
        if name.len() > self.options.max_key_name_len {
            warn!("announced key name {name:?} is longer than {}", self.options.max_key_name_len);
        }
        match self.cipher.open_key(&name) {
            Ok(()) => {
                info!("receiving under key {name} ({} symbols)", self.cipher.bytes_left());
                Ok(())
            }
            Err(KeyStoreError::KeyNotFound(n)) => {
                warn!("announced key {n} not in store");
                self.cipher.close_key();
                if self.message.is_some() {
                    self.close_message(false)?;
                }
                Err(CodecError::KeyNotFound(n))
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    /// The open message, opening one at the sink first if needed.
    fn ensure_message(&mut self) -> Result<&mut Incoming, CodecError> {
        let msg = match self.message.take() {
            Some(m) => m,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                self.sink.open(id)?;
                debug!("message {id} opened");
                Incoming::new(id)
            }
        };
        Ok(self.message.insert(msg))
    }

    fn flush_content(&mut self) -> Result<(), CodecError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if let Some(msg) = &self.message {
            self.sink.content(msg.id, &self.pending)?;
        }
        self.pending.clear();
        Ok(())
    }

    fn enter_section(&mut self, section: Section) -> Result<(), CodecError> {
        self.nibble = None;
        self.finish_section()?;
        let msg = self.ensure_message()?;
        if section == Section::Checksum {
            msg.checksum_seen = true;
            msg.checksum_buf.clear();
        }
        msg.section = section;
        Ok(())
    }

    /// Close the active section: headers are parsed and handed on.
    fn finish_section(&mut self) -> Result<(), CodecError> {
        let Some(msg) = &mut self.message else {
            return Ok(());
        };
        if msg.section != Section::Header {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&msg.header_buf).into_owned();
        let (headers, error) = parse_headers(&text);
        if let Some(e) = &error {
            warn!("message {}: header parse error: {e}", msg.id);
        }
        msg.headers = headers;
        msg.header_error = error;
        msg.section = Section::Default;
        let id = msg.id;
        let headers = msg.headers.clone();
        self.flush_content()?;
        self.sink.headers(id, &headers)
    }

    fn end_message(&mut self) -> Result<(), CodecError> {
        self.ensure_message()?;
        self.close_message(true)
    }

    fn end_transmission(&mut self) -> Result<(), CodecError> {
        let result = if self.message.is_some() {
            warn!("end of transmission inside a message, delivering it incomplete");
            self.close_message(false)
        } else {
            Ok(())
        };
        self.state = CodecState::default();
        self.section_select = false;
        self.key_mode = false;
        self.key_name.clear();
        self.cipher.close_key();
        debug!("end of transmission");
        result
    }

    fn close_message(&mut self, complete: bool) -> Result<(), CodecError> {
        self.nibble = None;
        self.finish_section()?;
        self.flush_content()?;
        let Some(msg) = self.message.take() else {
            return Ok(());
        };
        let info = MessageInfo {
            id:           msg.id,
            checksum:     msg.checksum_status(),
            headers:      msg.headers,
            header_error: msg.header_error,
            complete,
            content_len:  msg.content_len,
        };
        debug!("message {} closed ({} bytes, {:?})", info.id, info.content_len, info.checksum);
        self.sink.close(info)
    }
}

impl<S: MessageSink> Write for Decoder<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Decoder::write(self, buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_content().map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::sink::Collector;
    use crate::codec::{key_announcement, push_char, push_control, push_hex_byte, push_section};
    use crate::keystore::{DummyKeyStore, DUMMY_KEY_NAME};

    /// Plaintext wire builder; the dummy key leaves symbols unchanged.
    struct Wire {
        s:   CodecState,
        out: Vec<u8>,
    }

    impl Wire {
        fn new() -> Self {
            let (out, s) = key_announcement(CodecState::default(), DUMMY_KEY_NAME);
            Self { s, out }
        }

        fn text(mut self, t: &str) -> Self {
            for ch in t.chars() {
                push_char(&mut self.s, ch, &mut self.out);
            }
            self
        }

        fn hex(mut self, bytes: &[u8]) -> Self {
            for &b in bytes {
                push_hex_byte(&mut self.s, b, &mut self.out);
            }
            self
        }

        fn section(mut self, section: Section) -> Self {
            push_section(&mut self.s, section, &mut self.out);
            self
        }

        fn control(mut self, letter: u8) -> Self {
            push_control(&mut self.s, letter, &mut self.out);
            self
        }

        fn raw(mut self, symbols: &[u8]) -> Self {
            self.out.extend_from_slice(symbols);
            self.s.set_from_bytes(symbols);
            self
        }
    }

    fn decoder() -> Decoder<Collector> {
        Decoder::with_store(Box::new(DummyKeyStore), Collector::new())
    }

    fn decode(wire: &[u8]) -> Vec<crate::codec::ReceivedMessage> {
        let mut dec = decoder();
        dec.write(wire).unwrap();
        dec.into_sink().into_messages()
    }

    #[test]
    fn plain_stream_decodes() {
        let msgs = decode(b"ZYZDUMMYZYZHIZXEF");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content(), b"HI");
        assert!(msgs[0].is_complete());
        assert_eq!(msgs[0].info.checksum, ChecksumStatus::Absent);
    }

    #[test]
    fn non_letters_are_dropped_anywhere() {
        let msgs = decode(b"ZYZDU MMYZY\nZHI-ZX E\tF");
        assert_eq!(msgs[0].content(), b"HI");
    }

    #[test]
    fn split_writes_match_single_write() {
        let wire = Wire::new().text("Hello, wörld\n\tok").hex(&[0, 255]).control(CTRL_END_MESSAGE).out;
        let whole = decode(&wire);
        let mut dec = decoder();
        for chunk in wire.chunks(3) {
            dec.write(chunk).unwrap();
        }
        let split = dec.into_sink().into_messages();
        assert_eq!(whole, split);
        let mut expected = "Hello, wörld\n\tok".as_bytes().to_vec();
        expected.extend([0, 255]);
        assert_eq!(whole[0].content(), expected.as_slice());
    }

    #[test]
    fn headers_are_parsed_and_bad_pairs_reported() {
        let wire = Wire::new()
            .section(Section::Header)
            .text("Filename A.TXT Dangling")
            .section(Section::Default)
            .text("X")
            .control(CTRL_END_MESSAGE)
            .out;
        let msgs = decode(&wire);
        assert_eq!(msgs[0].info.filename(), Some("A.TXT"));
        assert!(msgs[0].info.header_error.as_deref().unwrap().contains("Dangling"));
        assert_eq!(msgs[0].content(), b"X");
    }

    #[test]
    fn checksum_section_is_verified() {
        let crc = crc32fast::hash(b"OK");
        let good = Wire::new()
            .text("OK")
            .section(Section::Checksum)
            .hex(&crc.to_be_bytes())
            .section(Section::Default)
            .control(CTRL_END_MESSAGE)
            .out;
        assert!(decode(&good)[0].verify_checksum());

        let bad = Wire::new()
            .text("OK")
            .section(Section::Checksum)
            .hex(&(crc ^ 1).to_be_bytes())
            .control(CTRL_END_MESSAGE)
            .out;
        let msg = &decode(&bad)[0];
        assert!(!msg.verify_checksum());
        assert!(matches!(msg.info.checksum, ChecksumStatus::Mismatch { .. }));

        let short = Wire::new().section(Section::Checksum).hex(&[1, 2]).control(CTRL_END_MESSAGE).out;
        assert_eq!(decode(&short)[0].info.checksum, ChecksumStatus::Malformed);
    }

    #[test]
    fn header_section_closes_on_direct_switch_to_checksum() {
        let crc = crc32fast::hash(b"OK");
        let wire = Wire::new()
            .text("OK")
            .section(Section::Header)
            .text("Filename A.B")
            .section(Section::Checksum)
            .hex(&crc.to_be_bytes())
            .control(CTRL_END_MESSAGE)
            .out;
        let msgs = decode(&wire);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].info.filename(), Some("A.B"));
        assert_eq!(msgs[0].info.header_error, None);
        assert_eq!(msgs[0].content(), b"OK");
        assert!(msgs[0].verify_checksum());
    }

    #[test]
    fn end_of_transmission_inside_headers_keeps_parsed_pairs() {
        let mut dec = decoder();
        let wire = Wire::new()
            .section(Section::Header)
            .text("Filename A.B")
            .control(CTRL_END_TRANSMISSION)
            .out;
        dec.write(&wire).unwrap();
        assert_eq!(dec.state(), CodecState::default());
        let msgs = dec.into_sink().into_messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].info.filename(), Some("A.B"));
        assert!(msgs[0].content().is_empty());
        assert!(!msgs[0].is_complete());
    }

    #[test]
    fn end_of_message_without_content_yields_empty_message() {
        let msgs = decode(&Wire::new().control(CTRL_END_MESSAGE).control(CTRL_END_MESSAGE).out);
        assert_eq!(msgs.len(), 2);
        assert!(msgs.iter().all(|m| m.content().is_empty() && m.is_complete()));
        assert_eq!(msgs[1].info.id, 1);
    }

    #[test]
    fn end_of_transmission_cuts_message_and_resets() {
        let mut dec = decoder();
        dec.write(&Wire::new().text("abc").control(CTRL_END_TRANSMISSION).out).unwrap();
        assert_eq!(dec.state(), CodecState::default());
        assert_eq!(dec.key_name(), None);
        let msgs = dec.into_sink().into_messages();
        assert_eq!(msgs[0].content(), b"abc");
        assert!(!msgs[0].is_complete());
    }

    #[test]
    fn reserved_controls_are_ignored() {
        let wire = Wire::new().text("A").control(b'D').control(b'G').control(b'J').text("B")
            .control(CTRL_END_MESSAGE).out;
        assert_eq!(decode(&wire)[0].content(), b"AB");
    }

    #[test]
    fn odd_nibble_at_hex_exit_is_malformed() {
        let mut dec = decoder();
        let wire = Wire::new().hex(&[0x41]).raw(b"B").out;
        dec.write(&wire).unwrap();
        let err = dec.write(b"W").unwrap_err();
        assert!(matches!(err, CodecError::MalformedHexEscape { symbol: 'W' }));
        let msgs = dec.into_sink().into_messages();
        assert_eq!(msgs[0].content(), b"A");
        assert!(!msgs[0].is_complete());
    }

    #[test]
    fn non_nibble_letter_in_hex_is_malformed() {
        let mut dec = decoder();
        let err = dec.write(&Wire::new().hex(&[0x41]).raw(b"R").out).unwrap_err();
        assert!(matches!(err, CodecError::MalformedHexEscape { symbol: 'R' }));
    }

    #[test]
    fn unknown_announced_key_is_reported() {
        let mut dec = decoder();
        let (wire, _) = key_announcement(CodecState::default(), "NOPE");
        assert!(matches!(dec.write(&wire), Err(CodecError::KeyNotFound(n)) if n == "NOPE"));
    }

    #[test]
    fn close_delivers_open_message_and_is_idempotent() {
        let mut dec = decoder();
        dec.write(&Wire::new().text("PART").out).unwrap();
        dec.close().unwrap();
        dec.close().unwrap();
        assert!(matches!(dec.write(b"A"), Err(CodecError::Closed)));
        assert!(dec.sink().is_finished());
        let msgs = dec.into_sink().into_messages();
        assert_eq!(msgs.len(), 1);
        assert!(!msgs[0].is_complete());
    }
}
