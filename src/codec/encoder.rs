//! Streaming encoder: messages in, enciphered A–Z letters out.
//!
//! # Key handling
//! The first unit written allocates a key from the store and announces its
//! name in clear.  Before every later unit the encoder checks the key's
//! remaining symbols; once a unit would eat into the reserve
//! ([`CodecOptions::reserved_key_len`]) the next key is allocated and
//! announced under the old key, and the unit goes out under the new one.
//! Units are never split, so the mode state at a rotation point is always
//! the state the decoder holds; the interrupted unit is rebuilt from the
//! state the announcement leaves behind.
//!
//! If the store runs dry at a rotation point the reserve is spent on end of
//! transmission, which also cuts off any open message, and the encoder
//! closes with [`CodecError::KeyExhausted`].

use std::collections::BTreeMap;
use std::io::{self, Write};

use byteorder::{BigEndian, WriteBytesExt};
use crc32fast::Hasher;
use log::{debug, info, warn};

use super::{
    format_headers, is_text_content_type, key_announcement, push_char, push_control,
    push_hex_byte, push_section, CodecError, CodecOptions, Section, HEADER_CONTENT_TYPE,
    HEADER_FILENAME, MAX_UNIT_LEN,
};
use crate::cipher::{Cipher, Direction};
use crate::keystore::{Key, KeyStore, KeyStoreError};
use crate::state::{CodecState, CTRL_END_MESSAGE, CTRL_END_TRANSMISSION};

// ── Encoder ──────────────────────────────────────────────────────────────────

pub struct Encoder<W: Write> {
    out:          W,
    cipher:       Cipher,
    state:        CodecState,
    options:      CodecOptions,
    reserved:     usize,
    closed:       bool,
    keys_used:    usize,
    written:      u64,
}

impl<W: Write> Encoder<W> {
    pub fn new(out: W, cipher: Cipher) -> Self {
        Self::with_options(out, cipher, CodecOptions::default())
    }

    pub fn with_store(out: W, store: Box<dyn KeyStore>) -> Self {
        Self::new(out, Cipher::new(store, Direction::Encrypt))
    }

    pub fn with_options(out: W, cipher: Cipher, options: CodecOptions) -> Self {
        debug_assert_eq!(cipher.direction(), Direction::Encrypt);
        Self {
            out,
            cipher,
            state:        CodecState::default(),
            reserved:     options.reserved_key_len(),
            options,
            closed:       false,
            keys_used:    0,
            written:      0,
        }
    }

    /// Start a message.  Only one message can be open at a time.
    pub fn new_message(&mut self) -> Result<MessageWriter<'_, W>, CodecError> {
        if self.closed {
            return Err(CodecError::Closed);
        }
        Ok(MessageWriter::new(self))
    }

    /// Append end of transmission.  Calling it again does nothing.
    ///
    /// An encoder that never wrote anything emits nothing, so no key is
    /// spent on an empty transmission.
    pub fn close(&mut self) -> Result<(), CodecError> {
        if self.closed {
            return Ok(());
        }
        if self.cipher.has_key() {
            // End of transmission never needs another key; the reserve covers it.
            let mut s = self.state;
            let mut unit = Vec::with_capacity(4);
            push_control(&mut s, CTRL_END_TRANSMISSION, &mut unit);
            self.write_enciphered(&unit)?;
            self.cipher.close_key();
        }
        self.closed = true;
        self.out.flush()?;
        debug!("encoder closed after {} symbols, {} key(s)", self.written, self.keys_used);
        Ok(())
    }

    pub fn is_closed(&self) -> bool { self.closed }
    pub fn state(&self) -> CodecState { self.state }
    pub fn options(&self) -> &CodecOptions { &self.options }
    pub fn key_name(&self) -> Option<&str> { self.cipher.key_name() }
    /// Letters written to the output so far.
    pub fn symbols_written(&self) -> u64 { self.written }
    pub fn keys_used(&self) -> usize { self.keys_used }

    pub fn into_inner(self) -> W {
        self.out
    }

    // ── Units ────────────────────────────────────────────────────────────────

    fn build_unit<F>(&self, build: &F) -> Vec<u8>
    where
        F: Fn(&mut CodecState, &mut Vec<u8>),
    {
        let mut s = self.state;
        let mut unit = Vec::with_capacity(MAX_UNIT_LEN);
        build(&mut s, &mut unit);
        unit
    }

    /// Encipher one unit under a key with room for it, then advance the
    /// mode state by replaying it.  A unit that no longer fits triggers a
    /// rotation and is rebuilt from the state the announcement left.
    fn emit_with<F>(&mut self, build: F) -> Result<(), CodecError>
    where
        F: Fn(&mut CodecState, &mut Vec<u8>),
    {
        if self.closed {
            return Err(CodecError::Closed);
        }
        if !self.cipher.has_key() {
            self.acquire_first_key()?;
        }
        let mut unit = self.build_unit(&build);
        if self.usable() < unit.len() {
            self.rotate()?;
            unit = self.build_unit(&build);
            if self.usable() < unit.len() {
                return Err(self.too_short(self.cipher.key_name().unwrap_or_default()));
            }
        }
        self.write_enciphered(&unit)
    }

    /// Spend reserve symbols on `unit` without checking for rotation.
    fn write_enciphered(&mut self, unit: &[u8]) -> Result<(), CodecError> {
        self.cipher.write(unit)?;
        let mut buf = Vec::with_capacity(self.cipher.pending());
        self.cipher.drain_into(&mut buf);
        self.out.write_all(&buf)?;
        self.written += buf.len() as u64;
        self.state.set_from_bytes(unit);
        Ok(())
    }

    fn emit_char(&mut self, ch: char) -> Result<(), CodecError> {
        self.emit_with(|s, out| push_char(s, ch, out))
    }

    fn emit_hex_byte(&mut self, byte: u8) -> Result<(), CodecError> {
        self.emit_with(|s, out| push_hex_byte(s, byte, out))
    }

    fn emit_section(&mut self, section: Section) -> Result<(), CodecError> {
        self.emit_with(|s, out| push_section(s, section, out))
    }

    fn emit_text(&mut self, text: &str) -> Result<(), CodecError> {
        text.chars().try_for_each(|ch| self.emit_char(ch))
    }

    fn usable(&self) -> usize {
        self.cipher.bytes_left().saturating_sub(self.reserved)
    }

    // ── Keys ─────────────────────────────────────────────────────────────────

    fn too_short(&self, name: &str) -> CodecError {
        CodecError::KeyTooShort {
            name:   name.to_owned(),
            size:   self.cipher.bytes_left(),
            needed: self.options.min_key_len(),
        }
    }

    fn checked_key(&self, key: &dyn Key) -> Result<(), CodecError> {
        self.options.check_key_name(key.name())?;
        if key.bytes_left() < self.options.min_key_len() {
            return Err(CodecError::KeyTooShort {
                name:   key.name().to_owned(),
                size:   key.bytes_left(),
                needed: self.options.min_key_len(),
            });
        }
        Ok(())
    }

    fn next_key(&mut self) -> Result<Box<dyn Key>, CodecError> {
        match self.cipher.next_key() {
            Ok(key) => Ok(key),
            Err(KeyStoreError::NoMoreKeys) => Err(CodecError::KeyExhausted),
            Err(e) => Err(e.into()),
        }
    }

    /// Allocate the first key and announce it in clear.
    fn acquire_first_key(&mut self) -> Result<(), CodecError> {
        let key = self.next_key()?;
        self.checked_key(key.as_ref())?;

        let (announcement, after) = key_announcement(self.state, key.name());
        self.out.write_all(&announcement)?;
        self.written += announcement.len() as u64;
        self.state = after;

        info!("transmitting under key {} ({} symbols)", key.name(), key.bytes_left());
        self.cipher.rotate(key);
        self.keys_used += 1;
        Ok(())
    }

    /// Announce the next key under the current one, then switch.
    fn rotate(&mut self) -> Result<(), CodecError> {
        let next = match self.next_key() {
            Ok(k) => k,
            Err(CodecError::KeyExhausted) => {
                self.abort_transmission()?;
                return Err(CodecError::KeyExhausted);
            }
            Err(e) => return Err(e),
        };
        self.checked_key(next.as_ref())?;

        let (announcement, _) = key_announcement(self.state, next.name());
        self.write_enciphered(&announcement)?;

        info!(
            "rotating key {} -> {} with {} symbols left",
            self.cipher.key_name().unwrap_or("-"),
            next.name(),
            self.cipher.bytes_left(),
        );
        self.cipher.rotate(next);
        self.keys_used += 1;
        Ok(())
    }

    /// Spend the reserve on end of transmission.  An open message is left
    /// without its end marker so the receiver sees it was cut short.
    fn abort_transmission(&mut self) -> Result<(), CodecError> {
        warn!("key store exhausted, closing transmission");
        let mut s = self.state;
        let mut unit = Vec::with_capacity(4);
        push_control(&mut s, CTRL_END_TRANSMISSION, &mut unit);
        self.write_enciphered(&unit)?;
        self.cipher.close_key();
        self.closed = true;
        self.out.flush()?;
        Ok(())
    }
}

// ── MessageWriter ────────────────────────────────────────────────────────────

/// Header values are space separated on the wire, so they may not hold
/// whitespace or be empty.
fn header_value(name: &str, value: &str) -> String {
    if !value.is_empty() && !value.contains(char::is_whitespace) {
        return value.to_owned();
    }
    warn!("{name} header {value:?} holds whitespace or is empty, sending it with '_'");
    if value.is_empty() {
        return "_".to_owned();
    }
    value.chars().map(|c| if c.is_whitespace() { '_' } else { c }).collect()
}

/// One outgoing message.  Configure it before the first write; closing
/// (explicitly or on drop) appends the checksum and end-of-message marker.
pub struct MessageWriter<'a, W: Write> {
    enc:        &'a mut Encoder<W>,
    headers:    BTreeMap<String, String>,
    crc:        Option<Hasher>,
    binary:     bool,
    end_marker: bool,
    started:    bool,
    closed:     bool,
    /// Incomplete UTF-8 sequence left by the previous write.
    utf8_carry: Vec<u8>,
}

impl<'a, W: Write> MessageWriter<'a, W> {
    fn new(enc: &'a mut Encoder<W>) -> Self {
        Self {
            enc,
            headers:    BTreeMap::new(),
            crc:        None,
            binary:     false,
            end_marker: true,
            started:    false,
            closed:     false,
            utf8_carry: Vec::new(),
        }
    }

    /// Send a CRC-32 of the content for the receiver to verify.
    pub fn with_crc32(mut self) -> Self {
        self.crc = Some(Hasher::new());
        self
    }

    /// Declare the content type.  Non-text types are sent as hex bytes.
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.binary = !is_text_content_type(content_type);
        let value = header_value(HEADER_CONTENT_TYPE, content_type).to_uppercase();
        self.headers.insert(HEADER_CONTENT_TYPE.to_owned(), value);
        self
    }

    /// Whitespace in `filename` is sent as `_`.
    pub fn with_filename(mut self, filename: &str) -> Self {
        let value = header_value(HEADER_FILENAME, filename);
        self.headers.insert(HEADER_FILENAME.to_owned(), value);
        self
    }

    /// Leave the message open on the wire after close.
    pub fn without_end_marker(mut self) -> Self {
        self.end_marker = false;
        self
    }

    pub fn is_binary(&self) -> bool { self.binary }
    pub fn headers(&self) -> &BTreeMap<String, String> { &self.headers }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), CodecError> {
        if self.closed {
            return Err(CodecError::Closed);
        }
        self.start()?;
        if let Some(crc) = &mut self.crc {
            crc.update(data);
        }
        if self.binary {
            data.iter().try_for_each(|&b| self.enc.emit_hex_byte(b))
        } else {
            self.write_text(data)
        }
    }

    pub fn write_str(&mut self, s: &str) -> Result<(), CodecError> {
        self.write_bytes(s.as_bytes())
    }

    pub fn close(&mut self) -> Result<(), CodecError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.enc.closed {
            // An exhausted key store already ended the message on the wire.
            return Ok(());
        }
        self.start()?;

        let carry = std::mem::take(&mut self.utf8_carry);
        carry.iter().try_for_each(|&b| self.enc.emit_hex_byte(b))?;

        if let Some(crc) = self.crc.take() {
            let mut sum = Vec::with_capacity(4);
            sum.write_u32::<BigEndian>(crc.finalize())?;
            self.enc.emit_section(Section::Checksum)?;
            sum.iter().try_for_each(|&b| self.enc.emit_hex_byte(b))?;
            self.enc.emit_section(Section::Default)?;
        }
        if self.end_marker {
            self.enc.emit_with(|s, out| push_control(s, CTRL_END_MESSAGE, out))?;
        }
        Ok(())
    }

    /// Header section on first use.
    fn start(&mut self) -> Result<(), CodecError> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        if !self.headers.is_empty() {
            self.enc.emit_section(Section::Header)?;
            self.enc.emit_text(&format_headers(&self.headers))?;
            self.enc.emit_section(Section::Default)?;
        }
        Ok(())
    }

    /// Characters go through the tables; bytes that are not valid UTF-8 are
    /// escaped one by one; an unfinished sequence waits for the next write.
    fn write_text(&mut self, data: &[u8]) -> Result<(), CodecError> {
        let mut buf = std::mem::take(&mut self.utf8_carry);
        buf.extend_from_slice(data);

        let mut rest = buf.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => return self.enc.emit_text(s),
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    if let Ok(s) = std::str::from_utf8(valid) {
                        self.enc.emit_text(s)?;
                    }
                    match e.error_len() {
                        Some(n) => {
                            after[..n].iter().try_for_each(|&b| self.enc.emit_hex_byte(b))?;
                            rest = &after[n..];
                        }
                        None => {
                            self.utf8_carry = after.to_vec();
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

impl<W: Write> Write for MessageWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.enc.out.flush()
    }
}

impl<W: Write> Drop for MessageWriter<'_, W> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("message closed on drop with error: {e}");
        }
    }
}
