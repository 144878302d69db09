//! Codec mode flags and minimal control-letter transitions.
//!
//! The active symbol table is always `Table::select(alt, shift)`; `hex` is
//! orthogonal and switches letters `A..=P` to nibble escapes.  Encoder and
//! decoder both start from [`CodecState::default`] and must stay in lock
//! step: every control letter the encoder emits is replayed by the decoder.

use crate::tables::Table;

/// Toggle `alt`.  Valid in every state.
pub const CTRL_ALT: u8 = b'Z';
/// Toggle `shift`.  Only valid while `alt` is set.
pub const CTRL_SHIFT: u8 = b'X';
/// Toggle `hex`.  Only valid while `alt` is set.
pub const CTRL_HEX: u8 = b'W';
/// Toggle key-name capture.  Only valid while `alt` is set.
pub const CTRL_KEY: u8 = b'Y';
/// Section select (`alt && shift`); the next symbol names the section.
pub const CTRL_SECTION: u8 = b'A';
/// Literal bell (`alt && shift`).
pub const CTRL_BELL: u8 = b'B';
/// Literal tab (`alt && shift`).
pub const CTRL_TAB: u8 = b'C';
/// End of message (`alt && shift`).
pub const CTRL_END_MESSAGE: u8 = b'E';
/// End of transmission (`alt && shift`).
pub const CTRL_END_TRANSMISSION: u8 = b'F';
/// Literal newline (`!alt && shift`).
pub const CTRL_NEWLINE: u8 = b'Q';
/// Reserved under `alt && shift`; consumed without output.
pub const CTRL_RESERVED: [u8; 5] = [b'D', b'G', b'H', b'I', b'J'];

/// Highest letter that is a nibble while `hex` is set.
pub const HEX_LAST: u8 = b'P';

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecState {
    pub alt:   bool,
    pub shift: bool,
    pub hex:   bool,
}

impl CodecState {
    pub const fn new(alt: bool, shift: bool, hex: bool) -> Self {
        Self { alt, shift, hex }
    }

    /// State that selects `table` with hex off.
    pub fn for_table(table: Table) -> Self {
        let (alt, shift) = table.flags();
        Self { alt, shift, hex: false }
    }

    /// State required for control letters `A..=J` (`alt && shift`, hex off).
    pub const fn control() -> Self {
        Self { alt: true, shift: true, hex: false }
    }

    #[inline]
    pub fn table(&self) -> Table {
        Table::select(self.alt, self.shift)
    }

    #[inline]
    pub fn is_nibble(&self, symbol: u8) -> bool {
        self.hex && (b'A'..=HEX_LAST).contains(&symbol)
    }

    /// Move to `desired`, appending the minimal control letters to `out`.
    ///
    /// Order: shift first, then hex, then alt.  `X` and `W` only exist in
    /// the alt tables, so alt is forced on before either of them; the final
    /// alt toggle is skipped when the forced value already matches.
    pub fn transition_into(&mut self, desired: CodecState, out: &mut Vec<u8>) {
        if self.shift != desired.shift {
            if !self.alt {
                out.push(CTRL_ALT);
                self.alt = true;
            }
            out.push(CTRL_SHIFT);
            self.shift = desired.shift;
        }
        if self.hex != desired.hex {
            if !self.alt {
                out.push(CTRL_ALT);
                self.alt = true;
            }
            out.push(CTRL_HEX);
            self.hex = desired.hex;
        }
        if self.alt != desired.alt {
            out.push(CTRL_ALT);
            self.alt = desired.alt;
        }
    }

    /// Move to `desired` and return the control letters that do it.
    pub fn transition(&mut self, desired: CodecState) -> Vec<u8> {
        let mut out = Vec::with_capacity(4);
        self.transition_into(desired, &mut out);
        out
    }

    /// Replay already-emitted symbols, updating only the mode flags.
    ///
    /// Data symbols, nibbles, key-mode toggles and section ids leave the
    /// flags untouched; end of transmission resets them.
    pub fn set_from_bytes(&mut self, symbols: &[u8]) {
        let mut section_id_next = false;
        for &s in symbols {
            if !s.is_ascii_uppercase() {
                continue;
            }
            if section_id_next {
                section_id_next = false;
                continue;
            }
            if self.is_nibble(s) {
                continue;
            }
            match s {
                CTRL_ALT => self.alt = !self.alt,
                CTRL_SHIFT if self.alt => self.shift = !self.shift,
                CTRL_HEX if self.alt => self.hex = !self.hex,
                CTRL_SECTION if self.alt && self.shift => section_id_next = true,
                CTRL_END_TRANSMISSION if self.alt && self.shift => *self = Self::default(),
                _ => {}
            }
        }
    }
}
