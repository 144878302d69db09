//! The four fixed symbol tables.
//!
//! Every wire symbol is a letter `A..=Z`; index `letter - b'A'` selects a
//! slot in one of four 26-entry tables addressed by the `(alt, shift)` mode
//! flags:
//!
//! | alt | shift | table | content                         |
//! |-----|-------|-------|---------------------------------|
//! | 0   | 0     | AU    | `ABCDEFGHIJKLMNOP RSTUVWXY_`    |
//! | 0   | 1     | AL    | `abcdefghijklmnop_rstuvwxy_`    |
//! | 1   | 0     | BU    | `0123456789ÅÄÖÆØ.Q?Z+-,____`    |
//! | 1   | 1     | BL    | `__________åäöæø:q!z"/%____`    |
//!
//! `_` is the dummy marker: no character maps to that slot.  Every dummy
//! slot coincides with a control letter for that table, so a well-formed
//! stream never asks for one.  Slot 25 (`Z`) is a dummy in all four tables
//! because `Z` is the global alt toggle.

/// Marker for a slot that carries no character.
pub const DUMMY: char = '_';

/// Number of symbols in the wire alphabet.
pub const ALPHABET_LEN: usize = 26;

const AU: [char; ALPHABET_LEN] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M',
    'N', 'O', 'P', ' ', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', DUMMY,
];
const AL: [char; ALPHABET_LEN] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm',
    'n', 'o', 'p', DUMMY, 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', DUMMY,
];
const BU: [char; ALPHABET_LEN] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'Å', 'Ä', 'Ö',
    'Æ', 'Ø', '.', 'Q', '?', 'Z', '+', '-', ',', DUMMY, DUMMY, DUMMY, DUMMY,
];
const BL: [char; ALPHABET_LEN] = [
    DUMMY, DUMMY, DUMMY, DUMMY, DUMMY, DUMMY, DUMMY, DUMMY, DUMMY, DUMMY, 'å', 'ä', 'ö',
    'æ', 'ø', ':', 'q', '!', 'z', '"', '/', '%', DUMMY, DUMMY, DUMMY, DUMMY,
];

/// Table identity, derived purely from the `(alt, shift)` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Au,
    Al,
    Bu,
    Bl,
}

impl Table {
    #[inline]
    pub fn select(alt: bool, shift: bool) -> Self {
        match (alt, shift) {
            (false, false) => Table::Au,
            (false, true)  => Table::Al,
            (true,  false) => Table::Bu,
            (true,  true)  => Table::Bl,
        }
    }

    /// The `(alt, shift)` flags that select this table.
    #[inline]
    pub fn flags(self) -> (bool, bool) {
        match self {
            Table::Au => (false, false),
            Table::Al => (false, true),
            Table::Bu => (true,  false),
            Table::Bl => (true,  true),
        }
    }

    fn entries(self) -> &'static [char; ALPHABET_LEN] {
        match self {
            Table::Au => &AU,
            Table::Al => &AL,
            Table::Bu => &BU,
            Table::Bl => &BL,
        }
    }

    const ALL: [Table; 4] = [Table::Au, Table::Al, Table::Bu, Table::Bl];
}

/// Wire letter for `value` in the table selected by `(alt, shift)`, or
/// `None` if the table does not hold it.
pub fn encode(alt: bool, shift: bool, value: char) -> Option<u8> {
    if value == DUMMY {
        return None;
    }
    Table::select(alt, shift)
        .entries()
        .iter()
        .position(|&c| c == value)
        .map(|idx| b'A' + idx as u8)
}

/// Character held at `letter` in the table selected by `(alt, shift)`.
///
/// Returns `None` for bytes outside `A..=Z` and for dummy slots.
pub fn decode(alt: bool, shift: bool, letter: u8) -> Option<char> {
    if !letter.is_ascii_uppercase() {
        return None;
    }
    match Table::select(alt, shift).entries()[(letter - b'A') as usize] {
        DUMMY => None,
        c     => Some(c),
    }
}

/// Find the table and wire letter carrying `value`.
pub fn locate(value: char) -> Option<(Table, u8)> {
    Table::ALL.iter().find_map(|&t| {
        let (alt, shift) = t.flags();
        encode(alt, shift, value).map(|letter| (t, letter))
    })
}
