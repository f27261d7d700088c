//! Splits input text into units (sentences or paragraph lines) with stable
//! character offsets.
//!
//! Units tile the input exactly: the first starts at 0, each one ends where the
//! next starts, and the last ends at the input's length. Offsets count chars,
//! not bytes. A unit keeps its trailing terminator and whitespace.

use lazy_static::lazy_static;
use regex::Regex;

/// A sentence or paragraph slice of the original input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub text: String,
    pub start_index: usize,
    pub end_index: usize,
}

impl Unit {
    /// True when the unit ends with an explicit line break (plus optional
    /// whitespace), i.e. it closes a paragraph.
    pub fn ends_paragraph(&self) -> bool {
        PARAGRAPH_END.is_match(&self.text)
    }
}

lazy_static! {
    // Hebrew ׃, East Asian 。．, Burmese ။, Tibetan །, Arabic ۔؟, Devanagari ।॥
    static ref TERMINATOR: Regex =
        Regex::new(r"[.?!۔؟]\s+|[\n׃。．။།।॥]\s*").expect("terminator pattern");
    static ref PARAGRAPH_END: Regex = Regex::new(r"\n\s*$").expect("paragraph pattern");
}

/// Titles and short forms that end in a period without ending the sentence.
const ABBREVIATIONS: &[&str] = &[
    "Mr", "Mrs", "Ms", "Dr", "Prof", "Sr", "Jr", "St", "Ave", "Blvd", "vs", "etc", "e.g", "i.e",
    "Ph.D", "Inc", "Ltd", "Co", "Corp",
];

fn is_abbreviation(word: &str) -> bool {
    let word = word.trim_start_matches(|c: char| !c.is_alphanumeric());
    let mut chars = word.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        return c.is_uppercase();
    }
    ABBREVIATIONS.contains(&word)
}

/// A period match that closes an abbreviation rather than a sentence.
fn closes_abbreviation(text: &str, terminator_at: usize) -> bool {
    if !text[terminator_at..].starts_with('.') {
        return false;
    }
    let before = &text[..terminator_at];
    let word = before
        .rsplit(char::is_whitespace)
        .next()
        .unwrap_or(before);
    !word.is_empty() && is_abbreviation(word)
}

/// Split `text` into units.
///
/// Splits after sentence terminators followed by whitespace and after line
/// breaks. Empty input yields no units.
pub fn segment(text: &str) -> Vec<Unit> {
    let mut units = Vec::new();
    if text.is_empty() {
        return units;
    }

    let mut piece_start = 0;
    let mut char_offset = 0;
    for m in TERMINATOR.find_iter(text) {
        if closes_abbreviation(text, m.start()) && !m.as_str().contains('\n') {
            continue;
        }
        push_unit(&mut units, &text[piece_start..m.end()], &mut char_offset);
        piece_start = m.end();
    }
    if piece_start < text.len() {
        push_unit(&mut units, &text[piece_start..], &mut char_offset);
    }
    units
}

fn push_unit(units: &mut Vec<Unit>, slice: &str, char_offset: &mut usize) {
    let len = slice.chars().count();
    units.push(Unit {
        text: slice.to_string(),
        start_index: *char_offset,
        end_index: *char_offset + len,
    });
    *char_offset += len;
}
