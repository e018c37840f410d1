//! Fixed character → pattern lookup table.
//!
//! Read-only. Lesson content decides *which* characters to play; this table
//! only knows how each one sounds.

use super::{MorseSymbol, Pattern};

const MORSE_TABLE: &[(char, &str)] = &[
    ('A', ".-"),
    ('B', "-..."),
    ('C', "-.-."),
    ('D', "-.."),
    ('E', "."),
    ('F', "..-."),
    ('G', "--."),
    ('H', "...."),
    ('I', ".."),
    ('J', ".---"),
    ('K', "-.-"),
    ('L', ".-.."),
    ('M', "--"),
    ('N', "-."),
    ('O', "---"),
    ('P', ".--."),
    ('Q', "--.-"),
    ('R', ".-."),
    ('S', "..."),
    ('T', "-"),
    ('U', "..-"),
    ('V', "...-"),
    ('W', ".--"),
    ('X', "-..-"),
    ('Y', "-.--"),
    ('Z', "--.."),
    ('0', "-----"),
    ('1', ".----"),
    ('2', "..---"),
    ('3', "...--"),
    ('4', "....-"),
    ('5', "....."),
    ('6', "-...."),
    ('7', "--..."),
    ('8', "---.."),
    ('9', "----."),
    ('.', ".-.-.-"),
    (',', "--..--"),
    ('?', "..--.."),
    ('/', "-..-."),
    ('=', "-...-"),
    ('+', ".-.-."),
    ('-', "-....-"),
    ('@', ".--.-."),
    ('!', "-.-.--"),
    ('\'', ".----."),
    ('(', "-.--."),
    (')', "-.--.-"),
    ('&', ".-..."),
    (':', "---..."),
    (';', "-.-.-."),
    ('"', ".-..-."),
];

fn symbols_of(raw: &str) -> Pattern {
    raw.chars().filter_map(MorseSymbol::from_char).collect::<Vec<_>>().into()
}

/// Pattern for a character, case-insensitive. `None` for unmapped characters.
pub fn pattern_for_char(c: char) -> Option<Pattern> {
    let upper = c.to_ascii_uppercase();
    MORSE_TABLE
        .iter()
        .find(|(ch, _)| *ch == upper)
        .map(|(_, raw)| symbols_of(raw))
}

/// Reverse lookup: which character does a keyed pattern spell?
pub fn char_for_pattern(pattern: &Pattern) -> Option<char> {
    let text = pattern.to_string();
    MORSE_TABLE
        .iter()
        .find(|(_, raw)| *raw == text)
        .map(|(ch, _)| *ch)
}

/// One playable element of a text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextElement {
    Char(char, Pattern),
    /// Whitespace between words. Runs of whitespace collapse into one.
    WordBreak,
}

/// Expand text into characters and word breaks.
///
/// Unmapped characters are skipped with a debug log; leading/trailing and
/// repeated whitespace never produce extra breaks.
pub fn text_to_patterns(text: &str) -> Vec<TextElement> {
    let mut out = Vec::new();
    for c in text.chars() {
        if c.is_whitespace() {
            if matches!(out.last(), Some(TextElement::Char(..))) {
                out.push(TextElement::WordBreak);
            }
            continue;
        }
        match pattern_for_char(c) {
            Some(pattern) => out.push(TextElement::Char(c.to_ascii_uppercase(), pattern)),
            None => tracing::debug!(character = %c, "no morse pattern for character; skipping"),
        }
    }
    if matches!(out.last(), Some(TextElement::WordBreak)) {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::MorseSymbol::{Dash, Dot};

    #[test]
    fn lookup_common_letters() {
        assert_eq!(pattern_for_char('e').unwrap().symbols(), &[Dot]);
        assert_eq!(pattern_for_char('K').unwrap().symbols(), &[Dash, Dot, Dash]);
        assert_eq!(pattern_for_char('0').unwrap().len(), 5);
        assert!(pattern_for_char('#').is_none());
    }

    #[test]
    fn reverse_lookup() {
        let sos: Vec<_> = "SOS"
            .chars()
            .map(|c| char_for_pattern(&pattern_for_char(c).unwrap()))
            .collect();
        assert_eq!(sos, vec![Some('S'), Some('O'), Some('S')]);
    }

    #[test]
    fn text_expansion_collapses_whitespace() {
        let elements = text_to_patterns("  hi   k# ");
        assert_eq!(elements.len(), 4);
        assert!(matches!(elements[0], TextElement::Char('H', _)));
        assert!(matches!(elements[1], TextElement::Char('I', _)));
        assert_eq!(elements[2], TextElement::WordBreak);
        assert!(matches!(elements[3], TextElement::Char('K', _)));
    }
}
