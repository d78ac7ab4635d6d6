//! Byte signatures with wildcard positions

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors when compiling a signature string
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    /// The signature contained no tokens at all
    #[error("signature is empty")]
    Empty,
    /// Every token was a wildcard, which would match at the first offset of any region
    #[error("signature contains only wildcards")]
    AllWildcards,
    /// A token was neither a hex byte nor a wildcard
    #[error("invalid signature token `{0}`")]
    InvalidToken(String),
}

/// A compiled byte signature.
///
/// Each element is either a literal byte (`Some`) or a wildcard (`None`).
/// Signatures are written the way disassemblers print them: whitespace separated
/// hex bytes with `?` or `??` for positions that may hold any value.
///
/// ```
/// use greatcircle_fix::scan::Pattern;
///
/// let pattern: Pattern = "48 8B ?? 28".parse().unwrap();
/// assert_eq!(pattern.len(), 4);
/// assert_eq!(pattern.find_in(&[0x90, 0x48, 0x8B, 0x01, 0x28]), Some(1));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    /// Match elements in order
    elements: Vec<Option<u8>>,
    /// Index of the first literal element, used as the search anchor
    anchor: usize,
}

impl Pattern {
    /// Builds a pattern from already split elements
    pub fn from_elements(elements: Vec<Option<u8>>) -> Result<Self, PatternError> {
        if elements.is_empty() {
            return Err(PatternError::Empty);
        }
        let anchor = elements
            .iter()
            .position(Option::is_some)
            .ok_or(PatternError::AllWildcards)?;
        Ok(Self { elements, anchor })
    }

    /// Number of elements (literal and wildcard) in the pattern
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Patterns can never be empty, this only exists to pair with [`Pattern::len`]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Elements of the pattern
    pub fn elements(&self) -> &[Option<u8>] {
        &self.elements
    }

    /// Checks whether `window` matches the pattern. `window` must be exactly [`Pattern::len`] bytes
    fn matches(&self, window: &[u8]) -> bool {
        self.elements
            .iter()
            .zip(window)
            .all(|(expected, actual)| expected.map_or(true, |b| b == *actual))
    }

    /// Returns the lowest offset in `haystack` at which the pattern matches
    pub fn find_in(&self, haystack: &[u8]) -> Option<usize> {
        let len = self.elements.len();
        if haystack.len() < len {
            return None;
        }
        let anchor_byte = self.elements[self.anchor]?;
        let last_start = haystack.len() - len;

        let mut start = 0;
        while start <= last_start {
            // jump straight to the next place the anchor byte lines up
            let skip = haystack[start + self.anchor..=last_start + self.anchor]
                .iter()
                .position(|b| *b == anchor_byte)?;
            start += skip;
            if self.matches(&haystack[start..start + len]) {
                return Some(start);
            }
            start += 1;
        }
        None
    }
}

impl FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let elements = s
            .split_whitespace()
            .map(|token| match token {
                "?" | "??" => Ok(None),
                _ if token.len() == 2 => u8::from_str_radix(token, 16)
                    .map(Some)
                    .map_err(|_| PatternError::InvalidToken(token.to_owned())),
                _ => Err(PatternError::InvalidToken(token.to_owned())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_elements(elements)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, element) in self.elements.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match element {
                Some(b) => write!(f, "{b:02X}")?,
                None => f.write_str("??")?,
            }
        }
        Ok(())
    }
}
