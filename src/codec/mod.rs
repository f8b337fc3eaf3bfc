//! Fiscal number codec.
//!
//! Two shapes are legal:
//! - Standard: a letter other than `E`, a 2-digit type code, 8 sequence
//!   digits (11 characters, e.g. `B0100000001`).
//! - Electronic: `E`, a 2-digit type code, 11 sequence digits
//!   (14 characters, e.g. `E3100000000001`).
//!
//! Leading zeros in the sequence are not significant.

mod resolver;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::contracts::CodecError;

pub use resolver::{CategoryEntry, PrefixResolver, CATEGORY_TABLE};

/// Letter that marks the electronic numbering class.
pub const ELECTRONIC_MARKER: char = 'E';

/// Sequence digits for standard prefixes.
pub const STANDARD_PADDING: usize = 8;

/// Sequence digits for electronic prefixes.
pub const ELECTRONIC_PADDING: usize = 11;

/// Prefix used when a caller-supplied prefix is malformed: the standard
/// tax-credit invoice type, the most common one issued.
pub const DEFAULT_PREFIX: Prefix = Prefix {
    letter: 'B',
    type_code: 1,
};

/// Three-character prefix: one uppercase letter and a 2-digit type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Prefix {
    letter: char,
    type_code: u8,
}

impl Prefix {
    /// Parses a well-formed prefix (case-insensitive, surrounding whitespace
    /// ignored).
    pub fn parse(raw: &str) -> Result<Self, CodecError> {
        let upper = raw.trim().to_ascii_uppercase();
        let bytes = upper.as_bytes();
        if bytes.len() != 3
            || !bytes[0].is_ascii_alphabetic()
            || !bytes[1].is_ascii_digit()
            || !bytes[2].is_ascii_digit()
        {
            return Err(CodecError::InvalidPrefix(raw.to_string()));
        }
        Ok(Self {
            letter: bytes[0] as char,
            type_code: (bytes[1] - b'0') * 10 + (bytes[2] - b'0'),
        })
    }

    /// Takes the first three characters of `raw` as a prefix, falling back to
    /// [`DEFAULT_PREFIX`] when they are not letter + 2 digits.
    pub fn normalize(raw: &str) -> Self {
        let head: String = raw.trim().chars().take(3).collect();
        match Self::parse(&head) {
            Ok(prefix) => prefix,
            Err(_) => {
                tracing::debug!(raw = %raw, default = %DEFAULT_PREFIX, "malformed prefix, using default");
                DEFAULT_PREFIX
            }
        }
    }

    pub fn is_electronic(&self) -> bool {
        self.letter == ELECTRONIC_MARKER
    }

    /// Number of sequence digits for this prefix's class.
    pub fn padding(&self) -> usize {
        if self.is_electronic() {
            ELECTRONIC_PADDING
        } else {
            STANDARD_PADDING
        }
    }

    /// Highest sequence representable under this prefix.
    pub fn capacity(&self) -> u64 {
        10u64.pow(self.padding() as u32) - 1
    }

    /// Total length of a fiscal number under this prefix.
    pub fn number_len(&self) -> usize {
        3 + self.padding()
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:02}", self.letter, self.type_code)
    }
}

impl FromStr for Prefix {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Prefix {
    type Error = CodecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Prefix> for String {
    fn from(prefix: Prefix) -> Self {
        prefix.to_string()
    }
}

/// An immutable fiscal number, reconstructible from (prefix, sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FiscalNumber {
    prefix: Prefix,
    sequence: u64,
}

impl FiscalNumber {
    /// Builds a number, rejecting sequences beyond the prefix's capacity.
    pub fn new(prefix: Prefix, sequence: u64) -> Result<Self, CodecError> {
        let capacity = prefix.capacity();
        if sequence > capacity {
            return Err(CodecError::SequenceOutOfRange {
                prefix,
                sequence,
                capacity,
            });
        }
        Ok(Self { prefix, sequence })
    }

    pub fn prefix(&self) -> Prefix {
        self.prefix
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for FiscalNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:0width$}",
            self.prefix,
            self.sequence,
            width = self.prefix.padding()
        )
    }
}

impl FromStr for FiscalNumber {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, sequence) = parse(s)?;
        Self::new(prefix, sequence)
    }
}

impl TryFrom<String> for FiscalNumber {
    type Error = CodecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FiscalNumber> for String {
    fn from(number: FiscalNumber) -> Self {
        number.to_string()
    }
}

/// Splits a fiscal number into its prefix and numeric tail.
pub fn parse(text: &str) -> Result<(Prefix, u64), CodecError> {
    let upper = text.trim().to_ascii_uppercase();
    let bytes = upper.as_bytes();

    let expected_len = match bytes.first() {
        Some(&b) if b as char == ELECTRONIC_MARKER => 3 + ELECTRONIC_PADDING,
        Some(b) if b.is_ascii_alphabetic() => 3 + STANDARD_PADDING,
        _ => return Err(CodecError::Malformed(text.to_string())),
    };
    if bytes.len() != expected_len || !bytes[1..].iter().all(u8::is_ascii_digit) {
        return Err(CodecError::Malformed(text.to_string()));
    }

    let prefix = Prefix::parse(&upper[..3]).map_err(|_| CodecError::Malformed(text.to_string()))?;
    let sequence = upper[3..]
        .parse::<u64>()
        .map_err(|_| CodecError::Malformed(text.to_string()))?;
    Ok((prefix, sequence))
}

/// Formats `sequence` under `prefix`, zero-padded to the prefix class width.
///
/// A malformed `prefix` falls back to [`DEFAULT_PREFIX`]; a sequence beyond
/// capacity is an error and is never wrapped.
pub fn format(prefix: &str, sequence: u64) -> Result<String, CodecError> {
    FiscalNumber::new(Prefix::normalize(prefix), sequence).map(|n| n.to_string())
}

/// True iff `text` parses as either legal shape.
pub fn validate(text: &str) -> bool {
    parse(text).is_ok()
}

/// Sequence digits required by a prefix: 11 for electronic, else 8.
pub fn padding_for(prefix: &str) -> usize {
    match prefix.trim().chars().next() {
        Some(c) if c.to_ascii_uppercase() == ELECTRONIC_MARKER => ELECTRONIC_PADDING,
        _ => STANDARD_PADDING,
    }
}

/// Highest sequence representable under a prefix's class.
pub fn capacity_for(prefix: &str) -> u64 {
    10u64.pow(padding_for(prefix) as u32) - 1
}
