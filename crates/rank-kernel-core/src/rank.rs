use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Smallest byte allowed in a rank.
pub const MIN_CHAR: u8 = b'0';

/// Largest byte allowed in a rank.
pub const MAX_CHAR: u8 = b'z';

/// Upper bound on rank length. Common relational engines only order on the
/// first 1024 bytes of an indexed text column.
pub const MAX_RANK_LEN: usize = 1024;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RankError {
    #[error("rank MUST be non-empty")]
    Empty,
    #[error("rank {rank} contains invalid chars {chars:?}; allowed range is '0'..='z'")]
    InvalidChars { rank: String, chars: Vec<char> },
    #[error("rank length {len} exceeds the maximum of {max}")]
    MaxRankLength { len: usize, max: usize },
    #[error("last char of rank {rank} MUST NOT equal the min char '0'")]
    LastCharEqualsMinChar { rank: String },
    #[error("previous rank {prev} is greater than or equal to next rank {next}")]
    PrevGreaterThanOrEquals { prev: String, next: String },
}

/// Validated, immutable sort key compared by raw bytes.
///
/// Every constructor funnels through [`RankKey::validate`], so a value of this
/// type always satisfies the alphabet, length, and trailing-char rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RankKey(String);

impl RankKey {
    /// Parse an untrusted rank, e.g. one read back from storage.
    ///
    /// # Errors
    /// Returns [`RankError::Empty`], [`RankError::MaxRankLength`],
    /// [`RankError::InvalidChars`], or [`RankError::LastCharEqualsMinChar`],
    /// checked in that order.
    pub fn validate(raw: &str) -> Result<Self, RankError> {
        check(raw)?;
        Ok(Self(raw.to_string()))
    }

    /// Key for the first record of an empty sequence: the midpoint of the
    /// alphabet, `"U"`.
    #[must_use]
    pub fn for_empty_sequence() -> Self {
        Self(char::from(mid(MIN_CHAR, MAX_CHAR)).to_string())
    }

    /// Smallest-effort key strictly greater than `prev`.
    ///
    /// # Errors
    /// Returns [`RankError::MaxRankLength`] when `prev` ends near the top of the
    /// alphabet and is already at the length bound.
    pub fn after(prev: &Self) -> Result<Self, RankError> {
        let last = prev.last_byte();
        let mut bytes = prev.0.as_bytes().to_vec();

        if last + 1 >= MAX_CHAR {
            bytes.push(MIN_CHAR + 1);
        } else if let Some(slot) = bytes.last_mut() {
            *slot = last + 1;
        }

        Self::from_ascii(bytes)
    }

    /// Smallest-effort key strictly less than `next`.
    ///
    /// # Errors
    /// Returns [`RankError::MaxRankLength`] when `next` ends in `'1'` and is
    /// already at the length bound.
    pub fn before(next: &Self) -> Result<Self, RankError> {
        let last = next.last_byte();
        let mut bytes = next.0.as_bytes().to_vec();
        bytes.pop();
        bytes.push(last - 1);

        if last - 1 <= MIN_CHAR {
            bytes.push(MAX_CHAR - 1);
        }

        Self::from_ascii(bytes)
    }

    /// Key strictly between `prev` and `next`.
    ///
    /// Walks both keys position by position, reading a missing char of `prev`
    /// as [`MIN_CHAR`] and a missing char of `next` as [`MAX_CHAR`]. The first
    /// position whose midpoint differs from both bounds terminates the key.
    ///
    /// # Errors
    /// Returns [`RankError::PrevGreaterThanOrEquals`] unless `prev < next`, and
    /// [`RankError::MaxRankLength`] when no terminating position exists within
    /// the length bound.
    pub fn between(prev: &Self, next: &Self) -> Result<Self, RankError> {
        if prev >= next {
            return Err(RankError::PrevGreaterThanOrEquals {
                prev: prev.0.clone(),
                next: next.0.clone(),
            });
        }

        let prev_bytes = prev.0.as_bytes();
        let next_bytes = next.0.as_bytes();
        let mut bytes = Vec::with_capacity(prev_bytes.len().max(next_bytes.len()) + 1);

        for index in 0..=MAX_RANK_LEN {
            let prev_char = prev_bytes.get(index).copied().unwrap_or(MIN_CHAR);
            let next_char = next_bytes.get(index).copied().unwrap_or(MAX_CHAR);

            let mid_char = mid(prev_char, next_char);
            if mid_char == prev_char || mid_char == next_char {
                bytes.push(prev_char);
                continue;
            }

            bytes.push(mid_char);
            break;
        }

        Self::from_ascii(bytes)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; present for API symmetry with [`RankKey::len`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn last_byte(&self) -> u8 {
        self.0.as_bytes().last().copied().unwrap_or(MAX_CHAR)
    }

    fn from_ascii(bytes: Vec<u8>) -> Result<Self, RankError> {
        let raw: String = bytes.into_iter().map(char::from).collect();
        Self::try_from(raw)
    }
}

impl Display for RankKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RankKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for RankKey {
    type Err = RankError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::validate(raw)
    }
}

impl TryFrom<String> for RankKey {
    type Error = RankError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        check(&raw)?;
        Ok(Self(raw))
    }
}

impl TryFrom<&str> for RankKey {
    type Error = RankError;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        Self::validate(raw)
    }
}

impl From<RankKey> for String {
    fn from(rank: RankKey) -> Self {
        rank.0
    }
}

fn check(raw: &str) -> Result<(), RankError> {
    if raw.is_empty() {
        return Err(RankError::Empty);
    }

    if raw.len() > MAX_RANK_LEN {
        return Err(RankError::MaxRankLength { len: raw.len(), max: MAX_RANK_LEN });
    }

    let invalid: Vec<char> = raw.chars().filter(|ch| !is_rank_char(*ch)).collect();
    if !invalid.is_empty() {
        return Err(RankError::InvalidChars { rank: raw.to_string(), chars: invalid });
    }

    if raw.as_bytes().last() == Some(&MIN_CHAR) {
        return Err(RankError::LastCharEqualsMinChar { rank: raw.to_string() });
    }

    Ok(())
}

fn is_rank_char(ch: char) -> bool {
    u8::try_from(ch).is_ok_and(|byte| (MIN_CHAR..=MAX_CHAR).contains(&byte))
}

fn mid(prev: u8, next: u8) -> u8 {
    if prev >= next {
        return prev;
    }
    prev + (next - prev) / 2
}
