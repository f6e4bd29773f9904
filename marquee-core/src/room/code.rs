use std::fmt::{self, Display};

use lazy_static::lazy_static;
use rand::{thread_rng, Rng};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::DecodeError;

const CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

lazy_static! {
    static ref CODE_REGEX: Regex = Regex::new(r"^[A-Z0-9]{6}$").expect("valid regex");
}

/// The six character identifier of a room, shared between all nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    pub const LENGTH: usize = 6;

    /// Draws a fresh code uniformly at random.
    pub fn generate() -> Self {
        let mut rng = thread_rng();

        let code: String = (0..Self::LENGTH)
            .map(|_| CODE_CHARSET[rng.gen_range(0..CODE_CHARSET.len())] as char)
            .collect();

        Self(code)
    }

    /// Normalizes and validates client supplied input.
    ///
    /// Lowercase input refers to the same room as its uppercase form.
    pub fn parse(input: &str) -> Result<Self, DecodeError> {
        let normalized = input.trim().to_ascii_uppercase();

        if !CODE_REGEX.is_match(&normalized) {
            return Err(DecodeError::BadRoomCode(input.to_string()));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generated_codes_are_valid() {
        for _ in 0..100 {
            let code = RoomCode::generate();

            assert_eq!(code.as_str().len(), RoomCode::LENGTH);
            assert!(RoomCode::parse(code.as_str()).is_ok());
        }
    }

    #[test]
    fn parse_normalizes_to_uppercase() {
        let lower = RoomCode::parse("abcd12").expect("parses");
        let upper = RoomCode::parse("ABCD12").expect("parses");

        assert_eq!(lower, upper);
        assert_eq!(lower.as_str(), "ABCD12");
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(RoomCode::parse("").is_err());
        assert!(RoomCode::parse("ABC").is_err());
        assert!(RoomCode::parse("ABCD123").is_err());
        assert!(RoomCode::parse("ABC-12").is_err());
        assert!(RoomCode::parse("ABCD1é").is_err());
    }
}
