use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Position marker over the global event feed.
///
/// Tokens are totally ordered: `Initial` sorts before every numbered token and
/// `Current` after every numbered token. Numbered tokens compare numerically, so
/// `Numbered(2) < Numbered(10)`.
///
/// The text form is used wherever a token leaves the process (persisted
/// checkpoints, push message payloads):
///
/// | token          | text      |
/// |----------------|-----------|
/// | `Initial`      | `""`      |
/// | `Numbered(n)`  | `"n"`     |
/// | `Current`      | `"*"`     |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Token {
    /// Before every event.
    #[default]
    Initial,
    /// The global position assigned to a committed event.
    Numbered(u64),
    /// The live tail of the feed.
    Current,
}

impl Token {
    /// Returns the numeric position for numbered tokens.
    pub const fn number(self) -> Option<u64> {
        match self {
            Self::Numbered(n) => Some(n),
            Self::Initial | Self::Current => None,
        }
    }

    /// True when `self` is the numbered token directly after `previous`.
    ///
    /// Only numbered tokens have a known successor; `Initial` and `Current`
    /// never do.
    pub const fn is_successor_of(self, previous: Self) -> bool {
        match (previous, self) {
            (Self::Numbered(before), Self::Numbered(after)) => before.checked_add(1) == Some(after),
            _ => false,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => Ok(()),
            Self::Numbered(n) => write!(f, "{n}"),
            Self::Current => f.write_str("*"),
        }
    }
}

/// Error returned when text is not a valid token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid token text: {text:?}")]
pub struct ParseTokenError {
    /// The rejected input.
    pub text: String,
}

impl FromStr for Token {
    type Err = ParseTokenError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "" => Ok(Self::Initial),
            "*" => Ok(Self::Current),
            digits if digits.bytes().all(|b| b.is_ascii_digit()) => digits
                .parse()
                .map(Self::Numbered)
                .map_err(|_| ParseTokenError {
                    text: text.to_owned(),
                }),
            _ => Err(ParseTokenError {
                text: text.to_owned(),
            }),
        }
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn initial_sorts_before_numbered_and_current_after() {
        assert!(Token::Initial < Token::Numbered(0));
        assert!(Token::Numbered(u64::MAX) < Token::Current);
        assert!(Token::Initial < Token::Current);
    }

    #[test]
    fn numbered_tokens_compare_numerically() {
        assert!(Token::Numbered(2) < Token::Numbered(10));
        assert_eq!(
            "2".parse::<Token>().unwrap().cmp(&"10".parse::<Token>().unwrap()),
            std::cmp::Ordering::Less
        );
    }

    #[test]
    fn text_form_of_sentinels() {
        assert_eq!(Token::Initial.to_string(), "");
        assert_eq!(Token::Current.to_string(), "*");
        assert_eq!("".parse::<Token>().unwrap(), Token::Initial);
        assert_eq!("*".parse::<Token>().unwrap(), Token::Current);
    }

    #[test]
    fn rejects_malformed_text() {
        for text in ["abc", "-1", "1.5", " 3", "**", "99999999999999999999999"] {
            assert!(text.parse::<Token>().is_err(), "{text:?} should be rejected");
        }
    }

    #[test]
    fn serde_uses_text_form() {
        let json = serde_json::to_string(&Token::Numbered(42)).unwrap();
        assert_eq!(json, "\"42\"");
        let back: Token = serde_json::from_str("\"*\"").unwrap();
        assert_eq!(back, Token::Current);
    }

    #[test]
    fn successor_only_between_adjacent_numbered_tokens() {
        assert!(Token::Numbered(5).is_successor_of(Token::Numbered(4)));
        assert!(!Token::Numbered(6).is_successor_of(Token::Numbered(4)));
        assert!(!Token::Numbered(1).is_successor_of(Token::Initial));
        assert!(!Token::Current.is_successor_of(Token::Numbered(4)));
    }

    proptest! {
        #[test]
        fn order_follows_numeric_order(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(Token::Numbered(a).cmp(&Token::Numbered(b)), a.cmp(&b));
        }

        #[test]
        fn sentinels_bound_every_numbered_token(n in any::<u64>()) {
            prop_assert!(Token::Initial < Token::Numbered(n));
            prop_assert!(Token::Numbered(n) < Token::Current);
        }

        #[test]
        fn text_form_parses_back(n in any::<u64>()) {
            let token = Token::Numbered(n);
            prop_assert_eq!(token.to_string().parse::<Token>().unwrap(), token);
        }
    }
}
