//! Routing: deciding which host, and which shard on it, should serve a request.
//!
//! This includes:
//! - token representation,
//! - partitioners, which compute a token from a partition key,
//! - shard computation for Scylla hosts,
//! - replica locators: the static token ring and the dynamic tablet map.

pub mod locator;
pub mod partitioner;
mod sharding;

pub use sharding::{Shard, ShardCount, ShardInfo, Sharder, ShardingError};

use std::fmt;
use std::str::FromStr;

/// Token is a result of computing a hash of a primary key
///
/// It is basically an i64 with one caveat: i64::MIN is not
/// a valid token. It is used to represent infinity.
/// For this reason tokens are normalized: i64::MIN
/// is replaced with i64::MAX.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct Token {
    value: i64,
}

impl Token {
    /// Creates a new token with given value, normalizing the value if necessary
    #[inline]
    pub fn new(value: i64) -> Self {
        Self {
            value: if value == i64::MIN { i64::MAX } else { value },
        }
    }

    /// Holds i64::MIN. Only the CDC partitioner produces it, for keys
    /// shorter than eight bytes.
    pub(crate) const INVALID: Self = Token { value: i64::MIN };

    /// The raw value.
    #[inline]
    pub fn value(&self) -> i64 {
        self.value
    }
}

impl FromStr for Token {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Token, Self::Err> {
        Ok(Token::new(s.trim().parse()?))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}
