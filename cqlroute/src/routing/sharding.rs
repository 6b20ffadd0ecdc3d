use std::collections::HashMap;
use std::num::NonZeroU16;

use thiserror::Error;

use super::Token;

/// Index of a shard (CPU core) on a Scylla host.
pub type Shard = u32;
/// Number of shards on a Scylla host; never zero.
pub type ShardCount = NonZeroU16;

/// Sharding parameters a Scylla host advertises in SUPPORTED,
/// together with the shard the connection landed on.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct ShardInfo {
    /// Shard serving the connection that received this info.
    pub shard: u16,
    /// Number of shards on the host.
    pub nr_shards: ShardCount,
    /// How many most significant token bits the sharding function ignores.
    pub msb_ignore: u8,
}

/// Maps tokens to shards of one host.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Sharder {
    /// Number of shards on the host.
    pub nr_shards: ShardCount,
    /// How many most significant token bits the sharding function ignores.
    pub msb_ignore: u8,
}

impl ShardInfo {
    pub(crate) fn new(shard: u16, nr_shards: ShardCount, msb_ignore: u8) -> Self {
        ShardInfo {
            shard,
            nr_shards,
            msb_ignore,
        }
    }

    /// The sharding function described by this info.
    pub fn get_sharder(&self) -> Sharder {
        Sharder::new(self.nr_shards, self.msb_ignore)
    }
}

impl Sharder {
    /// Creates a sharder for a host with `nr_shards` shards.
    pub fn new(nr_shards: ShardCount, msb_ignore: u8) -> Self {
        Sharder {
            nr_shards,
            msb_ignore,
        }
    }

    /// Shard owning `token` on this host.
    pub fn shard_of(&self, token: Token) -> Shard {
        let biased_token = (token.value() as u64).wrapping_add(1u64 << 63);
        // Ignoring all 64 bits or more leaves nothing to shard by.
        let biased_token = biased_token
            .checked_shl(u32::from(self.msb_ignore))
            .unwrap_or(0);
        (((biased_token as u128) * (self.nr_shards.get() as u128)) >> 64) as Shard
    }
}

/// SUPPORTED did not carry usable sharding parameters.
#[derive(Clone, Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ShardingError {
    /// None of the sharding keys is present: the host is not a Scylla host.
    #[error("No sharding information present")]
    NoShardInfo,
    /// Some, but not all, sharding keys are present.
    #[error("ShardInfo parameter {0} missing")]
    MissingShardInfoParameter(&'static str),
    /// The host claims to have zero shards.
    #[error("ShardInfo contains an invalid number of shards (0)")]
    ZeroShards,
    /// The host asks to ignore more token bits than a token has.
    #[error("ShardInfo contains an invalid number of ignored token bits ({0}), expected less than 64")]
    MsbIgnoreTooLarge(u8),
    /// A parameter is not a number.
    #[error("ParseIntError encountered while getting ShardInfo")]
    ParseIntError(#[from] std::num::ParseIntError),
}

const SHARD_ENTRY: &str = "SCYLLA_SHARD";
const NR_SHARDS_ENTRY: &str = "SCYLLA_NR_SHARDS";
const MSB_IGNORE_ENTRY: &str = "SCYLLA_SHARDING_IGNORE_MSB";

impl<'a> TryFrom<&'a HashMap<String, Vec<String>>> for ShardInfo {
    type Error = ShardingError;

    fn try_from(options: &'a HashMap<String, Vec<String>>) -> Result<Self, Self::Error> {
        let entries = [SHARD_ENTRY, NR_SHARDS_ENTRY, MSB_IGNORE_ENTRY]
            .map(|key| (key, options.get(key).and_then(|values| values.first())));
        if entries.iter().all(|(_, value)| value.is_none()) {
            return Err(ShardingError::NoShardInfo);
        }
        let [shard, nr_shards, msb_ignore] =
            entries.map(|(key, value)| value.ok_or(ShardingError::MissingShardInfoParameter(key)));

        let shard = shard?.parse::<u16>()?;
        let nr_shards = nr_shards?.parse::<u16>()?;
        let nr_shards = ShardCount::new(nr_shards).ok_or(ShardingError::ZeroShards)?;
        let msb_ignore = msb_ignore?.parse::<u8>()?;
        if u32::from(msb_ignore) >= u64::BITS {
            return Err(ShardingError::MsbIgnoreTooLarge(msb_ignore));
        }
        Ok(ShardInfo::new(shard, nr_shards, msb_ignore))
    }
}
