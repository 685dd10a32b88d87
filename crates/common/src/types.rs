//! Snowflake identifier types.
//!
//! The platform identifies guilds, channels and users with 64-bit
//! "snowflakes". On the wire they travel as decimal strings (JSON numbers
//! cannot hold the full range in every client), so the serde impls here write
//! strings and accept either strings or integers.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bits to the right of the timestamp portion of a snowflake.
const SNOWFLAKE_TIMESTAMP_SHIFT: u32 = 22;

/// Error returned when a snowflake string is not a valid `u64`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid snowflake: {0}")]
pub struct SnowflakeParseError(pub String);

macro_rules! snowflake_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            /// Wrap a raw snowflake value.
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// The raw snowflake value.
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = SnowflakeParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<u64>()
                    .map(Self)
                    .map_err(|_| SnowflakeParseError(s.to_string()))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserializer.deserialize_any(SnowflakeVisitor).map(Self)
            }
        }
    };
}

snowflake_id!(
    /// Identifier of a guild, the session group within which at most one
    /// voice session is active.
    GuildId
);

snowflake_id!(
    /// Identifier of a voice channel inside a guild.
    ChannelId
);

snowflake_id!(
    /// Identifier of a user.
    UserId
);

struct SnowflakeVisitor;

impl Visitor<'_> for SnowflakeVisitor {
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a snowflake as a decimal string or unsigned integer")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<u64, E> {
        Ok(value)
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<u64, E> {
        u64::try_from(value).map_err(|_| E::custom(format!("negative snowflake: {value}")))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<u64, E> {
        value
            .parse()
            .map_err(|_| E::custom(format!("invalid snowflake: {value}")))
    }
}

impl GuildId {
    /// Gateway shard responsible for this guild.
    ///
    /// Voice state requests must be sent on the shard that owns the guild:
    /// `(guild_id >> 22) % shard_count`. A `shard_count` of zero is treated
    /// as a single shard.
    #[must_use]
    pub fn shard(self, shard_count: u32) -> u32 {
        let count = u64::from(shard_count.max(1));
        let shard = (self.0 >> SNOWFLAKE_TIMESTAMP_SHIFT) % count;
        // shard < shard_count, which fits in u32
        u32::try_from(shard).unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let id: GuildId = "81384788765712384".parse().unwrap();
        assert_eq!(id, GuildId(81_384_788_765_712_384));
        assert_eq!(id.to_string(), "81384788765712384");

        let err = "not-a-number".parse::<ChannelId>().unwrap_err();
        assert_eq!(err, SnowflakeParseError("not-a-number".to_string()));
    }

    #[test]
    fn test_serializes_as_string() {
        let json = serde_json::to_string(&UserId(7)).unwrap();
        assert_eq!(json, "\"7\"");
    }

    #[test]
    fn test_deserializes_from_string_or_number() {
        let from_str: ChannelId = serde_json::from_str("\"10\"").unwrap();
        let from_num: ChannelId = serde_json::from_str("10").unwrap();
        assert_eq!(from_str, ChannelId(10));
        assert_eq!(from_num, ChannelId(10));

        assert!(serde_json::from_str::<ChannelId>("-1").is_err());
        assert!(serde_json::from_str::<ChannelId>("\"ten\"").is_err());
    }

    #[test]
    fn test_shard_routing() {
        // Shard is derived from the timestamp bits only.
        let guild = GuildId(41_771_983_423_143_937);
        let expected = u32::try_from((41_771_983_423_143_937_u64 >> 22) % 16).unwrap();
        assert_eq!(guild.shard(16), expected);

        assert_eq!(guild.shard(1), 0);
        assert_eq!(guild.shard(0), 0);
        assert_eq!(GuildId(1).shard(4), 0);
        assert_eq!(GuildId(3 << 22).shard(4), 3);
    }
}
