use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use sha2::{Digest, Sha256};

/// The prefix under which jobs are kept in the [`CacheStore`](super::CacheStore).
const NAMESPACE: &str = "searches";

/// The content-addressed identity of a search.
///
/// This is the SHA-256 digest of the query text. It is stable across restarts and hosts, and
/// doubles as the `task_id` handed out to callers: whoever knows the digest can poll the
/// corresponding job.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    hash: [u8; 32],
}

impl CacheKey {
    /// Creates the [`CacheKey`] for the given query.
    pub fn from_query(query: &str) -> Self {
        let hash = Sha256::digest(query.as_bytes());
        Self { hash: hash.into() }
    }

    /// Returns the hex-formatted digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Returns the key under which the job for this search is stored.
    ///
    /// Jobs are namespaced like `searches:<digest>` so they never collide with other entries of a
    /// shared store.
    pub fn store_key(&self) -> String {
        format!("{NAMESPACE}:{self}")
    }

    /// Picks one of `shards` buckets for this key.
    pub fn shard(&self, shards: usize) -> usize {
        let mut prefix = [0; 8];
        prefix.copy_from_slice(&self.hash[..8]);
        (u64::from_le_bytes(prefix) % shards.max(1) as u64) as usize
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&self.to_hex()).finish()
    }
}

/// An error parsing a [`CacheKey`] from its hex representation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid task id: expected 64 hex characters")]
pub struct ParseCacheKeyError;

impl FromStr for CacheKey {
    type Err = ParseCacheKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut hash = [0; 32];
        hex::decode_to_slice(s.to_ascii_lowercase(), &mut hash).map_err(|_| ParseCacheKeyError)?;
        Ok(Self { hash })
    }
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest() {
        let key = CacheKey::from_query("abc");
        insta::assert_snapshot!(key, @"ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        assert_eq!(key.to_hex(), key.to_string());
        assert_eq!(
            key.store_key(),
            "searches:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_identity() {
        assert_eq!(CacheKey::from_query("abc"), CacheKey::from_query("abc"));
        assert_ne!(CacheKey::from_query("abc"), CacheKey::from_query("abd"));
        assert_ne!(CacheKey::from_query("abc"), CacheKey::from_query("abc "));
    }

    #[test]
    fn test_parse() {
        let key = CacheKey::from_query("rust async runtimes");
        let parsed: CacheKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);

        let upper: CacheKey = key.to_string().to_uppercase().parse().unwrap();
        assert_eq!(upper, key);

        assert!("".parse::<CacheKey>().is_err());
        assert!("abc".parse::<CacheKey>().is_err());
        assert!("zz".repeat(32).parse::<CacheKey>().is_err());
        assert!("ab".repeat(33).parse::<CacheKey>().is_err());
    }

    #[test]
    fn test_shard() {
        let key = CacheKey::from_query("abc");
        for shards in [1, 2, 7, 64] {
            assert!(key.shard(shards) < shards);
        }
        assert_eq!(key.shard(0), 0);
        assert_eq!(key.shard(64), key.shard(64));
    }
}
