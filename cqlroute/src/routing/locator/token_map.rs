use std::cmp;
use std::collections::BTreeMap;

use itertools::Itertools;
use smallvec::SmallVec;
use tracing::warn;
use uuid::Uuid;

use super::TokenRing;
use crate::routing::partitioner::{PartitionerName, TokenFactory};

/// Hosts owning one ring position. Usually exactly one host.
pub type TokenOwners = SmallVec<[Uuid; 1]>;

/// Static token ownership of a cluster: a sorted ring of distinct tokens,
/// each mapped to the hosts that advertised it.
///
/// A `TokenMap` is never mutated. Topology changes rebuild it wholesale.
#[derive(Debug, Clone)]
pub struct TokenMap<F: TokenFactory = PartitionerName> {
    factory: F,
    ring: TokenRing<F::Token, TokenOwners>,
    unique_hosts: Vec<Uuid>,
}

impl<F: TokenFactory> TokenMap<F> {
    /// An empty map which resolves nothing.
    pub fn new_empty(factory: F) -> Self {
        TokenMap {
            factory,
            ring: TokenRing::new_empty(),
            unique_hosts: Vec::new(),
        }
    }

    /// Builds the ring from the tokens each host advertises.
    ///
    /// Tokens that the factory cannot parse are logged and skipped.
    /// A token advertised by several hosts is owned by all of them.
    pub fn build<I, S>(factory: F, host_tokens: impl IntoIterator<Item = (Uuid, I)>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut owners: BTreeMap<F::Token, TokenOwners> = BTreeMap::new();
        for (host_id, tokens) in host_tokens {
            for token_str in tokens {
                let token_str = token_str.as_ref();
                match factory.parse_token(token_str) {
                    Ok(token) => {
                        let hosts = owners.entry(token).or_default();
                        if !hosts.contains(&host_id) {
                            hosts.push(host_id);
                        }
                    }
                    Err(err) => {
                        warn!(
                            host_id = %host_id,
                            token = token_str,
                            error = %err,
                            "Skipping malformed token advertised by host"
                        );
                    }
                }
            }
        }

        let ring = TokenRing::new(owners.into_iter());
        let unique_hosts = ring
            .iter()
            .flat_map(|(_t, hosts)| hosts.iter().copied())
            .unique()
            .collect();

        TokenMap {
            factory,
            ring,
            unique_hosts,
        }
    }

    /// The token factory this map was built with.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Hosts owning `token`: those of the first ring entry not smaller than
    /// `token`, wrapping to the first entry past the end of the ring.
    pub fn get_replicas(&self, token: &F::Token) -> &[Uuid] {
        self.ring
            .get_elem_for_token(token)
            .map(|hosts| hosts.as_slice())
            .unwrap_or(&[])
    }

    /// Hashes a serialized partition key and resolves its owners.
    pub fn replicas_for_key(&self, partition_key: &[u8]) -> &[Uuid] {
        self.get_replicas(&self.factory.hash(partition_key))
    }

    /// SimpleStrategy placement: up to `replication_factor` distinct hosts,
    /// walking the ring clockwise from the owner of `token`.
    pub fn replicas_with_factor(
        &self,
        token: &F::Token,
        replication_factor: usize,
    ) -> impl Iterator<Item = Uuid> + '_ {
        let num_to_take = cmp::min(replication_factor, self.unique_hosts.len());
        self.ring
            .ring_range(token)
            .flat_map(|hosts| hosts.iter().copied())
            .unique()
            .take(num_to_take)
    }

    /// Every host present on the ring.
    pub fn hosts(&self) -> &[Uuid] {
        &self.unique_hosts
    }

    /// The underlying ring.
    pub fn ring(&self) -> &TokenRing<F::Token, TokenOwners> {
        &self.ring
    }

    /// Number of distinct tokens on the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` if no host advertised a usable token.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::partitioner::{ByteOrderedPartitioner, ByteOrderedToken};
    use crate::routing::Token;
    use crate::utils::test_utils::setup_tracing;

    fn host(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn successor_rule_wraps_around() {
        setup_tracing();
        let (a, b, c) = (host(1), host(2), host(3));
        let map = TokenMap::build(
            PartitionerName::Murmur3,
            [(a, vec!["10"]), (b, vec!["20"]), (c, vec!["30"])],
        );

        assert_eq!(map.get_replicas(&Token::new(25)), &[c]);
        assert_eq!(map.get_replicas(&Token::new(35)), &[a]);
        assert_eq!(map.get_replicas(&Token::new(20)), &[b]);
        assert_eq!(map.get_replicas(&Token::new(-100)), &[a]);
    }

    #[test]
    fn malformed_tokens_are_skipped() {
        setup_tracing();
        let (a, b) = (host(1), host(2));
        let map = TokenMap::build(
            PartitionerName::Murmur3,
            [(a, vec!["10", "ten", "30"]), (b, vec!["", "20"])],
        );

        assert_eq!(map.len(), 3);
        assert_eq!(map.get_replicas(&Token::new(15)), &[b]);
        assert_eq!(map.hosts(), &[a, b]);
    }

    #[test]
    fn shared_tokens_have_all_owners() {
        setup_tracing();
        let (a, b) = (host(1), host(2));
        let map = TokenMap::build(
            PartitionerName::Murmur3,
            [(a, vec!["10", "10"]), (b, vec!["10"])],
        );

        assert_eq!(map.len(), 1);
        assert_eq!(map.get_replicas(&Token::new(0)), &[a, b]);
    }

    #[test]
    fn empty_map_resolves_nothing() {
        setup_tracing();
        let map: TokenMap = TokenMap::new_empty(PartitionerName::Murmur3);
        assert!(map.is_empty());
        assert!(map.get_replicas(&Token::new(0)).is_empty());
        assert!(map.replicas_for_key(b"key").is_empty());
        assert_eq!(map.replicas_with_factor(&Token::new(0), 3).count(), 0);
    }

    #[test]
    fn replicas_with_factor_takes_distinct_hosts() {
        setup_tracing();
        let (a, b, c) = (host(1), host(2), host(3));
        let map = TokenMap::build(
            PartitionerName::Murmur3,
            [
                (a, vec!["10", "40"]),
                (b, vec!["20", "50"]),
                (c, vec!["30"]),
            ],
        );

        let replicas: Vec<Uuid> = map.replicas_with_factor(&Token::new(35), 2).collect();
        assert_eq!(replicas, vec![a, b]);

        let replicas: Vec<Uuid> = map.replicas_with_factor(&Token::new(45), 5).collect();
        assert_eq!(replicas, vec![b, a, c]);
    }

    #[test]
    fn key_is_hashed_with_the_partitioner() {
        setup_tracing();
        let (a, b) = (host(1), host(2));
        // "test" hashes to -6017608668500074083 under Murmur3.
        let map = TokenMap::build(
            PartitionerName::Murmur3,
            [(a, vec!["-7000000000000000000"]), (b, vec!["-6000000000000000000"])],
        );
        assert_eq!(map.replicas_for_key(b"test"), &[b]);
    }

    #[test]
    fn byte_ordered_ring() {
        setup_tracing();
        let (a, b) = (host(1), host(2));
        let map = TokenMap::build(ByteOrderedPartitioner, [(a, ["6d"]), (b, ["ff"])]);

        assert_eq!(map.replicas_for_key(b"apple"), &[a]);
        assert_eq!(map.replicas_for_key(b"pear"), &[b]);
        assert_eq!(map.get_replicas(&ByteOrderedToken(vec![0xff, 0x00])), &[a]);
    }
}
