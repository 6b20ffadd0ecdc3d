//! Partitioners hash partition keys to tokens and parse the token
//! strings hosts advertise for themselves.
//!
//! Murmur3 and CDC map keys into the signed 64-bit [`Token`] space.
//! ByteOrdered keeps keys as their raw bytes, so its tokens are byte strings.

use std::fmt::{self, Debug};

use bytes::Buf;

use crate::errors::{TokenCalculationError, TokenParseError};
use crate::routing::Token;

/// Describes a token space: how to parse the token strings hosts advertise
/// and how to hash a serialized partition key into a token.
pub trait TokenFactory: Send + Sync {
    /// Comparable position on the ring.
    type Token: Ord + Clone + Debug + Send + Sync;

    /// Name used in log and error messages.
    fn name(&self) -> &'static str;

    /// Parses a token as reported by a host.
    fn parse_token(&self, s: &str) -> Result<Self::Token, TokenParseError>;

    /// Hashes a serialized partition key.
    fn hash(&self, partition_key: &[u8]) -> Self::Token;
}

/// Partitioners whose tokens are 64-bit integers.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[non_exhaustive]
pub enum PartitionerName {
    /// `org.apache.cassandra.dht.Murmur3Partitioner`, the default.
    #[default]
    Murmur3,
    /// `com.scylladb.dht.CDCPartitioner`, used by CDC log tables.
    CDC,
}

impl PartitionerName {
    /// Recognizes a partitioner by its (possibly fully qualified) class name.
    pub fn from_class_name(name: &str) -> Option<Self> {
        if name.ends_with("Murmur3Partitioner") {
            Some(PartitionerName::Murmur3)
        } else if name.ends_with("CDCPartitioner") {
            Some(PartitionerName::CDC)
        } else {
            None
        }
    }

    /// Hashes a partition key given as its serialized components.
    ///
    /// A single component is hashed as is. Composite keys are encoded as
    /// `[u16 length][bytes][0x00]` per component before hashing.
    pub fn hash_partition_key(&self, components: &[&[u8]]) -> Result<Token, TokenCalculationError> {
        let mut hasher = self.build_hasher();
        if let [single] = components {
            hasher.write(single);
        } else {
            for component in components {
                let len: u16 = component
                    .len()
                    .try_into()
                    .map_err(|_| TokenCalculationError::ValueTooLong(component.len()))?;
                hasher.write(&len.to_be_bytes());
                hasher.write(component);
                hasher.write(&[0u8]);
            }
        }
        Ok(hasher.finish())
    }
}

impl Partitioner for PartitionerName {
    type Hasher = PartitionerHasherAny;

    fn build_hasher(&self) -> Self::Hasher {
        match self {
            PartitionerName::Murmur3 => {
                PartitionerHasherAny::Murmur3(Murmur3Partitioner.build_hasher())
            }
            PartitionerName::CDC => PartitionerHasherAny::CDC(CDCPartitioner.build_hasher()),
        }
    }
}

impl TokenFactory for PartitionerName {
    type Token = Token;

    fn name(&self) -> &'static str {
        match self {
            PartitionerName::Murmur3 => "Murmur3Partitioner",
            PartitionerName::CDC => "CDCPartitioner",
        }
    }

    fn parse_token(&self, s: &str) -> Result<Token, TokenParseError> {
        s.parse().map_err(|_| TokenParseError {
            token: s.to_owned(),
            partitioner: self.name(),
        })
    }

    fn hash(&self, partition_key: &[u8]) -> Token {
        self.hash_one(partition_key)
    }
}

#[allow(clippy::upper_case_acronyms)]
pub(crate) enum PartitionerHasherAny {
    Murmur3(Murmur3PartitionerHasher),
    CDC(CDCPartitionerHasher),
}

impl PartitionerHasher for PartitionerHasherAny {
    fn write(&mut self, pk_part: &[u8]) {
        match self {
            PartitionerHasherAny::Murmur3(h) => h.write(pk_part),
            PartitionerHasherAny::CDC(h) => h.write(pk_part),
        }
    }

    fn finish(&self) -> Token {
        match self {
            PartitionerHasherAny::Murmur3(h) => h.finish(),
            PartitionerHasherAny::CDC(h) => h.finish(),
        }
    }
}

/// A partitioner computing tokens incrementally.
pub(crate) trait Partitioner {
    type Hasher: PartitionerHasher;

    fn build_hasher(&self) -> Self::Hasher;

    fn hash_one(&self, data: &[u8]) -> Token {
        let mut hasher = self.build_hasher();
        hasher.write(data);
        hasher.finish()
    }
}

/// Feeding a hasher with a key split into any number of parts
/// yields the same token as feeding it the whole key at once.
pub(crate) trait PartitionerHasher {
    fn write(&mut self, pk_part: &[u8]);
    fn finish(&self) -> Token;
}

pub(crate) struct Murmur3Partitioner;

impl Partitioner for Murmur3Partitioner {
    type Hasher = Murmur3PartitionerHasher;

    fn build_hasher(&self) -> Self::Hasher {
        Murmur3PartitionerHasher {
            total_len: 0,
            pending: [0; BLOCK],
            h1: 0,
            h2: 0,
        }
    }
}

const BLOCK: usize = 16;
const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

/// The x64 128-bit MurmurHash3 variant used by Cassandra, keeping only the
/// lower half. Unlike the reference implementation it treats tail bytes as
/// signed, which changes results for bytes >= 0x80.
pub(crate) struct Murmur3PartitionerHasher {
    total_len: usize,
    pending: [u8; BLOCK],
    h1: u64,
    h2: u64,
}

impl Murmur3PartitionerHasher {
    fn mix_k1(k1: u64) -> u64 {
        k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2)
    }

    fn mix_k2(k2: u64) -> u64 {
        k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1)
    }

    fn mix_block(&mut self, mut block: &[u8]) {
        let k1 = block.get_u64_le();
        let k2 = block.get_u64_le();

        self.h1 ^= Self::mix_k1(k1);
        self.h1 = self
            .h1
            .rotate_left(27)
            .wrapping_add(self.h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dc_e729);

        self.h2 ^= Self::mix_k2(k2);
        self.h2 = self
            .h2
            .rotate_left(31)
            .wrapping_add(self.h1)
            .wrapping_mul(5)
            .wrapping_add(0x3849_5ab5);
    }

    fn fmix(mut k: u64) -> u64 {
        k ^= k >> 33;
        k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
        k ^= k >> 33;
        k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
        k ^= k >> 33;
        k
    }

    /// Little-endian word built from sign-extended bytes.
    fn signed_tail_word(bytes: &[u8]) -> u64 {
        bytes.iter().enumerate().fold(0u64, |acc, (i, &b)| {
            acc ^ ((b as i8 as i64 as u64) << (i * 8))
        })
    }
}

impl PartitionerHasher for Murmur3PartitionerHasher {
    fn write(&mut self, mut pk_part: &[u8]) {
        let pending_len = self.total_len % BLOCK;
        self.total_len += pk_part.len();

        if pending_len > 0 {
            let take = Ord::min(BLOCK - pending_len, pk_part.len());
            self.pending[pending_len..pending_len + take].copy_from_slice(&pk_part[..take]);
            pk_part = &pk_part[take..];
            if pending_len + take < BLOCK {
                return;
            }
            let block = self.pending;
            self.mix_block(&block);
        }

        let mut blocks = pk_part.chunks_exact(BLOCK);
        for block in &mut blocks {
            self.mix_block(block);
        }
        let rest = blocks.remainder();
        self.pending[..rest.len()].copy_from_slice(rest);
    }

    fn finish(&self) -> Token {
        let mut h1 = self.h1;
        let mut h2 = self.h2;

        let tail = &self.pending[..self.total_len % BLOCK];
        if tail.len() > 8 {
            h2 ^= Self::mix_k2(Self::signed_tail_word(&tail[8..]));
        }
        if !tail.is_empty() {
            h1 ^= Self::mix_k1(Self::signed_tail_word(&tail[..tail.len().min(8)]));
        }

        h1 ^= self.total_len as u64;
        h2 ^= self.total_len as u64;

        h1 = h1.wrapping_add(h2);
        h2 = h2.wrapping_add(h1);

        h1 = Self::fmix(h1);
        h2 = Self::fmix(h2);

        h1 = h1.wrapping_add(h2);

        Token::new(h1 as i64)
    }
}

pub(crate) struct CDCPartitioner;

impl Partitioner for CDCPartitioner {
    type Hasher = CDCPartitionerHasher;

    fn build_hasher(&self) -> Self::Hasher {
        CDCPartitionerHasher {
            len: 0,
            prefix: [0; 8],
        }
    }
}

/// The CDC partitioner takes the first eight bytes of the key as a
/// big-endian token and ignores the rest.
pub(crate) struct CDCPartitionerHasher {
    len: usize,
    prefix: [u8; 8],
}

impl PartitionerHasher for CDCPartitionerHasher {
    fn write(&mut self, pk_part: &[u8]) {
        let take = Ord::min(pk_part.len(), self.prefix.len() - self.len);
        self.prefix[self.len..self.len + take].copy_from_slice(&pk_part[..take]);
        self.len += take;
    }

    fn finish(&self) -> Token {
        if self.len < self.prefix.len() {
            // Scylla answers short keys with its minimum token,
            // whose long value is i64::MIN.
            Token::INVALID
        } else {
            Token::new(i64::from_be_bytes(self.prefix))
        }
    }
}

/// A token of the ByteOrdered partitioner: the partition key itself.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteOrderedToken(pub Vec<u8>);

impl Debug for ByteOrderedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        self.0.iter().try_for_each(|b| write!(f, "{b:02x}"))
    }
}

/// `org.apache.cassandra.dht.ByteOrderedPartitioner`. Hosts advertise
/// its tokens hex encoded.
#[derive(Clone, Copy, Debug, Default)]
pub struct ByteOrderedPartitioner;

impl TokenFactory for ByteOrderedPartitioner {
    type Token = ByteOrderedToken;

    fn name(&self) -> &'static str {
        "ByteOrderedPartitioner"
    }

    fn parse_token(&self, s: &str) -> Result<ByteOrderedToken, TokenParseError> {
        let err = || TokenParseError {
            token: s.to_owned(),
            partitioner: self.name(),
        };
        let hex = s.trim().trim_start_matches("0x").as_bytes();
        if hex.len() % 2 != 0 {
            return Err(err());
        }
        hex.chunks_exact(2)
            .map(|pair| {
                let digits = std::str::from_utf8(pair).map_err(|_| err())?;
                u8::from_str_radix(digits, 16).map_err(|_| err())
            })
            .collect::<Result<Vec<u8>, _>>()
            .map(ByteOrderedToken)
    }

    fn hash(&self, partition_key: &[u8]) -> ByteOrderedToken {
        ByteOrderedToken(partition_key.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;
    use rand_pcg::Pcg32;

    use crate::utils::test_utils::setup_tracing;

    use super::*;

    fn assert_correct_murmur3_hash(pk: &'static str, expected_hash: i64) {
        let hash = Murmur3Partitioner.hash_one(pk.as_bytes()).value();
        assert_eq!(hash, expected_hash);
    }

    #[test]
    fn test_murmur3_partitioner() {
        setup_tracing();
        for s in [
            ("test", -6017608668500074083),
            ("xd", 4507812186440344727),
            ("primary_key", -1632642444691073360),
            ("kremówki", 4354931215268080151),
        ] {
            assert_correct_murmur3_hash(s.0, s.1);
        }
    }

    fn assert_correct_cdc_hash(pk: &'static str, expected_hash: i64) {
        let hash = CDCPartitioner.hash_one(pk.as_bytes()).value();
        assert_eq!(hash, expected_hash);
    }

    #[test]
    fn test_cdc_partitioner() {
        setup_tracing();
        for s in [
            ("test", i64::MIN),
            ("xd", i64::MIN),
            ("primary_key", 8102654598100187487),
            ("kremówki", 7742362231512463211),
        ] {
            assert_correct_cdc_hash(s.0, s.1);
        }
    }

    #[test]
    fn partitioners_output_same_result_no_matter_how_input_is_partitioned() {
        setup_tracing();
        let inputs: &[&[u8]] = &[
            b"",
            b"0",
            b"exactly sixteen!",
            "Ala ma kota, a kota ma Ala.".as_bytes(),
            "Zażółć gęślą jaźń. Wsiadł rycerz Szaławiła na bułanego konia.".as_bytes(),
        ];

        let mut randgen = Pcg32::new(0x2137, 0);

        fn feed_in_random_chunks(
            randgen: &mut impl Rng,
            hasher: &mut impl PartitionerHasher,
            mut data: &[u8],
        ) {
            while !data.is_empty() {
                let cut = randgen.random_range(0..=data.len());
                let (chunk, rest) = data.split_at(cut);
                hasher.write(chunk);
                data = rest;
            }
        }

        fn check_for_partitioner<P: Partitioner>(
            partitioner: P,
            randgen: &mut impl Rng,
            input: &[u8],
        ) {
            let expected = partitioner.hash_one(input);
            for _ in 0..500 {
                let mut hasher = partitioner.build_hasher();
                feed_in_random_chunks(randgen, &mut hasher, input);
                assert_eq!(hasher.finish(), expected);
            }
        }

        for input in inputs {
            check_for_partitioner(Murmur3Partitioner, &mut randgen, input);
            check_for_partitioner(CDCPartitioner, &mut randgen, input);
        }
    }

    #[test]
    fn composite_partition_key() {
        setup_tracing();
        let single = PartitionerName::Murmur3
            .hash_partition_key(&[&b"primary_key"[..]])
            .unwrap();
        assert_eq!(single.value(), -1632642444691073360);

        let composite = PartitionerName::Murmur3
            .hash_partition_key(&[&b"a"[..], &b"bc"[..]])
            .unwrap();
        let encoded = [0, 1, b'a', 0, 0, 2, b'b', b'c', 0];
        assert_eq!(composite, Murmur3Partitioner.hash_one(&encoded));

        let huge = vec![0u8; 70_000];
        assert_eq!(
            PartitionerName::Murmur3.hash_partition_key(&[&b"a"[..], &huge[..]]),
            Err(TokenCalculationError::ValueTooLong(70_000))
        );
    }

    #[test]
    fn token_factories_parse_advertised_tokens() {
        setup_tracing();
        let m = PartitionerName::from_class_name("org.apache.cassandra.dht.Murmur3Partitioner")
            .unwrap();
        assert_eq!(m.parse_token("-42").unwrap(), Token::new(-42));
        assert!(m.parse_token("0x2a").is_err());
        assert_eq!(
            PartitionerName::from_class_name("com.scylladb.dht.CDCPartitioner"),
            Some(PartitionerName::CDC)
        );
        assert_eq!(PartitionerName::from_class_name("RandomPartitioner"), None);

        let bop = ByteOrderedPartitioner;
        assert_eq!(
            bop.parse_token("00ff10").unwrap(),
            ByteOrderedToken(vec![0x00, 0xff, 0x10])
        );
        assert!(bop.parse_token("abc").is_err());
        assert!(bop.parse_token("zz").is_err());
        assert!(bop.hash(b"a") < bop.hash(b"b"));
    }
}
