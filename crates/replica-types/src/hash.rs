use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

const UUID_LEN: usize = 36;
const LEGACY_LEN: usize = 32;
const TEMP_PREFIX: &str = "t/";
/// Temp hashes are as long as UUID-shaped ones, so node sizes do not shift
/// when a flush swaps one for the other.
const TEMP_DIGITS: usize = UUID_LEN - TEMP_PREFIX.len();

/// Fixed middle section shared by every UUID-shaped hash.
const UUID_MIDDLE: &str = "-0000-4000-8000-";

const EMPTY_HASH: &str = "00000000-0000-4000-8000-000000000000";

/// Opaque identity of a chunk.
///
/// A `Hash` is either derived from content (via [`content_hasher`]), random
/// (via [`random_hasher`]), or temporary (via [`TempHashes`]). Temp hashes
/// live in their own `t/` namespace so they can never collide with the other
/// two, and a durable store refuses to persist them.
///
/// Hashes are totally ordered by their string form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hash(String);

impl Hash {
    /// The reserved empty hash. Denotes the empty B-tree.
    pub const EMPTY: &'static str = EMPTY_HASH;

    /// The reserved empty hash as a value.
    pub fn empty() -> Self {
        Self(EMPTY_HASH.to_owned())
    }

    /// Parse and validate a hash string.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        if is_uuid_shaped(s) || is_legacy(s) || is_temp(s) {
            Ok(Self(s.to_owned()))
        } else {
            Err(TypeError::InvalidHash(s.to_owned()))
        }
    }

    /// Derive a hash from content bytes (BLAKE3, truncated to 80 bits).
    pub fn from_content(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut bytes = [0u8; 10];
        bytes.copy_from_slice(&digest.as_bytes()[..10]);
        Self::from_bytes(bytes)
    }

    /// A fresh random hash.
    pub fn random() -> Self {
        Self::from_bytes(rand::random::<[u8; 10]>())
    }

    /// A temp hash for the given counter value.
    pub fn temp(counter: u64) -> Self {
        Self(format!("{TEMP_PREFIX}{:0width$x}", counter, width = TEMP_DIGITS))
    }

    /// A deterministic hash for tests: `word` (up to 12 hex digits) is padded
    /// into the last UUID group under a fixed `face` prefix.
    pub fn fake(word: &str) -> Self {
        debug_assert!(word.len() <= 12 && word.chars().all(|c| c.is_ascii_hexdigit()));
        Self(format!("face0000{UUID_MIDDLE}{word:0>12}"))
    }

    fn from_bytes(bytes: [u8; 10]) -> Self {
        let hex = hex::encode(bytes);
        Self(format!("{}{UUID_MIDDLE}{}", &hex[..8], &hex[8..]))
    }

    /// Returns `true` if this is the reserved empty hash.
    pub fn is_empty(&self) -> bool {
        self.0 == EMPTY_HASH
    }

    /// Returns `true` if this hash lives in the temp namespace.
    pub fn is_temp(&self) -> bool {
        self.0.starts_with(TEMP_PREFIX)
    }

    /// The full string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short representation for logs: the 8 most telling characters.
    pub fn short(&self) -> &str {
        let s = self.0.as_str();
        if self.is_temp() || s.starts_with("00000000") || s.starts_with("face0000") {
            &s[s.len() - 8..]
        } else {
            &s[..8]
        }
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Hash {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if is_uuid_shaped(&s) || is_legacy(&s) || is_temp(&s) {
            Ok(Self(s))
        } else {
            Err(TypeError::InvalidHash(s))
        }
    }
}

impl From<Hash> for String {
    fn from(hash: Hash) -> Self {
        hash.0
    }
}

impl AsRef<str> for Hash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn is_uuid_shaped(s: &str) -> bool {
    s.len() == UUID_LEN
        && s.is_ascii()
        && is_lower_hex(&s[..8])
        && &s[8..24] == UUID_MIDDLE
        && is_lower_hex(&s[24..])
}

fn is_legacy(s: &str) -> bool {
    s.len() == LEGACY_LEN
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'v').contains(&b))
}

fn is_temp(s: &str) -> bool {
    s.strip_prefix(TEMP_PREFIX)
        .is_some_and(|rest| rest.len() == TEMP_DIGITS && is_lower_hex(rest))
}

// ---------------------------------------------------------------------------
// Hash generators
// ---------------------------------------------------------------------------

/// Function used by a DAG store to assign hashes to new chunks. It receives
/// the serialized chunk data.
pub type ChunkHasher = Arc<dyn Fn(&[u8]) -> Hash + Send + Sync>;

/// Hashes chunk data with BLAKE3.
pub fn content_hasher() -> ChunkHasher {
    Arc::new(Hash::from_content)
}

/// Ignores the data and returns a random hash.
pub fn random_hasher() -> ChunkHasher {
    Arc::new(|_: &[u8]| Hash::random())
}

/// Deterministic counter-based hasher for tests. `prefix` (up to 8 hex
/// digits) fills the first UUID group. The counter starts at 1, so even an
/// all-zero prefix never yields the empty hash.
pub fn fake_hasher(prefix: &str) -> ChunkHasher {
    debug_assert!(prefix.len() <= 8 && prefix.chars().all(|c| c.is_ascii_hexdigit()));
    let prefix = format!("{prefix:0<8}");
    let counter = Arc::new(AtomicU64::new(1));
    Arc::new(move |_: &[u8]| {
        let n = counter.fetch_add(1, Ordering::Relaxed);
        Hash(format!("{prefix}{UUID_MIDDLE}{n:012x}"))
    })
}

/// Monotonic source of temp hashes.
///
/// Used for B-tree nodes that have been modified but not yet flushed. Temp
/// hashes are unique per instance.
#[derive(Debug, Default)]
pub struct TempHashes {
    next: AtomicU64,
}

impl TempHashes {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next temp hash.
    pub fn next_hash(&self) -> Hash {
        Hash::temp(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_hash_is_uuid_shaped() {
        let empty = Hash::empty();
        assert!(empty.is_empty());
        assert_eq!(Hash::parse(Hash::EMPTY).unwrap(), empty);
        assert!(!empty.is_temp());
    }

    #[test]
    fn content_hash_is_deterministic() {
        let h1 = Hash::from_content(b"hello");
        let h2 = Hash::from_content(b"hello");
        let h3 = Hash::from_content(b"world");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert!(Hash::parse(h1.as_str()).is_ok());
    }

    #[test]
    fn random_hashes_are_valid_and_distinct() {
        let a = Hash::random();
        let b = Hash::random();
        assert_ne!(a, b);
        assert!(Hash::parse(a.as_str()).is_ok());
    }

    #[test]
    fn temp_hashes_are_disjoint_from_uuid_hashes() {
        let temps = TempHashes::new();
        let t0 = temps.next_hash();
        let t1 = temps.next_hash();
        assert!(t0.is_temp());
        assert_ne!(t0, t1);
        assert!(Hash::parse(t0.as_str()).is_ok());
        assert_eq!(t0.as_str().len(), Hash::EMPTY.len());
        assert!(!Hash::from_content(b"x").is_temp());
    }

    #[test]
    fn parse_accepts_legacy_form() {
        let legacy = "0123456789abcdefghijklmnopqrstuv";
        assert!(Hash::parse(legacy).is_ok());
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["", "abc", "00000000-0000-4000-8000-00000000000g", "t/123", "0123456789abcdefghijklmnopqrstuw"] {
            assert!(matches!(Hash::parse(bad), Err(TypeError::InvalidHash(_))), "{bad}");
        }
    }

    #[test]
    fn fake_hashes_are_readable() {
        let h = Hash::fake("a1");
        assert_eq!(h.as_str(), "face0000-0000-4000-8000-0000000000a1");
        assert_eq!(format!("{h:?}"), "Hash(000000a1)");
    }

    #[test]
    fn fake_hasher_counts_up() {
        let hasher = fake_hasher("ab");
        assert_eq!(hasher(b"").as_str(), "ab000000-0000-4000-8000-000000000001");
        assert_eq!(hasher(b"").as_str(), "ab000000-0000-4000-8000-000000000002");
        assert!(!fake_hasher("0")(b"").is_empty());
    }

    #[test]
    fn serde_roundtrip_validates() {
        let h = Hash::fake("beef");
        let json = serde_json::to_string(&h).unwrap();
        let parsed: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(h, parsed);
        assert!(serde_json::from_str::<Hash>("\"nope\"").is_err());
    }

    #[test]
    fn ordering_follows_string_order() {
        assert!(Hash::fake("1") < Hash::fake("2"));
        assert!(Hash::empty() < Hash::fake("0"));
    }
}
