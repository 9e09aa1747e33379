//! Identifier and peer record types shared by the replimesh crates
//!
//! Peer identifiers and content identifiers are opaque strings. Peer records
//! only ever grow: addresses learned from any source are merged in, never
//! replaced.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};

/// Address protocols that may prefix a peer identifier
const PEER_PROTOCOLS: [&str; 2] = ["/p2p", "/ipfs"];

/// Opaque identifier of a network participant
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer identifier from its string form
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as given
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is already in canonical form, i.e. not wrapped
    /// in an address such as `/ip4/1.2.3.4/tcp/4001/p2p/<id>`
    pub fn is_canonical(&self) -> bool {
        !self.0.contains('/')
    }

    /// Strip any `/p2p/` or `/ipfs/` address prefix
    pub fn canonical(&self) -> PeerId {
        match self.0.rsplit_once('/') {
            Some((prefix, id))
                if !id.is_empty() && PEER_PROTOCOLS.iter().any(|p| prefix.ends_with(p)) =>
            {
                PeerId(id.to_string())
            }
            _ => self.clone(),
        }
    }

    /// Whether both identifiers name the same peer once canonicalized
    pub fn refers_to(&self, other: &PeerId) -> bool {
        self.canonical() == other.canonical()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PeerId::new(s))
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId::new(s)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// Content identifier, used as the root of a database
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Create a content identifier from its string form
    pub fn new(cid: impl Into<String>) -> Self {
        Self(cid.into())
    }

    /// The identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentId {
    fn from(s: &str) -> Self {
        ContentId::new(s)
    }
}

impl From<String> for ContentId {
    fn from(s: String) -> Self {
        ContentId(s)
    }
}

/// A known peer and every address it has been seen at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Canonical peer identifier
    pub id: PeerId,
    /// Known network addresses
    pub addresses: BTreeSet<Multiaddr>,
}

impl PeerRecord {
    /// Create a record with no known addresses
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self {
            id: id.into().canonical(),
            addresses: BTreeSet::new(),
        }
    }

    /// Create a record with the given addresses
    pub fn with_addresses<I>(id: impl Into<PeerId>, addresses: I) -> Self
    where
        I: IntoIterator<Item = Multiaddr>,
    {
        let mut record = Self::new(id);
        record.addresses.extend(addresses);
        record
    }

    /// Merge another view of the same peer into this one.
    ///
    /// Returns the number of addresses that were not known before.
    pub fn merge(&mut self, other: &PeerRecord) -> usize {
        let before = self.addresses.len();
        self.addresses.extend(other.addresses.iter().cloned());
        self.addresses.len() - before
    }

    /// Whether any address is known for this peer
    pub fn is_dialable(&self) -> bool {
        !self.addresses.is_empty()
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer {{ id: {}, addresses: {} }}", self.id, self.addresses.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_peer_id_canonical_form() {
        let plain = PeerId::new("QmPeer");
        assert!(plain.is_canonical());
        assert_eq!(plain.canonical(), plain);

        let wrapped = PeerId::new("/ip4/10.0.0.1/tcp/4001/p2p/QmPeer");
        assert!(!wrapped.is_canonical());
        assert_eq!(wrapped.canonical(), plain);
        assert!(wrapped.refers_to(&plain));

        let legacy = PeerId::new("/ipfs/QmPeer");
        assert_eq!(legacy.canonical(), plain);

        // Other addresses are left alone
        let other = PeerId::new("/ip4/10.0.0.1/tcp/4001");
        assert_eq!(other.canonical(), other);
    }

    #[test]
    fn test_refers_to_does_not_match_prefixes() {
        assert!(!PeerId::new("P10").refers_to(&PeerId::new("P1")));
    }

    #[test]
    fn test_merge_is_commutative_and_idempotent() {
        let a = PeerRecord::with_addresses("P1", vec![addr("/ip4/10.0.0.1/tcp/4001")]);
        let b = PeerRecord::with_addresses(
            "P1",
            vec![addr("/ip4/10.0.0.2/tcp/4001"), addr("/ip4/10.0.0.1/tcp/4001")],
        );

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);

        let mut twice = ab.clone();
        assert_eq!(twice.merge(&b), 0);
        assert_eq!(twice, ab);
        assert_eq!(twice.addresses.len(), 2);
    }

    #[test]
    fn test_record_serializes_addresses_as_strings() {
        let record = PeerRecord::with_addresses("P1", vec![addr("/ip4/10.0.0.1/tcp/4001")]);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "P1");
        assert_eq!(json["addresses"][0], "/ip4/10.0.0.1/tcp/4001");
    }
}
