//! Path layout and key encoding for the coordination-service tree.
//!
//! # Tree Layout (v1)
//!
//! All paths are relative to the client's namespace:
//!
//! - `/leader` — persistent; data is the leader's [`Address`] as JSON
//! - `/members/{addr}` — ephemeral per-member presence
//! - `/leadership` — leader-latch participation
//! - `/segments/segment-N` — persistent, one per segment
//! - `/segments/{seg}/{key}` — persistent; data is the partition's opaque
//!   properties
//! - `/segments/{seg}/{key}/$size` — persistent; data is the required
//!   replication count, 4 bytes big-endian
//! - `/segments/{seg}/{key}/{addr}` — ephemeral; presence means `addr` has
//!   accepted the partition
//!
//! Big-endian encoding for `$size` keeps the stored bytes readable in
//! coordination-service tooling and matches the rest of the tree's
//! conventions.
//!
//! # Segment Escaping
//!
//! Partition keys and member addresses are opaque byte strings embedded in
//! path segments. [`key_to_path`] percent-encodes every byte outside
//! `[A-Za-z0-9._:-]`, which is a total injection that can never produce `/`;
//! [`path_to_key`] is its inverse. The round-trip
//! `path_to_key(&key_to_path(b)) == b` holds for every byte string.
//!
//! # Segment Hash
//!
//! `segment_of` buckets keys with FNV-1a (64-bit). The segment of a key must
//! be identical on every process of the cluster, so the hash has to be
//! stable across builds and platforms; std's `DefaultHasher` carries no such
//! guarantee.
//!
//! [`Address`]: crate::cluster::Address

use bytes::Bytes;

use super::client::CoordinationError;

/// Persistent node whose data names the current leader.
pub const LEADER_PATH: &str = "/leader";

/// Parent of the per-member ephemeral presence nodes.
pub const MEMBERS_PATH: &str = "/members";

/// Leader-latch participation node.
pub const LEADERSHIP_PATH: &str = "/leadership";

/// Parent of the per-segment partition trees.
pub const SEGMENTS_PATH: &str = "/segments";

/// Sentinel child holding a partition's required replication count.
///
/// `$` is outside the escape-safe alphabet, so no encoded partition member
/// or address can ever collide with it.
pub const SIZE_CHILD: &str = "$size";

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn is_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'-')
}

/// Encode an opaque byte string as a single path segment.
///
/// Total injection: output never contains `/` and distinct inputs yield
/// distinct outputs.
pub fn key_to_path(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    for &b in raw {
        if is_safe(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&format!("{b:02X}"));
        }
    }
    out
}

/// Decode a path segment produced by [`key_to_path`].
pub fn path_to_key(segment: &str) -> Result<Bytes, CoordinationError> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).ok_or_else(|| {
                    CoordinationError::MalformedData {
                        path: segment.to_string(),
                        reason: "truncated escape sequence".to_string(),
                    }
                })?;
                let hex = std::str::from_utf8(hex).map_err(|_| {
                    CoordinationError::MalformedData {
                        path: segment.to_string(),
                        reason: "non-utf8 escape sequence".to_string(),
                    }
                })?;
                let value = u8::from_str_radix(hex, 16).map_err(|_| {
                    CoordinationError::MalformedData {
                        path: segment.to_string(),
                        reason: format!("invalid escape sequence %{hex}"),
                    }
                })?;
                out.push(value);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Ok(Bytes::from(out))
}

/// Segment name for a partition key: `"segment-" + (hash(key) mod segments)`.
pub fn segment_of(key: &[u8], segments: u32) -> String {
    format!("segment-{}", fnv1a(key) % u64::from(segments))
}

/// Path of a segment node.
pub fn segment_path(segment: &str) -> String {
    format!("{SEGMENTS_PATH}/{segment}")
}

/// Path of a partition node.
pub fn partition_path(key: &[u8], segments: u32) -> String {
    format!("{SEGMENTS_PATH}/{}/{}", segment_of(key, segments), key_to_path(key))
}

/// Path of a partition's required-size node.
pub fn size_path(key: &[u8], segments: u32) -> String {
    format!("{}/{SIZE_CHILD}", partition_path(key, segments))
}

/// Path of a member's presence node under `/members`.
pub fn member_path(addr: &str) -> String {
    format!("{MEMBERS_PATH}/{}", key_to_path(addr.as_bytes()))
}

/// Encode a required replication count.
pub fn encode_size(size: u32) -> Bytes {
    Bytes::copy_from_slice(&size.to_be_bytes())
}

/// Decode a required replication count. Returns `None` when the data is not
/// exactly 4 bytes.
pub fn decode_size(data: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = data.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trips_arbitrary_bytes() {
        let cases: &[&[u8]] = &[
            b"plain",
            b"host:1234",
            b"has/slash",
            b"per%cent",
            b"\x00\x01\xfe\xff",
            b"",
            "\u{00fc}nicode".as_bytes(),
        ];
        for raw in cases {
            let encoded = key_to_path(raw);
            assert!(!encoded.contains('/'), "escaped `{encoded}` contains a slash");
            assert_eq!(path_to_key(&encoded).unwrap().as_ref(), *raw);
        }
    }

    #[test]
    fn escape_is_injective_on_tricky_pairs() {
        // "%2F" as literal text vs an escaped '/' must stay distinct.
        assert_ne!(key_to_path(b"%2F"), key_to_path(b"/"));
    }

    #[test]
    fn decode_rejects_truncated_escape() {
        assert!(path_to_key("abc%2").is_err());
        assert!(path_to_key("abc%zz").is_err());
    }

    #[test]
    fn segment_is_stable_and_in_range() {
        for key in [&b"a"[..], b"some-longer-key", b"\xff\x00"] {
            let seg = segment_of(key, 128);
            assert_eq!(seg, segment_of(key, 128));
            let n: u64 = seg.strip_prefix("segment-").unwrap().parse().unwrap();
            assert!(n < 128);
        }
    }

    #[test]
    fn partition_path_shape() {
        let path = partition_path(b"a", 128);
        assert!(path.starts_with("/segments/segment-"));
        assert!(path.ends_with("/a"));
        assert_eq!(size_path(b"a", 128), format!("{path}/$size"));
    }

    #[test]
    fn size_round_trips_big_endian() {
        let encoded = encode_size(2);
        assert_eq!(encoded.as_ref(), &[0, 0, 0, 2]);
        assert_eq!(decode_size(&encoded), Some(2));
        assert_eq!(decode_size(b"xx"), None);
    }
}
