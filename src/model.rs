//! Core data model: objects, segments, pieces, retention.
//!
//! Mirrors the teacher's `model.rs` (`Node`/`Edge`/`NodeId`) in spirit —
//! plain, serializable structs with small typed wrappers around raw ids —
//! but describes the object/segment domain from spec §3 instead of a graph.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque tenant identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(pub Uuid);

/// Bucket name within a project. Buckets are not modeled beyond their name;
/// bucket-level configuration (placement, versioning policy) is an input to
/// operations, not state owned by the metabase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketName(pub String);

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An object key, modeled as raw bytes rather than `String` since S3-style
/// keys are not required to be valid UTF-8 and the listing engine's
/// lexicographic ordering is defined over bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey(pub Bytes);

impl ObjectKey {
    /// Borrows the key as raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lossy UTF-8 view, for logging and tests.
    pub fn display(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self {
        ObjectKey(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for ObjectKey {
    fn from(s: String) -> Self {
        ObjectKey(Bytes::from(s.into_bytes()))
    }
}

/// Stable identity of a (project, bucket, key) location, independent of
/// version. Used pervasively by precommit and the listing cursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    /// Owning project.
    pub project_id: ProjectId,
    /// Bucket name.
    pub bucket_name: BucketName,
    /// Object key within the bucket.
    pub object_key: ObjectKey,
}

/// Object version number. Versions are strictly increasing per location;
/// `0` is never a real version (used as the sentinel "no prior version" in
/// [`crate::precommit::PrecommitConstraintResult::highest_version`]).
pub type Version = i64;

/// Sentinel requested-version value meaning "assign me the next version",
/// used by `BeginObjectNextVersion`.
pub const NEXT_VERSION: Version = 0;

/// Stream identifier: the physical identity of an object's data, stable
/// across metadata-only updates to the same version. Opaque 128 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub Uuid);

impl StreamId {
    /// Generates a fresh random stream id.
    pub fn new_random() -> Self {
        StreamId(Uuid::new_v4())
    }
}

/// Storage node identifier referenced by a [`Piece`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

/// Object lifecycle status (spec §3, "Object statuses").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectStatus {
    /// Created by a begin-* operation, not yet committed.
    Pending,
    /// Committed, no other version may exist unversioned at this key.
    CommittedUnversioned,
    /// Committed as one of potentially several versions at this key.
    CommittedVersioned,
    /// Tombstone hiding unversioned history at this key.
    DeleteMarkerUnversioned,
    /// Tombstone hiding versioned history at this key.
    DeleteMarkerVersioned,
}

impl ObjectStatus {
    /// True for either of the two committed statuses.
    pub fn is_committed(self) -> bool {
        matches!(
            self,
            ObjectStatus::CommittedUnversioned | ObjectStatus::CommittedVersioned
        )
    }

    /// True for either delete-marker status.
    pub fn is_delete_marker(self) -> bool {
        matches!(
            self,
            ObjectStatus::DeleteMarkerUnversioned | ObjectStatus::DeleteMarkerVersioned
        )
    }

    /// True if this status participates in the unversioned slot (at most one
    /// such row may exist per location; spec §3 invariants).
    pub fn is_unversioned(self) -> bool {
        matches!(
            self,
            ObjectStatus::CommittedUnversioned | ObjectStatus::DeleteMarkerUnversioned
        )
    }
}

/// Retention mode. `None` and `Governance`/`Compliance` with a `retain_until`
/// are modeled as a sum type at the domain layer even though the schema
/// flattens them into `retention_mode` + `retain_until` columns (spec §9
/// design notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionMode {
    /// No retention configured.
    None,
    /// Deletable by users with the bypass-governance permission.
    Governance,
    /// Not deletable by anyone until `retain_until` passes.
    Compliance,
}

/// Retention configuration: mode plus the timestamp it holds until. Legal
/// hold is tracked separately ([`Object::legal_hold`]) since it is an
/// open-ended flag independent of any timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    /// Retention mode.
    pub mode: RetentionMode,
    /// Timestamp the object is retained until. Always `None` when `mode` is
    /// `None`, always `Some` otherwise.
    pub retain_until: Option<DateTime<Utc>>,
}

impl Retention {
    /// The empty retention: no mode, no timestamp.
    pub fn none() -> Self {
        Retention {
            mode: RetentionMode::None,
            retain_until: None,
        }
    }

    /// True if this retention currently prevents deletion (mode is set and
    /// the timestamp has not yet passed relative to `now`).
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.mode {
            RetentionMode::None => false,
            RetentionMode::Governance | RetentionMode::Compliance => {
                self.retain_until.map(|t| t > now).unwrap_or(false)
            }
        }
    }

    /// True if this retention cannot be shortened or removed by an ordinary
    /// caller (compliance mode, still active).
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.mode, RetentionMode::Compliance) && self.is_active(now)
    }
}

/// Parameters describing how an object's contents were encrypted. `None` on
/// the `Object` means the pending row has not yet had encryption parameters
/// assigned (filled in at commit time per spec §4.4 step 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionParameters {
    /// Cipher suite identifier (opaque to the metabase).
    pub cipher_suite: u8,
    /// Block size used by the cipher suite, in bytes.
    pub block_size: i32,
}

/// Encrypted user metadata carried on an object: nonce, ciphertext,
/// encrypted content key, and encrypted ETag. All fields are opaque blobs
/// to the metabase; it never decrypts them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMetadata {
    /// Nonce used to encrypt `encrypted_metadata`.
    pub nonce: Option<Bytes>,
    /// Encrypted user metadata (arbitrary key/value pairs), ciphertext.
    pub encrypted_metadata: Option<Bytes>,
    /// The object's content encryption key, itself encrypted.
    pub encrypted_key: Option<Bytes>,
    /// Encrypted ETag of the assembled object.
    pub encrypted_etag: Option<Bytes>,
}

/// A fully-described object row (spec §3, "Object").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    /// (project, bucket, key).
    pub location: ObjectLocation,
    /// Monotonic version within `location`.
    pub version: Version,
    /// Physical stream identity.
    pub stream_id: StreamId,
    /// Lifecycle status.
    pub status: ObjectStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Expiration timestamp. Always `None` when retention is active or
    /// legal hold is set (spec §3 invariants).
    pub expires_at: Option<DateTime<Utc>>,
    /// Encryption parameters; `None` only while pending.
    pub encryption: Option<EncryptionParameters>,
    /// Encrypted user metadata.
    pub encrypted_metadata: EncryptedMetadata,
    /// Number of segments composing this object once committed.
    pub segment_count: i32,
    /// Sum of segment plain sizes.
    pub total_plain_size: i64,
    /// Sum of segment encrypted sizes.
    pub total_encrypted_size: i64,
    /// Common plain size of all but the last segment, or `-1` if variable.
    pub fixed_segment_size: i32,
    /// Deadline after which a still-pending object may be swept by zombie
    /// deletion. `Some` iff `status == Pending`.
    pub zombie_deletion_deadline: Option<DateTime<Utc>>,
    /// Retention configuration.
    pub retention: Retention,
    /// Legal hold flag, independent of `retention`.
    pub legal_hold: bool,
}

impl Object {
    /// True if this object is currently protected from deletion, either by
    /// an active retention or by legal hold.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.legal_hold || self.retention.is_active(now)
    }
}

/// Multipart (part, index) pair identifying a segment within a stream.
/// Encoded as a single 64-bit integer: high 32 bits are `part`, low 32 bits
/// are `index` (spec §6, "Encoded values").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    /// Multipart upload part number (0 for non-multipart objects).
    pub part: u32,
    /// Zero-based segment index within `part`.
    pub index: u32,
}

impl Position {
    /// Packs this position into the wire representation used as the
    /// `position` column value.
    pub fn encode(self) -> u64 {
        ((self.part as u64) << 32) | (self.index as u64)
    }

    /// Unpacks a position from its wire representation.
    pub fn decode(value: u64) -> Self {
        Position {
            part: (value >> 32) as u32,
            index: (value & 0xFFFF_FFFF) as u32,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.part, self.index)
    }
}

/// Erasure coding parameters for a remote segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyScheme {
    /// Erasure code algorithm identifier.
    pub algorithm: u8,
    /// Size in bytes of a single erasure share.
    pub share_size: i32,
    /// Minimum shares needed to reconstruct the segment.
    pub required_shares: i16,
    /// Shares needed before considering the segment fully repaired.
    pub repair_shares: i16,
    /// Shares uploaded at commit time under normal conditions.
    pub optimal_shares: i16,
    /// Maximum shares ever stored for this segment.
    pub total_shares: i16,
}

/// One erasure share stored on a single storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    /// Storage node holding this share.
    pub node_id: NodeId,
    /// Index of this share within the erasure code.
    pub piece_num: u16,
}

/// A [`Piece`] with its node-id replaced by a compact alias (see
/// [`crate::alias::AliasCache`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasPiece {
    /// Alias standing in for the storage node identifier.
    pub alias: u32,
    /// Index of this share within the erasure code.
    pub piece_num: u16,
}

/// Either a remote piece-set or inline bytes; never both meaningfully
/// populated (spec §3, "Segment"). Modeled as a sum type at the domain
/// layer (spec §9 design notes) even though the schema stores both a
/// nullable `pieces` column and a nullable `inline_data` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SegmentContents {
    /// Erasure-coded shares distributed across storage nodes.
    Remote {
        /// Root piece identifier shared by all shares of this segment.
        root_piece_id: Uuid,
        /// Alias-encoded piece-set, sorted by piece number.
        pieces: Vec<AliasPiece>,
    },
    /// Small segment stored directly in the row.
    Inline {
        /// Raw plaintext-ciphertext bytes.
        data: Bytes,
    },
}

impl SegmentContents {
    /// Number of pieces, for remote segments; always `0` for inline.
    pub fn piece_count(&self) -> usize {
        match self {
            SegmentContents::Remote { pieces, .. } => pieces.len(),
            SegmentContents::Inline { .. } => 0,
        }
    }

    /// True if this is the inline variant.
    pub fn is_inline(&self) -> bool {
        matches!(self, SegmentContents::Inline { .. })
    }
}

/// A contiguous erasure-coded (or inline) slice of a stream (spec §3,
/// "Segment").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Owning stream.
    pub stream_id: StreamId,
    /// (part, index) within the stream.
    pub position: Position,
    /// Expiration timestamp, inherited from the parent object at commit.
    pub expires_at: Option<DateTime<Utc>>,
    /// Per-segment content encryption key, itself encrypted.
    pub encrypted_key: Bytes,
    /// Nonce used for `encrypted_key`.
    pub encrypted_key_nonce: Bytes,
    /// Ciphertext size in bytes.
    pub encrypted_size: i32,
    /// Plaintext size in bytes.
    pub plain_size: i32,
    /// Byte offset of this segment within the assembled object's plaintext.
    pub plain_offset: i64,
    /// Encrypted ETag of this segment's plaintext.
    pub encrypted_etag: Option<Bytes>,
    /// Erasure coding parameters. Zeroed for inline segments.
    pub redundancy: RedundancyScheme,
    /// Either the piece-set or inline bytes.
    pub contents: SegmentContents,
    /// Optional placement constraint inherited from the bucket.
    pub placement: Option<i32>,
    /// Timestamp of the most recent successful repair, if any.
    pub repaired_at: Option<DateTime<Utc>>,
}

impl Segment {
    /// True if this segment stores its data inline rather than remotely.
    pub fn is_inline(&self) -> bool {
        self.contents.is_inline()
    }
}

/// Packs a retention mode and legal-hold flag into a single byte: mode in
/// the low bits, legal hold in the high bit (spec §6, "Encoded values").
pub fn pack_retention_mode(mode: RetentionMode, legal_hold: bool) -> u8 {
    let mode_bits: u8 = match mode {
        RetentionMode::None => 0,
        RetentionMode::Governance => 1,
        RetentionMode::Compliance => 2,
    };
    mode_bits | if legal_hold { 0x80 } else { 0 }
}

/// Inverse of [`pack_retention_mode`].
pub fn unpack_retention_mode(byte: u8) -> (RetentionMode, bool) {
    let legal_hold = byte & 0x80 != 0;
    let mode = match byte & 0x7F {
        0 => RetentionMode::None,
        1 => RetentionMode::Governance,
        _ => RetentionMode::Compliance,
    };
    (mode, legal_hold)
}

/// Encodes an alias piece-set as `(varint piece-number, 4-byte alias)` pairs
/// sorted by piece number (spec §6, "Encoded values").
pub fn encode_alias_pieces(pieces: &[AliasPiece]) -> Bytes {
    let mut sorted: Vec<&AliasPiece> = pieces.iter().collect();
    sorted.sort_by_key(|p| p.piece_num);

    let mut buf = Vec::with_capacity(pieces.len() * 6);
    for p in sorted {
        encode_varint(p.piece_num as u64, &mut buf);
        buf.extend_from_slice(&p.alias.to_be_bytes());
    }
    Bytes::from(buf)
}

/// Inverse of [`encode_alias_pieces`].
pub fn decode_alias_pieces(mut data: &[u8]) -> crate::error::Result<Vec<AliasPiece>> {
    let mut pieces = Vec::new();
    while !data.is_empty() {
        let (piece_num, rest) = decode_varint(data)?;
        if rest.len() < 4 {
            return Err(crate::error::MetabaseError::InvalidRequest(
                "truncated alias-piece alias".into(),
            ));
        }
        let alias = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        pieces.push(AliasPiece {
            alias,
            piece_num: piece_num as u16,
        });
        data = &rest[4..];
    }
    Ok(pieces)
}

fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

fn decode_varint(data: &[u8]) -> crate::error::Result<(u64, &[u8])> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, &data[i + 1..]));
        }
        shift += 7;
    }
    Err(crate::error::MetabaseError::InvalidRequest(
        "truncated varint in alias-piece set".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_round_trips() {
        let pos = Position {
            part: 3,
            index: 17,
        };
        assert_eq!(Position::decode(pos.encode()), pos);
    }

    #[test]
    fn retention_mode_round_trips() {
        let byte = pack_retention_mode(RetentionMode::Compliance, true);
        let (mode, legal_hold) = unpack_retention_mode(byte);
        assert_eq!(mode, RetentionMode::Compliance);
        assert!(legal_hold);
    }

    #[test]
    fn alias_pieces_round_trip_sorted() {
        let pieces = vec![
            AliasPiece {
                alias: 9,
                piece_num: 5,
            },
            AliasPiece {
                alias: 1,
                piece_num: 0,
            },
        ];
        let encoded = encode_alias_pieces(&pieces);
        let decoded = decode_alias_pieces(&encoded).unwrap();
        assert_eq!(decoded[0].piece_num, 0);
        assert_eq!(decoded[1].piece_num, 5);
    }

    #[test]
    fn retention_active_and_locked() {
        let now = Utc::now();
        let future = now + chrono::Duration::hours(1);
        let past = now - chrono::Duration::hours(1);

        let governance = Retention {
            mode: RetentionMode::Governance,
            retain_until: Some(future),
        };
        assert!(governance.is_active(now));
        assert!(!governance.is_locked(now));

        let compliance_expired = Retention {
            mode: RetentionMode::Compliance,
            retain_until: Some(past),
        };
        assert!(!compliance_expired.is_active(now));
        assert!(!compliance_expired.is_locked(now));

        let compliance_active = Retention {
            mode: RetentionMode::Compliance,
            retain_until: Some(future),
        };
        assert!(compliance_active.is_locked(now));
    }
}
