//! Binary format definitions for mapkv containers
//!
//! A container file is a 64-byte header followed by self-describing records:
//! RecordHeader (20 bytes) + key_bytes + value_bytes

use crate::error::{KvError, KvResult};

/// Magic bytes identifying a mapkv container
pub const MAGIC_ARRAY: [u8; 4] = *b"MPKV";

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Container header size in bytes; records start right after it
pub const HEADER_SIZE: usize = 64;

/// Fixed prefix of every record
pub const RECORD_HEADER_SIZE: usize = 20;

/// Maximum key size in bytes (key length is stored as u16)
pub const MAX_KEY_SIZE: usize = u16::MAX as usize;

/// Maximum value size in bytes (256MB)
pub const MAX_VALUE_SIZE: usize = 256 * 1024 * 1024;

const FLAG_TOMBSTONE: u8 = 0x01;
const FLAG_EXPIRES: u8 = 0x02;
const KNOWN_FLAGS: u8 = FLAG_TOMBSTONE | FLAG_EXPIRES;

/// Bytes of the header covered by the header checksum
const HEADER_CHECKED: usize = 40;

/// Container header.
///
/// Layout:
///   [0..4]   magic:      [u8;4] - "MPKV"
///   [4..8]   version:    u32 LE
///   [8..16]  allocated:  u64 LE - file size in bytes
///   [16..24] logical:    u64 LE - end of the last committed record
///   [24..32] sequence:   u64 LE - bumped on every committed mutation
///   [32..40] generation: u64 LE - bumped when records move (compaction, clear)
///   [40..44] checksum:   u32 LE - CRC32C of bytes 0..40
///   [44..64] reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u32,
    pub allocated: u64,
    pub logical_len: u64,
    pub sequence: u64,
    pub generation: u64,
}

/// Outcome of parsing the header bytes at the start of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderCheck {
    Valid(FileHeader),
    /// All zero: the file was extended but never initialised
    Blank,
    BadMagic([u8; 4]),
    ChecksumMismatch { expected: u32, actual: u32 },
    Unsupported(u32),
}

impl FileHeader {
    /// Header of a container with no records.
    pub fn empty(allocated: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            allocated,
            logical_len: HEADER_SIZE as u64,
            sequence: 0,
            generation: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC_ARRAY);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.allocated.to_le_bytes());
        buf[16..24].copy_from_slice(&self.logical_len.to_le_bytes());
        buf[24..32].copy_from_slice(&self.sequence.to_le_bytes());
        buf[32..40].copy_from_slice(&self.generation.to_le_bytes());
        let checksum = crc32c::crc32c(&buf[..HEADER_CHECKED]);
        buf[40..44].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn parse(bytes: &[u8]) -> HeaderCheck {
        if bytes.len() < HEADER_SIZE || bytes[..HEADER_SIZE].iter().all(|&b| b == 0) {
            return HeaderCheck::Blank;
        }

        let magic = read_array::<4>(bytes, 0);
        if magic != MAGIC_ARRAY {
            return HeaderCheck::BadMagic(magic);
        }

        let expected = u32::from_le_bytes(read_array(bytes, 40));
        let actual = crc32c::crc32c(&bytes[..HEADER_CHECKED]);
        if expected != actual {
            return HeaderCheck::ChecksumMismatch { expected, actual };
        }

        let version = u32::from_le_bytes(read_array(bytes, 4));
        if version == 0 || version > FORMAT_VERSION {
            return HeaderCheck::Unsupported(version);
        }

        HeaderCheck::Valid(Self {
            version,
            allocated: u64::from_le_bytes(read_array(bytes, 8)),
            logical_len: u64::from_le_bytes(read_array(bytes, 16)),
            sequence: u64::from_le_bytes(read_array(bytes, 24)),
            generation: u64::from_le_bytes(read_array(bytes, 32)),
        })
    }
}

fn read_array<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}

/// A record decoded in place from container bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub key: &'a str,
    pub value: &'a [u8],
    pub tombstone: bool,
    /// Unix seconds after which the record is treated as absent
    pub expire_at: Option<u64>,
    /// Absolute offset of the value bytes within the decoded buffer
    pub value_offset: usize,
}

/// Total encoded size of a record.
pub fn encoded_len(key_len: usize, value_len: usize) -> usize {
    RECORD_HEADER_SIZE + key_len + value_len
}

/// Serialize a live key-value record.
///
/// Layout:
///   [0..4]   checksum:  u32 LE - CRC32C of bytes 4..end
///   [4..6]   key_len:   u16 LE (non-zero)
///   [6]      flags:     u8     - bit 0 tombstone, bit 1 has expiration
///   [7]      reserved
///   [8..12]  value_len: u32 LE
///   [12..20] expire_at: u64 LE - unix seconds, 0 when absent
///   [20..]   key bytes, value bytes
pub fn encode(key: &str, value: &[u8], expire_at: Option<u64>) -> KvResult<Vec<u8>> {
    let flags = if expire_at.is_some() { FLAG_EXPIRES } else { 0 };
    encode_raw(key, value, flags, expire_at.unwrap_or(0))
}

/// Serialize a tombstone marking `key` as removed.
pub fn encode_tombstone(key: &str) -> KvResult<Vec<u8>> {
    encode_raw(key, &[], FLAG_TOMBSTONE, 0)
}

fn encode_raw(key: &str, value: &[u8], flags: u8, expire_at: u64) -> KvResult<Vec<u8>> {
    // Validate sizes before allocation
    if key.is_empty() {
        return Err(KvError::invalid("key", "key must not be empty"));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(KvError::OversizedEntry {
            entry_size: key.len() as u64,
            max_size: MAX_KEY_SIZE as u64,
            component: "key",
        });
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::OversizedEntry {
            entry_size: value.len() as u64,
            max_size: MAX_VALUE_SIZE as u64,
            component: "value",
        });
    }

    let mut buf = Vec::with_capacity(encoded_len(key.len(), value.len()));
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buf.push(flags);
    buf.push(0);
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(&expire_at.to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(value);

    let checksum = crc32c::crc32c(&buf[4..]);
    buf[0..4].copy_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}

/// Decode the record starting at `offset` in `bytes`.
///
/// Returns the record and the number of bytes it occupies. `bytes` must end
/// at the container's logical length so that a torn trailing record is
/// reported as truncated.
pub fn decode(bytes: &[u8], offset: usize) -> KvResult<(Record<'_>, usize)> {
    let corrupt = |reason: String| KvError::CorruptRecord { offset: offset as u64, reason };

    let available = bytes.len().saturating_sub(offset);
    if available < RECORD_HEADER_SIZE {
        return Err(corrupt(format!(
            "Truncated record header: {} bytes, need {}", available, RECORD_HEADER_SIZE
        )));
    }

    let head = &bytes[offset..offset + RECORD_HEADER_SIZE];
    let expected = u32::from_le_bytes(read_array(head, 0));
    let key_len = u16::from_le_bytes(read_array(head, 4)) as usize;
    let flags = head[6];
    let value_len = u32::from_le_bytes(read_array(head, 8)) as usize;
    let expire_raw = u64::from_le_bytes(read_array(head, 12));

    if key_len == 0 {
        return Err(corrupt("Zero key length".to_string()));
    }
    if flags & !KNOWN_FLAGS != 0 {
        return Err(corrupt(format!("Unknown flags 0x{:02x}", flags)));
    }
    if value_len > MAX_VALUE_SIZE {
        return Err(corrupt(format!("value_len {} exceeds MAX_VALUE_SIZE {}", value_len, MAX_VALUE_SIZE)));
    }

    let total = encoded_len(key_len, value_len);
    if available < total {
        return Err(corrupt(format!("Torn record: need {} bytes, only {} available", total, available)));
    }

    let actual = crc32c::crc32c(&bytes[offset + 4..offset + total]);
    if actual != expected {
        return Err(corrupt(format!(
            "Checksum mismatch: expected 0x{:08x}, got 0x{:08x}", expected, actual
        )));
    }

    let key_start = offset + RECORD_HEADER_SIZE;
    let value_offset = key_start + key_len;
    let key = std::str::from_utf8(&bytes[key_start..value_offset])
        .map_err(|_| corrupt("Key is not valid UTF-8".to_string()))?;

    let tombstone = flags & FLAG_TOMBSTONE != 0;
    let expire_at = if flags & FLAG_EXPIRES != 0 { Some(expire_raw) } else { None };

    Ok((
        Record {
            key,
            value: &bytes[value_offset..value_offset + value_len],
            tombstone,
            expire_at,
            value_offset,
        },
        total,
    ))
}

/// Offset just past the last valid record, walking from `start`.
pub fn valid_prefix_end(bytes: &[u8], start: usize) -> usize {
    let mut offset = start;
    while offset < bytes.len() {
        match decode(bytes, offset) {
            Ok((_, consumed)) => offset += consumed,
            Err(_) => break,
        }
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let encoded = encode("theme", b"dark", None).unwrap();
        assert_eq!(encoded.len(), encoded_len(5, 4));

        let (record, consumed) = decode(&encoded, 0).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(record.key, "theme");
        assert_eq!(record.value, b"dark");
        assert!(!record.tombstone);
        assert_eq!(record.expire_at, None);
        assert_eq!(&encoded[record.value_offset..], b"dark");
    }

    #[test]
    fn test_expiration_and_tombstone_flags() {
        let encoded = encode("session", b"token", Some(1_700_000_000)).unwrap();
        let (record, _) = decode(&encoded, 0).unwrap();
        assert_eq!(record.expire_at, Some(1_700_000_000));

        let tomb = encode_tombstone("session").unwrap();
        let (record, consumed) = decode(&tomb, 0).unwrap();
        assert!(record.tombstone);
        assert!(record.value.is_empty());
        assert_eq!(consumed, RECORD_HEADER_SIZE + 7);
    }

    #[test]
    fn test_decode_at_offset() {
        let mut buf = encode("a", b"1", None).unwrap();
        let second_at = buf.len();
        buf.extend_from_slice(&encode("b", b"22", None).unwrap());

        let (record, consumed) = decode(&buf, second_at).unwrap();
        assert_eq!(record.key, "b");
        assert_eq!(record.value, b"22");
        assert_eq!(second_at + consumed, buf.len());
        assert_eq!(record.value_offset, second_at + RECORD_HEADER_SIZE + 1);
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut data = encode("key", b"value", None).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        match decode(&data, 0) {
            Err(KvError::CorruptRecord { reason, .. }) => assert!(reason.contains("Checksum")),
            other => panic!("expected checksum failure, got {:?}", other),
        }
    }

    #[test]
    fn test_flipped_flags_detected() {
        let mut data = encode("key", b"value", None).unwrap();
        data[6] = FLAG_TOMBSTONE;
        assert!(matches!(decode(&data, 0), Err(KvError::CorruptRecord { .. })));
    }

    #[test]
    fn test_torn_record_detected() {
        let data = encode("key", b"a longer value", None).unwrap();
        let torn = &data[..data.len() - 3];
        assert!(matches!(decode(torn, 0), Err(KvError::CorruptRecord { offset: 0, .. })));
        assert!(matches!(decode(&data[..10], 0), Err(KvError::CorruptRecord { .. })));
    }

    #[test]
    fn test_zeroed_region_is_not_a_record() {
        let zeros = [0u8; 64];
        assert!(decode(&zeros, 0).is_err());
        assert_eq!(valid_prefix_end(&zeros, 0), 0);
    }

    #[test]
    fn test_valid_prefix_stops_at_corruption() {
        let mut buf = encode("a", b"1", None).unwrap();
        let good_end = buf.len();
        let mut bad = encode("b", b"2", None).unwrap();
        bad[0] ^= 0x01;
        buf.extend_from_slice(&bad);
        buf.extend_from_slice(&encode("c", b"3", None).unwrap());

        assert_eq!(valid_prefix_end(&buf, 0), good_end);
    }

    #[test]
    fn test_empty_and_oversized_keys_rejected() {
        assert!(matches!(encode("", b"v", None), Err(KvError::InvalidArgument { .. })));

        let key = "k".repeat(MAX_KEY_SIZE + 1);
        let result = encode(&key, b"v", None);
        assert!(matches!(result, Err(KvError::OversizedEntry { component: "key", .. })));

        let key = "k".repeat(MAX_KEY_SIZE);
        assert!(encode(&key, b"v", None).is_ok());
    }

    #[test]
    fn test_header_roundtrip() {
        let header = FileHeader {
            version: FORMAT_VERSION,
            allocated: 8192,
            logical_len: 300,
            sequence: 17,
            generation: 2,
        };
        let bytes = header.to_bytes();
        assert_eq!(FileHeader::parse(&bytes), HeaderCheck::Valid(header));
    }

    #[test]
    fn test_header_checks() {
        assert_eq!(FileHeader::parse(&[0u8; HEADER_SIZE]), HeaderCheck::Blank);

        let mut bytes = FileHeader::empty(4096).to_bytes();
        bytes[20] ^= 0xFF;
        assert!(matches!(FileHeader::parse(&bytes), HeaderCheck::ChecksumMismatch { .. }));

        let mut bytes = FileHeader::empty(4096).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(FileHeader::parse(&bytes), HeaderCheck::BadMagic(_)));

        let mut future = FileHeader::empty(4096);
        future.version = FORMAT_VERSION + 1;
        assert_eq!(FileHeader::parse(&future.to_bytes()), HeaderCheck::Unsupported(FORMAT_VERSION + 1));
    }
}
