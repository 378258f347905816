//! On-disk layout of the bounce table.
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ HEADER (64 bytes, fixed)             │
//! │  magic: [u8; 8] = b"BNCWTCH\0"      │
//! │  version: u32                        │
//! │  flags: u32                          │
//! │  record_count: u64                   │
//! │  next_id: u64                        │
//! │  (padding to 64 bytes)               │
//! ├──────────────────────────────────────┤
//! │ RECORDS (variable)                   │
//! │  bincode-serialized Vec<BounceRecord>│
//! └──────────────────────────────────────┘
//! ```

/// Magic bytes identifying a bouncewatch store file.
pub const MAGIC: &[u8; 8] = b"BNCWTCH\0";

/// Current store format version.
pub const VERSION: u32 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 64;

/// Serializable store header.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoreHeader {
    /// Magic bytes (must equal [`MAGIC`]).
    pub magic: [u8; 8],
    /// Format version (must equal [`VERSION`]).
    pub version: u32,
    /// Reserved flags (currently unused).
    pub flags: u32,
    /// Number of records following the header.
    pub record_count: u64,
    /// Id handed to the next inserted record.
    pub next_id: u64,
}

impl StoreHeader {
    pub fn new(record_count: u64, next_id: u64) -> Self {
        Self {
            magic: *MAGIC,
            version: VERSION,
            flags: 0,
            record_count,
            next_id,
        }
    }

    /// Validate that the header is well-formed and matches the current format.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.magic != *MAGIC {
            return Err("Invalid magic bytes".into());
        }
        if self.version != VERSION {
            return Err(format!(
                "Incompatible version: expected {VERSION}, found {}",
                self.version
            ));
        }
        Ok(())
    }

    /// Header serialized and zero-padded to [`HEADER_SIZE`].
    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        let bytes = bincode::serialize(self)?;
        let mut padded = vec![0u8; HEADER_SIZE];
        let copy_len = bytes.len().min(HEADER_SIZE);
        padded[..copy_len].copy_from_slice(&bytes[..copy_len]);
        Ok(padded)
    }
}
