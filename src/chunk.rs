//! Caller-supplied scatter/gather buffers for data transfers.

/// One (offset, length) slot in a scatter/gather transfer.
///
/// The buffer is owned here so the handler can fill it incrementally while
/// frames arrive; it travels back to the caller inside the typed response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// File offset the chunk covers.
    pub offset: u64,
    /// Requested length in bytes.
    pub length: u32,
    /// Destination (reads) or source (writes) bytes.
    pub data: Vec<u8>,
}

impl Chunk {
    /// A read chunk with a zeroed destination buffer of `length` bytes.
    #[must_use]
    pub fn for_read(offset: u64, length: u32) -> Self {
        Self {
            offset,
            length,
            data: vec![0; length as usize],
        }
    }

    /// A write chunk sourcing `data` at `offset`.
    #[must_use]
    pub fn for_write(offset: u64, data: Vec<u8>) -> Self {
        let length = u32::try_from(data.len()).unwrap_or(u32::MAX);
        Self { offset, length, data }
    }
}

/// Ordered list of chunks, as supplied by the caller.
pub type ChunkList = Vec<Chunk>;

/// Per-chunk progress markers for partially honoured transfers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkStatus {
    /// The chunk was fully delivered.
    pub done: bool,
    /// The server answered with a length that does not fit the slot, or a
    /// header that matches no slot; the payload was discarded.
    pub size_error: bool,
}
