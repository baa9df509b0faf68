//! Download and transfer-data state for the UDS 0x34/0x36/0x37 sequence.
//!
//! A TCP session owns at most one [`DownloadContext`] at a time. The
//! context tracks the byte budget announced by RequestDownload and the
//! block sequence counter chain, including the 0xFF -> 0x00 wrap and
//! idempotent retransmission of the most recently accepted block.

use std::fmt;
use std::sync::{Arc, Mutex};

/// What to do when RequestTransferExit arrives with bytes still missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferExitPolicy {
    /// Reject the exit until the announced size has been transferred.
    Strict,
    /// Accept the exit regardless of remaining bytes.
    #[default]
    Lenient,
}

/// Destination for transferred firmware data.
pub trait TransferSink: Send {
    fn write(&mut self, data: &[u8]);
}

/// In-memory sink. The shared handle lets the owner read back what was
/// received after the transfer finished.
#[derive(Clone, Default)]
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.data)
    }
}

impl TransferSink for MemorySink {
    fn write(&mut self, data: &[u8]) {
        self.data.lock().expect("sink poisoned").extend_from_slice(data);
    }
}

/// Builds the sink for an accepted download, given the requested memory
/// address and size.
pub type SinkFactory = Arc<dyn Fn(u64, u64) -> Box<dyn TransferSink> + Send + Sync>;

/// Decoded RequestDownload parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadRequest {
    pub data_format: u8,
    pub address: u64,
    pub size: u64,
}

/// Why a RequestDownload payload failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadRequestError {
    /// Fewer bytes than the format identifiers announce.
    Truncated,
    /// Address or size field length outside 1..=8 bytes.
    BadFieldLength { address_len: u8, size_len: u8 },
}

/// Decode the payload following the 0x34 service byte:
/// dataFormatIdentifier, addressAndLengthFormatIdentifier, then the
/// address and size in the byte counts the AALFI nibbles announce
/// (low nibble address, high nibble size).
pub fn parse_download_request(data: &[u8]) -> Result<DownloadRequest, DownloadRequestError> {
    if data.len() < 2 {
        return Err(DownloadRequestError::Truncated);
    }
    let data_format = data[0];
    let address_len = data[1] & 0x0F;
    let size_len = data[1] >> 4;
    if address_len == 0 || address_len > 8 || size_len == 0 || size_len > 8 {
        return Err(DownloadRequestError::BadFieldLength { address_len, size_len });
    }
    let total = 2 + address_len as usize + size_len as usize;
    if data.len() < total {
        return Err(DownloadRequestError::Truncated);
    }
    let address = be_uint(&data[2..2 + address_len as usize]);
    let size = be_uint(&data[2 + address_len as usize..total]);
    Ok(DownloadRequest {
        data_format,
        address,
        size,
    })
}

fn be_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Verdict for one TransferData block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// New block in sequence; data was written to the sink.
    Accepted,
    /// Counter equals the last accepted block: a retransmission. Positive
    /// response, no state change.
    Retransmitted,
    /// Counter is neither the expected next value nor the previous one.
    WrongCounter { expected: u8 },
}

/// State of the active download on a TCP session.
pub struct DownloadContext {
    pub address: u64,
    pub total_size: u64,
    pub remaining: u64,
    last_counter: u8,
    blocks_received: u64,
    sink: Box<dyn TransferSink>,
}

impl fmt::Debug for DownloadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadContext")
            .field("address", &self.address)
            .field("total_size", &self.total_size)
            .field("remaining", &self.remaining)
            .field("last_counter", &self.last_counter)
            .field("blocks_received", &self.blocks_received)
            .finish_non_exhaustive()
    }
}

impl DownloadContext {
    pub fn new(request: DownloadRequest, sink: Box<dyn TransferSink>) -> Self {
        DownloadContext {
            address: request.address,
            total_size: request.size,
            remaining: request.size,
            last_counter: 0x00,
            blocks_received: 0,
            sink,
        }
    }

    /// The counter the next new block must carry. Starts at 0x01 and
    /// wraps 0xFF -> 0x00.
    pub fn expected_counter(&self) -> u8 {
        self.last_counter.wrapping_add(1)
    }

    /// Apply one TransferData block to the download.
    pub fn submit_block(&mut self, counter: u8, data: &[u8]) -> BlockOutcome {
        if self.blocks_received > 0 && counter == self.last_counter {
            return BlockOutcome::Retransmitted;
        }
        let expected = self.expected_counter();
        if counter != expected {
            return BlockOutcome::WrongCounter { expected };
        }
        self.sink.write(data);
        self.remaining = self.remaining.saturating_sub(data.len() as u64);
        self.last_counter = counter;
        self.blocks_received += 1;
        BlockOutcome::Accepted
    }
}
