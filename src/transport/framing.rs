use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;
use crate::message::{Envelope, ENVELOPE_SIZE};
use crate::status::IpcError;

/// Reassembles envelopes from a byte stream. Since every envelope has the same size, the only
///  state is how much of the current one was received so far.
///
/// The accumulator lives outside of [read_envelope] so that a cancelled read (e.g. in a
///  `select!`) does not lose a partially received envelope.
pub struct FrameAccumulator {
    buf: Box<[u8; ENVELOPE_SIZE]>,
    offset: usize,
}

impl FrameAccumulator {
    pub fn new() -> FrameAccumulator {
        FrameAccumulator {
            buf: Box::new([0u8; ENVELOPE_SIZE]),
            offset: 0,
        }
    }

    /// number of bytes of an incomplete envelope
    pub fn pending(&self) -> usize {
        self.offset
    }

    pub fn unfilled(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..]
    }

    /// Mark `n` bytes of [FrameAccumulator::unfilled] as received, returning the envelope
    ///  if it is now complete
    pub fn advance(&mut self, n: usize) -> Option<Envelope> {
        assert!(self.offset + n <= ENVELOPE_SIZE);
        self.offset += n;
        if self.offset < ENVELOPE_SIZE {
            return None;
        }
        self.offset = 0;
        Some(Envelope::from_bytes(&self.buf))
    }

    pub fn push(&mut self, mut bytes: &[u8]) -> Vec<Envelope> {
        let mut result = Vec::new();
        while !bytes.is_empty() {
            let unfilled = self.unfilled();
            let n = unfilled.len().min(bytes.len());
            unfilled[..n].copy_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            if let Some(envelope) = self.advance(n) {
                result.push(envelope);
            }
        }
        result
    }
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        FrameAccumulator::new()
    }
}

fn is_retryable(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::Interrupted | ErrorKind::WouldBlock)
}

/// Read until the next envelope is complete. Returns `None` if the peer closed the connection
///  cleanly between envelopes; a close in the middle of an envelope is a transport error.
pub async fn read_envelope<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, acc: &mut FrameAccumulator) -> anyhow::Result<Option<Envelope>> {
    loop {
        match reader.read(acc.unfilled()).await {
            Ok(0) => {
                if acc.pending() == 0 {
                    return Ok(None);
                }
                return Err(IpcError::TransportDown(format!("peer closed the connection {} bytes into an envelope", acc.pending())).into());
            }
            Ok(n) => {
                if let Some(envelope) = acc.advance(n) {
                    trace!("received {:?}", envelope.code);
                    return Ok(Some(envelope));
                }
            }
            Err(e) if is_retryable(e.kind()) => {}
            Err(e) => return Err(IpcError::TransportDown(e.to_string()).into()),
        }
    }
}

/// Write the complete envelope, looping over partial writes. A zero-byte write means the peer
///  is gone.
pub async fn write_envelope<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, envelope: &Envelope) -> anyhow::Result<()> {
    let bytes = envelope.to_bytes();
    let mut offset = 0;
    while offset < ENVELOPE_SIZE {
        match writer.write(&bytes[offset..]).await {
            Ok(0) => return Err(IpcError::TransportDown(format!("zero-byte write after {} bytes", offset)).into()),
            Ok(n) => offset += n,
            Err(e) if is_retryable(e.kind()) => {}
            Err(e) => return Err(IpcError::TransportDown(e.to_string()).into()),
        }
    }

    loop {
        match writer.flush().await {
            Ok(()) => break,
            Err(e) if is_retryable(e.kind()) => {}
            Err(e) => return Err(IpcError::TransportDown(e.to_string()).into()),
        }
    }
    trace!("sent {:?}", envelope.code);
    Ok(())
}
