use crate::parse::{Result, SarcError};
use tracing::{debug, trace};

/// A compressed wrapper that archives may be stored in.
pub trait Decompressor {
    /// Returns true if `data` starts with this wrapper's magic.
    fn is_wrapped(&self, data: &[u8]) -> bool;

    /// Returns the first four bytes of the decompressed stream if they can be read
    /// directly from the compressed data.
    fn payload_magic<'d>(&self, data: &'d [u8]) -> Option<&'d [u8]>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// The Yaz0 LZ compression format.
///
/// Header: `Yaz0` magic, big endian u32 decompressed size, 8 reserved bytes. The stream that
/// follows is made of groups: one code byte whose bits (MSB first) select either a literal
/// byte or a back reference for each of the next eight chunks.
#[derive(Debug, Default, Copy, Clone)]
pub struct Yaz0;

const YAZ0_HEADER_SIZE: usize = 0x10;

fn truncated() -> SarcError {
    SarcError::Decompression("unexpected end of Yaz0 stream".to_owned())
}

impl Decompressor for Yaz0 {
    fn is_wrapped(&self, data: &[u8]) -> bool {
        data.starts_with(b"Yaz0")
    }

    fn payload_magic<'d>(&self, data: &'d [u8]) -> Option<&'d [u8]> {
        // The first group's code byte is at 0x10. An archive starts with four literals.
        data.get(0x11..0x15)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if !self.is_wrapped(data) || data.len() < YAZ0_HEADER_SIZE {
            return Err(SarcError::Decompression("missing Yaz0 header".to_owned()));
        }
        let size = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        // The declared size is untrusted, so it only bounds the initial allocation.
        let mut out: Vec<u8> = Vec::with_capacity(size.min(data.len().saturating_mul(8)));
        let mut src = data[YAZ0_HEADER_SIZE..].iter().copied();

        'groups: while out.len() < size {
            let code = src.next().ok_or_else(truncated)?;
            for bit in (0..8).rev() {
                if out.len() >= size {
                    break 'groups;
                }
                if code & (1 << bit) != 0 {
                    out.push(src.next().ok_or_else(truncated)?);
                    continue;
                }
                let b1 = src.next().ok_or_else(truncated)?;
                let b2 = src.next().ok_or_else(truncated)?;
                let distance = (((b1 & 0xF) as usize) << 8 | b2 as usize) + 1;
                let count = match b1 >> 4 {
                    0 => src.next().ok_or_else(truncated)? as usize + 0x12,
                    n => n as usize + 2,
                };
                if distance > out.len() {
                    return Err(SarcError::Decompression(format!(
                        "back reference {} bytes before start of output",
                        distance - out.len()
                    )));
                }
                trace!("Yaz0 copy: {} bytes from distance {}", count, distance);
                let start = out.len() - distance;
                // The source range may overlap the bytes being written.
                for i in 0..count.min(size - out.len()) {
                    let b = out[start + i];
                    out.push(b);
                }
            }
        }

        debug!("Yaz0: {} bytes -> {} bytes", data.len(), out.len());
        Ok(out)
    }
}
