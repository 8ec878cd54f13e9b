use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};
use num_traits::ToPrimitive;

use super::XDREndian;

/// Every XDR item occupies a multiple of four bytes.
pub const ALIGNMENT: usize = 4;

const ZERO_PADDING: [u8; ALIGNMENT] = [0; ALIGNMENT];

fn padding_len(src_len: usize) -> usize {
    (ALIGNMENT - (src_len % ALIGNMENT)) % ALIGNMENT
}

/// Consumes the padding that follows `src_len` bytes of opaque data.
/// Residual bytes must be zero (RFC 4506 section 3).
pub fn read_padding(src_len: usize, src: &mut impl Read) -> std::io::Result<()> {
    let pad_len = padding_len(src_len);
    if pad_len == 0 {
        return Ok(());
    }
    let mut padding = ZERO_PADDING;
    src.read_exact(&mut padding[..pad_len])?;
    if padding != ZERO_PADDING {
        return Err(invalid_data("Non-zero XDR padding"));
    }
    Ok(())
}

pub fn write_padding(src_len: usize, dest: &mut impl Write) -> std::io::Result<()> {
    dest.write_all(&ZERO_PADDING[..padding_len(src_len)])
}

pub fn invalid_data(m: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, m)
}

/// Writes the `u32` length prefix of variable-length data.
pub fn write_len(len: usize, dest: &mut impl Write) -> std::io::Result<()> {
    let len = len.to_u32().ok_or_else(|| invalid_data("cannot cast `usize` to `u32`"))?;
    dest.write_u32::<XDREndian>(len)
}

/// Reads the `u32` length prefix of variable-length data.
pub fn read_len(src: &mut impl Read) -> std::io::Result<usize> {
    let len = src.read_u32::<XDREndian>()?;
    len.to_usize().ok_or_else(|| invalid_data("cannot cast `u32` to `usize`"))
}
