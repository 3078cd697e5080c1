// Big-endian UTF-16 text as stored in STFS headers, account records and GPDs

use byteorder::{BigEndian, ByteOrder};

/// Decode a fixed UTF-16BE field, stopping at the first NUL code unit
///
/// A trailing odd byte is ignored and invalid surrogates become U+FFFD.
pub fn utf16_be(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(BigEndian::read_u16)
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Decode a NUL-terminated UTF-16BE string starting at `start`
///
/// Returns the text and the offset just past the terminator (or the end of
/// `data` when no terminator is found).
pub fn utf16_be_terminated(data: &[u8], start: usize) -> (String, usize) {
    let mut units = Vec::new();
    let mut pos = start;
    while pos + 2 <= data.len() {
        let unit = BigEndian::read_u16(&data[pos..]);
        pos += 2;
        if unit == 0 {
            return (String::from_utf16_lossy(&units), pos);
        }
        units.push(unit);
    }
    (String::from_utf16_lossy(&units), data.len())
}

/// Decode a single-byte text field, stopping at the first NUL
pub fn ascii(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    bytes[..end].iter().map(|&b| b as char).collect()
}
