//! Stored-archive record parsing.
//!
//! Update packages are ZIP containers whose entries are all "stored"
//! (uncompressed). Only local file headers are parsed; the central directory
//! is recognised by its signature and treated as the end of the archive.
//!
//! ```text
//! local file header                          size  offset
//!   signature (0x04034b50)                     4      0
//!   version needed to extract                  2      4
//!   general purpose bit flag                   2      6
//!   compression method                         2      8
//!   last mod file time                         2     10
//!   last mod file date                         2     12
//!   crc-32                                     4     14
//!   compressed size                            4     18
//!   uncompressed size                          4     22
//!   file name length                           2     26
//!   extra field length                         2     28
//!   file name                                  v     30
//!   extra field                                v
//! ```

use tracing::debug;

use crate::error::UpdateError;
use crate::input::InputView;

/// Local file header signature.
pub const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
/// Central directory file header signature.
pub const CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0201_4b50;
/// End of central directory record signature.
pub const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;
/// Fixed part of a local file header.
pub const LOCAL_HEADER_LEN: usize = 30;
/// Data descriptor without the optional signature: crc, compressed, uncompressed.
pub const DATA_DESCRIPTOR_LEN: usize = 12;
/// Capacity of the entry name buffer, terminator included.
pub const ENTRY_NAME_CAPACITY: usize = 50;
/// General purpose flag bit 3: sizes and CRC follow the data.
pub const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;

const FLAGS_OFFSET: usize = 6;
const METHOD_OFFSET: usize = 8;
const CRC32_OFFSET: usize = 14;
const COMPRESSED_SIZE_OFFSET: usize = 18;
const UNCOMPRESSED_SIZE_OFFSET: usize = 22;
const NAME_LEN_OFFSET: usize = 26;
const EXTRA_LEN_OFFSET: usize = 28;

/// Metadata of one archive entry, taken from its local header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHeader {
    /// Entry name with any directory prefix removed
    pub name: String,
    /// Declared body size
    pub size: u32,
    /// Declared CRC-32 (zero when unknown at write time)
    pub crc32: u32,
    /// General purpose flags
    pub flags: u16,
    /// Bytes occupied by header, name and extra field
    pub header_len: usize,
}

impl LocalHeader {
    /// Whether a data descriptor follows the entry body.
    pub fn has_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }
}

/// Parse the local header at the start of `data`.
///
/// Returns `Ok(None)` when more bytes are needed.
pub fn parse_local_header(data: &[u8]) -> Result<Option<LocalHeader>, UpdateError> {
    if data.len() < LOCAL_HEADER_LEN {
        debug!("Zip header is incomplete ({} bytes)", data.len());
        return Ok(None);
    }

    if field_u32(data, 0)? != LOCAL_HEADER_SIGNATURE {
        return Err(UpdateError::InvalidHeader);
    }

    let name_len = field_u16(data, NAME_LEN_OFFSET)? as usize;
    let extra_len = field_u16(data, EXTRA_LEN_OFFSET)? as usize;
    debug!("Filename len = {name_len} bytes, extras len = {extra_len} bytes");

    let header_len = LOCAL_HEADER_LEN + name_len + extra_len;
    if data.len() < header_len {
        return Ok(None);
    }

    let method = field_u16(data, METHOD_OFFSET)?;
    if method != 0 {
        return Err(UpdateError::UnsupportedCompression { method });
    }

    let raw_name = &data[LOCAL_HEADER_LEN..LOCAL_HEADER_LEN + name_len];
    let name = std::str::from_utf8(strip_directories(raw_name))
        .map_err(|_| UpdateError::InvalidHeader)?;
    if name.len() >= ENTRY_NAME_CAPACITY {
        return Err(UpdateError::NameTooLong { len: name.len() });
    }
    let name = name.to_string();
    debug!("File name to use: {name}");

    let compressed = field_u32(data, COMPRESSED_SIZE_OFFSET)?;
    let uncompressed = field_u32(data, UNCOMPRESSED_SIZE_OFFSET)?;
    if compressed != uncompressed {
        return Err(UpdateError::SizeMismatch {
            compressed,
            uncompressed,
        });
    }

    let flags = field_u16(data, FLAGS_OFFSET)?;
    let crc32 = field_u32(data, CRC32_OFFSET)?;
    debug!("File size: {compressed}, flags: 0x{flags:04x}, CRC32: 0x{crc32:08x}");

    Ok(Some(LocalHeader {
        name,
        size: compressed,
        crc32,
        flags,
        header_len,
    }))
}

/// Parse the next local header from the input and consume it on success.
///
/// Nothing is consumed when more bytes are needed or the header is invalid.
pub fn read_local_header(input: &mut InputView<'_>) -> Result<Option<LocalHeader>, UpdateError> {
    let header = parse_local_header(input.data())?;
    if let Some(header) = &header {
        input.consume(header.header_len);
    }
    Ok(header)
}

/// Whether `data` starts with the central directory signature.
///
/// `None` when fewer than four bytes are available.
pub fn is_central_directory(data: &[u8]) -> Option<bool> {
    read_u32(data, 0).map(|sig| sig == CENTRAL_DIRECTORY_SIGNATURE)
}

/// The part of an archive path after its last `/`.
fn strip_directories(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|&b| b == b'/') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}

/// Little-endian u16 at `offset`, if in bounds.
pub fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes(bytes.try_into().ok()?))
}

/// Little-endian u32 at `offset`, if in bounds.
pub fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn field_u16(data: &[u8], offset: usize) -> Result<u16, UpdateError> {
    read_u16(data, offset).ok_or(UpdateError::InvalidHeader)
}

fn field_u32(data: &[u8], offset: usize) -> Result<u32, UpdateError> {
    read_u32(data, offset).ok_or(UpdateError::InvalidHeader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputBuffer;

    fn header(name: &str, method: u16, flags: u16, crc: u32, size: u32, uncompressed: u32) -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(&LOCAL_HEADER_SIGNATURE.to_le_bytes());
        h.extend_from_slice(&10u16.to_le_bytes());
        h.extend_from_slice(&flags.to_le_bytes());
        h.extend_from_slice(&method.to_le_bytes());
        h.extend_from_slice(&0u16.to_le_bytes());
        h.extend_from_slice(&0u16.to_le_bytes());
        h.extend_from_slice(&crc.to_le_bytes());
        h.extend_from_slice(&size.to_le_bytes());
        h.extend_from_slice(&uncompressed.to_le_bytes());
        h.extend_from_slice(&(name.len() as u16).to_le_bytes());
        h.extend_from_slice(&3u16.to_le_bytes());
        h.extend_from_slice(name.as_bytes());
        h.extend_from_slice(b"xyz");
        h
    }

    #[test]
    fn test_parse_stored_header() {
        let data = header("fw.bin", 0, 0, 0xcafebabe, 1024, 1024);
        let parsed = parse_local_header(&data).unwrap().unwrap();
        assert_eq!(parsed.name, "fw.bin");
        assert_eq!(parsed.size, 1024);
        assert_eq!(parsed.crc32, 0xcafebabe);
        assert_eq!(parsed.header_len, LOCAL_HEADER_LEN + 6 + 3);
        assert!(!parsed.has_descriptor());
    }

    #[test]
    fn test_truncated_header_needs_more_and_consumes_nothing() {
        let data = header("fw.bin", 0, 0, 0, 4, 4);
        let mut buffer = InputBuffer::new();
        let mut view = buffer.feed(&data[..10]);
        assert!(read_local_header(&mut view).unwrap().is_none());
        assert_eq!(view.len(), 10);
    }

    #[test]
    fn test_name_and_extra_not_yet_available() {
        let data = header("firmware.bin", 0, 0, 0, 4, 4);
        assert!(parse_local_header(&data[..LOCAL_HEADER_LEN + 2]).unwrap().is_none());
    }

    #[test]
    fn test_bad_signature() {
        let mut data = header("fw.bin", 0, 0, 0, 4, 4);
        data[0] = 0x51;
        assert!(matches!(
            parse_local_header(&data),
            Err(UpdateError::InvalidHeader)
        ));
    }

    #[test]
    fn test_compressed_entry_rejected() {
        let data = header("fw.bin", 8, 0, 0, 4, 10);
        assert!(matches!(
            parse_local_header(&data),
            Err(UpdateError::UnsupportedCompression { method: 8 })
        ));
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let data = header("fw.bin", 0, 0, 0, 4, 5);
        assert!(matches!(
            parse_local_header(&data),
            Err(UpdateError::SizeMismatch {
                compressed: 4,
                uncompressed: 5
            })
        ));
    }

    #[test]
    fn test_directories_are_stripped() {
        let data = header("a/b/c.bin", 0, 0, 0, 1, 1);
        let parsed = parse_local_header(&data).unwrap().unwrap();
        assert_eq!(parsed.name, "c.bin");
        assert_eq!(parsed.header_len, LOCAL_HEADER_LEN + 9 + 3);
    }

    #[test]
    fn test_name_capacity() {
        let ok = "n".repeat(ENTRY_NAME_CAPACITY - 1);
        assert!(parse_local_header(&header(&ok, 0, 0, 0, 1, 1)).is_ok());

        let too_long = "n".repeat(ENTRY_NAME_CAPACITY);
        assert!(matches!(
            parse_local_header(&header(&too_long, 0, 0, 0, 1, 1)),
            Err(UpdateError::NameTooLong { len }) if len == ENTRY_NAME_CAPACITY
        ));

        // Only the stripped name counts against the capacity.
        let nested = format!("{}/fw.bin", "d".repeat(80));
        assert!(parse_local_header(&header(&nested, 0, 0, 0, 1, 1)).is_ok());
    }

    #[test]
    fn test_non_utf8_name_rejected() {
        let name = "n".repeat(ENTRY_NAME_CAPACITY - 1);
        let mut data = header(&name, 0, 0, 0, 1, 1);
        for b in &mut data[LOCAL_HEADER_LEN..LOCAL_HEADER_LEN + name.len()] {
            *b = 0xff;
        }
        assert!(matches!(
            parse_local_header(&data),
            Err(UpdateError::InvalidHeader)
        ));
    }

    #[test]
    fn test_descriptor_flag() {
        let data = header("fs.bin", 0, FLAG_DATA_DESCRIPTOR, 0, 2, 2);
        let parsed = parse_local_header(&data).unwrap().unwrap();
        assert!(parsed.has_descriptor());
        assert_eq!(parsed.crc32, 0);
    }

    #[test]
    fn test_read_consumes_exact_header() {
        let mut data = header("fw.bin", 0, 0, 0, 2, 2);
        data.extend_from_slice(b"ZZ");
        let mut buffer = InputBuffer::new();
        let mut view = buffer.feed(&data);
        read_local_header(&mut view).unwrap().unwrap();
        assert_eq!(view.data(), b"ZZ");
    }

    #[test]
    fn test_central_directory_detection() {
        assert_eq!(is_central_directory(&[0x50, 0x4b]), None);
        assert_eq!(
            is_central_directory(&CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes()),
            Some(true)
        );
        assert_eq!(
            is_central_directory(&LOCAL_HEADER_SIGNATURE.to_le_bytes()),
            Some(false)
        );
    }

    #[test]
    fn test_field_reads_are_bounds_checked() {
        assert_eq!(read_u16(&[1], 0), None);
        assert_eq!(read_u32(&[1, 2, 3, 4], 1), None);
        assert_eq!(read_u32(&[1, 0, 0, 0], 0), Some(1));
        assert_eq!(read_u16(&[0, 0], usize::MAX), None);
    }
}
