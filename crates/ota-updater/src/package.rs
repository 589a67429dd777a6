//! Update package writer.
//!
//! Produces stored (uncompressed) archives in the layout the streaming parser
//! accepts: the manifest first, then every entry in insertion order, followed
//! by a central directory and the end-of-central-directory record.

use serde_json::Value;

use crate::archive::{
    CENTRAL_DIRECTORY_SIGNATURE, END_OF_CENTRAL_DIRECTORY_SIGNATURE, FLAG_DATA_DESCRIPTOR,
    LOCAL_HEADER_SIGNATURE,
};
use crate::checksum::crc32;
use crate::manifest::MANIFEST_FILENAME;

/// Version needed to extract: 2.0.
const VERSION_NEEDED: u16 = 20;
/// 1980-01-01, the earliest DOS date.
const DOS_DATE: u16 = 0x0021;

/// Position of one entry inside a built package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryLayout {
    pub name: String,
    /// Offset of the local header
    pub header_offset: usize,
    /// Offset of the first body byte
    pub data_offset: usize,
    /// Body length
    pub len: usize,
}

/// A built package and where its entries landed.
#[derive(Debug, Clone)]
pub struct Package {
    pub bytes: Vec<u8>,
    pub entries: Vec<EntryLayout>,
}

impl Package {
    pub fn entry(&self, name: &str) -> Option<&EntryLayout> {
        self.entries.iter().find(|e| e.name == name)
    }
}

struct Entry {
    name: String,
    data: Vec<u8>,
}

/// Builder for stored update packages.
pub struct PackageBuilder {
    entries: Vec<Entry>,
    descriptors: bool,
    omit_crc: bool,
    extra: Vec<u8>,
}

impl PackageBuilder {
    /// Start a package whose first entry is `manifest`.
    pub fn new(manifest: Value) -> Self {
        let body = manifest.to_string().into_bytes();
        Self::raw().entry(MANIFEST_FILENAME, &body)
    }

    /// Start a package without a manifest.
    pub fn raw() -> Self {
        Self {
            entries: Vec::new(),
            descriptors: false,
            omit_crc: false,
            extra: Vec::new(),
        }
    }

    /// Append an entry.
    pub fn entry(mut self, name: &str, data: &[u8]) -> Self {
        self.entries.push(Entry {
            name: name.to_string(),
            data: data.to_vec(),
        });
        self
    }

    /// Move CRC and sizes into a data descriptor after each body, as
    /// streaming archivers do. The header CRC is written as zero.
    pub fn with_descriptors(mut self, enabled: bool) -> Self {
        self.descriptors = enabled;
        self
    }

    /// Write a zero CRC into every local header.
    pub fn without_crc(mut self) -> Self {
        self.omit_crc = true;
        self
    }

    /// Attach an extra field to every local header.
    pub fn with_extra_field(mut self, extra: &[u8]) -> Self {
        self.extra = extra.to_vec();
        self
    }

    pub fn build(&self) -> Vec<u8> {
        self.build_package().bytes
    }

    pub fn build_package(&self) -> Package {
        let flags = if self.descriptors { FLAG_DATA_DESCRIPTOR } else { 0 };
        let mut out = Vec::new();
        let mut layout = Vec::with_capacity(self.entries.len());
        let mut central = Vec::new();

        for entry in &self.entries {
            let crc = crc32(&entry.data);
            let header_crc = if self.descriptors || self.omit_crc { 0 } else { crc };
            let size = entry.data.len() as u32;
            let header_offset = out.len();

            put_u32(&mut out, LOCAL_HEADER_SIGNATURE);
            put_u16(&mut out, VERSION_NEEDED);
            put_u16(&mut out, flags);
            put_u16(&mut out, 0); // stored
            put_u16(&mut out, 0); // time
            put_u16(&mut out, DOS_DATE);
            put_u32(&mut out, header_crc);
            put_u32(&mut out, size);
            put_u32(&mut out, size);
            put_u16(&mut out, entry.name.len() as u16);
            put_u16(&mut out, self.extra.len() as u16);
            out.extend_from_slice(entry.name.as_bytes());
            out.extend_from_slice(&self.extra);

            let data_offset = out.len();
            out.extend_from_slice(&entry.data);
            if self.descriptors {
                put_u32(&mut out, crc);
                put_u32(&mut out, size);
                put_u32(&mut out, size);
            }

            put_u32(&mut central, CENTRAL_DIRECTORY_SIGNATURE);
            put_u16(&mut central, VERSION_NEEDED); // made by
            put_u16(&mut central, VERSION_NEEDED);
            put_u16(&mut central, flags);
            put_u16(&mut central, 0);
            put_u16(&mut central, 0);
            put_u16(&mut central, DOS_DATE);
            put_u32(&mut central, crc);
            put_u32(&mut central, size);
            put_u32(&mut central, size);
            put_u16(&mut central, entry.name.len() as u16);
            put_u16(&mut central, 0); // extra
            put_u16(&mut central, 0); // comment
            put_u16(&mut central, 0); // disk
            put_u16(&mut central, 0); // internal attributes
            put_u32(&mut central, 0); // external attributes
            put_u32(&mut central, header_offset as u32);
            central.extend_from_slice(entry.name.as_bytes());

            layout.push(EntryLayout {
                name: entry.name.clone(),
                header_offset,
                data_offset,
                len: entry.data.len(),
            });
        }

        let central_offset = out.len();
        out.extend_from_slice(&central);

        let count = self.entries.len() as u16;
        put_u32(&mut out, END_OF_CENTRAL_DIRECTORY_SIGNATURE);
        put_u16(&mut out, 0);
        put_u16(&mut out, 0);
        put_u16(&mut out, count);
        put_u16(&mut out, count);
        put_u32(&mut out, central.len() as u32);
        put_u32(&mut out, central_offset as u32);
        put_u16(&mut out, 0);

        Package {
            bytes: out,
            entries: layout,
        }
    }
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}
