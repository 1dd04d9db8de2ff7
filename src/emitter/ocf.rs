//! OCF ZIP writing shared by the emitter and the device transforms.
//!
//! The first entry is always `mimetype`, stored uncompressed; everything else
//! is deflated. Every entry carries the same fixed timestamp so equal inputs
//! produce equal archives.

use memmap2::MmapOptions;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::Result;

pub const MIMETYPE_ENTRY: &str = "mimetype";
pub const EPUB_MIMETYPE: &str = "application/epub+zip";
pub const CONTAINER_ENTRY: &str = "META-INF/container.xml";

fn entry_options(method: CompressionMethod) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(method)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644)
}

/// Streaming writer for one OCF container.
pub struct OcfWriter {
    zip: ZipWriter<File>,
    deflated: SimpleFileOptions,
}

impl OcfWriter {
    /// Creates `path` and writes the stored `mimetype` entry.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let mut zip = ZipWriter::new(file);
        zip.start_file(MIMETYPE_ENTRY, entry_options(CompressionMethod::Stored))?;
        zip.write_all(EPUB_MIMETYPE.as_bytes())?;
        Ok(Self {
            zip,
            deflated: entry_options(CompressionMethod::Deflated),
        })
    }

    pub fn add_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        self.zip.start_file(name, self.deflated)?;
        self.zip.write_all(bytes)?;
        Ok(())
    }

    /// Copies a file from disk into the container through a read-only map.
    pub fn add_file(&mut self, name: &str, source: &Path) -> Result<()> {
        let file = File::open(source)?;
        self.zip.start_file(name, self.deflated)?;
        if file.metadata()?.len() == 0 {
            return Ok(());
        }
        // The source is only read while the map is alive.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        self.zip.write_all(&mmap[..])?;
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        let mut file = self.zip.finish()?;
        file.flush()?;
        Ok(())
    }
}
