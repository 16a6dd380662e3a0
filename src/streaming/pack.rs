/// Resource Packs
///
/// A pack is one file: a little-endian u64 header length, the bincode
/// encoded `ResourceDescriptor`, then the streamable page bytes. Opening a
/// pack maps the file and serves page reads straight from the mapping.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{StreamingError, StreamingResult};
use crate::streaming::{MmapSource, Resource, ResourceDescriptor};

const HEADER_LENGTH_BYTES: usize = std::mem::size_of::<u64>();

fn pack_error(reason: impl Into<String>) -> StreamingError {
    StreamingError::Pack { reason: reason.into() }
}

/// Write a descriptor and its streamable bytes to `path`
pub fn write_pack(path: impl AsRef<Path>, descriptor: &ResourceDescriptor, streamable: &[u8]) -> StreamingResult<()> {
    let path = path.as_ref();
    let header = bincode::serialize(descriptor)?;

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&(header.len() as u64).to_le_bytes())?;
    writer.write_all(&header)?;
    writer.write_all(streamable)?;
    writer.flush()?;

    log::info!(
        "[ResourcePack] Wrote '{}' to {} ({} header bytes, {} page bytes)",
        descriptor.name,
        path.display(),
        header.len(),
        streamable.len()
    );
    Ok(())
}

/// Map a pack and return an unregistered resource backed by it
pub fn open_pack(path: impl AsRef<Path>) -> StreamingResult<Resource> {
    let path = path.as_ref();
    let file = File::open(path)?;
    // SAFETY: the mapping is read-only; packs must not be truncated while mapped
    let mmap = Arc::new(unsafe { Mmap::map(&file)? });

    let length_bytes: [u8; HEADER_LENGTH_BYTES] = mmap
        .get(..HEADER_LENGTH_BYTES)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| pack_error(format!("{} is too short to be a pack", path.display())))?;
    let header_len = usize::try_from(u64::from_le_bytes(length_bytes))
        .map_err(|_| pack_error("header length does not fit in memory"))?;
    let header_end = HEADER_LENGTH_BYTES
        .checked_add(header_len)
        .filter(|&end| end <= mmap.len())
        .ok_or_else(|| pack_error(format!("header of {} bytes runs past the end of the file", header_len)))?;

    let descriptor: ResourceDescriptor = bincode::deserialize(&mmap[HEADER_LENGTH_BYTES..header_end])?;
    let source = MmapSource::from_region(mmap.clone(), header_end, mmap.len() - header_end)?;

    log::debug!(
        "[ResourcePack] Opened '{}' from {} ({} pages)",
        descriptor.name,
        path.display(),
        descriptor.page_streaming_states.len()
    );
    Ok(Resource::new(descriptor, Arc::new(source)))
}
