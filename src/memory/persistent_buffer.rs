/// Persistent Device Buffers
///
/// Named buffers that live for the lifetime of the streaming manager, plus
/// the command stream used to record writes and resizes during a cycle.
/// Commands are replayed in submission order, so a write recorded before a
/// resize is preserved by it.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::memory::{out_of_bounds_error, MemoryResult};

/// Persistent buffers owned by the streaming manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PersistentBuffer {
    /// Streaming slots followed by root slots
    PageData,
    /// Hierarchy nodes of every registered resource
    Hierarchy,
}

impl PersistentBuffer {
    pub fn label(&self) -> &'static str {
        match self {
            PersistentBuffer::PageData => "streaming.page_data",
            PersistentBuffer::Hierarchy => "streaming.hierarchy",
        }
    }
}

/// A single recorded device operation
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    Resize { buffer: PersistentBuffer, size: u64 },
    Write { buffer: PersistentBuffer, offset: u64, data: Vec<u8> },
}

/// Ordered list of device operations recorded during a cycle
#[derive(Debug, Default)]
pub struct CommandStream {
    commands: Vec<DeviceCommand>,
    bytes_written: u64,
}

impl CommandStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resize(&mut self, buffer: PersistentBuffer, size: u64) {
        self.commands.push(DeviceCommand::Resize { buffer, size });
    }

    pub fn write(&mut self, buffer: PersistentBuffer, offset: u64, data: &[u8]) {
        self.bytes_written += data.len() as u64;
        self.commands.push(DeviceCommand::Write {
            buffer,
            offset,
            data: data.to_vec(),
        });
    }

    /// Record a little-endian u32 patch
    pub fn write_u32(&mut self, buffer: PersistentBuffer, offset: u64, value: u32) {
        self.write(buffer, offset, &value.to_le_bytes());
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn commands(&self) -> &[DeviceCommand] {
        &self.commands
    }

    /// Hand the recorded commands off, leaving the stream empty
    pub fn take(&mut self) -> CommandStream {
        std::mem::take(self)
    }

    pub fn into_commands(self) -> Vec<DeviceCommand> {
        self.commands
    }
}

/// Device-side storage for the persistent buffers
pub trait DeviceMemory: Send {
    /// Current size of a buffer in bytes
    fn buffer_size(&self, buffer: PersistentBuffer) -> u64;

    /// Resize a buffer, preserving the common prefix of its contents
    fn resize(&mut self, buffer: PersistentBuffer, size: u64) -> MemoryResult<()>;

    /// Write bytes at a fixed offset
    fn write(&mut self, buffer: PersistentBuffer, offset: u64, data: &[u8]) -> MemoryResult<()>;

    /// Replay a recorded stream in order
    fn submit(&mut self, stream: CommandStream) -> MemoryResult<()> {
        for command in stream.into_commands() {
            match command {
                DeviceCommand::Resize { buffer, size } => self.resize(buffer, size)?,
                DeviceCommand::Write { buffer, offset, data } => self.write(buffer, offset, &data)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct HostBuffers {
    page_data: Vec<u8>,
    hierarchy: Vec<u8>,
}

impl HostBuffers {
    fn get(&self, buffer: PersistentBuffer) -> &Vec<u8> {
        match buffer {
            PersistentBuffer::PageData => &self.page_data,
            PersistentBuffer::Hierarchy => &self.hierarchy,
        }
    }

    fn get_mut(&mut self, buffer: PersistentBuffer) -> &mut Vec<u8> {
        match buffer {
            PersistentBuffer::PageData => &mut self.page_data,
            PersistentBuffer::Hierarchy => &mut self.hierarchy,
        }
    }
}

/// Device memory kept in host vectors, for headless use and tests.
/// Clones share the same storage, so a caller can keep one to inspect
/// contents after handing the other to the manager.
#[derive(Debug, Clone, Default)]
pub struct HostMemory {
    buffers: Arc<RwLock<HostBuffers>>,
}

impl HostMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy out a byte range, `None` if it lies outside the buffer
    pub fn read(&self, buffer: PersistentBuffer, offset: u64, len: usize) -> Option<Vec<u8>> {
        let buffers = self.buffers.read();
        let bytes = buffers.get(buffer);
        let start = usize::try_from(offset).ok()?;
        bytes.get(start..start.checked_add(len)?).map(|slice| slice.to_vec())
    }

    pub fn read_u32(&self, buffer: PersistentBuffer, offset: u64) -> Option<u32> {
        let bytes = self.read(buffer, offset, 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl DeviceMemory for HostMemory {
    fn buffer_size(&self, buffer: PersistentBuffer) -> u64 {
        self.buffers.read().get(buffer).len() as u64
    }

    fn resize(&mut self, buffer: PersistentBuffer, size: u64) -> MemoryResult<()> {
        let size = usize::try_from(size).map_err(|e| crate::memory::device_error(buffer, e))?;
        self.buffers.write().get_mut(buffer).resize(size, 0);
        Ok(())
    }

    fn write(&mut self, buffer: PersistentBuffer, offset: u64, data: &[u8]) -> MemoryResult<()> {
        let mut buffers = self.buffers.write();
        let bytes = buffers.get_mut(buffer);
        let size = bytes.len() as u64;
        if offset + data.len() as u64 > size {
            return Err(out_of_bounds_error(buffer, offset, data.len(), size));
        }
        let start = offset as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_before_resize_is_preserved() {
        let mut memory = HostMemory::new();
        let view = memory.clone();

        let mut stream = CommandStream::new();
        stream.resize(PersistentBuffer::PageData, 16);
        stream.write(PersistentBuffer::PageData, 4, &[1, 2, 3, 4]);
        stream.resize(PersistentBuffer::PageData, 64);
        stream.write_u32(PersistentBuffer::PageData, 60, 0xDEAD_BEEF);
        assert_eq!(stream.len(), 4);
        assert_eq!(stream.bytes_written(), 8);

        memory.submit(stream).expect("Failed to submit stream");

        assert_eq!(view.buffer_size(PersistentBuffer::PageData), 64);
        assert_eq!(view.read(PersistentBuffer::PageData, 4, 4), Some(vec![1, 2, 3, 4]));
        assert_eq!(view.read_u32(PersistentBuffer::PageData, 60), Some(0xDEAD_BEEF));
    }

    #[test]
    fn test_out_of_bounds_write_fails() {
        let mut memory = HostMemory::new();
        memory.resize(PersistentBuffer::Hierarchy, 8).expect("resize");
        let result = memory.write(PersistentBuffer::Hierarchy, 6, &[0; 4]);
        assert!(result.is_err());
        assert_eq!(memory.read(PersistentBuffer::Hierarchy, 6, 4), None);
    }

    #[test]
    fn test_take_leaves_stream_empty() {
        let mut stream = CommandStream::new();
        stream.resize(PersistentBuffer::Hierarchy, 32);
        let taken = stream.take();
        assert!(stream.is_empty());
        assert_eq!(taken.commands().len(), 1);
    }
}
