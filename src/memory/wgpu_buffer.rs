/// GPU-backed persistent buffers
///
/// Implements `DeviceMemory` with wgpu storage buffers. Growing a buffer
/// allocates a replacement and copies the preserved prefix on the queue, so
/// earlier writes stay visible after the resize.

use std::sync::Arc;

use wgpu::{Buffer, BufferUsages, Device, Queue};

use crate::memory::{device_error, out_of_bounds_error, DeviceMemory, MemoryResult, PersistentBuffer};

/// wgpu implementation of the persistent buffers
pub struct WgpuMemory {
    device: Arc<Device>,
    queue: Arc<Queue>,
    page_data: Option<Buffer>,
    hierarchy: Option<Buffer>,
}

impl WgpuMemory {
    pub fn new(device: Arc<Device>, queue: Arc<Queue>) -> Self {
        Self {
            device,
            queue,
            page_data: None,
            hierarchy: None,
        }
    }

    /// Buffer bound by consumers, `None` until the first resize
    pub fn buffer(&self, buffer: PersistentBuffer) -> Option<&Buffer> {
        match buffer {
            PersistentBuffer::PageData => self.page_data.as_ref(),
            PersistentBuffer::Hierarchy => self.hierarchy.as_ref(),
        }
    }

    fn slot_mut(&mut self, buffer: PersistentBuffer) -> &mut Option<Buffer> {
        match buffer {
            PersistentBuffer::PageData => &mut self.page_data,
            PersistentBuffer::Hierarchy => &mut self.hierarchy,
        }
    }
}

impl DeviceMemory for WgpuMemory {
    fn buffer_size(&self, buffer: PersistentBuffer) -> u64 {
        self.buffer(buffer).map(|b| b.size()).unwrap_or(0)
    }

    fn resize(&mut self, buffer: PersistentBuffer, size: u64) -> MemoryResult<()> {
        if size % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(device_error(buffer, format!("size {} is not 4-byte aligned", size)));
        }
        if size == self.buffer_size(buffer) {
            return Ok(());
        }

        let old = self.slot_mut(buffer).take();
        if size == 0 {
            return Ok(());
        }

        let new_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(buffer.label()),
            size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        if let Some(old) = old {
            let preserved = old.size().min(size);
            if preserved > 0 {
                let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Streaming Buffer Resize"),
                });
                encoder.copy_buffer_to_buffer(&old, 0, &new_buffer, 0, preserved);
                self.queue.submit(std::iter::once(encoder.finish()));
            }
            log::debug!(
                "[WgpuMemory] Resized {} from {} to {} bytes",
                buffer.label(),
                old.size(),
                size
            );
        }

        *self.slot_mut(buffer) = Some(new_buffer);
        Ok(())
    }

    fn write(&mut self, buffer: PersistentBuffer, offset: u64, data: &[u8]) -> MemoryResult<()> {
        let size = self.buffer_size(buffer);
        if offset + data.len() as u64 > size {
            return Err(out_of_bounds_error(buffer, offset, data.len(), size));
        }
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(device_error(
                buffer,
                format!("unaligned write of {} bytes at {}", data.len(), offset),
            ));
        }

        let target = self
            .buffer(buffer)
            .ok_or_else(|| device_error(buffer, "buffer has not been allocated"))?;
        self.queue.write_buffer(target, offset, data);
        Ok(())
    }
}
