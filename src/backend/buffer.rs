// GPU memory resources
//
// Owned buffer/image types whose memory is released on every exit path,
// plus the staging-upload queue. Uploads run on the transfer queue and are
// gated by a dedicated fence, distinct from the per-frame fences.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

use super::Device;

/// A buffer with its backing allocation. Memory is freed on drop.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    device: Arc<Device>,
}

impl GpuBuffer {
    pub fn new(
        device: Arc<Device>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        // Buffers touched by both the transfer and graphics queues need
        // CONCURRENT sharing when the families differ.
        let families = [
            device.queue_families.graphics,
            device.queue_families.transfer,
        ];
        let shared = device.queue_families.dedicated_transfer()
            && usage.contains(vk::BufferUsageFlags::TRANSFER_DST);

        let mut buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        if shared {
            buffer_info = buffer_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families);
        }

        let buffer = unsafe {
            device
                .device
                .create_buffer(&buffer_info, None)
                .context("Failed to create buffer")?
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
        let allocation = match device.allocate(name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e).context("Failed to allocate buffer memory");
            }
        };

        unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .context("Failed to bind buffer memory")?;
        }

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            size,
            device,
        })
    }

    /// Create a host-visible buffer pre-filled with `data`.
    pub fn host_visible_with_data<T: Copy>(
        device: Arc<Device>,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        let mut buffer = Self::new(device, name, size, usage, MemoryLocation::CpuToGpu)?;
        buffer.write(data)?;
        Ok(buffer)
    }

    /// Copy `data` into a mapped buffer. Only valid for host-visible memory.
    pub fn write<T: Copy>(&mut self, data: &[T]) -> Result<()> {
        let size = std::mem::size_of_val(data);
        anyhow::ensure!(size as vk::DeviceSize <= self.size, "write exceeds buffer size");

        let allocation = self
            .allocation
            .as_ref()
            .context("Buffer has no allocation")?;
        let ptr = allocation
            .mapped_ptr()
            .context("Buffer memory is not host-visible")?
            .as_ptr() as *mut T;

        unsafe { ptr.copy_from_nonoverlapping(data.as_ptr(), data.len()) };
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            self.device.free(allocation);
        }
    }
}

/// An image + view with its backing allocation. Memory is freed on drop.
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    allocation: Option<Allocation>,
    device: Arc<Device>,
}

impl GpuImage {
    /// Create a device-local 2D attachment image (color or depth target).
    pub fn attachment(
        device: Arc<Device>,
        name: &str,
        extent: vk::Extent2D,
        format: vk::Format,
        samples: vk::SampleCountFlags,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe {
            device
                .device
                .create_image(&image_info, None)
                .with_context(|| format!("Failed to create image {:?}", name))?
        };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = match device.allocate(name, requirements, MemoryLocation::GpuOnly, false)
        {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e).context("Failed to allocate image memory");
            }
        };

        unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .context("Failed to bind image memory")?;
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = match unsafe { device.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                device.free(allocation);
                return Err(e).context("Failed to create image view");
            }
        };

        Ok(Self {
            image,
            view,
            allocation: Some(allocation),
            device,
        })
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            self.device.free(allocation);
        }
    }
}

/// A staging buffer whose transfer is in flight, gated by its own fence.
struct PendingUpload {
    fence: vk::Fence,
    cmd: vk::CommandBuffer,
    staging: GpuBuffer,
}

/// One-shot staging uploads to device-local memory.
///
/// `upload` enqueues a copy on the transfer queue and records the staging
/// buffer as pending. `collect` is a non-blocking per-frame sweep that frees
/// staging memory once the upload fence has signaled; the render thread only
/// blocks in `flush`, when a resource must be ready before first use.
pub struct Uploader {
    pool: vk::CommandPool,
    pending: Mutex<Vec<PendingUpload>>,
    device: Arc<Device>,
}

impl Uploader {
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_families.transfer)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = unsafe {
            device
                .device
                .create_command_pool(&pool_info, None)
                .context("Failed to create transfer command pool")?
        };

        Ok(Self {
            pool,
            pending: Mutex::new(Vec::new()),
            device,
        })
    }

    /// Upload `data` into a new device-local buffer via a staging copy.
    pub fn upload<T: Copy>(
        &self,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<GpuBuffer> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;

        let staging = GpuBuffer::host_visible_with_data(
            self.device.clone(),
            "staging",
            vk::BufferUsageFlags::TRANSFER_SRC,
            data,
        )?;

        let dst = GpuBuffer::new(
            self.device.clone(),
            name,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;

        let device = &self.device.device;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { device.allocate_command_buffers(&alloc_info)? }[0];

        let fence_info = vk::FenceCreateInfo::builder();
        let fence = unsafe { device.create_fence(&fence_info, None)? };

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };

        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cmd, &begin_info)?;
            device.cmd_copy_buffer(cmd, staging.buffer, dst.buffer, &[region]);
            device.end_command_buffer(cmd)?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            device.queue_submit(self.device.transfer_queue, &[submit_info.build()], fence)?;
        }

        self.pending
            .lock()
            .push(PendingUpload { fence, cmd, staging });

        log::debug!("Enqueued upload {:?} ({} bytes)", name, size);
        Ok(dst)
    }

    /// Free staging resources for uploads whose fence has signaled.
    /// Non-blocking; called once per frame from the render thread.
    pub fn collect(&self) {
        let mut pending = self.pending.lock();
        let mut i = 0;
        while i < pending.len() {
            let signaled = unsafe {
                self.device
                    .device
                    .get_fence_status(pending[i].fence)
                    .unwrap_or(false)
            };
            if signaled {
                let done = pending.swap_remove(i);
                self.release(done);
            } else {
                i += 1;
            }
        }
    }

    /// Block until every pending upload has completed, then free its staging
    /// resources. Used before first use of uploaded data and at shutdown.
    pub fn flush(&self) -> Result<()> {
        let drained: Vec<PendingUpload> = std::mem::take(&mut *self.pending.lock());
        if drained.is_empty() {
            return Ok(());
        }

        let fences: Vec<vk::Fence> = drained.iter().map(|p| p.fence).collect();
        unsafe {
            self.device
                .device
                .wait_for_fences(&fences, true, u64::MAX)
                .context("Upload fence wait failed")?;
        }

        for done in drained {
            self.release(done);
        }
        Ok(())
    }

    fn release(&self, done: PendingUpload) {
        unsafe {
            self.device.device.destroy_fence(done.fence, None);
            self.device
                .device
                .free_command_buffers(self.pool, &[done.cmd]);
        }
        // done.staging dropped here, freeing the staging memory
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Upload flush on shutdown failed: {}", e);
        }
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}
