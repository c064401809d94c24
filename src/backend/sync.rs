// Frame synchronization
//
// F frame slots (two semaphores + fence + per-slot uniform storage each) and
// the round-robin cursor. A secondary per-image owner table guards swapchain
// image reuse across slots, so F may be smaller than the image count.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::pipeline::Descriptors;
use super::Device;
use gpu_allocator::MemoryLocation;

/// Upper bound on frames in flight regardless of swapchain depth.
pub const MAX_FRAME_LAG: usize = 3;

/// F = min(desired, swapchain image count, MAX_FRAME_LAG), at least 1.
pub fn resolve_frames_in_flight(desired: usize, image_count: usize) -> usize {
    desired.min(image_count).min(MAX_FRAME_LAG).max(1)
}

/// Round-robin slot cursor: visits 0..count-1 and wraps.
#[derive(Debug)]
pub struct FrameCursor {
    current: usize,
    count: usize,
}

impl FrameCursor {
    pub fn new(count: usize) -> Self {
        debug_assert!(count >= 1);
        Self { current: 0, count }
    }

    pub fn index(&self) -> usize {
        self.current
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.count;
    }

    pub fn reset(&mut self) {
        self.current = 0;
    }
}

/// Which frame slot last submitted GPU work against each swapchain image.
///
/// A slot's own fence only covers that slot's previous submission; before
/// rendering into image I again we must also wait for whatever *other* slot
/// last targeted I. Claiming returns that slot index when a wait is due.
#[derive(Debug)]
pub struct ImageOwners {
    owners: Vec<Option<usize>>,
}

impl ImageOwners {
    pub fn new(image_count: usize) -> Self {
        Self {
            owners: vec![None; image_count],
        }
    }

    /// Record `slot` as the new owner of `image`. Returns the previous owner
    /// if it was a different slot whose work may still be outstanding.
    pub fn claim(&mut self, image: usize, slot: usize) -> Option<usize> {
        let previous = self.owners[image].replace(slot);
        previous.filter(|&p| p != slot)
    }

    /// Forget all ownership. Called on rebuild: the images are new.
    pub fn clear(&mut self, image_count: usize) {
        self.owners.clear();
        self.owners.resize(image_count, None);
    }
}

/// One frame slot: acquire/render semaphores, in-flight fence and the slot's
/// uniform storage with its descriptor set.
pub struct FrameSlot {
    pub acquire_complete: vk::Semaphore,
    pub render_complete: vk::Semaphore,
    pub in_flight: vk::Fence,
    pub uniforms: GpuBuffer,
    pub descriptor_set: vk::DescriptorSet,
}

impl FrameSlot {
    fn new(
        device: &Arc<Device>,
        descriptors: &Descriptors,
        uniform_size: vk::DeviceSize,
    ) -> Result<Self> {
        let uniforms = GpuBuffer::new(
            device.clone(),
            "frame uniforms",
            uniform_size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )?;
        let descriptor_set = descriptors.allocate(device, uniforms.buffer, uniform_size)?;

        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Signaled so the first wait on this slot does not block
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            Ok(Self {
                acquire_complete: device.device.create_semaphore(&semaphore_info, None)?,
                render_complete: device.device.create_semaphore(&semaphore_info, None)?,
                in_flight: device.device.create_fence(&fence_info, None)?,
                uniforms,
                descriptor_set,
            })
        }
    }

    fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.acquire_complete, None);
            device.destroy_semaphore(self.render_complete, None);
            device.destroy_fence(self.in_flight, None);
        }
        // uniforms buffer freed on drop; the descriptor set goes with the pool
    }
}

/// Owns the frame slots, the cursor and the image-owner table.
pub struct FrameSynchronizer {
    slots: Vec<FrameSlot>,
    cursor: FrameCursor,
    owners: ImageOwners,
    uniform_size: vk::DeviceSize,
    device: Arc<Device>,
}

impl FrameSynchronizer {
    pub fn new(
        device: Arc<Device>,
        desired_frames: usize,
        image_count: usize,
        descriptors: &Descriptors,
        uniform_size: vk::DeviceSize,
    ) -> Result<Self> {
        let frames = resolve_frames_in_flight(desired_frames, image_count);
        log::info!(
            "Frames in flight: {} (requested {}, {} swapchain images)",
            frames,
            desired_frames,
            image_count
        );

        let slots = (0..frames)
            .map(|_| FrameSlot::new(&device, descriptors, uniform_size))
            .collect::<Result<Vec<_>>>()
            .context("Failed to create frame slots")?;

        Ok(Self {
            slots,
            cursor: FrameCursor::new(frames),
            owners: ImageOwners::new(image_count),
            uniform_size,
            device,
        })
    }

    pub fn frames(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_index(&self) -> usize {
        self.cursor.index()
    }

    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.cursor.index()]
    }

    pub fn current_mut(&mut self) -> &mut FrameSlot {
        let index = self.cursor.index();
        &mut self.slots[index]
    }

    /// Block until the GPU finished the previous submission from this slot.
    pub fn wait_current(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.current().in_flight], true, u64::MAX)
                .context("Frame fence wait failed")
        }
    }

    /// Reset the slot's fence. Done once per frame, after the wait and after
    /// acquire succeeded, immediately before resubmission.
    pub fn reset_current(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .reset_fences(&[self.current().in_flight])
                .context("Frame fence reset failed")
        }
    }

    /// Claim `image_index` for the current slot. If a different slot still
    /// has work outstanding against that image, wait for its fence first
    /// (without resetting it; that slot resets its own fence when reused).
    pub fn claim_image(&mut self, image_index: u32) -> Result<()> {
        let slot = self.cursor.index();
        if let Some(previous) = self.owners.claim(image_index as usize, slot) {
            unsafe {
                self.device
                    .device
                    .wait_for_fences(&[self.slots[previous].in_flight], true, u64::MAX)
                    .context("Image-owner fence wait failed")?;
            }
        }
        Ok(())
    }

    pub fn advance(&mut self) {
        self.cursor.advance();
    }

    /// Rebuild bookkeeping after a swapchain recreation that kept the image
    /// count: the slots stay (they may represent still-valid unfinished
    /// work), but the images are new and the cursor restarts at 0.
    pub fn on_rebuild(&mut self, image_count: usize) {
        self.owners.clear(image_count);
        self.cursor.reset();
    }

    /// Full teardown/recreate of all sync primitives, used when the image
    /// count changed. The caller must have quiesced the GPU and reset the
    /// descriptor pool first.
    pub fn recreate(
        &mut self,
        desired_frames: usize,
        image_count: usize,
        descriptors: &Descriptors,
    ) -> Result<()> {
        for slot in &self.slots {
            slot.destroy(&self.device.device);
        }
        self.slots.clear();

        let frames = resolve_frames_in_flight(desired_frames, image_count);
        log::info!("Recreating sync objects: {} frames in flight", frames);

        self.slots = (0..frames)
            .map(|_| FrameSlot::new(&self.device, descriptors, self.uniform_size))
            .collect::<Result<Vec<_>>>()
            .context("Failed to recreate frame slots")?;

        self.cursor = FrameCursor::new(frames);
        self.owners.clear(image_count);
        Ok(())
    }
}

impl Drop for FrameSynchronizer {
    fn drop(&mut self) {
        for slot in &self.slots {
            slot.destroy(&self.device.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_in_flight_matches_request_when_supported() {
        // 3 requested, 3 swapchain images
        assert_eq!(resolve_frames_in_flight(3, 3), 3);
    }

    #[test]
    fn frames_in_flight_clamps_to_image_count() {
        // 3 requested but only 2 images
        assert_eq!(resolve_frames_in_flight(3, 2), 2);
    }

    #[test]
    fn frames_in_flight_respects_lag_cap_and_floor() {
        assert_eq!(resolve_frames_in_flight(8, 8), MAX_FRAME_LAG);
        assert_eq!(resolve_frames_in_flight(0, 4), 1);
    }

    #[test]
    fn cursor_visits_slots_round_robin() {
        for count in 1..=4 {
            let mut cursor = FrameCursor::new(count);
            for expected in (0..count).cycle().take(count * 3) {
                assert_eq!(cursor.index(), expected);
                cursor.advance();
            }
        }
    }

    #[test]
    fn cursor_resets_to_zero() {
        let mut cursor = FrameCursor::new(3);
        cursor.advance();
        cursor.advance();
        cursor.reset();
        assert_eq!(cursor.index(), 0);
    }

    #[test]
    fn claiming_a_free_image_needs_no_wait() {
        let mut owners = ImageOwners::new(3);
        assert_eq!(owners.claim(0, 0), None);
        assert_eq!(owners.claim(1, 1), None);
    }

    #[test]
    fn claiming_an_image_owned_by_another_slot_reports_it() {
        let mut owners = ImageOwners::new(3);
        owners.claim(2, 0);
        // Slot 1 reuses image 2 while slot 0's work may be outstanding
        assert_eq!(owners.claim(2, 1), Some(0));
        // Now slot 1 owns it; reclaiming by the same slot is free
        assert_eq!(owners.claim(2, 1), None);
    }

    #[test]
    fn rebuild_clears_ownership() {
        let mut owners = ImageOwners::new(2);
        owners.claim(0, 0);
        owners.claim(1, 1);
        owners.clear(3);
        assert_eq!(owners.claim(0, 1), None);
        assert_eq!(owners.claim(2, 0), None);
    }
}
