// Command recording
//
// Static+inherited strategy: the stable draw workload is recorded once per
// frame slot into a secondary buffer that is independent of any specific
// framebuffer. Each frame only a minimal primary buffer is re-recorded: it
// begins the render pass on the acquired image's framebuffer and executes
// the cached secondary. Secondaries are invalidated whenever the pipeline,
// bindings or vertex data change.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::scene::SceneSource;

use super::Device;

/// Everything the primary buffer needs to begin the pass for one frame.
pub struct FramePass {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub msaa: bool,
    pub clear_color: [f32; 4],
}

/// Per-frame state baked into the cached secondary buffers.
pub struct FrameBindings {
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
}

pub struct CommandRecorder {
    pool: vk::CommandPool,
    /// One primary + one secondary per frame slot.
    primaries: Vec<vk::CommandBuffer>,
    secondaries: Vec<vk::CommandBuffer>,
    /// Scene geometry generation each secondary was recorded against.
    recorded: Vec<Option<u64>>,
    device: Arc<Device>,
}

impl CommandRecorder {
    pub fn new(device: Arc<Device>, frames: usize) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_families.graphics)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );

        let pool = unsafe {
            device
                .device
                .create_command_pool(&pool_info, None)
                .context("Failed to create command pool")?
        };

        let mut recorder = Self {
            pool,
            primaries: Vec::new(),
            secondaries: Vec::new(),
            recorded: Vec::new(),
            device,
        };
        recorder.resize(frames)?;
        Ok(recorder)
    }

    /// Reallocate command buffers for a new frame-slot count. Also discards
    /// every cached secondary.
    pub fn resize(&mut self, frames: usize) -> Result<()> {
        self.free_buffers();

        let alloc = |level: vk::CommandBufferLevel| -> Result<Vec<vk::CommandBuffer>> {
            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(self.pool)
                .level(level)
                .command_buffer_count(frames as u32);
            unsafe {
                self.device
                    .device
                    .allocate_command_buffers(&alloc_info)
                    .context("Failed to allocate command buffers")
            }
        };

        self.primaries = alloc(vk::CommandBufferLevel::PRIMARY)?;
        self.secondaries = alloc(vk::CommandBufferLevel::SECONDARY)?;
        self.recorded = vec![None; frames];
        Ok(())
    }

    /// Discard every cached secondary; they are re-recorded on next use.
    /// Called on rebuild (new pipeline/render pass) and on binding changes.
    pub fn invalidate(&mut self) {
        self.recorded.iter_mut().for_each(|r| *r = None);
    }

    /// Record the frame's primary buffer, refreshing the slot's cached
    /// secondary first if it is stale. The caller has already waited on the
    /// slot's fence, so neither buffer is in flight.
    pub fn record_frame(
        &mut self,
        slot: usize,
        pass: &FramePass,
        bindings: &FrameBindings,
        scene: &dyn SceneSource,
    ) -> Result<vk::CommandBuffer> {
        let generation = scene.geometry_generation();
        if self.recorded[slot] != Some(generation) {
            self.record_secondary(slot, pass.render_pass, bindings, scene)?;
            self.recorded[slot] = Some(generation);
        }

        let device = &self.device.device;
        let primary = self.primaries[slot];
        let secondary = self.secondaries[slot];

        let mut clear_values = vec![vk::ClearValue {
            color: vk::ClearColorValue {
                float32: pass.clear_color,
            },
        }];
        if pass.msaa {
            // Resolve attachment slot; load op is DONT_CARE but the array
            // must still line up with the attachment indices
            clear_values.push(vk::ClearValue::default());
        }
        clear_values.push(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        });

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: pass.extent,
        };
        let pass_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(pass.render_pass)
            .framebuffer(pass.framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(primary, &begin_info)?;
            device.cmd_begin_render_pass(
                primary,
                &pass_begin,
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            );
            device.cmd_execute_commands(primary, &[secondary]);
            device.cmd_end_render_pass(primary);
            device.end_command_buffer(primary)?;
        }

        Ok(primary)
    }

    /// Record the stable workload into the slot's secondary buffer. The
    /// inheritance info names the render pass but no framebuffer, so the
    /// buffer stays valid across swapchain images.
    fn record_secondary(
        &mut self,
        slot: usize,
        render_pass: vk::RenderPass,
        bindings: &FrameBindings,
        scene: &dyn SceneSource,
    ) -> Result<()> {
        let device = &self.device.device;
        let cmd = self.secondaries[slot];

        let inheritance = vk::CommandBufferInheritanceInfo::builder()
            .render_pass(render_pass)
            .subpass(0);
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE)
            .inheritance_info(&inheritance);

        unsafe {
            device.begin_command_buffer(cmd, &begin_info)?;
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, bindings.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                bindings.pipeline_layout,
                0,
                &[bindings.descriptor_set],
                &[],
            );
            scene.record(device, cmd, bindings.pipeline_layout);
            device.end_command_buffer(cmd)?;
        }

        log::debug!("Recorded secondary for slot {} (gen {})", slot, scene.geometry_generation());
        Ok(())
    }

    fn free_buffers(&mut self) {
        if !self.primaries.is_empty() {
            unsafe {
                self.device
                    .device
                    .free_command_buffers(self.pool, &self.primaries)
            };
            self.primaries.clear();
        }
        if !self.secondaries.is_empty() {
            unsafe {
                self.device
                    .device
                    .free_command_buffers(self.pool, &self.secondaries)
            };
            self.secondaries.clear();
        }
        self.recorded.clear();
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        self.free_buffers();
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}
