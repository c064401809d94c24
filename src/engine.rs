// =============================================================================
// ENGINE - Render loop and resource rebuild coordination
// =============================================================================
//
// Owns the whole Vulkan object graph and drives it one frame at a time:
// wait slot fence -> acquire -> claim image -> update uniforms -> record ->
// submit -> present -> advance. Surface invalidation (resize, out-of-date,
// suboptimal) clears the ready flag; the next frame runs the rebuild cascade
// before rendering. A zero-area surface pauses rendering without error.

use anyhow::{Context, Result};
use ash::vk;
use glam::{Mat4, Vec3};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use crate::backend::attachments::RenderTargets;
use crate::backend::buffer::Uploader;
use crate::backend::commands::{CommandRecorder, FrameBindings, FramePass};
use crate::backend::pipeline::{self, Descriptors};
use crate::backend::shader::load_shader_module;
use crate::backend::sync::{FrameSynchronizer, MAX_FRAME_LAG};
use crate::backend::{Acquired, Device, SurfaceStatus, Swapchain};
use crate::config::Config;
use crate::pacer::FramePacer;
use crate::scene::MeshScene;

const VERT_SHADER_PATH: &str = "shaders/scene.vert.spv";
const FRAG_SHADER_PATH: &str = "shaders/scene.frag.spv";

/// Per-frame uniform block, written into the current slot's buffer each frame.
/// Layout must match the vertex shader's set 0, binding 0.
#[repr(C)]
#[derive(Clone, Copy)]
struct FrameUniforms {
    view_proj: Mat4,
}

/// What the engine expects from its host per iteration of the event loop.
pub trait Renderer {
    /// Advance simulation/camera state by `dt` seconds.
    fn update(&mut self, dt: f32);

    /// Render one frame. `Ok(true)` = a frame was submitted and presented,
    /// `Ok(false)` = the frame was skipped (paused or rebuilding), `Err` =
    /// fatal, the host should terminate.
    fn render_frame(&mut self) -> Result<bool>;

    /// Window size notification. Idempotent; stale sizes are harmless since
    /// the rebuild renegotiates against the surface anyway.
    fn on_window_resize(&mut self, width: u32, height: u32);
}

/// How a reported window size changes the render state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResizeAction {
    /// Zero-area surface: stop rendering, keep everything alive.
    Pause,
    /// Size actually changed: schedule the rebuild cascade.
    Rebuild,
    /// Same size again (or restored from pause): nothing to do.
    Ignore,
}

fn classify_resize(current: (u32, u32), new: (u32, u32)) -> ResizeAction {
    if new.0 == 0 || new.1 == 0 {
        ResizeAction::Pause
    } else if new == current {
        ResizeAction::Ignore
    } else {
        ResizeAction::Rebuild
    }
}

pub struct Engine {
    scene: MeshScene,
    uploader: Uploader,
    recorder: CommandRecorder,
    sync: FrameSynchronizer,

    // Raw handles rebuilt together on every swapchain generation;
    // destroyed manually (here and in Drop)
    framebuffers: Vec<vk::Framebuffer>,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
    vert_shader: vk::ShaderModule,
    frag_shader: vk::ShaderModule,

    descriptors: Descriptors,
    targets: RenderTargets,
    swapchain: Swapchain,
    device: Arc<Device>,

    pacer: FramePacer,
    configured_fps: Option<f64>,
    desired_frames: usize,
    msaa_samples: u32,
    clear_color: [f32; 4],

    /// Last known non-zero window size, fed into the next rebuild.
    surface_extent: (u32, u32),
    paused: bool,
    ready: bool,
    submitted_frames: u64,
    camera_angle: f32,
}

impl Engine {
    pub fn new(
        config: &Config,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let validation = config.debug.validation_layers && cfg!(debug_assertions);
        let device = Device::new(&config.window.title, validation, display_handle)?;

        let surface = unsafe {
            ash_window::create_surface(
                device.entry(),
                &device.instance,
                display_handle,
                window_handle,
                None,
            )
        }
        .context("Failed to create window surface")?;
        let surface_loader =
            ash::extensions::khr::Surface::new(device.entry(), &device.instance);

        let present_supported = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.queue_families.graphics,
                surface,
            )
        }
        .unwrap_or(false);
        if !present_supported {
            unsafe { surface_loader.destroy_surface(surface, None) };
            anyhow::bail!("Graphics queue family cannot present to this surface");
        }

        // The swapchain takes ownership of the surface from here on
        let swapchain = Swapchain::new(
            device.clone(),
            surface,
            surface_loader,
            width,
            height,
            config.preferred_present_mode(),
        )?;

        let targets = RenderTargets::new(
            device.clone(),
            swapchain.extent,
            swapchain.format,
            config.graphics.msaa_samples,
        )?;

        let render_pass = pipeline::create_render_pass(&device, swapchain.format, targets.samples)?;

        let descriptors = Descriptors::new(&device, MAX_FRAME_LAG as u32)?;

        let vert_shader = load_shader_module(&device, VERT_SHADER_PATH)?;
        let frag_shader = load_shader_module(&device, FRAG_SHADER_PATH)?;

        let (graphics_pipeline, pipeline_layout) = pipeline::create_graphics_pipeline(
            &device,
            render_pass,
            swapchain.extent,
            targets.samples,
            descriptors.layout,
            vert_shader,
            frag_shader,
        )?;

        let framebuffers = pipeline::create_framebuffers(
            &device,
            &targets,
            &swapchain.image_views,
            render_pass,
            swapchain.extent,
        )?;

        let sync = FrameSynchronizer::new(
            device.clone(),
            config.graphics.frames_in_flight,
            swapchain.image_count(),
            &descriptors,
            std::mem::size_of::<FrameUniforms>() as vk::DeviceSize,
        )?;

        let recorder = CommandRecorder::new(device.clone(), sync.frames())?;

        let uploader = Uploader::new(device.clone())?;
        let scene = MeshScene::new(&uploader).context("Failed to build scene")?;
        // The mesh must be resident before the first draw references it
        uploader.flush()?;

        let surface_extent = (swapchain.extent.width, swapchain.extent.height);
        log::info!(
            "Engine ready ({}x{}, {:?})",
            surface_extent.0,
            surface_extent.1,
            swapchain.present_mode
        );

        Ok(Self {
            scene,
            uploader,
            recorder,
            sync,
            framebuffers,
            pipeline: graphics_pipeline,
            pipeline_layout,
            render_pass,
            vert_shader,
            frag_shader,
            descriptors,
            targets,
            swapchain,
            device,
            pacer: FramePacer::new(config.target_fps()),
            configured_fps: config.target_fps(),
            desired_frames: config.graphics.frames_in_flight,
            msaa_samples: config.graphics.msaa_samples,
            clear_color: config.graphics.clear_color,
            surface_extent,
            paused: false,
            ready: true,
            submitted_frames: 0,
            camera_angle: 0.0,
        })
    }

    /// Frames actually submitted to the GPU since startup. Skipped frames
    /// (paused, rebuilding) do not count.
    pub fn submitted_frames(&self) -> u64 {
        self.submitted_frames
    }

    /// Switch between the configured frame cap and uncapped submission.
    pub fn toggle_frame_cap(&mut self) {
        if self.pacer.uncapped() {
            log::info!("Frame cap restored");
            self.pacer.set_rate(self.configured_fps);
        } else {
            log::info!("Frame cap disabled");
            self.pacer.set_rate(None);
        }
    }

    /// Re-pose the demo scene. Cached command buffers pick the change up
    /// through the geometry generation on the next record.
    pub fn cycle_scene_layout(&mut self) {
        self.scene.cycle_layout();
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    /// Destroy every object rebuilt per swapchain generation, nulling the
    /// handles so a failed rebuild cannot double-destroy in Drop.
    fn destroy_generation_objects(&mut self) {
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            if self.pipeline != vk::Pipeline::null() {
                self.device.device.destroy_pipeline(self.pipeline, None);
                self.pipeline = vk::Pipeline::null();
            }
            if self.pipeline_layout != vk::PipelineLayout::null() {
                self.device
                    .device
                    .destroy_pipeline_layout(self.pipeline_layout, None);
                self.pipeline_layout = vk::PipelineLayout::null();
            }
            if self.render_pass != vk::RenderPass::null() {
                self.device.device.destroy_render_pass(self.render_pass, None);
                self.render_pass = vk::RenderPass::null();
            }
        }
    }

    /// The rebuild cascade. Runs to completion or leaves the engine not
    /// ready; a propagated error here is fatal.
    ///
    /// Order matters: quiesce, retire the dependents of the old generation,
    /// recreate the swapchain, then rebuild attachments, render pass,
    /// pipeline, framebuffers and command state against the new one. Sync
    /// slots survive unless the image count changed.
    fn rebuild(&mut self) -> Result<()> {
        let (width, height) = self.surface_extent;
        if width == 0 || height == 0 {
            self.paused = true;
            return Ok(());
        }

        log::debug!("Rebuilding swapchain resources ({}x{})", width, height);

        self.device.wait_idle()?;
        self.destroy_generation_objects();

        let old_image_count = self.swapchain.image_count();
        self.swapchain
            .recreate(width, height)
            .context("Swapchain recreation failed")?;

        self.targets = RenderTargets::new(
            self.device.clone(),
            self.swapchain.extent,
            self.swapchain.format,
            self.msaa_samples,
        )?;

        self.render_pass =
            pipeline::create_render_pass(&self.device, self.swapchain.format, self.targets.samples)?;

        let (graphics_pipeline, pipeline_layout) = pipeline::create_graphics_pipeline(
            &self.device,
            self.render_pass,
            self.swapchain.extent,
            self.targets.samples,
            self.descriptors.layout,
            self.vert_shader,
            self.frag_shader,
        )?;
        self.pipeline = graphics_pipeline;
        self.pipeline_layout = pipeline_layout;

        self.framebuffers = pipeline::create_framebuffers(
            &self.device,
            &self.targets,
            &self.swapchain.image_views,
            self.render_pass,
            self.swapchain.extent,
        )?;

        let image_count = self.swapchain.image_count();
        if image_count != old_image_count {
            // The slot count may change with the image count; recreate from
            // scratch. The GPU is already idle so no slot has work in flight.
            self.descriptors.reset(&self.device)?;
            self.sync
                .recreate(self.desired_frames, image_count, &self.descriptors)?;
            self.recorder.resize(self.sync.frames())?;
        } else {
            self.sync.on_rebuild(image_count);
            self.recorder.invalidate();
        }

        self.paused = false;
        self.ready = true;
        log::info!(
            "Rebuilt resources for swapchain generation {}",
            self.swapchain.generation()
        );
        Ok(())
    }

    fn view_proj(&self) -> Mat4 {
        let extent = self.swapchain.extent;
        let aspect = extent.width as f32 / extent.height.max(1) as f32;

        let eye = Vec3::new(
            self.camera_angle.cos() * 6.0,
            3.0,
            self.camera_angle.sin() * 6.0,
        );
        let view = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);

        let mut proj = Mat4::perspective_rh(60f32.to_radians(), aspect, 0.1, 100.0);
        // Vulkan clip space is Y-down
        proj.y_axis.y *= -1.0;

        proj * view
    }
}

impl Renderer for Engine {
    fn update(&mut self, dt: f32) {
        self.camera_angle += dt * 0.5;
    }

    fn render_frame(&mut self) -> Result<bool> {
        self.pacer.wait();

        if self.paused {
            return Ok(false);
        }
        if !self.ready {
            self.rebuild().context("Resource rebuild failed")?;
            if !self.ready {
                return Ok(false);
            }
        }

        // Reap finished staging uploads; never blocks
        self.uploader.collect();

        self.sync.wait_current()?;

        let acquire_complete = self.sync.current().acquire_complete;
        let image_index = match self.swapchain.acquire_next_image(acquire_complete)? {
            Acquired::OutOfDate => {
                log::debug!("Swapchain out of date on acquire");
                self.ready = false;
                return Ok(false);
            }
            Acquired::Image { index, status } => {
                if status == SurfaceStatus::Suboptimal {
                    // Still presentable: finish this frame, rebuild next
                    log::debug!("Swapchain suboptimal on acquire");
                    self.ready = false;
                }
                index
            }
        };

        // Another slot may still have work against this image
        self.sync.claim_image(image_index)?;
        self.sync.reset_current()?;

        let uniforms = FrameUniforms {
            view_proj: self.view_proj(),
        };
        self.sync.current_mut().uniforms.write(&[uniforms])?;

        let slot_index = self.sync.slot_index();
        let slot = self.sync.current();
        let render_complete = slot.render_complete;
        let in_flight = slot.in_flight;

        let bindings = FrameBindings {
            pipeline: self.pipeline,
            pipeline_layout: self.pipeline_layout,
            descriptor_set: slot.descriptor_set,
        };
        let pass = FramePass {
            render_pass: self.render_pass,
            framebuffer: self.framebuffers[image_index as usize],
            extent: self.swapchain.extent,
            msaa: self.targets.msaa_enabled(),
            clear_color: self.clear_color,
        };

        let cmd = self
            .recorder
            .record_frame(slot_index, &pass, &bindings, &self.scene)?;

        let wait_semaphores = [acquire_complete];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cmd];
        let signal_semaphores = [render_complete];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit], in_flight)
                .context("Frame submit failed")?;
        }
        self.submitted_frames += 1;

        // Present waits on render_complete GPU-side; the CPU does not block
        match self
            .swapchain
            .present(self.device.graphics_queue, image_index, &signal_semaphores)?
        {
            SurfaceStatus::Ready => {}
            status => {
                log::debug!("Present reported {:?}", status);
                self.ready = false;
            }
        }

        self.sync.advance();
        Ok(true)
    }

    fn on_window_resize(&mut self, width: u32, height: u32) {
        match classify_resize(self.surface_extent, (width, height)) {
            ResizeAction::Pause => {
                if !self.paused {
                    log::info!("Window minimized, pausing rendering");
                }
                self.paused = true;
            }
            ResizeAction::Rebuild => {
                self.surface_extent = (width, height);
                self.paused = false;
                self.ready = false;
            }
            ResizeAction::Ignore => {
                // Restored to the size we already render at
                self.paused = false;
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        log::info!(
            "Shutting down after {} submitted frames",
            self.submitted_frames
        );
        if let Err(e) = self.device.wait_idle() {
            log::error!("Wait idle on shutdown failed: {}", e);
        }

        self.destroy_generation_objects();
        unsafe {
            self.device.device.destroy_shader_module(self.vert_shader, None);
            self.device.device.destroy_shader_module(self.frag_shader, None);
        }
        self.descriptors.destroy(&self.device);
        // Remaining fields drop in declaration order: scene and uploader
        // release their buffers, then recorder, sync, targets, swapchain
        // (which retires the surface), and the device last.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_area_resize_pauses() {
        assert_eq!(classify_resize((1280, 720), (0, 0)), ResizeAction::Pause);
        assert_eq!(classify_resize((1280, 720), (0, 500)), ResizeAction::Pause);
        assert_eq!(classify_resize((1280, 720), (500, 0)), ResizeAction::Pause);
    }

    #[test]
    fn identical_resize_is_idempotent() {
        assert_eq!(
            classify_resize((1280, 720), (1280, 720)),
            ResizeAction::Ignore
        );
    }

    #[test]
    fn changed_size_triggers_rebuild() {
        assert_eq!(
            classify_resize((1280, 720), (1920, 1080)),
            ResizeAction::Rebuild
        );
        assert_eq!(classify_resize((1280, 720), (1280, 719)), ResizeAction::Rebuild);
    }

    #[test]
    fn uniform_block_matches_shader_layout() {
        // One mat4, std140
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 64);
    }
}
