// Swapchain - presentable surface lifecycle
//
// Negotiates format/present-mode/image-count/extent with the platform
// surface and owns the presentable images. Rebuilt in place (same identity,
// new generation) whenever the surface resizes or reports invalidation.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::Device;

/// Surface state reported by acquire/present.
///
/// `OutOfDate` and `Suboptimal` are recoverable-transient: the caller skips
/// or finishes the frame and schedules a rebuild. Anything else surfaces as
/// a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    Ready,
    Suboptimal,
    OutOfDate,
}

/// Result of a non-blocking image acquire.
pub enum Acquired {
    Image { index: u32, status: SurfaceStatus },
    OutOfDate,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    loader: ash::extensions::khr::Swapchain,
    surface: vk::SurfaceKHR,
    surface_loader: ash::extensions::khr::Surface,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    preferred_present_mode: Option<vk::PresentModeKHR>,
    generation: u64,
    device: Arc<Device>,
}

impl Swapchain {
    pub fn new(
        device: Arc<Device>,
        surface: vk::SurfaceKHR,
        surface_loader: ash::extensions::khr::Surface,
        width: u32,
        height: u32,
        preferred_present_mode: Option<vk::PresentModeKHR>,
    ) -> Result<Self> {
        let loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let mut swapchain = Self {
            swapchain: vk::SwapchainKHR::null(),
            loader,
            surface,
            surface_loader,
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            preferred_present_mode,
            generation: 0,
            device,
        };
        swapchain.build(width, height)?;
        Ok(swapchain)
    }

    /// Rebuild in place for a new extent. Same identity, next generation.
    /// The caller must have quiesced the GPU first.
    pub fn recreate(&mut self, width: u32, height: u32) -> Result<()> {
        self.build(width, height)
    }

    fn build(&mut self, width: u32, height: u32) -> Result<()> {
        let surface_caps = unsafe {
            self.surface_loader.get_physical_device_surface_capabilities(
                self.device.physical_device,
                self.surface,
            )
        }
        .context("Failed to query surface capabilities")?;

        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.device.physical_device, self.surface)
        }
        .context("Failed to query surface formats")?;

        let present_modes = unsafe {
            self.surface_loader.get_physical_device_surface_present_modes(
                self.device.physical_device,
                self.surface,
            )
        }
        .context("Failed to query present modes")?;

        let surface_format = choose_surface_format(&formats)?;
        let present_mode = choose_present_mode(&present_modes, self.preferred_present_mode);
        let extent = choose_extent(&surface_caps, width, height);
        let image_count = choose_image_count(&surface_caps);

        // Zero-area surfaces are a pause, not an error; the rebuild
        // coordinator never calls into here while paused.
        anyhow::ensure!(
            extent.width > 0 && extent.height > 0,
            "Swapchain built against a zero-area surface"
        );

        let old_swapchain = self.swapchain;

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // The old chain (and the views into it) can go now that the new one
        // has taken over the surface.
        self.destroy_images();
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(old_swapchain, None) };
        }

        let images = unsafe { self.loader.get_swapchain_images(swapchain) }
            .context("Failed to get swapchain images")?;

        let image_views = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .components(vk::ComponentMapping {
                        r: vk::ComponentSwizzle::IDENTITY,
                        g: vk::ComponentSwizzle::IDENTITY,
                        b: vk::ComponentSwizzle::IDENTITY,
                        a: vk::ComponentSwizzle::IDENTITY,
                    })
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });

                unsafe {
                    self.device
                        .device
                        .create_image_view(&create_info, None)
                        .context("Failed to create swapchain image view")
                }
            })
            .collect::<Result<Vec<_>>>()?;

        self.swapchain = swapchain;
        self.format = surface_format.format;
        self.extent = extent;
        self.present_mode = present_mode;
        self.image_views = image_views;
        self.generation += 1;

        log::info!(
            "Swapchain generation {}: {}x{}, {} images, {:?}, {:?}",
            self.generation,
            extent.width,
            extent.height,
            images.len(),
            surface_format.format,
            present_mode,
        );

        self.images = images;
        Ok(())
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Monotonically increasing rebuild counter.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Acquire the next presentable image, signaling `semaphore` when the
    /// image is ready on the GPU. Never blocks on GPU readiness; surface
    /// invalidation comes back as a status, not an error.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<Acquired> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, false)) => Ok(Acquired::Image {
                index,
                status: SurfaceStatus::Ready,
            }),
            Ok((index, true)) => Ok(Acquired::Image {
                index,
                status: SurfaceStatus::Suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Queue the image for presentation once `wait_semaphores` signal.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<SurfaceStatus> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(SurfaceStatus::Ready),
            Ok(true) | Err(vk::Result::SUBOPTIMAL_KHR) => Ok(SurfaceStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SurfaceStatus::OutOfDate),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }

    fn destroy_images(&mut self) {
        for view in self.image_views.drain(..) {
            unsafe { self.device.device.destroy_image_view(view, None) };
        }
        self.images.clear();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_images();
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
        }
        // The surface was moved in at creation; it outlives every chain
        // built against it and goes last.
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
    }
}

/// Prefer 8-bit BGRA sRGB with a non-linear color space, else the first
/// supported format. An empty list is fatal.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .context("No supported surface format")
}

/// Honor the configured mode when supported; otherwise prefer MAILBOX
/// (low-latency, non-blocking), falling back to FIFO which every
/// implementation must support.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: Option<vk::PresentModeKHR>,
) -> vk::PresentModeKHR {
    if let Some(preferred) = preferred {
        if available.contains(&preferred) {
            return preferred;
        }
        log::warn!(
            "Present mode {:?} not supported, falling back to automatic choice",
            preferred
        );
    }

    if available.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// min + 1 for headroom, clamped to the surface maximum when bounded
/// (max_image_count == 0 means unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        count = caps.max_image_count;
    }
    count
}

/// Surface-reported fixed extent when set, else the window extent clamped to
/// the surface min/max. May be zero-area, which callers treat as a pause.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn prefers_bgra_srgb_nonlinear() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_format() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn empty_format_list_is_fatal() {
        assert!(choose_surface_format(&[]).is_err());
    }

    #[test]
    fn prefers_mailbox_over_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, None),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn fifo_is_the_universal_fallback() {
        let modes = [vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes, None), vk::PresentModeKHR::FIFO);
        // Unsupported preference falls back too
        assert_eq!(
            choose_present_mode(&modes, Some(vk::PresentModeKHR::IMMEDIATE)),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn supported_preference_wins() {
        let modes = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            choose_present_mode(&modes, Some(vk::PresentModeKHR::IMMEDIATE)),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn image_count_is_min_plus_one() {
        assert_eq!(choose_image_count(&caps(2, 0)), 3);
    }

    #[test]
    fn image_count_clamps_to_bounded_max() {
        assert_eq!(choose_image_count(&caps(2, 2)), 2);
        assert_eq!(choose_image_count(&caps(3, 8)), 4);
    }

    #[test]
    fn extent_uses_surface_fixed_size_when_reported() {
        let mut c = caps(2, 0);
        c.current_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let extent = choose_extent(&c, 1280, 720);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn extent_clamps_window_size() {
        let extent = choose_extent(&caps(2, 0), 10_000, 720);
        assert_eq!((extent.width, extent.height), (4096, 720));
    }

    #[test]
    fn zero_area_window_yields_zero_extent() {
        let mut c = caps(2, 0);
        c.min_image_extent = vk::Extent2D::default();
        let extent = choose_extent(&c, 0, 0);
        assert_eq!((extent.width, extent.height), (0, 0));
    }
}
