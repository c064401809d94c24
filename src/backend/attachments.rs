// Attachment resolver - MSAA targets for the current swapchain generation
//
// Negotiates the highest sample count supported by both the color and depth
// formats, falling back to single-sample. Owns the multisample color target
// and the depth target, both sized to the swapchain extent.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::GpuImage;
use super::Device;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Render targets bound to one swapchain generation.
pub struct RenderTargets {
    pub samples: vk::SampleCountFlags,
    /// Multisample color target. None when running single-sample, in which
    /// case the swapchain image is the color attachment directly.
    msaa_color: Option<GpuImage>,
    depth: GpuImage,
}

impl RenderTargets {
    pub fn new(
        device: Arc<Device>,
        extent: vk::Extent2D,
        color_format: vk::Format,
        requested_samples: u32,
    ) -> Result<Self> {
        // Sample count must be supported by color and depth simultaneously
        let limits = &device.properties.limits;
        let supported =
            limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts;
        let samples = negotiate_samples(requested_samples, supported);

        if samples == vk::SampleCountFlags::TYPE_1 && requested_samples > 1 {
            log::warn!(
                "{}x MSAA not supported for color+depth, rendering single-sample",
                requested_samples
            );
        } else {
            log::info!("MSAA: {:?}", samples);
        }

        let msaa_color = if samples != vk::SampleCountFlags::TYPE_1 {
            Some(
                GpuImage::attachment(
                    device.clone(),
                    "msaa color",
                    extent,
                    color_format,
                    samples,
                    vk::ImageUsageFlags::COLOR_ATTACHMENT
                        | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                    vk::ImageAspectFlags::COLOR,
                )
                .context("Failed to create multisample color target")?,
            )
        } else {
            None
        };

        let depth = GpuImage::attachment(
            device,
            "depth",
            extent,
            DEPTH_FORMAT,
            samples,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )
        .context("Failed to create depth target")?;

        Ok(Self {
            samples,
            msaa_color,
            depth,
        })
    }

    pub fn msaa_enabled(&self) -> bool {
        self.msaa_color.is_some()
    }

    /// Framebuffer attachment views for one swapchain image, in the exact
    /// order the render pass declares them.
    pub fn framebuffer_attachments(&self, swapchain_view: vk::ImageView) -> Vec<vk::ImageView> {
        attachment_order(
            self.msaa_color.as_ref().map(|img| img.view),
            swapchain_view,
            self.depth.view,
        )
    }
}

/// Attachment order contract shared by the render pass and framebuffers:
/// `[msaa-color, resolve-color, msaa-depth]` with MSAA enabled,
/// `[swapchain-color, depth]` without. An index/purpose mismatch here is
/// silent corruption, hence the tests below.
pub fn attachment_order(
    msaa_color: Option<vk::ImageView>,
    swapchain_view: vk::ImageView,
    depth_view: vk::ImageView,
) -> Vec<vk::ImageView> {
    match msaa_color {
        Some(msaa) => vec![msaa, swapchain_view, depth_view],
        None => vec![swapchain_view, depth_view],
    }
}

/// Highest supported sample count <= requested, over the intersection of the
/// color and depth support masks. Falls back to single-sample.
pub fn negotiate_samples(requested: u32, supported: vk::SampleCountFlags) -> vk::SampleCountFlags {
    let candidates = [
        (64, vk::SampleCountFlags::TYPE_64),
        (32, vk::SampleCountFlags::TYPE_32),
        (16, vk::SampleCountFlags::TYPE_16),
        (8, vk::SampleCountFlags::TYPE_8),
        (4, vk::SampleCountFlags::TYPE_4),
        (2, vk::SampleCountFlags::TYPE_2),
    ];

    for (count, flag) in candidates {
        if count <= requested && supported.contains(flag) {
            return flag;
        }
    }
    vk::SampleCountFlags::TYPE_1
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn negotiates_exact_request() {
        let supported = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4
            | vk::SampleCountFlags::TYPE_8;
        assert_eq!(negotiate_samples(4, supported), vk::SampleCountFlags::TYPE_4);
    }

    #[test]
    fn negotiates_down_to_highest_supported() {
        // 8x requested but the intersection only offers 2x
        let supported = vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_2;
        assert_eq!(negotiate_samples(8, supported), vk::SampleCountFlags::TYPE_2);
    }

    #[test]
    fn falls_back_to_single_sample() {
        let supported = vk::SampleCountFlags::TYPE_1;
        assert_eq!(negotiate_samples(8, supported), vk::SampleCountFlags::TYPE_1);
        assert_eq!(negotiate_samples(1, supported), vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn msaa_attachment_order_per_index() {
        let msaa = vk::ImageView::from_raw(1);
        let swap = vk::ImageView::from_raw(2);
        let depth = vk::ImageView::from_raw(3);

        let order = attachment_order(Some(msaa), swap, depth);
        assert_eq!(order.len(), 3);
        assert_eq!(order[0], msaa, "index 0 must be the multisample color");
        assert_eq!(order[1], swap, "index 1 must be the resolve target");
        assert_eq!(order[2], depth, "index 2 must be the multisample depth");
    }

    #[test]
    fn single_sample_attachment_order_per_index() {
        let swap = vk::ImageView::from_raw(2);
        let depth = vk::ImageView::from_raw(3);

        let order = attachment_order(None, swap, depth);
        assert_eq!(order.len(), 2);
        assert_eq!(order[0], swap, "index 0 must be the swapchain color");
        assert_eq!(order[1], depth, "index 1 must be the depth target");
    }
}
