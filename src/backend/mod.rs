// Backend module - Vulkan abstraction layer
//
// Design: thin wrapper around ash with safety and ergonomics
// Performance: zero-cost abstractions, explicit control

pub mod attachments;
pub mod buffer;
pub mod commands;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::Device;
pub use swapchain::{Acquired, SurfaceStatus, Swapchain};
