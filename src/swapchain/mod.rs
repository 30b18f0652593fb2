//! A virtual swapchain: a `VkSwapchainKHR` stand-in that never touches a
//! display. Rendered images are copied into host-visible staging buffers and
//! handed to a frame sink as raw bytes, with an optional forwarding mode that
//! also blits each frame onto a real swapchain.

mod forward;
mod pump;

use std::slice;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::warn;
use parking_lot::Mutex;
use vulkanalia::prelude::v1_0::*;

use pump::{FramePump, PumpOptions};

pub use forward::BaseTarget;

/// Receives the bytes of one completed frame. A zero-length slice reports a
/// copy that failed; the slice is only valid for the duration of the call.
pub type FrameSink = Box<dyn FnMut(&[u8]) + Send>;

/// Construction-time settings.
pub struct SwapchainOptions {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub image_count: u32,

    /// Let `get_image` allocate additional internal images when every slot is
    /// busy, up to `max_images`. Grown images are never reported by
    /// [`VirtualSwapchain::images`].
    pub create_new_images: bool,
    pub max_images: u32,

    /// `get_image` waits for the exact index the caller passed in rather
    /// than handing out any free slot.
    pub always_get_acquired: bool,

    /// Worker park interval between shutdown checks.
    pub pending_timeout: Duration,
    /// How long the worker waits on a copy fence before reporting the frame
    /// as failed.
    pub fence_timeout_ns: u64,

    /// Additionally present every frame onto this real swapchain.
    pub base: Option<BaseTarget>,
}

impl Default for SwapchainOptions {
    fn default() -> Self {
        Self {
            format: vk::Format::B8G8R8A8_UNORM,
            extent: vk::Extent2D { width: 0, height: 0 },
            image_count: 3,
            create_new_images: false,
            max_images: 8,
            always_get_acquired: false,
            pending_timeout: Duration::from_millis(10),
            fence_timeout_ns: 1_000_000_000,
            base: None,
        }
    }
}

/// One swapchain image with everything needed to drain it: backing memory, a
/// persistently mapped staging buffer, the copy fence the worker waits on and
/// the pre-recorded image-to-buffer copy.
pub(crate) struct ImageSlot {
    pub(crate) image: vk::Image,
    image_memory: vk::DeviceMemory,
    staging: vk::Buffer,
    staging_memory: vk::DeviceMemory,
    mapped: *const u8,
    copy_fence: vk::Fence,
    commands: vk::CommandBuffer,
    /// Signalled by the copy submission; the forwarding blit waits on it.
    pub(crate) copy_done: vk::Semaphore,
    /// Signalled by the forwarding blit; the real present waits on it.
    pub(crate) present_ready: vk::Semaphore,
}

// The mapped pointer targets host-coherent memory that stays mapped until the
// slot is destroyed, after the worker has been joined.
unsafe impl Send for ImageSlot {}
unsafe impl Sync for ImageSlot {}

pub struct VirtualSwapchain {
    device: Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    memory: vk::PhysicalDeviceMemoryProperties,
    options: SwapchainOptions,
    image_size: u64,
    initial_image_count: usize,
    pump: Arc<FramePump<ImageSlot>>,
    worker: Option<JoinHandle<()>>,
    sink: Arc<Mutex<Option<FrameSink>>>,
    forward: Option<forward::ForwardTarget>,
}

impl VirtualSwapchain {
    /// Creates the swapchain: `image_count` driver images with their staging
    /// buffers and pre-recorded copies, plus the worker thread that turns
    /// completed copies into sink calls.
    ///
    /// The device, queue and physical device are borrowed for the lifetime of
    /// the swapchain; [`destroy`](Self::destroy) must run before any of them
    /// go away.
    ///
    /// # Safety
    ///
    /// All Vulkan handles must be valid, and `queue` must belong to
    /// `queue_family` on `device`.
    pub unsafe fn create(
        instance: &Instance,
        device: &Device,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        queue: vk::Queue,
        mut options: SwapchainOptions,
    ) -> Result<Self> {
        let image_size = image_byte_size(options.format, options.extent)?;
        let memory = instance.get_physical_device_memory_properties(physical_device);

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        let command_pool = device.create_command_pool(&pool_info, None)?;

        // Everything created from here on is released by the guard unless
        // construction runs to completion.
        let mut guard = ConstructGuard {
            device,
            command_pool,
            slots: Vec::with_capacity(options.image_count as usize),
            armed: true,
        };
        for _ in 0..options.image_count {
            let slot = create_image_slot(device, &memory, command_pool, &options, image_size)?;
            guard.slots.push(slot);
        }

        let base = options.base.take();
        let forward = match base {
            Some(base) => Some(forward::ForwardTarget::new(command_pool, base)),
            None => None,
        };

        let initial_image_count = guard.slots.len();
        let pump = FramePump::new(
            std::mem::take(&mut guard.slots),
            PumpOptions {
                pending_timeout: options.pending_timeout,
                allow_growth: options.create_new_images,
                max_slots: options.max_images as usize,
                always_get_acquired: options.always_get_acquired,
            },
        );

        let sink: Arc<Mutex<Option<FrameSink>>> = Arc::new(Mutex::new(None));
        let worker = pump.spawn_worker(frame_worker(
            device.clone(),
            Arc::clone(&sink),
            image_size as usize,
            options.fence_timeout_ns,
        ));
        let worker = match worker {
            Ok(worker) => worker,
            Err(err) => {
                for index in 0..pump.slot_count() {
                    destroy_slot(device, &pump.slot(index));
                }
                // The guard still owns the pool.
                return Err(anyhow!("failed to spawn frame worker: {err}"));
            }
        };
        guard.armed = false;

        Ok(Self {
            device: device.clone(),
            queue,
            command_pool,
            memory,
            options,
            image_size,
            initial_image_count,
            pump,
            worker: Some(worker),
            sink,
            forward,
        })
    }

    /// Register the consumer of completed frames. The sink runs on the worker
    /// thread and must not block on the submitting queue.
    pub fn set_frame_sink<F>(&self, sink: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        *self.sink.lock() = Some(Box::new(sink));
    }

    /// Bytes of one full frame in the swapchain format.
    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    pub fn format(&self) -> vk::Format {
        self.options.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.options.extent
    }

    /// The images visible through the swapchain interface. Dynamically grown
    /// slots stay internal to the capture pipeline and are not listed.
    pub fn images(&self) -> Vec<vk::Image> {
        (0..self.initial_image_count)
            .map(|index| self.pump.slot(index).image)
            .collect()
    }

    /// Claim an image for rendering. Under the normal policy any free index
    /// comes back through `index`; under always-get-acquired the caller's
    /// value names the slot to wait for. Returns false once `timeout_ns`
    /// expires (`u64::MAX` waits forever).
    pub fn get_image(&self, timeout_ns: u64, index: &mut u32) -> bool {
        self.pump.get_image(timeout_ns, index, || {
            let grown = unsafe {
                create_image_slot(
                    &self.device,
                    &self.memory,
                    self.command_pool,
                    &self.options,
                    self.image_size,
                )
            };
            match grown {
                Ok(slot) => Some(slot),
                Err(err) => {
                    warn!("failed to allocate an additional swapchain image: {err}");
                    None
                }
            }
        })
    }

    /// Hand a rendered image to the worker. Must be called exactly once per
    /// claimed image, after the copy command for the slot was submitted with
    /// the slot's fence. [`present`](Self::present) does both.
    pub fn notify_submitted(&self, index: u32) {
        self.pump.notify_submitted(index);
    }

    /// The `vkAcquireNextImageKHR` face of [`get_image`](Self::get_image):
    /// claims a free image and signals the caller's semaphore and fence
    /// through an empty submission, since no presentation engine exists to do
    /// it. Returns `None` on timeout.
    ///
    /// # Safety
    ///
    /// `semaphore` and `fence` must be null or valid and unsignalled.
    pub unsafe fn acquire_next_image(
        &self,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<Option<u32>> {
        let mut index = 0;
        if !self.get_image(timeout_ns, &mut index) {
            return Ok(None);
        }
        if !semaphore.is_null() || !fence.is_null() {
            let semaphores = [semaphore];
            let mut info = vk::SubmitInfo::builder();
            if !semaphore.is_null() {
                info = info.signal_semaphores(&semaphores);
            }
            self.device.queue_submit(self.queue, &[info], fence)?;
        }
        Ok(Some(index))
    }

    /// The `vkQueuePresentKHR` face: submits the slot's pre-recorded copy,
    /// waiting on the renderer's semaphores and signalling the slot's copy
    /// fence, then queues the slot for the worker. With a base target the
    /// frame is also blitted onto the real swapchain.
    ///
    /// The image must be in `PRESENT_SRC_KHR` layout, as for a real present.
    ///
    /// # Safety
    ///
    /// `index` must have been claimed through [`get_image`](Self::get_image)
    /// or [`acquire_next_image`](Self::acquire_next_image); external queue
    /// synchronization is the caller's, as everywhere in Vulkan.
    pub unsafe fn present(&self, wait_semaphores: &[vk::Semaphore], index: u32) -> Result<()> {
        let slot = self.pump.slot(index as usize);
        let wait_stages = vec![vk::PipelineStageFlags::TRANSFER; wait_semaphores.len()];
        let command_buffers = [slot.commands];
        let mut signal = Vec::new();
        if self.forward.is_some() {
            signal.push(slot.copy_done);
        }
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal);
        self.device.queue_submit(self.queue, &[submit], slot.copy_fence)?;

        if let Some(forward) = &self.forward {
            forward.present(&self.device, &slot, index, self.options.extent)?;
        }
        self.pump.notify_submitted(index);
        Ok(())
    }

    /// Tears the swapchain down: wakes the worker, waits for it to drain
    /// every pending frame through the sink, then releases all driver
    /// resources.
    ///
    /// # Safety
    ///
    /// No thread may use the swapchain afterwards; the borrowed device and
    /// queue must still be alive.
    pub unsafe fn destroy(&mut self) {
        self.pump.shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        for index in 0..self.pump.slot_count() {
            destroy_slot(&self.device, &self.pump.slot(index));
        }
        if let Some(forward) = self.forward.take() {
            forward.destroy(&self.device);
        }
        // Command buffers are freed along with the pool.
        self.device.destroy_command_pool(self.command_pool, None);
    }
}

struct ConstructGuard<'d> {
    device: &'d Device,
    command_pool: vk::CommandPool,
    slots: Vec<ImageSlot>,
    armed: bool,
}

impl Drop for ConstructGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        unsafe {
            for slot in &self.slots {
                destroy_slot(self.device, slot);
            }
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Partially constructed slot; releases whatever it holds unless defused.
struct PartialSlot<'d> {
    device: &'d Device,
    image: vk::Image,
    image_memory: vk::DeviceMemory,
    staging: vk::Buffer,
    staging_memory: vk::DeviceMemory,
    mapped: bool,
    copy_fence: vk::Fence,
    copy_done: vk::Semaphore,
    present_ready: vk::Semaphore,
    armed: bool,
}

impl<'d> PartialSlot<'d> {
    fn new(device: &'d Device) -> Self {
        Self {
            device,
            image: vk::Image::null(),
            image_memory: vk::DeviceMemory::null(),
            staging: vk::Buffer::null(),
            staging_memory: vk::DeviceMemory::null(),
            mapped: false,
            copy_fence: vk::Fence::null(),
            copy_done: vk::Semaphore::null(),
            present_ready: vk::Semaphore::null(),
            armed: true,
        }
    }
}

impl Drop for PartialSlot<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        unsafe {
            if !self.copy_fence.is_null() {
                self.device.destroy_fence(self.copy_fence, None);
            }
            if !self.copy_done.is_null() {
                self.device.destroy_semaphore(self.copy_done, None);
            }
            if !self.present_ready.is_null() {
                self.device.destroy_semaphore(self.present_ready, None);
            }
            if self.mapped {
                self.device.unmap_memory(self.staging_memory);
            }
            if !self.staging.is_null() {
                self.device.destroy_buffer(self.staging, None);
            }
            if !self.staging_memory.is_null() {
                self.device.free_memory(self.staging_memory, None);
            }
            if !self.image.is_null() {
                self.device.destroy_image(self.image, None);
            }
            if !self.image_memory.is_null() {
                self.device.free_memory(self.image_memory, None);
            }
        }
    }
}

unsafe fn create_image_slot(
    device: &Device,
    memory: &vk::PhysicalDeviceMemoryProperties,
    command_pool: vk::CommandPool,
    options: &SwapchainOptions,
    image_size: u64,
) -> Result<ImageSlot> {
    let mut partial = PartialSlot::new(device);

    let info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::_2D)
        .extent(vk::Extent3D {
            width: options.extent.width,
            height: options.extent.height,
            depth: 1,
        })
        .array_layers(1)
        .mip_levels(1)
        .format(options.format)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
        )
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .samples(vk::SampleCountFlags::_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    partial.image = device.create_image(&info, None)?;

    let requirements = device.get_image_memory_requirements(partial.image);
    let info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index(
            memory,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            requirements,
        )?);
    partial.image_memory = device.allocate_memory(&info, None)?;
    device.bind_image_memory(partial.image, partial.image_memory, 0)?;

    let buffer_info = vk::BufferCreateInfo::builder()
        .size(image_size)
        .usage(vk::BufferUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    partial.staging = device.create_buffer(&buffer_info, None)?;

    let requirements = device.get_buffer_memory_requirements(partial.staging);
    let info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index(
            memory,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            requirements,
        )?);
    partial.staging_memory = device.allocate_memory(&info, None)?;
    device.bind_buffer_memory(partial.staging, partial.staging_memory, 0)?;

    // Mapped once for the life of the slot; the worker reads it after every
    // copy-fence signal.
    let mapped = device.map_memory(partial.staging_memory, 0, image_size, vk::MemoryMapFlags::empty())?
        as *const u8;
    partial.mapped = true;

    partial.copy_fence = device.create_fence(&vk::FenceCreateInfo::builder(), None)?;
    partial.copy_done = device.create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)?;
    partial.present_ready = device.create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)?;

    let info = vk::CommandBufferAllocateInfo::builder()
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_pool(command_pool)
        .command_buffer_count(1);
    let commands = device.allocate_command_buffers(&info)?[0];
    record_copy_commands(device, commands, partial.image, partial.staging, options.extent)?;

    partial.armed = false;
    Ok(ImageSlot {
        image: partial.image,
        image_memory: partial.image_memory,
        staging: partial.staging,
        staging_memory: partial.staging_memory,
        mapped,
        copy_fence: partial.copy_fence,
        commands,
        copy_done: partial.copy_done,
        present_ready: partial.present_ready,
    })
}

/// Records the reusable copy for one slot: transition the image to a
/// transfer source, copy it into the staging buffer, transition it back to
/// the presentable layout.
unsafe fn record_copy_commands(
    device: &Device,
    commands: vk::CommandBuffer,
    image: vk::Image,
    staging: vk::Buffer,
    extent: vk::Extent2D,
) -> Result<()> {
    device.begin_command_buffer(commands, &vk::CommandBufferBeginInfo::builder())?;

    let subresource_range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };

    let to_transfer = vk::ImageMemoryBarrier::builder()
        .image(image)
        .old_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .subresource_range(subresource_range)
        .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::MEMORY_READ)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ);
    device.cmd_pipeline_barrier(
        commands,
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        vk::PipelineStageFlags::TRANSFER,
        vk::DependencyFlags::empty(),
        &[] as &[vk::MemoryBarrier],
        &[] as &[vk::BufferMemoryBarrier],
        &[to_transfer],
    );

    let subresource = vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };
    let region = vk::BufferImageCopy::builder()
        .buffer_offset(0)
        // Zero row length and image height mean tightly packed rows.
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(subresource)
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        });
    device.cmd_copy_image_to_buffer(
        commands,
        image,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        staging,
        &[region],
    );

    let back = vk::ImageMemoryBarrier::builder()
        .image(image)
        .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .subresource_range(subresource_range)
        .src_access_mask(vk::AccessFlags::TRANSFER_READ)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ);
    device.cmd_pipeline_barrier(
        commands,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        vk::DependencyFlags::empty(),
        &[] as &[vk::MemoryBarrier],
        &[] as &[vk::BufferMemoryBarrier],
        &[back],
    );

    device.end_command_buffer(commands)?;
    Ok(())
}

unsafe fn destroy_slot(device: &Device, slot: &ImageSlot) {
    device.destroy_fence(slot.copy_fence, None);
    device.destroy_semaphore(slot.copy_done, None);
    device.destroy_semaphore(slot.present_ready, None);
    device.unmap_memory(slot.staging_memory);
    device.destroy_buffer(slot.staging, None);
    device.free_memory(slot.staging_memory, None);
    device.destroy_image(slot.image, None);
    device.free_memory(slot.image_memory, None);
}

/// The per-slot step of the worker thread: wait for the copy, hand the
/// staging bytes to the sink, report failures as an empty frame.
fn frame_worker(
    device: Device,
    sink: Arc<Mutex<Option<FrameSink>>>,
    byte_len: usize,
    fence_timeout_ns: u64,
) -> impl FnMut(u32, &ImageSlot) + Send + 'static {
    move |_index, slot| {
        let ok = unsafe { wait_and_reset(&device, slot.copy_fence, fence_timeout_ns) };
        let bytes: &[u8] = if ok {
            // Host-coherent memory, mapped for the life of the slot; the
            // fence orders the device writes before this read.
            unsafe { slice::from_raw_parts(slot.mapped, byte_len) }
        } else {
            &[]
        };
        if let Some(sink) = sink.lock().as_mut() {
            sink(bytes);
        }
    }
}

/// Waits for a slot's copy fence and readies it for the next submission.
/// Failures — timeout or device loss — are reported as a failed frame, not
/// as an error: the slot still has to return to the free list.
unsafe fn wait_and_reset(device: &Device, fence: vk::Fence, timeout_ns: u64) -> bool {
    match device.wait_for_fences(&[fence], true, timeout_ns) {
        Ok(vk::SuccessCode::TIMEOUT) => {
            warn!("copy fence not signalled within {timeout_ns}ns; dropping frame");
            false
        }
        Ok(_) => match device.reset_fences(&[fence]) {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to reset copy fence: {err}");
                false
            }
        },
        Err(err) => {
            warn!("copy fence wait failed: {err}");
            false
        }
    }
}

/// Returns a memory type index for memory that satisfies the given
/// requirements and has the given properties.
fn memory_type_index(
    memory: &vk::PhysicalDeviceMemoryProperties,
    properties: vk::MemoryPropertyFlags,
    requirements: vk::MemoryRequirements,
) -> Result<u32> {
    (0..memory.memory_type_count)
        .find(|i| {
            let suitable = (requirements.memory_type_bits & (1 << i)) != 0;
            let memory_type = memory.memory_types[*i as usize];
            suitable && memory_type.property_flags.contains(properties)
        })
        .ok_or_else(|| anyhow!("Failed to find suitable memory type."))
}

/// Bytes of one full-resolution frame in `format`.
fn image_byte_size(format: vk::Format, extent: vk::Extent2D) -> Result<u64> {
    let texel = texel_size(format)
        .ok_or_else(|| anyhow!("unsupported swapchain format {:?}", format))?;
    Ok(texel * extent.width as u64 * extent.height as u64)
}

fn texel_size(format: vk::Format) -> Option<u64> {
    match format {
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A8B8G8R8_UNORM_PACK32
        | vk::Format::A8B8G8R8_SRGB_PACK32
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::A2R10G10B10_UNORM_PACK32 => Some(4),
        vk::Format::R5G6B5_UNORM_PACK16
        | vk::Format::B5G6R5_UNORM_PACK16
        | vk::Format::R5G5B5A1_UNORM_PACK16
        | vk::Format::A1R5G5B5_UNORM_PACK16
        | vk::Format::R4G4B4A4_UNORM_PACK16 => Some(2),
        vk::Format::R8G8B8_UNORM | vk::Format::R8G8B8_SRGB | vk::Format::B8G8R8_UNORM => Some(3),
        vk::Format::R16G16B16A16_SFLOAT => Some(8),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_follows_format_and_extent() {
        let extent = vk::Extent2D { width: 1024, height: 768 };
        assert_eq!(
            image_byte_size(vk::Format::B8G8R8A8_UNORM, extent).unwrap(),
            1024 * 768 * 4
        );
        assert_eq!(
            image_byte_size(vk::Format::R5G6B5_UNORM_PACK16, extent).unwrap(),
            1024 * 768 * 2
        );
        assert_eq!(
            image_byte_size(vk::Format::R16G16B16A16_SFLOAT, extent).unwrap(),
            1024 * 768 * 8
        );
    }

    #[test]
    fn compressed_formats_are_rejected() {
        let extent = vk::Extent2D { width: 16, height: 16 };
        assert!(image_byte_size(vk::Format::BC1_RGB_UNORM_BLOCK, extent).is_err());
        assert!(image_byte_size(vk::Format::D32_SFLOAT, extent).is_err());
    }

    #[test]
    fn default_options_are_display_free() {
        let options = SwapchainOptions::default();
        assert_eq!(options.image_count, 3);
        assert!(!options.create_new_images);
        assert!(options.base.is_none());
        assert_eq!(options.pending_timeout, Duration::from_millis(10));
    }
}
