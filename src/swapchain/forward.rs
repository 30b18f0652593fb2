//! Forwarding onto a real display swapchain.
//!
//! When enabled, every presented frame is additionally blitted onto an image
//! of a caller-owned `VkSwapchainKHR` and presented there, so the traced
//! application still shows up on screen while the capture pipeline owns the
//! frame timing.

use anyhow::{anyhow, Result};
use log::warn;
use parking_lot::Mutex;
use vk::KhrSwapchainExtension;
use vulkanalia::prelude::v1_0::*;

use super::ImageSlot;

/// A real swapchain to mirror frames onto. All handles are borrowed; the
/// caller keeps them alive for the lifetime of the virtual swapchain and
/// destroys them afterwards.
#[derive(Debug)]
pub struct BaseTarget {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub extent: vk::Extent2D,
    /// Queue used for the blit submission and the real present.
    pub queue: vk::Queue,
}

/// Per-slot forwarding state, allocated on first use so dynamically grown
/// slots can forward too.
#[derive(Clone, Copy)]
struct ForwardSlot {
    commands: vk::CommandBuffer,
    acquire: vk::Semaphore,
    /// Signalled by the blit submission. `commands` must not be re-recorded
    /// until it is; created signalled so the first present sails through.
    fence: vk::Fence,
}

pub(crate) struct ForwardTarget {
    base: BaseTarget,
    command_pool: vk::CommandPool,
    slots: Mutex<Vec<ForwardSlot>>,
}

impl ForwardTarget {
    pub(crate) fn new(command_pool: vk::CommandPool, base: BaseTarget) -> Self {
        ForwardTarget {
            base,
            command_pool,
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Blit `slot`'s image onto the next base-swapchain image and present it
    /// there. The blit waits for the slot's copy submission and the base
    /// acquire; the real present waits for the blit.
    pub(crate) unsafe fn present(
        &self,
        device: &Device,
        slot: &ImageSlot,
        index: u32,
        src_extent: vk::Extent2D,
    ) -> Result<()> {
        let forward = self.slot_state(device, index)?;

        let (base_index, _) = device.acquire_next_image_khr(
            self.base.swapchain,
            u64::MAX,
            forward.acquire,
            vk::Fence::null(),
        )?;
        let base_image = self.base.images[base_index as usize];

        record_blit(
            device,
            forward.commands,
            slot.image,
            base_image,
            src_extent,
            self.base.extent,
        )?;

        let wait_semaphores = [slot.copy_done, forward.acquire];
        let wait_stages = [
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
        ];
        let command_buffers = [forward.commands];
        let signal_semaphores = [slot.present_ready];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        device.queue_submit(self.base.queue, &[submit], forward.fence)?;

        let wait_semaphores = [slot.present_ready];
        let swapchains = [self.base.swapchain];
        let image_indices = [base_index];
        let present = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        match device.queue_present_khr(self.base.queue, &present) {
            Ok(_) => Ok(()),
            // The mirror is best-effort; a stale base swapchain only costs
            // the on-screen copy, never the capture.
            Err(vk::ErrorCode::OUT_OF_DATE_KHR) => {
                warn!("base swapchain out of date; dropped mirrored frame");
                Ok(())
            }
            Err(err) => Err(anyhow!(err)),
        }
    }

    fn slot_state(&self, device: &Device, index: u32) -> Result<ForwardSlot> {
        let forward = {
            let mut slots = self.slots.lock();
            while slots.len() <= index as usize {
                let info = vk::CommandBufferAllocateInfo::builder()
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_pool(self.command_pool)
                    .command_buffer_count(1);
                let fence_info =
                    vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
                let (commands, acquire, fence) = unsafe {
                    (
                        device.allocate_command_buffers(&info)?[0],
                        device.create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)?,
                        device.create_fence(&fence_info, None)?,
                    )
                };
                slots.push(ForwardSlot { commands, acquire, fence });
            }
            slots[index as usize]
        };
        // The previous blit through this slot may still be executing; its
        // command buffer must leave the pending state before re-recording.
        unsafe {
            device.wait_for_fences(&[forward.fence], true, u64::MAX)?;
            device.reset_fences(&[forward.fence])?;
        }
        Ok(forward)
    }

    /// Releases forwarding resources. Base handles stay with their owner;
    /// command buffers go with the shared pool.
    pub(crate) unsafe fn destroy(&self, device: &Device) {
        let mut slots = self.slots.lock();
        // Let any in-flight blit retire before its fence and semaphore go.
        let fences: Vec<vk::Fence> = slots.iter().map(|slot| slot.fence).collect();
        if !fences.is_empty() {
            if let Err(err) = device.wait_for_fences(&fences, true, u64::MAX) {
                warn!("failed to drain forwarding blits: {err}");
            }
        }
        for slot in slots.drain(..) {
            device.destroy_semaphore(slot.acquire, None);
            device.destroy_fence(slot.fence, None);
        }
    }
}

/// Re-records the blit for one forwarded frame: both images move into
/// transfer layouts, the frame is stretched onto the base image, and both
/// return to presentable layouts.
unsafe fn record_blit(
    device: &Device,
    commands: vk::CommandBuffer,
    source: vk::Image,
    target: vk::Image,
    src_extent: vk::Extent2D,
    dst_extent: vk::Extent2D,
) -> Result<()> {
    let info =
        vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    device.begin_command_buffer(commands, &info)?;

    let subresource_range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };

    let barriers = [
        vk::ImageMemoryBarrier::builder()
            .image(source)
            .old_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(subresource_range)
            .src_access_mask(vk::AccessFlags::MEMORY_READ)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
            .build(),
        vk::ImageMemoryBarrier::builder()
            .image(target)
            // Whatever was on screen is overwritten whole.
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(subresource_range)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .build(),
    ];
    device.cmd_pipeline_barrier(
        commands,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::TRANSFER,
        vk::DependencyFlags::empty(),
        &[] as &[vk::MemoryBarrier],
        &[] as &[vk::BufferMemoryBarrier],
        &barriers,
    );

    let blit = blit_region(src_extent, dst_extent);
    device.cmd_blit_image(
        commands,
        source,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        target,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &[blit],
        vk::Filter::LINEAR,
    );

    let barriers = [
        vk::ImageMemoryBarrier::builder()
            .image(source)
            .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(subresource_range)
            .src_access_mask(vk::AccessFlags::TRANSFER_READ)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ)
            .build(),
        vk::ImageMemoryBarrier::builder()
            .image(target)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(subresource_range)
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ)
            .build(),
    ];
    device.cmd_pipeline_barrier(
        commands,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        vk::DependencyFlags::empty(),
        &[] as &[vk::MemoryBarrier],
        &[] as &[vk::BufferMemoryBarrier],
        &barriers,
    );

    device.end_command_buffer(commands)?;
    Ok(())
}

/// Stretch the whole source extent onto the whole target extent.
fn blit_region(src_extent: vk::Extent2D, dst_extent: vk::Extent2D) -> vk::ImageBlit {
    let subresource = vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };
    vk::ImageBlit {
        src_subresource: subresource,
        src_offsets: [
            vk::Offset3D { x: 0, y: 0, z: 0 },
            vk::Offset3D {
                x: src_extent.width as i32,
                y: src_extent.height as i32,
                z: 1,
            },
        ],
        dst_subresource: subresource,
        dst_offsets: [
            vk::Offset3D { x: 0, y: 0, z: 0 },
            vk::Offset3D {
                x: dst_extent.width as i32,
                y: dst_extent.height as i32,
                z: 1,
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blit_stretches_full_source_onto_full_target() {
        let blit = blit_region(
            vk::Extent2D { width: 640, height: 480 },
            vk::Extent2D { width: 1920, height: 1080 },
        );
        assert_eq!(blit.src_offsets[0], vk::Offset3D { x: 0, y: 0, z: 0 });
        assert_eq!(blit.src_offsets[1], vk::Offset3D { x: 640, y: 480, z: 1 });
        assert_eq!(blit.dst_offsets[0], vk::Offset3D { x: 0, y: 0, z: 0 });
        assert_eq!(blit.dst_offsets[1], vk::Offset3D { x: 1920, y: 1080, z: 1 });
    }

    #[test]
    fn blit_touches_one_color_layer_on_both_sides() {
        let extent = vk::Extent2D { width: 16, height: 16 };
        let blit = blit_region(extent, extent);
        for subresource in [blit.src_subresource, blit.dst_subresource] {
            assert_eq!(subresource.aspect_mask, vk::ImageAspectFlags::COLOR);
            assert_eq!(subresource.mip_level, 0);
            assert_eq!(subresource.base_array_layer, 0);
            assert_eq!(subresource.layer_count, 1);
        }
    }
}
