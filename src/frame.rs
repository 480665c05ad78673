// Frame orchestration
//
// Drives one frame slot per iteration through
//   Idle -> Waiting -> Acquiring -> Recording -> Submitted -> Presenting -> Idle
// and decides when the surface has to be rebuilt. Everything that touches the
// GPU goes through FrameBackend, so the protocol itself can run against a
// scripted backend in tests.

use anyhow::Result;
use ash::vk;
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::backend::swapchain::{
    wait_for_drawable_extent, AcquireOutcome, ExtentSource, SurfaceStatus,
};

/// The GPU-facing half of a frame. Slots are `0..slot_count()`.
pub trait FrameBackend {
    fn slot_count(&self) -> usize;

    /// Block until the slot's previous submission has retired.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    /// Acquire a presentable image, signaling the slot's image-available
    /// semaphore when it is ready.
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;

    fn update_uniforms(&mut self, slot: usize, elapsed: Duration) -> Result<()>;

    fn reset_slot_fence(&mut self, slot: usize) -> Result<()>;

    /// Reset and re-record the slot's command buffer against `image_index`.
    fn record_commands(&mut self, slot: usize, image_index: u32) -> Result<()>;

    /// Submit the slot's command buffer, signaling its fence on completion.
    fn submit(&mut self, slot: usize) -> Result<()>;

    fn present(&mut self, slot: usize, image_index: u32) -> Result<SurfaceStatus>;

    /// Recreate every extent-dependent resource for a non-zero `extent`.
    /// The device is idle when this is called.
    fn rebuild_surface(&mut self, extent: vk::Extent2D) -> Result<()>;

    fn wait_idle(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Waiting,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
}

/// Set from the window's resize callback, consumed once per frame.
#[derive(Debug, Clone, Default)]
pub struct ResizeFlag(Rc<Cell<bool>>);

impl ResizeFlag {
    pub fn raise(&self) {
        self.0.set(true);
    }

    /// Read and clear.
    pub fn take(&self) -> bool {
        self.0.replace(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame reached the display.
    Presented { rebuilt: bool },
    /// The surface was out of date; nothing was drawn and the surface was
    /// rebuilt (unless the window closed while minimized).
    Skipped,
}

pub struct FrameOrchestrator {
    slots: Vec<SlotState>,
    current: usize,
    resize: ResizeFlag,
    started: Instant,
    #[cfg(test)]
    transitions: Vec<(usize, SlotState)>,
}

impl FrameOrchestrator {
    pub fn new<B: FrameBackend>(backend: &B) -> Self {
        let count = backend.slot_count();
        log::debug!("Frame orchestrator with {} slots", count);
        Self {
            slots: vec![SlotState::Idle; count],
            current: 0,
            resize: ResizeFlag::default(),
            started: Instant::now(),
            #[cfg(test)]
            transitions: Vec::new(),
        }
    }

    /// Handle for the window's resize callback
    pub fn resize_flag(&self) -> ResizeFlag {
        self.resize.clone()
    }

    #[cfg(test)]
    pub fn current_slot(&self) -> usize {
        self.current
    }

    #[cfg(test)]
    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots[slot]
    }

    fn enter(&mut self, state: SlotState) {
        log::trace!("slot {}: {:?} -> {:?}", self.current, self.slots[self.current], state);
        self.slots[self.current] = state;
        #[cfg(test)]
        self.transitions.push((self.current, state));
    }

    pub fn draw_frame<B, W>(&mut self, backend: &mut B, window: &mut W) -> Result<FrameOutcome>
    where
        B: FrameBackend,
        W: ExtentSource,
    {
        let slot = self.current;

        self.enter(SlotState::Waiting);
        backend.wait_for_slot(slot)?;

        self.enter(SlotState::Acquiring);
        let (image_index, acquired_suboptimal) = match backend.acquire_image(slot)? {
            AcquireOutcome::Ready {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                // The fence stays signaled, so the next wait on this slot
                // returns at once.
                self.enter(SlotState::Idle);
                self.resize.take();
                log::debug!("Swapchain out of date on acquire, rebuilding");
                Self::rebuild(backend, window)?;
                return Ok(FrameOutcome::Skipped);
            }
        };

        backend.update_uniforms(slot, self.started.elapsed())?;
        // Only now is the frame certain to be submitted
        backend.reset_slot_fence(slot)?;

        self.enter(SlotState::Recording);
        backend.record_commands(slot, image_index)?;

        backend.submit(slot)?;
        self.enter(SlotState::Submitted);

        self.enter(SlotState::Presenting);
        let status = backend.present(slot, image_index)?;
        let resized = self.resize.take();

        let rebuilt = if acquired_suboptimal || resized || status != SurfaceStatus::Optimal {
            log::debug!(
                "Rebuilding surface (present: {:?}, suboptimal acquire: {}, resized: {})",
                status,
                acquired_suboptimal,
                resized
            );
            Self::rebuild(backend, window)?
        } else {
            false
        };

        self.enter(SlotState::Idle);
        self.current = (self.current + 1) % self.slots.len();

        Ok(FrameOutcome::Presented { rebuilt })
    }

    /// Returns false if the window closed before it had a drawable size.
    fn rebuild<B, W>(backend: &mut B, window: &mut W) -> Result<bool>
    where
        B: FrameBackend,
        W: ExtentSource,
    {
        let Some(extent) = wait_for_drawable_extent(window) else {
            return Ok(false);
        };
        backend.wait_idle()?;
        backend.rebuild_surface(extent)?;
        Ok(true)
    }

    /// Drain every slot before anything is destroyed.
    pub fn shutdown<B: FrameBackend>(&mut self, backend: &mut B) -> Result<()> {
        log::info!("Waiting for in-flight frames to finish");
        backend.wait_idle()?;
        self.slots.fill(SlotState::Idle);
        Ok(())
    }
}
