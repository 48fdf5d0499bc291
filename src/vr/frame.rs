use super::{
    FrameState, ImageHandle, ProjectionLayer, ProjectionView, SwapchainInfo, View, VrError,
    VrResult, XrRuntime,
};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Frames per measured-framerate window.
pub const REFRESH_WINDOW_FRAMES: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct RefreshReport {
    pub missed_frames: u32,
    pub total_rendered_frames: u32,
    pub expected_framerate: f32,
    pub measured_framerate: f32,
    #[serde(skip)]
    pub window_start: Option<Instant>,
}

/// Double-buffered refresh statistics: one report accumulates while the last
/// finalized window stays readable.
#[derive(Debug)]
pub struct RefreshTracker {
    current: RefreshReport,
    latest: RefreshReport,
}

impl Default for RefreshTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshTracker {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Opens the first window at `wall`, the same way a closed window reopens.
    pub fn starting_at(wall: Instant) -> Self {
        Self {
            current: RefreshReport {
                window_start: Some(wall),
                ..RefreshReport::default()
            },
            latest: RefreshReport::default(),
        }
    }

    /// Accounts one submitted frame. Returns the finalized report when the window closes.
    pub fn record(
        &mut self,
        predicted_display_time: i64,
        predicted_display_period: i64,
        now: i64,
        wall: Instant,
    ) -> Option<RefreshReport> {
        let report = &mut self.current;
        if predicted_display_time < now {
            report.missed_frames += 1;
        }
        report.total_rendered_frames += 1;
        if predicted_display_period > 0 {
            report.expected_framerate = 1.0e9 / predicted_display_period as f32;
        }

        if report.total_rendered_frames < REFRESH_WINDOW_FRAMES {
            return None;
        }

        let elapsed_ms = report
            .window_start
            .map(|start| wall.saturating_duration_since(start).as_millis())
            .unwrap_or(0);
        report.measured_framerate = if elapsed_ms == 0 {
            0.0
        } else {
            (REFRESH_WINDOW_FRAMES as f32 * 1000.0) / elapsed_ms as f32
        };

        let finished = *report;
        self.latest = finished;
        self.current = RefreshReport {
            window_start: Some(wall),
            ..RefreshReport::default()
        };
        log::debug!(
            "[xr] refresh window: {:.1} fps measured, {:.1} expected, {} missed",
            finished.measured_framerate,
            finished.expected_framerate,
            finished.missed_frames
        );
        Some(finished)
    }

    /// Last finalized window.
    pub fn latest(&self) -> RefreshReport {
        self.latest
    }

    /// Window in progress.
    pub fn current(&self) -> RefreshReport {
        self.current
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Swapchain image acquired from the runtime and not yet released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeldImage {
    pub index: usize,
    pub waited: bool,
}

/// Everything the scheduler tracks for one view.
#[derive(Debug, Clone)]
pub struct ViewSlot {
    pub swapchain: SwapchainInfo,
    pub view: View,
    /// Image an aborted frame left acquired; the next frame reuses it.
    pub held: Option<HeldImage>,
    /// The swapchain has released at least one image.
    pub has_released: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameSubmission {
    /// Views freshly rendered this frame.
    pub rendered_views: usize,
    pub view_count: usize,
    /// An acquire, wait, render or release failure cut the frame short.
    pub partial: bool,
    /// False when the frame was submitted empty because rendering was not expected.
    pub rendered: bool,
    /// A projection layer with every view went to the compositor.
    pub layer_submitted: bool,
}

impl FrameSubmission {
    fn empty(view_count: usize) -> Self {
        Self {
            view_count,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct FrameScheduler {
    frame_state: FrameState,
    slots: Vec<ViewSlot>,
    refresh: RefreshTracker,
    image_wait_timeout: Duration,
}

impl FrameScheduler {
    pub fn new(image_wait_timeout: Duration) -> Self {
        Self {
            frame_state: FrameState::default(),
            slots: Vec::new(),
            refresh: RefreshTracker::new(),
            image_wait_timeout,
        }
    }

    pub fn configure(&mut self, swapchains: Vec<SwapchainInfo>) {
        self.slots = swapchains
            .into_iter()
            .map(|swapchain| ViewSlot {
                swapchain,
                view: View::default(),
                held: None,
                has_released: false,
            })
            .collect();
        self.frame_state = FrameState::default();
    }

    /// Drops per-session state; refresh statistics survive.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.frame_state = FrameState::default();
    }

    pub fn frame_state(&self) -> FrameState {
        self.frame_state
    }

    pub fn should_render(&self) -> bool {
        self.frame_state.should_render
    }

    pub fn slots(&self) -> &[ViewSlot] {
        &self.slots
    }

    pub fn slot(&self, view_index: usize) -> Option<&ViewSlot> {
        self.slots.get(view_index)
    }

    pub fn view_count(&self) -> usize {
        self.slots.len()
    }

    pub fn refresh_report(&self) -> RefreshReport {
        self.refresh.latest()
    }

    pub fn refresh_tracker(&self) -> &RefreshTracker {
        &self.refresh
    }

    /// Blocks on the runtime for the next frame timing, then refreshes every view.
    pub fn wait_next_frame<R: XrRuntime>(&mut self, runtime: &mut R) -> VrResult<FrameState> {
        // A failed wait must not leave a stale should_render behind.
        self.frame_state = FrameState::default();
        let state = runtime.wait_frame()?;
        self.frame_state = state;

        // Timing stays so the frame can still be ended; rendering is off.
        let views = match runtime.locate_views(state.predicted_display_time) {
            Ok(views) if views.len() == self.slots.len() => views,
            Ok(views) => {
                self.frame_state.should_render = false;
                return Err(VrError::ViewConfiguration(views.len()));
            }
            Err(err) => {
                self.frame_state.should_render = false;
                return Err(err);
            }
        };
        for (slot, view) in self.slots.iter_mut().zip(views) {
            slot.view = view;
        }
        Ok(state)
    }

    /// Balances begin/end without rendering anything.
    pub fn submit_empty<R: XrRuntime>(&mut self, runtime: &mut R) -> VrResult<FrameSubmission> {
        runtime.begin_frame()?;
        runtime.end_frame(self.frame_state.predicted_display_time, None)?;
        Ok(FrameSubmission::empty(self.slots.len()))
    }

    /// Renders every view through `render` in index order and ends the frame.
    ///
    /// `render` returns false when it could not draw into the image; the view is
    /// then released and the remaining views are skipped. The projection layer
    /// always carries every view, so an aborted view shows the last image its
    /// swapchain released.
    pub fn submit_frame<R, F>(&mut self, runtime: &mut R, mut render: F) -> VrResult<FrameSubmission>
    where
        R: XrRuntime,
        F: FnMut(usize, ImageHandle) -> bool,
    {
        if !self.should_render() {
            return self.submit_empty(runtime);
        }

        runtime.begin_frame()?;

        let mut rendered_views = 0;
        let mut partial = false;
        for view_index in 0..self.slots.len() {
            match self.render_view(runtime, view_index, &mut render) {
                Ok(()) => rendered_views += 1,
                Err(err) => {
                    log::warn!("[xr] view {view_index} aborted mid-frame: {err}");
                    partial = true;
                    break;
                }
            }
        }

        self.update_refresh_report(runtime);

        let layer = self.compose_layer();
        runtime.end_frame(self.frame_state.predicted_display_time, layer.as_ref())?;

        Ok(FrameSubmission {
            rendered_views,
            view_count: self.slots.len(),
            partial,
            rendered: true,
            layer_submitted: layer.is_some(),
        })
    }

    fn render_view<R, F>(&mut self, runtime: &mut R, view_index: usize, render: &mut F) -> VrResult<()>
    where
        R: XrRuntime,
        F: FnMut(usize, ImageHandle) -> bool,
    {
        let timeout = self.image_wait_timeout;
        let Some(slot) = self.slots.get_mut(view_index) else {
            return Err(VrError::ViewConfiguration(view_index));
        };

        // An image left over from an aborted frame is still ours; finish it first.
        let mut held = match slot.held {
            Some(held) => held,
            None => HeldImage {
                index: runtime.acquire_image(view_index)?,
                waited: false,
            },
        };
        slot.held = Some(held);

        if !held.waited {
            runtime.wait_image(view_index, timeout)?;
            held.waited = true;
            slot.held = Some(held);
        }

        let outcome = match slot.swapchain.images.get(held.index).copied() {
            Some(image) => {
                if render(view_index, image) {
                    Ok(())
                } else {
                    Err(VrError::ViewNotRendered(view_index))
                }
            }
            None => Err(VrError::InvalidImage {
                view: view_index,
                image: held.index,
            }),
        };

        runtime.release_image(view_index)?;
        slot.held = None;
        slot.has_released = true;
        outcome
    }

    /// One projection view per slot, or nothing while a swapchain has never
    /// released an image the compositor could show.
    fn compose_layer(&self) -> Option<ProjectionLayer> {
        if let Some(index) = self.slots.iter().position(|slot| !slot.has_released) {
            log::debug!("[xr] view {index} has no released image yet; submitting no layer");
            return None;
        }
        let views = self
            .slots
            .iter()
            .enumerate()
            .map(|(view_index, slot)| ProjectionView {
                view_index,
                pose: slot.view.pose,
                fov: slot.view.fov,
                extent: slot.swapchain.extent,
            })
            .collect();
        Some(ProjectionLayer { views })
    }

    fn update_refresh_report<R: XrRuntime>(&mut self, runtime: &R) {
        let now = match runtime.now() {
            Ok(now) => now,
            Err(err) => {
                log::warn!("[xr] could not read runtime clock: {err}");
                return;
            }
        };
        let state = self.frame_state;
        self.refresh.record(
            state.predicted_display_time,
            state.predicted_display_period,
            now,
            Instant::now(),
        );
    }
}
