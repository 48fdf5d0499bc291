//! In-process runtime for tests and headless runs.
//!
//! By default it walks the session through the usual lifecycle on its own:
//! creating a session queues IDLE then READY, the first frame submitted after
//! begin queues SYNCHRONIZED, VISIBLE and FOCUSED, an exit request queues
//! STOPPING, and ending the session queues IDLE then EXITING. Tests that want
//! to drive the lifecycle by hand use [`SimulatedRuntime::with_manual_lifecycle`]
//! and [`SimulatedRuntime::push_event`].

use super::{
    AppInfo, Extent, Fov, FrameState, ImageHandle, Pose, ProjectionLayer, ReferenceSpaceType,
    RuntimeEvent, RuntimeInfo, RuntimeSessionState, STEREO_VIEW_COUNT, SwapchainInfo,
    SwapchainRequest, View, ViewConfiguration, VrError, VrResult, XrRuntime,
};
use glam::{Quat, Vec3};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

pub const SIMULATED_GRAPHICS_EXTENSION: &str = "XR_KHR_opengl_enable";
pub const DEFAULT_DISPLAY_PERIOD_NS: i64 = 11_111_111;
pub const SIMULATED_IPD_M: f32 = 0.063;
pub const SIMULATED_IMAGES_PER_SWAPCHAIN: usize = 3;
/// Format codes offered by the simulated compositor, most preferred first.
pub const SIMULATED_FORMATS: [i64; 2] = [0x8C43, 0x8058];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeCall {
    EnumerateExtensions,
    CreateInstance,
    SelectHmdSystem,
    ViewConfiguration,
    CheckGraphicsRequirements,
    CreateSession,
    CreateReferenceSpace,
    SwapchainFormats,
    CreateSwapchain,
    PollEvent,
    BeginSession,
    EndSession,
    RequestExit,
    DestroySession,
    DestroyInstance,
    WaitFrame,
    LocateViews,
    BeginFrame,
    AcquireImage,
    WaitImage,
    ReleaseImage,
    EndFrame,
}

impl RuntimeCall {
    pub fn name(self) -> &'static str {
        match self {
            RuntimeCall::EnumerateExtensions => "enumerate_extensions",
            RuntimeCall::CreateInstance => "create_instance",
            RuntimeCall::SelectHmdSystem => "select_hmd_system",
            RuntimeCall::ViewConfiguration => "view_configuration",
            RuntimeCall::CheckGraphicsRequirements => "check_graphics_requirements",
            RuntimeCall::CreateSession => "create_session",
            RuntimeCall::CreateReferenceSpace => "create_reference_space",
            RuntimeCall::SwapchainFormats => "swapchain_formats",
            RuntimeCall::CreateSwapchain => "create_swapchain",
            RuntimeCall::PollEvent => "poll_event",
            RuntimeCall::BeginSession => "begin_session",
            RuntimeCall::EndSession => "end_session",
            RuntimeCall::RequestExit => "request_exit",
            RuntimeCall::DestroySession => "destroy_session",
            RuntimeCall::DestroyInstance => "destroy_instance",
            RuntimeCall::WaitFrame => "wait_frame",
            RuntimeCall::LocateViews => "locate_views",
            RuntimeCall::BeginFrame => "begin_frame",
            RuntimeCall::AcquireImage => "acquire_image",
            RuntimeCall::WaitImage => "wait_image",
            RuntimeCall::ReleaseImage => "release_image",
            RuntimeCall::EndFrame => "end_frame",
        }
    }
}

#[derive(Debug)]
struct SimulatedSwapchain {
    info: SwapchainInfo,
    next: usize,
    acquired: Option<usize>,
    waited: bool,
    released_once: bool,
}

#[derive(Debug)]
pub struct SimulatedRuntime {
    extensions: Vec<String>,
    recommended: Extent,
    view_count: usize,
    display_period: i64,
    lateness: i64,
    clock: i64,
    should_render: bool,
    manual_lifecycle: bool,
    head: Pose,

    events: VecDeque<RuntimeEvent>,
    /// Successful calls still allowed before the injected failure fires.
    pending_failures: HashMap<RuntimeCall, usize>,
    calls: Vec<RuntimeCall>,

    instance_alive: bool,
    system_selected: bool,
    session_alive: bool,
    begun: bool,
    awaiting_first_frame: bool,
    frame_open: bool,
    reference_space: Option<ReferenceSpaceType>,
    swapchains: Vec<SimulatedSwapchain>,
    next_image_id: u64,
    frames_ended: u32,
    last_layer: Option<ProjectionLayer>,
    last_wait_timeout: Option<Duration>,
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self {
            extensions: vec![
                SIMULATED_GRAPHICS_EXTENSION.to_string(),
                "XR_EXT_debug_utils".to_string(),
            ],
            recommended: Extent::new(1832, 1920),
            view_count: STEREO_VIEW_COUNT,
            display_period: DEFAULT_DISPLAY_PERIOD_NS,
            lateness: 0,
            clock: 0,
            should_render: true,
            manual_lifecycle: false,
            head: Pose {
                orientation: Quat::IDENTITY,
                position: Vec3::new(0.0, 1.6, 0.0),
            },
            events: VecDeque::new(),
            pending_failures: HashMap::new(),
            calls: Vec::new(),
            instance_alive: false,
            system_selected: false,
            session_alive: false,
            begun: false,
            awaiting_first_frame: false,
            frame_open: false,
            reference_space: None,
            swapchains: Vec::new(),
            next_image_id: 1,
            frames_ended: 0,
            last_layer: None,
            last_wait_timeout: None,
        }
    }

    pub fn with_recommended_resolution(mut self, extent: Extent) -> Self {
        self.recommended = extent;
        self
    }

    pub fn with_display_period(mut self, period_ns: i64) -> Self {
        self.display_period = period_ns;
        self
    }

    pub fn without_extension(mut self, name: &str) -> Self {
        self.extensions.retain(|ext| ext != name);
        self
    }

    pub fn with_view_count(mut self, count: usize) -> Self {
        self.view_count = count;
        self
    }

    /// Disables the self-driven lifecycle; state changes arrive only via [`Self::push_event`].
    pub fn with_manual_lifecycle(mut self) -> Self {
        self.manual_lifecycle = true;
        self
    }

    pub fn push_event(&mut self, event: RuntimeEvent) {
        self.events.push_back(event);
    }

    pub fn push_state(&mut self, state: RuntimeSessionState) {
        self.push_event(RuntimeEvent::SessionStateChanged(state));
    }

    /// Makes the next invocation of `call` fail once.
    pub fn fail_next(&mut self, call: RuntimeCall) {
        self.fail_after(call, 0);
    }

    /// Lets `call` succeed `successes` more times, then fails it once.
    pub fn fail_after(&mut self, call: RuntimeCall, successes: usize) {
        self.pending_failures.insert(call, successes);
    }

    pub fn set_should_render(&mut self, should_render: bool) {
        self.should_render = should_render;
    }

    /// Predicts display times this many nanoseconds earlier than the period allows.
    pub fn set_frame_lateness(&mut self, lateness_ns: i64) {
        self.lateness = lateness_ns;
    }

    pub fn set_head_pose(&mut self, head: Pose) {
        self.head = head;
    }

    pub fn calls(&self) -> &[RuntimeCall] {
        &self.calls
    }

    pub fn count(&self, call: RuntimeCall) -> usize {
        self.calls.iter().filter(|c| **c == call).count()
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn frames_ended(&self) -> u32 {
        self.frames_ended
    }

    pub fn last_layer(&self) -> Option<&ProjectionLayer> {
        self.last_layer.as_ref()
    }

    /// Index of the image `view_index` has acquired and not released.
    pub fn acquired_image(&self, view_index: usize) -> Option<usize> {
        self.swapchains.get(view_index).and_then(|s| s.acquired)
    }

    pub fn last_wait_timeout(&self) -> Option<Duration> {
        self.last_wait_timeout
    }

    pub fn swapchain_images(&self, view_index: usize) -> Option<&SwapchainInfo> {
        self.swapchains.get(view_index).map(|s| &s.info)
    }

    pub fn reference_space(&self) -> Option<ReferenceSpaceType> {
        self.reference_space
    }

    pub fn is_instance_alive(&self) -> bool {
        self.instance_alive
    }

    pub fn is_session_alive(&self) -> bool {
        self.session_alive
    }

    pub fn is_session_begun(&self) -> bool {
        self.begun
    }

    fn enter(&mut self, call: RuntimeCall) -> VrResult<()> {
        self.calls.push(call);
        match self.pending_failures.get_mut(&call) {
            Some(0) => {
                self.pending_failures.remove(&call);
                Err(VrError::runtime(call.name(), "injected failure"))
            }
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn queue_states(&mut self, states: &[RuntimeSessionState]) {
        if self.manual_lifecycle {
            return;
        }
        for state in states {
            self.push_state(*state);
        }
    }

    fn require_instance(&self, call: RuntimeCall) -> VrResult<()> {
        if self.instance_alive {
            Ok(())
        } else {
            Err(VrError::runtime(call.name(), "XR_ERROR_HANDLE_INVALID"))
        }
    }

    fn require_session(&self, call: RuntimeCall) -> VrResult<()> {
        if self.session_alive {
            Ok(())
        } else {
            Err(VrError::runtime(call.name(), "XR_ERROR_HANDLE_INVALID"))
        }
    }

    fn require_running(&self, call: RuntimeCall) -> VrResult<()> {
        self.require_session(call)?;
        if self.begun {
            Ok(())
        } else {
            Err(VrError::runtime(call.name(), "XR_ERROR_SESSION_NOT_RUNNING"))
        }
    }

    fn swapchain_mut(&mut self, call: RuntimeCall, view_index: usize) -> VrResult<&mut SimulatedSwapchain> {
        self.swapchains
            .get_mut(view_index)
            .ok_or_else(|| VrError::runtime(call.name(), format!("no swapchain for view {view_index}")))
    }

    fn eye_view(&self, view_index: usize) -> View {
        let sign = if view_index == 0 { -1.0 } else { 1.0 };
        let offset = self.head.orientation * Vec3::new(sign * SIMULATED_IPD_M * 0.5, 0.0, 0.0);
        // Nasal side is the narrow one.
        let (angle_left, angle_right) = if view_index == 0 { (-0.90, 0.80) } else { (-0.80, 0.90) };
        View {
            pose: Pose {
                orientation: self.head.orientation,
                position: self.head.position + offset,
            },
            fov: Fov {
                angle_left,
                angle_right,
                angle_up: 0.85,
                angle_down: -0.90,
            },
        }
    }
}

impl XrRuntime for SimulatedRuntime {
    type Binding = ();

    fn label(&self) -> &'static str {
        "simulated"
    }

    fn graphics_extension(&self) -> &'static str {
        SIMULATED_GRAPHICS_EXTENSION
    }

    fn enumerate_extensions(&mut self) -> VrResult<Vec<String>> {
        self.enter(RuntimeCall::EnumerateExtensions)?;
        Ok(self.extensions.clone())
    }

    fn create_instance(&mut self, app: &AppInfo, extensions: &[&str]) -> VrResult<RuntimeInfo> {
        self.enter(RuntimeCall::CreateInstance)?;
        if let Some(missing) = extensions
            .iter()
            .find(|ext| !self.extensions.iter().any(|have| have == *ext))
        {
            return Err(VrError::MissingExtension(missing.to_string()));
        }
        log::debug!("[xr] simulated instance for '{}'", app.application_name);
        self.instance_alive = true;
        Ok(RuntimeInfo {
            name: "Simulated Runtime".to_string(),
            version: "1.0.0".to_string(),
        })
    }

    fn select_hmd_system(&mut self) -> VrResult<()> {
        self.enter(RuntimeCall::SelectHmdSystem)?;
        self.require_instance(RuntimeCall::SelectHmdSystem)?;
        self.system_selected = true;
        Ok(())
    }

    fn view_configuration(&mut self) -> VrResult<Vec<ViewConfiguration>> {
        self.enter(RuntimeCall::ViewConfiguration)?;
        if !self.system_selected {
            return Err(VrError::runtime(
                RuntimeCall::ViewConfiguration.name(),
                "XR_ERROR_SYSTEM_INVALID",
            ));
        }
        let config = ViewConfiguration {
            recommended: self.recommended,
            max: Extent::new(self.recommended.width * 2, self.recommended.height * 2),
            recommended_sample_count: 1,
        };
        Ok(vec![config; self.view_count])
    }

    fn check_graphics_requirements(&mut self) -> VrResult<()> {
        self.enter(RuntimeCall::CheckGraphicsRequirements)?;
        self.require_instance(RuntimeCall::CheckGraphicsRequirements)
    }

    fn create_session(&mut self, _binding: ()) -> VrResult<()> {
        self.enter(RuntimeCall::CreateSession)?;
        self.require_instance(RuntimeCall::CreateSession)?;
        self.session_alive = true;
        self.queue_states(&[RuntimeSessionState::Idle, RuntimeSessionState::Ready]);
        Ok(())
    }

    fn create_reference_space(&mut self, space: ReferenceSpaceType) -> VrResult<()> {
        self.enter(RuntimeCall::CreateReferenceSpace)?;
        self.require_session(RuntimeCall::CreateReferenceSpace)?;
        self.reference_space = Some(space);
        Ok(())
    }

    fn swapchain_formats(&mut self) -> VrResult<Vec<i64>> {
        self.enter(RuntimeCall::SwapchainFormats)?;
        self.require_session(RuntimeCall::SwapchainFormats)?;
        Ok(SIMULATED_FORMATS.to_vec())
    }

    fn create_swapchain(&mut self, view_index: usize, request: &SwapchainRequest) -> VrResult<SwapchainInfo> {
        self.enter(RuntimeCall::CreateSwapchain)?;
        self.require_session(RuntimeCall::CreateSwapchain)?;
        if !SIMULATED_FORMATS.contains(&request.format) {
            return Err(VrError::runtime(
                RuntimeCall::CreateSwapchain.name(),
                "XR_ERROR_SWAPCHAIN_FORMAT_UNSUPPORTED",
            ));
        }
        if view_index != self.swapchains.len() {
            return Err(VrError::runtime(
                RuntimeCall::CreateSwapchain.name(),
                format!("swapchain for view {view_index} created out of order"),
            ));
        }

        let images = (0..SIMULATED_IMAGES_PER_SWAPCHAIN)
            .map(|offset| ImageHandle(self.next_image_id + offset as u64))
            .collect();
        self.next_image_id += SIMULATED_IMAGES_PER_SWAPCHAIN as u64;

        let info = SwapchainInfo {
            images,
            extent: request.extent,
            format: request.format,
        };
        self.swapchains.push(SimulatedSwapchain {
            info: info.clone(),
            next: 0,
            acquired: None,
            waited: false,
            released_once: false,
        });
        Ok(info)
    }

    fn poll_event(&mut self) -> VrResult<Option<RuntimeEvent>> {
        self.enter(RuntimeCall::PollEvent)?;
        self.require_instance(RuntimeCall::PollEvent)?;
        Ok(self.events.pop_front())
    }

    fn begin_session(&mut self) -> VrResult<()> {
        self.enter(RuntimeCall::BeginSession)?;
        self.require_session(RuntimeCall::BeginSession)?;
        if self.begun {
            return Err(VrError::runtime(
                RuntimeCall::BeginSession.name(),
                "XR_ERROR_SESSION_RUNNING",
            ));
        }
        self.begun = true;
        self.awaiting_first_frame = !self.manual_lifecycle;
        Ok(())
    }

    fn end_session(&mut self) -> VrResult<()> {
        self.enter(RuntimeCall::EndSession)?;
        self.require_running(RuntimeCall::EndSession)?;
        self.begun = false;
        self.frame_open = false;
        self.queue_states(&[RuntimeSessionState::Idle, RuntimeSessionState::Exiting]);
        Ok(())
    }

    fn request_exit(&mut self) -> VrResult<()> {
        self.enter(RuntimeCall::RequestExit)?;
        self.require_running(RuntimeCall::RequestExit)?;
        self.queue_states(&[
            RuntimeSessionState::Visible,
            RuntimeSessionState::Synchronized,
            RuntimeSessionState::Stopping,
        ]);
        Ok(())
    }

    fn destroy_session(&mut self) -> VrResult<()> {
        self.enter(RuntimeCall::DestroySession)?;
        self.require_session(RuntimeCall::DestroySession)?;
        self.session_alive = false;
        self.begun = false;
        self.frame_open = false;
        self.reference_space = None;
        self.swapchains.clear();
        Ok(())
    }

    fn destroy_instance(&mut self) -> VrResult<()> {
        self.enter(RuntimeCall::DestroyInstance)?;
        self.require_instance(RuntimeCall::DestroyInstance)?;
        self.instance_alive = false;
        self.system_selected = false;
        self.events.clear();
        Ok(())
    }

    fn wait_frame(&mut self) -> VrResult<FrameState> {
        self.enter(RuntimeCall::WaitFrame)?;
        self.require_running(RuntimeCall::WaitFrame)?;
        self.clock += self.display_period;
        Ok(FrameState {
            predicted_display_time: self.clock + self.display_period - self.lateness,
            predicted_display_period: self.display_period,
            should_render: self.should_render,
        })
    }

    fn locate_views(&mut self, _display_time: i64) -> VrResult<Vec<View>> {
        self.enter(RuntimeCall::LocateViews)?;
        self.require_session(RuntimeCall::LocateViews)?;
        Ok((0..self.view_count).map(|index| self.eye_view(index)).collect())
    }

    fn begin_frame(&mut self) -> VrResult<()> {
        self.enter(RuntimeCall::BeginFrame)?;
        self.require_running(RuntimeCall::BeginFrame)?;
        self.frame_open = true;
        Ok(())
    }

    fn acquire_image(&mut self, view_index: usize) -> VrResult<usize> {
        self.enter(RuntimeCall::AcquireImage)?;
        let swapchain = self.swapchain_mut(RuntimeCall::AcquireImage, view_index)?;
        if swapchain.acquired.is_some() {
            return Err(VrError::runtime(
                RuntimeCall::AcquireImage.name(),
                "XR_ERROR_CALL_ORDER_INVALID",
            ));
        }
        let index = swapchain.next;
        swapchain.next = (swapchain.next + 1) % swapchain.info.images.len().max(1);
        swapchain.acquired = Some(index);
        swapchain.waited = false;
        Ok(index)
    }

    fn wait_image(&mut self, view_index: usize, timeout: Duration) -> VrResult<()> {
        self.enter(RuntimeCall::WaitImage)?;
        self.last_wait_timeout = Some(timeout);
        let swapchain = self.swapchain_mut(RuntimeCall::WaitImage, view_index)?;
        if swapchain.acquired.is_none() || swapchain.waited {
            return Err(VrError::runtime(
                RuntimeCall::WaitImage.name(),
                "XR_ERROR_CALL_ORDER_INVALID",
            ));
        }
        swapchain.waited = true;
        Ok(())
    }

    fn release_image(&mut self, view_index: usize) -> VrResult<()> {
        self.enter(RuntimeCall::ReleaseImage)?;
        let swapchain = self.swapchain_mut(RuntimeCall::ReleaseImage, view_index)?;
        if !swapchain.waited {
            return Err(VrError::runtime(
                RuntimeCall::ReleaseImage.name(),
                "XR_ERROR_CALL_ORDER_INVALID",
            ));
        }
        swapchain.acquired = None;
        swapchain.waited = false;
        swapchain.released_once = true;
        Ok(())
    }

    fn end_frame(&mut self, _display_time: i64, layer: Option<&ProjectionLayer>) -> VrResult<()> {
        self.enter(RuntimeCall::EndFrame)?;
        self.require_running(RuntimeCall::EndFrame)?;
        if !self.frame_open {
            return Err(VrError::runtime(
                RuntimeCall::EndFrame.name(),
                "XR_ERROR_CALL_ORDER_INVALID",
            ));
        }
        if let Some(layer) = layer {
            if layer.views.len() != self.swapchains.len() {
                return Err(VrError::runtime(
                    RuntimeCall::EndFrame.name(),
                    "XR_ERROR_VALIDATION_FAILURE",
                ));
            }
            let unreleased = layer.views.iter().any(|view| {
                self.swapchains
                    .get(view.view_index)
                    .is_none_or(|swapchain| !swapchain.released_once)
            });
            if unreleased {
                return Err(VrError::runtime(
                    RuntimeCall::EndFrame.name(),
                    "XR_ERROR_LAYER_INVALID",
                ));
            }
        }
        self.frame_open = false;
        self.frames_ended += 1;
        self.last_layer = layer.cloned();

        if self.awaiting_first_frame {
            self.awaiting_first_frame = false;
            self.queue_states(&[
                RuntimeSessionState::Synchronized,
                RuntimeSessionState::Visible,
                RuntimeSessionState::Focused,
            ]);
        }
        Ok(())
    }

    fn now(&self) -> VrResult<i64> {
        Ok(self.clock)
    }
}
