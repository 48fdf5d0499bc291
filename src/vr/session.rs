use super::frame::{FrameScheduler, FrameSubmission, RefreshReport};
use super::pose::{self, AngleUnit};
use super::{
    AppInfo, Extent, Eye, FrameState, ImageHandle, NoopListener, ReferenceSpaceType, RuntimeEvent,
    RuntimeInfo, RuntimeSessionState, STEREO_VIEW_COUNT, SessionListener, SwapchainInfo,
    SwapchainRequest, View, ViewConfiguration, VrError, VrResult, XrRuntime,
    select_swapchain_format,
};
use crate::config::XrConfig;
use glam::{Quat, Vec2, Vec3, Vec4};
use serde::Serialize;
use std::fmt;

pub const ENGINE_NAME: &str = "hmd_stereo";

/// Internal lifecycle of the device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum SessionStatus {
    #[default]
    Stopped,
    Idle,
    Beginning,
    Synchronized,
    Ending,
    Failure,
}

impl SessionStatus {
    pub fn label(self) -> &'static str {
        match self {
            SessionStatus::Stopped => "STOPPED",
            SessionStatus::Idle => "IDLE",
            SessionStatus::Beginning => "BEGINNING",
            SessionStatus::Synchronized => "SYNCHRONIZED",
            SessionStatus::Ending => "ENDING",
            SessionStatus::Failure => "FAILURE",
        }
    }

    pub fn is_running(self) -> bool {
        !matches!(self, SessionStatus::Stopped | SessionStatus::Failure)
    }

    fn is_transitional(self) -> bool {
        matches!(self, SessionStatus::Beginning | SessionStatus::Ending)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Owns the runtime connection and walks the device session through its lifecycle.
pub struct HmdSession<R: XrRuntime> {
    runtime: R,
    listener: Box<dyn SessionListener>,
    application_name: String,
    reference_space: ReferenceSpaceType,
    preferred_format: Option<i64>,
    transition_poll_budget: u32,

    status: SessionStatus,
    runtime_state: RuntimeSessionState,
    initialized: bool,
    instance_alive: bool,
    session_alive: bool,
    visible: bool,
    focused: bool,

    runtime_info: RuntimeInfo,
    view_configs: Vec<ViewConfiguration>,
    resolution_override: Option<Extent>,
    scheduler: FrameScheduler,
}

impl<R: XrRuntime> HmdSession<R> {
    pub fn new(runtime: R, config: &XrConfig) -> Self {
        Self {
            runtime,
            listener: Box::new(NoopListener),
            application_name: config.application_name.clone(),
            reference_space: config.reference_space.into(),
            preferred_format: config.preferred_swapchain_format,
            transition_poll_budget: config.transition_poll_budget.max(1),
            status: SessionStatus::Stopped,
            runtime_state: RuntimeSessionState::Unknown,
            initialized: false,
            instance_alive: false,
            session_alive: false,
            visible: false,
            focused: false,
            runtime_info: RuntimeInfo::default(),
            view_configs: Vec::new(),
            resolution_override: config.resolution,
            scheduler: FrameScheduler::new(config.image_wait_timeout()),
        }
    }

    pub fn with_listener(mut self, listener: impl SessionListener + 'static) -> Self {
        self.listener = Box::new(listener);
        self
    }

    /// Connects to the runtime and negotiates capabilities. Leaves nothing behind on failure.
    pub fn init(&mut self) -> VrResult<()> {
        if self.initialized {
            log::warn!("[xr] runtime connection already initialized");
            return Ok(());
        }
        if let Err(err) = self.try_init() {
            log::error!("[xr] {} runtime initialization failed: {err}", self.runtime.label());
            self.release_instance();
            self.view_configs.clear();
            return Err(err);
        }
        self.initialized = true;
        log::info!(
            "[xr] connected to {} {} ({} views at {}x{})",
            self.runtime_info.name,
            self.runtime_info.version,
            self.view_configs.len(),
            self.resolution().width,
            self.resolution().height
        );
        Ok(())
    }

    fn try_init(&mut self) -> VrResult<()> {
        let required = self.runtime.graphics_extension();
        let available = self.runtime.enumerate_extensions()?;
        if !available.iter().any(|ext| ext == required) {
            return Err(VrError::MissingExtension(required.to_string()));
        }

        let app = AppInfo {
            application_name: self.application_name.clone(),
            engine_name: ENGINE_NAME,
        };
        self.runtime_info = self.runtime.create_instance(&app, &[required])?;
        self.instance_alive = true;

        self.runtime.select_hmd_system()?;
        let configs = self.runtime.view_configuration()?;
        if configs.len() != STEREO_VIEW_COUNT {
            return Err(VrError::ViewConfiguration(configs.len()));
        }
        self.view_configs = configs;
        self.runtime.check_graphics_requirements()
    }

    /// Creates the session, reference space and per-view swapchains, then waits for
    /// the runtime to synchronize.
    pub fn start_session(&mut self, binding: R::Binding) -> VrResult<()> {
        if !self.initialized || !self.instance_alive {
            return Err(VrError::NotInitialized);
        }
        if self.session_alive {
            log::warn!("[xr] session already started");
            return Ok(());
        }

        if let Err(err) = self.try_start(binding) {
            log::error!("[xr] session start failed: {err}");
            if self.session_alive {
                if let Err(destroy) = self.destroy_session() {
                    log::warn!("[xr] cleanup after failed start: {destroy}");
                }
            }
            if self.status != SessionStatus::Failure {
                self.status = SessionStatus::Stopped;
            }
            return Err(err);
        }
        Ok(())
    }

    fn try_start(&mut self, binding: R::Binding) -> VrResult<()> {
        self.runtime.create_session(binding)?;
        self.session_alive = true;
        self.runtime.create_reference_space(self.reference_space)?;
        log::info!("[xr] reference space {}", self.reference_space.label());

        let offered = self.runtime.swapchain_formats()?;
        let format = select_swapchain_format(&offered, self.preferred_format)
            .ok_or(VrError::NoSwapchainFormat)?;

        let extent = self.resolution();
        let swapchains = self
            .view_configs
            .iter()
            .enumerate()
            .map(|(view_index, config)| {
                let request = SwapchainRequest {
                    extent,
                    sample_count: config.recommended_sample_count,
                    format,
                };
                self.runtime.create_swapchain(view_index, &request)
            })
            .collect::<VrResult<Vec<SwapchainInfo>>>()?;
        self.scheduler.configure(swapchains);

        for _ in 0..self.transition_poll_budget {
            self.poll_events()?;
            if self.status == SessionStatus::Synchronized {
                return Ok(());
            }
        }
        Err(VrError::TransitionTimeout("synchronization", self.transition_poll_budget))
    }

    /// Drains runtime events, looping while the session is mid-transition.
    pub fn poll_events(&mut self) -> VrResult<()> {
        if self.status == SessionStatus::Failure {
            return Err(VrError::SessionFailed);
        }
        if !self.instance_alive {
            return Err(VrError::NotInitialized);
        }

        for _ in 0..self.transition_poll_budget {
            self.poll_once();
            if self.status == SessionStatus::Beginning {
                self.drive_synchronization_frame();
            }
            if self.status == SessionStatus::Failure {
                return Err(VrError::SessionFailed);
            }
            if !self.status.is_transitional() {
                return Ok(());
            }
        }
        Err(VrError::TransitionTimeout(
            self.status.label(),
            self.transition_poll_budget,
        ))
    }

    fn poll_once(&mut self) {
        let event = match self.runtime.poll_event() {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(err) => {
                log::warn!("[xr] event poll failed: {err}");
                return;
            }
        };

        match event {
            RuntimeEvent::SessionStateChanged(state) => self.apply_runtime_state(state),
            RuntimeEvent::InstanceLossPending => {
                log::warn!("[xr] runtime instance loss pending; tearing down");
                if let Err(err) = self.destroy_all() {
                    log::error!("[xr] teardown after instance loss failed: {err}");
                    self.fail();
                }
            }
            RuntimeEvent::InteractionProfileChanged => {
                log::debug!("[xr] interaction profile changed");
            }
            RuntimeEvent::EventsLost(count) => {
                log::warn!("[xr] runtime dropped {count} events");
            }
            RuntimeEvent::Other(name) => {
                log::debug!("[xr] unhandled event {name}");
            }
        }
    }

    /// The runtime only advances past READY once a frame cycle completes.
    fn drive_synchronization_frame(&mut self) {
        if !self.session_alive {
            return;
        }
        if let Err(err) = self.scheduler.wait_next_frame(&mut self.runtime) {
            log::warn!("[xr] synchronization frame wait failed: {err}");
            return;
        }
        if let Err(err) = self.scheduler.submit_empty(&mut self.runtime) {
            log::warn!("[xr] synchronization frame submit failed: {err}");
        }
    }

    fn apply_runtime_state(&mut self, state: RuntimeSessionState) {
        let previous = self.runtime_state;
        log::info!("[xr] session state '{}' -> '{}'", previous.label(), state.label());
        self.runtime_state = state;

        match state {
            RuntimeSessionState::Idle => {
                if self.status == SessionStatus::Ending {
                    match self.destroy_session() {
                        Ok(()) => self.status = SessionStatus::Stopped,
                        Err(err) => {
                            log::error!("[xr] destroying ended session failed: {err}");
                            self.fail();
                        }
                    }
                } else if self.session_alive {
                    self.status = SessionStatus::Idle;
                }
                self.visible = false;
                self.focused = false;
                if previous != RuntimeSessionState::Idle {
                    self.listener.on_idle();
                }
            }
            RuntimeSessionState::Ready => {
                if !self.session_alive
                    || !matches!(self.status, SessionStatus::Idle | SessionStatus::Stopped)
                {
                    log::warn!("[xr] READY reported while {}; ignored", self.status);
                    return;
                }
                match self.runtime.begin_session() {
                    Ok(()) => self.status = SessionStatus::Beginning,
                    Err(err) => {
                        log::error!("[xr] begin session failed: {err}");
                        self.fail();
                    }
                }
            }
            RuntimeSessionState::Synchronized => {
                if self.session_alive && self.status != SessionStatus::Ending {
                    self.status = SessionStatus::Synchronized;
                }
                self.visible = false;
                self.focused = false;
            }
            RuntimeSessionState::Visible => {
                if self.status != SessionStatus::Synchronized {
                    log::warn!("[xr] VISIBLE reported while {}; ignored", self.status);
                    return;
                }
                let already_visible = self.visible && !self.focused;
                self.visible = true;
                self.focused = false;
                if !already_visible {
                    self.listener.on_visible();
                }
            }
            RuntimeSessionState::Focused => {
                if self.status != SessionStatus::Synchronized {
                    log::warn!("[xr] FOCUSED reported while {}; ignored", self.status);
                    return;
                }
                self.visible = true;
                if !self.focused {
                    self.focused = true;
                    self.listener.on_focused();
                }
            }
            RuntimeSessionState::Stopping => {
                self.visible = false;
                self.focused = false;
                if self.status != SessionStatus::Ending && self.session_alive {
                    match self.runtime.end_session() {
                        Ok(()) => self.status = SessionStatus::Ending,
                        Err(err) => {
                            log::error!("[xr] end session failed: {err}");
                            self.fail();
                        }
                    }
                }
            }
            RuntimeSessionState::LossPending | RuntimeSessionState::Exiting => {
                self.visible = false;
                self.focused = false;
                match self.destroy_session() {
                    Ok(()) => self.status = SessionStatus::Stopped,
                    Err(err) => {
                        log::error!("[xr] destroying session failed: {err}");
                        self.fail();
                    }
                }
            }
            RuntimeSessionState::Unknown => {
                log::debug!("[xr] runtime reported an unknown session state");
            }
        }
    }

    /// Ends the session gracefully when running, or destroys it outright when idle.
    pub fn close_session(&mut self) -> VrResult<()> {
        if !self.session_alive {
            if self.status != SessionStatus::Failure {
                self.status = SessionStatus::Stopped;
            }
            return Ok(());
        }

        match self.status {
            SessionStatus::Failure => {
                // Best effort; the state machine stays failed.
                if let Err(err) = self.destroy_session() {
                    log::warn!("[xr] destroying failed session: {err}");
                }
                Ok(())
            }
            SessionStatus::Idle | SessionStatus::Stopped => {
                self.destroy_session()
                    .inspect_err(|_| self.fail())?;
                self.status = SessionStatus::Stopped;
                Ok(())
            }
            _ => self.end_gracefully(),
        }
    }

    fn end_gracefully(&mut self) -> VrResult<()> {
        if self.status != SessionStatus::Ending {
            if let Err(err) = self.runtime.request_exit() {
                log::error!("[xr] exit request failed: {err}");
                self.fail();
                if let Err(destroy) = self.destroy_session() {
                    log::warn!("[xr] destroying session after failed exit: {destroy}");
                }
                return Err(err);
            }
        }

        for _ in 0..self.transition_poll_budget {
            if !self.status.is_running() {
                break;
            }
            match self.poll_events() {
                Ok(()) | Err(VrError::TransitionTimeout(..)) => {}
                Err(err) => {
                    log::warn!("[xr] polling during shutdown: {err}");
                    break;
                }
            }
        }

        if self.session_alive {
            log::warn!("[xr] runtime never confirmed session end; destroying it");
            self.destroy_session()
                .inspect_err(|_| self.fail())?;
            if self.status != SessionStatus::Failure {
                self.status = SessionStatus::Stopped;
            }
        }
        Ok(())
    }

    /// Closes the session and releases the runtime connection. Safe to call repeatedly.
    pub fn terminate(&mut self) -> VrResult<()> {
        let closed = self.close_session();
        if let Err(err) = &closed {
            log::warn!("[xr] closing session during terminate: {err}");
        }
        self.initialized = false;
        if self.instance_alive {
            self.instance_alive = false;
            if let Err(err) = self.runtime.destroy_instance() {
                self.fail();
                return Err(err);
            }
            log::info!("[xr] runtime connection released");
        }
        closed
    }

    /// Enters the terminal failure state; the headset is no longer visible to us.
    fn fail(&mut self) {
        self.status = SessionStatus::Failure;
        self.visible = false;
        self.focused = false;
    }

    fn destroy_session(&mut self) -> VrResult<()> {
        self.scheduler.reset();
        self.visible = false;
        self.focused = false;
        if !self.session_alive {
            return Ok(());
        }
        self.session_alive = false;
        self.runtime.destroy_session()
    }

    fn destroy_all(&mut self) -> VrResult<()> {
        let session = self.destroy_session();
        self.initialized = false;
        self.status = SessionStatus::Stopped;
        if self.instance_alive {
            self.instance_alive = false;
            self.runtime.destroy_instance()?;
        }
        session
    }

    fn release_instance(&mut self) {
        if self.instance_alive {
            self.instance_alive = false;
            if let Err(err) = self.runtime.destroy_instance() {
                log::warn!("[xr] releasing runtime connection: {err}");
            }
        }
    }

    fn require_frame_loop(&self) -> VrResult<()> {
        let ready = self.session_alive
            && matches!(
                self.status,
                SessionStatus::Beginning | SessionStatus::Synchronized
            );
        if ready {
            Ok(())
        } else {
            Err(VrError::SessionNotRunning(self.status))
        }
    }

    pub fn wait_next_frame(&mut self) -> VrResult<FrameState> {
        self.require_frame_loop()?;
        self.scheduler.wait_next_frame(&mut self.runtime)
    }

    /// `render` returns whether it drew the view; see [`FrameScheduler::submit_frame`].
    pub fn submit_frame<F>(&mut self, render: F) -> VrResult<FrameSubmission>
    where
        F: FnMut(usize, ImageHandle) -> bool,
    {
        self.require_frame_loop()?;
        self.scheduler.submit_frame(&mut self.runtime, render)
    }

    pub fn submit_empty_frame(&mut self) -> VrResult<FrameSubmission> {
        self.require_frame_loop()?;
        self.scheduler.submit_empty(&mut self.runtime)
    }

    pub fn should_render(&self) -> bool {
        self.scheduler.should_render()
    }

    pub fn frame_state(&self) -> FrameState {
        self.scheduler.frame_state()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn runtime_state(&self) -> RuntimeSessionState {
        self.runtime_state
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn session_started(&self) -> bool {
        self.session_alive
    }

    pub fn is_session_running(&self) -> bool {
        self.status.is_running()
    }

    pub fn is_synchronized(&self) -> bool {
        self.status == SessionStatus::Synchronized
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    /// Per-eye swapchain resolution.
    pub fn resolution(&self) -> Extent {
        self.resolution_override
            .unwrap_or_else(|| self.recommended_resolution())
    }

    pub fn recommended_resolution(&self) -> Extent {
        self.view_configs
            .first()
            .map(|config| config.recommended)
            .unwrap_or_default()
    }

    pub fn set_resolution(&mut self, extent: Extent) {
        if self.session_alive {
            log::warn!("[xr] resolution cannot change after the session started; ignoring");
            return;
        }
        if extent.width == 0 || extent.height == 0 {
            log::warn!("[xr] ignoring empty resolution {}x{}", extent.width, extent.height);
            return;
        }
        self.resolution_override = Some(extent);
    }

    pub fn set_reference_space(&mut self, space: ReferenceSpaceType) {
        if self.session_alive {
            log::warn!("[xr] reference space cannot change after the session started; ignoring");
            return;
        }
        self.reference_space = space;
    }

    pub fn reference_space(&self) -> ReferenceSpaceType {
        self.reference_space
    }

    pub fn reference_space_label(&self) -> &'static str {
        if self.session_alive {
            self.reference_space.label()
        } else {
            "UNKNOWN"
        }
    }

    pub fn runtime_name(&self) -> &str {
        &self.runtime_info.name
    }

    pub fn runtime_version(&self) -> &str {
        &self.runtime_info.version
    }

    /// Last finalized refresh window.
    pub fn refresh_report(&self) -> RefreshReport {
        self.scheduler.refresh_report()
    }

    /// Refresh window still accumulating.
    pub fn refresh_in_progress(&self) -> RefreshReport {
        self.scheduler.refresh_tracker().current()
    }

    pub fn view_count(&self) -> usize {
        self.scheduler.view_count()
    }

    pub fn views(&self) -> Vec<View> {
        self.scheduler.slots().iter().map(|slot| slot.view).collect()
    }

    pub fn view(&self, eye: Eye) -> Option<View> {
        self.scheduler.slot(eye.view_index()).map(|slot| slot.view)
    }

    pub fn swapchain(&self, eye: Eye) -> Option<&SwapchainInfo> {
        self.scheduler.slot(eye.view_index()).map(|slot| &slot.swapchain)
    }

    fn view_or_default(&self, eye: Eye) -> View {
        self.view(eye).unwrap_or_else(|| {
            log::warn!("[xr] no {} view available", eye.label());
            View::default()
        })
    }

    /// Roll, pitch, yaw.
    pub fn pose_orientation(&self, eye: Eye, unit: AngleUnit) -> Vec3 {
        pose::quaternion_to_euler(self.view_or_default(eye).pose.orientation, unit)
    }

    pub fn pose_quaternion(&self, eye: Eye) -> Quat {
        self.view_or_default(eye).pose.orientation
    }

    pub fn pose_position(&self, eye: Eye) -> Vec3 {
        self.view_or_default(eye).pose.position
    }

    /// Left, right, down, up half-angles.
    pub fn field_of_view(&self, eye: Eye, unit: AngleUnit) -> Vec4 {
        match self.view(eye) {
            Some(view) => pose::field_of_view(&view.fov, unit),
            None => {
                log::warn!("[xr] no {} view available", eye.label());
                Vec4::ZERO
            }
        }
    }

    pub fn hv_field_of_view(&self, eye: Eye, unit: AngleUnit) -> Vec2 {
        match self.view(eye) {
            Some(view) => pose::hv_field_of_view(&view.fov, unit),
            None => Vec2::ZERO,
        }
    }

    pub fn screen_center(&self, eye: Eye) -> Vec2 {
        match self.view(eye) {
            Some(view) => pose::screen_center(&view.fov),
            None => {
                log::warn!("[xr] no {} view available", eye.label());
                Vec2::ZERO
            }
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }
}

impl<R: XrRuntime> Drop for HmdSession<R> {
    fn drop(&mut self) {
        if let Err(err) = self.terminate() {
            log::warn!("[xr] terminate on drop: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vr::simulated::{RuntimeCall, SimulatedRuntime};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Hooks {
        idle: u32,
        visible: u32,
        focused: u32,
    }

    struct Recorder(Rc<RefCell<Hooks>>);

    impl SessionListener for Recorder {
        fn on_idle(&mut self) {
            self.0.borrow_mut().idle += 1;
        }
        fn on_visible(&mut self) {
            self.0.borrow_mut().visible += 1;
        }
        fn on_focused(&mut self) {
            self.0.borrow_mut().focused += 1;
        }
    }

    fn manual_session() -> (HmdSession<SimulatedRuntime>, Rc<RefCell<Hooks>>) {
        let hooks = Rc::new(RefCell::new(Hooks::default()));
        let runtime = SimulatedRuntime::new().with_manual_lifecycle();
        let session = HmdSession::new(runtime, &XrConfig::default())
            .with_listener(Recorder(hooks.clone()));
        (session, hooks)
    }

    #[test]
    fn init_without_interop_extension_leaves_nothing_behind() {
        let runtime = SimulatedRuntime::new().without_extension("XR_KHR_opengl_enable");
        let mut session = HmdSession::new(runtime, &XrConfig::default());
        let err = session.init().unwrap_err();
        assert!(matches!(err, VrError::MissingExtension(_)));
        assert!(!session.is_initialized());
        assert_eq!(session.runtime().count(RuntimeCall::CreateInstance), 0);
    }

    #[test]
    fn init_rejects_mono_configuration_and_releases_instance() {
        let runtime = SimulatedRuntime::new().with_view_count(1);
        let mut session = HmdSession::new(runtime, &XrConfig::default());
        assert!(matches!(session.init(), Err(VrError::ViewConfiguration(1))));
        assert!(!session.runtime().is_instance_alive());
    }

    #[test]
    fn start_requires_init() {
        let mut session = HmdSession::new(SimulatedRuntime::new(), &XrConfig::default());
        assert!(matches!(session.start_session(()), Err(VrError::NotInitialized)));
    }

    #[test]
    fn ready_begins_exactly_once() {
        let (mut session, _) = manual_session();
        session.init().expect("init");
        session.runtime_mut().create_session(()).expect("session");
        session.session_alive = true;

        session.apply_runtime_state(RuntimeSessionState::Ready);
        session.apply_runtime_state(RuntimeSessionState::Ready);
        assert_eq!(session.status(), SessionStatus::Beginning);
        assert_eq!(session.runtime().count(RuntimeCall::BeginSession), 1);
    }

    #[test]
    fn focus_before_synchronized_is_ignored() {
        let (mut session, hooks) = manual_session();
        session.init().expect("init");
        session.runtime_mut().create_session(()).expect("session");
        session.session_alive = true;
        session.status = SessionStatus::Idle;

        session.apply_runtime_state(RuntimeSessionState::Focused);
        assert!(!session.is_focused());
        assert_eq!(hooks.borrow().focused, 0);
    }

    #[test]
    fn failed_begin_marks_failure() {
        let (mut session, _) = manual_session();
        session.init().expect("init");
        session.runtime_mut().create_session(()).expect("session");
        session.session_alive = true;
        session.runtime_mut().fail_next(RuntimeCall::BeginSession);

        session.apply_runtime_state(RuntimeSessionState::Ready);
        assert_eq!(session.status(), SessionStatus::Failure);
        assert!(!session.is_session_running());
        assert!(matches!(session.poll_events(), Err(VrError::SessionFailed)));
    }

    #[test]
    fn ready_while_synchronized_keeps_session_running() {
        let mut session = HmdSession::new(SimulatedRuntime::new(), &XrConfig::default());
        session.init().expect("init");
        session.start_session(()).expect("start");
        while session.runtime().pending_events() > 0 {
            session.poll_events().expect("poll");
        }
        assert!(session.is_focused());

        session.runtime_mut().push_state(RuntimeSessionState::Ready);
        session.poll_events().expect("duplicate ready");
        assert_eq!(session.status(), SessionStatus::Synchronized);
        assert!(session.is_focused());
        assert_eq!(session.runtime().count(RuntimeCall::BeginSession), 1);
    }

    #[test]
    fn failure_clears_visibility() {
        let mut session = HmdSession::new(SimulatedRuntime::new(), &XrConfig::default());
        session.init().expect("init");
        session.start_session(()).expect("start");
        while session.runtime().pending_events() > 0 {
            session.poll_events().expect("poll");
        }
        assert!(session.is_visible() && session.is_focused());

        session.fail();
        assert_eq!(session.status(), SessionStatus::Failure);
        assert!(!session.is_visible());
        assert!(!session.is_focused());
    }

    #[test]
    fn late_configuration_is_ignored() {
        let mut session = HmdSession::new(SimulatedRuntime::new(), &XrConfig::default());
        session.init().expect("init");
        session.set_resolution(Extent::new(1000, 1000));
        assert_eq!(session.resolution(), Extent::new(1000, 1000));
        session.start_session(()).expect("start");

        session.set_resolution(Extent::new(10, 10));
        session.set_reference_space(ReferenceSpaceType::Local);
        assert_eq!(session.resolution(), Extent::new(1000, 1000));
        assert_eq!(session.reference_space_label(), "STAGE");
    }

    #[test]
    fn terminate_is_idempotent() {
        let mut session = HmdSession::new(SimulatedRuntime::new(), &XrConfig::default());
        session.init().expect("init");
        session.start_session(()).expect("start");
        session.terminate().expect("first terminate");
        session.terminate().expect("second terminate");
        assert_eq!(session.runtime().count(RuntimeCall::DestroyInstance), 1);
        assert_eq!(session.runtime().count(RuntimeCall::DestroySession), 1);
        assert!(!session.is_session_running());
    }

    #[test]
    fn instance_loss_tears_everything_down() {
        let mut session = HmdSession::new(SimulatedRuntime::new(), &XrConfig::default());
        session.init().expect("init");
        session.start_session(()).expect("start");
        session.runtime_mut().push_event(RuntimeEvent::InstanceLossPending);
        // One event per poll outside transitions; VISIBLE and FOCUSED are still queued.
        for _ in 0..8 {
            if !session.runtime().is_instance_alive() {
                break;
            }
            session.poll_events().expect("poll");
        }
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert!(!session.runtime().is_instance_alive());
        assert!(!session.runtime().is_session_alive());
    }
}
