use hmd_stereo::vr::simulated::RuntimeCall;
use hmd_stereo::vr::{
    Extent, Eye, FrameSubmission, ImageHandle, RuntimeSessionState, SessionListener,
    SimulatedRuntime, VrError,
};
use hmd_stereo::{HmdSession, SessionStatus, XrConfig};
use proptest::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    Idle,
    Visible,
    Focused,
}

#[derive(Clone, Default)]
struct HookLog(Rc<RefCell<Vec<Hook>>>);

impl HookLog {
    fn snapshot(&self) -> Vec<Hook> {
        self.0.borrow().clone()
    }

    fn count(&self, hook: Hook) -> usize {
        self.0.borrow().iter().filter(|h| **h == hook).count()
    }
}

impl SessionListener for HookLog {
    fn on_idle(&mut self) {
        self.0.borrow_mut().push(Hook::Idle);
    }

    fn on_visible(&mut self) {
        self.0.borrow_mut().push(Hook::Visible);
    }

    fn on_focused(&mut self) {
        self.0.borrow_mut().push(Hook::Focused);
    }
}

fn session_with_log(runtime: SimulatedRuntime) -> (HmdSession<SimulatedRuntime>, HookLog) {
    let log = HookLog::default();
    let session = HmdSession::new(runtime, &XrConfig::default()).with_listener(log.clone());
    (session, log)
}

fn started(runtime: SimulatedRuntime) -> (HmdSession<SimulatedRuntime>, HookLog) {
    let (mut session, log) = session_with_log(runtime);
    session.init().expect("init");
    session.start_session(()).expect("start");
    (session, log)
}

#[test]
fn synchronizes_before_visibility_and_focus() {
    let (mut session, log) = started(SimulatedRuntime::new());
    assert_eq!(session.status(), SessionStatus::Synchronized);
    assert_eq!(log.snapshot(), vec![Hook::Idle]);
    assert!(!session.is_visible());

    session.poll_events().expect("poll visible");
    assert!(session.is_visible());
    session.poll_events().expect("poll focused");
    assert!(session.is_focused());
    assert_eq!(session.runtime_state(), RuntimeSessionState::Focused);

    session.runtime_mut().push_state(RuntimeSessionState::Focused);
    session.poll_events().expect("duplicate focused");
    assert_eq!(log.snapshot(), vec![Hook::Idle, Hook::Visible, Hook::Focused]);
}

#[test]
fn end_to_end_frame_then_close() {
    let (mut session, _) = started(SimulatedRuntime::new());

    let state = session.wait_next_frame().expect("frame");
    assert!(state.should_render);
    let before = session.refresh_in_progress().total_rendered_frames;

    let submission = session.submit_frame(|_, _| true).expect("submit");
    assert!(submission.rendered);
    assert_eq!(submission.rendered_views, 2);
    assert!(!submission.partial);
    assert_eq!(session.refresh_in_progress().total_rendered_frames, before + 1);
    assert_eq!(
        session.runtime().last_layer().map(|layer| layer.views.len()),
        Some(2)
    );

    session.close_session().expect("close");
    assert_eq!(session.status(), SessionStatus::Stopped);
    assert!(!session.is_session_running());
    assert!(!session.runtime().is_session_alive());
    assert_eq!(session.runtime().count(RuntimeCall::EndSession), 1);

    session.close_session().expect("second close is a no-op");
    assert!(!session.is_session_running());
    assert!(matches!(
        session.wait_next_frame(),
        Err(VrError::SessionNotRunning(SessionStatus::Stopped))
    ));
}

#[test]
fn start_gives_up_when_runtime_never_synchronizes() {
    let config = XrConfig {
        transition_poll_budget: 4,
        ..XrConfig::default()
    };
    let mut session = HmdSession::new(SimulatedRuntime::new().with_manual_lifecycle(), &config);
    session.init().expect("init");
    session.runtime_mut().push_state(RuntimeSessionState::Idle);

    assert!(matches!(
        session.start_session(()),
        Err(VrError::TransitionTimeout(..))
    ));
    assert!(!session.runtime().is_session_alive());
    assert_eq!(session.status(), SessionStatus::Stopped);

    session.terminate().expect("terminate");
    assert_eq!(session.runtime().count(RuntimeCall::RequestExit), 0);
}

#[test]
fn runtime_driven_stop_destroys_session() {
    let config = XrConfig {
        transition_poll_budget: 4,
        ..XrConfig::default()
    };
    let runtime = SimulatedRuntime::new().with_manual_lifecycle();
    let mut session = HmdSession::new(runtime, &config);
    session.init().expect("init");
    session.runtime_mut().push_state(RuntimeSessionState::Idle);
    session.runtime_mut().push_state(RuntimeSessionState::Ready);
    session.runtime_mut().push_state(RuntimeSessionState::Synchronized);
    session.start_session(()).expect("start");

    session.runtime_mut().push_state(RuntimeSessionState::Stopping);
    session.runtime_mut().push_state(RuntimeSessionState::Idle);
    session.poll_events().expect("stopping then idle");
    assert_eq!(session.status(), SessionStatus::Stopped);
    assert!(!session.runtime().is_session_alive());
    assert_eq!(session.runtime().count(RuntimeCall::EndSession), 1);

    session.close_session().expect("close");
    assert_eq!(session.runtime().count(RuntimeCall::RequestExit), 0);
    assert_eq!(session.runtime().count(RuntimeCall::DestroySession), 1);
}

#[test]
fn exiting_destroys_session_resources() {
    let (mut session, _) = started(SimulatedRuntime::new());
    session.runtime_mut().push_state(RuntimeSessionState::Exiting);
    for _ in 0..4 {
        session.poll_events().expect("poll");
    }
    assert_eq!(session.status(), SessionStatus::Stopped);
    assert!(!session.runtime().is_session_alive());
    assert!(session.view(hmd_stereo::vr::Eye::Left).is_none());
}

#[test]
fn failed_end_session_enters_failure() {
    let (mut session, _) = started(SimulatedRuntime::new());
    session.runtime_mut().fail_next(RuntimeCall::EndSession);
    session.runtime_mut().push_state(RuntimeSessionState::Stopping);

    for _ in 0..4 {
        if session.poll_events().is_err() {
            break;
        }
    }
    assert_eq!(session.status(), SessionStatus::Failure);
    assert!(!session.is_session_running());
    assert!(matches!(session.poll_events(), Err(VrError::SessionFailed)));
    assert!(session.wait_next_frame().is_err());

    session.terminate().expect("terminate releases the instance");
    assert!(!session.runtime().is_instance_alive());
    assert_eq!(session.status(), SessionStatus::Failure);
}

#[test]
fn init_fails_without_interop_extension() {
    let runtime = SimulatedRuntime::new().without_extension("XR_KHR_opengl_enable");
    let (mut session, _) = session_with_log(runtime);
    assert!(matches!(session.init(), Err(VrError::MissingExtension(_))));
    assert!(matches!(session.start_session(()), Err(VrError::NotInitialized)));
}

#[test]
fn init_failure_after_instance_releases_it() {
    let mut runtime = SimulatedRuntime::new();
    runtime.fail_next(RuntimeCall::CheckGraphicsRequirements);
    let (mut session, _) = session_with_log(runtime);
    assert!(session.init().is_err());
    assert!(!session.runtime().is_instance_alive());
    assert_eq!(session.recommended_resolution(), Extent::default());

    session.init().expect("second attempt succeeds");
    assert_eq!(session.runtime_name(), "Simulated Runtime");
}

#[test]
fn swapchain_creation_failure_rolls_back_session() {
    let mut runtime = SimulatedRuntime::new();
    runtime.fail_after(RuntimeCall::CreateSwapchain, 1);
    let (mut session, _) = session_with_log(runtime);
    session.init().expect("init");

    assert!(session.start_session(()).is_err());
    assert_eq!(session.status(), SessionStatus::Stopped);
    assert!(!session.session_started());
    assert!(!session.runtime().is_session_alive());
}

#[test]
fn hundred_frames_publish_refresh_report() {
    let (mut session, _) = started(SimulatedRuntime::new().with_display_period(11_111_111));
    for _ in 0..100 {
        session.wait_next_frame().expect("wait");
        session.submit_frame(|_, _| true).expect("submit");
    }

    let report = session.refresh_report();
    assert_eq!(report.total_rendered_frames, 100);
    assert_eq!(report.missed_frames, 0);
    assert!((report.expected_framerate - 90.0).abs() < 0.01);
    assert_eq!(session.refresh_in_progress().total_rendered_frames, 0);
    assert_eq!(session.refresh_in_progress().missed_frames, 0);
}

#[test]
fn late_predictions_are_counted_as_missed() {
    let (mut session, _) = started(SimulatedRuntime::new());
    session.runtime_mut().set_frame_lateness(2 * 11_111_111);
    for _ in 0..3 {
        session.wait_next_frame().expect("wait");
        session.submit_frame(|_, _| true).expect("submit");
    }
    assert_eq!(session.refresh_in_progress().missed_frames, 3);
}

#[test]
fn skipped_render_still_balances_the_frame() {
    let (mut session, _) = started(SimulatedRuntime::new());
    session.runtime_mut().set_should_render(false);
    let ended_before = session.runtime().frames_ended();

    let state = session.wait_next_frame().expect("wait");
    assert!(!state.should_render);
    let mut calls = 0;
    let submission = session.submit_frame(|_, _| {
        calls += 1;
        true
    }).expect("submit");

    assert_eq!(calls, 0);
    assert!(!submission.rendered);
    assert_eq!(session.runtime().frames_ended(), ended_before + 1);
    assert_eq!(session.runtime().last_layer(), None);
    assert_eq!(session.refresh_in_progress().total_rendered_frames, 0);
}

fn render_full_frame(session: &mut HmdSession<SimulatedRuntime>) -> FrameSubmission {
    session.wait_next_frame().expect("wait");
    session.submit_frame(|_, _| true).expect("submit")
}

fn render_recording(session: &mut HmdSession<SimulatedRuntime>) -> (FrameSubmission, Vec<(usize, ImageHandle)>) {
    session.wait_next_frame().expect("wait");
    let mut rendered = Vec::new();
    let submission = session
        .submit_frame(|view, image| {
            rendered.push((view, image));
            true
        })
        .expect("frame end still succeeds");
    (submission, rendered)
}

fn views_of(rendered: &[(usize, ImageHandle)]) -> Vec<usize> {
    rendered.iter().map(|(view, _)| *view).collect()
}

#[test]
fn mid_frame_failure_submits_full_layer_and_flags_partial() {
    let (mut session, _) = started(SimulatedRuntime::new());
    assert!(render_full_frame(&mut session).layer_submitted);
    session.runtime_mut().fail_after(RuntimeCall::AcquireImage, 1);

    let (submission, rendered) = render_recording(&mut session);
    assert_eq!(views_of(&rendered), vec![0]);
    assert!(submission.partial);
    assert_eq!(submission.rendered_views, 1);
    assert!(submission.layer_submitted);
    let layer = session.runtime().last_layer().expect("layer submitted");
    assert_eq!(layer.views.len(), 2);
    assert_eq!(layer.views[1].view_index, 1);

    let next = render_full_frame(&mut session);
    assert!(!next.partial);
    assert_eq!(next.rendered_views, 2);
}

#[test]
fn abort_before_every_swapchain_released_submits_no_layer() {
    let (mut session, _) = started(SimulatedRuntime::new());
    session.runtime_mut().fail_after(RuntimeCall::AcquireImage, 1);

    let (submission, rendered) = render_recording(&mut session);
    assert_eq!(views_of(&rendered), vec![0]);
    assert!(submission.partial);
    assert!(!submission.layer_submitted);
    assert_eq!(session.runtime().last_layer(), None);

    assert!(render_full_frame(&mut session).layer_submitted);
}

#[test]
fn failed_image_wait_keeps_image_for_next_frame() {
    let (mut session, _) = started(SimulatedRuntime::new());
    render_full_frame(&mut session);
    session.runtime_mut().fail_after(RuntimeCall::WaitImage, 1);

    let (submission, rendered) = render_recording(&mut session);
    assert_eq!(views_of(&rendered), vec![0]);
    assert!(submission.partial);
    assert_eq!(session.runtime().last_layer().map(|l| l.views.len()), Some(2));
    let held = session.runtime().acquired_image(1).expect("right image still acquired");

    let acquires = session.runtime().count(RuntimeCall::AcquireImage);
    let (next, rendered) = render_recording(&mut session);
    assert!(!next.partial);
    assert_eq!(views_of(&rendered), vec![0, 1]);
    // Only the left eye acquires; the right eye finishes the image it already holds.
    assert_eq!(session.runtime().count(RuntimeCall::AcquireImage), acquires + 1);
    let right_images = &session.swapchain(Eye::Right).expect("right swapchain").images;
    assert_eq!(rendered[1].1, right_images[held]);
    assert_eq!(session.runtime().acquired_image(1), None);
}

#[test]
fn failed_release_is_retried_next_frame() {
    let (mut session, _) = started(SimulatedRuntime::new());
    render_full_frame(&mut session);
    session.runtime_mut().fail_after(RuntimeCall::ReleaseImage, 1);

    let (submission, rendered) = render_recording(&mut session);
    assert_eq!(views_of(&rendered), vec![0, 1]);
    assert!(submission.partial);
    assert_eq!(submission.rendered_views, 1);
    assert!(session.runtime().acquired_image(1).is_some());

    let waits = session.runtime().count(RuntimeCall::WaitImage);
    let next = render_full_frame(&mut session);
    assert!(!next.partial);
    assert_eq!(next.rendered_views, 2);
    // The held right image was already waited on.
    assert_eq!(session.runtime().count(RuntimeCall::WaitImage), waits + 1);
    assert_eq!(session.runtime().acquired_image(1), None);
}

#[test]
fn declined_view_is_released_and_ends_the_frame() {
    let (mut session, _) = started(SimulatedRuntime::new());
    render_full_frame(&mut session);

    session.wait_next_frame().expect("wait");
    let mut offered = Vec::new();
    let submission = session
        .submit_frame(|view, _| {
            offered.push(view);
            false
        })
        .expect("submit");

    assert_eq!(offered, vec![0]);
    assert!(submission.partial);
    assert_eq!(submission.rendered_views, 0);
    assert_eq!(session.runtime().acquired_image(0), None);
    assert_eq!(session.runtime().acquired_image(1), None);
    assert!(submission.layer_submitted);
}

#[test]
fn configured_image_wait_timeout_reaches_runtime() {
    let config = XrConfig::from_json_str(r#"{ "image_wait_timeout_ms": 250 }"#).expect("config");
    let mut session = HmdSession::new(SimulatedRuntime::new(), &config);
    session.init().expect("init");
    session.start_session(()).expect("start");
    render_full_frame(&mut session);
    assert_eq!(
        session.runtime().last_wait_timeout(),
        Some(Duration::from_millis(250))
    );
}

#[test]
fn wait_failure_keeps_session_consistent() {
    let (mut session, _) = started(SimulatedRuntime::new());
    session.runtime_mut().fail_next(RuntimeCall::LocateViews);
    assert!(session.wait_next_frame().is_err());
    assert!(!session.should_render());
    assert!(session.is_session_running());

    session.wait_next_frame().expect("recovers next tick");
    assert!(session.should_render());
}

#[test]
fn swapchains_stay_at_native_resolution() {
    let runtime = SimulatedRuntime::new().with_recommended_resolution(Extent::new(2000, 2000));
    let (session, _) = started(runtime);
    assert_eq!(session.resolution(), Extent::new(2000, 2000));
    let swapchain = session
        .swapchain(hmd_stereo::vr::Eye::Right)
        .expect("right swapchain");
    assert_eq!(swapchain.extent, Extent::new(2000, 2000));
    assert_eq!(session.resolution().downscaled(2), Extent::new(1000, 1000));
}

#[test]
fn seated_mode_uses_local_space() {
    let config = XrConfig::from_json_str(r#"{ "reference_space": "seated" }"#).expect("config");
    let mut session = HmdSession::new(SimulatedRuntime::new(), &config);
    session.init().expect("init");
    session.start_session(()).expect("start");
    assert_eq!(session.reference_space_label(), "LOCAL");
}

fn lifecycle_state() -> impl Strategy<Value = RuntimeSessionState> {
    prop_oneof![
        Just(RuntimeSessionState::Idle),
        Just(RuntimeSessionState::Ready),
        Just(RuntimeSessionState::Synchronized),
        Just(RuntimeSessionState::Visible),
        Just(RuntimeSessionState::Focused),
    ]
}

proptest! {
    #[test]
    fn visibility_hooks_only_fire_once_synchronized(
        states in proptest::collection::vec(lifecycle_state(), 1..24)
    ) {
        let config = XrConfig { transition_poll_budget: 4, ..XrConfig::default() };
        let log = HookLog::default();
        let mut session = HmdSession::new(SimulatedRuntime::new().with_manual_lifecycle(), &config)
            .with_listener(log.clone());
        session.init().expect("init");
        session.runtime_mut().push_state(RuntimeSessionState::Idle);
        session.runtime_mut().push_state(RuntimeSessionState::Ready);
        session.runtime_mut().push_state(RuntimeSessionState::Synchronized);
        session.start_session(()).expect("start");

        for state in states {
            session.runtime_mut().push_state(state);
        }

        while session.runtime().pending_events() > 0 {
            let pending = session.runtime().pending_events();
            let hooks_before = log.snapshot().len();
            let _ = session.poll_events();
            let consumed = pending - session.runtime().pending_events();
            let fired = &log.snapshot()[hooks_before..];

            prop_assert!(fired.len() <= consumed);
            if session.is_visible() || session.is_focused() {
                prop_assert_eq!(session.status(), SessionStatus::Synchronized);
            }
            if fired.iter().any(|hook| *hook != Hook::Idle) {
                prop_assert_eq!(session.status(), SessionStatus::Synchronized);
            }
            if consumed == 0 {
                break;
            }
        }
        prop_assert!(log.count(Hook::Idle) >= 1);
    }
}
