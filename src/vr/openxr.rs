use crate::vr::{
    AppInfo, Extent, Fov, FrameState, ImageHandle, Pose, ProjectionLayer, ReferenceSpaceType,
    RuntimeEvent, RuntimeInfo, RuntimeSessionState, SwapchainInfo, SwapchainRequest, View,
    ViewConfiguration, VrError, VrResult, XrRuntime,
};
use glam::{Quat, Vec3};
use openxr as xr;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

const VIEW_TYPE: xr::ViewConfigurationType = xr::ViewConfigurationType::PRIMARY_STEREO;

/// Graphics APIs the session can be bound to.
pub trait XrGraphicsApi: xr::Graphics {
    const EXTENSION: &'static str;

    fn supported(extensions: &xr::ExtensionSet) -> bool;
    fn enable(extensions: &mut xr::ExtensionSet);
    fn image_handle(image: &Self::SwapchainImage) -> ImageHandle;
    fn format_code(format: Self::Format) -> i64;
    fn format_from_code(code: i64) -> Self::Format;
}

impl XrGraphicsApi for xr::OpenGL {
    const EXTENSION: &'static str = "XR_KHR_opengl_enable";

    fn supported(extensions: &xr::ExtensionSet) -> bool {
        extensions.khr_opengl_enable
    }

    fn enable(extensions: &mut xr::ExtensionSet) {
        extensions.khr_opengl_enable = true;
    }

    fn image_handle(image: &u32) -> ImageHandle {
        ImageHandle(u64::from(*image))
    }

    fn format_code(format: u32) -> i64 {
        i64::from(format)
    }

    fn format_from_code(code: i64) -> u32 {
        code as u32
    }
}

impl XrGraphicsApi for xr::Vulkan {
    const EXTENSION: &'static str = "XR_KHR_vulkan_enable2";

    fn supported(extensions: &xr::ExtensionSet) -> bool {
        extensions.khr_vulkan_enable2
    }

    fn enable(extensions: &mut xr::ExtensionSet) {
        extensions.khr_vulkan_enable2 = true;
    }

    fn image_handle(image: &u64) -> ImageHandle {
        ImageHandle(*image)
    }

    fn format_code(format: u32) -> i64 {
        i64::from(format)
    }

    fn format_from_code(code: i64) -> u32 {
        code as u32
    }
}

struct SessionHandles<G: xr::Graphics> {
    session: xr::Session<G>,
    frame_waiter: xr::FrameWaiter,
    frame_stream: xr::FrameStream<G>,
    space: Option<xr::Space>,
    swapchains: Vec<xr::Swapchain<G>>,
    extents: Vec<Extent>,
}

/// [`XrRuntime`] backed by the system OpenXR loader.
pub struct OpenXrRuntime<G: XrGraphicsApi> {
    entry: xr::Entry,
    instance: Option<xr::Instance>,
    system: Option<xr::SystemId>,
    blend_mode: xr::EnvironmentBlendMode,
    handles: Option<SessionHandles<G>>,
    events: xr::EventDataBuffer,
    /// Runtime time observed at the last frame wait, paired with the wall clock.
    clock_anchor: Option<(Instant, i64)>,
    _graphics: PhantomData<G>,
}

impl<G: XrGraphicsApi> OpenXrRuntime<G> {
    /// Loads the OpenXR loader from the system library path.
    ///
    /// # Safety
    ///
    /// Loading runs the loader's initialization code, and any graphics binding
    /// later handed to session creation must reference live handles of `G`.
    pub unsafe fn load() -> VrResult<Self> {
        let entry = unsafe { xr::Entry::load() }
            .map_err(|err| VrError::runtime("load OpenXR loader", err))?;
        Ok(Self {
            entry,
            instance: None,
            system: None,
            blend_mode: xr::EnvironmentBlendMode::OPAQUE,
            handles: None,
            events: xr::EventDataBuffer::new(),
            clock_anchor: None,
            _graphics: PhantomData,
        })
    }

    pub fn instance(&self) -> Option<&xr::Instance> {
        self.instance.as_ref()
    }

    fn instance_ref(&self) -> VrResult<&xr::Instance> {
        self.instance.as_ref().ok_or(VrError::NotInitialized)
    }

    fn system_id(&self) -> VrResult<xr::SystemId> {
        self.system.ok_or(VrError::NotInitialized)
    }

    fn handles(&self) -> VrResult<&SessionHandles<G>> {
        self.handles.as_ref().ok_or(VrError::NotInitialized)
    }

    fn handles_mut(&mut self) -> VrResult<&mut SessionHandles<G>> {
        self.handles.as_mut().ok_or(VrError::NotInitialized)
    }

    fn swapchain_mut(&mut self, view_index: usize) -> VrResult<&mut xr::Swapchain<G>> {
        self.handles_mut()?
            .swapchains
            .get_mut(view_index)
            .ok_or(VrError::ViewConfiguration(view_index))
    }
}

fn to_pose(pose: &xr::Posef) -> Pose {
    Pose {
        orientation: Quat::from_xyzw(
            pose.orientation.x,
            pose.orientation.y,
            pose.orientation.z,
            pose.orientation.w,
        ),
        position: Vec3::new(pose.position.x, pose.position.y, pose.position.z),
    }
}

fn to_posef(pose: &Pose) -> xr::Posef {
    xr::Posef {
        orientation: xr::Quaternionf {
            x: pose.orientation.x,
            y: pose.orientation.y,
            z: pose.orientation.z,
            w: pose.orientation.w,
        },
        position: xr::Vector3f {
            x: pose.position.x,
            y: pose.position.y,
            z: pose.position.z,
        },
    }
}

fn to_fovf(fov: &Fov) -> xr::Fovf {
    xr::Fovf {
        angle_left: fov.angle_left,
        angle_right: fov.angle_right,
        angle_up: fov.angle_up,
        angle_down: fov.angle_down,
    }
}

fn session_state(state: xr::SessionState) -> RuntimeSessionState {
    match state {
        xr::SessionState::IDLE => RuntimeSessionState::Idle,
        xr::SessionState::READY => RuntimeSessionState::Ready,
        xr::SessionState::SYNCHRONIZED => RuntimeSessionState::Synchronized,
        xr::SessionState::VISIBLE => RuntimeSessionState::Visible,
        xr::SessionState::FOCUSED => RuntimeSessionState::Focused,
        xr::SessionState::STOPPING => RuntimeSessionState::Stopping,
        xr::SessionState::LOSS_PENDING => RuntimeSessionState::LossPending,
        xr::SessionState::EXITING => RuntimeSessionState::Exiting,
        _ => RuntimeSessionState::Unknown,
    }
}

impl<G: XrGraphicsApi> XrRuntime for OpenXrRuntime<G> {
    type Binding = G::SessionCreateInfo;

    fn label(&self) -> &'static str {
        "OpenXR"
    }

    fn graphics_extension(&self) -> &'static str {
        G::EXTENSION
    }

    fn enumerate_extensions(&mut self) -> VrResult<Vec<String>> {
        let available = self
            .entry
            .enumerate_extensions()
            .map_err(|err| VrError::runtime("xrEnumerateInstanceExtensionProperties", err))?;
        let mut names = available.other.clone();
        if G::supported(&available) {
            names.push(G::EXTENSION.to_string());
        }
        Ok(names)
    }

    fn create_instance(&mut self, app: &AppInfo, extensions: &[&str]) -> VrResult<RuntimeInfo> {
        let mut enabled = xr::ExtensionSet::default();
        for name in extensions {
            if *name == G::EXTENSION {
                G::enable(&mut enabled);
            } else {
                enabled.other.push((*name).to_string());
            }
        }

        let app_info = xr::ApplicationInfo {
            application_name: &app.application_name,
            application_version: 1,
            engine_name: app.engine_name,
            engine_version: 1,
            api_version: xr::Version::new(1, 0, 0),
        };
        let instance = self
            .entry
            .create_instance(&app_info, &enabled, &[])
            .map_err(|err| VrError::runtime("xrCreateInstance", err))?;

        let info = match instance.properties() {
            Ok(props) => RuntimeInfo {
                name: props.runtime_name,
                version: props.runtime_version.to_string(),
            },
            Err(err) => {
                log::warn!("[xr] runtime properties unavailable: {err}");
                RuntimeInfo::default()
            }
        };
        self.instance = Some(instance);
        Ok(info)
    }

    fn select_hmd_system(&mut self) -> VrResult<()> {
        let instance = self.instance_ref()?;
        let system = instance
            .system(xr::FormFactor::HEAD_MOUNTED_DISPLAY)
            .map_err(|err| VrError::runtime("xrGetSystem", err))?;
        let blend_mode = instance
            .enumerate_environment_blend_modes(system, VIEW_TYPE)
            .map_err(|err| VrError::runtime("xrEnumerateEnvironmentBlendModes", err))?
            .first()
            .copied()
            .unwrap_or(xr::EnvironmentBlendMode::OPAQUE);
        self.system = Some(system);
        self.blend_mode = blend_mode;
        Ok(())
    }

    fn view_configuration(&mut self) -> VrResult<Vec<ViewConfiguration>> {
        let system = self.system_id()?;
        let views = self
            .instance_ref()?
            .enumerate_view_configuration_views(system, VIEW_TYPE)
            .map_err(|err| VrError::runtime("xrEnumerateViewConfigurationViews", err))?;
        Ok(views
            .iter()
            .map(|view| ViewConfiguration {
                recommended: Extent::new(
                    view.recommended_image_rect_width,
                    view.recommended_image_rect_height,
                ),
                max: Extent::new(view.max_image_rect_width, view.max_image_rect_height),
                recommended_sample_count: view.recommended_swapchain_sample_count,
            })
            .collect())
    }

    fn check_graphics_requirements(&mut self) -> VrResult<()> {
        let system = self.system_id()?;
        self.instance_ref()?
            .graphics_requirements::<G>(system)
            .map_err(|err| VrError::runtime("graphics requirements", err))?;
        Ok(())
    }

    fn create_session(&mut self, binding: G::SessionCreateInfo) -> VrResult<()> {
        let system = self.system_id()?;
        let instance = self.instance_ref()?;
        // SAFETY: `load` obliges the caller to pass a binding with live handles.
        let (session, frame_waiter, frame_stream) =
            unsafe { instance.create_session::<G>(system, &binding) }
                .map_err(|err| VrError::runtime("xrCreateSession", err))?;
        self.handles = Some(SessionHandles {
            session,
            frame_waiter,
            frame_stream,
            space: None,
            swapchains: Vec::new(),
            extents: Vec::new(),
        });
        Ok(())
    }

    fn create_reference_space(&mut self, space: ReferenceSpaceType) -> VrResult<()> {
        let kind = match space {
            ReferenceSpaceType::View => xr::ReferenceSpaceType::VIEW,
            ReferenceSpaceType::Local => xr::ReferenceSpaceType::LOCAL,
            ReferenceSpaceType::Stage => xr::ReferenceSpaceType::STAGE,
        };
        let handles = self.handles_mut()?;
        let created = handles
            .session
            .create_reference_space(kind, xr::Posef::IDENTITY)
            .map_err(|err| VrError::runtime("xrCreateReferenceSpace", err))?;
        handles.space = Some(created);
        Ok(())
    }

    fn swapchain_formats(&mut self) -> VrResult<Vec<i64>> {
        let formats = self
            .handles()?
            .session
            .enumerate_swapchain_formats()
            .map_err(|err| VrError::runtime("xrEnumerateSwapchainFormats", err))?;
        Ok(formats.into_iter().map(G::format_code).collect())
    }

    fn create_swapchain(&mut self, view_index: usize, request: &SwapchainRequest) -> VrResult<SwapchainInfo> {
        let handles = self.handles_mut()?;
        if view_index != handles.swapchains.len() {
            return Err(VrError::ViewConfiguration(view_index));
        }
        let swapchain = handles
            .session
            .create_swapchain(&xr::SwapchainCreateInfo {
                create_flags: xr::SwapchainCreateFlags::EMPTY,
                usage_flags: xr::SwapchainUsageFlags::COLOR_ATTACHMENT
                    | xr::SwapchainUsageFlags::SAMPLED,
                format: G::format_from_code(request.format),
                sample_count: request.sample_count.max(1),
                width: request.extent.width,
                height: request.extent.height,
                face_count: 1,
                array_size: 1,
                mip_count: 1,
            })
            .map_err(|err| VrError::runtime("xrCreateSwapchain", err))?;
        let images = swapchain
            .enumerate_images()
            .map_err(|err| VrError::runtime("xrEnumerateSwapchainImages", err))?
            .iter()
            .map(G::image_handle)
            .collect();

        handles.swapchains.push(swapchain);
        handles.extents.push(request.extent);
        Ok(SwapchainInfo {
            images,
            extent: request.extent,
            format: request.format,
        })
    }

    fn poll_event(&mut self) -> VrResult<Option<RuntimeEvent>> {
        let instance = self.instance.as_ref().ok_or(VrError::NotInitialized)?;
        let event = instance
            .poll_event(&mut self.events)
            .map_err(|err| VrError::runtime("xrPollEvent", err))?;
        Ok(event.map(|event| match event {
            xr::Event::SessionStateChanged(change) => {
                RuntimeEvent::SessionStateChanged(session_state(change.state()))
            }
            xr::Event::InstanceLossPending(_) => RuntimeEvent::InstanceLossPending,
            xr::Event::InteractionProfileChanged(_) => RuntimeEvent::InteractionProfileChanged,
            xr::Event::EventsLost(lost) => RuntimeEvent::EventsLost(lost.lost_event_count()),
            xr::Event::ReferenceSpaceChangePending(_) => {
                RuntimeEvent::Other("reference space change pending".to_string())
            }
            _ => RuntimeEvent::Other("unrecognized".to_string()),
        }))
    }

    fn begin_session(&mut self) -> VrResult<()> {
        self.handles()?
            .session
            .begin(VIEW_TYPE)
            .map_err(|err| VrError::runtime("xrBeginSession", err))?;
        Ok(())
    }

    fn end_session(&mut self) -> VrResult<()> {
        self.handles()?
            .session
            .end()
            .map_err(|err| VrError::runtime("xrEndSession", err))?;
        Ok(())
    }

    fn request_exit(&mut self) -> VrResult<()> {
        self.handles()?
            .session
            .request_exit()
            .map_err(|err| VrError::runtime("xrRequestExitSession", err))
    }

    fn destroy_session(&mut self) -> VrResult<()> {
        // Handles destroy themselves on drop, swapchains and space before the session.
        if let Some(mut handles) = self.handles.take() {
            handles.swapchains.clear();
            handles.space = None;
        }
        self.clock_anchor = None;
        Ok(())
    }

    fn destroy_instance(&mut self) -> VrResult<()> {
        self.destroy_session()?;
        self.system = None;
        self.instance = None;
        Ok(())
    }

    fn wait_frame(&mut self) -> VrResult<FrameState> {
        let state = self
            .handles_mut()?
            .frame_waiter
            .wait()
            .map_err(|err| VrError::runtime("xrWaitFrame", err))?;
        let predicted = state.predicted_display_time.as_nanos();
        let period = state.predicted_display_period.as_nanos();
        // The runtime clock is only observable through frame timing; the wait
        // returns roughly one period ahead of the predicted display time.
        self.clock_anchor = Some((Instant::now(), predicted - period));
        Ok(FrameState {
            predicted_display_time: predicted,
            predicted_display_period: period,
            should_render: state.should_render,
        })
    }

    fn locate_views(&mut self, display_time: i64) -> VrResult<Vec<View>> {
        let handles = self.handles()?;
        let space = handles.space.as_ref().ok_or(VrError::NotInitialized)?;
        let (_, views) = handles
            .session
            .locate_views(VIEW_TYPE, xr::Time::from_nanos(display_time), space)
            .map_err(|err| VrError::runtime("xrLocateViews", err))?;
        Ok(views
            .iter()
            .map(|view| View {
                pose: to_pose(&view.pose),
                fov: Fov {
                    angle_left: view.fov.angle_left,
                    angle_right: view.fov.angle_right,
                    angle_up: view.fov.angle_up,
                    angle_down: view.fov.angle_down,
                },
            })
            .collect())
    }

    fn begin_frame(&mut self) -> VrResult<()> {
        self.handles_mut()?
            .frame_stream
            .begin()
            .map_err(|err| VrError::runtime("xrBeginFrame", err))
    }

    fn acquire_image(&mut self, view_index: usize) -> VrResult<usize> {
        let index = self
            .swapchain_mut(view_index)?
            .acquire_image()
            .map_err(|err| VrError::runtime("xrAcquireSwapchainImage", err))?;
        Ok(index as usize)
    }

    fn wait_image(&mut self, view_index: usize, timeout: Duration) -> VrResult<()> {
        let timeout = xr::Duration::from_nanos(i64::try_from(timeout.as_nanos()).unwrap_or(i64::MAX));
        self.swapchain_mut(view_index)?
            .wait_image(timeout)
            .map_err(|err| VrError::runtime("xrWaitSwapchainImage", err))
    }

    fn release_image(&mut self, view_index: usize) -> VrResult<()> {
        self.swapchain_mut(view_index)?
            .release_image()
            .map_err(|err| VrError::runtime("xrReleaseSwapchainImage", err))
    }

    fn end_frame(&mut self, display_time: i64, layer: Option<&ProjectionLayer>) -> VrResult<()> {
        let blend_mode = self.blend_mode;
        let time = xr::Time::from_nanos(display_time);
        let handles = self.handles.as_mut().ok_or(VrError::NotInitialized)?;

        // A projection layer must carry one view per configured view.
        let layer = layer.filter(|layer| {
            let complete = layer.views.len() == handles.swapchains.len();
            if !complete {
                log::warn!(
                    "[xr] dropping projection layer with {} of {} views",
                    layer.views.len(),
                    handles.swapchains.len()
                );
            }
            complete
        });
        let submitted = match (layer, handles.space.as_ref()) {
            (Some(layer), Some(space)) => {
                let mut views = Vec::with_capacity(layer.views.len());
                for view in &layer.views {
                    let swapchain = handles
                        .swapchains
                        .get(view.view_index)
                        .ok_or(VrError::ViewConfiguration(view.view_index))?;
                    let rect = xr::Rect2Di {
                        offset: xr::Offset2Di { x: 0, y: 0 },
                        extent: xr::Extent2Di {
                            width: view.extent.width as i32,
                            height: view.extent.height as i32,
                        },
                    };
                    views.push(
                        xr::CompositionLayerProjectionView::new()
                            .pose(to_posef(&view.pose))
                            .fov(to_fovf(&view.fov))
                            .sub_image(
                                xr::SwapchainSubImage::new()
                                    .swapchain(swapchain)
                                    .image_array_index(0)
                                    .image_rect(rect),
                            ),
                    );
                }
                let projection = xr::CompositionLayerProjection::new().space(space).views(&views);
                handles.frame_stream.end(time, blend_mode, &[&projection])
            }
            _ => handles.frame_stream.end(time, blend_mode, &[]),
        };
        submitted.map_err(|err| VrError::runtime("xrEndFrame", err))
    }

    fn now(&self) -> VrResult<i64> {
        let (anchor, runtime_time) = self.clock_anchor.ok_or(VrError::NotInitialized)?;
        let elapsed = i64::try_from(anchor.elapsed().as_nanos()).unwrap_or(i64::MAX);
        Ok(runtime_time.saturating_add(elapsed))
    }
}
