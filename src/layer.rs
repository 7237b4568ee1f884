// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The protocol façade.

[Layer] sits between the application and the next OpenXR layer (modeled by [Runtime]).
Most calls are forwarded unchanged; the ones below are intercepted:

| Call                         | What the layer changes                                              |
|------------------------------|---------------------------------------------------------------------|
| view configuration views     | recommended size becomes the application resolution                |
| swapchain create/destroy     | builds or drops the processing chain                               |
| enumerate swapchain images   | hands out the application-side textures instead of the runtime's   |
| locate views                 | eye separation and FOV overrides                                    |
| wait frame                   | prediction dampening                                                |
| begin/end frame              | timers, chain walk, overlay, screenshot, projection layer patches   |

Errors from the crate are logged and reported as `XR_ERROR_RUNTIME_FAILURE`; errors from
the runtime are passed back as they came.
*/

use crate::chain::{ChainOptions, ChainPlan, StageKind, StageTimes, SwapchainState};
use crate::config::{ConfigProvider, ConfigProviderExt, LayerSettings, ScalingType, Setting};
use crate::error::{Error, Result};
use crate::graphics::timer::{CpuTimer, TimerRing};
use crate::graphics::{Device, GpuTimer, Slice, Texture, TextureDesc};
use crate::screenshot::{self, ScalingTag};
use crate::stages::{FsrUpscaler, PassthroughProcessor, Stages};
use crate::stages::processor::{POST_PROCESS_SHADER, PRE_PROCESS_SHADER};
use crate::utilities::{distance, scale_fov, scaled_dimensions, set_separation};
use openxr_sys as xr;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub type XrResult<T> = std::result::Result<T, xr::Result>;

/// The next layer down, usually the OpenXR runtime itself.
pub trait Runtime<D: Device> {
    fn create_swapchain(&self, info: &xr::SwapchainCreateInfo) -> XrResult<xr::Swapchain>;
    fn destroy_swapchain(&self, swapchain: xr::Swapchain) -> XrResult<()>;
    fn enumerate_swapchain_images(&self, swapchain: xr::Swapchain) -> XrResult<Vec<<D::Texture as Texture>::Native>>;
    fn acquire_swapchain_image(&self, swapchain: xr::Swapchain) -> XrResult<u32>;
    /// Views of the primary stereo configuration.
    fn enumerate_view_configuration_views(&self) -> XrResult<Vec<xr::ViewConfigurationView>>;
    fn locate_views(&self, info: &xr::ViewLocateInfo) -> XrResult<Vec<xr::View>>;
    fn wait_frame(&self) -> XrResult<xr::FrameState>;
    fn begin_frame(&self) -> XrResult<()>;
    fn end_frame(&self, info: &xr::FrameEndInfo) -> XrResult<()>;
    /// Current runtime time, if the runtime can convert the host clock.
    fn now(&self) -> Option<xr::Time>;
}

/// Something drawn on top of the final image of each eye, such as a menu.
pub trait Overlay<D: Device> {
    fn update_statistics(&mut self, statistics: &LayerStatistics);
    fn render(&mut self, device: &D, eye: usize, target: &Rc<D::Texture>, slice: Slice) -> Result<()>;
}

/// Per-frame averages over the last one second window. Times are microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LayerStatistics {
    pub fps: f32,
    pub app_cpu_us: u64,
    pub app_gpu_us: u64,
    pub end_frame_cpu_us: u64,
    pub pre_processor_gpu_us: u64,
    pub upscaler_gpu_us: u64,
    pub post_processor_gpu_us: u64,
    pub overlay_cpu_us: u64,
    pub overlay_gpu_us: u64,
    pub prediction_us: i64,
}

/// Accumulates [LayerStatistics] and averages them once per window.
#[derive(Debug, Clone)]
pub struct StatisticsWindow {
    started: Instant,
    frames: u32,
    totals: LayerStatistics,
}

impl StatisticsWindow {
    pub const LENGTH: Duration = Duration::from_secs(1);

    pub fn new(now: Instant) -> Self {
        StatisticsWindow {
            started: now,
            frames: 0,
            totals: LayerStatistics::default(),
        }
    }

    pub fn totals_mut(&mut self) -> &mut LayerStatistics {
        &mut self.totals
    }

    pub fn add_stage_times(&mut self, times: &StageTimes) {
        self.totals.pre_processor_gpu_us += times.pre_processor;
        self.totals.upscaler_gpu_us += times.upscaler;
        self.totals.post_processor_gpu_us += times.post_processor;
    }

    /// Counts a frame. Returns the averages when the window is over and starts a new one.
    pub fn frame(&mut self, now: Instant) -> Option<LayerStatistics> {
        self.frames += 1;
        if now.duration_since(self.started) < Self::LENGTH {
            return None;
        }
        let frames = self.frames;
        let t = std::mem::take(&mut self.totals);
        self.started = now;
        self.frames = 0;
        let n = frames as u64;
        Some(LayerStatistics {
            fps: frames as f32,
            app_cpu_us: t.app_cpu_us / n,
            app_gpu_us: t.app_gpu_us / n,
            end_frame_cpu_us: t.end_frame_cpu_us / n,
            pre_processor_gpu_us: t.pre_processor_gpu_us / n,
            upscaler_gpu_us: t.upscaler_gpu_us / n,
            post_processor_gpu_us: t.post_processor_gpu_us / n,
            overlay_cpu_us: t.overlay_cpu_us / n,
            overlay_gpu_us: t.overlay_gpu_us / n,
            prediction_us: t.prediction_us / frames as i64,
        })
    }
}

struct Counters<D: Device> {
    app_cpu: CpuTimer,
    end_frame_cpu: CpuTimer,
    overlay_cpu: CpuTimer,
    app_gpu: TimerRing<D::Timer>,
    overlay_gpu: TimerRing<D::Timer>,
}

struct Session<D: Device> {
    device: Rc<D>,
    stages: Stages<D>,
    /// Scaling parameters latched when the upscaler was created.
    scaling: Option<(ScalingType, i32)>,
    swapchains: HashMap<xr::Swapchain, SwapchainState<D>>,
    counters: Counters<D>,
    window: StatisticsWindow,
    frame: u64,
}

impl<D: Device> Session<D> {
    fn chain_options(&self, display: (u32, u32)) -> ChainOptions {
        ChainOptions {
            pre_processor: self.stages.pre_processor.is_some(),
            upscale_to: self.stages.upscaler.is_some().then_some(display),
            post_processor: self.stages.post_processor.is_some(),
        }
    }
}

/// Patched copies of projection layers that must outlive the call into the runtime.
#[derive(Default)]
struct PatchedLayers {
    projections: Vec<Box<xr::CompositionLayerProjection>>,
    views: Vec<Box<[xr::CompositionLayerProjectionView]>>,
    layers: Vec<*const xr::CompositionLayerBaseHeader>,
}

/// Texture that received the final image of an eye.
struct EyeTarget<D: Device> {
    texture: Rc<D::Texture>,
    slice: Slice,
}

fn fail(error: Error) -> xr::Result {
    logwise::error_sync!(
        "Layer operation failed: {error}",
        error = logwise::privacy::LogIt(&error)
    );
    xr::Result::ERROR_RUNTIME_FAILURE
}

pub struct Layer<D: Device, R: Runtime<D>> {
    runtime: R,
    config: Rc<dyn ConfigProvider>,
    settings: LayerSettings,
    display: (u32, u32),
    session: Option<Session<D>>,
    overlay: Option<Box<dyn Overlay<D>>>,
    screenshot_requested: bool,
    last_statistics: Option<LayerStatistics>,
}

impl<D: Device + 'static, R: Runtime<D>> Layer<D, R> {
    /// Captures the display resolution from the runtime's recommended view size.
    pub fn new(runtime: R, config: Rc<dyn ConfigProvider>, settings: LayerSettings) -> XrResult<Self> {
        let views = runtime.enumerate_view_configuration_views()?;
        let first = views.first().ok_or(xr::Result::ERROR_RUNTIME_FAILURE)?;
        let display = (first.recommended_image_rect_width, first.recommended_image_rect_height);

        config.set_enum_default(Setting::ScalingType, ScalingType::None);
        for setting in [Setting::Scaling, Setting::Sharpness, Setting::Fov, Setting::PredictionDampen] {
            config.set_default(setting, setting.default_value());
        }

        logwise::info_sync!(
            "Display resolution {width}x{height}",
            width = display.0,
            height = display.1
        );
        Ok(Layer {
            runtime,
            config,
            settings,
            display,
            session: None,
            overlay: None,
            screenshot_requested: false,
            last_statistics: None,
        })
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn display_resolution(&self) -> (u32, u32) {
        self.display
    }

    /// Resolution the application is told to render at.
    pub fn application_resolution(&self) -> (u32, u32) {
        match self.config.enum_value::<ScalingType>(Setting::ScalingType) {
            Some(ScalingType::Fsr) => {
                scaled_dimensions(self.display.0, self.display.1, self.config.value(Setting::Scaling))
            }
            Some(ScalingType::None) | None => self.display,
        }
    }

    pub fn set_overlay(&mut self, overlay: Box<dyn Overlay<D>>) {
        self.overlay = Some(overlay);
    }

    /// Asks for the final image of the next frame to be saved.
    pub fn request_screenshot(&mut self) {
        self.screenshot_requested = true;
    }

    /// Latest averages published to the overlay.
    pub fn statistics(&self) -> Option<LayerStatistics> {
        self.last_statistics
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn swapchain(&self, swapchain: xr::Swapchain) -> Option<&SwapchainState<D>> {
        self.session.as_ref()?.swapchains.get(&swapchain)
    }

    pub fn enumerate_view_configuration_views(&self) -> XrResult<Vec<xr::ViewConfigurationView>> {
        let mut views = self.runtime.enumerate_view_configuration_views()?;
        let (width, height) = self.application_resolution();
        if (width, height) != self.display {
            for view in &mut views {
                view.recommended_image_rect_width = width;
                view.recommended_image_rect_height = height;
            }
            logwise::info_sync!(
                "Upscaling from {width}x{height} to {out_w}x{out_h}",
                width = width,
                height = height,
                out_w = self.display.0,
                out_h = self.display.1
            );
        } else {
            logwise::info_sync!(
                "Using OpenXR resolution (no upscaling): {width}x{height}",
                width = width,
                height = height
            );
        }
        Ok(views)
    }

    /// Starts a session with the stages the configuration asks for.
    pub fn create_session(&mut self, device: Rc<D>) -> Result<()> {
        let mut stages = Stages::default();
        if self.config.flag(Setting::PreProcess) {
            stages.pre_processor = Some(Box::new(PassthroughProcessor::new(
                device.clone(),
                &self.settings,
                PRE_PROCESS_SHADER,
            )?));
        }
        let scaling_type = self.config.enum_value::<ScalingType>(Setting::ScalingType);
        if scaling_type == Some(ScalingType::Fsr) && self.application_resolution() != self.display {
            stages.upscaler = Some(Box::new(FsrUpscaler::new(
                device.clone(),
                self.config.clone(),
                &self.settings,
                self.display.0,
                self.display.1,
            )?));
        }
        if self.config.flag(Setting::PostProcess) {
            stages.post_processor = Some(Box::new(PassthroughProcessor::new(
                device.clone(),
                &self.settings,
                POST_PROCESS_SHADER,
            )?));
        }
        self.create_session_with(device, stages)
    }

    /// Starts a session with an explicit set of stages.
    pub fn create_session_with(&mut self, device: Rc<D>, stages: Stages<D>) -> Result<()> {
        let scaling = stages.upscaler.as_ref().map(|_| {
            (
                self.config
                    .enum_value::<ScalingType>(Setting::ScalingType)
                    .unwrap_or(ScalingType::None),
                self.config.value(Setting::Scaling),
            )
        });
        let counters = Counters {
            app_cpu: CpuTimer::new(),
            end_frame_cpu: CpuTimer::new(),
            overlay_cpu: CpuTimer::new(),
            app_gpu: TimerRing::new(|| device.create_timer())?,
            overlay_gpu: TimerRing::new(|| device.create_timer())?,
        };
        logwise::info_sync!(
            "Session created on {device}",
            device = logwise::privacy::LogIt(device.name())
        );
        self.session = Some(Session {
            device,
            stages,
            scaling,
            swapchains: HashMap::new(),
            counters,
            window: StatisticsWindow::new(Instant::now()),
            frame: 0,
        });
        Ok(())
    }

    /// Waits for the GPU, then releases everything the session created.
    pub fn destroy_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if let Err(error) = session.device.flush_context(true) {
            fail(error);
        }
        let Session {
            device,
            stages,
            swapchains,
            counters,
            ..
        } = session;
        drop(stages);
        drop(counters);
        drop(swapchains);
        device.shutdown();
        drop(device);
        logwise::info_sync!("Session destroyed");
    }

    pub fn create_swapchain(&mut self, info: &xr::SwapchainCreateInfo) -> XrResult<xr::Swapchain> {
        let Some(session) = &mut self.session else {
            return self.runtime.create_swapchain(info);
        };
        let app = TextureDesc::from_create_info(info);
        logwise::info_sync!(
            "Creating swapchain with dimensions={width}x{height}, arraySize={array}, mipCount={mips}, sampleCount={samples}, format={format}",
            width = app.width,
            height = app.height,
            array = app.array_size,
            mips = app.mip_count,
            samples = app.sample_count,
            format = logwise::privacy::LogIt(&app.format)
        );
        if !app.has_usage(xr::SwapchainUsageFlags::COLOR_ATTACHMENT) {
            return self.runtime.create_swapchain(info);
        }

        let plan = ChainPlan::new(&*session.device, &app, &session.chain_options(self.display));
        let mut request = *info;
        plan.runtime.apply_to(&mut request);
        let swapchain = self.runtime.create_swapchain(&request)?;
        let images = self.runtime.enumerate_swapchain_images(swapchain)?;
        let state = SwapchainState::new(&*session.device, plan, images).map_err(fail)?;
        session.swapchains.insert(swapchain, state);
        Ok(swapchain)
    }

    pub fn destroy_swapchain(&mut self, swapchain: xr::Swapchain) -> XrResult<()> {
        self.runtime.destroy_swapchain(swapchain)?;
        if let Some(session) = &mut self.session {
            session.swapchains.remove(&swapchain);
        }
        Ok(())
    }

    /// Images the application renders into.
    pub fn enumerate_swapchain_images(&self, swapchain: xr::Swapchain) -> XrResult<Vec<<D::Texture as Texture>::Native>> {
        match self.session.as_ref().and_then(|s| s.swapchains.get(&swapchain)) {
            Some(state) => Ok(state.app_images()),
            None => self.runtime.enumerate_swapchain_images(swapchain),
        }
    }

    pub fn acquire_swapchain_image(&mut self, swapchain: xr::Swapchain) -> XrResult<u32> {
        let index = self.runtime.acquire_swapchain_image(swapchain)?;
        if let Some(state) = self.session.as_mut().and_then(|s| s.swapchains.get_mut(&swapchain)) {
            state.set_acquired(index as usize);
        }
        Ok(index)
    }

    pub fn locate_views(&mut self, info: &xr::ViewLocateInfo) -> XrResult<Vec<xr::View>> {
        let mut views = self.runtime.locate_views(info)?;
        if self.session.is_none()
            || info.view_configuration_type != xr::ViewConfigurationType::PRIMARY_STEREO
            || views.len() < 2
        {
            return Ok(views);
        }

        let ipd = distance(views[0].pose.position, views[1].pose.position);
        let mut icd_tenth_mm = self.config.value(Setting::Icd);
        if icd_tenth_mm == 0 {
            icd_tenth_mm = (ipd * 10000.0) as i32;
            self.config.set_value(Setting::Icd, icd_tenth_mm);
        }
        let icd = icd_tenth_mm as f32 / 10000.0;
        if (ipd - icd).abs() > 0.00005 {
            let (left, right) = views.split_at_mut(1);
            set_separation(&mut left[0].pose.position, &mut right[0].pose.position, icd);
        }

        let fov = self.config.value(Setting::Fov);
        if fov != 100 {
            for view in &mut views {
                scale_fov(&mut view.fov, fov as f32 / 100.0);
            }
        }
        Ok(views)
    }

    pub fn wait_frame(&mut self) -> XrResult<xr::FrameState> {
        let mut state = self.runtime.wait_frame()?;
        let Some(session) = &mut self.session else {
            return Ok(state);
        };
        let dampen = self.config.value(Setting::PredictionDampen);
        if dampen != 100
            && let Some(now) = self.runtime.now()
        {
            let amount = state.predicted_display_time.as_nanos() - now.as_nanos();
            if amount > 0 {
                state.predicted_display_time = xr::Time::from_nanos(now.as_nanos() + dampen as i64 * amount / 100);
            }
            session.window.totals_mut().prediction_us += amount / 1000;
        }
        Ok(state)
    }

    pub fn begin_frame(&mut self) -> XrResult<()> {
        self.runtime.begin_frame()?;
        let Some(session) = &mut self.session else {
            return Ok(());
        };
        let counters = &session.counters;
        counters.app_cpu.start().map_err(fail)?;
        let app_gpu = counters.app_gpu.current(session.frame);
        session.window.totals_mut().app_gpu_us += app_gpu.query(true);
        app_gpu.start().map_err(fail)?;
        Ok(())
    }

    /**
    Runs the processing chains and submits the patched frame.

    # Safety

    `info` must satisfy the `xrEndFrame` validity rules: `layers` points to `layer_count`
    valid layer pointers and every projection layer's `views` to `view_count` views.
    */
    pub unsafe fn end_frame(&mut self, info: &xr::FrameEndInfo) -> XrResult<()> {
        // SAFETY: forwarded from the caller.
        unsafe { self.end_frame_at(info, Instant::now()) }
    }

    /// [Layer::end_frame] with an explicit clock for the statistics window.
    ///
    /// # Safety
    ///
    /// Same as [Layer::end_frame].
    pub unsafe fn end_frame_at(&mut self, info: &xr::FrameEndInfo, now: Instant) -> XrResult<()> {
        if self.session.is_none() {
            return self.runtime.end_frame(info);
        }

        let mut patched = PatchedLayers::default();
        // SAFETY: forwarded from the caller.
        let targets = unsafe { self.process_frame(info, now, &mut patched) }.map_err(fail)?;
        self.render_overlay(&targets).map_err(fail)?;
        self.take_screenshot(&targets);

        let Some(session) = &mut self.session else {
            return Ok(());
        };
        session.device.flush_context(false).map_err(fail)?;
        session.frame += 1;

        let mut submitted = *info;
        submitted.layer_count = patched.layers.len() as u32;
        submitted.layers = if patched.layers.is_empty() {
            std::ptr::null()
        } else {
            patched.layers.as_ptr()
        };
        self.runtime.end_frame(&submitted)
    }

    /// Timers, configuration refresh and the chain walk of every projection layer.
    ///
    /// # Safety
    ///
    /// Same as [Layer::end_frame].
    unsafe fn process_frame(
        &mut self,
        info: &xr::FrameEndInfo,
        now: Instant,
        patched: &mut PatchedLayers,
    ) -> Result<[Option<EyeTarget<D>>; 2]> {
        let display = self.display;
        let fov = self.config.value(Setting::Fov);
        let Some(session) = &mut self.session else {
            return Ok([None, None]);
        };

        if let Some(statistics) = session.window.frame(now) {
            let fps = statistics.fps as u32;
            logwise::trace_sync!("Statistics window closed at {fps} fps", fps = fps);
            if let Some(overlay) = &mut self.overlay {
                overlay.update_statistics(&statistics);
            }
            self.last_statistics = Some(statistics);
        }

        let counters = &session.counters;
        counters.app_cpu.stop();
        session.window.totals_mut().app_cpu_us += counters.app_cpu.query(true);
        counters.app_gpu.current(session.frame).stop();
        session.window.totals_mut().end_frame_cpu_us += counters.end_frame_cpu.query(true);
        counters.end_frame_cpu.start()?;

        self.config.tick();
        session.stages.update()?;
        session.device.unset_render_targets();

        let layers: &[*const xr::CompositionLayerBaseHeader] = if info.layers.is_null() || info.layer_count == 0 {
            &[]
        } else {
            // SAFETY: the caller guarantees `layer_count` valid pointers.
            unsafe { std::slice::from_raw_parts(info.layers, info.layer_count as usize) }
        };

        let mut targets: [Option<EyeTarget<D>>; 2] = [None, None];
        let mut times = StageTimes::default();
        for &layer in layers {
            // SAFETY: every layer pointer is valid and starts with the base header.
            let is_projection =
                !layer.is_null() && unsafe { (*layer).ty } == xr::StructureType::COMPOSITION_LAYER_PROJECTION;
            if !is_projection {
                patched.layers.push(layer);
                continue;
            }
            // SAFETY: the structure type identifies the layer as a projection layer.
            let projection = unsafe { &*(layer as *const xr::CompositionLayerProjection) };
            let source_views: &[xr::CompositionLayerProjectionView] =
                if projection.views.is_null() || projection.view_count == 0 {
                    &[]
                } else {
                    // SAFETY: the caller guarantees `view_count` valid views.
                    unsafe { std::slice::from_raw_parts(projection.views, projection.view_count as usize) }
                };
            let mut views: Box<[xr::CompositionLayerProjectionView]> = source_views.into();

            // Both eyes in one array swapchain.
            let vprt = views.len() >= 2 && views[0].sub_image.swapchain == views[1].sub_image.swapchain;
            for (eye, view) in views.iter_mut().enumerate() {
                let Some(state) = session.swapchains.get(&view.sub_image.swapchain) else {
                    logwise::warn_sync!("Projection view {eye} uses a swapchain without a chain", eye = eye);
                    continue;
                };
                let slice = if vprt {
                    Slice::Index(view.sub_image.image_array_index)
                } else {
                    Slice::All
                };
                let timer_slot = if vprt { eye } else { 0 };
                let texture = state.process(&session.stages, timer_slot, slice, session.frame, &mut times)?;
                if let Some(target) = targets.get_mut(eye) {
                    *target = Some(EyeTarget {
                        texture,
                        slice: if vprt { slice } else { Slice::All },
                    });
                }

                if state.plan().has(StageKind::Upscaler) {
                    view.sub_image.image_rect.extent.width = display.0 as i32;
                    view.sub_image.image_rect.extent.height = display.1 as i32;
                }
                if fov != 100 && fov > 0 {
                    scale_fov(&mut view.fov, 100.0 / fov as f32);
                }
            }

            let mut projection = Box::new(*projection);
            projection.views = views.as_ptr();
            projection.view_count = views.len() as u32;
            patched.layers.push(&*projection as *const xr::CompositionLayerProjection as *const _);
            patched.projections.push(projection);
            patched.views.push(views);
        }
        session.window.add_stage_times(&times);

        // The overlay has its own timers.
        session.counters.end_frame_cpu.stop();
        Ok(targets)
    }

    fn render_overlay(&mut self, targets: &[Option<EyeTarget<D>>; 2]) -> Result<()> {
        let (Some(session), Some(overlay)) = (&mut self.session, &mut self.overlay) else {
            return Ok(());
        };
        if targets[0].is_none() {
            return Ok(());
        }
        let counters = &session.counters;
        let overlay_gpu = counters.overlay_gpu.current(session.frame);
        let totals = session.window.totals_mut();
        totals.overlay_cpu_us += counters.overlay_cpu.query(true);
        totals.overlay_gpu_us += overlay_gpu.query(true);

        counters.overlay_cpu.start()?;
        overlay_gpu.start()?;
        session.device.save_context(false)?;
        for (eye, target) in targets.iter().enumerate() {
            if let Some(target) = target {
                overlay.render(&session.device, eye, &target.texture, target.slice)?;
            }
        }
        session.device.restore_context()?;
        counters.overlay_cpu.stop();
        overlay_gpu.stop();
        Ok(())
    }

    fn take_screenshot(&mut self, targets: &[Option<EyeTarget<D>>; 2]) {
        if !std::mem::take(&mut self.screenshot_requested) || !self.config.flag(Setting::ScreenshotEnabled) {
            return;
        }
        let (Some(session), Some(target)) = (&self.session, &targets[0]) else {
            return;
        };
        let _interval = logwise::perfwarn_begin!("screenshot readback");
        let tag = session.scaling.map(|(scaling_type, scaling)| ScalingTag {
            scaling_type,
            scaling,
            sharpness: self.config.value(Setting::Sharpness),
        });
        let result = session
            .device
            .read_texture(&target.texture, target.slice)
            .and_then(|image| {
                screenshot::save(
                    &image,
                    &self.settings.screenshot_directory,
                    &self.settings.application_name,
                    tag,
                )
            });
        if let Err(error) = result {
            fail(error);
        }
    }
}
