// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The layer's intercepted calls against a scripted runtime.
#![cfg(feature = "testing")]

use openxr_sys as xr;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};
use xr_postchain::config::{ConfigEnum, ConfigProvider, LayerSettings, MemoryConfig, ScalingType, Setting};
use xr_postchain::graphics::format::dxgi;
use xr_postchain::graphics::{Slice, Texture};
use xr_postchain::imp::headless::{Command, HeadlessDevice, HeadlessImage, HeadlessTexture};
use xr_postchain::layer::XrResult;
use xr_postchain::{Layer, LayerStatistics, Overlay, Runtime};

const DISPLAY: u32 = 2000;

/// What the runtime saw in one `xrEndFrame`.
#[derive(Debug, Clone)]
struct Submission {
    layer_types: Vec<xr::StructureType>,
    views: Vec<xr::CompositionLayerProjectionView>,
}

struct ScriptedRuntime {
    device: Rc<HeadlessDevice>,
    created: RefCell<Vec<xr::SwapchainCreateInfo>>,
    images: RefCell<HashMap<xr::Swapchain, Vec<HeadlessImage>>>,
    next_handle: Cell<u64>,
    acquire_index: Cell<u32>,
    eye_positions: Cell<[f32; 2]>,
    prediction: Cell<(i64, i64)>,
    submissions: RefCell<Vec<Submission>>,
}

impl ScriptedRuntime {
    fn new(device: Rc<HeadlessDevice>) -> Self {
        ScriptedRuntime {
            device,
            created: RefCell::new(Vec::new()),
            images: RefCell::new(HashMap::new()),
            next_handle: Cell::new(1),
            acquire_index: Cell::new(0),
            eye_positions: Cell::new([-0.03125, 0.03125]),
            prediction: Cell::new((1_000_000, 21_000_000)),
            submissions: RefCell::new(Vec::new()),
        }
    }

    fn images(&self, swapchain: xr::Swapchain) -> Vec<HeadlessImage> {
        self.images.borrow().get(&swapchain).cloned().unwrap_or_default()
    }
}

fn fov() -> xr::Fovf {
    xr::Fovf {
        angle_left: -0.8,
        angle_right: 0.8,
        angle_up: 0.8,
        angle_down: -0.8,
    }
}

fn pose(x: f32) -> xr::Posef {
    xr::Posef {
        orientation: xr::Quaternionf {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        },
        position: xr::Vector3f { x, y: 1.6, z: 0.0 },
    }
}

impl Runtime<HeadlessDevice> for ScriptedRuntime {
    fn create_swapchain(&self, info: &xr::SwapchainCreateInfo) -> XrResult<xr::Swapchain> {
        self.created.borrow_mut().push(*info);
        let handle = xr::Swapchain::from_raw(self.next_handle.get());
        self.next_handle.set(self.next_handle.get() + 1);
        let images = (0..3).map(|_| self.device.allocate_image()).collect();
        self.images.borrow_mut().insert(handle, images);
        Ok(handle)
    }

    fn destroy_swapchain(&self, swapchain: xr::Swapchain) -> XrResult<()> {
        self.images.borrow_mut().remove(&swapchain);
        Ok(())
    }

    fn enumerate_swapchain_images(&self, swapchain: xr::Swapchain) -> XrResult<Vec<HeadlessImage>> {
        self.images
            .borrow()
            .get(&swapchain)
            .cloned()
            .ok_or(xr::Result::ERROR_HANDLE_INVALID)
    }

    fn acquire_swapchain_image(&self, _swapchain: xr::Swapchain) -> XrResult<u32> {
        Ok(self.acquire_index.get())
    }

    fn enumerate_view_configuration_views(&self) -> XrResult<Vec<xr::ViewConfigurationView>> {
        let view = xr::ViewConfigurationView {
            ty: xr::StructureType::VIEW_CONFIGURATION_VIEW,
            next: std::ptr::null_mut(),
            recommended_image_rect_width: DISPLAY,
            max_image_rect_width: 4096,
            recommended_image_rect_height: DISPLAY,
            max_image_rect_height: 4096,
            recommended_swapchain_sample_count: 1,
            max_swapchain_sample_count: 4,
        };
        Ok(vec![view, view])
    }

    fn locate_views(&self, _info: &xr::ViewLocateInfo) -> XrResult<Vec<xr::View>> {
        Ok(self
            .eye_positions
            .get()
            .iter()
            .map(|&x| xr::View {
                ty: xr::StructureType::VIEW,
                next: std::ptr::null_mut(),
                pose: pose(x),
                fov: fov(),
            })
            .collect())
    }

    fn wait_frame(&self) -> XrResult<xr::FrameState> {
        Ok(xr::FrameState {
            ty: xr::StructureType::FRAME_STATE,
            next: std::ptr::null_mut(),
            predicted_display_time: xr::Time::from_nanos(self.prediction.get().1),
            predicted_display_period: xr::Duration::from_nanos(11_111_111),
            should_render: xr::TRUE,
        })
    }

    fn begin_frame(&self) -> XrResult<()> {
        Ok(())
    }

    fn end_frame(&self, info: &xr::FrameEndInfo) -> XrResult<()> {
        let mut submission = Submission {
            layer_types: Vec::new(),
            views: Vec::new(),
        };
        // SAFETY: the layer submits pointers that stay alive for the duration of the call.
        unsafe {
            for index in 0..info.layer_count as usize {
                let layer = *info.layers.add(index);
                submission.layer_types.push((*layer).ty);
                if (*layer).ty == xr::StructureType::COMPOSITION_LAYER_PROJECTION {
                    let projection = &*(layer as *const xr::CompositionLayerProjection);
                    submission
                        .views
                        .extend_from_slice(std::slice::from_raw_parts(projection.views, projection.view_count as usize));
                }
            }
        }
        self.submissions.borrow_mut().push(submission);
        Ok(())
    }

    fn now(&self) -> Option<xr::Time> {
        Some(xr::Time::from_nanos(self.prediction.get().0))
    }
}

fn swapchain_info(width: u32, height: u32, array_size: u32) -> xr::SwapchainCreateInfo {
    xr::SwapchainCreateInfo {
        ty: xr::StructureType::SWAPCHAIN_CREATE_INFO,
        next: std::ptr::null(),
        create_flags: xr::SwapchainCreateFlags::EMPTY,
        usage_flags: xr::SwapchainUsageFlags::COLOR_ATTACHMENT | xr::SwapchainUsageFlags::SAMPLED,
        format: dxgi::R8G8B8A8_UNORM,
        sample_count: 1,
        width,
        height,
        face_count: 1,
        array_size,
        mip_count: 1,
    }
}

fn projection_view(swapchain: xr::Swapchain, width: u32, height: u32, array_index: u32) -> xr::CompositionLayerProjectionView {
    xr::CompositionLayerProjectionView {
        ty: xr::StructureType::COMPOSITION_LAYER_PROJECTION_VIEW,
        next: std::ptr::null(),
        pose: pose(0.0),
        fov: fov(),
        sub_image: xr::SwapchainSubImage {
            swapchain,
            image_rect: xr::Rect2Di {
                offset: xr::Offset2Di { x: 0, y: 0 },
                extent: xr::Extent2Di {
                    width: width as i32,
                    height: height as i32,
                },
            },
            image_array_index: array_index,
        },
    }
}

/// Submits one projection layer with `views`, preceded by a quad layer.
fn submit(layer: &mut Layer<HeadlessDevice, ScriptedRuntime>, views: &[xr::CompositionLayerProjectionView], now: Instant) -> XrResult<()> {
    let projection = xr::CompositionLayerProjection {
        ty: xr::StructureType::COMPOSITION_LAYER_PROJECTION,
        next: std::ptr::null(),
        layer_flags: xr::CompositionLayerFlags::EMPTY,
        space: xr::Space::from_raw(7),
        view_count: views.len() as u32,
        views: views.as_ptr(),
    };
    // Only the header of a non-projection layer is read.
    let quad = xr::CompositionLayerBaseHeader {
        ty: xr::StructureType::COMPOSITION_LAYER_QUAD,
        next: std::ptr::null(),
        layer_flags: xr::CompositionLayerFlags::EMPTY,
        space: xr::Space::from_raw(7),
    };
    let layers: [*const xr::CompositionLayerBaseHeader; 2] = [
        &quad,
        &projection as *const xr::CompositionLayerProjection as *const xr::CompositionLayerBaseHeader,
    ];
    let info = xr::FrameEndInfo {
        ty: xr::StructureType::FRAME_END_INFO,
        next: std::ptr::null(),
        display_time: xr::Time::from_nanos(21_000_000),
        environment_blend_mode: xr::EnvironmentBlendMode::OPAQUE,
        layer_count: layers.len() as u32,
        layers: layers.as_ptr(),
    };
    layer.begin_frame()?;
    // SAFETY: every pointer above outlives the call.
    unsafe { layer.end_frame_at(&info, now) }
}

fn layer_with(values: &[(Setting, i32)]) -> (Rc<HeadlessDevice>, Rc<MemoryConfig>, Layer<HeadlessDevice, ScriptedRuntime>) {
    let device = Rc::new(HeadlessDevice::new());
    let config = Rc::new(MemoryConfig::with_values(values));
    let mut settings = LayerSettings::new("frame test");
    settings.screenshot_directory = std::env::temp_dir().join("xr_postchain_frame_submission");
    let layer = Layer::new(ScriptedRuntime::new(device.clone()), config.clone(), settings).unwrap();
    (device, config, layer)
}

fn fsr_150() -> [(Setting, i32); 3] {
    [
        (Setting::ScalingType, ScalingType::Fsr.to_value()),
        (Setting::Scaling, 150),
        (Setting::PostProcess, 0),
    ]
}

#[test]
fn recommended_size_follows_the_scaling_setting() {
    let (_, _, layer) = layer_with(&fsr_150());
    assert_eq!(layer.display_resolution(), (DISPLAY, DISPLAY));
    let views = layer.enumerate_view_configuration_views().unwrap();
    assert!(views.iter().all(|v| v.recommended_image_rect_width == 1334 && v.recommended_image_rect_height == 1334));

    let (_, _, layer) = layer_with(&[(Setting::Scaling, 150)]);
    let views = layer.enumerate_view_configuration_views().unwrap();
    assert_eq!(views[0].recommended_image_rect_width, DISPLAY);
}

#[test]
fn swapchains_without_a_session_pass_through() {
    let (_, _, mut layer) = layer_with(&fsr_150());
    let swapchain = layer.create_swapchain(&swapchain_info(1334, 1334, 1)).unwrap();
    assert!(layer.swapchain(swapchain).is_none());
    assert_eq!(layer.runtime().created.borrow()[0].width, 1334);
    assert_eq!(
        layer.enumerate_swapchain_images(swapchain).unwrap(),
        layer.runtime().images(swapchain)
    );
}

#[test]
fn upscaled_frames_are_submitted_at_display_resolution() {
    let (device, _, mut layer) = layer_with(&fsr_150());
    layer.create_session(device.clone()).unwrap();
    let left = layer.create_swapchain(&swapchain_info(1334, 1334, 1)).unwrap();
    let right = layer.create_swapchain(&swapchain_info(1334, 1334, 1)).unwrap();

    let request = layer.runtime().created.borrow()[0];
    assert_eq!((request.width, request.height), (DISPLAY, DISPLAY));
    assert!(request.usage_flags.contains(xr::SwapchainUsageFlags::UNORDERED_ACCESS));

    // The application gets the layer's own textures, not the runtime's.
    let app_images = layer.enumerate_swapchain_images(left).unwrap();
    assert_eq!(app_images.len(), 3);
    assert!(app_images.iter().all(|i| !layer.runtime().images(left).contains(i)));

    layer.runtime().acquire_index.set(2);
    layer.acquire_swapchain_image(left).unwrap();
    layer.acquire_swapchain_image(right).unwrap();
    assert_eq!(layer.swapchain(left).unwrap().acquired(), Some(2));

    let views = [projection_view(left, 1334, 1334, 0), projection_view(right, 1334, 1334, 0)];
    submit(&mut layer, &views, Instant::now()).unwrap();

    let submissions = layer.runtime().submissions.borrow();
    let submitted = &submissions[0];
    assert_eq!(
        submitted.layer_types,
        vec![
            xr::StructureType::COMPOSITION_LAYER_QUAD,
            xr::StructureType::COMPOSITION_LAYER_PROJECTION
        ]
    );
    for (view, swapchain) in submitted.views.iter().zip([left, right]) {
        assert_eq!(view.sub_image.swapchain, swapchain);
        assert_eq!(view.sub_image.image_rect.extent.width, DISPLAY as i32);
        assert_eq!(view.sub_image.image_rect.extent.height, DISPLAY as i32);
        assert_eq!(view.fov.angle_left, fov().angle_left);
    }

    let dispatches = device.log().count(|c| matches!(c, Command::Dispatch { .. }));
    // EASU and RCAS for each eye.
    assert_eq!(dispatches, 4);
    assert_eq!(device.log().count(|c| matches!(c, Command::Flush { blocking: false })), 1);
}

#[test]
fn upscaled_sessions_run_for_many_frames() {
    let (device, _, mut layer) = layer_with(&fsr_150());
    layer.create_session(device.clone()).unwrap();
    let left = layer.create_swapchain(&swapchain_info(1334, 1334, 1)).unwrap();
    let right = layer.create_swapchain(&swapchain_info(1334, 1334, 1)).unwrap();
    let views = [projection_view(left, 1334, 1334, 0), projection_view(right, 1334, 1334, 0)];

    for frame in 0..300u32 {
        layer.runtime().acquire_index.set(frame % 3);
        layer.acquire_swapchain_image(left).unwrap();
        layer.acquire_swapchain_image(right).unwrap();
        assert_eq!(submit(&mut layer, &views, Instant::now()), Ok(()), "frame {frame}");
    }
    assert_eq!(layer.runtime().submissions.borrow().len(), 300);
    assert_eq!(device.log().count(|c| matches!(c, Command::Dispatch { .. })), 300 * 4);
}

#[test]
fn array_swapchains_are_processed_per_slice() {
    let (device, _, mut layer) = layer_with(&[(Setting::PostProcess, 1)]);
    layer.create_session(device.clone()).unwrap();
    let swapchain = layer.create_swapchain(&swapchain_info(4, 4, 2)).unwrap();
    layer.acquire_swapchain_image(swapchain).unwrap();

    let views = [projection_view(swapchain, 4, 4, 0), projection_view(swapchain, 4, 4, 1)];
    submit(&mut layer, &views, Instant::now()).unwrap();

    let outputs: Vec<Slice> = device
        .log()
        .snapshot()
        .into_iter()
        .filter_map(|c| match c {
            Command::BindOutput { slice, .. } => Some(slice),
            _ => None,
        })
        .collect();
    assert_eq!(outputs, vec![Slice::Index(0), Slice::Index(1)]);
    // Without upscaling the extent is left alone.
    let submissions = layer.runtime().submissions.borrow();
    assert_eq!(submissions[0].views[1].sub_image.image_rect.extent.width, 4);
    assert_eq!(submissions[0].views[1].sub_image.image_array_index, 1);
}

#[test]
fn fov_override_is_reverted_at_submission() {
    let (device, config, mut layer) = layer_with(&[(Setting::Fov, 80)]);
    layer.create_session(device).unwrap();

    let info = xr::ViewLocateInfo {
        ty: xr::StructureType::VIEW_LOCATE_INFO,
        next: std::ptr::null(),
        view_configuration_type: xr::ViewConfigurationType::PRIMARY_STEREO,
        display_time: xr::Time::from_nanos(0),
        space: xr::Space::from_raw(7),
    };
    let located = layer.locate_views(&info).unwrap();
    assert!((located[0].fov.angle_right - 0.64).abs() < 1e-6);
    assert!((located[1].fov.angle_down + 0.64).abs() < 1e-6);

    let swapchain = layer.create_swapchain(&swapchain_info(4, 4, 1)).unwrap();
    layer.acquire_swapchain_image(swapchain).unwrap();
    let mut view = projection_view(swapchain, 4, 4, 0);
    view.fov = located[0].fov;
    submit(&mut layer, &[view], Instant::now()).unwrap();

    let submitted = layer.runtime().submissions.borrow()[0].views[0];
    assert!((submitted.fov.angle_right - 0.8).abs() < 1e-6);
    assert_eq!(config.value(Setting::Fov), 80);
}

#[test]
fn eye_separation_is_captured_then_overridden() {
    let (device, config, mut layer) = layer_with(&[]);
    layer.create_session(device).unwrap();
    let info = xr::ViewLocateInfo {
        ty: xr::StructureType::VIEW_LOCATE_INFO,
        next: std::ptr::null(),
        view_configuration_type: xr::ViewConfigurationType::PRIMARY_STEREO,
        display_time: xr::Time::from_nanos(0),
        space: xr::Space::from_raw(7),
    };

    let located = layer.locate_views(&info).unwrap();
    // 62.5 mm, stored in tenths of a millimeter.
    assert_eq!(config.value(Setting::Icd), 625);
    assert!((located[1].pose.position.x - 0.03125).abs() < 1e-6);

    config.set_value(Setting::Icd, 700);
    let located = layer.locate_views(&info).unwrap();
    let separation = located[1].pose.position.x - located[0].pose.position.x;
    assert!((separation - 0.07).abs() < 1e-5);
    // Centered on the measured midpoint.
    assert!((located[0].pose.position.x + located[1].pose.position.x).abs() < 1e-6);
}

#[test]
fn prediction_is_dampened_towards_now() {
    let (device, _, mut layer) = layer_with(&[(Setting::PredictionDampen, 50)]);
    // Without a session the runtime's prediction is untouched.
    assert_eq!(layer.wait_frame().unwrap().predicted_display_time.as_nanos(), 21_000_000);

    layer.create_session(device).unwrap();
    let state = layer.wait_frame().unwrap();
    assert_eq!(state.predicted_display_time.as_nanos(), 11_000_000);
}

#[derive(Default)]
struct OverlayLog {
    statistics: Vec<LayerStatistics>,
    renders: Vec<(usize, String)>,
}

struct RecordingOverlay(Rc<RefCell<OverlayLog>>);

impl Overlay<HeadlessDevice> for RecordingOverlay {
    fn update_statistics(&mut self, statistics: &LayerStatistics) {
        self.0.borrow_mut().statistics.push(*statistics);
    }

    fn render(
        &mut self,
        device: &HeadlessDevice,
        eye: usize,
        target: &Rc<HeadlessTexture>,
        _slice: Slice,
    ) -> xr_postchain::Result<()> {
        assert!(device.is_in_secondary_context());
        self.0.borrow_mut().renders.push((eye, target.debug_name().to_string()));
        Ok(())
    }
}

#[test]
fn overlay_draws_on_the_final_images_and_receives_statistics() {
    let (device, _, mut layer) = layer_with(&[]);
    let log = Rc::new(RefCell::new(OverlayLog::default()));
    layer.set_overlay(Box::new(RecordingOverlay(log.clone())));
    layer.create_session(device.clone()).unwrap();
    let left = layer.create_swapchain(&swapchain_info(4, 4, 1)).unwrap();
    let right = layer.create_swapchain(&swapchain_info(4, 4, 1)).unwrap();
    layer.acquire_swapchain_image(left).unwrap();
    layer.acquire_swapchain_image(right).unwrap();
    let views = [projection_view(left, 4, 4, 0), projection_view(right, 4, 4, 0)];

    let start = Instant::now();
    submit(&mut layer, &views, start + Duration::from_millis(400)).unwrap();
    assert!(layer.statistics().is_none());
    submit(&mut layer, &views, start + Duration::from_millis(1500)).unwrap();

    let statistics = layer.statistics().unwrap();
    assert_eq!(statistics.fps, 2.0);
    let log = log.borrow();
    assert_eq!(log.statistics, vec![statistics]);
    assert_eq!(log.renders.len(), 4);
    assert_eq!(log.renders[0], (0, "Runtime swapchain 0 TEX2D".to_string()));
    assert_eq!(log.renders[1].0, 1);
    assert!(!device.is_in_secondary_context());
}

#[test]
fn screenshot_saves_the_final_image_once() {
    let (device, _, mut layer) = layer_with(&fsr_150());
    let directory = std::env::temp_dir().join("xr_postchain_frame_submission");
    let _ = std::fs::remove_dir_all(&directory);
    std::fs::create_dir_all(&directory).unwrap();

    layer.create_session(device.clone()).unwrap();
    let swapchain = layer.create_swapchain(&swapchain_info(1334, 1334, 1)).unwrap();
    layer.acquire_swapchain_image(swapchain).unwrap();
    let views = [projection_view(swapchain, 1334, 1334, 0)];

    layer.request_screenshot();
    submit(&mut layer, &views, Instant::now()).unwrap();
    submit(&mut layer, &views, Instant::now()).unwrap();

    assert_eq!(device.log().count(|c| matches!(c, Command::ReadTexture { .. })), 1);
    let files: Vec<String> = std::fs::read_dir(&directory)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with("frame test_"));
    assert!(files[0].ends_with("_FSR_150_20.png"));
}

#[test]
fn destroying_the_session_flushes_and_shuts_down() {
    let (device, _, mut layer) = layer_with(&[]);
    layer.create_session(device.clone()).unwrap();
    let swapchain = layer.create_swapchain(&swapchain_info(4, 4, 1)).unwrap();
    assert!(layer.swapchain(swapchain).is_some());

    layer.destroy_session();
    assert!(!layer.has_session());
    let tail: Vec<Command> = device.log().snapshot().into_iter().rev().take(2).collect();
    assert_eq!(tail, vec![Command::Shutdown, Command::Flush { blocking: true }]);
}
