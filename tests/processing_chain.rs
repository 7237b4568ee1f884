// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Chains, stages and the device contracts they rely on, driven through the headless backend.
#![cfg(feature = "testing")]

use openxr_sys as xr;
use std::path::Path;
use std::rc::Rc;
use xr_postchain::Error;
use xr_postchain::chain::{ChainOptions, ChainPlan, StageKind, StageTimes, SwapchainState};
use xr_postchain::config::{LayerSettings, MemoryConfig, Setting};
use xr_postchain::graphics::format::dxgi;
use xr_postchain::graphics::heap::HeapKind;
use xr_postchain::graphics::{Device, Shader, ShaderBuffer, ShaderKind, ShaderSource, Slice, Texture, TextureDesc, ViewKind};
use xr_postchain::imp::headless::{Command, HeadlessDevice, HeadlessImage, TIMER_TICK_US};
use xr_postchain::stages::processor::{POST_PROCESS_SHADER, PRE_PROCESS_SHADER};
use xr_postchain::stages::{FsrUpscaler, ImageProcessor, PassthroughProcessor, Stages};
use xr_postchain::utilities::scaled_dimensions;

fn app_desc(width: u32, height: u32) -> TextureDesc {
    TextureDesc::new(dxgi::R8G8B8A8_UNORM, width, height).with_usage(xr::SwapchainUsageFlags::COLOR_ATTACHMENT)
}

fn runtime_images(device: &HeadlessDevice, count: usize) -> Vec<HeadlessImage> {
    (0..count).map(|_| device.allocate_image()).collect()
}

fn processors(device: &Rc<HeadlessDevice>, pre: bool, post: bool) -> Stages<HeadlessDevice> {
    let settings = LayerSettings::new("chain test");
    let mut stages = Stages::default();
    if pre {
        stages.pre_processor =
            Some(Box::new(PassthroughProcessor::new(device.clone(), &settings, PRE_PROCESS_SHADER).unwrap()));
    }
    if post {
        stages.post_processor =
            Some(Box::new(PassthroughProcessor::new(device.clone(), &settings, POST_PROCESS_SHADER).unwrap()));
    }
    stages
}

#[test]
fn chain_length_counts_enabled_stages() {
    let device = HeadlessDevice::new();
    let app = app_desc(1334, 1334);
    let cases = [
        (ChainOptions::default(), 1),
        (
            ChainOptions {
                pre_processor: true,
                ..ChainOptions::default()
            },
            2,
        ),
        (
            ChainOptions {
                upscale_to: Some((2000, 2000)),
                ..ChainOptions::default()
            },
            2,
        ),
        (
            ChainOptions {
                pre_processor: true,
                upscale_to: Some((2000, 2000)),
                post_processor: true,
            },
            4,
        ),
    ];
    for (options, expected) in cases {
        let plan = ChainPlan::new(&device, &app, &options);
        assert_eq!(plan.texture_count(), expected, "{options:?}");
        assert_eq!(plan.descs().count(), expected);
    }
}

#[test]
fn upscaling_by_150_percent_renders_at_two_thirds() {
    assert_eq!(scaled_dimensions(2000, 2000, 150), (1334, 1334));
    assert_eq!(scaled_dimensions(2000, 2000, 100), (2000, 2000));

    let device = Rc::new(HeadlessDevice::new());
    let config = Rc::new(MemoryConfig::with_values(&[(Setting::Scaling, 150)]));
    let settings = LayerSettings::new("chain test");
    let fsr = FsrUpscaler::new(device.clone(), config, &settings, 2000, 2000).unwrap();
    assert_eq!(fsr.input_resolution(), (1334, 1334));
    // 16x16 pixels per group.
    assert_eq!(fsr.thread_groups(), Some([125, 125, 1]));
}

#[test]
fn no_scaling_keeps_the_runtime_image_alone() {
    let device = Rc::new(HeadlessDevice::new());
    let plan = ChainPlan::new(&*device, &app_desc(2000, 2000), &ChainOptions::default());
    let images = runtime_images(&device, 3);
    let state = SwapchainState::new(&*device, plan, images.clone()).unwrap();
    assert_eq!(state.image_count(), 3);
    assert_eq!(state.chain(0).unwrap().len(), 1);
    // The application renders straight into the runtime images.
    assert_eq!(state.app_images(), images);
}

#[test]
fn image_travels_through_pre_and_post_processing() {
    let device = Rc::new(HeadlessDevice::new());
    let options = ChainOptions {
        pre_processor: true,
        post_processor: true,
        ..ChainOptions::default()
    };
    let plan = ChainPlan::new(&*device, &app_desc(2, 1), &options);
    let mut state = SwapchainState::new(&*device, plan, runtime_images(&device, 2)).unwrap();
    let stages = processors(&device, true, true);

    state.set_acquired(1);
    let chain = state.chain(1).unwrap().to_vec();
    assert_eq!(chain.len(), 3);

    // Stand in for the application drawing into its texture.
    let drawn = device
        .create_texture(
            &chain[0].desc().with_usage(xr::SwapchainUsageFlags::SAMPLED),
            "drawn",
            Some((&[9u8, 8, 7, 6, 5, 4, 3, 2][..], 8)),
        )
        .unwrap();
    let settings = LayerSettings::new("chain test");
    let copy = PassthroughProcessor::new(device.clone(), &settings, PRE_PROCESS_SHADER).unwrap();
    copy.process(&drawn, &chain[0], Slice::All).unwrap();

    let mut times = StageTimes::default();
    let last = state.process(&stages, 0, Slice::All, 0, &mut times).unwrap();
    assert!(Rc::ptr_eq(&last, &chain[2]));
    assert_eq!(last.pixels(0), vec![9, 8, 7, 6, 5, 4, 3, 2]);
}

#[test]
fn missing_stage_is_reported_as_incomplete() {
    let device = Rc::new(HeadlessDevice::new());
    let options = ChainOptions {
        pre_processor: true,
        post_processor: true,
        ..ChainOptions::default()
    };
    let plan = ChainPlan::new(&*device, &app_desc(4, 4), &options);
    assert!(plan.has(StageKind::PostProcessor));
    let state = SwapchainState::new(&*device, plan, runtime_images(&device, 1)).unwrap();

    // The plan expects a post-processor the session does not have.
    let stages = processors(&device, true, false);
    let mut times = StageTimes::default();
    let result = state.process(&stages, 0, Slice::All, 0, &mut times);
    assert!(matches!(result, Err(Error::ChainIncomplete { next: 1, len: 3 })));
}

#[test]
fn array_swapchains_address_each_eye_by_slice() {
    let device = Rc::new(HeadlessDevice::new());
    let mut app = app_desc(1, 1);
    app.array_size = 2;
    let options = ChainOptions {
        post_processor: true,
        ..ChainOptions::default()
    };
    let plan = ChainPlan::new(&*device, &app, &options);
    let state = SwapchainState::new(&*device, plan, runtime_images(&device, 1)).unwrap();
    let stages = processors(&device, false, true);

    let mut times = StageTimes::default();
    for eye in 0..2 {
        state.process(&stages, eye, Slice::Index(eye as u32), 0, &mut times).unwrap();
    }
    let outputs: Vec<Slice> = device
        .log()
        .snapshot()
        .into_iter()
        .filter_map(|command| match command {
            Command::BindOutput { slice, .. } => Some(slice),
            _ => None,
        })
        .collect();
    assert_eq!(outputs, vec![Slice::Index(0), Slice::Index(1)]);

    let chain = state.chain(0).unwrap();
    assert_eq!(chain[0].views(ViewKind::ShaderInput).materialized(), 2);
    assert_eq!(chain[1].views(ViewKind::RenderTarget).materialized(), 2);
}

#[test]
fn stage_timers_report_three_frames_late() {
    let device = Rc::new(HeadlessDevice::new());
    let options = ChainOptions {
        pre_processor: true,
        ..ChainOptions::default()
    };
    let plan = ChainPlan::new(&*device, &app_desc(2, 2), &options);
    let state = SwapchainState::new(&*device, plan, runtime_images(&device, 1)).unwrap();
    let stages = processors(&device, true, false);

    let mut per_frame = Vec::new();
    for frame in 0..5 {
        let mut times = StageTimes::default();
        state.process(&stages, 0, Slice::All, frame, &mut times).unwrap();
        per_frame.push(times.pre_processor);
    }
    assert_eq!(per_frame, vec![0, 0, 0, TIMER_TICK_US, TIMER_TICK_US]);
}

#[test]
fn views_are_created_once_and_only_when_permitted() {
    let device = HeadlessDevice::new();
    let desc = TextureDesc::new(dxgi::R8G8B8A8_UNORM, 4, 4).with_usage(xr::SwapchainUsageFlags::SAMPLED);
    let texture = device.create_texture(&desc, "input only", None).unwrap();
    let shader = device
        .create_shader(&ShaderSource::new(Path::new("quad.hlsl"), "main"), ShaderKind::Quad, "quad")
        .unwrap();

    device.set_shader(&shader).unwrap();
    device.set_shader_input_texture(0, &texture, Slice::All).unwrap();
    device.set_shader_input_texture(0, &texture, Slice::All).unwrap();
    assert_eq!(texture.views(ViewKind::ShaderInput).materialized(), 1);

    let result = device.set_shader_output(0, &texture, Slice::All);
    assert!(matches!(result, Err(Error::Capability { kind: ViewKind::RenderTarget, .. })));
    assert_eq!(texture.views(ViewKind::RenderTarget).materialized(), 0);
}

#[test]
fn pipelines_resolve_on_first_dispatch() {
    let device = HeadlessDevice::new();
    let shader = device
        .create_shader(
            &ShaderSource::new(Path::new("compute.hlsl"), "mainCS"),
            ShaderKind::Compute { thread_groups: [1, 1, 1] },
            "compute",
        )
        .unwrap();
    let output_desc = TextureDesc::new(dxgi::R10G10B10A2_UNORM, 16, 16).with_usage(xr::SwapchainUsageFlags::UNORDERED_ACCESS);
    let output = device.create_texture(&output_desc, "output", None).unwrap();
    let constants = device.create_buffer(16, "constants", None, false).unwrap();

    for _ in 0..2 {
        assert_eq!(shader.needs_resolve(), shader.pipeline().is_none());
        device.set_shader(&shader).unwrap();
        device.set_shader_input_buffer(0, &constants).unwrap();
        device.set_shader_output(0, &output, Slice::All).unwrap();
        device.dispatch_shader(false).unwrap();
    }
    assert!(!shader.needs_resolve());
    let resolves: Vec<Command> = device
        .log()
        .snapshot()
        .into_iter()
        .filter(|c| matches!(c, Command::Resolve { .. }))
        .collect();
    // Sampler, constant buffer and output.
    assert_eq!(
        resolves,
        vec![Command::Resolve {
            shader: "compute".to_string(),
            parameters: 3
        }]
    );
}

#[test]
fn immutable_buffers_reject_uploads() {
    let device = HeadlessDevice::new();
    let frozen = device.create_buffer(4, "frozen", Some(&[1, 2, 3, 4]), true).unwrap();
    assert!(frozen.is_immutable());
    assert!(matches!(frozen.upload_data(&[0; 4]), Err(Error::Immutable { .. })));
    assert_eq!(frozen.data(), vec![1, 2, 3, 4]);

    let mutable = device.create_buffer(4, "mutable", None, false).unwrap();
    assert!(matches!(
        mutable.upload_data(&[0; 3]),
        Err(Error::UploadSizeMismatch { expected: 4, actual: 3 })
    ));
}

#[test]
fn descriptor_heap_exhaustion_is_an_error() {
    let device = HeadlessDevice::with_heap_capacity(1);
    let desc = TextureDesc::new(dxgi::R8G8B8A8_UNORM, 4, 4).with_usage(xr::SwapchainUsageFlags::SAMPLED);
    let first = device.create_texture(&desc, "first", None).unwrap();
    let second = device.create_texture(&desc, "second", None).unwrap();
    let shader = device
        .create_shader(&ShaderSource::new(Path::new("quad.hlsl"), "main"), ShaderKind::Quad, "quad")
        .unwrap();
    device.set_shader(&shader).unwrap();
    device.set_shader_input_texture(0, &first, Slice::All).unwrap();
    let result = device.set_shader_input_texture(1, &second, Slice::All);
    assert!(matches!(
        result,
        Err(Error::HeapExhausted {
            kind: HeapKind::ShaderResource,
            capacity: 1
        })
    ));
}
