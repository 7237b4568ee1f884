// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Per-swapchain processing chains.

A chain is the ordered list of textures one swapchain image flows through. The first
entry is what the application renders into, the last is the runtime's own image, and
every enabled stage reads entry `n` and writes entry `n + 1`:

```text
 app (chain[0]) ──pre──▶ chain[1] ──upscale──▶ chain[2] ──post──▶ runtime (chain[3])
```

[ChainPlan] decides the textures once per swapchain from the enabled stages. The frame
walk in [SwapchainState::process] then has to land exactly on the runtime image; anything
else is reported as [Error::ChainIncomplete].
*/

use crate::error::{Error, Result};
use crate::graphics::timer::TimerRing;
use crate::graphics::{Device, GpuTimer, Slice, Texture, TextureDesc, TextureFormat};
use crate::stages::{Stages, UpscaleSource};
use openxr_sys as xr;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    PreProcessor,
    Upscaler,
    PostProcessor,
}

impl StageKind {
    fn texture_name(self, image: usize) -> String {
        match self {
            StageKind::PreProcessor => format!("Preprocess input swapchain {image} TEX2D"),
            StageKind::Upscaler => format!("App swapchain {image} TEX2D"),
            StageKind::PostProcessor => format!("Postprocess input swapchain {image} TEX2D"),
        }
    }
}

/// Which stages a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainOptions {
    pub pre_processor: bool,
    /// Display resolution, when the upscaler is enabled.
    pub upscale_to: Option<(u32, u32)>,
    pub post_processor: bool,
}

/// The stage whose input is `input`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLink {
    pub stage: StageKind,
    pub input: TextureDesc,
}

/// Texture layout of one swapchain's chain, minus the runtime images themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainPlan {
    /// What to request from the runtime.
    pub runtime: TextureDesc,
    pub links: Vec<ChainLink>,
}

impl ChainPlan {
    pub fn new<D: Device>(device: &D, app: &TextureDesc, options: &ChainOptions) -> Self {
        let mut runtime = *app;
        if options.pre_processor {
            runtime = runtime.with_usage(xr::SwapchainUsageFlags::COLOR_ATTACHMENT);
        }
        if let Some((width, height)) = options.upscale_to {
            runtime = runtime
                .with_extent(width, height)
                .with_usage(xr::SwapchainUsageFlags::UNORDERED_ACCESS);
        }
        if options.post_processor {
            runtime = runtime
                .without_usage(xr::SwapchainUsageFlags::UNORDERED_ACCESS)
                .with_usage(xr::SwapchainUsageFlags::COLOR_ATTACHMENT);
        }

        let mut links = Vec::new();
        let app_input = app.with_usage(xr::SwapchainUsageFlags::SAMPLED);
        if options.pre_processor {
            links.push(ChainLink {
                stage: StageKind::PreProcessor,
                input: app_input,
            });
        }
        if options.upscale_to.is_some() {
            links.push(ChainLink {
                stage: StageKind::Upscaler,
                input: app_input,
            });
        }
        if options.post_processor {
            let mut input = runtime.with_usage(xr::SwapchainUsageFlags::SAMPLED);
            if options.upscale_to.is_some() {
                input = input.with_usage(xr::SwapchainUsageFlags::UNORDERED_ACCESS);
                if device.is_texture_format_srgb(input.format) {
                    input.format = device.texture_format(TextureFormat::R10G10B10A2Unorm);
                }
            }
            links.push(ChainLink {
                stage: StageKind::PostProcessor,
                input,
            });
        }
        ChainPlan { runtime, links }
    }

    /// Number of textures per swapchain image.
    pub fn texture_count(&self) -> usize {
        self.links.len() + 1
    }

    /// Texture descriptions in chain order, runtime last.
    pub fn descs(&self) -> impl Iterator<Item = TextureDesc> + '_ {
        self.links.iter().map(|l| l.input).chain(std::iter::once(self.runtime))
    }

    pub fn has(&self, stage: StageKind) -> bool {
        self.links.iter().any(|l| l.stage == stage)
    }
}

/// The two indices a frame walk advances through a chain of `len` textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainCursor {
    last: usize,
    next: usize,
    len: usize,
}

impl ChainCursor {
    pub fn new(len: usize) -> Self {
        ChainCursor { last: 0, next: 0, len }
    }

    /// Moves the write index forward and returns `(read, write)`.
    pub fn begin_stage(&mut self) -> Result<(usize, usize)> {
        self.next += 1;
        if self.next >= self.len {
            return Err(Error::ChainIncomplete {
                next: self.next,
                len: self.len,
            });
        }
        Ok((self.last, self.next))
    }

    pub fn end_stage(&mut self) {
        self.last += 1;
    }

    /// Checks that the walk ended on the runtime image.
    pub fn finish(&self) -> Result<usize> {
        if self.next + 1 != self.len {
            return Err(Error::ChainIncomplete {
                next: self.next,
                len: self.len,
            });
        }
        Ok(self.next)
    }
}

/// GPU time spent per stage, in microseconds, accumulated by [SwapchainState::process].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTimes {
    pub pre_processor: u64,
    pub upscaler: u64,
    pub post_processor: u64,
}

impl StageTimes {
    fn add(&mut self, stage: StageKind, micros: u64) {
        match stage {
            StageKind::PreProcessor => self.pre_processor += micros,
            StageKind::Upscaler => self.upscaler += micros,
            StageKind::PostProcessor => self.post_processor += micros,
        }
    }
}

pub struct SwapchainState<D: Device> {
    plan: ChainPlan,
    /// One chain per swapchain image.
    images: Vec<Vec<Rc<D::Texture>>>,
    acquired: Option<usize>,
    /// Indexed by link, then by eye slot.
    timers: Vec<Vec<TimerRing<D::Timer>>>,
}

impl<D: Device> SwapchainState<D> {
    /// Wraps the runtime images and creates the intermediate textures for every image.
    pub fn new(device: &D, plan: ChainPlan, runtime_images: Vec<<D::Texture as Texture>::Native>) -> Result<Self> {
        let mut images = Vec::with_capacity(runtime_images.len());
        for (index, native) in runtime_images.into_iter().enumerate() {
            let mut chain = Vec::with_capacity(plan.texture_count());
            for link in &plan.links {
                chain.push(device.create_texture(&link.input, &link.stage.texture_name(index), None)?);
            }
            chain.push(device.open_texture(native, &plan.runtime, &format!("Runtime swapchain {index} TEX2D"))?);
            images.push(chain);
        }

        // Array swapchains carry both eyes, which are timed separately.
        let eye_slots = if plan.runtime.array_size > 1 { 2 } else { 1 };
        let mut timers = Vec::with_capacity(plan.links.len());
        for _ in &plan.links {
            let mut per_eye = Vec::with_capacity(eye_slots);
            for _ in 0..eye_slots {
                per_eye.push(TimerRing::new(|| device.create_timer())?);
            }
            timers.push(per_eye);
        }

        logwise::info_sync!(
            "Swapchain chain built with {len} textures for {count} images",
            len = plan.texture_count(),
            count = images.len()
        );
        Ok(SwapchainState {
            plan,
            images,
            acquired: None,
            timers,
        })
    }

    pub fn plan(&self) -> &ChainPlan {
        &self.plan
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Native handles of the application-facing textures, one per swapchain image.
    pub fn app_images(&self) -> Vec<<D::Texture as Texture>::Native> {
        self.images.iter().filter_map(|chain| chain.first()).map(|t| t.native()).collect()
    }

    pub fn chain(&self, image: usize) -> Option<&[Rc<D::Texture>]> {
        self.images.get(image).map(Vec::as_slice)
    }

    pub fn set_acquired(&mut self, image: usize) {
        self.acquired = Some(image);
    }

    pub fn acquired(&self) -> Option<usize> {
        self.acquired
    }

    /**
    Runs the enabled stages over the acquired image for one eye.

    `eye` selects the timer set, `slice` is what the stages read and write. Returns the
    final texture of the chain.
    */
    pub fn process(
        &self,
        stages: &Stages<D>,
        eye: usize,
        slice: Slice,
        frame: u64,
        times: &mut StageTimes,
    ) -> Result<Rc<D::Texture>> {
        let image = self.acquired.unwrap_or(0);
        let chain = self.images.get(image).ok_or(Error::ChainIncomplete {
            next: 0,
            len: self.plan.texture_count(),
        })?;
        let mut cursor = ChainCursor::new(chain.len());

        for (index, link) in self.plan.links.iter().enumerate() {
            let timers = &self.timers[index];
            let timer = timers[eye.min(timers.len() - 1)].current(frame);
            match link.stage {
                StageKind::PreProcessor | StageKind::PostProcessor => {
                    let processor = match link.stage {
                        StageKind::PreProcessor => &stages.pre_processor,
                        _ => &stages.post_processor,
                    };
                    let Some(processor) = processor else {
                        continue;
                    };
                    let (last, next) = cursor.begin_stage()?;
                    times.add(link.stage, timer.query(true));
                    timer.start()?;
                    processor.process(&chain[last], &chain[next], slice)?;
                    timer.stop();
                    cursor.end_stage();
                }
                StageKind::Upscaler => {
                    let Some(upscaler) = &stages.upscaler else {
                        continue;
                    };
                    let (last, next) = cursor.begin_stage()?;
                    times.add(link.stage, timer.query(true));
                    timer.start()?;
                    upscaler.upscale(UpscaleSource::color(&chain[last]), &chain[next], slice)?;
                    timer.stop();
                    cursor.end_stage();
                }
            }
        }

        let last = cursor.finish()?;
        logwise::trace_sync!(
            "Chain walked for eye {eye} through {len} textures",
            eye = eye,
            len = chain.len()
        );
        Ok(chain[last].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::format::dxgi;
    use crate::imp::headless::HeadlessDevice;

    fn app_desc() -> TextureDesc {
        TextureDesc::new(dxgi::R8G8B8A8_UNORM_SRGB, 1334, 1334).with_usage(xr::SwapchainUsageFlags::COLOR_ATTACHMENT)
    }

    #[test]
    fn cursor_lands_on_the_last_texture() {
        let mut cursor = ChainCursor::new(3);
        assert_eq!(cursor.begin_stage().unwrap(), (0, 1));
        cursor.end_stage();
        assert_eq!(cursor.begin_stage().unwrap(), (1, 2));
        cursor.end_stage();
        assert_eq!(cursor.finish().unwrap(), 2);
    }

    #[test]
    fn skipped_stage_leaves_the_chain_incomplete() {
        let mut cursor = ChainCursor::new(3);
        cursor.begin_stage().unwrap();
        cursor.end_stage();
        assert!(matches!(cursor.finish(), Err(Error::ChainIncomplete { next: 1, len: 3 })));
    }

    #[test]
    fn walking_past_the_end_is_an_error() {
        let mut cursor = ChainCursor::new(1);
        assert!(cursor.begin_stage().is_err());
    }

    #[test]
    fn runtime_request_follows_the_stages() {
        let device = HeadlessDevice::new();
        let options = ChainOptions {
            pre_processor: false,
            upscale_to: Some((2000, 2000)),
            post_processor: true,
        };
        let plan = ChainPlan::new(&device, &app_desc(), &options);
        assert_eq!(plan.texture_count(), 3);
        assert_eq!((plan.runtime.width, plan.runtime.height), (2000, 2000));
        assert!(!plan.runtime.has_usage(xr::SwapchainUsageFlags::UNORDERED_ACCESS));
        assert!(plan.runtime.has_usage(xr::SwapchainUsageFlags::COLOR_ATTACHMENT));

        let post = plan.links[1];
        assert_eq!(post.stage, StageKind::PostProcessor);
        assert_eq!(post.input.format, dxgi::R10G10B10A2_UNORM);
        assert!(post.input.has_usage(xr::SwapchainUsageFlags::UNORDERED_ACCESS));
        assert!(post.input.has_usage(xr::SwapchainUsageFlags::SAMPLED));
        assert_eq!((post.input.width, post.input.height), (2000, 2000));
    }

    #[test]
    fn upscaler_alone_writes_the_runtime_image() {
        let device = HeadlessDevice::new();
        let options = ChainOptions {
            upscale_to: Some((2000, 2000)),
            ..ChainOptions::default()
        };
        let plan = ChainPlan::new(&device, &app_desc(), &options);
        let descs: Vec<_> = plan.descs().collect();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].width, 1334);
        assert_eq!(descs[1].width, 2000);
        assert!(descs[1].has_usage(xr::SwapchainUsageFlags::UNORDERED_ACCESS));
        assert!(descs[0].has_usage(xr::SwapchainUsageFlags::SAMPLED));
    }

    #[test]
    fn no_stages_means_runtime_only() {
        let device = HeadlessDevice::new();
        let plan = ChainPlan::new(&device, &app_desc(), &ChainOptions::default());
        assert_eq!(plan.texture_count(), 1);
        assert_eq!(plan.runtime, app_desc());
    }
}
