/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! On-demand video frame conversion.
//!
//! Incoming frames can live in system memory, GL memory or DMA-BUF
//! memory; each kind gets its own small conversion pipeline
//! (`appsrc ! converters ! appsink`), built lazily and released again
//! after a period without conversions.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gst::prelude::*;
use log::warn;

/// One buffer has to make it through the pipeline within this window,
/// conversions are synchronous on the caller.
const CONVERT_TIMEOUT: gst::ClockTime = gst::ClockTime::from_mseconds(200);

const IDLE_RELEASE: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MemoryVariant {
    System,
    Gl,
    DmaBuf,
}

pub(crate) fn select_variant(caps: &gst::CapsRef) -> MemoryVariant {
    if let Some(features) = caps.features(0) {
        if features.contains("memory:DMABuf") {
            return MemoryVariant::DmaBuf;
        }
        if features.contains("memory:GLMemory") {
            return MemoryVariant::Gl;
        }
    }
    MemoryVariant::System
}

/// GL pipelines need the GL plugin set; degrade to the system copy
/// path when it is not available.
fn effective_variant(caps: &gst::CapsRef) -> MemoryVariant {
    let variant = select_variant(caps);
    if variant != MemoryVariant::System && gst::ElementFactory::find("glcolorconvert").is_none() {
        return MemoryVariant::System;
    }
    variant
}

/// The converter decides the output framerate by pass-through, only
/// format and size are forced on the sink.
fn caps_without_framerate(caps: &gst::Caps) -> gst::Caps {
    let mut caps = caps.clone();
    {
        let caps = caps.make_mut();
        if let Some(structure) = caps.structure_mut(0) {
            structure.remove_field("framerate");
        }
    }
    caps
}

struct ConvertSlot {
    pipeline: gst::Pipeline,
    src: gst_app::AppSrc,
    sink: gst_app::AppSink,
    last_used: Instant,
}

fn build_slot(variant: MemoryVariant) -> Option<ConvertSlot> {
    let (name, factories): (&str, &[&str]) = match variant {
        MemoryVariant::System => ("frame-converter-system", &["videoconvert", "videoscale"]),
        MemoryVariant::Gl => ("frame-converter-gl", &["glcolorconvert", "gldownload"]),
        MemoryVariant::DmaBuf => (
            "frame-converter-dmabuf",
            &["glupload", "glcolorconvert", "gldownload"],
        ),
    };
    let pipeline = gst::Pipeline::with_name(name);
    let src = gst::ElementFactory::make("appsrc")
        .property("format", gst::Format::Time)
        .build()
        .ok()?
        .downcast::<gst_app::AppSrc>()
        .ok()?;
    let sink = gst::ElementFactory::make("appsink")
        .property("enable-last-sample", false)
        .build()
        .ok()?
        .downcast::<gst_app::AppSink>()
        .ok()?;
    let mut converters = Vec::with_capacity(factories.len());
    for factory in factories {
        converters.push(gst::ElementFactory::make(factory).build().ok()?);
    }
    let mut chain: Vec<&gst::Element> = vec![src.upcast_ref()];
    chain.extend(converters.iter());
    chain.push(sink.upcast_ref());
    pipeline.add_many(chain.iter().copied()).ok()?;
    gst::Element::link_many(chain.iter().copied()).ok()?;
    Some(ConvertSlot {
        pipeline,
        src,
        sink,
        last_used: Instant::now(),
    })
}

struct Slots {
    system: Option<ConvertSlot>,
    gl: Option<ConvertSlot>,
    dmabuf: Option<ConvertSlot>,
    idle_after: Duration,
    prune_pending: bool,
    #[cfg(test)]
    armed_prunes: usize,
}

impl Slots {
    fn slot_mut(&mut self, variant: MemoryVariant) -> &mut Option<ConvertSlot> {
        match variant {
            MemoryVariant::System => &mut self.system,
            MemoryVariant::Gl => &mut self.gl,
            MemoryVariant::DmaBuf => &mut self.dmabuf,
        }
    }
}

fn prune_slots(slots: &mut Slots) {
    let idle_after = slots.idle_after;
    for variant in [
        MemoryVariant::System,
        MemoryVariant::Gl,
        MemoryVariant::DmaBuf,
    ] {
        let slot = slots.slot_mut(variant);
        if slot
            .as_ref()
            .map_or(false, |slot| slot.last_used.elapsed() >= idle_after)
        {
            if let Some(slot) = slot.take() {
                let _ = slot.pipeline.set_state(gst::State::Null);
            }
        }
    }
}

pub struct VideoFrameConverter {
    slots: Arc<Mutex<Slots>>,
}

impl Default for VideoFrameConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoFrameConverter {
    pub fn new() -> VideoFrameConverter {
        Self::with_idle_timeout(IDLE_RELEASE)
    }

    pub fn with_idle_timeout(idle_after: Duration) -> VideoFrameConverter {
        VideoFrameConverter {
            slots: Arc::new(Mutex::new(Slots {
                system: None,
                gl: None,
                dmabuf: None,
                idle_after,
                prune_pending: false,
                #[cfg(test)]
                armed_prunes: 0,
            })),
        }
    }

    /// Converts a frame to `dest_caps`. Frames that already match are
    /// returned untouched. Returns None when the conversion pipeline
    /// cannot be built, errors out or does not finish in time.
    pub fn convert(&self, sample: &gst::Sample, dest_caps: &gst::Caps) -> Option<gst::Sample> {
        let caps = sample.caps()?;
        if caps == dest_caps.as_ref() {
            return Some(sample.clone());
        }
        let variant = effective_variant(caps);

        let mut slots = self.slots.lock().unwrap();
        let mut slot = match slots.slot_mut(variant).take() {
            Some(slot) => slot,
            None => build_slot(variant)?,
        };

        let converted = run_conversion(&mut slot, sample, dest_caps);
        match converted {
            Some(_) => {
                let _ = slot.pipeline.set_state(gst::State::Ready);
                slot.last_used = Instant::now();
                *slots.slot_mut(variant) = Some(slot);
                drop(slots);
                schedule_prune(&self.slots);
            },
            None => {
                // A failed slot is not trusted again; rebuild next time.
                let _ = slot.pipeline.set_state(gst::State::Null);
            },
        }
        converted
    }

    /// Releases conversion pipelines that have been idle long enough.
    pub fn prune_idle(&self) {
        prune_slots(&mut self.slots.lock().unwrap());
    }

    pub fn release_pipelines(&self) {
        let mut slots = self.slots.lock().unwrap();
        for variant in [
            MemoryVariant::System,
            MemoryVariant::Gl,
            MemoryVariant::DmaBuf,
        ] {
            if let Some(slot) = slots.slot_mut(variant).take() {
                let _ = slot.pipeline.set_state(gst::State::Null);
            }
        }
    }

    #[cfg(test)]
    fn has_pipeline(&self, variant: MemoryVariant) -> bool {
        self.slots.lock().unwrap().slot_mut(variant).is_some()
    }

    #[cfg(test)]
    fn armed_prunes(&self) -> usize {
        self.slots.lock().unwrap().armed_prunes
    }
}

/// Arms the idle-release timer unless one is already pending; the
/// timer re-arms itself while any slot survives the prune.
fn schedule_prune(slots: &Arc<Mutex<Slots>>) {
    let delay = {
        let mut guard = slots.lock().unwrap();
        if guard.prune_pending {
            return;
        }
        guard.prune_pending = true;
        #[cfg(test)]
        {
            guard.armed_prunes += 1;
        }
        guard.idle_after.as_secs() as u32 + 1
    };
    let weak = Arc::downgrade(slots);
    glib::timeout_add_seconds_once(delay, move || {
        let Some(slots) = weak.upgrade() else {
            return;
        };
        let still_loaded = {
            let mut guard = slots.lock().unwrap();
            guard.prune_pending = false;
            prune_slots(&mut guard);
            guard.system.is_some() || guard.gl.is_some() || guard.dmabuf.is_some()
        };
        if still_loaded {
            schedule_prune(&slots);
        }
    });
}

fn run_conversion(
    slot: &mut ConvertSlot,
    sample: &gst::Sample,
    dest_caps: &gst::Caps,
) -> Option<gst::Sample> {
    let sink_caps = caps_without_framerate(dest_caps);
    slot.src.set_caps(sample.caps().map(|caps| caps.to_owned()).as_ref());
    slot.sink.set_caps(Some(&sink_caps));
    slot.pipeline.set_state(gst::State::Paused).ok()?;
    slot.src.push_sample(sample).ok()?;

    let bus = slot.pipeline.bus()?;
    match bus.timed_pop_filtered(
        CONVERT_TIMEOUT,
        &[gst::MessageType::AsyncDone, gst::MessageType::Error],
    ) {
        Some(message) => {
            if let gst::MessageView::Error(err) = message.view() {
                warn!("Frame conversion failed: {}", err.error());
                return None;
            }
        },
        None => {
            warn!("Frame conversion timed out");
            return None;
        },
    }

    let converted = slot.sink.try_pull_preroll(CONVERT_TIMEOUT)?;
    rewrite_video_meta(converted)
}

/// Strips metas that referenced the source buffer layout (they would
/// lie about the converted planes) and re-adds a video meta matching
/// the output caps.
fn rewrite_video_meta(sample: gst::Sample) -> Option<gst::Sample> {
    let out_caps = sample.caps()?.to_owned();
    let mut buffer = sample.buffer_owned()?;
    {
        let buffer = buffer.make_mut();
        while let Some(meta) = buffer.meta_mut::<gst_video::VideoMeta>() {
            if meta.remove().is_err() {
                break;
            }
        }
        while let Some(meta) = buffer.meta_mut::<gst::meta::ParentBufferMeta>() {
            if meta.remove().is_err() {
                break;
            }
        }
        if let Ok(info) = gst_video::VideoInfo::from_caps(&out_caps) {
            let _ = gst_video::VideoMeta::add_full(
                buffer,
                gst_video::VideoFrameFlags::empty(),
                info.format(),
                info.width(),
                info.height(),
                info.offset(),
                info.stride(),
            );
        }
    }
    Some(gst::Sample::builder().buffer(&buffer).caps(&out_caps).build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    fn i420_sample(width: u32, height: u32, with_framerate: bool) -> gst::Sample {
        let mut builder = gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", width as i32)
            .field("height", height as i32);
        if with_framerate {
            builder = builder.field("framerate", gst::Fraction::new(30, 1));
        }
        let caps = builder.build();
        let info = gst_video::VideoInfo::from_caps(&caps).unwrap();
        let mut buffer = gst::Buffer::with_size(info.size()).unwrap();
        buffer
            .get_mut()
            .unwrap()
            .set_pts(gst::ClockTime::from_mseconds(40));
        gst::Sample::builder().buffer(&buffer).caps(&caps).build()
    }

    #[test]
    fn variant_follows_caps_features() {
        test_support::init();
        let system = gst::Caps::builder("video/x-raw").build();
        assert_eq!(select_variant(&system), MemoryVariant::System);
        let gl = gst::Caps::builder("video/x-raw")
            .features(["memory:GLMemory"])
            .build();
        assert_eq!(select_variant(&gl), MemoryVariant::Gl);
        let dmabuf = gst::Caps::builder("video/x-raw")
            .features(["memory:DMABuf"])
            .build();
        assert_eq!(select_variant(&dmabuf), MemoryVariant::DmaBuf);
    }

    #[test]
    fn sink_caps_drop_the_framerate() {
        test_support::init();
        let caps = gst::Caps::builder("video/x-raw")
            .field("width", 320)
            .field("framerate", gst::Fraction::new(30, 1))
            .build();
        let stripped = caps_without_framerate(&caps);
        assert!(!stripped.structure(0).unwrap().has_field("framerate"));
        assert!(stripped.structure(0).unwrap().has_field("width"));
    }

    #[test]
    fn matching_caps_short_circuit() {
        test_support::init();
        let sample = i420_sample(320, 240, true);
        let converter = VideoFrameConverter::new();
        let dest = sample.caps().unwrap().to_owned();
        let out = converter.convert(&sample, &dest).unwrap();
        assert_eq!(out.caps(), sample.caps());
        // No pipeline should have been spun up for a pass-through.
        assert!(!converter.has_pipeline(MemoryVariant::System));
    }

    #[test]
    fn converts_and_rescales_system_memory_frames() {
        test_support::init();
        if !test_support::have_elements(&["appsrc", "appsink", "videoconvert", "videoscale"]) {
            return;
        }
        let sample = i420_sample(320, 240, true);
        let dest = gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", 160)
            .field("height", 120)
            .build();
        let converter = VideoFrameConverter::new();
        let out = converter.convert(&sample, &dest).expect("conversion");
        let structure = out.caps().unwrap().structure(0).unwrap();
        assert_eq!(structure.get::<i32>("width"), Ok(160));
        assert_eq!(structure.get::<i32>("height"), Ok(120));
        let buffer = out.buffer().unwrap();
        assert!(buffer.meta::<gst_video::VideoMeta>().is_some());
        assert!(converter.has_pipeline(MemoryVariant::System));
    }

    #[test]
    fn failed_conversions_discard_the_pipeline() {
        test_support::init();
        if !test_support::have_elements(&["appsrc", "appsink", "videoconvert", "videoscale"]) {
            return;
        }
        // A buffer far too small for its declared caps cannot be
        // mapped by the convert chain.
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", 320)
            .field("height", 240)
            .field("framerate", gst::Fraction::new(30, 1))
            .build();
        let buffer = gst::Buffer::with_size(16).unwrap();
        let bad = gst::Sample::builder().buffer(&buffer).caps(&caps).build();
        let dest = gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", 160)
            .field("height", 120)
            .build();

        let converter = VideoFrameConverter::new();
        assert!(converter.convert(&bad, &dest).is_none());
        assert!(!converter.has_pipeline(MemoryVariant::System));

        // The next conversion gets a fresh pipeline and succeeds.
        let good = i420_sample(320, 240, true);
        converter.convert(&good, &dest).expect("conversion");
        assert!(converter.has_pipeline(MemoryVariant::System));
    }

    #[test]
    fn prune_timer_is_armed_once() {
        test_support::init();
        if !test_support::have_elements(&["appsrc", "appsink", "videoconvert", "videoscale"]) {
            return;
        }
        let converter = VideoFrameConverter::new();
        let sample = i420_sample(320, 240, true);
        let dest = gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", 160)
            .field("height", 120)
            .build();
        converter.convert(&sample, &dest).expect("conversion");
        converter.convert(&sample, &dest).expect("conversion");
        assert_eq!(converter.armed_prunes(), 1);
    }

    #[test]
    fn idle_pipelines_are_released_and_rebuilt() {
        test_support::init();
        if !test_support::have_elements(&["appsrc", "appsink", "videoconvert", "videoscale"]) {
            return;
        }
        let converter = VideoFrameConverter::with_idle_timeout(Duration::ZERO);
        let sample = i420_sample(320, 240, true);
        let dest = gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", 160)
            .field("height", 120)
            .build();
        converter.convert(&sample, &dest).expect("conversion");
        assert!(converter.has_pipeline(MemoryVariant::System));
        converter.prune_idle();
        assert!(!converter.has_pipeline(MemoryVariant::System));
        // The next conversion transparently builds a fresh pipeline.
        converter.convert(&sample, &dest).expect("conversion");
        assert!(converter.has_pipeline(MemoryVariant::System));
    }
}
