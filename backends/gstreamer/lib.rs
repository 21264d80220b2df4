/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! GStreamer implementation of the Brook media capture stack.
//!
//! The entry point is [`CaptureContext`], which owns device registries
//! for audio and video capture, the desktop portal client for display
//! capture, and the shared video frame converter. Tracks produced by
//! capturers can be exposed to downstream pipelines through the
//! `brookmediastreamsrc` element.

pub mod capturer;
pub mod desktop_portal;
pub mod device_monitor;
pub mod frame_converter;
pub mod media_capture;
pub mod media_stream;
pub mod media_stream_source;
pub mod pipewire;

use std::sync::{Mutex, Once};

use gst::glib;
use gst::glib::translate::{mut_override, ToGlibPtr};
use gst::prelude::*;
use log::warn;
use once_cell::sync::Lazy;

use crate::desktop_portal::{CameraCaptureManager, DisplayCaptureManager};
use crate::device_monitor::CaptureDeviceRegistry;
use crate::frame_converter::VideoFrameConverter;

/// Base time shared by every capture pipeline so samples from
/// different devices land on a single timeline.
static BACKEND_BASE_TIME: Lazy<gst::ClockTime> =
    Lazy::new(|| gst::SystemClock::obtain().time().unwrap_or(gst::ClockTime::ZERO));

static CAPTURE_PIPELINES: Lazy<Mutex<Vec<glib::WeakRef<gst::Pipeline>>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Tracks a capture pipeline so teardown can reach it even if its
/// capturer leaks.
pub(crate) fn register_capture_pipeline(pipeline: &gst::Pipeline) {
    let mut pipelines = CAPTURE_PIPELINES.lock().unwrap();
    pipelines.retain(|weak| weak.upgrade().is_some());
    pipelines.push(pipeline.downgrade());
}

fn shutdown_capture_pipelines() {
    let pipelines = std::mem::take(&mut *CAPTURE_PIPELINES.lock().unwrap());
    for weak in pipelines {
        if let Some(pipeline) = weak.upgrade() {
            if let Err(err) = pipeline.set_state(gst::State::Null) {
                warn!("Capture pipeline refused to shut down: {}", err);
            }
        }
    }
}

struct FlagsGuard<'a>(&'a glib_sys::GMutex);

impl<'a> FlagsGuard<'a> {
    fn lock(mutex: &'a glib_sys::GMutex) -> Self {
        unsafe { glib_sys::g_mutex_lock(mut_override(mutex)) };
        FlagsGuard(mutex)
    }
}

impl Drop for FlagsGuard<'_> {
    fn drop(&mut self) {
        unsafe { glib_sys::g_mutex_unlock(mut_override(self.0)) };
    }
}

/// Sets raw object flags that have no safe accessor, like the
/// streams-aware bin flag.
pub(crate) fn set_object_flags<T: glib::prelude::IsA<gst::Object>>(object: &T, flags: u32) {
    let object = object.as_ref();
    unsafe {
        let ptr: *mut gstreamer_sys::GstObject = object.to_glib_none().0;
        let _guard = FlagsGuard::lock(&(*ptr).lock);
        (*ptr).flags |= flags;
    }
}

static ELEMENT_REGISTER: Once = Once::new();

/// Registers `brookmediastreamsrc` with the default registry. Safe to
/// call repeatedly.
pub fn ensure_element_registered() {
    ELEMENT_REGISTER.call_once(|| {
        if let Err(err) = media_stream_source::register() {
            warn!("brookmediastreamsrc not registered: {}", err);
        }
    });
}

/// Owner of the capture machinery for one embedder.
pub struct CaptureContext {
    audio_devices: CaptureDeviceRegistry,
    video_devices: CaptureDeviceRegistry,
    display: DisplayCaptureManager,
    camera: CameraCaptureManager,
    frame_converter: VideoFrameConverter,
}

impl CaptureContext {
    pub fn new() -> Result<CaptureContext, glib::Error> {
        gst::init()?;
        ensure_element_registered();
        Ok(CaptureContext {
            audio_devices: CaptureDeviceRegistry::for_audio(),
            video_devices: CaptureDeviceRegistry::for_video(),
            display: DisplayCaptureManager::new(),
            camera: CameraCaptureManager::new(),
            frame_converter: VideoFrameConverter::new(),
        })
    }

    pub fn audio_devices(&self) -> &CaptureDeviceRegistry {
        &self.audio_devices
    }

    pub fn video_devices(&self) -> &CaptureDeviceRegistry {
        &self.video_devices
    }

    pub fn display(&self) -> &DisplayCaptureManager {
        &self.display
    }

    pub fn camera(&self) -> &CameraCaptureManager {
        &self.camera
    }

    pub fn frame_converter(&self) -> &VideoFrameConverter {
        &self.frame_converter
    }

    pub fn create_audioinput_stream(
        &self,
        constraints: brook_media_streams::capture::MediaTrackConstraintSet,
    ) -> Option<brook_media_streams::registry::MediaStreamId> {
        media_capture::create_audioinput_stream(&self.audio_devices, constraints)
    }

    pub fn create_videoinput_stream(
        &self,
        constraints: brook_media_streams::capture::MediaTrackConstraintSet,
    ) -> Option<brook_media_streams::registry::MediaStreamId> {
        media_capture::create_videoinput_stream(&self.video_devices, constraints)
    }

    /// Opens a display capture stream through the desktop portal.
    pub fn create_display_stream(
        &self,
        source_types: u32,
    ) -> Option<brook_media_streams::registry::MediaStreamId> {
        media_capture::create_display_stream(&self.display, source_types)
    }

    /// Opens a portal camera stream for the given PipeWire node.
    pub fn create_camera_stream(
        &self,
        node_id: u32,
        label: &str,
    ) -> Option<brook_media_streams::registry::MediaStreamId> {
        media_capture::create_camera_stream(&self.camera, node_id, label)
    }

    /// Stops every capturer, closes portal sessions and drops cached
    /// conversion pipelines. The context stays usable; registries
    /// restart their monitors on the next enumeration.
    pub fn teardown(&self) {
        self.audio_devices.teardown();
        self.video_devices.teardown();
        self.display.teardown();
        self.camera.teardown();
        self.frame_converter.release_pipelines();
        shutdown_capture_pipelines();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    pub fn init() {
        gst::init().unwrap();
    }

    pub fn have_elements(names: &[&str]) -> bool {
        names
            .iter()
            .all(|name| gst::ElementFactory::find(name).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_builds_and_tears_down() {
        let context = match CaptureContext::new() {
            Ok(context) => context,
            // No GStreamer in this environment, nothing to test.
            Err(_) => return,
        };
        assert!(gst::ElementFactory::find("brookmediastreamsrc").is_some());
        context.teardown();
        // Teardown must not poison the context.
        let _ = context.video_devices().devices();
        context.teardown();
    }

    #[test]
    fn base_time_is_stable() {
        test_support::init();
        let first = *BACKEND_BASE_TIME;
        let second = *BACKEND_BASE_TIME;
        assert_eq!(first, second);
    }

    #[test]
    fn registered_pipelines_are_dropped_on_shutdown() {
        test_support::init();
        let pipeline = gst::Pipeline::new();
        register_capture_pipeline(&pipeline);
        shutdown_capture_pipelines();
        assert_eq!(pipeline.current_state(), gst::State::Null);
        assert!(CAPTURE_PIPELINES.lock().unwrap().is_empty());
    }
}
