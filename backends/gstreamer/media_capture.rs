/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Opens capture-backed media streams from track constraints.
//!
//! Constraints are translated into a caps filter handed to the capture
//! pipeline, so device negotiation picks a mode the caller accepts.
//! Portal-negotiated sources (displays, cameras) skip constraints and
//! start from the caps their PipeWire node prefers.

use gst::prelude::*;
use log::warn;

use crate::capturer::Capturer;
use crate::desktop_portal::{CameraCaptureManager, DisplayCaptureManager};
use crate::device_monitor::CaptureDeviceRegistry;
use crate::media_stream::{GStreamerMediaStream, MediaStreamTrack};
use crate::pipewire::PipeWireCaptureDevice;
use brook_media_streams::capture::{Constrain, MediaTrackConstraintSet};
use brook_media_streams::registry::MediaStreamId;
use brook_media_streams::MediaStreamType;

trait AddToCaps {
    type Bound;
    fn add_to_caps(
        &self,
        name: &str,
        min: Self::Bound,
        max: Self::Bound,
        builder: gst::caps::Builder<gst::caps::NoFeature>,
    ) -> Option<gst::caps::Builder<gst::caps::NoFeature>>;
}

fn into_i32(x: u32) -> i32 {
    x.min(i32::MAX as u32) as i32
}

impl AddToCaps for Constrain<u32> {
    type Bound = u32;

    fn add_to_caps(
        &self,
        name: &str,
        min: u32,
        max: u32,
        builder: gst::caps::Builder<gst::caps::NoFeature>,
    ) -> Option<gst::caps::Builder<gst::caps::NoFeature>> {
        match self {
            Constrain::Value(value) => Some(builder.field(name, into_i32(*value))),
            Constrain::Range(range) => {
                let min = into_i32(range.min.unwrap_or(min));
                let max = into_i32(range.max.unwrap_or(max));
                // A degenerate range pins the field instead.
                if min >= max {
                    return Some(builder.field(name, min));
                }
                let span = gst::IntRange::new(min, max);
                match range.ideal {
                    Some(ideal) => {
                        let list = gst::List::new([
                            into_i32(ideal).to_send_value(),
                            span.to_send_value(),
                        ]);
                        Some(builder.field(name, list))
                    },
                    None => Some(builder.field(name, span)),
                }
            },
        }
    }
}

impl AddToCaps for Constrain<f64> {
    type Bound = i32;

    fn add_to_caps(
        &self,
        name: &str,
        min: i32,
        max: i32,
        builder: gst::caps::Builder<gst::caps::NoFeature>,
    ) -> Option<gst::caps::Builder<gst::caps::NoFeature>> {
        match self {
            Constrain::Value(value) => {
                Some(builder.field(name, gst::Fraction::approximate_f64(*value)?))
            },
            Constrain::Range(range) => {
                let min = range
                    .min
                    .and_then(gst::Fraction::approximate_f64)
                    .unwrap_or_else(|| gst::Fraction::new(min, 1));
                let max = range
                    .max
                    .and_then(gst::Fraction::approximate_f64)
                    .unwrap_or_else(|| gst::Fraction::new(max, 1));
                if min >= max {
                    return Some(builder.field(name, min));
                }
                let span = gst::FractionRange::new(min, max);
                match range.ideal.and_then(gst::Fraction::approximate_f64) {
                    Some(ideal) => {
                        let list =
                            gst::List::new([ideal.to_send_value(), span.to_send_value()]);
                        Some(builder.field(name, list))
                    },
                    None => Some(builder.field(name, span)),
                }
            },
        }
    }
}

fn into_caps(set: &MediaTrackConstraintSet, format: &str) -> Option<gst::Caps> {
    let mut builder = gst::Caps::builder(format);
    if let Some(width) = set.width {
        builder = width.add_to_caps("width", 1, 1_000_000, builder)?;
    }
    if let Some(height) = set.height {
        builder = height.add_to_caps("height", 1, 1_000_000, builder)?;
    }
    if let Some(aspect) = set.aspect {
        builder = aspect.add_to_caps("pixel-aspect-ratio", 1, 1_000_000, builder)?;
    }
    if let Some(frame_rate) = set.frame_rate {
        builder = frame_rate.add_to_caps("framerate", 0, 1_000_000, builder)?;
    }
    if let Some(sample_rate) = set.sample_rate {
        builder = sample_rate.add_to_caps("rate", 1, 1_000_000, builder)?;
    }
    Some(builder.build())
}

fn create_input_stream(
    registry: &CaptureDeviceRegistry,
    stream_type: MediaStreamType,
    constraints: MediaTrackConstraintSet,
) -> Option<MediaStreamId> {
    let format = match stream_type {
        MediaStreamType::Video => "video/x-raw",
        MediaStreamType::Audio => "audio/x-raw",
    };
    let caps = into_caps(&constraints, format)?;
    // Devices are sorted default first, so the first match wins.
    let device = registry
        .devices()
        .into_iter()
        .find(|device| device.enabled)?;
    let capturer = registry.create_capturer(&device.persistent_id, caps)?;
    capturer.start().ok()?;
    let track = MediaStreamTrack::from_capturer(capturer);
    Some(GStreamerMediaStream::register(track))
}

pub fn create_audioinput_stream(
    registry: &CaptureDeviceRegistry,
    constraints: MediaTrackConstraintSet,
) -> Option<MediaStreamId> {
    create_input_stream(registry, MediaStreamType::Audio, constraints)
}

pub fn create_videoinput_stream(
    registry: &CaptureDeviceRegistry,
    constraints: MediaTrackConstraintSet,
) -> Option<MediaStreamId> {
    create_input_stream(registry, MediaStreamType::Video, constraints)
}

fn stream_from_pipewire_device(device: PipeWireCaptureDevice) -> Option<MediaStreamId> {
    let capturer = Capturer::for_pipewire(device);
    if let Err(err) = capturer.start() {
        warn!("Portal capture pipeline failed to start: {}", err);
        return None;
    }
    let track = MediaStreamTrack::from_capturer(capturer);
    Some(GStreamerMediaStream::register(track))
}

/// Opens a display capture stream, prompting the user through the
/// desktop portal to pick a monitor or window.
pub fn create_display_stream(
    display: &DisplayCaptureManager,
    source_types: u32,
) -> Option<MediaStreamId> {
    let device = display.create_display_device(source_types)?;
    stream_from_pipewire_device(device)
}

/// Opens a stream for one camera node on the portal's PipeWire remote.
pub fn create_camera_stream(
    camera: &CameraCaptureManager,
    node_id: u32,
    label: &str,
) -> Option<MediaStreamId> {
    let device = camera.create_camera_device(node_id, label)?;
    stream_from_pipewire_device(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use brook_media_streams::capture::ConstrainRange;
    use brook_media_streams::registry::get_stream;

    #[test]
    fn value_constraints_pin_caps_fields() {
        test_support::init();
        let set = MediaTrackConstraintSet {
            width: Some(Constrain::Value(1280)),
            height: Some(Constrain::Value(720)),
            frame_rate: Some(Constrain::Value(30.0)),
            ..Default::default()
        };
        let caps = into_caps(&set, "video/x-raw").unwrap();
        let structure = caps.structure(0).unwrap();
        assert_eq!(structure.name(), "video/x-raw");
        assert_eq!(structure.get::<i32>("width"), Ok(1280));
        assert_eq!(structure.get::<i32>("height"), Ok(720));
        assert_eq!(
            structure.get::<gst::Fraction>("framerate"),
            Ok(gst::Fraction::new(30, 1))
        );
    }

    #[test]
    fn range_constraints_become_caps_ranges() {
        test_support::init();
        let set = MediaTrackConstraintSet {
            width: Some(Constrain::Range(ConstrainRange {
                min: Some(320),
                max: Some(1920),
                ideal: None,
            })),
            ..Default::default()
        };
        let caps = into_caps(&set, "video/x-raw").unwrap();
        let structure = caps.structure(0).unwrap();
        let range = structure.get::<gst::IntRange<i32>>("width").unwrap();
        assert_eq!(range.min(), 320);
        assert_eq!(range.max(), 1920);
    }

    #[test]
    fn ideal_values_are_listed_before_the_range() {
        test_support::init();
        let set = MediaTrackConstraintSet {
            height: Some(Constrain::Range(ConstrainRange {
                min: Some(240),
                max: Some(1080),
                ideal: Some(720),
            })),
            ..Default::default()
        };
        let caps = into_caps(&set, "video/x-raw").unwrap();
        let structure = caps.structure(0).unwrap();
        let list = structure.get::<gst::List>("height").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.first().and_then(|v| v.get::<i32>().ok()), Some(720));
    }

    #[test]
    fn degenerate_ranges_collapse_to_a_value() {
        test_support::init();
        let set = MediaTrackConstraintSet {
            width: Some(Constrain::Range(ConstrainRange {
                min: Some(640),
                max: Some(640),
                ideal: None,
            })),
            ..Default::default()
        };
        let caps = into_caps(&set, "video/x-raw").unwrap();
        let structure = caps.structure(0).unwrap();
        assert_eq!(structure.get::<i32>("width"), Ok(640));
    }

    #[test]
    fn audio_constraints_use_the_rate_field() {
        test_support::init();
        let set = MediaTrackConstraintSet {
            sample_rate: Some(Constrain::Value(48000)),
            ..Default::default()
        };
        let caps = into_caps(&set, "audio/x-raw").unwrap();
        let structure = caps.structure(0).unwrap();
        assert_eq!(structure.name(), "audio/x-raw");
        assert_eq!(structure.get::<i32>("rate"), Ok(48000));
    }

    #[test]
    fn input_streams_open_against_mock_devices() {
        test_support::init();
        if !test_support::have_elements(&[
            "videotestsrc",
            "videoscale",
            "videoconvert",
            "capsfilter",
            "valve",
            "queue",
            "appsink",
        ]) {
            return;
        }
        let registry = CaptureDeviceRegistry::for_video();
        registry.add_mock_device(brook_media_streams::capture::CaptureDevice::new(
            "mock-cam".into(),
            brook_media_streams::capture::CaptureDeviceType::Camera,
            "Mock camera".into(),
        ));
        let id = create_videoinput_stream(&registry, MediaTrackConstraintSet::default())
            .unwrap();
        let stream = get_stream(&id).unwrap();
        let stream = stream.lock().unwrap();
        let stream = stream
            .as_any()
            .downcast_ref::<GStreamerMediaStream>()
            .unwrap();
        assert!(stream.track().is_captured());
        registry.teardown();
    }
}
