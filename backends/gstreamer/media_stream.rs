/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Media stream tracks and their sources.
//!
//! A track carries either capture output, media decoded from a remote
//! peer, or application-generated frames. Consumers observe tracks for
//! samples; the track itself only fans out and never buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use byte_slice_cast::AsMutSliceOf;
use gst::prelude::*;
use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::capturer::{Capturer, CapturerObserver};
use brook_media_streams::registry::{register_stream, unregister_stream, MediaStreamId};
use brook_media_streams::{MediaStream, MediaStreamType};

/// Rotation to apply to video frames before display, clockwise.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum VideoRotation {
    #[default]
    None,
    Right,
    UpsideDown,
    Left,
}

impl VideoRotation {
    /// Value for the GStreamer `image-orientation` tag.
    pub fn image_orientation(self, mirrored: bool) -> &'static str {
        match (self, mirrored) {
            (VideoRotation::None, false) => "rotate-0",
            (VideoRotation::Right, false) => "rotate-90",
            (VideoRotation::UpsideDown, false) => "rotate-180",
            (VideoRotation::Left, false) => "rotate-270",
            (VideoRotation::None, true) => "flip-rotate-0",
            (VideoRotation::Right, true) => "flip-rotate-90",
            (VideoRotation::UpsideDown, true) => "flip-rotate-180",
            (VideoRotation::Left, true) => "flip-rotate-270",
        }
    }

    /// Quarter turns swap the displayed width and height.
    pub fn swaps_dimensions(self) -> bool {
        matches!(self, VideoRotation::Right | VideoRotation::Left)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VideoFrameMetadata {
    pub rotation: VideoRotation,
    pub mirrored: bool,
}

pub trait VideoFrameObserver: Send + Sync {
    fn video_frame_available(&self, sample: &gst::Sample, metadata: VideoFrameMetadata);
}

pub trait AudioSampleObserver: Send + Sync {
    fn audio_sample_available(&self, sample: &gst::Sample);
}

pub trait TrackObserver: Send + Sync {
    fn track_enabled_changed(&self, _track: &MediaStreamTrack) {}
    fn track_ended(&self, _track: &MediaStreamTrack) {}
    fn track_settings_changed(&self, _track: &MediaStreamTrack) {}
}

/// Media decoded outside the capture machinery, typically an RTC
/// receiver. The bridge registers as a client so the producer can tell
/// whether anyone still consumes it.
pub trait IncomingMediaSource: Send + Sync {
    fn register_client(&self) -> usize;
    fn unregister_client(&self, client: usize);
    fn has_client(&self, client: usize) -> bool;
    /// Gives the producer a chance to handle events travelling
    /// upstream, like force-key-unit requests.
    fn handle_upstream_event(&self, event: gst::Event) -> bool {
        let _ = event;
        false
    }
    fn is_ended(&self) -> bool {
        false
    }
}

pub enum TrackSource {
    Capture(Arc<Capturer>),
    Incoming(Arc<dyn IncomingMediaSource>),
    App,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TrackSettings {
    pub width: i32,
    pub height: i32,
    pub frame_rate: f64,
}

pub struct MediaStreamTrack {
    id: String,
    stream_type: MediaStreamType,
    label: String,
    source: TrackSource,
    enabled: AtomicBool,
    ended: AtomicBool,
    settings: Mutex<TrackSettings>,
    orientation: Mutex<VideoFrameMetadata>,
    video_observers: Mutex<Vec<Weak<dyn VideoFrameObserver>>>,
    audio_observers: Mutex<Vec<Weak<dyn AudioSampleObserver>>>,
    track_observers: Mutex<Vec<Weak<dyn TrackObserver>>>,
    // Keeps the capturer-to-track forwarding adapter alive.
    capture_bridge: Mutex<Option<Arc<CaptureBridge>>>,
}

impl MediaStreamTrack {
    pub fn new(
        stream_type: MediaStreamType,
        label: String,
        source: TrackSource,
    ) -> Arc<MediaStreamTrack> {
        Arc::new(MediaStreamTrack {
            id: Uuid::new_v4().to_string(),
            stream_type,
            label,
            source,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            settings: Mutex::new(TrackSettings::default()),
            orientation: Mutex::new(VideoFrameMetadata::default()),
            video_observers: Mutex::new(Vec::new()),
            audio_observers: Mutex::new(Vec::new()),
            track_observers: Mutex::new(Vec::new()),
            capture_bridge: Mutex::new(None),
        })
    }

    /// Builds a track fed by a capturer and wires the sample flow up.
    pub fn from_capturer(capturer: Arc<Capturer>) -> Arc<MediaStreamTrack> {
        let label = capturer
            .device()
            .map(|device| device.label)
            .unwrap_or_default();
        let stream_type = capturer.stream_type();
        let track = Self::new(stream_type, label, TrackSource::Capture(capturer.clone()));
        let bridge = Arc::new(CaptureBridge {
            track: Arc::downgrade(&track),
        });
        capturer.add_observer(bridge.clone() as Arc<dyn CapturerObserver>);
        *track.capture_bridge.lock().unwrap() = Some(bridge);
        track
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_type(&self) -> MediaStreamType {
        self.stream_type
    }

    pub fn is_video(&self) -> bool {
        self.stream_type == MediaStreamType::Video
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn source(&self) -> &TrackSource {
        &self.source
    }

    pub fn is_captured(&self) -> bool {
        matches!(self.source, TrackSource::Capture(_))
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }
        self.for_each_track_observer(|observer| observer.track_enabled_changed(self));
    }

    pub fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn mark_ended(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.for_each_track_observer(|observer| observer.track_ended(self));
    }

    pub fn settings(&self) -> TrackSettings {
        *self.settings.lock().unwrap()
    }

    pub fn set_settings(&self, settings: TrackSettings) {
        {
            let mut current = self.settings.lock().unwrap();
            if *current == settings {
                return;
            }
            *current = settings;
        }
        self.for_each_track_observer(|observer| observer.track_settings_changed(self));
    }

    pub fn orientation(&self) -> VideoFrameMetadata {
        *self.orientation.lock().unwrap()
    }

    pub fn set_orientation(&self, metadata: VideoFrameMetadata) {
        *self.orientation.lock().unwrap() = metadata;
    }

    pub fn add_video_observer(&self, observer: Arc<dyn VideoFrameObserver>) {
        let mut observers = self.video_observers.lock().unwrap();
        observers.retain(|weak| weak.strong_count() > 0);
        observers.push(Arc::downgrade(&observer));
    }

    pub fn remove_video_observer(&self, observer: &Arc<dyn VideoFrameObserver>) {
        let target = Arc::downgrade(observer);
        self.video_observers
            .lock()
            .unwrap()
            .retain(|weak| !Weak::ptr_eq(weak, &target));
    }

    pub fn add_audio_observer(&self, observer: Arc<dyn AudioSampleObserver>) {
        let mut observers = self.audio_observers.lock().unwrap();
        observers.retain(|weak| weak.strong_count() > 0);
        observers.push(Arc::downgrade(&observer));
    }

    pub fn remove_audio_observer(&self, observer: &Arc<dyn AudioSampleObserver>) {
        let target = Arc::downgrade(observer);
        self.audio_observers
            .lock()
            .unwrap()
            .retain(|weak| !Weak::ptr_eq(weak, &target));
    }

    pub fn add_track_observer(&self, observer: Arc<dyn TrackObserver>) {
        let mut observers = self.track_observers.lock().unwrap();
        observers.retain(|weak| weak.strong_count() > 0);
        observers.push(Arc::downgrade(&observer));
    }

    pub fn remove_track_observer(&self, observer: &Arc<dyn TrackObserver>) {
        let target = Arc::downgrade(observer);
        self.track_observers
            .lock()
            .unwrap()
            .retain(|weak| !Weak::ptr_eq(weak, &target));
    }

    pub fn notify_video_frame(&self, sample: &gst::Sample, metadata: VideoFrameMetadata) {
        let observers: Vec<_> = self
            .video_observers
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in observers {
            observer.video_frame_available(sample, metadata);
        }
    }

    pub fn notify_audio_sample(&self, sample: &gst::Sample) {
        let observers: Vec<_> = self
            .audio_observers
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in observers {
            observer.audio_sample_available(sample);
        }
    }

    fn for_each_track_observer(&self, f: impl Fn(&dyn TrackObserver)) {
        let observers: Vec<_> = self
            .track_observers
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in observers {
            f(&*observer);
        }
    }

    /// Capture latency as negotiated by the capture pipeline. Only
    /// meaningful for captured tracks.
    pub fn query_capture_latency(&self) -> Option<(gst::ClockTime, Option<gst::ClockTime>)> {
        match &self.source {
            TrackSource::Capture(capturer) => capturer.query_latency(),
            _ => None,
        }
    }
}

struct CaptureBridge {
    track: Weak<MediaStreamTrack>,
}

impl CapturerObserver for CaptureBridge {
    fn sample_available(&self, sample: gst::Sample) {
        let Some(track) = self.track.upgrade() else {
            return;
        };
        match track.stream_type() {
            MediaStreamType::Video => {
                let metadata = track.orientation();
                track.notify_video_frame(&sample, metadata);
            },
            MediaStreamType::Audio => track.notify_audio_sample(&sample),
        }
    }

    fn capture_ended(&self) {
        if let Some(track) = self.track.upgrade() {
            track.mark_ended();
        }
    }

    fn caps_changed(&self, caps: &gst::Caps) {
        let Some(track) = self.track.upgrade() else {
            return;
        };
        if let Ok(info) = gst_video::VideoInfo::from_caps(caps) {
            let mut settings = track.settings();
            settings.width = info.width() as i32;
            settings.height = info.height() as i32;
            let fps = info.fps();
            if fps.numer() > 0 {
                settings.frame_rate = fps.numer() as f64 / fps.denom() as f64;
            }
            track.set_settings(settings);
        }
    }
}

/// Registry-facing wrapper so engine code can pass stream ids across
/// crate boundaries and resolve them back to tracks.
pub struct GStreamerMediaStream {
    id: Option<MediaStreamId>,
    track: Arc<MediaStreamTrack>,
}

impl GStreamerMediaStream {
    pub fn register(track: Arc<MediaStreamTrack>) -> MediaStreamId {
        register_stream(Arc::new(Mutex::new(GStreamerMediaStream { id: None, track })))
    }

    pub fn track(&self) -> Arc<MediaStreamTrack> {
        self.track.clone()
    }
}

impl MediaStream for GStreamerMediaStream {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_mut_any(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn set_id(&mut self, id: MediaStreamId) {
        self.id = Some(id);
    }

    fn ty(&self) -> MediaStreamType {
        self.track.stream_type()
    }
}

impl Drop for GStreamerMediaStream {
    fn drop(&mut self) {
        if let Some(ref id) = self.id {
            unregister_stream(id);
        }
    }
}

pub(crate) const BLACK_FRAME_WIDTH: i32 = 320;
pub(crate) const BLACK_FRAME_HEIGHT: i32 = 240;
pub(crate) const SILENT_SAMPLE_SIZE: usize = 512;
pub(crate) const SILENT_SAMPLE_RATE: i32 = 44100;

pub(crate) fn black_frame_caps(width: i32, height: i32, frame_rate: f64) -> gst::Caps {
    let framerate = gst::Fraction::approximate_f64(frame_rate)
        .filter(|fraction| fraction.numer() > 0)
        .unwrap_or_else(|| gst::Fraction::new(30, 1));
    gst::Caps::builder("video/x-raw")
        .field("format", "I420")
        .field("width", width)
        .field("height", height)
        .field("framerate", framerate)
        .build()
}

/// A fully black I420 frame: zeroed luma, chroma planes at the
/// midpoint. Substituted for real frames while a video track is
/// disabled.
pub(crate) fn make_black_frame(caps: &gst::Caps, pts: gst::ClockTime) -> Option<gst::Sample> {
    let info = gst_video::VideoInfo::from_caps(caps).ok()?;
    let mut buffer = gst::Buffer::with_size(info.size()).ok()?;
    {
        let buffer = buffer.get_mut()?;
        buffer.set_pts(pts);
        buffer.set_dts(pts);
        let fps = info.fps();
        if fps.numer() > 0 {
            buffer.set_duration(
                gst::ClockTime::SECOND.mul_div_floor(fps.denom() as u64, fps.numer() as u64),
            );
        }
        let luma_len = info.offset()[1];
        {
            let mut map = buffer.map_writable().ok()?;
            let data = map.as_mut_slice();
            data[..luma_len].fill(0);
            data[luma_len..].fill(128);
        }
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
    Some(gst::Sample::builder().buffer(&buffer).caps(caps).build())
}

static SILENT_AUDIO_CAPS: Lazy<gst::Caps> = Lazy::new(|| {
    gst_audio::AudioInfo::builder(
        gst_audio::AudioFormat::F32le,
        SILENT_SAMPLE_RATE as u32,
        1,
    )
    .build()
    .unwrap()
    .to_caps()
    .unwrap()
});

pub(crate) fn silent_audio_caps() -> gst::Caps {
    SILENT_AUDIO_CAPS.clone()
}

/// Silence substituted for real audio while a track is disabled.
pub(crate) fn make_silent_sample(pts: Option<gst::ClockTime>) -> Option<gst::Sample> {
    let caps = silent_audio_caps();
    let mut buffer = gst::Buffer::with_size(SILENT_SAMPLE_SIZE).ok()?;
    {
        let buffer = buffer.get_mut()?;
        buffer.set_pts(pts);
        buffer.set_dts(pts);
        let mut map = buffer.map_writable().ok()?;
        map.as_mut_slice().as_mut_slice_of::<f32>().ok()?.fill(0.0);
    }
    Some(gst::Sample::builder().buffer(&buffer).caps(&caps).build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use brook_media_streams::registry::get_stream;
    use byte_slice_cast::AsSliceOf;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn image_orientation_tags() {
        assert_eq!(VideoRotation::None.image_orientation(false), "rotate-0");
        assert_eq!(VideoRotation::Right.image_orientation(false), "rotate-90");
        assert_eq!(VideoRotation::Left.image_orientation(true), "flip-rotate-270");
        assert!(VideoRotation::Right.swaps_dimensions());
        assert!(!VideoRotation::UpsideDown.swaps_dimensions());
    }

    #[test]
    fn black_frames_are_black() {
        test_support::init();
        let caps = black_frame_caps(640, 480, 30.0);
        let pts = gst::ClockTime::from_mseconds(100);
        let sample = make_black_frame(&caps, pts).unwrap();
        let buffer = sample.buffer().unwrap();
        assert_eq!(buffer.pts(), Some(pts));
        assert_eq!(buffer.dts(), Some(pts));
        assert_eq!(
            buffer.duration(),
            gst::ClockTime::SECOND.mul_div_floor(1, 30)
        );
        assert!(buffer.meta::<gst_video::VideoMeta>().is_some());

        let info = gst_video::VideoInfo::from_caps(&caps).unwrap();
        let map = buffer.map_readable().unwrap();
        let data = map.as_slice();
        assert_eq!(data.len(), info.size());
        let luma_len = info.offset()[1];
        assert!(data[..luma_len].iter().all(|byte| *byte == 0));
        assert!(data[luma_len..].iter().all(|byte| *byte == 128));
    }

    #[test]
    fn silent_samples_are_zeroed_f32() {
        test_support::init();
        let pts = gst::ClockTime::from_mseconds(20);
        let sample = make_silent_sample(Some(pts)).unwrap();
        let buffer = sample.buffer().unwrap();
        assert_eq!(buffer.size(), SILENT_SAMPLE_SIZE);
        assert_eq!(buffer.pts(), Some(pts));
        assert_eq!(buffer.dts(), Some(pts));
        let map = buffer.map_readable().unwrap();
        let samples: &[f32] = map.as_slice().as_slice_of().unwrap();
        assert!(samples.iter().all(|value| *value == 0.0));
        let caps = sample.caps().unwrap();
        let info = gst_audio::AudioInfo::from_caps(caps).unwrap();
        assert_eq!(info.format(), gst_audio::AudioFormat::F32le);
        assert_eq!(info.rate(), SILENT_SAMPLE_RATE as u32);
        assert_eq!(info.channels(), 1);
    }

    struct CountingTrackObserver {
        enabled_changes: AtomicUsize,
        ends: AtomicUsize,
    }

    impl TrackObserver for CountingTrackObserver {
        fn track_enabled_changed(&self, _track: &MediaStreamTrack) {
            self.enabled_changes.fetch_add(1, Ordering::SeqCst);
        }

        fn track_ended(&self, _track: &MediaStreamTrack) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn enable_and_end_transitions_notify_once() {
        test_support::init();
        let track = MediaStreamTrack::new(
            MediaStreamType::Video,
            "test".into(),
            TrackSource::App,
        );
        let observer = Arc::new(CountingTrackObserver {
            enabled_changes: AtomicUsize::new(0),
            ends: AtomicUsize::new(0),
        });
        track.add_track_observer(observer.clone() as Arc<dyn TrackObserver>);

        track.set_enabled(true); // already enabled, no notification
        track.set_enabled(false);
        track.set_enabled(false);
        assert_eq!(observer.enabled_changes.load(Ordering::SeqCst), 1);

        track.mark_ended();
        track.mark_ended();
        assert_eq!(observer.ends.load(Ordering::SeqCst), 1);
        assert!(track.ended());
    }

    #[test]
    fn registered_streams_resolve_to_their_track() {
        test_support::init();
        let track = MediaStreamTrack::new(
            MediaStreamType::Audio,
            "mic".into(),
            TrackSource::App,
        );
        let id = GStreamerMediaStream::register(track.clone());
        let stream = get_stream(&id).unwrap();
        let stream = stream.lock().unwrap();
        let stream = stream
            .as_any()
            .downcast_ref::<GStreamerMediaStream>()
            .unwrap();
        assert_eq!(stream.track().id(), track.id());
        assert_eq!(stream.ty(), MediaStreamType::Audio);
    }
}
