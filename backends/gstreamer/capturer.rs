/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Per-device capture pipelines.
//!
//! A capturer owns one pipeline of the shape
//! `source ! (converters) ! capsfilter ! valve ! queue ! appsink` and
//! fans captured samples out to its observers. The valve implements
//! interruption (muting) without tearing the source down, and the
//! capsfilter applies caps changes in delayed mode so renegotiation
//! happens on the next buffer instead of mid-stream.

use std::sync::{Arc, Mutex, Weak};

use gst::prelude::*;
use log::{debug, warn};

use crate::device_monitor::MonitorCaptureDevice;
use crate::pipewire::PipeWireCaptureDevice;
use crate::register_capture_pipeline;
use crate::BACKEND_BASE_TIME;
use brook_media_streams::capture::CaptureDevice;
use brook_media_streams::MediaStreamType;

/// Where a capturer pulls its media from.
pub enum CaptureSource {
    /// A device surfaced by the GStreamer device monitor.
    Monitor(MonitorCaptureDevice),
    /// A PipeWire node negotiated through the desktop portal.
    PipeWire(PipeWireCaptureDevice),
    /// A synthetic device backed by a test source element.
    Mock(CaptureDevice),
}

impl CaptureSource {
    pub fn device(&self) -> &CaptureDevice {
        match self {
            CaptureSource::Monitor(device) => device.info(),
            CaptureSource::PipeWire(device) => device.device(),
            CaptureSource::Mock(device) => device,
        }
    }

    fn create_source_element(
        &self,
        stream_type: MediaStreamType,
    ) -> Result<gst::Element, glib::BoolError> {
        match self {
            CaptureSource::Monitor(device) => device.handle().create_element(None),
            CaptureSource::PipeWire(device) => gst::ElementFactory::make("pipewiresrc")
                .property("fd", device.fd() as i32)
                .property("path", device.node_id().to_string())
                .build(),
            CaptureSource::Mock(_) => match stream_type {
                MediaStreamType::Video => gst::ElementFactory::make("videotestsrc")
                    .property_from_str("pattern", "ball")
                    .property("is-live", true)
                    .build(),
                MediaStreamType::Audio => gst::ElementFactory::make("audiotestsrc")
                    .property_from_str("wave", "sine")
                    .property("is-live", true)
                    .build(),
            },
        }
    }
}

pub trait CapturerObserver: Send + Sync {
    fn sample_available(&self, _sample: gst::Sample) {}
    fn capture_device_changed(&self) {}
    fn capture_ended(&self) {}
    fn caps_changed(&self, _caps: &gst::Caps) {}
}

struct Inner {
    source: Option<CaptureSource>,
    caps: gst::Caps,
    pipeline: Option<gst::Pipeline>,
    capsfilter: Option<gst::Element>,
    valve: Option<gst::Element>,
    sink: Option<gst_app::AppSink>,
    interrupted: bool,
}

pub struct Capturer {
    stream_type: MediaStreamType,
    observers: Mutex<Vec<Weak<dyn CapturerObserver>>>,
    inner: Mutex<Inner>,
}

impl Capturer {
    pub fn new(
        stream_type: MediaStreamType,
        source: Option<CaptureSource>,
        caps: gst::Caps,
    ) -> Arc<Capturer> {
        Arc::new(Capturer {
            stream_type,
            observers: Mutex::new(Vec::new()),
            inner: Mutex::new(Inner {
                source,
                caps,
                pipeline: None,
                capsfilter: None,
                valve: None,
                sink: None,
                interrupted: false,
            }),
        })
    }

    /// Builds a video capturer for a portal-negotiated PipeWire node,
    /// starting from the caps the node prefers.
    pub fn for_pipewire(device: PipeWireCaptureDevice) -> Arc<Capturer> {
        let caps = device.preferred_caps();
        Capturer::new(
            MediaStreamType::Video,
            Some(CaptureSource::PipeWire(device)),
            caps,
        )
    }

    pub fn stream_type(&self) -> MediaStreamType {
        self.stream_type
    }

    pub fn device(&self) -> Option<CaptureDevice> {
        let inner = self.inner.lock().unwrap();
        inner.source.as_ref().map(|source| source.device().clone())
    }

    pub fn device_persistent_id(&self) -> Option<String> {
        self.device().map(|device| device.persistent_id)
    }

    pub fn add_observer(&self, observer: Arc<dyn CapturerObserver>) {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|weak| weak.strong_count() > 0);
        observers.push(Arc::downgrade(&observer));
    }

    pub fn remove_observer(&self, observer: &Arc<dyn CapturerObserver>) {
        let target = Arc::downgrade(observer);
        self.observers
            .lock()
            .unwrap()
            .retain(|weak| !Weak::ptr_eq(weak, &target));
    }

    /// Collects strong references before invoking callbacks so an
    /// observer dropping itself mid-notification cannot poison the
    /// observer list lock.
    fn for_each_observer(&self, f: impl Fn(&dyn CapturerObserver)) {
        let observers: Vec<_> = self
            .observers
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in observers {
            f(&*observer);
        }
    }

    pub fn setup_pipeline(self: &Arc<Self>) -> Result<(), glib::BoolError> {
        let mut inner = self.inner.lock().unwrap();
        self.setup_pipeline_locked(&mut inner)
    }

    fn setup_pipeline_locked(self: &Arc<Self>, inner: &mut Inner) -> Result<(), glib::BoolError> {
        let source = inner
            .source
            .as_ref()
            .ok_or_else(|| glib::bool_error!("no capture device bound"))?;
        let src = source.create_source_element(self.stream_type)?;

        let pipeline = gst::Pipeline::with_name(&format!(
            "capture-{}",
            source.device().persistent_id.replace(' ', "-")
        ));
        pipeline.set_start_time(gst::ClockTime::NONE);
        pipeline.set_base_time(*BACKEND_BASE_TIME);
        pipeline.use_clock(Some(&gst::SystemClock::obtain()));
        register_capture_pipeline(&pipeline);

        let capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", &inner.caps)
            .build()?;
        // Apply caps updates on the next buffer instead of flushing.
        capsfilter.set_property_from_str("caps-change-mode", "delayed");
        let valve = gst::ElementFactory::make("valve")
            .property("drop", inner.interrupted)
            .build()?;
        let queue = gst::ElementFactory::make("queue").build()?;
        let sink = gst::ElementFactory::make("appsink")
            .property("enable-last-sample", false)
            .build()?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| glib::bool_error!("appsink did not expose the AppSink interface"))?;

        let converters: Vec<gst::Element> = match self.stream_type {
            MediaStreamType::Video => vec![
                gst::ElementFactory::make("videoscale").build()?,
                gst::ElementFactory::make("videoconvert").build()?,
            ],
            MediaStreamType::Audio => vec![
                gst::ElementFactory::make("audioconvert").build()?,
                gst::ElementFactory::make("audioresample").build()?,
            ],
        };

        let mut chain: Vec<&gst::Element> = vec![&src];
        chain.extend(converters.iter());
        chain.extend([&capsfilter, &valve, &queue, sink.upcast_ref()]);
        pipeline.add_many(chain.iter().copied())?;
        gst::Element::link_many(chain.iter().copied())?;

        let capturer = Arc::downgrade(self);
        sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let Some(capturer) = capturer.upgrade() else {
                        return Err(gst::FlowError::Eos);
                    };
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    capturer.for_each_observer(|observer| observer.sample_available(sample.clone()));
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let capturer = Arc::downgrade(self);
        let sink_pad = sink
            .static_pad("sink")
            .ok_or_else(|| glib::bool_error!("appsink has no sink pad"))?;
        sink_pad.connect_caps_notify(move |pad| {
            let Some(capturer) = capturer.upgrade() else {
                return;
            };
            if let Some(caps) = pad.current_caps() {
                capturer.for_each_observer(|observer| observer.caps_changed(&caps));
            }
        });

        inner.pipeline = Some(pipeline);
        inner.capsfilter = Some(capsfilter);
        inner.valve = Some(valve);
        inner.sink = Some(sink);
        Ok(())
    }

    pub fn start(self: &Arc<Self>) -> Result<(), glib::BoolError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pipeline.is_none() {
            self.setup_pipeline_locked(&mut inner)?;
        }
        let pipeline = inner.pipeline.as_ref().unwrap();
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|_| glib::bool_error!("capture pipeline refused to start"))?;
        Ok(())
    }

    pub fn stop(&self) {
        let inner = self.inner.lock().unwrap();
        if let Some(pipeline) = inner.pipeline.as_ref() {
            if let Err(err) = pipeline.set_state(gst::State::Null) {
                warn!("Stopping capture pipeline failed: {}", err);
            }
        }
    }

    /// Stops capture and notifies observers. With `disconnect` the
    /// device binding and pipeline are dropped as well, so the capturer
    /// can later be rebound to another device.
    pub fn stop_device(&self, disconnect: bool) {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(pipeline) = inner.pipeline.as_ref() {
                let _ = pipeline.set_state(gst::State::Null);
            }
            if disconnect {
                inner.pipeline = None;
                inner.capsfilter = None;
                inner.valve = None;
                inner.sink = None;
                inner.source = None;
            }
        }
        self.for_each_observer(|observer| observer.capture_ended());
    }

    /// Rebinds the capturer to another device, rebuilding the pipeline
    /// if one was already up and restoring its running state.
    pub fn set_device(
        self: &Arc<Self>,
        source: Option<CaptureSource>,
    ) -> Result<(), glib::BoolError> {
        let rebuild;
        let was_playing;
        {
            let mut inner = self.inner.lock().unwrap();
            was_playing = inner
                .pipeline
                .as_ref()
                .map(|pipeline| pipeline.current_state() == gst::State::Playing)
                .unwrap_or(false);
            rebuild = inner.pipeline.is_some() && source.is_some();
            if let Some(pipeline) = inner.pipeline.take() {
                let _ = pipeline.set_state(gst::State::Null);
            }
            inner.capsfilter = None;
            inner.valve = None;
            inner.sink = None;
            debug!(
                "Rebinding capturer from {:?} to {:?}",
                inner.source.as_ref().map(|s| s.device().persistent_id.clone()),
                source.as_ref().map(|s| s.device().persistent_id.clone())
            );
            inner.source = source;
        }
        if rebuild {
            self.setup_pipeline()?;
            if was_playing {
                self.start()?;
            }
        }
        self.for_each_observer(|observer| observer.capture_device_changed());
        Ok(())
    }

    /// Interruption mutes the stream by dropping buffers at the valve,
    /// keeping the device and negotiated caps alive.
    pub fn set_interrupted(&self, interrupted: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.interrupted = interrupted;
        if let Some(valve) = inner.valve.as_ref() {
            valve.set_property("drop", interrupted);
        }
    }

    /// Once a pipeline exists the valve is the source of truth; the
    /// shadow flag only covers the time before setup.
    pub fn is_interrupted(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.valve.as_ref() {
            Some(valve) => valve.property("drop"),
            None => inner.interrupted,
        }
    }

    pub fn caps(&self) -> gst::Caps {
        self.inner.lock().unwrap().caps.clone()
    }

    /// Narrows or changes the desired capture format. Takes effect on
    /// the next buffer thanks to the delayed caps-change mode.
    pub fn set_caps(&self, caps: gst::Caps) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(capsfilter) = inner.capsfilter.as_ref() {
            capsfilter.set_property("caps", &caps);
        }
        inner.caps = caps;
    }

    /// Reports the pipeline latency as seen by the sink, or None before
    /// the pipeline produced one.
    pub fn query_latency(&self) -> Option<(gst::ClockTime, Option<gst::ClockTime>)> {
        let inner = self.inner.lock().unwrap();
        let sink = inner.sink.as_ref()?;
        let mut query = gst::query::Latency::new();
        if !sink.query(&mut query) {
            return None;
        }
        let (_live, min, max) = query.result();
        Some((min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        device_changes: AtomicUsize,
        ended: AtomicUsize,
    }

    impl CapturerObserver for CountingObserver {
        fn capture_device_changed(&self) {
            self.device_changes.fetch_add(1, Ordering::SeqCst);
        }

        fn capture_ended(&self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn mock_device(id: &str) -> CaptureSource {
        CaptureSource::Mock(CaptureDevice::new(
            id.into(),
            brook_media_streams::capture::CaptureDeviceType::Camera,
            format!("Mock {id}"),
        ))
    }

    #[test]
    fn rebinding_without_pipeline_swaps_device_and_notifies() {
        test_support::init();
        let capturer = Capturer::new(
            MediaStreamType::Video,
            Some(mock_device("cam0")),
            gst::Caps::builder("video/x-raw").build(),
        );
        let observer: Arc<CountingObserver> = Arc::new(CountingObserver::default());
        capturer.add_observer(observer.clone() as Arc<dyn CapturerObserver>);

        capturer.set_device(Some(mock_device("cam1"))).unwrap();
        assert_eq!(capturer.device_persistent_id().as_deref(), Some("cam1"));
        assert_eq!(observer.device_changes.load(Ordering::SeqCst), 1);

        capturer.set_device(None).unwrap();
        assert!(capturer.device().is_none());
        assert_eq!(observer.device_changes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn latency_is_unknown_before_setup() {
        test_support::init();
        let capturer = Capturer::new(
            MediaStreamType::Audio,
            Some(mock_device("mic0")),
            gst::Caps::builder("audio/x-raw").build(),
        );
        assert!(capturer.query_latency().is_none());
    }

    #[test]
    fn interruption_toggles_the_valve() {
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
        let capturer = Capturer::new(
            MediaStreamType::Video,
            Some(mock_device("cam0")),
            gst::Caps::builder("video/x-raw").build(),
        );
        capturer.setup_pipeline().unwrap();
        assert!(!capturer.is_interrupted());
        capturer.set_interrupted(true);
        assert!(capturer.is_interrupted());
        let valve = capturer.inner.lock().unwrap().valve.clone().unwrap();
        assert!(valve.property::<bool>("drop"));

        // The interruption state is read back from the valve, not from
        // shadow state.
        valve.set_property("drop", false);
        assert!(!capturer.is_interrupted());
    }

    #[test]
    fn pipewire_capturers_start_from_the_node_preferred_caps() {
        test_support::init();
        let (reader, _writer) = std::io::pipe().unwrap();
        let node = Arc::new(crate::pipewire::PipeWireNodeData::new(
            9,
            reader.into(),
            String::new(),
        ));
        let device = PipeWireCaptureDevice::new(
            node,
            brook_media_streams::capture::CaptureDeviceType::Screen,
            "Monitor 1".into(),
        );
        let expected = device.preferred_caps();
        let capturer = Capturer::for_pipewire(device);
        assert_eq!(capturer.stream_type(), MediaStreamType::Video);
        assert_eq!(capturer.caps(), expected);
    }

    #[test]
    fn stop_device_with_disconnect_clears_the_binding() {
        test_support::init();
        let capturer = Capturer::new(
            MediaStreamType::Video,
            Some(mock_device("cam0")),
            gst::Caps::builder("video/x-raw").build(),
        );
        let observer: Arc<CountingObserver> = Arc::new(CountingObserver::default());
        capturer.add_observer(observer.clone() as Arc<dyn CapturerObserver>);
        capturer.stop_device(true);
        assert!(capturer.device().is_none());
        assert_eq!(observer.ended.load(Ordering::SeqCst), 1);
    }
}
