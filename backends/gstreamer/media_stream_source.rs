/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `brookmediastreamsrc`, a bin exposing live media-stream tracks as
//! source pads.
//!
//! Each track is backed by an appsrc feeding a ghost pad created from
//! the matching sometimes pad template. The element is streams-aware:
//! it announces a `gst::StreamCollection` covering its live tracks and
//! replaces appsrc stream-start events with ones carrying the proper
//! stream and group id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use gst::glib;
use gst::glib::subclass::prelude::ObjectSubclassIsExt;
use gst::prelude::*;
use log::{debug, warn};

use crate::media_stream::{
    black_frame_caps, make_black_frame, make_silent_sample, AudioSampleObserver,
    MediaStreamTrack, TrackObserver, TrackSource, VideoFrameMetadata, VideoFrameObserver,
    BLACK_FRAME_HEIGHT, BLACK_FRAME_WIDTH,
};
use brook_media_streams::registry::{get_stream, MediaStreamId};

/// How long a stopping track waits for its final buffer to drain into
/// an end-of-stream before giving up.
const EOS_WAIT: Duration = Duration::from_millis(50);

mod imp {
    use super::*;
    use crate::media_stream::GStreamerMediaStream;
    use gst::subclass::prelude::*;
    use once_cell::sync::Lazy;

    pub(super) struct InternalSource {
        pub(super) element: glib::WeakRef<super::MediaStreamSrc>,
        pub(super) track: Arc<MediaStreamTrack>,
        pub(super) appsrc: gst_app::AppSrc,
        pub(super) pad_name: String,
        pub(super) stream: Mutex<gst::Stream>,
        pub(super) ghost: Mutex<Option<gst::GhostPad>>,
        pub(super) enough_data: Arc<AtomicBool>,
        pub(super) needs_discont: AtomicBool,
        pushed_initial_tags: AtomicBool,
        pub(super) pushed_initial_sample: AtomicBool,
        pub(super) posted_collection: AtomicBool,
        observing: AtomicBool,
        orientation: Mutex<Option<VideoFrameMetadata>>,
        last_known_size: Mutex<Option<(i32, i32)>>,
        black_caps: Mutex<Option<gst::Caps>>,
        eos_pending: Mutex<bool>,
        eos_cond: Condvar,
        incoming_client: Mutex<Option<usize>>,
    }

    fn create_stream(track: &MediaStreamTrack) -> gst::Stream {
        // Disabled tracks get a distinct stream id so downstream sees
        // the toggle as a stream change.
        let stream_id = if track.enabled() {
            track.id().to_owned()
        } else {
            format!("{}-disabled", track.id())
        };
        let stream_type = if track.is_video() {
            gst::StreamType::VIDEO
        } else {
            gst::StreamType::AUDIO
        };
        let stream = gst::Stream::new(
            Some(&stream_id),
            None,
            stream_type,
            gst::StreamFlags::SELECT,
        );
        let mut tags = gst::TagList::new();
        tags.get_mut()
            .unwrap()
            .add::<gst::tags::Title>(&track.label(), gst::TagMergeMode::Replace);
        stream.set_tags(Some(&tags));
        stream
    }

    impl InternalSource {
        pub(super) fn new(
            element: &super::MediaStreamSrc,
            track: Arc<MediaStreamTrack>,
            pad_name: &str,
        ) -> Result<Arc<InternalSource>, glib::BoolError> {
            let prefix = match track.source() {
                TrackSource::Capture(_) => "capture",
                TrackSource::Incoming(_) => "incoming",
                TrackSource::App => "app",
            };
            let is_capture = track.is_captured();
            let appsrc = gst::ElementFactory::make("appsrc")
                .name(format!("{prefix}-{pad_name}"))
                .property("is-live", true)
                .property("format", gst::Format::Time)
                .property("min-percent", 100u32)
                // Capture sources deliver untimestamped raw buffers.
                .property("do-timestamp", is_capture)
                .property("handle-segment-change", true)
                .build()?
                .downcast::<gst_app::AppSrc>()
                .map_err(|_| glib::bool_error!("appsrc did not expose the AppSrc interface"))?;
            appsrc.set_automatic_eos(false);

            let enough_data = Arc::new(AtomicBool::new(false));
            let flag = enough_data.clone();
            let flag2 = enough_data.clone();
            appsrc.set_callbacks(
                gst_app::AppSrcCallbacks::builder()
                    .need_data(move |_, _| flag.store(false, Ordering::SeqCst))
                    .enough_data(move |_| flag2.store(true, Ordering::SeqCst))
                    .build(),
            );

            let incoming_client = match track.source() {
                TrackSource::Incoming(incoming) => Some(incoming.register_client()),
                _ => None,
            };

            let source = Arc::new(InternalSource {
                element: element.downgrade(),
                track: track.clone(),
                appsrc,
                pad_name: pad_name.to_owned(),
                stream: Mutex::new(create_stream(&track)),
                ghost: Mutex::new(None),
                enough_data,
                needs_discont: AtomicBool::new(false),
                pushed_initial_tags: AtomicBool::new(false),
                pushed_initial_sample: AtomicBool::new(false),
                posted_collection: AtomicBool::new(false),
                observing: AtomicBool::new(false),
                orientation: Mutex::new(None),
                last_known_size: Mutex::new(None),
                black_caps: Mutex::new(None),
                eos_pending: Mutex::new(false),
                eos_cond: Condvar::new(),
                incoming_client: Mutex::new(None),
            });
            *source.incoming_client.lock().unwrap() = incoming_client;

            // Answer latency and selectability queries travelling up
            // from downstream sinks.
            let src_pad = source
                .appsrc
                .static_pad("src")
                .ok_or_else(|| glib::bool_error!("appsrc has no source pad"))?;
            let track_for_query = track.clone();
            src_pad.add_probe(gst::PadProbeType::QUERY_UPSTREAM, move |_pad, info| {
                if let Some(query) = info.query_mut() {
                    match query.view_mut() {
                        gst::QueryViewMut::Latency(q) => {
                            if let Some((min, max)) = track_for_query.query_capture_latency() {
                                q.set(true, min, max);
                                return gst::PadProbeReturn::Handled;
                            }
                        },
                        gst::QueryViewMut::Selectable(q) => {
                            q.set_selectable(true);
                            return gst::PadProbeReturn::Handled;
                        },
                        _ => (),
                    }
                }
                gst::PadProbeReturn::Ok
            });

            Ok(source)
        }

        pub(super) fn stream(&self) -> gst::Stream {
            self.stream.lock().unwrap().clone()
        }

        pub(super) fn recreate_stream(&self) {
            *self.stream.lock().unwrap() = create_stream(&self.track);
            self.posted_collection.store(false, Ordering::SeqCst);
        }

        pub(super) fn ghost_pad(&self) -> Option<gst::GhostPad> {
            self.ghost.lock().unwrap().clone()
        }

        pub(super) fn is_observing(&self) -> bool {
            self.observing.load(Ordering::SeqCst)
        }

        pub(super) fn start_observing(self: &Arc<Self>) {
            if self.observing.swap(true, Ordering::SeqCst) {
                return;
            }
            if self.track.is_video() {
                self.track
                    .add_video_observer(self.clone() as Arc<dyn VideoFrameObserver>);
            } else {
                self.track
                    .add_audio_observer(self.clone() as Arc<dyn AudioSampleObserver>);
            }
        }

        pub(super) fn stop_observing(self: &Arc<Self>) {
            if !self.observing.swap(false, Ordering::SeqCst) {
                return;
            }
            if self.track.is_video() {
                let observer = self.clone() as Arc<dyn VideoFrameObserver>;
                self.track.remove_video_observer(&observer);
            } else {
                let observer = self.clone() as Arc<dyn AudioSampleObserver>;
                self.track.remove_audio_observer(&observer);
            }
        }

        pub(super) fn has_prerolled(&self) -> bool {
            self.appsrc
                .static_pad("src")
                .and_then(|pad| pad.current_caps())
                .is_some()
        }

        /// Queues end-of-stream on the appsrc. Returns false when the
        /// request could not be dispatched at all.
        pub(super) fn signal_end_of_stream(&self) -> bool {
            self.appsrc.end_of_stream().is_ok()
        }

        pub(super) fn take_eos_pending(&self) -> bool {
            let mut pending = self.eos_pending.lock().unwrap();
            std::mem::take(&mut *pending)
        }

        pub(super) fn notify_eos(&self) {
            let _unused = self.eos_pending.lock().unwrap();
            self.eos_cond.notify_all();
        }

        /// Marks the stream as draining and waits briefly for the
        /// streaming thread to act on it. Bounded so a stalled pipeline
        /// cannot hang the caller.
        pub(super) fn drain(self: &Arc<Self>) {
            self.stop_observing();
            let (_, state, _) = self.appsrc.state(Some(gst::ClockTime::ZERO));
            if state < gst::State::Paused {
                return;
            }
            let mut pending = self.eos_pending.lock().unwrap();
            *pending = true;
            let _ = self.eos_cond.wait_timeout(pending, EOS_WAIT).unwrap();
        }

        pub(super) fn flush(&self) {
            self.appsrc.send_event(gst::event::FlushStart::new());
            self.appsrc.send_event(gst::event::FlushStop::new(false));
        }

        pub(super) fn reset_flow_state(&self) {
            self.enough_data.store(false, Ordering::SeqCst);
            self.needs_discont.store(false, Ordering::SeqCst);
            self.pushed_initial_sample.store(false, Ordering::SeqCst);
        }

        pub(super) fn cleanup(self: &Arc<Self>) {
            self.stop_observing();
            if !self.pushed_initial_sample.load(Ordering::SeqCst) {
                self.flush();
            }
            if let TrackSource::Incoming(incoming) = self.track.source() {
                if let Some(client) = self.incoming_client.lock().unwrap().take() {
                    incoming.unregister_client(client);
                }
            }
        }

        fn push_initial_tags_if_needed(&self) {
            if self.pushed_initial_tags.swap(true, Ordering::SeqCst) {
                return;
            }
            let mut tags = gst::TagList::new();
            tags.get_mut()
                .unwrap()
                .add::<gst::tags::Title>(&self.track.label(), gst::TagMergeMode::Replace);
            if let Some(pad) = self.appsrc.static_pad("src") {
                pad.push_event(gst::event::Tag::new(tags));
            }
        }

        pub(super) fn push_sample(&self, sample: &gst::Sample, reason: &str) {
            self.push_initial_tags_if_needed();

            // While the appsrc is saturated video frames are dropped;
            // the next pushed buffer is flagged as a discontinuity.
            if self.track.is_video() && self.enough_data.load(Ordering::SeqCst) {
                self.needs_discont.store(true, Ordering::SeqCst);
                return;
            }

            let sample = if self.needs_discont.swap(false, Ordering::SeqCst) {
                with_discont(sample)
            } else {
                sample.clone()
            };
            self.pushed_initial_sample.store(true, Ordering::SeqCst);
            if let Err(err) = self.appsrc.push_sample(&sample) {
                debug!("{}: dropping {}: {}", self.pad_name, reason, err);
            }
        }

        fn update_orientation(&self, metadata: VideoFrameMetadata) {
            let mut current = self.orientation.lock().unwrap();
            if *current == Some(metadata) {
                return;
            }
            *current = Some(metadata);
            let mut tags = gst::TagList::new();
            tags.get_mut().unwrap().add::<gst::tags::ImageOrientation>(
                &metadata.rotation.image_orientation(metadata.mirrored),
                gst::TagMergeMode::Replace,
            );
            if let Some(pad) = self.appsrc.static_pad("src") {
                pad.push_event(gst::event::Tag::new(tags));
            }
        }

        /// The substitute frame for a disabled video track: sized like
        /// the real feed, timed like the frame it replaces.
        pub(super) fn black_frame_for(
            &self,
            sample: &gst::Sample,
            metadata: VideoFrameMetadata,
        ) -> Option<gst::Sample> {
            let settings = self.track.settings();
            let (mut width, mut height) = if settings.width > 0 && settings.height > 0 {
                (settings.width, settings.height)
            } else if let Some(size) = *self.last_known_size.lock().unwrap() {
                size
            } else if let Some(info) = sample
                .caps()
                .and_then(|caps| gst_video::VideoInfo::from_caps(caps).ok())
            {
                (info.width() as i32, info.height() as i32)
            } else {
                (BLACK_FRAME_WIDTH, BLACK_FRAME_HEIGHT)
            };
            if metadata.rotation.swaps_dimensions() {
                std::mem::swap(&mut width, &mut height);
            }
            let frame_rate = if settings.frame_rate > 0.0 {
                settings.frame_rate
            } else {
                30.0
            };

            let caps = {
                let mut cached = self.black_caps.lock().unwrap();
                let wanted = black_frame_caps(width, height, frame_rate);
                if cached.as_ref() != Some(&wanted) {
                    *cached = Some(wanted.clone());
                }
                wanted
            };
            let pts = sample
                .buffer()
                .and_then(|buffer| buffer.pts())
                .or_else(|| {
                    self.element
                        .upgrade()
                        .and_then(|element| element.current_running_time())
                })
                .unwrap_or(gst::ClockTime::ZERO);
            make_black_frame(&caps, pts)
        }
    }

    impl VideoFrameObserver for InternalSource {
        fn video_frame_available(&self, sample: &gst::Sample, metadata: VideoFrameMetadata) {
            if !self.is_observing() {
                return;
            }
            if let Some(element) = self.element.upgrade() {
                element
                    .imp()
                    .first_video_sample_seen
                    .store(true, Ordering::SeqCst);
            }
            self.update_orientation(metadata);
            if self.track.enabled() {
                if let Some(info) = sample
                    .caps()
                    .and_then(|caps| gst_video::VideoInfo::from_caps(caps).ok())
                {
                    *self.last_known_size.lock().unwrap() =
                        Some((info.width() as i32, info.height() as i32));
                }
                self.push_sample(sample, "video frame");
            } else if let Some(black) = self.black_frame_for(sample, metadata) {
                self.push_sample(&black, "black frame");
            }
        }
    }

    impl AudioSampleObserver for InternalSource {
        fn audio_sample_available(&self, sample: &gst::Sample) {
            if !self.is_observing() {
                return;
            }
            // Hold audio back until video flows, otherwise downstream
            // may commit to an audio-only topology at startup.
            if let Some(element) = self.element.upgrade() {
                let imp = element.imp();
                if imp.has_video_tracks()
                    && !imp.first_video_sample_seen.load(Ordering::SeqCst)
                {
                    return;
                }
            }
            if self.track.enabled() {
                self.push_sample(sample, "audio sample");
            } else {
                let pts = self
                    .element
                    .upgrade()
                    .and_then(|element| element.current_running_time());
                if let Some(silence) = make_silent_sample(pts) {
                    self.push_sample(&silence, "silence");
                }
            }
        }
    }

    impl TrackObserver for InternalSource {
        fn track_enabled_changed(&self, track: &MediaStreamTrack) {
            debug!(
                "{}: track {} now {}",
                self.pad_name,
                track.id(),
                if track.enabled() { "enabled" } else { "disabled" }
            );
            self.recreate_stream();
            if let Some(element) = self.element.upgrade() {
                element.imp().post_stream_collection();
            }
            if track.is_video() {
                self.enough_data.store(false, Ordering::SeqCst);
                self.needs_discont.store(true, Ordering::SeqCst);
                if track.enabled() {
                    self.flush();
                }
            }
        }

        fn track_ended(&self, _track: &MediaStreamTrack) {
            let Some(element) = self.element.upgrade() else {
                return;
            };
            if let Some(source) = element.imp().source_for_pad(&self.pad_name) {
                source.drain();
            }
        }
    }

    fn with_discont(sample: &gst::Sample) -> gst::Sample {
        let Some(mut buffer) = sample.buffer_owned() else {
            return sample.clone();
        };
        buffer.make_mut().set_flags(gst::BufferFlags::DISCONT);
        let mut builder = gst::Sample::builder().buffer(&buffer);
        let caps = sample.caps().map(|caps| caps.to_owned());
        if let Some(caps) = caps.as_ref() {
            builder = builder.caps(caps);
        }
        builder.build()
    }

    #[derive(Default)]
    pub(super) struct State {
        pub(super) sources: Vec<Arc<InternalSource>>,
        pub(super) upstream_id: Option<String>,
        audio_counter: u32,
        video_counter: u32,
    }

    pub struct MediaStreamSrc {
        pub(super) state: Mutex<State>,
        pub(super) flow_combiner: Mutex<gst_base::UniqueFlowCombiner>,
        group_id: Mutex<Option<gst::GroupId>>,
        pub(super) first_video_sample_seen: AtomicBool,
    }

    impl Default for MediaStreamSrc {
        fn default() -> Self {
            MediaStreamSrc {
                state: Mutex::new(State::default()),
                flow_combiner: Mutex::new(gst_base::UniqueFlowCombiner::new()),
                group_id: Mutex::new(None),
                first_video_sample_seen: AtomicBool::new(false),
            }
        }
    }

    impl MediaStreamSrc {
        pub(super) fn ensure_group_id(&self) -> gst::GroupId {
            *self
                .group_id
                .lock()
                .unwrap()
                .get_or_insert_with(gst::GroupId::next)
        }

        pub(super) fn has_video_tracks(&self) -> bool {
            self.state
                .lock()
                .unwrap()
                .sources
                .iter()
                .any(|source| source.track.is_video())
        }

        pub(super) fn source_for_pad(&self, pad_name: &str) -> Option<Arc<InternalSource>> {
            self.state
                .lock()
                .unwrap()
                .sources
                .iter()
                .find(|source| source.pad_name == pad_name)
                .cloned()
        }

        pub(super) fn source_for_track(&self, track_id: &str) -> Option<Arc<InternalSource>> {
            self.state
                .lock()
                .unwrap()
                .sources
                .iter()
                .find(|source| source.track.id() == track_id)
                .cloned()
        }

        pub(super) fn stream_collection(&self) -> gst::StreamCollection {
            let mut state = self.state.lock().unwrap();
            // Successive collections must carry the same upstream id so
            // downstream can treat them as updates of one topology.
            let upstream_id = state
                .upstream_id
                .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
                .clone();
            let mut builder = gst::StreamCollection::builder(Some(&upstream_id));
            for source in &state.sources {
                if source.track.ended() {
                    continue;
                }
                builder = builder.stream(source.stream());
            }
            builder.build()
        }

        pub(super) fn post_stream_collection(&self) {
            let obj = self.obj();
            let collection = self.stream_collection();
            let message = gst::message::StreamCollection::builder(&collection)
                .src(obj.upcast_ref::<gst::Element>())
                .build();
            if let Err(err) = obj.post_message(message) {
                debug!("Stream collection not posted: {}", err);
            }
        }

        pub(super) fn add_track(&self, track: Arc<MediaStreamTrack>) -> Result<(), glib::BoolError> {
            let obj = self.obj();
            let is_video = track.is_video();
            let pad_name = {
                let mut state = self.state.lock().unwrap();
                if is_video {
                    let name = format!("video_src{}", state.video_counter);
                    state.video_counter += 1;
                    name
                } else {
                    let name = format!("audio_src{}", state.audio_counter);
                    state.audio_counter += 1;
                    name
                }
            };
            let source = InternalSource::new(&obj, track.clone(), &pad_name)?;
            obj.add(&source.appsrc)?;

            let src_pad = source
                .appsrc
                .static_pad("src")
                .ok_or_else(|| glib::bool_error!("appsrc has no source pad"))?;

            // Rewrite stream-start events and push the collection once
            // caps are known.
            let element_weak = obj.downgrade();
            let source_weak = Arc::downgrade(&source);
            src_pad.add_probe(gst::PadProbeType::EVENT_DOWNSTREAM, move |pad, info| {
                let (event_type, seqnum) = match info.event() {
                    Some(event) => (event.type_(), event.seqnum()),
                    None => return gst::PadProbeReturn::Ok,
                };
                let (Some(element), Some(source)) =
                    (element_weak.upgrade(), source_weak.upgrade())
                else {
                    return gst::PadProbeReturn::Ok;
                };
                match event_type {
                    gst::EventType::StreamStart => {
                        let stream = source.stream();
                        let stream_id = stream
                            .stream_id()
                            .map(|id| id.to_string())
                            .unwrap_or_else(|| source.track.id().to_owned());
                        let replacement = gst::event::StreamStart::builder(&stream_id)
                            .group_id(element.imp().ensure_group_id())
                            .stream(stream)
                            .seqnum(seqnum)
                            .build();
                        info.data = Some(gst::PadProbeData::Event(replacement));
                    },
                    gst::EventType::Caps => {
                        if !source.posted_collection.swap(true, Ordering::SeqCst) {
                            let collection = element.imp().stream_collection();
                            pad.push_event(
                                gst::event::StreamCollection::builder(&collection).build(),
                            );
                            if source.track.is_video() {
                                pad.send_event(
                                    gst_video::UpstreamForceKeyUnitEvent::builder()
                                        .all_headers(true)
                                        .build(),
                                );
                            }
                        }
                    },
                    _ => (),
                }
                gst::PadProbeReturn::Ok
            });

            let templ = obj
                .pad_template(if is_video { "video_src%u" } else { "audio_src%u" })
                .ok_or_else(|| glib::bool_error!("missing pad template"))?;
            let element_weak = obj.downgrade();
            let source_weak = Arc::downgrade(&source);
            let element_weak_ev = obj.downgrade();
            let source_weak_ev = Arc::downgrade(&source);
            let ghost = gst::GhostPad::builder_from_template(&templ)
                .name(pad_name.as_str())
                .proxy_pad_chain_function(move |pad, parent, buffer| {
                    let Some(element) = element_weak.upgrade() else {
                        return Err(gst::FlowError::Flushing);
                    };
                    if let Some(source) = source_weak.upgrade() {
                        if source.take_eos_pending() {
                            source.notify_eos();
                            return Err(gst::FlowError::Eos);
                        }
                    }
                    let result = gst::ProxyPad::chain_default(pad, parent, buffer);
                    let result = element
                        .imp()
                        .flow_combiner
                        .lock()
                        .unwrap()
                        .update_pad_flow(pad.upcast_ref::<gst::Pad>(), result);
                    result
                })
                .event_function(move |pad, parent, event| {
                    if event.type_() == gst::EventType::Reconfigure {
                        if let Some(element) = element_weak_ev.upgrade() {
                            element.imp().flow_combiner.lock().unwrap().reset();
                        }
                    }
                    if let Some(source) = source_weak_ev.upgrade() {
                        if let TrackSource::Incoming(incoming) = source.track.source() {
                            if incoming.handle_upstream_event(event.clone()) {
                                return true;
                            }
                        }
                    }
                    gst::Pad::event_default(pad, parent, event)
                })
                .build();
            ghost.set_target(Some(&src_pad))?;
            let _ = ghost.set_active(true);
            obj.add_pad(&ghost)?;
            if let Some(proxy) = ghost.internal() {
                self.flow_combiner
                    .lock()
                    .unwrap()
                    .add_pad(proxy.upcast_ref::<gst::Pad>());
            }
            *source.ghost.lock().unwrap() = Some(ghost);

            source.appsrc.sync_state_with_parent()?;
            track.add_track_observer(source.clone() as Arc<dyn TrackObserver>);
            source.start_observing();

            self.state.lock().unwrap().sources.push(source);
            Ok(())
        }

        pub(super) fn remove_track(&self, track_id: &str) {
            let source = {
                let mut state = self.state.lock().unwrap();
                match state
                    .sources
                    .iter()
                    .position(|source| source.track.id() == track_id)
                {
                    Some(idx) => Some(state.sources.remove(idx)),
                    None => None,
                }
            };
            let Some(source) = source else {
                return;
            };
            let observer = source.clone() as Arc<dyn TrackObserver>;
            source.track.remove_track_observer(&observer);
            source.stop_observing();

            let eos_dispatched = source.signal_end_of_stream();
            if !eos_dispatched || !source.has_prerolled() {
                // Nothing flowed yet; the EOS event will never travel
                // through the pad, tear down right away.
                self.cleanup_source(&source);
            } else if let Some(ghost) = source.ghost_pad() {
                let element_weak = self.obj().downgrade();
                let source_for_probe = source.clone();
                ghost.add_probe(gst::PadProbeType::EVENT_DOWNSTREAM, move |_pad, info| {
                    if let Some(event) = info.event() {
                        if event.type_() == gst::EventType::Eos {
                            if let Some(element) = element_weak.upgrade() {
                                element.imp().cleanup_source(&source_for_probe);
                            }
                            return gst::PadProbeReturn::Remove;
                        }
                    }
                    gst::PadProbeReturn::Ok
                });
            }
            self.post_stream_collection();
        }

        fn cleanup_source(&self, source: &Arc<InternalSource>) {
            source.cleanup();
            let source = source.clone();
            self.obj().call_async(move |element| {
                let imp = element.imp();
                let _ = source.appsrc.set_state(gst::State::Null);
                if let Err(err) = element.remove(&source.appsrc) {
                    warn!("{}: appsrc not removed: {}", source.pad_name, err);
                }
                if let Some(ghost) = source.ghost.lock().unwrap().take() {
                    let _ = ghost.set_active(false);
                    if let Some(proxy) = ghost.internal() {
                        imp.flow_combiner
                            .lock()
                            .unwrap()
                            .remove_pad(proxy.upcast_ref::<gst::Pad>());
                    }
                    let _ = element.remove_pad(&ghost);
                }
            });
        }
    }

    #[glib::object_subclass]
    impl ObjectSubclass for MediaStreamSrc {
        const NAME: &'static str = "BrookMediaStreamSrc";
        type Type = super::MediaStreamSrc;
        type ParentType = gst::Bin;
    }

    impl ObjectImpl for MediaStreamSrc {
        fn properties() -> &'static [glib::ParamSpec] {
            static PROPERTIES: Lazy<Vec<glib::ParamSpec>> = Lazy::new(|| {
                vec![glib::ParamSpecBoolean::builder("is-live")
                    .nick("Is live")
                    .blurb("Live output, without preroll")
                    .default_value(true)
                    .read_only()
                    .build()]
            });
            PROPERTIES.as_ref()
        }

        fn property(&self, _id: usize, pspec: &glib::ParamSpec) -> glib::Value {
            match pspec.name() {
                "is-live" => true.to_value(),
                _ => unimplemented!(),
            }
        }

        fn constructed(&self) {
            self.parent_constructed();
            let obj = self.obj();
            obj.set_element_flags(gst::ElementFlags::SOURCE);
            obj.set_suppressed_flags(gst::ElementFlags::SOURCE | gst::ElementFlags::SINK);
            crate::set_object_flags(
                obj.upcast_ref::<gst::Object>(),
                gstreamer_sys::GST_BIN_FLAG_STREAMS_AWARE,
            );
        }
    }

    impl GstObjectImpl for MediaStreamSrc {}

    impl ElementImpl for MediaStreamSrc {
        fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
            static ELEMENT_METADATA: Lazy<gst::subclass::ElementMetadata> = Lazy::new(|| {
                gst::subclass::ElementMetadata::new(
                    "Brook Media Stream Source",
                    "Source/Audio/Video",
                    "Exposes media-stream tracks as source pads",
                    "The Brook Project Developers",
                )
            });
            Some(&*ELEMENT_METADATA)
        }

        fn pad_templates() -> &'static [gst::PadTemplate] {
            static PAD_TEMPLATES: Lazy<Vec<gst::PadTemplate>> = Lazy::new(|| {
                let video_caps =
                    "video/x-raw(ANY); video/x-h264; video/x-vp8; video/x-vp9; video/x-av1"
                        .parse::<gst::Caps>()
                        .unwrap();
                let audio_caps =
                    "audio/x-raw(ANY); audio/x-opus; audio/G722; audio/x-alaw; audio/x-mulaw"
                        .parse::<gst::Caps>()
                        .unwrap();
                vec![
                    gst::PadTemplate::new(
                        "video_src%u",
                        gst::PadDirection::Src,
                        gst::PadPresence::Sometimes,
                        &video_caps,
                    )
                    .unwrap(),
                    gst::PadTemplate::new(
                        "audio_src%u",
                        gst::PadDirection::Src,
                        gst::PadPresence::Sometimes,
                        &audio_caps,
                    )
                    .unwrap(),
                ]
            });
            PAD_TEMPLATES.as_ref()
        }

        fn change_state(
            &self,
            transition: gst::StateChange,
        ) -> Result<gst::StateChangeSuccess, gst::StateChangeError> {
            if transition == gst::StateChange::NullToReady {
                let sources = self.state.lock().unwrap().sources.clone();
                for source in sources {
                    source.start_observing();
                }
            }

            let mut success = self.parent_change_state(transition)?;

            match transition {
                // Live source: no preroll to wait for.
                gst::StateChange::ReadyToPaused | gst::StateChange::PlayingToPaused => {
                    success = gst::StateChangeSuccess::NoPreroll;
                },
                gst::StateChange::PausedToReady => {
                    self.flow_combiner.lock().unwrap().reset();
                    let sources = self.state.lock().unwrap().sources.clone();
                    for source in sources {
                        source.reset_flow_state();
                    }
                },
                _ => (),
            }
            Ok(success)
        }

        fn query(&self, query: &mut gst::QueryRef) -> bool {
            if let gst::QueryViewMut::Scheduling(q) = query.view_mut() {
                let (flags, min, max, align) = q.result();
                q.set(
                    flags | gst::SchedulingFlags::BANDWIDTH_LIMITED,
                    min,
                    max,
                    align,
                );
                return true;
            }
            self.parent_query(query)
        }
    }

    impl BinImpl for MediaStreamSrc {}

    impl super::MediaStreamSrc {
        /// Resolves registered stream ids to their tracks and exposes
        /// each as a pad.
        pub fn set_stream(&self, streams: &[MediaStreamId]) {
            if let Some(first) = streams.first() {
                // The stream's registry id doubles as the collection's
                // upstream id.
                self.imp()
                    .state
                    .lock()
                    .unwrap()
                    .upstream_id
                    .get_or_insert_with(|| first.id().to_string());
            }
            for id in streams {
                let Some(stream) = get_stream(id) else {
                    warn!("Unknown media stream id {:?}", id);
                    continue;
                };
                let track = {
                    let stream = stream.lock().unwrap();
                    stream
                        .as_any()
                        .downcast_ref::<GStreamerMediaStream>()
                        .map(|stream| stream.track())
                };
                if let Some(track) = track {
                    self.add_track(track);
                }
            }
            self.imp().post_stream_collection();
        }
    }
}

glib::wrapper! {
    pub struct MediaStreamSrc(ObjectSubclass<imp::MediaStreamSrc>)
        @extends gst::Bin, gst::Element, gst::Object;
}

impl Default for MediaStreamSrc {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaStreamSrc {
    pub fn new() -> MediaStreamSrc {
        glib::Object::new()
    }

    pub fn add_track(&self, track: Arc<MediaStreamTrack>) {
        if let Err(err) = self.imp().add_track(track) {
            warn!("Track not added: {}", err);
        }
    }

    /// Removes the pad for the given track, draining it with an
    /// end-of-stream when data already flowed.
    pub fn remove_track(&self, track_id: &str) {
        self.imp().remove_track(track_id);
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.imp()
            .state
            .lock()
            .unwrap()
            .sources
            .iter()
            .map(|source| source.track.id().to_owned())
            .collect()
    }

    pub fn has_prerolled(&self) -> bool {
        self.imp()
            .state
            .lock()
            .unwrap()
            .sources
            .iter()
            .any(|source| source.has_prerolled())
    }

    /// Signals end-of-stream on every track. Returns true when each
    /// appsrc accepted the request.
    pub fn signal_end_of_stream(&self) -> bool {
        let sources = self.imp().state.lock().unwrap().sources.clone();
        sources
            .iter()
            .map(|source| source.signal_end_of_stream())
            .fold(true, |acc, ok| acc && ok)
    }

    pub fn stream_collection(&self) -> gst::StreamCollection {
        self.imp().stream_collection()
    }
}

pub fn register() -> Result<(), glib::BoolError> {
    gst::Element::register(
        None,
        "brookmediastreamsrc",
        gst::Rank::NONE,
        MediaStreamSrc::static_type(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use brook_media_streams::MediaStreamType;
    use std::time::Instant;

    fn make_element() -> Option<MediaStreamSrc> {
        test_support::init();
        crate::ensure_element_registered();
        if !test_support::have_elements(&["appsrc"]) {
            return None;
        }
        Some(MediaStreamSrc::new())
    }

    fn video_track() -> Arc<MediaStreamTrack> {
        MediaStreamTrack::new(MediaStreamType::Video, "video track".into(), TrackSource::App)
    }

    #[test]
    fn element_registers_and_reports_live() {
        test_support::init();
        crate::ensure_element_registered();
        let element = gst::ElementFactory::make("brookmediastreamsrc")
            .build()
            .unwrap();
        assert!(element.property::<bool>("is-live"));
        assert!(element.element_flags().contains(gst::ElementFlags::SOURCE));
    }

    #[test]
    fn tracks_become_pads_and_streams() {
        let Some(element) = make_element() else {
            return;
        };
        let video = video_track();
        let audio = MediaStreamTrack::new(
            MediaStreamType::Audio,
            "audio track".into(),
            TrackSource::App,
        );
        element.add_track(video.clone());
        element.add_track(audio.clone());

        assert!(element.static_pad("video_src0").is_some());
        assert!(element.static_pad("audio_src0").is_some());
        assert_eq!(element.track_ids().len(), 2);

        let collection = element.stream_collection();
        assert_eq!(collection.len(), 2);
        let types: Vec<_> = (0..collection.len())
            .filter_map(|i| collection.stream(i as u32))
            .map(|stream| stream.stream_type())
            .collect();
        assert!(types.contains(&gst::StreamType::VIDEO));
        assert!(types.contains(&gst::StreamType::AUDIO));
    }

    #[test]
    fn disabled_tracks_get_a_distinct_stream_id() {
        let Some(element) = make_element() else {
            return;
        };
        let track = video_track();
        element.add_track(track.clone());
        let source = element.imp().source_for_track(track.id()).unwrap();
        let original_id = source.stream().stream_id();

        track.set_enabled(false);
        let disabled_id = source.stream().stream_id().unwrap();
        assert_ne!(Some(disabled_id.clone()), original_id);
        assert!(disabled_id.ends_with("-disabled"));
    }

    #[test]
    fn black_frames_mirror_the_replaced_frame() {
        let Some(element) = make_element() else {
            return;
        };
        let track = video_track();
        element.add_track(track.clone());
        track.set_enabled(false);
        let source = element.imp().source_for_track(track.id()).unwrap();

        let caps = crate::media_stream::black_frame_caps(640, 480, 30.0);
        let input =
            crate::media_stream::make_black_frame(&caps, gst::ClockTime::from_mseconds(66))
                .unwrap();
        let black = source
            .black_frame_for(&input, VideoFrameMetadata::default())
            .unwrap();
        let structure = black.caps().unwrap().structure(0).unwrap();
        assert_eq!(structure.get::<i32>("width"), Ok(640));
        assert_eq!(structure.get::<i32>("height"), Ok(480));
        assert_eq!(
            structure.get::<gst::Fraction>("framerate"),
            Ok(gst::Fraction::new(30, 1))
        );
        assert_eq!(
            black.buffer().unwrap().pts(),
            Some(gst::ClockTime::from_mseconds(66))
        );
    }

    #[test]
    fn rotated_black_frames_swap_dimensions() {
        let Some(element) = make_element() else {
            return;
        };
        let track = video_track();
        element.add_track(track.clone());
        track.set_enabled(false);
        let source = element.imp().source_for_track(track.id()).unwrap();

        let caps = crate::media_stream::black_frame_caps(640, 480, 30.0);
        let input =
            crate::media_stream::make_black_frame(&caps, gst::ClockTime::ZERO).unwrap();
        let metadata = VideoFrameMetadata {
            rotation: crate::media_stream::VideoRotation::Right,
            mirrored: false,
        };
        let black = source.black_frame_for(&input, metadata).unwrap();
        let structure = black.caps().unwrap().structure(0).unwrap();
        assert_eq!(structure.get::<i32>("width"), Ok(480));
        assert_eq!(structure.get::<i32>("height"), Ok(640));
    }

    #[test]
    fn removing_an_idle_track_completes_quickly() {
        let Some(element) = make_element() else {
            return;
        };
        let track = video_track();
        element.add_track(track.clone());
        assert!(element.static_pad("video_src0").is_some());

        let started = Instant::now();
        element.remove_track(track.id());
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(element.track_ids().is_empty());

        // Pad teardown is asynchronous; give it a moment.
        let deadline = Instant::now() + Duration::from_millis(500);
        while element.static_pad("video_src0").is_some() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(element.static_pad("video_src0").is_none());
    }

    #[test]
    fn collections_keep_a_stable_upstream_id() {
        let Some(element) = make_element() else {
            return;
        };
        // Without a stream, the minted id must still be stable.
        let first = element.stream_collection().upstream_id();
        assert!(first.is_some());
        assert_eq!(element.stream_collection().upstream_id(), first);

        let Some(with_stream) = make_element() else {
            return;
        };
        let stream_id = crate::media_stream::GStreamerMediaStream::register(video_track());
        with_stream.set_stream(&[stream_id]);
        let upstream_id = with_stream.stream_collection().upstream_id();
        assert_eq!(
            upstream_id.as_deref(),
            Some(stream_id.id().to_string().as_str())
        );
        assert_eq!(with_stream.stream_collection().upstream_id(), upstream_id);
    }

    #[test]
    fn removing_an_unknown_track_is_a_no_op() {
        let Some(element) = make_element() else {
            return;
        };
        element.remove_track("no-such-track");
        assert!(element.track_ids().is_empty());
    }
}
