/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Enumeration and live tracking of capture devices through the
//! GStreamer device monitor.

use std::sync::{Arc, Mutex};

use gst::prelude::*;
use log::{debug, warn};

use crate::capturer::{CaptureSource, Capturer};
use brook_media_streams::capture::{CaptureDevice, CaptureDeviceType};
use brook_media_streams::MediaStreamType;

/// A capture device surfaced by the device monitor, pairing the
/// classified description with the provider's device object.
pub struct MonitorCaptureDevice {
    handle: gst::Device,
    info: CaptureDevice,
}

impl MonitorCaptureDevice {
    pub fn new(handle: gst::Device, info: CaptureDevice) -> MonitorCaptureDevice {
        MonitorCaptureDevice { handle, info }
    }

    pub fn handle(&self) -> &gst::Device {
        &self.handle
    }

    pub fn info(&self) -> &CaptureDevice {
        &self.info
    }
}

/// Decides whether a monitor device is exposed, and as what.
///
/// Loopback ("monitor") PulseAudio/PipeWire devices are hidden. The
/// persistent identifier prefers, in order: an explicit persistent id
/// (only mock providers set one), the node name, and finally the
/// display name. Default devices get a "default: " label prefix.
pub(crate) fn classify_device(
    device_class: &str,
    display_name: &str,
    properties: Option<&gst::StructureRef>,
    wanted: &[CaptureDeviceType],
) -> Option<CaptureDevice> {
    if let Some(properties) = properties {
        if properties.get::<&str>("device.class") == Ok("monitor") {
            return None;
        }
    }

    let device_type = if device_class.starts_with("Audio") {
        if device_class.ends_with("Source") {
            CaptureDeviceType::Microphone
        } else if device_class.ends_with("Sink") {
            CaptureDeviceType::Speaker
        } else {
            return None;
        }
    } else if device_class.starts_with("Video") {
        CaptureDeviceType::Camera
    } else {
        return None;
    };
    if !wanted.contains(&device_type) {
        return None;
    }

    let is_default = properties
        .and_then(|properties| properties.get::<bool>("is-default").ok())
        .unwrap_or(false);

    let mut is_mock = false;
    let persistent_id = match properties.and_then(|p| p.get::<&str>("persistent-id").ok()) {
        Some(id) => {
            is_mock = true;
            id.to_owned()
        },
        None => properties
            .and_then(|p| p.get::<&str>("node.name").ok())
            .map(str::to_owned)
            .unwrap_or_else(|| display_name.to_owned()),
    };

    let label = if is_default {
        format!("default: {display_name}")
    } else {
        display_name.to_owned()
    };

    let mut device = CaptureDevice::new(persistent_id, device_type, label);
    device.is_default = is_default;
    device.is_mock = is_mock;
    Some(device)
}

fn classify_gst_device(device: &gst::Device, wanted: &[CaptureDeviceType]) -> Option<CaptureDevice> {
    let properties = device.properties();
    classify_device(
        &device.device_class(),
        &device.display_name(),
        properties.as_deref(),
        wanted,
    )
}

/// Default devices first, then stable lexicographic order, so repeated
/// enumerations present devices identically.
pub(crate) fn sort_devices(devices: &mut [DeviceRecord]) {
    devices.sort_by(|a, b| {
        b.info
            .is_default
            .cmp(&a.info.is_default)
            .then_with(|| a.info.label.cmp(&b.info.label))
    });
}

pub(crate) struct DeviceRecord {
    pub(crate) info: CaptureDevice,
    pub(crate) handle: Option<gst::Device>,
}

impl DeviceRecord {
    fn source(&self) -> CaptureSource {
        match &self.handle {
            Some(handle) => {
                CaptureSource::Monitor(MonitorCaptureDevice::new(handle.clone(), self.info.clone()))
            },
            None => CaptureSource::Mock(self.info.clone()),
        }
    }
}

#[derive(Default)]
pub(crate) struct RegistryState {
    monitor: Option<gst::DeviceMonitor>,
    watch: Option<gst::bus::BusWatchGuard>,
    pub(crate) records: Vec<DeviceRecord>,
    pub(crate) capturers: Vec<Arc<Capturer>>,
}

/// Ignores re-announcements of an already known endpoint.
pub(crate) fn insert_record(state: &mut RegistryState, record: DeviceRecord) {
    if state
        .records
        .iter()
        .any(|existing| existing.info == record.info)
    {
        return;
    }
    state.records.push(record);
    sort_devices(&mut state.records);
}

pub(crate) fn capturers_bound_to(
    capturers: &[Arc<Capturer>],
    persistent_id: &str,
) -> Vec<Arc<Capturer>> {
    capturers
        .iter()
        .filter(|capturer| {
            capturer.device_persistent_id().as_deref() == Some(persistent_id)
        })
        .cloned()
        .collect()
}

/// Replaces the record for a changed device. Every capturer bound to
/// the previous incarnation is handed the new one, so ongoing captures
/// follow default-device switches. Returns the rebind work to apply
/// once the registry lock is released.
pub(crate) fn apply_device_change(
    state: &mut RegistryState,
    old_info: Option<CaptureDevice>,
    new_info: Option<CaptureDevice>,
    new_handle: Option<gst::Device>,
) -> Vec<(Arc<Capturer>, CaptureSource)> {
    let mut rebinds = Vec::new();
    if let Some(old_info) = old_info {
        state.records.retain(|record| record.info != old_info);
        if let Some(new_info) = new_info.as_ref() {
            for capturer in capturers_bound_to(&state.capturers, &old_info.persistent_id) {
                let record = DeviceRecord {
                    info: new_info.clone(),
                    handle: new_handle.clone(),
                };
                rebinds.push((capturer, record.source()));
            }
        }
    }
    if let Some(new_info) = new_info {
        insert_record(
            state,
            DeviceRecord {
                info: new_info,
                handle: new_handle,
            },
        );
    }
    rebinds
}

/// Drops the record and returns the capturers that were feeding from
/// it; the caller stops them outside the lock.
pub(crate) fn apply_device_removal(
    state: &mut RegistryState,
    persistent_id: &str,
) -> Vec<Arc<Capturer>> {
    state
        .records
        .retain(|record| record.info.persistent_id != persistent_id);
    capturers_bound_to(&state.capturers, persistent_id)
}

pub struct CaptureDeviceRegistry {
    wanted: Vec<CaptureDeviceType>,
    state: Arc<Mutex<RegistryState>>,
}

impl CaptureDeviceRegistry {
    pub fn new(wanted: Vec<CaptureDeviceType>) -> CaptureDeviceRegistry {
        CaptureDeviceRegistry {
            wanted,
            state: Arc::new(Mutex::new(RegistryState::default())),
        }
    }

    pub fn for_audio() -> CaptureDeviceRegistry {
        Self::new(vec![
            CaptureDeviceType::Microphone,
            CaptureDeviceType::Speaker,
        ])
    }

    pub fn for_video() -> CaptureDeviceRegistry {
        Self::new(vec![CaptureDeviceType::Camera])
    }

    /// Enumerates devices, starting the monitor on first use.
    pub fn devices(&self) -> Vec<CaptureDevice> {
        let mut state = self.state.lock().unwrap();
        self.ensure_monitor(&mut state);
        state.records.iter().map(|record| record.info.clone()).collect()
    }

    pub fn devices_of(&self, device_type: CaptureDeviceType) -> Vec<CaptureDevice> {
        self.devices()
            .into_iter()
            .filter(|device| device.device_type == device_type)
            .collect()
    }

    pub fn device_with_persistent_id(&self, persistent_id: &str) -> Option<CaptureDevice> {
        self.devices()
            .into_iter()
            .find(|device| device.persistent_id == persistent_id)
    }

    /// Creates a capturer bound to the given device and tracks it for
    /// hotplug handling. The capture pipeline is not started yet.
    pub fn create_capturer(
        &self,
        persistent_id: &str,
        caps: gst::Caps,
    ) -> Option<Arc<Capturer>> {
        let stream_type;
        let source = {
            let mut state = self.state.lock().unwrap();
            self.ensure_monitor(&mut state);
            let record = state
                .records
                .iter()
                .find(|record| record.info.persistent_id == persistent_id)?;
            stream_type = match record.info.device_type {
                CaptureDeviceType::Microphone | CaptureDeviceType::SystemAudio => {
                    MediaStreamType::Audio
                },
                _ => MediaStreamType::Video,
            };
            record.source()
        };
        let capturer = Capturer::new(stream_type, Some(source), caps);
        self.register_capturer(capturer.clone());
        Some(capturer)
    }

    pub fn register_capturer(&self, capturer: Arc<Capturer>) {
        self.state.lock().unwrap().capturers.push(capturer);
    }

    pub fn unregister_capturer(&self, capturer: &Arc<Capturer>) {
        self.state
            .lock()
            .unwrap()
            .capturers
            .retain(|candidate| !Arc::ptr_eq(candidate, capturer));
    }

    /// Stops every capture bound to the given device.
    pub fn stop_capturing(&self, persistent_id: &str) {
        let capturers = {
            let state = self.state.lock().unwrap();
            capturers_bound_to(&state.capturers, persistent_id)
        };
        for capturer in capturers {
            capturer.stop_device(true);
        }
    }

    /// Registers a synthetic device that is served by a test source
    /// instead of real hardware.
    pub fn add_mock_device(&self, mut info: CaptureDevice) {
        info.is_mock = true;
        let mut state = self.state.lock().unwrap();
        insert_record(
            &mut state,
            DeviceRecord {
                info,
                handle: None,
            },
        );
    }

    pub fn teardown(&self) {
        let (capturers, monitor) = {
            let mut state = self.state.lock().unwrap();
            state.watch = None;
            (
                std::mem::take(&mut state.capturers),
                state.monitor.take(),
            )
        };
        for capturer in capturers {
            capturer.stop_device(true);
        }
        if let Some(monitor) = monitor {
            monitor.stop();
        }
    }

    fn ensure_monitor(&self, state: &mut RegistryState) {
        if state.monitor.is_some() {
            return;
        }
        let monitor = gst::DeviceMonitor::new();
        let raw_audio = gst::Caps::builder("audio/x-raw").build();
        for device_type in &self.wanted {
            match device_type {
                CaptureDeviceType::Camera => {
                    monitor.add_filter(Some("Video/Source"), None);
                },
                CaptureDeviceType::Microphone => {
                    monitor.add_filter(Some("Audio/Source"), Some(&raw_audio));
                },
                CaptureDeviceType::Speaker => {
                    monitor.add_filter(Some("Audio/Sink"), Some(&raw_audio));
                },
                _ => continue,
            };
        }

        // The monitor floods the bus with device-added messages for
        // everything it already knows; flush those and take the initial
        // snapshot from the device list instead.
        let bus = monitor.bus();
        bus.set_flushing(true);
        if let Err(err) = monitor.start() {
            warn!("Device monitor failed to start: {}", err);
            return;
        }
        bus.set_flushing(false);

        for device in monitor.devices() {
            if let Some(info) = classify_gst_device(&device, &self.wanted) {
                insert_record(
                    state,
                    DeviceRecord {
                        info,
                        handle: Some(device),
                    },
                );
            }
        }

        let weak_state = Arc::downgrade(&self.state);
        let wanted = self.wanted.clone();
        match bus.add_watch(move |_bus, message| {
            if let Some(state) = weak_state.upgrade() {
                dispatch_monitor_message(&state, &wanted, message);
            }
            glib::ControlFlow::Continue
        }) {
            Ok(watch) => state.watch = Some(watch),
            Err(err) => warn!("Device monitor bus watch rejected: {}", err),
        }
        state.monitor = Some(monitor);
    }
}

fn dispatch_monitor_message(
    state: &Arc<Mutex<RegistryState>>,
    wanted: &[CaptureDeviceType],
    message: &gst::Message,
) {
    match message.view() {
        gst::MessageView::DeviceAdded(added) => {
            let device = added.device();
            if let Some(info) = classify_gst_device(&device, wanted) {
                debug!("Device appeared: {}", info.label);
                insert_record(
                    &mut state.lock().unwrap(),
                    DeviceRecord {
                        info,
                        handle: Some(device),
                    },
                );
            }
        },
        gst::MessageView::DeviceRemoved(removed) => {
            let device = removed.device();
            if let Some(info) = classify_gst_device(&device, wanted) {
                debug!("Device removed: {}", info.label);
                let capturers =
                    apply_device_removal(&mut state.lock().unwrap(), &info.persistent_id);
                for capturer in capturers {
                    capturer.stop_device(true);
                }
            }
        },
        gst::MessageView::DeviceChanged(changed) => {
            let (new_device, old_device) = changed.device_changed();
            let old_info = classify_gst_device(&old_device, wanted);
            let new_info = classify_gst_device(&new_device, wanted);
            let rebinds = apply_device_change(
                &mut state.lock().unwrap(),
                old_info,
                new_info,
                Some(new_device),
            );
            for (capturer, source) in rebinds {
                if let Err(err) = capturer.set_device(Some(source)) {
                    warn!("Rebinding capturer to changed device failed: {}", err);
                }
            }
        },
        _ => (),
    }
}
