/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Backend-agnostic description of capture devices and track constraints.

/// The kind of hardware or virtual endpoint a capture device exposes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum CaptureDeviceType {
    Camera,
    Microphone,
    Speaker,
    Screen,
    Window,
    SystemAudio,
}

/// A capture endpoint as exposed to device enumeration.
///
/// Two devices are considered the same endpoint when their persistent
/// identifiers match, regardless of label or default flag, so that a
/// device surviving a backend restart keeps its identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptureDevice {
    pub persistent_id: String,
    pub device_type: CaptureDeviceType,
    pub label: String,
    pub group_id: String,
    pub enabled: bool,
    pub is_default: bool,
    pub is_mock: bool,
}

impl CaptureDevice {
    pub fn new(
        persistent_id: String,
        device_type: CaptureDeviceType,
        label: String,
    ) -> CaptureDevice {
        CaptureDevice {
            persistent_id,
            device_type,
            label,
            group_id: String::new(),
            enabled: true,
            is_default: false,
            is_mock: false,
        }
    }
}

impl PartialEq for CaptureDevice {
    fn eq(&self, other: &Self) -> bool {
        self.persistent_id == other.persistent_id
    }
}

impl Eq for CaptureDevice {}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ConstrainRange<T> {
    pub min: Option<T>,
    pub max: Option<T>,
    pub ideal: Option<T>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum Constrain<T> {
    Value(T),
    Range(ConstrainRange<T>),
}

/// A set of constraints applied when opening a capture track,
/// modelled on the MediaTrackConstraintSet dictionary.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct MediaTrackConstraintSet {
    pub width: Option<Constrain<u32>>,
    pub height: Option<Constrain<u32>>,
    pub aspect: Option<Constrain<f64>>,
    pub frame_rate: Option<Constrain<f64>>,
    pub sample_rate: Option<Constrain<u32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devices_compare_by_persistent_id() {
        let mut a = CaptureDevice::new(
            "cam0".into(),
            CaptureDeviceType::Camera,
            "Front camera".into(),
        );
        let b = CaptureDevice::new(
            "cam0".into(),
            CaptureDeviceType::Camera,
            "default: Front camera".into(),
        );
        let c = CaptureDevice::new("cam1".into(), CaptureDeviceType::Camera, "Back".into());
        a.is_default = true;
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
