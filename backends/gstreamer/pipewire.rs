/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Capture devices backed by PipeWire nodes negotiated through the
//! desktop portal.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use brook_media_streams::capture::{CaptureDevice, CaptureDeviceType};

/// Connection data for a single PipeWire stream node. The file
/// descriptor is owned here and closed when the last reference to the
/// node goes away.
#[derive(Debug)]
pub struct PipeWireNodeData {
    node_id: u32,
    fd: OwnedFd,
    session_path: String,
}

impl PipeWireNodeData {
    pub fn new(node_id: u32, fd: OwnedFd, session_path: String) -> PipeWireNodeData {
        PipeWireNodeData {
            node_id,
            fd,
            session_path,
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn session_path(&self) -> &str {
        &self.session_path
    }
}

/// A portal-negotiated capture device. Unlike devices surfaced by the
/// GStreamer device monitor these are created on demand, one per portal
/// session.
#[derive(Clone, Debug)]
pub struct PipeWireCaptureDevice {
    device: CaptureDevice,
    node: Arc<PipeWireNodeData>,
}

impl PipeWireCaptureDevice {
    pub fn new(node: Arc<PipeWireNodeData>, device_type: CaptureDeviceType, label: String) -> Self {
        let device = CaptureDevice::new(node.node_id().to_string(), device_type, label);
        PipeWireCaptureDevice { device, node }
    }

    pub fn device(&self) -> &CaptureDevice {
        &self.device
    }

    pub fn node_id(&self) -> u32 {
        self.node.node_id()
    }

    pub fn fd(&self) -> RawFd {
        self.node.fd()
    }

    pub fn session_path(&self) -> &str {
        self.node.session_path()
    }

    /// Caps advertised by pipewiresrc before negotiation. DMA-BUF
    /// backed video is preferred, with a system memory fallback.
    pub fn preferred_caps(&self) -> gst::Caps {
        let mut caps = gst::Caps::builder("video/x-raw")
            .features(["memory:DMABuf"])
            .field("format", "DMA_DRM")
            .build();
        caps.merge(gst::Caps::builder("video/x-raw").build());
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_fd() -> OwnedFd {
        let (reader, _writer) = std::io::pipe().unwrap();
        reader.into()
    }

    #[test]
    fn node_identity_follows_node_id() {
        let node = Arc::new(PipeWireNodeData::new(
            42,
            loopback_fd(),
            "/org/freedesktop/portal/desktop/session/1_1/brook1".into(),
        ));
        let device =
            PipeWireCaptureDevice::new(node, CaptureDeviceType::Screen, "Monitor 1".into());
        assert_eq!(device.device().persistent_id, "42");
        assert_eq!(device.node_id(), 42);
        assert!(device.fd() >= 0);
    }
}
