/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Client for the XDG desktop portal ScreenCast and Camera interfaces.
//!
//! Portal requests follow the request/response pattern described in the
//! portal documentation: the reply of a method call only acknowledges
//! the request, the actual result arrives later as a `Response` signal
//! on an `org.freedesktop.portal.Request` object whose path is derived
//! from our unique bus name and a caller-chosen token.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_lite::{future, StreamExt};
use log::warn;
use zbus::export::serde::ser::Serialize;
use zbus::zvariant::{self, DynamicType, ObjectPath, OwnedValue, Value};

use crate::pipewire::{PipeWireCaptureDevice, PipeWireNodeData};
use brook_media_streams::capture::CaptureDeviceType;

pub const PORTAL_SERVICE: &str = "org.freedesktop.portal.Desktop";
const PORTAL_PATH: &str = "/org/freedesktop/portal/desktop";
const REQUEST_IFACE: &str = "org.freedesktop.portal.Request";
const SESSION_IFACE: &str = "org.freedesktop.portal.Session";

pub const SOURCE_TYPE_MONITOR: u32 = 1;
pub const SOURCE_TYPE_WINDOW: u32 = 2;

const CURSOR_MODE_HIDDEN: u32 = 1;
const CURSOR_MODE_EMBEDDED: u32 = 2;

/// How long to wait for a `Response` signal. User-facing portal dialogs
/// can stay open for a while, so this is deliberately generous.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Session teardown is best effort and must not stall shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error("D-Bus failure: {0}")]
    Bus(#[from] zbus::Error),
    #[error("variant failure: {0}")]
    Variant(#[from] zvariant::Error),
    #[error("portal request denied with response code {0}")]
    Denied(u32),
    #[error("timed out waiting for portal response")]
    Timeout,
    #[error("malformed portal response: {0}")]
    Malformed(String),
}

fn request_token() -> String {
    format!("brook{}", rand::random::<u32>())
}

/// Unique bus names look like `:1.42`; the corresponding request path
/// component is `1_42`.
fn sender_path_component(unique_name: &str) -> String {
    unique_name.trim_start_matches(':').replace('.', "_")
}

fn request_path_for(sender: &str, token: &str) -> String {
    format!("/org/freedesktop/portal/desktop/request/{sender}/{token}")
}

/// The session object path mirrors the request path with `/session/`
/// substituted for `/request/` and the session token as last component.
fn session_path_from_request(request_path: &str, session_token: &str) -> String {
    let base = request_path.replacen("/request/", "/session/", 1);
    match base.rfind('/') {
        Some(idx) => format!("{}/{}", &base[..idx], session_token),
        None => base,
    }
}

struct PortalConnection {
    connection: zbus::Connection,
    proxy: zbus::Proxy<'static>,
    // Only one portal request may be in flight per connection; the
    // response matching below does not disambiguate interleaved waits.
    response_pending: AtomicBool,
}

impl PortalConnection {
    async fn connect(interface: &'static str) -> Result<PortalConnection, PortalError> {
        let connection = zbus::Connection::session().await?;
        let proxy =
            zbus::Proxy::new(&connection, PORTAL_SERVICE, PORTAL_PATH, interface).await?;
        Ok(PortalConnection {
            connection,
            proxy,
            response_pending: AtomicBool::new(false),
        })
    }

    fn request_path(&self, token: &str) -> String {
        let sender = self
            .connection
            .unique_name()
            .map(|name| sender_path_component(name.as_str()))
            .unwrap_or_default();
        request_path_for(&sender, token)
    }

    /// Calls `method_name` on the portal and waits for the matching
    /// `Response` signal. The signal subscription is set up before the
    /// call so a fast reply cannot be missed. Returns the response
    /// vardict on success.
    async fn call_with_response<B>(
        &self,
        method_name: &str,
        body: &B,
        request_path: String,
    ) -> Result<HashMap<String, OwnedValue>, PortalError>
    where
        B: Serialize + DynamicType,
    {
        assert!(
            !self.response_pending.swap(true, Ordering::SeqCst),
            "portal response wait already in flight"
        );
        let result = self.call_inner(method_name, body, request_path).await;
        self.response_pending.store(false, Ordering::SeqCst);
        result
    }

    async fn call_inner<B>(
        &self,
        method_name: &str,
        body: &B,
        request_path: String,
    ) -> Result<HashMap<String, OwnedValue>, PortalError>
    where
        B: Serialize + DynamicType,
    {
        let path = ObjectPath::try_from(request_path)?;
        let request_proxy =
            zbus::Proxy::new(&self.connection, PORTAL_SERVICE, path, REQUEST_IFACE).await?;
        let mut responses = request_proxy.receive_signal("Response").await?;
        self.proxy.call_method(method_name, body).await?;
        let message = future::or(
            async { responses.next().await.ok_or(PortalError::Timeout) },
            async {
                async_io::Timer::after(RESPONSE_TIMEOUT).await;
                Err(PortalError::Timeout)
            },
        )
        .await?;
        let (code, results): (u32, HashMap<String, OwnedValue>) = message
            .body()
            .deserialize()
            .map_err(|err| PortalError::Malformed(err.to_string()))?;
        if code != 0 {
            return Err(PortalError::Denied(code));
        }
        Ok(results)
    }
}

/// A ScreenCast portal session. Closing is idempotent; the first close
/// wins and later attempts are ignored.
#[derive(Debug)]
pub struct ScreencastSession {
    path: String,
    closed: AtomicBool,
}

impl ScreencastSession {
    fn new(path: String) -> ScreencastSession {
        ScreencastSession {
            path,
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns true exactly once, for the caller that gets to issue the
    /// Close call.
    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

pub struct ScreenCastPortal {
    portal: PortalConnection,
}

impl ScreenCastPortal {
    pub fn new() -> Result<ScreenCastPortal, PortalError> {
        let portal = zbus::block_on(PortalConnection::connect(
            "org.freedesktop.portal.ScreenCast",
        ))?;
        Ok(ScreenCastPortal { portal })
    }

    pub fn create_session(&self) -> Result<ScreencastSession, PortalError> {
        zbus::block_on(async {
            let token = request_token();
            let session_token = request_token();
            let request_path = self.portal.request_path(&token);
            let options: HashMap<&str, Value> = [
                ("handle_token", Value::from(token.as_str())),
                ("session_handle_token", Value::from(session_token.as_str())),
            ]
            .into_iter()
            .collect();
            let results = self
                .portal
                .call_with_response("CreateSession", &(options,), request_path.clone())
                .await?;
            let path = match results.get("session_handle") {
                Some(value) => value
                    .downcast_ref::<&str>()
                    .map(str::to_owned)
                    .map_err(|err| PortalError::Malformed(err.to_string()))?,
                None => session_path_from_request(&request_path, &session_token),
            };
            Ok(ScreencastSession::new(path))
        })
    }

    pub fn select_sources(
        &self,
        session: &ScreencastSession,
        source_types: u32,
        embed_cursor: bool,
    ) -> Result<(), PortalError> {
        zbus::block_on(async {
            let token = request_token();
            let request_path = self.portal.request_path(&token);
            let mut options: HashMap<&str, Value> = [
                ("handle_token", Value::from(token.as_str())),
                ("types", Value::from(source_types)),
                ("multiple", Value::from(false)),
            ]
            .into_iter()
            .collect();
            // cursor_mode appeared in version 2 of the interface.
            let version: u32 = self.portal.proxy.get_property("version").await.unwrap_or(1);
            if version >= 2 {
                let mode = if embed_cursor {
                    CURSOR_MODE_EMBEDDED
                } else {
                    CURSOR_MODE_HIDDEN
                };
                options.insert("cursor_mode", Value::from(mode));
            }
            let path = ObjectPath::try_from(session.path())?;
            self.portal
                .call_with_response("SelectSources", &(path, options), request_path)
                .await?;
            Ok(())
        })
    }

    /// Starts the session and returns the PipeWire node id of the first
    /// negotiated stream.
    pub fn start(&self, session: &ScreencastSession) -> Result<u32, PortalError> {
        zbus::block_on(async {
            let token = request_token();
            let request_path = self.portal.request_path(&token);
            let options: HashMap<&str, Value> =
                [("handle_token", Value::from(token.as_str()))]
                    .into_iter()
                    .collect();
            let path = ObjectPath::try_from(session.path())?;
            let results = self
                .portal
                .call_with_response("Start", &(path, "", options), request_path)
                .await?;
            stream_node_id(&results)
                .ok_or_else(|| PortalError::Malformed("no streams in Start response".into()))
        })
    }

    pub fn open_pipewire_remote(
        &self,
        session: &ScreencastSession,
    ) -> Result<OwnedFd, PortalError> {
        zbus::block_on(async {
            let path = ObjectPath::try_from(session.path())?;
            let options: HashMap<&str, Value> = HashMap::new();
            let reply = self
                .portal
                .proxy
                .call_method("OpenPipeWireRemote", &(path, options))
                .await?;
            let fd: zvariant::OwnedFd = reply
                .body()
                .deserialize()
                .map_err(|err| PortalError::Malformed(err.to_string()))?;
            Ok(OwnedFd::from(fd))
        })
    }

    /// Best-effort session teardown, bounded so a wedged portal cannot
    /// stall shutdown. Safe to call more than once.
    pub fn close_session(&self, session: &ScreencastSession) {
        if !session.mark_closed() {
            return;
        }
        let result: Result<(), PortalError> = zbus::block_on(async {
            let path = ObjectPath::try_from(session.path())?;
            let proxy =
                zbus::Proxy::new(&self.portal.connection, PORTAL_SERVICE, path, SESSION_IFACE)
                    .await?;
            future::or(
                async {
                    proxy.call_method("Close", &()).await?;
                    Ok(())
                },
                async {
                    async_io::Timer::after(CLOSE_TIMEOUT).await;
                    Err(PortalError::Timeout)
                },
            )
            .await
        });
        if let Err(err) = result {
            warn!("Closing portal session {} failed: {}", session.path(), err);
        }
    }
}

/// The Start response carries an `a(ua{sv})` of negotiated streams; we
/// asked for a single source, so the first node id is the one we want.
fn stream_node_id(results: &HashMap<String, OwnedValue>) -> Option<u32> {
    let streams = results.get("streams")?;
    let array: &zvariant::Array = streams.downcast_ref().ok()?;
    let first = array.iter().next()?;
    let stream: &zvariant::Structure = first.downcast_ref().ok()?;
    let node = stream.fields().first()?;
    u32::try_from(node).ok()
}

pub struct CameraPortal {
    portal: PortalConnection,
}

impl CameraPortal {
    pub fn new() -> Result<CameraPortal, PortalError> {
        let portal = zbus::block_on(PortalConnection::connect("org.freedesktop.portal.Camera"))?;
        Ok(CameraPortal { portal })
    }

    pub fn is_camera_present(&self) -> bool {
        zbus::block_on(self.portal.proxy.get_property("IsCameraPresent")).unwrap_or(false)
    }

    /// Requests camera access and, once granted, opens the PipeWire
    /// remote carrying the camera nodes.
    pub fn access_camera(&self) -> Result<OwnedFd, PortalError> {
        zbus::block_on(async {
            let token = request_token();
            let request_path = self.portal.request_path(&token);
            let options: HashMap<&str, Value> =
                [("handle_token", Value::from(token.as_str()))]
                    .into_iter()
                    .collect();
            self.portal
                .call_with_response("AccessCamera", &(options,), request_path)
                .await?;
            let options: HashMap<&str, Value> = HashMap::new();
            let reply = self
                .portal
                .proxy
                .call_method("OpenPipeWireRemote", &(options,))
                .await?;
            let fd: zvariant::OwnedFd = reply
                .body()
                .deserialize()
                .map_err(|err| PortalError::Malformed(err.to_string()))?;
            Ok(OwnedFd::from(fd))
        })
    }
}

/// Portal-backed camera access. One PipeWire remote carries every
/// camera node the user granted; each device duplicates the remote fd
/// so node lifetimes stay independent.
pub struct CameraCaptureManager {
    portal: Option<CameraPortal>,
    remote: Mutex<Option<Arc<OwnedFd>>>,
}

impl Default for CameraCaptureManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraCaptureManager {
    pub fn new() -> CameraCaptureManager {
        let portal = match CameraPortal::new() {
            Ok(portal) => Some(portal),
            Err(err) => {
                warn!("Camera portal unavailable: {}", err);
                None
            },
        };
        CameraCaptureManager {
            portal,
            remote: Mutex::new(None),
        }
    }

    pub fn is_camera_present(&self) -> bool {
        self.portal
            .as_ref()
            .map_or(false, CameraPortal::is_camera_present)
    }

    /// Prompts for camera access on first use and keeps the granted
    /// remote for subsequent devices.
    fn ensure_remote(&self) -> Option<Arc<OwnedFd>> {
        let mut remote = self.remote.lock().unwrap();
        if remote.is_none() {
            let portal = self.portal.as_ref()?;
            match portal.access_camera() {
                Ok(fd) => *remote = Some(Arc::new(fd)),
                Err(err) => {
                    warn!("Camera access denied: {}", err);
                    return None;
                },
            }
        }
        remote.clone()
    }

    /// Creates a capture device for one camera node carried by the
    /// portal remote.
    pub fn create_camera_device(
        &self,
        node_id: u32,
        label: &str,
    ) -> Option<PipeWireCaptureDevice> {
        let remote = self.ensure_remote()?;
        camera_device_from_remote(&remote, node_id, label)
    }

    pub fn teardown(&self) {
        *self.remote.lock().unwrap() = None;
    }
}

fn camera_device_from_remote(
    remote: &OwnedFd,
    node_id: u32,
    label: &str,
) -> Option<PipeWireCaptureDevice> {
    let fd = match remote.try_clone() {
        Ok(fd) => fd,
        Err(err) => {
            warn!("Duplicating the camera remote fd failed: {}", err);
            return None;
        },
    };
    // Camera nodes are not tied to a session object.
    let node = Arc::new(PipeWireNodeData::new(node_id, fd, String::new()));
    Some(PipeWireCaptureDevice::new(
        node,
        CaptureDeviceType::Camera,
        label.to_owned(),
    ))
}

/// Owns the portal-backed display capture sessions for the lifetime of
/// the capture context.
pub struct DisplayCaptureManager {
    portal: Option<ScreenCastPortal>,
    sessions: Mutex<Vec<Arc<ScreencastSession>>>,
}

impl DisplayCaptureManager {
    pub fn new() -> DisplayCaptureManager {
        let portal = match ScreenCastPortal::new() {
            Ok(portal) => Some(portal),
            Err(err) => {
                warn!("ScreenCast portal unavailable: {}", err);
                None
            },
        };
        DisplayCaptureManager {
            portal,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Negotiates a new display capture session with the portal,
    /// prompting the user to pick a monitor or window. On any failure
    /// past session creation the session is closed again.
    pub fn create_display_device(&self, source_types: u32) -> Option<PipeWireCaptureDevice> {
        let portal = self.portal.as_ref()?;
        let session = match portal.create_session() {
            Ok(session) => Arc::new(session),
            Err(err) => {
                warn!("Creating screencast session failed: {}", err);
                return None;
            },
        };
        match negotiate(portal, &session, source_types) {
            Ok(device) => {
                self.sessions.lock().unwrap().push(session);
                Some(device)
            },
            Err(err) => {
                warn!("Screencast negotiation failed: {}", err);
                portal.close_session(&session);
                None
            },
        }
    }

    /// Ends the session backing the given device, if we still track it.
    pub fn stop_device(&self, device: &PipeWireCaptureDevice) {
        let Some(portal) = self.portal.as_ref() else {
            return;
        };
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(idx) = sessions
            .iter()
            .position(|session| session.path() == device.session_path())
        {
            let session = sessions.remove(idx);
            portal.close_session(&session);
        }
    }

    pub fn teardown(&self) {
        let Some(portal) = self.portal.as_ref() else {
            return;
        };
        let sessions: Vec<_> = self.sessions.lock().unwrap().drain(..).collect();
        for session in sessions {
            portal.close_session(&session);
        }
    }
}

fn negotiate(
    portal: &ScreenCastPortal,
    session: &ScreencastSession,
    source_types: u32,
) -> Result<PipeWireCaptureDevice, PortalError> {
    portal.select_sources(session, source_types, true)?;
    let node_id = portal.start(session)?;
    let fd = portal.open_pipewire_remote(session)?;
    let node = Arc::new(PipeWireNodeData::new(node_id, fd, session.path().to_owned()));
    let device_type = if source_types & SOURCE_TYPE_WINDOW != 0 {
        CaptureDeviceType::Window
    } else {
        CaptureDeviceType::Screen
    };
    Ok(PipeWireCaptureDevice::new(
        node,
        device_type,
        format!("Display capture {node_id}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_component_strips_colon_and_dots() {
        assert_eq!(sender_path_component(":1.42"), "1_42");
        assert_eq!(sender_path_component(":1.0"), "1_0");
    }

    #[test]
    fn request_path_shape() {
        assert_eq!(
            request_path_for("1_42", "brook7"),
            "/org/freedesktop/portal/desktop/request/1_42/brook7"
        );
    }

    #[test]
    fn session_path_replaces_request_segment_and_token() {
        let request = "/org/freedesktop/portal/desktop/request/1_42/brook7";
        assert_eq!(
            session_path_from_request(request, "brook9"),
            "/org/freedesktop/portal/desktop/session/1_42/brook9"
        );
    }

    #[test]
    fn tokens_are_valid_path_components() {
        let token = request_token();
        assert!(token.starts_with("brook"));
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn camera_devices_duplicate_the_remote_fd() {
        use std::os::fd::AsRawFd;

        let (reader, _writer) = std::io::pipe().unwrap();
        let remote: OwnedFd = reader.into();
        let device = camera_device_from_remote(&remote, 7, "Front camera").unwrap();
        assert_eq!(device.device().device_type, CaptureDeviceType::Camera);
        assert_eq!(device.device().persistent_id, "7");
        assert_eq!(device.node_id(), 7);
        assert!(device.fd() >= 0);
        assert_ne!(device.fd(), remote.as_raw_fd());
        assert!(device.session_path().is_empty());
    }

    #[test]
    fn session_close_happens_once() {
        let session = ScreencastSession::new("/org/freedesktop/portal/desktop/session/1_1/t".into());
        assert!(session.mark_closed());
        assert!(!session.mark_closed());
    }
}
