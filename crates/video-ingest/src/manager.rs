//! Camera session lifecycle: acquisition, the capture thread, and release.

use std::{
    fmt,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{CameraBackend, CaptureDevice},
    feed::VideoFeed,
    types::{CameraError, CaptureError, CaptureRequest, Resolution},
};

/// Identity of one camera session. Never reused within a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn get(self) -> u64 {
        self.0
    }

    /// Build an id without acquiring a camera. Only meant for tests; ids
    /// handed out by [`StreamManager`] never collide with each other but may
    /// collide with these.
    #[doc(hidden)]
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle notifications emitted by [`StreamManager`].
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// The first frame arrived and fixed the session resolution.
    MetadataReady {
        session: SessionId,
        resolution: Resolution,
    },
    /// The session was stopped on request.
    Stopped { session: SessionId },
    /// The device failed mid-session; the session is over.
    Failed {
        session: SessionId,
        error: CameraError,
    },
}

/// Handle onto an acquired camera session.
///
/// Cloning is cheap; all clones observe the same activity flag, feed and
/// resolution. The device itself stays owned by the [`StreamManager`].
#[derive(Clone)]
pub struct StreamSession {
    id: SessionId,
    device: Arc<str>,
    feed: VideoFeed,
    resolution: Arc<OnceLock<Resolution>>,
    active: Arc<AtomicBool>,
}

impl StreamSession {
    fn new(id: SessionId, device: &str) -> Self {
        Self {
            id,
            device: Arc::from(device),
            feed: VideoFeed::new(),
            resolution: Arc::new(OnceLock::new()),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn feed(&self) -> &VideoFeed {
        &self.feed
    }

    /// Known once the first frame has been captured; fixed afterwards.
    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution.get().copied()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("active", &self.is_active())
            .field("resolution", &self.resolution())
            .finish()
    }
}

/// How long `stop` waits for the capture thread before leaving it to a reaper.
const RELEASE_GRACE: Duration = Duration::from_millis(100);

/// Owns the capture thread of the active session. Releasing (or dropping) the
/// lease stops the thread, which drops the device.
///
/// A thread stuck inside the driver is not waited for: it is joined on a
/// reaper thread and the device is dropped whenever its read returns.
struct DeviceLease {
    session: StreamSession,
    handle: Option<thread::JoinHandle<()>>,
}

impl DeviceLease {
    fn release(&mut self) {
        self.session.deactivate();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }

        let session = self.session.id;
        let deadline = Instant::now() + RELEASE_GRACE;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                warn!(%session, "capture thread panicked");
            }
            return;
        }

        warn!(%session, "capture thread blocked in the driver; releasing it in the background");
        let reaper = thread::Builder::new()
            .name(format!("camera-reaper-{}", session.get()))
            .spawn(move || match handle.join() {
                Ok(()) => debug!(%session, "late capture thread exited"),
                Err(_) => warn!(%session, "capture thread panicked"),
            });
        if let Err(err) = reaper {
            warn!(%session, "failed to spawn reaper, detaching capture thread: {err}");
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Acquires and releases the camera. At most one session is live at a time.
pub struct StreamManager {
    backend: Arc<dyn CameraBackend>,
    events: mpsc::UnboundedSender<StreamEvent>,
    next_session: u64,
    current: Option<DeviceLease>,
}

impl StreamManager {
    /// Create a manager and the receiver its lifecycle events are delivered on.
    pub fn new(backend: Arc<dyn CameraBackend>) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                backend,
                events,
                next_session: 0,
                current: None,
            },
            rx,
        )
    }

    pub fn session(&self) -> Option<&StreamSession> {
        self.current.as_ref().map(|lease| &lease.session)
    }

    /// Acquire the camera and start the capture thread.
    ///
    /// An already running session is stopped first. The device open runs on
    /// the blocking pool; if this future is dropped before the open finishes,
    /// the opened device is dropped on the blocking thread instead of leaking.
    pub async fn start(&mut self, request: &CaptureRequest) -> Result<StreamSession, CameraError> {
        if self.current.is_some() {
            self.stop();
        }

        let device_name = self.backend.device_name();
        let backend = self.backend.clone();
        let open_request = request.clone();
        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let opened = backend.open(&open_request);
            if let Err(Ok(device)) = tx.send(opened) {
                debug!("camera opened after its requester went away; releasing");
                drop(device);
            }
        });

        let device = rx
            .await
            .map_err(|_| CameraError::unavailable(&device_name, "camera open task aborted"))??;

        self.next_session += 1;
        let session = StreamSession::new(SessionId(self.next_session), &device_name);
        let handle = spawn_capture_thread(device, session.clone(), self.events.clone())
            .map_err(|err| CameraError::unavailable(&device_name, err))?;

        info!(
            session = %session.id,
            device = %device_name,
            facing = ?request.facing,
            ideal = %request.ideal_resolution,
            "camera session started"
        );

        self.current = Some(DeviceLease {
            session: session.clone(),
            handle: Some(handle),
        });
        Ok(session)
    }

    /// Halt capture, release the device and clear the session.
    ///
    /// Returns the id of the session that was stopped, if any.
    pub fn stop(&mut self) -> Option<SessionId> {
        let mut lease = self.current.take()?;
        let id = lease.session.id;
        lease.release();
        lease.session.feed.clear();
        info!(session = %id, "camera session stopped");
        let _ = self.events.send(StreamEvent::Stopped { session: id });
        Some(id)
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_capture_thread(
    mut device: Box<dyn CaptureDevice>,
    session: StreamSession,
    events: mpsc::UnboundedSender<StreamEvent>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("camera-capture-{}", session.id.get()))
        .spawn(move || {
            let result = capture_loop(device.as_mut(), &session, &events);
            if let Err(err) = result {
                // A read error after stop() is just the device going away.
                if session.is_active() {
                    error!(session = %session.id, "capture error: {err}");
                    session.deactivate();
                    let _ = events.send(StreamEvent::Failed {
                        session: session.id,
                        error: CameraError::unavailable(session.device(), err),
                    });
                }
            }
            drop(device);
            debug!(session = %session.id, "camera device released");
        })
}

/// Main capture loop executed on the background thread.
fn capture_loop(
    device: &mut dyn CaptureDevice,
    session: &StreamSession,
    events: &mpsc::UnboundedSender<StreamEvent>,
) -> Result<(), CaptureError> {
    let mut announced = false;

    while session.is_active() {
        let frame = device.read_frame()?;
        if frame.width == 0 || frame.height == 0 {
            continue;
        }
        if frame.data.len() < frame.expected_len() {
            return Err(CaptureError::Truncated {
                expected: frame.expected_len(),
                actual: frame.data.len(),
            });
        }

        if !announced {
            let resolution = frame.resolution();
            let _ = session.resolution.set(resolution);
            debug!(session = %session.id, %resolution, "stream metadata ready");
            let _ = events.send(StreamEvent::MetadataReady {
                session: session.id,
                resolution,
            });
            announced = true;
        }

        if !session.is_active() {
            break;
        }
        session.feed.publish(frame);
    }

    Ok(())
}
