use crate::config::Config;
use crate::encoder::CommandEncoder;
use crate::store::SqliteStore;
use rollcall_core::{
    AttendanceRecorder, AttendanceStore, EncoderError, FaceEncoder, FrameSource, Gallery,
    GallerySource, GalleryStats, Pipeline, PipelineError, PipelineStats, ScheduleSource, Session,
    StoreError,
};
use rollcall_hw::{Camera, CameraError};
use serde::Serialize;
use std::ops::ControlFlow;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("datastore error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn monitor thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("monitor startup task failed: {0}")]
    Startup(#[from] tokio::task::JoinError),
    #[error("monitor thread exited")]
    ChannelClosed,
}

/// Snapshot of the running session, returned by `Status`.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub version: &'static str,
    pub camera_device: String,
    pub frame_skip: u32,
    pub match_threshold: f32,
    pub attendance_threshold: f32,
    pub gallery: GalleryStats,
    pub tracked: usize,
    pub stats: PipelineStats,
}

/// Messages sent from D-Bus handlers to the monitor thread.
enum MonitorCommand {
    Reload {
        reply: oneshot::Sender<Result<GalleryStats, StoreError>>,
    },
    SetFrameSkip {
        every: u32,
        reply: oneshot::Sender<u32>,
    },
    Status {
        reply: oneshot::Sender<MonitorStatus>,
    },
    Stop,
}

/// Clone-safe handle to the monitor thread.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<MonitorCommand>,
}

/// Resolves when the monitoring loop ends, with its final counters.
pub type MonitorExit = oneshot::Receiver<Result<PipelineStats, PipelineError>>;

impl MonitorHandle {
    /// Reload the gallery from the datastore. The previous gallery stays
    /// active if the load fails.
    pub async fn reload(&self) -> Result<GalleryStats, MonitorError> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCommand::Reload { reply }).await?;
        Ok(rx.await.map_err(|_| MonitorError::ChannelClosed)??)
    }

    /// Change the throttle interval; returns the value in effect.
    pub async fn set_frame_skip(&self, every: u32) -> Result<u32, MonitorError> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCommand::SetFrameSkip { every, reply }).await?;
        rx.await.map_err(|_| MonitorError::ChannelClosed)
    }

    pub async fn status(&self) -> Result<MonitorStatus, MonitorError> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCommand::Status { reply }).await?;
        rx.await.map_err(|_| MonitorError::ChannelClosed)
    }

    /// Ask the loop to finish after the current frame.
    pub async fn stop(&self) -> Result<(), MonitorError> {
        self.send(MonitorCommand::Stop).await
    }

    async fn send(&self, cmd: MonitorCommand) -> Result<(), MonitorError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| MonitorError::ChannelClosed)
    }
}

/// Open the camera, start the encoder, load the gallery, and run the
/// monitoring loop on a dedicated OS thread.
///
/// Startup does blocking device I/O, so it runs on a blocking worker.
/// Fails fast if any resource is unavailable.
pub async fn spawn_monitor(
    config: Config,
    store: SqliteStore,
) -> Result<(MonitorHandle, MonitorExit), MonitorError> {
    tokio::task::spawn_blocking(move || open_monitor(&config, store)).await?
}

fn open_monitor(
    config: &Config,
    store: SqliteStore,
) -> Result<(MonitorHandle, MonitorExit), MonitorError> {
    let mut camera = Camera::open(&config.camera_device, config.frame_width, config.frame_height)?;
    camera.warmup(config.warmup_frames);

    let encoder = CommandEncoder::spawn(config.encoder_command.clone(), config.encoder_timeout)?;

    let gallery = Gallery::load(&store)?;
    let session = Session::new(config.recognition.clone(), gallery);
    let pipeline = Pipeline::new(camera, encoder, session, AttendanceRecorder::new(store))
        .with_max_failures(config.max_camera_failures);

    start(pipeline, config.camera_device.clone())
}

fn start<S, E, A>(
    mut pipeline: Pipeline<S, E, A>,
    camera_device: String,
) -> Result<(MonitorHandle, MonitorExit), MonitorError>
where
    S: FrameSource + Send + 'static,
    E: FaceEncoder<S::Frame> + Send + 'static,
    A: AttendanceStore + ScheduleSource + GallerySource + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<MonitorCommand>(8);
    let (done_tx, done_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("rollcall-monitor".into())
        .spawn(move || {
            tracing::info!(
                frame_skip = pipeline.session().frame_skip(),
                gallery = pipeline.session().gallery().len(),
                "monitoring started"
            );
            let result = pipeline.run(|p| loop {
                match rx.try_recv() {
                    Ok(cmd) => {
                        if apply(p, cmd, &camera_device).is_break() {
                            return ControlFlow::Break(());
                        }
                    }
                    Err(TryRecvError::Empty) => return ControlFlow::Continue(()),
                    Err(TryRecvError::Disconnected) => return ControlFlow::Break(()),
                }
            });
            match &result {
                Ok(stats) => tracing::info!(
                    frames = stats.frames_seen,
                    processed = stats.frames_processed,
                    records = stats.records_written,
                    "monitoring stopped"
                ),
                Err(e) => tracing::error!(error = %e, "monitoring ended"),
            }
            drop(pipeline);
            let _ = done_tx.send(result);
        })
        .map_err(MonitorError::Spawn)?;

    Ok((MonitorHandle { tx }, done_rx))
}

fn apply<S, E, A>(
    pipeline: &mut Pipeline<S, E, A>,
    cmd: MonitorCommand,
    camera_device: &str,
) -> ControlFlow<()>
where
    S: FrameSource,
    E: FaceEncoder<S::Frame>,
    A: AttendanceStore + ScheduleSource + GallerySource,
{
    match cmd {
        MonitorCommand::Reload { reply } => {
            let result = Gallery::load(pipeline.recorder().store())
                .map(|gallery| pipeline.session_mut().set_gallery(gallery));
            match &result {
                Ok(stats) => tracing::info!(
                    signatures = stats.signatures,
                    identities = stats.identities,
                    "gallery reloaded"
                ),
                Err(e) => tracing::warn!(error = %e, "gallery reload failed; keeping previous"),
            }
            let _ = reply.send(result);
        }
        MonitorCommand::SetFrameSkip { every, reply } => {
            pipeline.session_mut().set_frame_skip(every);
            let every = pipeline.session().frame_skip();
            tracing::info!(every, "frame skip updated");
            let _ = reply.send(every);
        }
        MonitorCommand::Status { reply } => {
            let session = pipeline.session();
            let _ = reply.send(MonitorStatus {
                version: env!("CARGO_PKG_VERSION"),
                camera_device: camera_device.to_string(),
                frame_skip: session.frame_skip(),
                match_threshold: session.config().match_threshold,
                attendance_threshold: session.config().attendance_threshold,
                gallery: session.gallery().stats(),
                tracked: session.tracked(),
                stats: pipeline.stats(),
            });
        }
        MonitorCommand::Stop => {
            tracing::info!("stop requested");
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::memory::MemoryStore;
    use rollcall_core::{
        DetectionEvent, GalleryEntry, Identity, IdentityId, RecognitionConfig, Region, Signature,
    };
    use std::time::Duration;

    /// Endless camera that shows the same detections every frame.
    struct LoopCamera {
        detections: Vec<DetectionEvent>,
        fail: bool,
    }

    impl FrameSource for LoopCamera {
        type Frame = Vec<DetectionEvent>;
        type Error = String;

        fn acquire_frame(&mut self) -> Result<Self::Frame, Self::Error> {
            std::thread::sleep(Duration::from_millis(1));
            if self.fail {
                return Err("unplugged".into());
            }
            Ok(self.detections.clone())
        }
    }

    struct Passthrough;

    impl FaceEncoder<Vec<DetectionEvent>> for Passthrough {
        fn detect_and_encode(
            &mut self,
            frame: &Vec<DetectionEvent>,
        ) -> Result<Vec<DetectionEvent>, EncoderError> {
            Ok(frame.clone())
        }
    }

    fn entry(id: i64, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            identity: Identity {
                id: IdentityId(id),
                display_name: format!("student {id}"),
            },
            signature: Signature::new(values),
        }
    }

    fn launch(
        store: MemoryStore,
        camera: LoopCamera,
    ) -> (MonitorHandle, MonitorExit) {
        let gallery = Gallery::load(&store).unwrap();
        let session = Session::new(RecognitionConfig::default(), gallery);
        let pipeline = Pipeline::new(camera, Passthrough, session, AttendanceRecorder::new(store));
        start(pipeline, "/dev/test".into()).unwrap()
    }

    fn face(values: Vec<f32>) -> DetectionEvent {
        DetectionEvent {
            region: Region { x: 0, y: 0, width: 10, height: 10 },
            signature: Signature::new(values),
        }
    }

    #[tokio::test]
    async fn test_status_and_stop() {
        let store = MemoryStore::with_entries(vec![entry(1, vec![0.0, 0.0])]);
        let (handle, exit) = launch(
            store,
            LoopCamera {
                detections: vec![face(vec![0.0, 0.1])],
                fail: false,
            },
        );

        let status = handle.status().await.unwrap();
        assert_eq!(status.camera_device, "/dev/test");
        assert_eq!(status.frame_skip, 2);
        assert_eq!(status.gallery.identities, 1);

        handle.stop().await.unwrap();
        let stats = exit.await.unwrap().unwrap();
        // One identity, one face record per day.
        assert!(stats.records_written <= 1);
        assert!(handle.status().await.is_err());
    }

    #[tokio::test]
    async fn test_set_frame_skip_clamps_to_one() {
        let (handle, exit) = launch(
            MemoryStore::default(),
            LoopCamera {
                detections: Vec::new(),
                fail: false,
            },
        );
        assert_eq!(handle.set_frame_skip(5).await.unwrap(), 5);
        assert_eq!(handle.set_frame_skip(0).await.unwrap(), 1);
        assert_eq!(handle.status().await.unwrap().frame_skip, 1);
        handle.stop().await.unwrap();
        exit.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reload_reports_gallery_stats() {
        let store = MemoryStore::with_entries(vec![
            entry(1, vec![0.0, 0.0]),
            entry(1, vec![0.1, 0.0]),
            entry(2, vec![1.0, 1.0]),
        ]);
        let (handle, exit) = launch(
            store,
            LoopCamera {
                detections: Vec::new(),
                fail: false,
            },
        );
        let stats = handle.reload().await.unwrap();
        assert_eq!(stats.signatures, 3);
        assert_eq!(stats.identities, 2);
        handle.stop().await.unwrap();
        exit.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_camera_loss_ends_monitor() {
        let (handle, exit) = launch(
            MemoryStore::default(),
            LoopCamera {
                detections: Vec::new(),
                fail: true,
            },
        );
        let err = exit.await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::CameraUnavailable { failures: 3, .. }));
        assert!(matches!(handle.status().await, Err(MonitorError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_startup_fails_without_camera() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("attendance.db")).unwrap();
        let config = Config {
            camera_device: "/dev/rollcall-no-such-camera".into(),
            frame_width: 640,
            frame_height: 480,
            db_path: dir.path().join("attendance.db"),
            encoder_command: vec!["cat".into()],
            encoder_timeout: Duration::from_millis(100),
            warmup_frames: 4,
            max_camera_failures: 3,
            recognition: RecognitionConfig::default(),
        };
        let err = spawn_monitor(config, store).await.err();
        assert!(matches!(
            err,
            Some(MonitorError::Camera(CameraError::DeviceNotFound(_)))
        ));
    }
}
