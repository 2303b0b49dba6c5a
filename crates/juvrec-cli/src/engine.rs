use juvrec_core::detector::{DetectorError, FaceLocator};
use juvrec_core::encoder::{EmbeddingExtractor, ExtractError};
use juvrec_core::matcher::Matcher;
use juvrec_core::scan::{ScanError, ScanEvent, ScanFlow, Scanner};
use juvrec_core::source::FrameSource;
use juvrec_core::store::{EmbeddingStore, StoreError};
use juvrec_core::types::SessionContext;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("encoder error: {0}")]
    Extract(#[from] ExtractError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Caller-side control of a running scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    /// Answer to a pending duplicate warning.
    Confirm(bool),
    Stop,
}

/// Everything the engine thread owns.
pub struct Engine<S, L, E, M, D> {
    pub scanner: Scanner<S, L, E, M>,
    pub store: D,
}

enum EngineRequest {
    Scan {
        flow: ScanFlow,
        session: SessionContext,
        events: mpsc::Sender<ScanEvent>,
        controls: mpsc::UnboundedReceiver<ScanControl>,
        reply: oneshot::Sender<Result<Uuid, ScanError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

/// A scan in progress: progress events in, controls out.
///
/// Dropping the session stops the scan and releases the camera.
pub struct ScanSession {
    pub id: Uuid,
    events: mpsc::Receiver<ScanEvent>,
    controls: mpsc::UnboundedSender<ScanControl>,
}

impl ScanSession {
    /// Next progress event; `None` once the scan has ended.
    pub async fn next_event(&mut self) -> Option<ScanEvent> {
        self.events.recv().await
    }

    pub fn confirm(&self, proceed: bool) -> Result<(), EngineError> {
        self.controls
            .send(ScanControl::Confirm(proceed))
            .map_err(|_| EngineError::ChannelClosed)
    }

    pub fn stop(&self) {
        let _ = self.controls.send(ScanControl::Stop);
    }
}

impl EngineHandle {
    /// Open the camera and start a scan for `flow`.
    ///
    /// Fails with [`ScanError::CameraUnavailable`] when no camera can be
    /// opened; no ticks run in that case.
    pub async fn start_scan(&self, flow: ScanFlow, session: SessionContext) -> Result<ScanSession, EngineError> {
        let (events_tx, events_rx) = mpsc::channel(16);
        let (controls_tx, controls_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(EngineRequest::Scan {
                flow,
                session,
                events: events_tx,
                controls: controls_rx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;

        let id = reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;
        Ok(ScanSession {
            id,
            events: events_rx,
            controls: controls_tx,
        })
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// `build` runs on the engine thread and loads the models, store and
/// camera handle; its error is returned here so startup fails fast.
pub async fn spawn_engine<F, S, L, E, M, D>(build: F, tick: Duration) -> Result<EngineHandle, EngineError>
where
    F: FnOnce() -> Result<Engine<S, L, E, M, D>, EngineError> + Send + 'static,
    S: FrameSource + 'static,
    L: FaceLocator + 'static,
    E: EmbeddingExtractor + 'static,
    M: Matcher + 'static,
    D: EmbeddingStore + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), EngineError>>();

    std::thread::Builder::new()
        .name("juvrec-engine".into())
        .spawn(move || {
            let mut engine = match build() {
                Ok(engine) => engine,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Scan {
                        flow,
                        session,
                        events,
                        mut controls,
                        reply,
                    } => match engine.scanner.start_scan(flow, session) {
                        Ok(id) => {
                            let _ = reply.send(Ok(id));
                            run_session(&mut engine, &events, &mut controls, tick);
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    },
                }
            }
            engine.scanner.stop_scan();
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    ready_rx.await.map_err(|_| EngineError::ChannelClosed)??;
    Ok(EngineHandle { tx })
}

/// Tick the scanner until it finishes, is stopped, or the caller goes away.
fn run_session<S, L, E, M, D>(
    engine: &mut Engine<S, L, E, M, D>,
    events: &mpsc::Sender<ScanEvent>,
    controls: &mut mpsc::UnboundedReceiver<ScanControl>,
    tick: Duration,
) where
    S: FrameSource,
    L: FaceLocator,
    E: EmbeddingExtractor,
    M: Matcher,
    D: EmbeddingStore,
{
    let Engine { scanner, store } = engine;

    loop {
        let event = match controls.try_recv() {
            Ok(ScanControl::Stop) | Err(TryRecvError::Disconnected) => {
                scanner.stop_scan();
                return;
            }
            Ok(ScanControl::Confirm(proceed)) => match scanner.resolve_duplicate(proceed, store) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring confirmation");
                    None
                }
            },
            Err(TryRecvError::Empty) => scanner.tick(Instant::now(), store),
        };

        if let Some(event) = event {
            let finished = matches!(event, ScanEvent::Finished(_));
            if events.blocking_send(event).is_err() {
                tracing::debug!("scan caller went away");
                scanner.stop_scan();
                return;
            }
            if finished {
                return;
            }
        }

        if !scanner.is_scanning() {
            return;
        }
        std::thread::sleep(tick);
    }
}
