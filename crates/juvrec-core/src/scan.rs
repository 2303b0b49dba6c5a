//! Scan orchestration: camera → locator → centering gate → encoder → matcher.
//!
//! [`Scanner`] is driven by the caller's periodic tick. Each tick reads one
//! frame, locates faces and feeds the first one to the centering gate. When
//! the gate fires, a fresh frame is encoded and resolved against the stored
//! gallery according to the active [`ScanFlow`].

use crate::centering::{CenteringGate, GateSignal, DEFAULT_HOLD, DEFAULT_TOLERANCE};
use crate::codec::{self, CodecError};
use crate::detector::FaceLocator;
use crate::encoder::{EmbeddingExtractor, ExtractError};
use crate::frame::{Frame, FrameError};
use crate::matcher::{EuclideanMatcher, MatchIntent, MatchResult, Matcher};
use crate::source::{CameraError, FrameSource};
use crate::store::{load_gallery, EmbeddingStore, EnrollmentRecord, StoreError};
use crate::types::{Embedding, IdentityId, SessionContext};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(#[from] CameraError),
    #[error("a scan is already running")]
    AlreadyScanning,
    #[error("no duplicate confirmation is pending")]
    NotAwaitingConfirmation,
}

/// Why a scan ended without a result.
#[derive(Error, Debug)]
pub enum ScanFailure {
    #[error("persistence: {0}")]
    Persistence(#[from] StoreError),
    #[error("image encoding: {0}")]
    ImageEncoding(#[from] FrameError),
    #[error("embedding encoding: {0}")]
    EmbeddingEncoding(#[from] CodecError),
    #[error("extraction: {0}")]
    Extraction(#[from] ExtractError),
}

/// What the scan is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFlow {
    /// Capture a new enrollee's face and store it under `identity`.
    Enroll { identity: IdentityId },
    /// Decide whether the subject is already enrolled.
    Recognize,
}

/// Terminal result of one scan session.
#[derive(Debug)]
pub enum ScanOutcome {
    /// Enrollment stored; `image` is the JPEG written with the embedding.
    Captured { image: Vec<u8>, embedding: Embedding },
    /// Returning subject: add the offense to this identity.
    MatchFound { identity: IdentityId, distance: f32 },
    /// Unknown subject: route to a new enrollment.
    NoMatch { best_distance: Option<f32> },
    Failed(ScanFailure),
}

impl ScanOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ScanOutcome::Captured { .. } => "captured",
            ScanOutcome::MatchFound { .. } => "match_found",
            ScanOutcome::NoMatch { .. } => "no_match",
            ScanOutcome::Failed(_) => "failed",
        }
    }
}

/// Why the gate was re-armed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
    NoFaceFound,
    DuplicateRejected,
}

/// Progress reported to the caller, one per tick at most.
#[derive(Debug)]
pub enum ScanEvent {
    FaceCentered { remaining: u32 },
    Countdown { remaining: u32 },
    FaceLost,
    Retry(RetryReason),
    /// Enrollment found a close existing face; call
    /// [`Scanner::resolve_duplicate`] to continue.
    DuplicateSuspected { identity: IdentityId, distance: f32 },
    Finished(ScanOutcome),
}

#[derive(Debug, Clone, Copy)]
pub struct ScannerConfig {
    pub enroll_hold: Duration,
    pub recognize_hold: Duration,
    pub center_tolerance: f32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enroll_hold: DEFAULT_HOLD,
            recognize_hold: DEFAULT_HOLD,
            center_tolerance: DEFAULT_TOLERANCE,
        }
    }
}

enum Phase {
    Idle,
    Scanning,
    AwaitingConfirmation { frame: Frame, embedding: Embedding },
}

struct ActiveScan {
    id: Uuid,
    flow: ScanFlow,
    session: SessionContext,
}

pub struct Scanner<S, L, E, M = EuclideanMatcher> {
    source: S,
    locator: L,
    extractor: E,
    matcher: M,
    config: ScannerConfig,
    gate: CenteringGate,
    phase: Phase,
    active: Option<ActiveScan>,
}

impl<S, L, E, M> Scanner<S, L, E, M>
where
    S: FrameSource,
    L: FaceLocator,
    E: EmbeddingExtractor,
    M: Matcher,
{
    pub fn new(source: S, locator: L, extractor: E, matcher: M, config: ScannerConfig) -> Self {
        Self {
            source,
            locator,
            extractor,
            matcher,
            gate: CenteringGate::new(config.enroll_hold, config.center_tolerance),
            config,
            phase: Phase::Idle,
            active: None,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn is_scanning(&self) -> bool {
        !matches!(self.phase, Phase::Idle)
    }

    pub fn is_awaiting_confirmation(&self) -> bool {
        matches!(self.phase, Phase::AwaitingConfirmation { .. })
    }

    /// Open the camera and arm the gate for `flow`.
    pub fn start_scan(&mut self, flow: ScanFlow, session: SessionContext) -> Result<Uuid, ScanError> {
        if self.is_scanning() {
            return Err(ScanError::AlreadyScanning);
        }

        let hold = match flow {
            ScanFlow::Enroll { .. } => self.config.enroll_hold,
            ScanFlow::Recognize => self.config.recognize_hold,
        };

        if let Err(e) = self.source.open() {
            tracing::error!(error = %e, ?flow, "scan aborted: camera unavailable");
            return Err(ScanError::CameraUnavailable(e));
        }

        let id = Uuid::new_v4();
        tracing::info!(
            scan = %id,
            ?flow,
            operator = %session.operator,
            hold_ms = hold.as_millis() as u64,
            "scan started"
        );

        self.gate = CenteringGate::new(hold, self.config.center_tolerance);
        self.phase = Phase::Scanning;
        self.active = Some(ActiveScan { id, flow, session });
        Ok(id)
    }

    /// Release the camera and forget the current scan. Safe to call at any time.
    pub fn stop_scan(&mut self) {
        self.source.close();
        self.gate.rearm();
        self.phase = Phase::Idle;
        if let Some(active) = self.active.take() {
            tracing::info!(scan = %active.id, "scan stopped");
        }
    }

    /// Advance the scan by one frame.
    pub fn tick<D>(&mut self, now: Instant, store: &mut D) -> Option<ScanEvent>
    where
        D: EmbeddingStore + ?Sized,
    {
        if !matches!(self.phase, Phase::Scanning) {
            return None;
        }

        let frame = match self.source.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "frame read failed; skipping tick");
                return None;
            }
        };

        let faces = match self.locator.locate(&frame) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::debug!(error = %e, "face location failed; skipping tick");
                return None;
            }
        };

        match self.gate.observe(now, faces.first(), frame.width, frame.height) {
            GateSignal::Idle => None,
            GateSignal::Started { remaining } => Some(ScanEvent::FaceCentered { remaining }),
            GateSignal::Countdown { remaining } => Some(ScanEvent::Countdown { remaining }),
            GateSignal::Cancelled => Some(ScanEvent::FaceLost),
            GateSignal::Capture => Some(self.capture(frame, store)),
        }
    }

    /// Answer a [`ScanEvent::DuplicateSuspected`]: `proceed` stores the
    /// enrollment anyway, otherwise scanning resumes.
    pub fn resolve_duplicate<D>(&mut self, proceed: bool, store: &mut D) -> Result<ScanEvent, ScanError>
    where
        D: EmbeddingStore + ?Sized,
    {
        let phase = std::mem::replace(&mut self.phase, Phase::Scanning);
        let Phase::AwaitingConfirmation { frame, embedding } = phase else {
            self.phase = phase;
            return Err(ScanError::NotAwaitingConfirmation);
        };

        if proceed {
            tracing::info!("duplicate confirmed by operator; enrolling anyway");
            Ok(self.commit(&frame, embedding, store))
        } else {
            tracing::info!("duplicate rejected; resuming scan");
            self.gate.rearm();
            Ok(ScanEvent::Retry(RetryReason::DuplicateRejected))
        }
    }

    fn capture<D>(&mut self, tick_frame: Frame, store: &mut D) -> ScanEvent
    where
        D: EmbeddingStore + ?Sized,
    {
        let frame = match self.source.read_frame() {
            Ok(fresh) => fresh,
            Err(e) => {
                tracing::debug!(error = %e, "fresh capture read failed; using tick frame");
                tick_frame
            }
        };

        let embedding = match self.extractor.extract(&frame) {
            Ok(embedding) => embedding,
            Err(ExtractError::NoFaceFound) => {
                tracing::info!("no face in captured frame; re-arming gate");
                self.gate.rearm();
                return ScanEvent::Retry(RetryReason::NoFaceFound);
            }
            Err(e) => {
                tracing::error!(error = %e, "extraction failed");
                return self.finish(ScanOutcome::Failed(e.into()));
            }
        };

        let flow = match &self.active {
            Some(active) => active.flow.clone(),
            None => ScanFlow::Recognize,
        };

        match flow {
            ScanFlow::Enroll { .. } => self.check_duplicate(frame, embedding, store),
            ScanFlow::Recognize => self.recognize(&embedding, store),
        }
    }

    fn check_duplicate<D>(&mut self, frame: Frame, embedding: Embedding, store: &mut D) -> ScanEvent
    where
        D: EmbeddingStore + ?Sized,
    {
        let gallery = match load_gallery(store) {
            Ok(gallery) => gallery,
            Err(e) => return self.finish(ScanOutcome::Failed(e.into())),
        };

        match self.matcher.compare(MatchIntent::DuplicateCheck, &embedding, &gallery) {
            MatchResult::Matched { identity, distance } => {
                tracing::warn!(%identity, distance, "face resembles an enrolled identity");
                self.phase = Phase::AwaitingConfirmation { frame, embedding };
                ScanEvent::DuplicateSuspected { identity, distance }
            }
            _ => self.commit(&frame, embedding, store),
        }
    }

    fn recognize<D>(&mut self, embedding: &Embedding, store: &mut D) -> ScanEvent
    where
        D: EmbeddingStore + ?Sized,
    {
        // The decision is made; free the device before resolving it.
        self.source.close();

        let gallery = match load_gallery(store) {
            Ok(gallery) => gallery,
            Err(e) => return self.finish(ScanOutcome::Failed(e.into())),
        };

        let outcome = match self.matcher.compare(MatchIntent::Identify, embedding, &gallery) {
            MatchResult::Matched { identity, distance } => ScanOutcome::MatchFound { identity, distance },
            MatchResult::NoMatch { best_distance } => ScanOutcome::NoMatch {
                best_distance: Some(best_distance),
            },
            MatchResult::EmptyGallery => ScanOutcome::NoMatch { best_distance: None },
        };
        self.finish(outcome)
    }

    fn commit<D>(&mut self, frame: &Frame, embedding: Embedding, store: &mut D) -> ScanEvent
    where
        D: EmbeddingStore + ?Sized,
    {
        let (identity, operator) = match &self.active {
            Some(ActiveScan {
                flow: ScanFlow::Enroll { identity },
                session,
                ..
            }) => (identity.clone(), session.operator.clone()),
            _ => return self.finish(ScanOutcome::NoMatch { best_distance: None }),
        };

        let image = match frame.encode_jpeg() {
            Ok(image) => image,
            Err(e) => return self.finish(ScanOutcome::Failed(e.into())),
        };
        let text = match codec::encode(&embedding) {
            Ok(text) => text,
            Err(e) => return self.finish(ScanOutcome::Failed(e.into())),
        };

        let record = EnrollmentRecord {
            identity,
            image,
            embedding: text,
            enrolled_by: operator,
        };

        if let Err(e) = store.store_embedding(&record) {
            tracing::error!(identity = %record.identity, error = %e, "failed to store enrollment");
            return self.finish(ScanOutcome::Failed(e.into()));
        }

        tracing::info!(identity = %record.identity, bytes = record.image.len(), "enrollment stored");
        self.finish(ScanOutcome::Captured {
            image: record.image,
            embedding,
        })
    }

    fn finish(&mut self, outcome: ScanOutcome) -> ScanEvent {
        if let Some(active) = &self.active {
            tracing::info!(scan = %active.id, outcome = outcome.label(), "scan finished");
        }
        self.stop_scan();
        ScanEvent::Finished(outcome)
    }
}
