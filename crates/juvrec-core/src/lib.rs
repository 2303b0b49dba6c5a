//! juvrec-core: face identity resolution for juvenile intake.
//!
//! Locates faces with SCRFD, encodes them to 128-d embeddings via ONNX
//! Runtime, gates capture on a centered face held steady, and resolves the
//! embedding against the enrolled gallery by Euclidean distance.
//!
//! Cameras and storage are collaborators behind [`FrameSource`] and
//! [`EmbeddingStore`]; [`Scanner`] ties everything together.

pub mod alignment;
pub mod centering;
pub mod codec;
pub mod detector;
pub mod encoder;
pub mod frame;
pub mod matcher;
pub mod scan;
pub mod source;
pub mod store;
pub mod types;

pub use centering::{CenteringGate, CenteringState, GateSignal};
pub use detector::{FaceDetector, FaceLocator, LocatorConfig};
pub use encoder::{EmbeddingExtractor, FaceEncoder};
pub use frame::{Frame, PixelOrder};
pub use matcher::{EuclideanMatcher, MatchIntent, MatchResult, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use scan::{RetryReason, ScanError, ScanEvent, ScanFlow, ScanOutcome, Scanner, ScannerConfig};
pub use source::{CameraError, FrameSource};
pub use store::{load_gallery, EmbeddingStore, EnrollmentRecord, StoreError};
pub use types::{Embedding, FaceBox, IdentityId, SessionContext, EMBEDDING_DIM};
