//! Round Audit System
//!
//! Makes settled rounds checkable after the fact through:
//! - Per-round commit-reveal of the operator's dice secret
//! - Round transcript recording
//! - Verification by replay
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    AUDIT SYSTEM                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  commitment.rs   - Per-round commit-reveal protocol         │
//! │  transcript.rs   - Settled round records (bincode)          │
//! │  verify.rs       - Verification by replay                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod commitment;
pub mod transcript;
pub mod verify;

// Re-export key types
pub use commitment::{CommitmentError, RoundCommitment, SeedReveal};
pub use transcript::{RoundTranscript, TranscriptError, TRANSCRIPT_VERSION};
pub use verify::{verify_transcript, VerificationError, VerificationResult};
