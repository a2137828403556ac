//! Confirmation deadlines for the protocol phases.
//!
//! Deadlines are stored as `expires_at` in the corresponding sub-payload at
//! phase start and evaluated by validator auto events against the caller's
//! clock.

use chrono::Duration;

pub fn signature_proposal_deadline() -> Duration {
    Duration::hours(24)
}

pub fn dkg_confirmation_deadline() -> Duration {
    Duration::hours(24)
}

pub fn signing_confirmation_deadline() -> Duration {
    Duration::hours(2)
}
