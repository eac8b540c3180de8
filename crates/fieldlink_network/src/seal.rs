//! Hook for the external signing/encryption collaborator.

use crate::error::NetworkError;
use crate::message::Envelope;

/// Signs/encrypts outbound envelopes and verifies/decrypts inbound ones.
///
/// `seal` runs on every envelope just before it is encoded for a link;
/// it may populate `signature`, `public_key`, `encrypted` and
/// `encrypted_payload`. `open` runs on every inbound envelope before the
/// age filter and must leave a plain payload behind. An `open` error drops
/// the message.
pub trait EnvelopeSealer: Send + Sync {
    fn seal(&self, envelope: &mut Envelope) -> Result<(), NetworkError>;

    fn open(&self, envelope: &mut Envelope) -> Result<(), NetworkError>;
}
