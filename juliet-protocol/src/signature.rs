//! Message signing hooks.
//!
//! Radio content is neither authenticated nor encrypted. [`Signer`] marks
//! where a signature scheme plugs in; [`NullSigner`] is the only
//! implementation shipped.

use crate::message::Message;

/// Produces and checks message signatures.
pub trait Signer: Send + Sync {
    /// Returns the signature for `message`, or `None` to leave it unsigned.
    fn sign(&self, message: &Message) -> Option<String>;

    /// Returns true if the signature carried by `message` is acceptable.
    fn verify(&self, message: &Message) -> bool;
}

/// Leaves messages unsigned and accepts every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSigner;

impl Signer for NullSigner {
    fn sign(&self, _message: &Message) -> Option<String> {
        None
    }

    fn verify(&self, _message: &Message) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSigner(&'static str);

    impl Signer for FixedSigner {
        fn sign(&self, _message: &Message) -> Option<String> {
            Some(self.0.to_string())
        }

        fn verify(&self, message: &Message) -> bool {
            message.signature() == Some(self.0)
        }
    }

    #[test]
    fn test_null_signer() {
        let msg = Message::text("hi").sign_with(&NullSigner);
        assert_eq!(msg.signature(), None);
        assert!(NullSigner.verify(&msg));
    }

    #[test]
    fn test_custom_signer_hook() {
        let signer = FixedSigner("abc");
        let msg = Message::text("hi").sign_with(&signer);
        assert_eq!(msg.signature(), Some("abc"));
        assert!(signer.verify(&msg));
        assert!(!signer.verify(&Message::text("hi")));
    }
}
