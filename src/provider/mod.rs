//! Inbound casino-provider wallet protocol.

pub mod callback;
pub mod signature;

pub use callback::{CallbackAction, CallbackRequest, CallbackResponse, CallbackService};
pub use signature::{CallbackHeaders, SignatureError, SignatureVerifier};
