//! Inbound gateway callbacks.

mod payload;
mod receiver;
mod signature;

pub use payload::{CheckoutSessionObject, GatewayEvent, WebhookEventKind};
pub use receiver::{WebhookOutcome, WebhookReceiver, WebhookSettings};
pub use signature::{
    DEFAULT_TOLERANCE_SECS, SIGNATURE_HEADER, SignatureError, sign_payload, signature_header,
    verify_signature,
};
