//! Reporting of panics caught from handlers and spawned tasks.

use std::{any::Any, borrow::Cow};

use crate::metrics;

/// Extract the text of a panic payload.
///
/// `panic!` payloads are a `String` or a `&'static str`; anything else is
/// rendered as an opaque placeholder.
///
/// ```
/// use gatelink::panic::panic_message;
///
/// let payload: Box<dyn std::any::Any + Send> = Box::new("handler blew up");
/// assert_eq!(panic_message(payload.as_ref()), "handler blew up");
/// let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
/// assert_eq!(panic_message(payload.as_ref()), "<non-string panic payload>");
/// ```
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> Cow<'_, str> {
    if let Some(s) = payload.downcast_ref::<String>() {
        Cow::Borrowed(s)
    } else if let Some(s) = payload.downcast_ref::<&'static str>() {
        Cow::Borrowed(s)
    } else {
        Cow::Borrowed("<non-string panic payload>")
    }
}

/// Record a caught panic and return its message.
///
/// Emits one `tracing` error event (also forwarded to `log`) named `event`
/// with `context` identifying the unit that panicked, and counts the error.
pub fn report_panic(event: &'static str, context: &str, payload: &(dyn Any + Send)) -> String {
    let message = panic_message(payload).into_owned();
    metrics::inc_errors();
    tracing::error!(panic = %message, context, "{event}");
    message
}
