//! The unit of data flowing through a pipeline, and its acknowledgment token.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::value::{meta_from_json, meta_to_json, Message, Meta};
use crate::Result;

// ---------------------------------------------------------------------------
// Ack: move-only acknowledgment token
// ---------------------------------------------------------------------------

/// Acknowledgment callback riding alongside an [`Event`].
///
/// `fire` consumes the token, so a holder can acknowledge at most once.
/// Dropping a token without firing it leaves the upstream unacknowledged.
pub struct Ack {
    callback: Box<dyn FnOnce() + Send + 'static>,
}

impl Ack {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    /// Invoke the callback.
    pub fn fire(self) {
        (self.callback)()
    }

    /// Combine several tokens into one that fires all of them.
    pub fn all(acks: Vec<Ack>) -> Self {
        Ack::new(move || {
            for ack in acks {
                ack.fire();
            }
        })
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Ack")
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A record flowing between pipeline stages.
///
/// Cloning deep-copies `meta` and `message` and never copies the
/// acknowledgment token: a replica must be given its own token.
#[derive(Debug)]
pub struct Event {
    pub meta: Meta,
    pub message: Message,
    pub time: DateTime<Utc>,
    watermark: bool,
    ack: Option<Ack>,
}

impl Event {
    /// Build an event stamped with the current time.
    pub fn new(meta: Meta, message: impl Into<Message>) -> Self {
        Self::with_time(meta, message, Utc::now())
    }

    pub fn with_time(meta: Meta, message: impl Into<Message>, time: DateTime<Utc>) -> Self {
        Self {
            meta,
            message: message.into(),
            time,
            watermark: false,
            ack: None,
        }
    }

    /// Build an event from untyped JSON, validating meta shallowly and message
    /// recursively against the closed type set. `time` defaults to now.
    pub fn from_json(
        meta: serde_json::Value,
        message: serde_json::Value,
        time: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let meta = meta_from_json(meta)?;
        let message = Message::from_json("message", message)?;
        Ok(Self::with_time(meta, message, time.unwrap_or_else(Utc::now)))
    }

    /// The reserved flush signal used inside windowed operators.
    ///
    /// It has empty meta and an empty-marker message, but only events built
    /// here report [`is_watermark`](Event::is_watermark).
    pub fn watermark() -> Self {
        Self {
            meta: Meta::new(),
            message: Message::empty(),
            time: Utc::now(),
            watermark: true,
            ack: None,
        }
    }

    pub fn is_watermark(&self) -> bool {
        self.watermark
    }

    /// Attach an acknowledgment token, replacing any existing one.
    pub fn with_ack(mut self, ack: Ack) -> Self {
        self.ack = Some(ack);
        self
    }

    pub fn set_ack(&mut self, ack: Option<Ack>) {
        self.ack = ack;
    }

    pub fn take_ack(&mut self) -> Option<Ack> {
        self.ack.take()
    }

    pub fn has_ack(&self) -> bool {
        self.ack.is_some()
    }

    /// Fire the attached token, if any. Later calls are no-ops.
    pub fn ack(&mut self) {
        if let Some(ack) = self.ack.take() {
            ack.fire();
        }
    }

    /// Independent copy of the payload. Same as `clone`.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "meta": meta_to_json(&self.meta),
            "message": self.message.to_json(),
            "time": self.time.to_rfc3339(),
        })
    }
}

impl Clone for Event {
    fn clone(&self) -> Self {
        Self {
            meta: self.meta.clone(),
            message: self.message.clone(),
            time: self.time,
            watermark: self.watermark,
            ack: None,
        }
    }
}

impl PartialEq for Event {
    /// Payload equality; acknowledgment tokens are ignored.
    fn eq(&self, other: &Self) -> bool {
        self.meta == other.meta
            && self.message == other.message
            && self.time == other.time
            && self.watermark == other.watermark
    }
}
