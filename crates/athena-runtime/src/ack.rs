//! Acknowledgment barrier for fan-out delivery.
//!
//! When one event is replicated to N consumers, the upstream token may only
//! fire after every replica has been acknowledged. [`AckBarrier::split`]
//! turns one upstream [`Ack`] into N member tokens sharing a countdown; the
//! member that brings the count to zero fires the upstream token.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use athena_types::Ack;

pub struct AckBarrier {
    remaining: AtomicUsize,
    upstream: Mutex<Option<Ack>>,
}

impl AckBarrier {
    /// Split `upstream` into `degree` member tokens.
    ///
    /// Degree 1 hands the upstream token through unchanged. Degree 0 fires
    /// it immediately since nothing will ever arrive.
    pub fn split(upstream: Ack, degree: usize) -> Vec<Ack> {
        match degree {
            0 => {
                upstream.fire();
                Vec::new()
            }
            1 => vec![upstream],
            n => {
                let barrier = Arc::new(AckBarrier {
                    remaining: AtomicUsize::new(n),
                    upstream: Mutex::new(Some(upstream)),
                });
                (0..n)
                    .map(|_| {
                        let barrier = barrier.clone();
                        Ack::new(move || barrier.arrive())
                    })
                    .collect()
            }
        }
    }

    fn arrive(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let upstream = self
                .upstream
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(ack) = upstream {
                ack.fire();
            }
        }
    }
}
