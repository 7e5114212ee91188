use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

use mnemo_types::SequenceKey;

/// Issues strictly increasing, timestamp-shaped sort keys.
///
/// Keys are microsecond UTC timestamps (`2024-05-01T12:00:00.000001Z`). Two keys
/// requested within the same microsecond, or after the wall clock stepped
/// backwards, are bumped forward so write order is always key order.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    last_micros: AtomicI64,
}

impl SequenceGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_key(&self) -> SequenceKey {
        self.next_key_at(Utc::now().timestamp_micros())
    }

    fn next_key_at(&self, now_micros: i64) -> SequenceKey {
        let mut prev = self.last_micros.load(Ordering::Relaxed);
        let issued = loop {
            let candidate = now_micros.max(prev.saturating_add(1));
            match self.last_micros.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break candidate,
                Err(actual) => prev = actual,
            }
        };
        SequenceKey::new(format_micros(issued))
    }
}

fn format_micros(micros: i64) -> String {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}
