use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use uuid::Uuid;

/// Pluggable timestamp source for change and commit records.
pub trait Clock: Send {
    /// RFC 3339 UTC timestamp with millisecond precision.
    fn now(&mut self) -> String;

    /// Position to persist so a reopened engine continues the sequence.
    fn snapshot_state(&self) -> Option<i64> {
        None
    }

    /// Rewind to a position taken with [`Clock::snapshot_state`].
    fn restore_state(&mut self, _ticks: i64) {}
}

/// Pluggable source of change, commit, change set and version ids.
pub trait IdGenerator: Send {
    fn next_id(&mut self) -> String;

    fn snapshot_state(&self) -> Option<u64> {
        None
    }

    fn restore_state(&mut self, _next: u64) {}
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&mut self) -> String {
        format_timestamp(Utc::now())
    }
}

/// Advances one millisecond per call from the Unix epoch.
#[derive(Clone, Debug, Default)]
pub struct DeterministicClock {
    ticks: i64,
}

impl DeterministicClock {
    pub fn resume(ticks: i64) -> Self {
        Self { ticks }
    }
}

impl Clock for DeterministicClock {
    fn now(&mut self) -> String {
        let at = Utc.timestamp_opt(0, 0).single().unwrap_or_default()
            + Duration::milliseconds(self.ticks);
        self.ticks += 1;
        format_timestamp(at)
    }

    fn snapshot_state(&self) -> Option<i64> {
        Some(self.ticks)
    }

    fn restore_state(&mut self, ticks: i64) {
        self.ticks = ticks;
    }
}

#[derive(Clone, Debug, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&mut self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Uuid-shaped ids from a counter: `00000000-0000-0000-0000-000000000001`, ...
#[derive(Clone, Debug, Default)]
pub struct SequentialIds {
    next: u64,
}

impl SequentialIds {
    pub fn resume(next: u64) -> Self {
        Self { next }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&mut self) -> String {
        self.next += 1;
        Uuid::from_u128(u128::from(self.next)).to_string()
    }

    fn snapshot_state(&self) -> Option<u64> {
        Some(self.next)
    }

    fn restore_state(&mut self, next: u64) {
        self.next = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_clock_resumes() {
        let mut clock = DeterministicClock::default();
        assert_eq!(clock.now(), "1970-01-01T00:00:00.000Z");
        assert_eq!(clock.now(), "1970-01-01T00:00:00.001Z");
        let mut resumed = DeterministicClock::resume(clock.snapshot_state().unwrap());
        assert_eq!(resumed.now(), "1970-01-01T00:00:00.002Z");
    }

    #[test]
    fn sequential_ids_are_uuid_shaped() {
        let mut ids = SequentialIds::default();
        assert_eq!(ids.next_id(), "00000000-0000-0000-0000-000000000001");
        let mut resumed = SequentialIds::resume(ids.snapshot_state().unwrap());
        assert_eq!(resumed.next_id(), "00000000-0000-0000-0000-000000000002");
        assert_ne!(UuidGenerator.next_id(), UuidGenerator.next_id());
    }

    #[test]
    fn positions_can_be_rewound() {
        let mut ids = SequentialIds::default();
        let mut clock = DeterministicClock::default();
        let (saved_ids, saved_ticks) = (ids.snapshot_state().unwrap(), clock.snapshot_state().unwrap());
        let first = (ids.next_id(), clock.now());
        ids.restore_state(saved_ids);
        clock.restore_state(saved_ticks);
        assert_eq!((ids.next_id(), clock.now()), first);
    }
}
