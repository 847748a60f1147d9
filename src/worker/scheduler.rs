//! Delay scheduler — one-shot timers that feed the intake channel.
//!
//! Each `schedule` call spawns its own timer task. The timer sleeps for the
//! requested delay and then submits through the same path as `enqueue`.
//! Timers are not pooled and cannot be cancelled, but a timer still sleeping
//! when the queue stops is released right away.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{InvalidDurationError, QueueError};
use crate::id::TaskId;
use crate::worker::queue::Intake;
use crate::worker::task::Task;

/// Nanoseconds per unit suffix accepted by [`parse_duration`].
const UNITS: &[(&str, u128)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("\u{b5}s", 1_000),
    ("\u{3bc}s", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60 * 1_000_000_000),
    ("h", 3_600 * 1_000_000_000),
];

/// Parse a duration string such as `"300ms"`, `"1.5h"` or `"2h45m"`.
///
/// A bare `"0"` is accepted. Every other number needs a unit. Negative
/// durations and values that overflow `u64` nanoseconds are rejected.
pub fn parse_duration(input: &str) -> Result<Duration, InvalidDurationError> {
    let mut rest = input.trim();
    if rest.is_empty() {
        return Err(InvalidDurationError::new(input, "empty duration"));
    }

    if let Some(stripped) = rest.strip_prefix('-') {
        if stripped.trim_start_matches(['0', '.']).chars().all(|c| !c.is_ascii_digit()) {
            // "-0s" is still zero
            rest = stripped;
        } else {
            return Err(InvalidDurationError::new(input, "negative durations are not allowed"));
        }
    } else if let Some(stripped) = rest.strip_prefix('+') {
        rest = stripped;
    }

    if rest.is_empty() {
        return Err(InvalidDurationError::new(input, "expected a number"));
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let (whole, after) = rest.split_at(digits_end);

        let (fraction, after) = match after.strip_prefix('.') {
            Some(tail) => {
                let end = tail.find(|c: char| !c.is_ascii_digit()).unwrap_or(tail.len());
                tail.split_at(end)
            }
            None => ("", after),
        };

        if whole.is_empty() && fraction.is_empty() {
            return Err(InvalidDurationError::new(input, "expected a number"));
        }

        let unit_end = after
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after.len());
        let (unit, tail) = after.split_at(unit_end);
        if unit.is_empty() {
            return Err(InvalidDurationError::new(input, "missing unit"));
        }
        let scale = UNITS
            .iter()
            .find(|(suffix, _)| *suffix == unit)
            .map(|(_, scale)| *scale)
            .ok_or_else(|| InvalidDurationError::new(input, format!("unknown unit '{unit}'")))?;

        let overflow = || InvalidDurationError::new(input, "duration out of range");

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| overflow())?
        };
        let mut nanos = whole.checked_mul(scale).ok_or_else(overflow)?;

        // Fractional digits beyond nanosecond precision are truncated.
        let mut place = scale;
        for digit in fraction.bytes() {
            place /= 10;
            if place == 0 {
                break;
            }
            nanos += u128::from(digit - b'0') * place;
        }

        total = total.checked_add(nanos).ok_or_else(overflow)?;
        if total > u128::from(u64::MAX) {
            return Err(overflow());
        }
        rest = tail;
    }

    Ok(Duration::from_nanos(total as u64))
}

/// Returned by `schedule` once the timer is armed.
#[derive(Debug)]
pub struct ScheduledHandle {
    task_id: TaskId,
    delay: Duration,
    fire_at: DateTime<Utc>,
    fired: oneshot::Receiver<Result<(), QueueError>>,
}

impl ScheduledHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wall-clock time the timer is due to fire.
    pub fn fire_at(&self) -> DateTime<Utc> {
        self.fire_at
    }

    /// Wait until the timer has fired and the dispatcher accepted the task.
    ///
    /// Resolves to [`QueueError::Stopped`] when the queue was stopped first.
    pub async fn fired(self) -> Result<(), QueueError> {
        self.fired.await.unwrap_or(Err(QueueError::Stopped))
    }
}

/// Arm a one-shot timer that submits `task` after `delay`.
pub(crate) fn arm(
    intake: Intake,
    task: Task,
    task_id: TaskId,
    delay: Duration,
    fire_at: DateTime<Utc>,
) -> ScheduledHandle {
    let (fired_tx, fired_rx) = oneshot::channel();

    tokio::spawn({
        let task_id = task_id.clone();
        async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = intake.closed() => {
                        warn!(task_id = %task_id, "Queue stopped before timer fired; dropping scheduled task");
                        let _ = fired_tx.send(Err(QueueError::Stopped));
                        return;
                    }
                }
            }
            debug!(task_id = %task_id, ?delay, "Timer fired, submitting task");

            let result = intake.submit(task).await;
            if let Err(ref e) = result {
                warn!(task_id = %task_id, error = %e, "Dropping scheduled task");
            }
            let _ = fired_tx.send(result);
        }
    });

    ScheduledHandle {
        task_id,
        delay,
        fire_at,
        fired: fired_rx,
    }
}
