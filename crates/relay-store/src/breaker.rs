use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const FAILURE_THRESHOLD: usize = 5;
const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const OPEN_FOR: Duration = Duration::from_secs(60);
const HALF_OPEN_PROBES: u32 = 3;

#[derive(Debug)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen { probes_left: u32 },
}

#[derive(Debug)]
struct Inner {
    state: State,
    // Failure timestamps inside the rolling window.
    failures: VecDeque<Instant>,
}

/// Per-dependency circuit breaker: 5 failures in 60 s opens the circuit for
/// 60 s; half-open admits 3 probes before deciding.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Closed,
                failures: VecDeque::new(),
            }),
        }
    }

    /// Whether a call may proceed right now. Open circuits transition to
    /// half-open once their cool-down elapses.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            State::Closed => true,
            State::Open { until } => {
                if Instant::now() >= until {
                    inner.state = State::HalfOpen {
                        probes_left: HALF_OPEN_PROBES,
                    };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { probes_left } => {
                if probes_left > 0 {
                    inner.state = State::HalfOpen {
                        probes_left: probes_left - 1,
                    };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.failures.clear();
        if !matches!(inner.state, State::Closed) {
            tracing::info!("store circuit closed after successful probe");
        }
        inner.state = State::Closed;
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            State::HalfOpen { .. } => {
                // A failed probe re-opens immediately.
                inner.state = State::Open {
                    until: now + OPEN_FOR,
                };
                inner.failures.clear();
                tracing::warn!("store circuit re-opened by failed probe");
            }
            State::Open { .. } => {}
            State::Closed => {
                inner.failures.push_back(now);
                while let Some(front) = inner.failures.front() {
                    if now.duration_since(*front) > FAILURE_WINDOW {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() >= FAILURE_THRESHOLD {
                    inner.state = State::Open {
                        until: now + OPEN_FOR,
                    };
                    inner.failures.clear();
                    metrics::counter!("errors.total", "kind" => "store_unavailable").increment(1);
                    tracing::warn!("store circuit opened after repeated failures");
                }
            }
        }
    }
}
