//! Single-flight coordination: at most one operation in flight, every caller
//! that arrives meanwhile receives the same outcome.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::{IapError, Result};

/// Outcome delivered to one caller
#[derive(Debug, Clone)]
pub struct Flight<T> {
    pub value: T,
    /// Set for the caller that started the flight, and only for it
    pub first: bool,
}

struct FlightState<T> {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<T>>,
}

pub struct SingleFlight<T> {
    state: Arc<Mutex<FlightState<T>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(FlightState {
                in_flight: false,
                waiters: Vec::new(),
            })),
        }
    }
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `op` unless a flight is already running, in which case the caller
    /// joins it. The operation runs in its own task and always completes, even
    /// if every caller stops waiting.
    pub async fn run<F, Fut>(&self, op: F) -> Result<Flight<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut state = lock(&self.state);
            state.waiters.push(tx);
            if state.in_flight {
                false
            } else {
                state.in_flight = true;
                true
            }
        };

        if first {
            let state = self.state.clone();
            let fut = op();
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(fut).catch_unwind().await;
                let waiters = {
                    let mut state = lock(&state);
                    state.in_flight = false;
                    std::mem::take(&mut state.waiters)
                };

                match outcome {
                    Ok(value) => {
                        debug!(waiters = waiters.len(), "Flight resolved");
                        for waiter in waiters {
                            let _ = waiter.send(value.clone());
                        }
                    }
                    // Dropping the senders wakes every waiter with an error
                    Err(_) => error!(waiters = waiters.len(), "Flight panicked"),
                }
            });
        } else {
            debug!("Joined in-flight operation");
        }

        let value = rx
            .await
            .map_err(|_| IapError::unexpected("flight_aborted", "In-flight operation aborted"))?;
        Ok(Flight { value, first })
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.state).in_flight
    }
}

fn lock<T>(state: &Mutex<FlightState<T>>) -> MutexGuard<'_, FlightState<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
