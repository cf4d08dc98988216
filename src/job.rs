//! Polling of asynchronous cloud jobs.
//!
//! Buffer reads and writes are both submitted as jobs that answer with an
//! `idRequest`; the caller then polls `/deviceJobStatus/<id>` until the job
//! leaves the `waiting` state. Reads back off linearly under a wall clock
//! budget, writes poll at a fixed interval under an attempt budget.

use crate::{Error, Result};
use log::{debug, warn};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const STATUS_WAITING: &str = "waiting";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_TERMINATED: &str = "terminated";
/// Key a completed write answer carries.
pub const ANSWER_COMMAND: &str = "Cmd";

/// Body of `/deviceJobStatus/<id>`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobAnswer {
    #[serde(rename = "jobAnswerStatus", default)]
    pub status: String,
    #[serde(rename = "jobAnswerData", default)]
    pub data: serde_json::Value,
}

impl JobAnswer {
    pub fn is_waiting(&self) -> bool {
        self.status == STATUS_WAITING
    }

    pub fn is_completed(&self) -> bool {
        self.status == STATUS_COMPLETED
    }

    pub fn has_command(&self) -> bool {
        self.data.get(ANSWER_COMMAND).is_some()
    }
}

/// Budget of a buffer read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPolicy {
    /// Upper bound for the whole poll sequence.
    pub timeout: Duration,
    /// Pause before the first status request.
    pub initial_interval: Duration,
    /// Added to the pause after every `waiting` answer.
    pub interval_step: Duration,
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            initial_interval: Duration::from_secs(1),
            interval_step: Duration::from_secs(1),
        }
    }
}

/// Budget of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePolicy {
    /// Status requests in total, the first one is sent immediately.
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(1),
        }
    }
}

/// Polls a buffer read job until it leaves the `waiting` state.
///
/// `job` names the job in logs and errors, e.g. its status URL. `fetch` requests the job status once. Errors from `fetch` end the poll.
/// A `terminated` job is a [`Error::Protocol`], running out of
/// `policy.timeout` is an [`Error::Timeout`].
pub async fn poll_read<F, Fut>(
    job: &str,
    policy: &ReadPolicy,
    cancel: &CancellationToken,
    mut fetch: F,
) -> Result<JobAnswer>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<JobAnswer>>,
{
    let answer = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(Error::Cancelled(format!("buffer read {job}")));
        }
        answer = tokio::time::timeout(policy.timeout, read_loop(job, policy, &mut fetch)) => {
            answer.map_err(|_| {
                Error::Timeout(format!(
                    "buffer read {job} did not complete within {} seconds",
                    policy.timeout.as_secs_f64()
                ))
            })??
        }
    };

    if answer.status == STATUS_TERMINATED {
        return Err(Error::Protocol(format!(
            "buffer read {job}: cloud terminated the request"
        )));
    }
    Ok(answer)
}

/// Polls a write job until it completes.
///
/// Protocol failures of single status requests are retried within the attempt
/// budget, every other error ends the poll. Completion requires a
/// [`ANSWER_COMMAND`] entry in the answer.
pub async fn poll_write<F, Fut>(
    job: &str,
    policy: &WritePolicy,
    cancel: &CancellationToken,
    mut fetch: F,
) -> Result<JobAnswer>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<JobAnswer>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled(format!("write {job}"))),
        answer = write_loop(job, policy, &mut fetch) => answer,
    }
}

async fn read_loop<F, Fut>(
    job: &str,
    policy: &ReadPolicy,
    fetch: &mut F,
) -> Result<JobAnswer>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<JobAnswer>>,
{
    let mut interval = policy.initial_interval;
    let mut attempt = 1u32;
    loop {
        tokio::time::sleep(interval).await;
        debug!("Buffer read ({job}) attempt {attempt}");
        let answer = fetch().await?;
        debug!("Buffer read ({job}) status: {}", answer.status);
        if !answer.is_waiting() {
            return Ok(answer);
        }
        interval += policy.interval_step;
        attempt += 1;
    }
}

async fn write_loop<F, Fut>(
    job: &str,
    policy: &WritePolicy,
    fetch: &mut F,
) -> Result<JobAnswer>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<JobAnswer>>,
{
    for attempt in 1..=policy.attempts {
        if attempt > 1 {
            tokio::time::sleep(policy.interval).await;
        }
        debug!("Write ({job}) attempt {attempt}");
        match fetch().await {
            Ok(answer) if answer.is_completed() => {
                if answer.has_command() {
                    return Ok(answer);
                }
                return Err(Error::Protocol(format!(
                    "write {job} completed without '{ANSWER_COMMAND}'"
                )));
            }
            Ok(answer) if answer.status == STATUS_TERMINATED => {
                return Err(Error::Protocol(format!(
                    "write {job}: cloud terminated the request"
                )));
            }
            Ok(answer) => debug!("Write ({job}) status: {}", answer.status),
            Err(Error::Protocol(msg)) => warn!("Write ({job}) status failed: {msg}"),
            Err(err) => return Err(err),
        }
    }
    Err(Error::Protocol(format!(
        "write {job} not completed after {} attempts",
        policy.attempts
    )))
}
