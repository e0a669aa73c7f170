//! Background execution context for privileged work.
//!
//! `BackgroundServices` owns a named worker thread that runs jobs (tether
//! forwarding rules, boot-time or package-change reconciliation) in
//! submission order, off whatever context asked for them.

use std::sync::mpsc;

use crate::error::AppError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the policy worker thread. The thread exits once this is dropped
/// and the queue has drained.
pub struct BackgroundServices {
    sender: mpsc::Sender<Job>,
}

impl BackgroundServices {
    pub fn start() -> Result<Self, AppError> {
        let (sender, receiver) = mpsc::channel::<Job>();
        std::thread::Builder::new()
            .name("policy-worker".into())
            .spawn(move || {
                for job in receiver {
                    job();
                }
                tracing::debug!("Policy worker stopped");
            })?;
        Ok(Self { sender })
    }

    /// Queue `job`; its outcome arrives on the returned receiver.
    ///
    /// If the worker is gone the job is dropped and the receiver reports a
    /// disconnect.
    pub fn submit<T, F>(&self, job: F) -> mpsc::Receiver<Result<T, AppError>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, AppError> + Send + 'static,
    {
        let (reply, outcome) = mpsc::channel();
        let job: Job = Box::new(move || {
            let _ = reply.send(job());
        });
        if self.sender.send(job).is_err() {
            tracing::warn!("Policy worker is not running; job dropped");
        }
        outcome
    }
}

/// Block until a submitted job reports back.
pub fn wait<T>(outcome: mpsc::Receiver<Result<T, AppError>>) -> Result<T, AppError> {
    outcome
        .recv()
        .map_err(|_| AppError::Io("policy worker stopped before finishing the job".into()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_run_in_submission_order_on_worker_thread() {
        let services = BackgroundServices::start().unwrap();
        let first = services.submit(|| Ok(std::thread::current().name().map(str::to_string)));
        let second = services.submit(|| Ok::<_, AppError>(2));

        assert_eq!(wait(first).unwrap().as_deref(), Some("policy-worker"));
        assert_eq!(wait(second).unwrap(), 2);
    }

    #[test]
    fn test_job_error_is_returned_to_caller() {
        let services = BackgroundServices::start().unwrap();
        let outcome = services.submit(|| Err::<(), _>(AppError::InvalidInput("nope".into())));
        assert_eq!(wait(outcome).unwrap_err().kind(), "InvalidInput");
    }

    #[test]
    fn test_panicking_job_reports_disconnect() {
        let services = BackgroundServices::start().unwrap();
        let outcome = services.submit(|| -> Result<(), AppError> { panic!("boom") });
        assert_eq!(wait(outcome).unwrap_err().kind(), "Io");
    }
}
