//! A test tool that counts down a number of ticks.
//!
//! Parameters: `seconds` (number of ticks) and `result` (`Success`,
//! `Failure` or `Panic!`). `Panic!` panics inside `run`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Task, TaskError, Tooler, HARDWARE_CPU, HARDWARE_GPU};
use crate::scheduler::job::{Job, JobStatus};

const SCHEMA: &str = r#"{"form":["seconds","result"],"schema":{"type":"object","properties":{"seconds":{"title":"Seconds","type":"string","default":"60"},"result":{"title":"Result","type":"string","enum":["Success","Failure","Panic!"],"default":"Success"}},"required":["seconds","result"]}}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Panic,
}

pub struct TimerTool {
    id: Uuid,
    requirement: &'static str,
    version: &'static str,
    tick: Duration,
}

impl TimerTool {
    pub fn cpu(tick: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            requirement: HARDWARE_CPU,
            version: "CPU",
            tick,
        }
    }

    pub fn gpu(tick: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            requirement: HARDWARE_GPU,
            version: "GPU",
            tick,
        }
    }
}

impl Tooler for TimerTool {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        "Timer Test Plugin"
    }

    fn kind(&self) -> &str {
        "Test"
    }

    fn version(&self) -> &str {
        self.version
    }

    fn requirement(&self) -> &str {
        self.requirement
    }

    fn parameters(&self) -> String {
        SCHEMA.to_string()
    }

    fn new_task(&self, mut job: Job) -> Result<Box<dyn Task>, TaskError> {
        let seconds = job
            .parameters
            .get("seconds")
            .ok_or_else(|| TaskError::InvalidParameter {
                name: "seconds".into(),
                reason: "missing".into(),
            })?
            .parse::<i64>()
            .map_err(|e| TaskError::InvalidParameter {
                name: "seconds".into(),
                reason: e.to_string(),
            })?;

        let outcome = match job.parameters.get("result").map(String::as_str) {
            Some("Success") => Outcome::Success,
            Some("Panic!") => Outcome::Panic,
            _ => Outcome::Failure,
        };

        job.status = JobStatus::Created;
        job.cracked_count = 0;
        job.total_count = seconds.max(0);
        job.performance_title = "Time data".to_string();

        Ok(Box::new(TimerTask {
            state: Arc::new(Mutex::new(job)),
            outcome,
            tick: self.tick,
            stop: None,
        }))
    }
}

struct TimerTask {
    state: Arc<Mutex<Job>>,
    outcome: Outcome,
    tick: Duration,
    /// Cancels the counting loop of the current run.
    stop: Option<CancellationToken>,
}

fn lock(state: &Mutex<Job>) -> MutexGuard<'_, Job> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TimerTask {
    fn halt(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
    }
}

impl Task for TimerTask {
    fn run(&mut self) -> Result<(), TaskError> {
        {
            let mut job = lock(&self.state);
            match job.status {
                JobStatus::Running => return Ok(()),
                JobStatus::Created | JobStatus::Paused => {}
                from => {
                    return Err(TaskError::InvalidTransition {
                        from,
                        to: JobStatus::Running,
                    })
                }
            }
            if self.outcome == Outcome::Panic {
                drop(job);
                panic!("timer tool asked to panic");
            }
            job.status = JobStatus::Running;
            if job.start_time.is_none() {
                job.start_time = Some(Utc::now());
            }
        }

        let stop = CancellationToken::new();
        self.stop = Some(stop.clone());
        let state = Arc::clone(&self.state);
        let tick = self.tick;
        let success = self.outcome == Outcome::Success;

        tokio::spawn(async move {
            loop {
                {
                    let mut job = lock(&state);
                    if stop.is_cancelled() {
                        return;
                    }
                    if job.cracked_count >= job.total_count {
                        if success {
                            job.status = JobStatus::Done;
                        } else {
                            job.status = JobStatus::Failed;
                            job.error = Some("timer finished with failure".into());
                        }
                        tracing::info!(job_id = %job.id, status = %job.status, "Timer ended");
                        return;
                    }
                }
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(tick) => {}
                }
                let mut job = lock(&state);
                if stop.is_cancelled() {
                    return;
                }
                job.cracked_count += 1;
            }
        });

        Ok(())
    }

    fn pause(&mut self) -> Result<(), TaskError> {
        let mut job = lock(&self.state);
        if job.status != JobStatus::Running {
            return Err(TaskError::InvalidTransition {
                from: job.status,
                to: JobStatus::Paused,
            });
        }
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
        job.status = JobStatus::Paused;
        Ok(())
    }

    fn quit(&mut self) -> Job {
        self.halt();
        let mut job = lock(&self.state);
        if !job.status.is_terminal() {
            job.status = JobStatus::Quit;
        }
        job.clone()
    }

    fn status(&self) -> Job {
        let mut job = lock(&self.state);
        let timestamp = Utc::now().timestamp().to_string();
        let cracked = job.cracked_count;
        job.performance.insert(timestamp, cracked.to_string());
        job.progress = if job.total_count > 0 {
            job.cracked_count as f64 / job.total_count as f64 * 100.0
        } else {
            100.0
        };
        job.clone()
    }
}

impl Drop for TimerTask {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn job(tool: &TimerTool, seconds: &str, result: &str) -> Job {
        Job::new(tool.id(), "timer", "tester", BTreeMap::new())
            .with_parameter("seconds", seconds)
            .with_parameter("result", result)
    }

    #[test]
    fn rejects_bad_seconds() {
        let tool = TimerTool::cpu(Duration::from_millis(5));
        let err = tool.new_task(job(&tool, "soon", "Success")).err();
        assert!(matches!(err, Some(TaskError::InvalidParameter { .. })));
    }

    #[test]
    fn descriptor_carries_requirement() {
        let tool = TimerTool::gpu(Duration::from_millis(5));
        let desc = tool.descriptor();
        assert_eq!(desc.requirement, HARDWARE_GPU);
        assert_eq!(desc.id, tool.id());
        assert!(desc.parameters.contains("seconds"));
    }

    #[tokio::test]
    async fn runs_to_done() {
        let tool = TimerTool::cpu(Duration::from_millis(5));
        let mut task = tool.new_task(job(&tool, "2", "Success")).unwrap();
        task.run().unwrap();
        assert_eq!(task.status().status, JobStatus::Running);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let done = task.status();
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.cracked_count, 2);
        assert_eq!(done.progress, 100.0);
    }

    #[tokio::test]
    async fn failure_result_ends_failed() {
        let tool = TimerTool::cpu(Duration::from_millis(5));
        let mut task = tool.new_task(job(&tool, "1", "Failure")).unwrap();
        task.run().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(task.status().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn pause_stops_counting_and_run_resumes() {
        let tool = TimerTool::cpu(Duration::from_millis(20));
        let mut task = tool.new_task(job(&tool, "1000", "Success")).unwrap();
        task.run().unwrap();
        // Running twice is a no-op.
        task.run().unwrap();

        task.pause().unwrap();
        let paused = task.status();
        assert_eq!(paused.status, JobStatus::Paused);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(task.status().cracked_count, paused.cracked_count);

        task.run().unwrap();
        assert_eq!(task.status().status, JobStatus::Running);
        assert_eq!(task.quit().status, JobStatus::Quit);
    }

    #[tokio::test]
    async fn terminal_task_cannot_run_or_pause() {
        let tool = TimerTool::cpu(Duration::from_millis(5));
        let mut task = tool.new_task(job(&tool, "10", "Success")).unwrap();
        task.run().unwrap();
        task.quit();
        assert!(matches!(
            task.run(),
            Err(TaskError::InvalidTransition { .. })
        ));
        assert!(matches!(
            task.pause(),
            Err(TaskError::InvalidTransition { .. })
        ));
    }
}
