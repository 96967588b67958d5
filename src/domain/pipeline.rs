use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error};

use crate::error::{Error, Result};

use super::event::DeployEvent;

/// One compensable step. `forward` receives the previous step's result,
/// `backward` receives this step's own forward result.
#[async_trait]
pub trait Action<C: Sync, R: Send + Sync>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn forward(&self, ctx: &C, previous: Option<&R>) -> Result<R>;

    async fn backward(&self, _ctx: &C, _result: &R) {}

    /// Called with the forward error before the unwind starts.
    async fn on_error(&self, _ctx: &C, _err: &Error) {}
}

pub type BoxedAction<C, R> = Box<dyn Action<C, R>>;

pub struct Pipeline<C, R> {
    actions: Vec<BoxedAction<C, R>>,
    event: Option<Arc<DeployEvent>>,
}

impl<C: Sync, R: Send + Sync> Pipeline<C, R> {
    pub fn new(actions: Vec<BoxedAction<C, R>>) -> Self {
        Self {
            actions,
            event: None,
        }
    }

    /// Polls `event` for cancellation before each forward step.
    pub fn with_event(mut self, event: Arc<DeployEvent>) -> Self {
        self.event = Some(event);
        self
    }

    pub async fn execute(&self, ctx: &C) -> Result<R> {
        if self.actions.is_empty() {
            return Err(Error::PipelineNoActions);
        }
        let mut done: Vec<R> = Vec::with_capacity(self.actions.len());
        for action in &self.actions {
            let outcome = if self.event.as_ref().is_some_and(|event| event.ack_cancel()) {
                Err(Error::DeployCanceled)
            } else {
                debug!("[pipeline] running forward for {}", action.name());
                action.forward(ctx, done.last()).await
            };
            match outcome {
                Ok(result) => done.push(result),
                Err(err) => {
                    error!("[pipeline] error running forward for {}: {}", action.name(), err);
                    action.on_error(ctx, &err).await;
                    self.rollback(ctx, &done).await;
                    return Err(err.at(action.name()));
                }
            }
        }
        done.pop().ok_or(Error::PipelineNoActions)
    }

    async fn rollback(&self, ctx: &C, done: &[R]) {
        for (action, result) in self.actions.iter().zip(done).rev() {
            debug!("[pipeline] running backward for {}", action.name());
            action.backward(ctx, result).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        event: Option<Arc<DeployEvent>>,
    }

    impl Recorder {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct Step {
        name: &'static str,
        fail: bool,
        cancel_during: bool,
    }

    fn step(name: &'static str) -> BoxedAction<Recorder, u32> {
        Box::new(Step {
            name,
            fail: false,
            cancel_during: false,
        })
    }

    #[async_trait]
    impl Action<Recorder, u32> for Step {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn forward(&self, ctx: &Recorder, previous: Option<&u32>) -> Result<u32> {
            ctx.record(format!("forward {}", self.name));
            if self.cancel_during {
                if let Some(event) = &ctx.event {
                    event.cancel();
                }
            }
            if self.fail {
                return Err(Error::ExitStatus(1));
            }
            Ok(previous.copied().unwrap_or(0) + 1)
        }

        async fn backward(&self, ctx: &Recorder, result: &u32) {
            ctx.record(format!("backward {} {}", self.name, result));
        }
    }

    #[tokio::test]
    async fn results_are_chained() {
        let pipeline = Pipeline::new(vec![step("a"), step("b"), step("c")]);
        let recorder = Recorder::default();
        assert_eq!(pipeline.execute(&recorder).await.unwrap(), 3);
        assert_eq!(
            recorder.calls(),
            vec!["forward a", "forward b", "forward c"]
        );
    }

    #[tokio::test]
    async fn failure_unwinds_previous_actions_in_reverse() {
        let failing: BoxedAction<Recorder, u32> = Box::new(Step {
            name: "c",
            fail: true,
            cancel_during: false,
        });
        let pipeline = Pipeline::new(vec![step("a"), step("b"), failing, step("d")]);
        let recorder = Recorder::default();
        let err = pipeline.execute(&recorder).await.unwrap_err();
        assert!(matches!(err.root(), Error::ExitStatus(1)));
        assert_eq!(err.to_string(), "c: Exit status 1");
        assert_eq!(
            recorder.calls(),
            vec![
                "forward a",
                "forward b",
                "forward c",
                "backward b 2",
                "backward a 1"
            ]
        );
    }

    #[tokio::test]
    async fn empty_pipeline_is_an_error() {
        let pipeline: Pipeline<Recorder, u32> = Pipeline::new(vec![]);
        let err = pipeline.execute(&Recorder::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "No actions to execute.");
    }

    #[tokio::test]
    async fn cancellation_between_actions_unwinds() {
        let event = Arc::new(DeployEvent::new("myapp"));
        let canceling: BoxedAction<Recorder, u32> = Box::new(Step {
            name: "b",
            fail: false,
            cancel_during: true,
        });
        let pipeline =
            Pipeline::new(vec![step("a"), canceling, step("c")]).with_event(event.clone());
        let recorder = Recorder {
            event: Some(event),
            ..Default::default()
        };
        let err = pipeline.execute(&recorder).await.unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(
            recorder.calls(),
            vec!["forward a", "forward b", "backward b 2", "backward a 1"]
        );
    }

    #[tokio::test]
    async fn cancellation_before_start_runs_nothing() {
        let event = Arc::new(DeployEvent::new("myapp"));
        event.cancel();
        let pipeline = Pipeline::new(vec![step("a")]).with_event(event);
        let recorder = Recorder::default();
        assert!(pipeline.execute(&recorder).await.unwrap_err().is_canceled());
        assert!(recorder.calls().is_empty());
    }
}
