use std::sync::Arc;

use async_trait::async_trait;
use mirror_core::ObjectKey;
use mirror_queue::{Outcome, Worker};
use tracing::warn;

use crate::{reconcile, Action, Context};

/// Dispatcher worker running one reconciliation pass per key.
pub struct Reconciler {
    ctx: Arc<Context>,
}

impl Reconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

#[async_trait]
impl Worker<ObjectKey> for Reconciler {
    async fn run(&self, key: ObjectKey) -> Outcome {
        match reconcile(&key, &self.ctx).await {
            Ok(Action::Requeue(after)) => Outcome::Requeue(after),
            Ok(Action::AwaitChange) => Outcome::Done,
            Err(e) => {
                warn!(mirror = %key, error = %e, reason = e.reason(), "pass failed");
                Outcome::Failed(e.backoff())
            }
        }
    }
}
