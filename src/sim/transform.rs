//! Stage work that takes time and sometimes fails.

use crate::pipeline::Transform;
use crate::sim::Frame;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Arithmetic applied to a frame's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "op", content = "operand", rename_all = "snake_case")]
pub enum Operation {
    #[default]
    Identity,
    Add(i64),
    Sub(i64),
    Mul(i64),
}

impl Operation {
    pub fn apply(self, value: i64) -> i64 {
        match self {
            Operation::Identity => value,
            Operation::Add(n) => value.wrapping_add(n),
            Operation::Sub(n) => value.wrapping_sub(n),
            Operation::Mul(n) => value.wrapping_mul(n),
        }
    }
}

/// Per-frame work with a fixed latency and a random failure chance.
#[derive(Debug, Clone)]
pub struct SimulatedTransform {
    stage: String,
    latency: Duration,
    failure_rate: f64,
    operation: Operation,
}

impl SimulatedTransform {
    pub fn new(stage: impl Into<String>, latency: Duration) -> Self {
        Self {
            stage: stage.into(),
            latency,
            failure_rate: 0.0,
            operation: Operation::Identity,
        }
    }

    /// Fail each call with probability `rate` (clamped to `[0, 1]`).
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }
}

impl Transform<Frame> for SimulatedTransform {
    fn apply(&self, frame: Frame) -> BoxFuture<'static, anyhow::Result<Frame>> {
        let this = self.clone();
        Box::pin(async move {
            if !this.latency.is_zero() {
                tokio::time::sleep(this.latency).await;
            }
            if this.failure_rate > 0.0 && rand::random::<f64>() < this.failure_rate {
                anyhow::bail!("[{}] Condition failed for id: {}", this.stage, frame.id);
            }
            Ok(Frame {
                value: this.operation.apply(frame.value),
                ..frame
            })
        })
    }
}
