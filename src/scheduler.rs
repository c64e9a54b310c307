use tokio::sync::Mutex;

use crate::download::plan::{Chunk, ChunkPlan, ChunkState};

/// Outcome of recording a failed attempt against a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The chunk may be retried; `attempt` attempts have failed so far.
    Retry { attempt: u32 },
    /// The retry budget is spent after `attempts` attempts.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub pending: usize,
    pub in_flight: usize,
    pub done: usize,
    pub failed: usize,
    pub total: usize,
}

impl SchedulerSnapshot {
    pub fn remaining(&self) -> usize {
        self.total - self.done
    }
}

/// Owns the chunk plan; every state transition happens under its lock.
pub struct Scheduler {
    plan: Mutex<ChunkPlan>,
    budget: u32,
}

impl Scheduler {
    pub fn new(plan: ChunkPlan, budget: u32) -> Self {
        Self {
            plan: Mutex::new(plan),
            budget,
        }
    }

    /// Claims the lowest pending chunk, moving it to in-flight.
    pub async fn next_chunk(&self) -> Option<Chunk> {
        let mut plan = self.plan.lock().await;
        let chunk = plan
            .chunks
            .iter_mut()
            .find(|chunk| chunk.state == ChunkState::Pending)?;
        chunk.state = ChunkState::InFlight;
        Some(chunk.clone())
    }

    pub async fn on_chunk_complete(&self, id: usize) {
        let mut plan = self.plan.lock().await;
        if let Some(chunk) = plan.chunk_mut(id) {
            debug_assert_eq!(chunk.state, ChunkState::InFlight);
            chunk.state = ChunkState::Done;
            chunk.last_error = None;
        }
    }

    pub async fn on_chunk_failed(&self, id: usize, reason: &str) -> FailureOutcome {
        let mut plan = self.plan.lock().await;
        let budget = self.budget;
        let Some(chunk) = plan.chunk_mut(id) else {
            return FailureOutcome::Exhausted { attempts: 0 };
        };
        chunk.state = ChunkState::Failed;
        chunk.last_error = Some(reason.to_string());
        let attempt = budget.saturating_sub(chunk.retries_left) + 1;
        if chunk.retries_left == 0 {
            FailureOutcome::Exhausted { attempts: attempt }
        } else {
            chunk.retries_left -= 1;
            FailureOutcome::Retry { attempt }
        }
    }

    /// Makes a failed chunk claimable again once its backoff has elapsed.
    pub async fn requeue(&self, id: usize) {
        let mut plan = self.plan.lock().await;
        if let Some(chunk) = plan.chunk_mut(id) {
            if chunk.state == ChunkState::Failed {
                chunk.state = ChunkState::Pending;
            }
        }
    }

    /// Returns an in-flight chunk to pending without spending its budget.
    pub async fn release(&self, id: usize) {
        let mut plan = self.plan.lock().await;
        if let Some(chunk) = plan.chunk_mut(id) {
            if chunk.state == ChunkState::InFlight {
                chunk.state = ChunkState::Pending;
            }
        }
    }

    pub async fn has_remaining(&self) -> bool {
        !self.plan.lock().await.is_complete()
    }

    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let plan = self.plan.lock().await;
        SchedulerSnapshot {
            pending: plan.count(ChunkState::Pending),
            in_flight: plan.count(ChunkState::InFlight),
            done: plan.count(ChunkState::Done),
            failed: plan.count(ChunkState::Failed),
            total: plan.chunks.len(),
        }
    }

    pub fn into_plan(self) -> ChunkPlan {
        self.plan.into_inner()
    }
}
