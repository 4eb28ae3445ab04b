// Delayed retry queue
//
// Handles:
// - Deferred tasks with a visibility delay
// - Lazy ready-task polling with claim/ack (at-least-once)
// - Backoff policy for repeated rejections
// - Dead letter queue for tasks that will not be retried

pub mod dead_letter;
pub mod delayed;
pub mod memory;
pub mod retry;
pub mod task;

pub use dead_letter::{DeadLetterEntry, DeadLetterReason, QueueStats};
pub use delayed::{poll_ready, DelayedQueue};
pub use memory::MemoryQueue;
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use task::{QueuedTask, RetryState};
