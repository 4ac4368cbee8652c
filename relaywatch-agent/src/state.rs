//! Shared-state alias used across the agent.
//!
//! The live device set, the session and the connectivity flag are all
//! guarded by short critical sections; locks are never held across an
//! `.await` point.

use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
