//! Priority-list algebra behind the PCT strategy.
//!
//! Rather than committing to one random priority order, the engine keeps
//! every order that is still consistent with the decisions made so far
//! and that needs at most `bound` priority-change points. A scheduling
//! choice is legal iff at least one of those orders would have made it.
//!
//! - [`PctState`]: one order, split into `high ++ low`, plus the number
//!   of change points it has consumed.
//! - [`PctStates`]: the deduplicated set of candidate orders.

mod state;
mod states;

pub use state::PctState;
pub use states::PctStates;
