//! Contextual-bandit arm selection for the intentflow loop.
//!
//! [`LinearThompsonSampler`] keeps a Bayesian linear-regression posterior over
//! reward weights and picks the candidate whose features score highest under a
//! weight vector sampled from it. [`PolicyStore`] persists the posterior
//! between intent loops.

pub mod linalg;
pub mod store;
pub mod thompson;

pub use store::{BinaryFileStore, PolicyScope, PolicyStore};
pub use thompson::{LinearThompsonSampler, PolicyParams, PolicyState};
