//! Duration estimation.
//!
//! Observed START and COMPLETE latencies are fitted to the best of a few
//! distribution families; the fit yields duration estimates (a quantile) and
//! polling plans for devices that cannot push their progress.

mod distribution;
mod fit;
mod polls;

pub use distribution::{Distribution, Gamma, GenLogistic, Normal, Uniform, erf, ln_gamma, regularized_lower_gamma};
pub use fit::{get_best_distribution, ks_p_value};
pub use polls::{DEFAULT_UPPER_QUANTILE, MAX_POLLS, PollOptions, captured_mass, get_polls};
