pub mod abs;
pub mod config;
pub mod expr;
pub mod mem;
pub mod outgen;
pub mod solver;
pub(crate) mod utils;

use common::log_info;

pub use abs::{Checkpoint, ConcreteVal, MemoryError, RegionId, RegionKind, Sort};
pub use expr::{Expr, ExprContext, ExprRef};
pub use mem::{Key, MemoryState};

/// Initializes logging for standalone use. Embedders with their own
/// subscriber can skip this.
pub fn init() {
    utils::logging::init_logging();
    log_info!("Initializing symbolic memory engine");
}
