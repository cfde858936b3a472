pub mod types;

#[cfg(feature = "logging")]
pub mod logging;

#[cfg(feature = "config")]
pub mod config;

pub mod loam {
    pub use crate as common;
}
