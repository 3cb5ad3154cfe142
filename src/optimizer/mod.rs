pub mod dp;

pub use dp::{optimise, SOC_STEPS};
