pub mod document;
pub mod entsoe;
pub mod store;

pub use document::{PriceDocument, PricePoint, PriceSeries};
pub use entsoe::{MarketPriceClient, PriceError};
pub use store::PriceStore;
