pub mod asset;
pub mod chain;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod price;
pub mod vault;

pub mod proto {
    pub mod v1 {
        tonic::include_proto!("btc_split_exchange.v1");
    }
}

pub use error::{Error, Result};
