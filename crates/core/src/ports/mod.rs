mod chain_adapter;
mod config_feed;
mod ledger;

pub use chain_adapter::*;
pub use config_feed::*;
pub use ledger::*;
