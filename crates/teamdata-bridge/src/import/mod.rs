mod bridged;
mod factory;

pub use bridged::BridgedImportDirectory;
pub use factory::{ImportDirectoryFactory, ALL_LOCATIONS};
