pub mod caller_kind;
pub mod cluster;
pub mod job;
pub mod logging;
pub mod servant;
pub mod setting;
pub mod sqlrw;
pub mod team;

pub use servant::DbManServant;
