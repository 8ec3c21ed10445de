pub mod big_servant;
pub mod clock;
pub mod http;
pub mod lcache;
pub mod logging;
pub mod lz4codec;
pub mod mcache;
pub mod mclient;
pub mod memcache;
pub mod metrics;
pub mod moperation;
pub mod proxy_config;
pub mod quickie;
pub mod redis;
pub mod redis_client;
pub mod redis_group;
pub mod redis_op;
pub mod xiservant;

pub use big_servant::BigServant;
