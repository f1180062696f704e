pub mod cert;
pub mod config;
pub mod proxy;
pub mod rules;
pub mod sysproxy;
pub mod transport;

pub use config::Config;
pub use proxy::ProxyServer;
