mod transport;
pub use transport::TransportConfig;
