//! External command surface

pub mod http;

pub use http::HttpApi;
