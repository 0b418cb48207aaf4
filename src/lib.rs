pub mod app;
pub mod archive;
pub mod cache;
pub mod config;
pub mod convert;
pub mod domain;
pub mod error;
pub mod formula;
pub mod http;
pub mod output;
pub mod pubchem;
pub mod remote;
pub mod sdf;
pub mod search;
pub mod store;
pub mod sync;
