pub mod backend;
pub mod cache;
pub mod compress;
pub mod config;
pub mod connection;
pub mod db;
pub mod dispatcher;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod processor;
