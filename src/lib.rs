pub mod carrier;
pub mod clock;
pub mod config;
pub mod cycle;
pub mod domain;
pub mod net;
pub mod notify;
pub mod policy_store;
pub mod proc_state;
pub mod quota;
pub mod restrict_background;
pub mod service;
pub mod state;
pub mod uid_policy;
pub mod version;
