/*!
Core modules for accounts, sessions and checks
*/

pub mod accounts;
pub mod checks;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod locks;
pub mod maintenance;
pub mod models;
pub mod service;
pub mod sessions;

#[cfg(test)]
pub(crate) mod test_support;
