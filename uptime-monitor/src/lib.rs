/*!
Uptime monitor backend: accounts, session tokens and uptime checks stored as
JSON records on disk
*/

pub mod core;
