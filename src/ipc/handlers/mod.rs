pub mod attendance;
pub mod auth;
pub mod backup;
pub mod birthdays;
pub mod coordinator;
pub mod core;
pub mod export;
pub mod groups;
pub mod setup;
pub mod statistics;
pub mod students;
pub mod teachers;
