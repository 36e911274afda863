//! Attendance, fee and competency reporting for EduFam schools.
//!
//! Rows are read per school from Postgres, decoded into typed records at the
//! `db` boundary, and aggregated by the pure functions in `attendance`,
//! `finance` and `competency`.

pub mod attendance;
pub mod cache;
pub mod competency;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod fetch;
pub mod finance;
pub mod models;
pub mod report;
