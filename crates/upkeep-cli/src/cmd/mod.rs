pub mod check;
pub mod collections;
pub mod config;
pub mod history;
pub mod init;
pub mod run;
pub mod status;
pub mod watch;
