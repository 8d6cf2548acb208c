pub mod commands;
pub mod docker;
pub mod hooks;
pub mod restic;
