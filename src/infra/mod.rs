pub mod docker;
pub mod memory;
pub mod sqlite;
pub mod web;
