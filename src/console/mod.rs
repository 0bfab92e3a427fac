// Console module - the headless driver for the orchestrator
//
// Plays the role a GUI would: pumps server output on a fixed period and turns user
// input into orchestrator calls.

pub mod command;
pub mod controller;

pub use command::{COMMAND_PREFIX, ConsoleCommand, HELP_TEXT};
pub use controller::{ConsoleController, Flow};
