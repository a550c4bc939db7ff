//! Built-in tools

mod calculator;
mod datetime;
mod terminal;

pub use calculator::{evaluate, CalculatorTool};
pub use datetime::DateTimeTool;
pub use terminal::{TerminalTool, ALLOWED_COMMANDS};
