//! Terminal front end: picking a serial port and watching the bus.

mod angle_table;
mod device_selector;
mod error;

pub use angle_table::{angle_table, TableApp};
pub use device_selector::{device_selector, resolve_port};
pub use error::GuiError;
