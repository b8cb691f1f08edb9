//! `canmon` talks to a small serial-to-CAN bridge and speaks TP2, a
//! telemetry convention in which eight groups report roll, pitch and
//! orientation angles as ASCII payloads on CAN ids `0x100..=0x107`.
//!
//! The bridge is a microcontroller with a CAN controller that forwards every
//! frame it receives as a `CAN_RX_` text line and puts on the bus whatever
//! it is told with `SEND_` lines. On top of that this crate
//!
//! - decodes the line protocol ([frame_codec]) and the TP2 payloads ([tp2]),
//! - keeps the last angle of every group with its age ([angle_store]),
//! - runs the connection with one reader and one writer thread
//!   ([session]),
//! - and can drive the bus itself, either repeating a frame or generating
//!   synthetic angles ([signal]) under a rate policy ([emitter],
//!   [transmitter]).
//!
//! The two binaries are thin: `canmon` runs one command per invocation and
//! `monitor` opens the live table straight away.

#![warn(missing_docs)]
pub mod angle_store;
pub mod args;
pub mod cancel;
pub mod config;
pub mod emitter;
pub mod error;
pub mod frame_codec;
pub mod gui;
pub mod session;
pub mod signal;
pub mod tp2;
pub mod transmitter;
