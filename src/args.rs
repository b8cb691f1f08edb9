// Commandline argument parser using clap for canmon

use crate::frame_codec::CanMode;
use crate::signal::SignalMode;
use crate::tp2::AngleMagnitude;

use clap::{Args, Parser, Subcommand, ValueEnum};

use std::path::PathBuf;

/// Talk to a serial CAN bridge and watch or drive TP2 angles
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct CanmonArgs {
    #[command(subcommand)]
    /// What to do with the bridge
    pub command: CommandTask,

    /// Port, baud rate and config file
    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Open the bridge and watch TP2 angles live
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct MonitorArgs {
    /// Port, baud rate and config file
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Loopback and signal choice
    #[command(flatten)]
    pub monitor: MonitorCommand,
}

/// Where the bridge is and how to talk to it. Anything left out comes from
/// the config file, and a missing port is asked for interactively.
#[derive(Debug, Args, Clone, Default)]
pub struct ConnectionArgs {
    /// Settings file, in ron
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Serial device of the bridge, e.g. /dev/ttyUSB0 or COM3
    #[arg(short, long, global = true)]
    pub port: Option<String>,

    /// Baud rate, 115200 for the stock firmware
    #[arg(short, long, global = true)]
    pub baud: Option<u32>,
}

/// One bridge operation per invocation
#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// List the serial ports on this machine
    #[command(about)]
    Ports,

    /// Live table of the angles received from every group
    #[command(about)]
    Monitor(MonitorCommand),

    /// Put one raw frame on the bus
    #[command(about)]
    Send(FrameArgs),

    /// Send one TP2 angle, e.g. `angle 3 R-34`
    #[command(about)]
    Angle(AngleCommand),

    /// Switch the bridge between normal and loopback mode
    #[command(about)]
    Mode(ModeCommand),

    /// Turn the firmware's own periodic sender on or off
    #[command(about)]
    Auto(AutoCommand),

    /// Send a named preset from the config file
    #[command(about)]
    Preset(PresetCommand),

    /// Send the same frame periodically
    #[command(about)]
    Repeat(RepeatCommand),

    /// Transmit synthetic angles, rate limited
    #[command(about)]
    Transmit(TransmitCommand),
}

/// Options of the live angle table
#[derive(Debug, Args, Clone)]
pub struct MonitorCommand {
    /// Put the bridge in loopback mode after connecting
    #[arg(short, long)]
    pub loopback: bool,

    /// Signal sent on every group when transmission is toggled with `t`
    #[arg(short, long, default_value = "sine")]
    pub signal: SignalMode,
}

/// A raw CAN frame as typed by the operator
#[derive(Debug, Args, Clone)]
pub struct FrameArgs {
    /// Standard CAN id in hex, e.g. 123 or 0x7FF
    pub id: String,

    /// Data bytes in hex, e.g. 0102AABB or "01 02 aa bb"
    pub data: String,
}

/// One TP2 angle string for one group
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct AngleCommand {
    /// TP2 group, 0 to 7
    pub group: u8,

    /// Tag, optional sign and degrees, e.g. R-34, C0 or O+138
    #[arg(allow_hyphen_values = true)]
    pub angle: String,
}

/// Bridge mode switch
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct ModeCommand {
    /// normal or loopback
    pub mode: CanMode,
}

/// State of the firmware's periodic sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    /// Start sending
    On,
    /// Stop sending
    Off,
}

/// Firmware auto-send switch
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct AutoCommand {
    /// on or off
    #[arg(value_enum)]
    pub state: Toggle,
}

/// A named angle from the config file
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct PresetCommand {
    /// Name of the preset, case-insensitive
    pub name: String,
}

/// A frame sent on a fixed period
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct RepeatCommand {
    /// The frame to repeat
    #[command(flatten)]
    pub frame: FrameArgs,

    /// Delay between two sends, in milliseconds
    #[arg(short, long, default_value_t = 100)]
    pub interval_ms: u64,

    /// How long to keep sending, in seconds
    #[arg(short, long, default_value_t = 10)]
    pub seconds: u64,
}

/// Rate-governed synthetic angles on a set of groups
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct TransmitCommand {
    /// sine, constant or noise
    #[arg(short, long, default_value = "sine")]
    pub mode: SignalMode,

    /// Groups to drive
    #[arg(short, long, default_values_t = [0u8, 1, 2, 3, 4, 5, 6, 7])]
    #[clap(num_args = 1..)]
    pub groups: Vec<u8>,

    /// Magnitudes to drive in every selected group: r, c or o
    #[arg(short = 'a', long = "angles", default_values = ["r", "c", "o"])]
    #[clap(num_args = 1..)]
    pub magnitudes: Vec<AngleMagnitude>,

    /// How long to keep transmitting, in seconds
    #[arg(short, long, default_value_t = 10)]
    pub seconds: u64,
}
