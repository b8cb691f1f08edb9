use canmon::{
    args::MonitorArgs,
    config::Config,
    frame_codec::{CanMode, Command},
    gui,
    session::{ConnectionSession, EventSink},
    tp2::{AngleMagnitude, GroupId},
    transmitter::TransmitJob,
};

use clap::Parser;
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = MonitorArgs::parse();
    let config = Config::from_args(&args.connection)?;

    let Some(port) = gui::resolve_port(config.port.clone(), config.baud_rate)? else {
        println!("No port selected");
        return Ok(());
    };

    let (sink, events) = EventSink::channel();
    let mut session = ConnectionSession::open(
        &port,
        config.baud_rate,
        config.read_timeout(),
        config.session_options(),
        sink,
    )?;
    if args.monitor.loopback {
        session.send(Command::Mode(CanMode::Loopback))?;
    }

    let everything = GroupId::all()
        .map(|g| (g, AngleMagnitude::ALL.to_vec()))
        .collect();
    let job = TransmitJob::Synthetic(config.transmit.plan(args.monitor.signal, everything));
    gui::angle_table(&mut session, &events, Some(job))?;

    session.disconnect()?;
    Ok(())
}
