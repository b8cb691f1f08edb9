//! One bridge command per invocation.
//!
//! ```text
//! canmon ports
//! canmon --port /dev/ttyUSB0 angle 3 R-34
//! canmon send 0x123 "01 02 AA"
//! canmon transmit --mode sine --groups 0 1 --seconds 30
//! ```

use canmon::{
    args::{CanmonArgs, CommandTask, Toggle},
    config::Config,
    frame_codec::{parse_operator_frame, BridgeStatus, CanMode, Command, Line},
    gui,
    session::{ConnectionSession, EventSink, SessionEvent},
    tp2::{AngleMagnitude, GroupId},
    transmitter::TransmitJob,
};

use clap::Parser;
use log::{debug, info};
use serial2::SerialPort;
use std::{
    error::Error,
    sync::mpsc::Receiver,
    time::{Duration, Instant},
};

// Opening the port resets most boards, which then print their banner
const READY_TIMEOUT: Duration = Duration::from_millis(2500);

// How long to keep printing replies after a one-shot command
const REPLY_WINDOW: Duration = Duration::from_millis(500);

type Session = ConnectionSession<SerialPort>;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = CanmonArgs::parse();

    if let CommandTask::Ports = args.command {
        for port in SerialPort::available_ports()? {
            println!("{}", port.to_string_lossy());
        }
        return Ok(());
    }

    let config = Config::from_args(&args.connection)?;
    let Some((mut session, events)) = connect(&config)? else {
        println!("No port selected");
        return Ok(());
    };

    match args.command {
        CommandTask::Ports => {}
        CommandTask::Monitor(monitor) => {
            if monitor.loopback {
                session.send(Command::Mode(CanMode::Loopback))?;
            }
            let everything = GroupId::all()
                .map(|g| (g, AngleMagnitude::ALL.to_vec()))
                .collect();
            let job = TransmitJob::Synthetic(config.transmit.plan(monitor.signal, everything));
            gui::angle_table(&mut session, &events, Some(job))?;
        }
        CommandTask::Send(frame) => {
            let frame = parse_operator_frame(&frame.id, &frame.data)?;
            send_and_report(&session, &events, Command::Send(frame))?;
        }
        CommandTask::Angle(angle) => {
            let group = GroupId::new(angle.group)?;
            session.send_angle_string(group, &angle.angle)?;
            report_for(&events, REPLY_WINDOW);
        }
        CommandTask::Mode(mode) => {
            send_and_report(&session, &events, Command::Mode(mode.mode))?;
        }
        CommandTask::Auto(auto) => {
            send_and_report(&session, &events, Command::AutoSend(auto.state == Toggle::On))?;
        }
        CommandTask::Preset(preset) => {
            let preset = config
                .preset(&preset.name)
                .ok_or_else(|| format!("no preset named {:?}", preset.name))?;
            info!(
                "Preset {}: group {} {} = {}",
                preset.name, preset.group, preset.magnitude, preset.value
            );
            send_and_report(&session, &events, Command::Send(preset.frame()?))?;
        }
        CommandTask::Repeat(repeat) => {
            let frame = parse_operator_frame(&repeat.frame.id, &repeat.frame.data)?;
            let job = TransmitJob::repeat(frame, Duration::from_millis(repeat.interval_ms));
            run_job(&mut session, &events, job, Duration::from_secs(repeat.seconds))?;
        }
        CommandTask::Transmit(transmit) => {
            let selection = transmit
                .groups
                .iter()
                .map(|&g| Ok((GroupId::new(g)?, transmit.magnitudes.clone())))
                .collect::<Result<Vec<_>, canmon::error::ValidationError>>()?;
            let plan = config.transmit.plan(transmit.mode, selection);
            run_job(
                &mut session,
                &events,
                TransmitJob::Synthetic(plan),
                Duration::from_secs(transmit.seconds),
            )?;
        }
    }

    session.disconnect()?;
    Ok(())
}

/// Opens the configured port, or the one the operator picks, and waits
/// for the bridge to come up.
fn connect(config: &Config) -> Result<Option<(Session, Receiver<SessionEvent>)>, Box<dyn Error>> {
    let Some(port) = gui::resolve_port(config.port.clone(), config.baud_rate)? else {
        return Ok(None);
    };

    let (sink, events) = EventSink::channel();
    let session = Session::open(
        &port,
        config.baud_rate,
        config.read_timeout(),
        config.session_options(),
        sink,
    )?;

    let deadline = Instant::now() + READY_TIMEOUT;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        let Ok(event) = events.recv_timeout(left) else {
            break;
        };
        print_event(&event);
        if let SessionEvent::Received(line) = event {
            if let Line::PlainText(text) = &line {
                if BridgeStatus::classify(text) == Some(BridgeStatus::Ready) {
                    break;
                }
            } else {
                break;
            }
        }
    }
    debug!("Bridge on {port} is up");

    Ok(Some((session, events)))
}

fn send_and_report(
    session: &Session,
    events: &Receiver<SessionEvent>,
    command: Command,
) -> Result<(), Box<dyn Error>> {
    session.send(command)?;
    report_for(events, REPLY_WINDOW);
    Ok(())
}

fn run_job(
    session: &mut Session,
    events: &Receiver<SessionEvent>,
    job: TransmitJob,
    duration: Duration,
) -> Result<(), Box<dyn Error>> {
    session.start_transmission(job)?;
    report_for(events, duration);
    session.stop_transmission()?;
    report_for(events, REPLY_WINDOW);
    Ok(())
}

fn report_for(events: &Receiver<SessionEvent>, window: Duration) {
    let deadline = Instant::now() + window;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) => print_event(&event),
            Err(_) => break,
        }
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Received(Line::Frame(frame)) => {
            println!("RX {:03X} {}", frame.id(), frame.payload_tokens().join(" "))
        }
        SessionEvent::Received(Line::PlainText(text)) => println!("<< {text}"),
        SessionEvent::Angle(update) => {
            println!("   group {} {} = {}", update.group, update.magnitude, update.value)
        }
        SessionEvent::Sent(command) => println!(">> {command}"),
        SessionEvent::Emitted { key, value, trigger } => {
            debug!("Group {} {} = {value} ({trigger})", key.0, key.1)
        }
        SessionEvent::TransmissionStopped(Some(e)) => println!("!! transmission stopped: {e}"),
        SessionEvent::TransmissionStopped(None) => {}
        SessionEvent::Error(e) => println!("!! {e}"),
    }
}
