use std::{
    fmt, fs,
    io::stdout,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::gui::error::GuiError;

use crossterm::{
    event::{self, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use log::{debug, info};
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};
use serial2::SerialPort;

/// What a serial device usually is, judged by its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortKind {
    UsbCdc,
    UsbSerial,
    Bluetooth,
    Onboard,
    Com,
}

impl PortKind {
    const PREFIXES: [(&'static str, PortKind); 10] = [
        ("ttyACM", PortKind::UsbCdc),
        ("cu.usbmodem", PortKind::UsbCdc),
        ("tty.usbmodem", PortKind::UsbCdc),
        ("ttyUSB", PortKind::UsbSerial),
        ("cu.usbserial", PortKind::UsbSerial),
        ("tty.usbserial", PortKind::UsbSerial),
        ("rfcomm", PortKind::Bluetooth),
        ("ttyS", PortKind::Onboard),
        ("ttyAMA", PortKind::Onboard),
        ("COM", PortKind::Com),
    ];

    fn of(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        Self::PREFIXES
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix))
            .map(|&(_, kind)| kind)
    }

    /// Bridge boards enumerate as USB devices.
    fn is_usb(self) -> bool {
        matches!(self, PortKind::UsbCdc | PortKind::UsbSerial)
    }
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PortKind::UsbCdc => "USB CDC board",
            PortKind::UsbSerial => "USB serial adapter",
            PortKind::Bluetooth => "Bluetooth serial",
            PortKind::Onboard => "onboard UART",
            PortKind::Com => "COM port",
        };
        write!(f, "{text}")
    }
}

/// One line of the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PortEntry {
    path: PathBuf,
    kind: Option<PortKind>,
    product: Option<String>,
}

impl PortEntry {
    fn new(path: PathBuf) -> Self {
        let product = usb_product(&path);
        Self {
            kind: PortKind::of(&path),
            product,
            path,
        }
    }

    fn likely_bridge(&self) -> bool {
        self.product.is_some() || self.kind.is_some_and(PortKind::is_usb)
    }

    /// `device - description`, or just the device when nothing is known.
    fn label(&self) -> String {
        let device = self.path.to_string_lossy();
        match (&self.product, self.kind) {
            (Some(product), Some(kind)) => format!("{device} - {product} ({kind})"),
            (Some(product), None) => format!("{device} - {product}"),
            (None, Some(kind)) => format!("{device} - {kind}"),
            (None, None) => device.into_owned(),
        }
    }
}

/// Manufacturer and product strings of the USB device behind `path`, read
/// from sysfs. `None` off Linux or for non-USB ports.
fn usb_product(path: &Path) -> Option<String> {
    let name = path.file_name()?;
    let device = fs::canonicalize(Path::new("/sys/class/tty").join(name).join("device")).ok()?;
    device.ancestors().take(3).find_map(|dir| {
        let product = sysfs_attr(dir, "product")?;
        Some(match sysfs_attr(dir, "manufacturer") {
            Some(manufacturer) if !product.starts_with(&manufacturer) => {
                format!("{manufacturer} {product}")
            }
            _ => product,
        })
    })
}

fn sysfs_attr(dir: &Path, attr: &str) -> Option<String> {
    let text = fs::read_to_string(dir.join(attr)).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_owned())
}

/// USB ports first, since that is where the bridge usually is.
fn describe_ports(paths: Vec<PathBuf>) -> Vec<PortEntry> {
    let mut ports: Vec<PortEntry> = paths.into_iter().map(PortEntry::new).collect();
    ports.sort_by_key(|p| !p.likely_bridge());
    ports
}

fn list_ports() -> Result<Vec<PortEntry>, GuiError> {
    let ports = describe_ports(SerialPort::available_ports()?);
    debug!("Found {} serial ports", ports.len());
    Ok(ports)
}

/// Lets the operator pick the bridge's port with the arrow keys, `r`
/// lists the ports again. Returns `None` if they quit.
pub fn device_selector(baud_rate: u32) -> Result<Option<PathBuf>, GuiError> {
    let ports = list_ports()?;

    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let selected_port = select_loop(ports, baud_rate);
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    selected_port
}

fn select_loop(mut ports: Vec<PortEntry>, baud_rate: u32) -> Result<Option<PathBuf>, GuiError> {
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let mut cursor = 0;
    let mut list_state = ListState::default();
    loop {
        list_state.select((!ports.is_empty()).then_some(cursor));
        terminal.draw(|frame| port_list(frame, &ports, baud_rate, &mut list_state))?;

        if event::poll(Duration::from_millis(16))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                let n_ports = ports.len().max(1);
                match key.code {
                    KeyCode::Down => cursor = (cursor + 1) % n_ports,
                    KeyCode::Up => cursor = (cursor + n_ports - 1) % n_ports,
                    KeyCode::Char('r') => {
                        ports = list_ports()?;
                        cursor = 0;
                    }
                    KeyCode::Enter => {
                        if let Some(port) = ports.get(cursor) {
                            return Ok(Some(port.path.clone()));
                        }
                    }
                    KeyCode::Char('q') | KeyCode::Esc => return Ok(None),
                    _ => {}
                }
            }
        }
    }
}

fn port_list(frame: &mut Frame, ports: &[PortEntry], baud_rate: u32, list_state: &mut ListState) {
    let title = format!(" TP2 CAN Monitor: bridge port @ {baud_rate} bps ");
    let title = Title::from(Span::raw(title).cyan().bold());
    let instructions = Title::from(Line::from(vec![
        " Navigate ".into(),
        "<Up>/<Down>".cyan().bold(),
        " Connect ".into(),
        "<Enter>".cyan().bold(),
        " Refresh ".into(),
        "<R>".cyan().bold(),
        " Quit ".into(),
        "<Q> ".cyan().bold(),
    ]));
    let block = Block::default()
        .title(title.alignment(Alignment::Center))
        .title(
            instructions
                .alignment(Alignment::Center)
                .position(Position::Bottom),
        )
        .borders(Borders::ALL);

    let area = frame.size();
    if ports.is_empty() {
        let hint = Paragraph::new("No serial ports found. Plug in the CAN bridge and press R.")
            .style(Style::default().fg(Color::Yellow))
            .alignment(Alignment::Center)
            .block(block);
        frame.render_widget(hint, area);
        return;
    }

    let items = ports.iter().map(|p| {
        let style = if p.likely_bridge() {
            Style::default().fg(Color::White)
        } else {
            Style::default().fg(Color::DarkGray)
        };
        ListItem::new(p.label()).style(style)
    });
    let list = List::new(items)
        .highlight_symbol(">>")
        .highlight_style(Style::default().fg(Color::Cyan))
        .block(block);
    frame.render_stateful_widget(list, area, list_state);
}

/// The port to use: `preferred` if given, otherwise whatever the operator
/// picks from the ports present on this machine.
pub fn resolve_port(preferred: Option<String>, baud_rate: u32) -> Result<Option<String>, GuiError> {
    if let Some(port) = preferred {
        return Ok(Some(port));
    }
    let port = device_selector(baud_rate)?;
    if port.is_none() {
        info!("No port selected");
    }
    Ok(port.map(|p| p.to_string_lossy().into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::backend::TestBackend;

    fn entry(path: &str, product: Option<&str>) -> PortEntry {
        let path = PathBuf::from(path);
        PortEntry {
            kind: PortKind::of(&path),
            product: product.map(str::to_owned),
            path,
        }
    }

    fn screen(ports: &[PortEntry]) -> String {
        let mut terminal = Terminal::new(TestBackend::new(90, 8)).unwrap();
        let mut state = ListState::default().with_selected((!ports.is_empty()).then_some(0));
        terminal
            .draw(|f| port_list(f, ports, 115200, &mut state))
            .unwrap();
        terminal
            .backend()
            .buffer()
            .content
            .iter()
            .map(|c| c.symbol())
            .collect()
    }

    #[test]
    fn kinds_from_port_names() {
        let kind = |p: &str| PortKind::of(Path::new(p));
        assert_eq!(kind("/dev/ttyACM0"), Some(PortKind::UsbCdc));
        assert_eq!(kind("/dev/cu.usbmodem14101"), Some(PortKind::UsbCdc));
        assert_eq!(kind("/dev/ttyUSB1"), Some(PortKind::UsbSerial));
        assert_eq!(kind("/dev/ttyS0"), Some(PortKind::Onboard));
        assert_eq!(kind("COM7"), Some(PortKind::Com));
        assert_eq!(kind("/dev/pts/3"), None);
    }

    #[test]
    fn labels_carry_the_description() {
        assert_eq!(
            entry("/dev/ttyACM0", Some("Arduino (www.arduino.cc) Uno R3")).label(),
            "/dev/ttyACM0 - Arduino (www.arduino.cc) Uno R3 (USB CDC board)"
        );
        assert_eq!(entry("/dev/ttyUSB0", None).label(), "/dev/ttyUSB0 - USB serial adapter");
        assert_eq!(entry("/dev/pts/3", None).label(), "/dev/pts/3");
    }

    #[test]
    fn bridges_are_listed_first() {
        let ports = describe_ports(vec![
            PathBuf::from("/dev/ttyS90"),
            PathBuf::from("/dev/ttyS91"),
            PathBuf::from("/dev/ttyACM90"),
        ]);
        assert_eq!(ports[0].path, PathBuf::from("/dev/ttyACM90"));
        assert!(ports[0].likely_bridge());
        assert_eq!(ports[1].path, PathBuf::from("/dev/ttyS90"));
    }

    #[test]
    fn selector_shows_baud_and_ports() {
        let text = screen(&[entry("/dev/ttyUSB0", Some("FTDI FT232R USB UART"))]);
        assert!(text.contains("TP2 CAN Monitor: bridge port @ 115200 bps"));
        assert!(text.contains(">>/dev/ttyUSB0 - FTDI FT232R USB UART (USB serial adapter)"));
        assert!(text.contains("Refresh"));
    }

    #[test]
    fn empty_list_asks_for_the_bridge() {
        let text = screen(&[]);
        assert!(text.contains("No serial ports found"));
    }
}
