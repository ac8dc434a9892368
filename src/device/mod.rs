//! Finding a device to talk to.
//!
//! A serial is either a network address (`tcp:host[:port]`,
//! `udp:host[:port]`) or a USB serial number / device path. With no serial,
//! attached USB devices are tried first, then every device in the
//! [`DeviceRegistry`].

pub mod net;
pub mod registry;
pub mod usb;

use anyhow::{bail, Result};
use serde::Serialize;
use std::{
    fmt,
    io::{Read, Write},
    thread,
    time::Duration,
};
use thiserror::Error;

pub use registry::DeviceRegistry;
pub use usb::{UsbInterfaceInfo, UsbTransport};

pub const DEFAULT_PORT: u16 = 5554;

/// Byte pipe to a device.
pub trait Transport: Read + Write {}

impl<T: Read + Write> Transport for T {}

impl fmt::Debug for dyn Transport + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Transport")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkSerialError {
    #[error(
        "protocol prefix ('tcp:' or 'udp:') is missed: {0}. Expected address format:\n<protocol>:<address>:<port> (tcp:localhost:5554)"
    )]
    WrongPrefix(String),
    #[error("invalid network address '{address}': {reason}")]
    WrongAddress { address: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSerial {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
}

impl NetworkSerial {
    pub fn parse(serial: &str) -> Result<Self, NetworkSerialError> {
        let (protocol, address) = if let Some(rest) = serial.strip_prefix("tcp:") {
            (Protocol::Tcp, rest)
        } else if let Some(rest) = serial.strip_prefix("udp:") {
            (Protocol::Udp, rest)
        } else {
            return Err(NetworkSerialError::WrongPrefix(serial.to_string()));
        };
        let (host, port) =
            parse_net_address(address, DEFAULT_PORT).map_err(|reason| {
                NetworkSerialError::WrongAddress {
                    address: address.to_string(),
                    reason,
                }
            })?;
        Ok(Self {
            protocol,
            host,
            port,
        })
    }
}

impl fmt::Display for NetworkSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        if self.host.contains(':') {
            write!(f, "{proto}:[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{proto}:{}:{}", self.host, self.port)
        }
    }
}

/// `[v6]:port`, `host:port`, or a bare host (including unbracketed IPv6).
fn parse_net_address(address: &str, default_port: u16) -> Result<(String, u16), String> {
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            return Err("missing ']'".to_string());
        };
        let tail = &rest[end + 1..];
        let port = if tail.is_empty() {
            None
        } else if let Some(port) = tail.strip_prefix(':') {
            Some(port)
        } else {
            return Err(format!("unexpected '{tail}' after host"));
        };
        (&rest[..end], port)
    } else if address.matches(':').count() == 1 {
        let (host, port) = address.split_once(':').unwrap_or((address, ""));
        (host, Some(port))
    } else {
        (address, None)
    };

    if host.is_empty() {
        return Err("no host".to_string());
    }
    let port = match port {
        None => default_port,
        Some(p) => match p.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => return Err(format!("invalid port '{p}'")),
        },
    };
    Ok((host.to_string(), port))
}

/// How transports get opened. Swapped out in tests.
pub trait TransportFactory {
    /// First USB fastboot interface matching `serial`, if any.
    fn usb_open(&mut self, serial: Option<&str>) -> Option<Box<dyn Transport>>;

    fn connect(&mut self, serial: &NetworkSerial) -> Result<Box<dyn Transport>>;
}

/// Real USB and sockets.
pub struct SystemTransportFactory {
    pub timeout: Duration,
}

impl TransportFactory for SystemTransportFactory {
    fn usb_open(&mut self, serial: Option<&str>) -> Option<Box<dyn Transport>> {
        match UsbTransport::open(serial) {
            Ok(Some(transport)) => {
                info!("using {} ({})", transport.info().display_serial(), transport.info().device_path);
                Some(Box::new(transport))
            }
            Ok(None) => None,
            Err(e) => {
                debug!("USB open failed: {e:#}");
                None
            }
        }
    }

    fn connect(&mut self, serial: &NetworkSerial) -> Result<Box<dyn Transport>> {
        net::connect(serial, self.timeout)
    }
}

pub trait Clock {
    fn sleep(&mut self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Disconnected,
    Probing,
    Connected,
}

pub struct Discovery<'r, F, C> {
    factory: F,
    clock: C,
    registry: Option<&'r DeviceRegistry>,
    backoff: Duration,
    max_attempts: Option<u32>,
    state: DiscoveryState,
}

impl<'r, F: TransportFactory, C: Clock> Discovery<'r, F, C> {
    pub fn new(factory: F, clock: C) -> Self {
        Self {
            factory,
            clock,
            registry: None,
            backoff: Duration::from_secs(1),
            max_attempts: None,
            state: DiscoveryState::Disconnected,
        }
    }

    pub fn with_registry(mut self, registry: &'r DeviceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Give up after this many probe rounds instead of waiting forever.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn factory_mut(&mut self) -> &mut F {
        &mut self.factory
    }

    /// Waits for the device named by `serial`, or for any device.
    pub fn open(&mut self, serial: Option<&str>) -> Result<Box<dyn Transport>> {
        let found = match serial {
            Some(serial) => self.open_serial(Some(serial), true, true)?,
            None => self.open_any()?,
        };
        match found {
            Some(transport) => Ok(transport),
            None => bail!("no device found"),
        }
    }

    /// One device by serial. Without `wait` a single probe is made and
    /// `Ok(None)` reports a miss.
    pub fn open_serial(
        &mut self,
        serial: Option<&str>,
        wait: bool,
        announce: bool,
    ) -> Result<Option<Box<dyn Transport>>> {
        let network = match serial.map(NetworkSerial::parse) {
            Some(Ok(parsed)) => Some(parsed),
            Some(Err(NetworkSerialError::WrongPrefix(_))) | None => None,
            Some(Err(e)) => return Err(e.into()),
        };

        let mut announced = !announce;
        let mut attempts = 0;
        loop {
            self.state = DiscoveryState::Probing;
            let transport = match &network {
                Some(net) => match self.factory.connect(net) {
                    Ok(transport) => Some(transport),
                    Err(e) => {
                        if announce {
                            error!("error: {e:#}");
                        }
                        None
                    }
                },
                None => self.factory.usb_open(serial),
            };
            if let Some(transport) = transport {
                self.state = DiscoveryState::Connected;
                return Ok(Some(transport));
            }
            if !wait {
                self.state = DiscoveryState::Disconnected;
                return Ok(None);
            }
            self.wait_round(&mut announced, serial.unwrap_or("any device"), &mut attempts)?;
        }
    }

    fn open_any(&mut self) -> Result<Option<Box<dyn Transport>>> {
        let mut announced = false;
        let mut attempts = 0;
        loop {
            self.state = DiscoveryState::Probing;
            let mut transport = self.factory.usb_open(None);
            if transport.is_none() {
                if let Some(registry) = self.registry {
                    for serial in registry.devices()? {
                        if let Some(t) = self.open_serial(Some(&serial), false, false)? {
                            transport = Some(t);
                        }
                    }
                }
            }
            if let Some(transport) = transport {
                self.state = DiscoveryState::Connected;
                return Ok(Some(transport));
            }
            self.wait_round(&mut announced, "any device", &mut attempts)?;
        }
    }

    fn wait_round(&mut self, announced: &mut bool, what: &str, attempts: &mut u32) -> Result<()> {
        *attempts += 1;
        if let Some(max) = self.max_attempts {
            if *attempts >= max {
                self.state = DiscoveryState::Disconnected;
                bail!("no device found after {max} attempts");
            }
        }
        if !*announced {
            error!("< waiting for {what} >");
            *announced = true;
        }
        self.clock.sleep(self.backoff);
        Ok(())
    }
}

/// One row of `devices` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceListing {
    pub serial: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl DeviceListing {
    pub fn format(&self, long: bool) -> String {
        if long {
            let mut line = format!("{:<22} {}", self.serial, self.status);
            if let Some(details) = &self.details {
                line.push(' ');
                line.push_str(details);
            }
            line
        } else {
            format!("{}\t{}", self.serial, self.status)
        }
    }
}

/// USB fastboot devices followed by registered network devices, the latter
/// probed to tell `fastboot` from `offline`.
pub fn list_devices<F: TransportFactory>(
    factory: &mut F,
    usb: &[UsbInterfaceInfo],
    registry: Option<&DeviceRegistry>,
) -> Result<Vec<DeviceListing>> {
    let mut rows: Vec<DeviceListing> = usb
        .iter()
        .filter(|info| info.is_fastboot())
        .map(|info| DeviceListing {
            serial: info.display_serial().to_string(),
            status: "fastboot".to_string(),
            details: Some(info.device_path.clone()),
        })
        .collect();

    if let Some(registry) = registry {
        for serial in registry.devices()? {
            let online = match NetworkSerial::parse(&serial) {
                Ok(net) => factory.connect(&net).is_ok(),
                Err(_) => false,
            };
            rows.push(DeviceListing {
                serial,
                status: if online { "fastboot" } else { "offline" }.to_string(),
                details: None,
            });
        }
    }
    Ok(rows)
}

/// Probes a network device once and remembers it.
pub fn connect<F: TransportFactory, C: Clock>(
    discovery: &mut Discovery<'_, F, C>,
    registry: &DeviceRegistry,
    serial: &str,
) -> Result<()> {
    NetworkSerial::parse(serial)?;
    if discovery.open_serial(Some(serial), false, true)?.is_none() {
        bail!("failed to connect to {serial}");
    }
    registry.add(serial)?;
    info!("connected to {serial}");
    Ok(())
}

/// Forgets one network device, or all of them.
pub fn disconnect(registry: &DeviceRegistry, serial: Option<&str>) -> Result<()> {
    match serial {
        None => {
            let lock = registry.lock()?;
            registry.clear(&lock)?;
            info!("disconnected everything");
        }
        Some(serial) => {
            if registry.remove(serial)? {
                info!("disconnected {serial}");
            } else {
                warn!("{serial} was not connected");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_network_serials() {
        let s = NetworkSerial::parse("tcp:192.168.1.5").unwrap();
        assert_eq!(s.protocol, Protocol::Tcp);
        assert_eq!(s.host, "192.168.1.5");
        assert_eq!(s.port, DEFAULT_PORT);

        let s = NetworkSerial::parse("udp:phone.lan:4000").unwrap();
        assert_eq!(s.protocol, Protocol::Udp);
        assert_eq!((s.host.as_str(), s.port), ("phone.lan", 4000));

        let s = NetworkSerial::parse("tcp:[fe80::1]:7000").unwrap();
        assert_eq!((s.host.as_str(), s.port), ("fe80::1", 7000));
        assert_eq!(s.to_string(), "tcp:[fe80::1]:7000");

        let s = NetworkSerial::parse("tcp:fe80::1").unwrap();
        assert_eq!((s.host.as_str(), s.port), ("fe80::1", DEFAULT_PORT));
    }

    #[test]
    fn classifies_bad_serials() {
        assert!(matches!(
            NetworkSerial::parse("0123456789ABCDEF"),
            Err(NetworkSerialError::WrongPrefix(_))
        ));
        assert!(matches!(
            NetworkSerial::parse("tcp:"),
            Err(NetworkSerialError::WrongAddress { .. })
        ));
        assert!(matches!(
            NetworkSerial::parse("tcp:host:0"),
            Err(NetworkSerialError::WrongAddress { .. })
        ));
        assert!(matches!(
            NetworkSerial::parse("udp:host:99999"),
            Err(NetworkSerialError::WrongAddress { .. })
        ));
    }

    #[test]
    fn listing_formats() {
        let row = DeviceListing {
            serial: "ABC".to_string(),
            status: "fastboot".to_string(),
            details: Some("usb:1-2".to_string()),
        };
        assert_eq!(row.format(false), "ABC\tfastboot");
        assert_eq!(row.format(true), format!("{:<22} fastboot usb:1-2", "ABC"));
    }
}
