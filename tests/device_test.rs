use std::collections::BTreeSet;
use std::io::Cursor;
use std::time::Duration;

use anyhow::{bail, Result};
use fbtool::device::{
    self, Clock, DeviceRegistry, Discovery, DiscoveryState, NetworkSerial, Transport,
    TransportFactory, UsbInterfaceInfo,
};
use tempfile::TempDir;

/// Answers USB probes after a number of misses and accepts connections to
/// a fixed set of network serials.
#[derive(Default)]
struct FakeFactory {
    usb_misses: u32,
    usb_probes: u32,
    online: BTreeSet<String>,
    connects: Vec<String>,
}

impl TransportFactory for FakeFactory {
    fn usb_open(&mut self, _serial: Option<&str>) -> Option<Box<dyn Transport>> {
        self.usb_probes += 1;
        if self.usb_probes > self.usb_misses {
            Some(Box::new(Cursor::new(Vec::new())))
        } else {
            None
        }
    }

    fn connect(&mut self, serial: &NetworkSerial) -> Result<Box<dyn Transport>> {
        let name = serial.to_string();
        self.connects.push(name.clone());
        if !self.online.contains(&name) {
            bail!("connection refused: {name}");
        }
        Ok(Box::new(Cursor::new(Vec::new())))
    }
}

#[derive(Default)]
struct FakeClock {
    slept: Vec<Duration>,
}

impl Clock for &mut FakeClock {
    fn sleep(&mut self, duration: Duration) {
        self.slept.push(duration);
    }
}

fn offline_usb() -> FakeFactory {
    FakeFactory {
        usb_misses: u32::MAX,
        ..Default::default()
    }
}

#[test]
fn waits_with_backoff_until_usb_answers() {
    let mut clock = FakeClock::default();
    let factory = FakeFactory {
        usb_misses: 2,
        ..Default::default()
    };
    let mut discovery =
        Discovery::new(factory, &mut clock).with_backoff(Duration::from_millis(250));
    assert_eq!(discovery.state(), DiscoveryState::Disconnected);

    discovery.open(None).expect("device");
    assert_eq!(discovery.state(), DiscoveryState::Connected);
    assert_eq!(discovery.factory_mut().usb_probes, 3);
    drop(discovery);
    assert_eq!(clock.slept, [Duration::from_millis(250); 2]);
}

#[test]
fn gives_up_after_max_attempts() {
    let mut clock = FakeClock::default();
    let mut discovery = Discovery::new(offline_usb(), &mut clock).with_max_attempts(3);

    let err = discovery.open(Some("0123456789")).unwrap_err();
    assert!(err.to_string().contains("3 attempts"), "{err}");
    assert_eq!(discovery.state(), DiscoveryState::Disconnected);
    assert_eq!(discovery.factory_mut().usb_probes, 3);
    drop(discovery);
    assert_eq!(clock.slept.len(), 2);
}

#[test]
fn malformed_network_serials_are_fatal() {
    let mut clock = FakeClock::default();
    let mut discovery = Discovery::new(offline_usb(), &mut clock);
    assert!(discovery.open(Some("tcp:host:0")).is_err());
    assert_eq!(discovery.factory_mut().usb_probes, 0);
}

#[test]
fn registry_devices_back_up_usb() {
    let temp = TempDir::new().expect("temp dir");
    let registry = DeviceRegistry::new(temp.path().join("fastboot"));
    registry.add("tcp:10.0.0.2").expect("add");
    registry.add("udp:10.0.0.3:6000").expect("add");

    let mut clock = FakeClock::default();
    let mut factory = offline_usb();
    factory.online.insert("udp:10.0.0.3:6000".to_string());
    let mut discovery = Discovery::new(factory, &mut clock)
        .with_registry(&registry)
        .with_max_attempts(1);

    discovery.open(None).expect("registered device");
    assert_eq!(discovery.state(), DiscoveryState::Connected);
    assert_eq!(
        discovery.factory_mut().connects,
        ["tcp:10.0.0.2:5554", "udp:10.0.0.3:6000"]
    );
}

#[test]
fn connect_remembers_and_disconnect_forgets() {
    let temp = TempDir::new().expect("temp dir");
    let registry = DeviceRegistry::new(temp.path());
    let mut clock = FakeClock::default();
    let mut factory = offline_usb();
    factory.online.insert("tcp:phone.lan:5554".to_string());
    let mut discovery = Discovery::new(factory, &mut clock);

    assert!(device::connect(&mut discovery, &registry, "0123456789").is_err());
    assert!(device::connect(&mut discovery, &registry, "tcp:tablet.lan").is_err());
    device::connect(&mut discovery, &registry, "tcp:phone.lan").expect("connect");
    assert_eq!(
        registry.devices().expect("devices").into_iter().collect::<Vec<_>>(),
        ["tcp:phone.lan"]
    );

    registry.add("udp:tablet.lan").expect("add");
    device::disconnect(&registry, Some("tcp:phone.lan")).expect("disconnect one");
    device::disconnect(&registry, Some("tcp:phone.lan")).expect("already gone");
    assert_eq!(registry.devices().expect("devices").len(), 1);

    device::disconnect(&registry, None).expect("disconnect all");
    assert!(registry.devices().expect("devices").is_empty());
    assert!(!registry.exists());
}

#[test]
fn listing_probes_registered_devices() {
    let temp = TempDir::new().expect("temp dir");
    let registry = DeviceRegistry::new(temp.path());
    registry.add("tcp:10.0.0.2").expect("add");
    registry.add("tcp:10.0.0.9").expect("add");

    let usb = [
        UsbInterfaceInfo {
            serial: "HT7A1JT00123".to_string(),
            device_path: "usb:1-4".to_string(),
            class: 0xff,
            subclass: 0x42,
            protocol: 0x03,
            interface_number: 0,
        },
        UsbInterfaceInfo {
            serial: "ADB0001".to_string(),
            device_path: "usb:1-5".to_string(),
            class: 0xff,
            subclass: 0x42,
            protocol: 0x01,
            interface_number: 1,
        },
    ];
    let mut factory = offline_usb();
    factory.online.insert("tcp:10.0.0.9:5554".to_string());

    let rows = device::list_devices(&mut factory, &usb, Some(&registry)).expect("list");
    let lines: Vec<String> = rows.iter().map(|row| row.format(false)).collect();
    assert_eq!(
        lines,
        [
            "HT7A1JT00123\tfastboot",
            "tcp:10.0.0.2\toffline",
            "tcp:10.0.0.9\tfastboot",
        ]
    );
    assert_eq!(rows[0].details.as_deref(), Some("usb:1-4"));
}
