use anyhow::{Context, Result};
use futures_lite::future::block_on;
use nusb::transfer::{Direction, Queue, RequestBuffer};
use serde::Serialize;
use std::io::{self, Read, Write};

pub const FASTBOOT_CLASS: u8 = 0xff;
pub const FASTBOOT_SUBCLASS: u8 = 0x42;
pub const FASTBOOT_PROTOCOL: u8 = 0x03;

const READ_CHUNK: usize = 16 * 1024;

/// One USB interface as seen during enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsbInterfaceInfo {
    pub serial: String,
    /// `usb:<bus>-<address>`
    pub device_path: String,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub interface_number: u8,
}

impl UsbInterfaceInfo {
    pub fn is_fastboot(&self) -> bool {
        self.class == FASTBOOT_CLASS
            && self.subclass == FASTBOOT_SUBCLASS
            && self.protocol == FASTBOOT_PROTOCOL
    }

    /// A fastboot interface whose serial number or device path equals
    /// `serial`; any fastboot interface when no serial is given.
    pub fn matches(&self, serial: Option<&str>) -> bool {
        if !self.is_fastboot() {
            return false;
        }
        match serial {
            None => true,
            Some(s) => s == self.serial || s == self.device_path,
        }
    }

    /// Serial shown in listings; devices without one still get a row.
    pub fn display_serial(&self) -> &str {
        if self.serial.is_empty() {
            "????????????"
        } else {
            &self.serial
        }
    }
}

fn enumerate() -> Result<Vec<(nusb::DeviceInfo, UsbInterfaceInfo)>> {
    let mut found = Vec::new();
    for dev in nusb::list_devices().context("failed to enumerate USB devices")? {
        let serial = dev.serial_number().unwrap_or_default().to_string();
        let device_path = format!("usb:{}-{}", dev.bus_number(), dev.device_address());
        for iface in dev.interfaces() {
            found.push((
                dev.clone(),
                UsbInterfaceInfo {
                    serial: serial.clone(),
                    device_path: device_path.clone(),
                    class: iface.class(),
                    subclass: iface.subclass(),
                    protocol: iface.protocol(),
                    interface_number: iface.interface_number(),
                },
            ));
        }
    }
    Ok(found)
}

/// Every fastboot interface currently attached.
pub fn list_fastboot_devices() -> Result<Vec<UsbInterfaceInfo>> {
    Ok(enumerate()?
        .into_iter()
        .map(|(_, info)| info)
        .filter(|info| info.is_fastboot())
        .collect())
}

/// Bulk in/out pipe to a claimed fastboot interface.
pub struct UsbTransport {
    _device: nusb::Device,
    interface: nusb::Interface,
    in_ep: u8,
    out_ep: u8,
    info: UsbInterfaceInfo,
    pending: Vec<u8>,
    offset: usize,
}

impl UsbTransport {
    /// Opens the first fastboot interface matching `serial`. `Ok(None)`
    /// means nothing matched.
    pub fn open(serial: Option<&str>) -> Result<Option<Self>> {
        for (dev, info) in enumerate()? {
            if !info.matches(serial) {
                continue;
            }
            let device = match dev.open() {
                Ok(device) => device,
                Err(e) => {
                    debug!("cannot open {}: {e}", info.device_path);
                    continue;
                }
            };
            let Some((in_ep, out_ep)) = bulk_endpoints(&device, info.interface_number) else {
                debug!("{} has no bulk endpoint pair", info.device_path);
                continue;
            };
            let interface = device
                .claim_interface(info.interface_number)
                .with_context(|| format!("failed to claim interface on {}", info.device_path))?;
            debug!(
                "opened {} interface {} (in {in_ep:#04x}, out {out_ep:#04x})",
                info.device_path, info.interface_number
            );
            return Ok(Some(Self {
                _device: device,
                interface,
                in_ep,
                out_ep,
                info,
                pending: Vec::new(),
                offset: 0,
            }));
        }
        Ok(None)
    }

    pub fn info(&self) -> &UsbInterfaceInfo {
        &self.info
    }
}

fn bulk_endpoints(device: &nusb::Device, interface_number: u8) -> Option<(u8, u8)> {
    let config = device.active_configuration().ok()?;
    let alt = config
        .interface_alt_settings()
        .find(|alt| alt.interface_number() == interface_number)?;
    let mut in_ep = None;
    let mut out_ep = None;
    for ep in alt.endpoints() {
        match ep.direction() {
            Direction::In => {
                in_ep.get_or_insert(ep.address());
            }
            Direction::Out => {
                out_ep.get_or_insert(ep.address());
            }
        }
    }
    Some((in_ep?, out_ep?))
}

impl Read for UsbTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset >= self.pending.len() {
            let mut queue: Queue<RequestBuffer> = self.interface.bulk_in_queue(self.in_ep);
            queue.submit(RequestBuffer::new(READ_CHUNK));
            let completion = block_on(queue.next_complete());
            completion.status.map_err(io::Error::other)?;
            trace!("USB read {} bytes", completion.data.len());
            self.pending = completion.data;
            self.offset = 0;
        }
        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

impl Write for UsbTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut queue: Queue<Vec<u8>> = self.interface.bulk_out_queue(self.out_ep);
        queue.submit(buf.to_vec());
        let completion = block_on(queue.next_complete());
        completion.status.map_err(io::Error::other)?;
        trace!("USB write {} bytes", buf.len());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(serial: &str, class: u8, subclass: u8, protocol: u8) -> UsbInterfaceInfo {
        UsbInterfaceInfo {
            serial: serial.to_string(),
            device_path: "usb:1-4".to_string(),
            class,
            subclass,
            protocol,
            interface_number: 0,
        }
    }

    #[test]
    fn matches_fastboot_interfaces_only() {
        let fb = iface("ABC123", 0xff, 0x42, 0x03);
        assert!(fb.matches(None));
        assert!(fb.matches(Some("ABC123")));
        assert!(fb.matches(Some("usb:1-4")));
        assert!(!fb.matches(Some("XYZ")));

        assert!(!iface("ABC123", 0xff, 0x42, 0x01).matches(None));
        assert!(!iface("ABC123", 0x08, 0x42, 0x03).matches(Some("ABC123")));
    }

    #[test]
    fn unnamed_devices_still_list() {
        assert_eq!(iface("", 0xff, 0x42, 0x03).display_serial(), "????????????");
    }
}
