use anyhow::{bail, Context, Result};
use std::{
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs, UdpSocket},
    time::Duration,
};

use super::{NetworkSerial, Protocol};

const UDP_ID_ERROR: u8 = 0x00;
const UDP_ID_QUERY: u8 = 0x01;
const UDP_HEADER_LEN: usize = 4;

#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl Read for UdpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }
}

impl Write for UdpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn connect_tcp(serial: &NetworkSerial, timeout: Duration) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in resolve(serial)? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(e).with_context(|| format!("failed to connect to {serial}")),
        None => bail!("{} did not resolve to any address", serial.host),
    }
}

pub fn connect_udp(serial: &NetworkSerial, timeout: Duration) -> Result<UdpTransport> {
    let Some(addr) = resolve(serial)?.next() else {
        bail!("{} did not resolve to any address", serial.host);
    };
    let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind)?;
    socket.set_read_timeout(Some(timeout))?;
    socket
        .connect(addr)
        .with_context(|| format!("failed to connect to {serial}"))?;
    let sequence = query_udp(&socket).with_context(|| format!("{serial} did not answer"))?;
    debug!("{serial} answered query, next sequence {sequence}");
    Ok(UdpTransport { socket })
}

/// Sends a fastboot UDP query packet and returns the device's next
/// sequence number.
fn query_udp(socket: &UdpSocket) -> Result<u16> {
    socket.send(&[UDP_ID_QUERY, 0, 0, 0])?;
    let mut reply = [0u8; 64];
    let len = socket.recv(&mut reply)?;
    if len < UDP_HEADER_LEN {
        bail!("short reply of {len} bytes");
    }
    match reply[0] {
        UDP_ID_QUERY if len >= UDP_HEADER_LEN + 2 => {
            Ok(u16::from_be_bytes([reply[UDP_HEADER_LEN], reply[UDP_HEADER_LEN + 1]]))
        }
        UDP_ID_ERROR => bail!(
            "device error: {}",
            String::from_utf8_lossy(&reply[UDP_HEADER_LEN..len])
        ),
        id => bail!("unexpected reply id {id:#04x} ({len} bytes)"),
    }
}

fn resolve(serial: &NetworkSerial) -> Result<std::vec::IntoIter<std::net::SocketAddr>> {
    (serial.host.as_str(), serial.port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {}", serial.host))
}

/// Opens whichever socket kind the serial names.
pub fn connect(serial: &NetworkSerial, timeout: Duration) -> Result<Box<dyn super::Transport>> {
    Ok(match serial.protocol {
        Protocol::Tcp => Box::new(connect_tcp(serial, timeout)?),
        Protocol::Udp => Box::new(connect_udp(serial, timeout)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn udp_serial(socket: &UdpSocket) -> NetworkSerial {
        NetworkSerial {
            protocol: Protocol::Udp,
            host: "127.0.0.1".to_string(),
            port: socket.local_addr().unwrap().port(),
        }
    }

    #[test]
    fn udp_devices_must_answer_a_query() {
        let device = UdpSocket::bind("127.0.0.1:0").unwrap();
        let serial = udp_serial(&device);
        let responder = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (len, peer) = device.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..len], &[UDP_ID_QUERY, 0, 0, 0]);
            device
                .send_to(&[UDP_ID_QUERY, 0, 0, 0, 0x12, 0x34], peer)
                .unwrap();
        });
        connect_udp(&serial, Duration::from_secs(2)).unwrap();
        responder.join().unwrap();
    }

    #[test]
    fn silent_udp_peers_are_not_devices() {
        let device = UdpSocket::bind("127.0.0.1:0").unwrap();
        let serial = udp_serial(&device);
        assert!(connect_udp(&serial, Duration::from_millis(100)).is_err());
    }

    #[test]
    fn udp_error_replies_are_reported() {
        let device = UdpSocket::bind("127.0.0.1:0").unwrap();
        let serial = udp_serial(&device);
        let responder = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (_, peer) = device.recv_from(&mut buf).unwrap();
            let mut reply = vec![UDP_ID_ERROR, 0, 0, 0];
            reply.extend_from_slice(b"busy");
            device.send_to(&reply, peer).unwrap();
        });
        let err = connect_udp(&serial, Duration::from_secs(2)).unwrap_err();
        responder.join().unwrap();
        assert!(format!("{err:#}").contains("busy"), "{err:#}");
    }
}
