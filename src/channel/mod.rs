use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{CdcError, Result};

pub mod packet;

const CONNECT_TIMEOUT: u64 = 5 * 1000;
const SO_TIMEOUT: u64 = 30 * 1000;

pub trait SocketChannel: Send {
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;
    fn close(&mut self);
}

pub struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    pub fn connect(host: &str, port: u16) -> Result<TcpChannel> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| CdcError::Net(format!("cannot resolve {}:{}", host, port)))?;
        let stream = TcpStream::connect_timeout(&addr, Duration::from_millis(CONNECT_TIMEOUT))?;
        stream.set_read_timeout(Some(Duration::from_millis(SO_TIMEOUT)))?;
        stream.set_nodelay(true)?;
        Ok(TcpChannel { stream })
    }
}

impl SocketChannel for TcpChannel {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf)?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf)?;
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
