use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::binlog::buffer::LogBuffer;
use crate::binlog::{BinlogEvent, LogDecoder};
use crate::channel::packet::{read_packet, write_packet};
use crate::channel::{SocketChannel, TcpChannel};
use crate::error::{CdcError, Result};

pub mod packets;
pub mod resultset;
pub mod scramble;

use packets::*;
use resultset::{parse_row, FieldPacket, ResultSetPacket};

/// Connection settings, loaded from the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct MysqlSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_charset")]
    pub charset: String,
}

fn default_port() -> u16 {
    3306
}

fn default_charset() -> String {
    "utf8".to_string()
}

fn charset_number(charset: &str) -> u8 {
    match charset {
        "utf8" | "utf8mb3" => 33,
        "utf8mb4" => 45,
        "latin1" => 8,
        _ => 33,
    }
}

/// A plain MySQL client connection, just capable enough for this
/// pipeline: handshake with `mysql_native_password`, text-protocol
/// queries and the binlog dump command.
pub struct MysqlConnector {
    settings: MysqlSettings,
    channel: Option<Box<dyn SocketChannel>>,
}

impl MysqlConnector {
    pub fn new(settings: MysqlSettings) -> MysqlConnector {
        MysqlConnector {
            settings,
            channel: None,
        }
    }

    pub fn settings(&self) -> &MysqlSettings {
        &self.settings
    }

    /// A second connection with the same settings, for metadata
    /// queries while the first one is dumping the binlog.
    pub fn fork(&self) -> MysqlConnector {
        MysqlConnector::new(self.settings.clone())
    }

    pub fn connect(&mut self) -> Result<()> {
        if self.channel.is_some() {
            debug!("the connection is already established");
            return Ok(());
        }
        let mut channel = TcpChannel::connect(&self.settings.host, self.settings.port)?;
        self.negotiate(&mut channel)?;
        info!(
            host = %self.settings.host,
            port = self.settings.port,
            "connected to mysql"
        );
        self.channel = Some(Box::new(channel));
        Ok(())
    }

    fn negotiate(&mut self, channel: &mut TcpChannel) -> Result<()> {
        let (body, seq) = read_packet(channel)?;
        match body.first().copied() {
            Some(PACKET_ERR) => return Err(ErrorPacket::from_bytes(&body)?.into_error()),
            Some(PACKET_EOF) => {
                return Err(CdcError::Net(
                    "unexpected EOF packet at handshake phase".into(),
                ))
            }
            Some(_) => {}
            None => return Err(CdcError::Net("empty handshake packet".into())),
        }
        let handshake = HandshakeInitializationPacket::from_bytes(&body)?;
        if handshake.protocol_version != DEFAULT_PROTOCOL_VERSION {
            return Err(CdcError::Net(format!(
                "unsupported protocol version {}",
                handshake.protocol_version
            )));
        }

        let auth = ClientAuthenticationPacket {
            username: &self.settings.user,
            password: &self.settings.password,
            charset_number: charset_number(&self.settings.charset),
            seed: &handshake.seed,
            auth_plugin_name: "mysql_native_password",
        };
        write_packet(channel, seq.wrapping_add(1), &auth.to_bytes())?;

        let (body, seq) = read_packet(channel)?;
        match body.first().copied() {
            Some(PACKET_OK) => Ok(()),
            Some(PACKET_ERR) => Err(ErrorPacket::from_bytes(&body)?.into_error()),
            Some(PACKET_EOF) => {
                // auth switch: the server picked another plugin
                let switch = AuthSwitchRequestPacket::from_bytes(&body)?;
                if switch.auth_name != "mysql_native_password" {
                    return Err(CdcError::Net(format!(
                        "unsupported auth plugin {}",
                        switch.auth_name
                    )));
                }
                let scrambled =
                    scramble::scramble411(self.settings.password.as_bytes(), &switch.auth_data);
                write_packet(channel, seq.wrapping_add(1), &scrambled)?;
                let (body, _) = read_packet(channel)?;
                match body.first().copied() {
                    Some(PACKET_OK) => Ok(()),
                    Some(PACKET_ERR) => Err(ErrorPacket::from_bytes(&body)?.into_error()),
                    _ => Err(CdcError::Net("unexpected packet after auth switch".into())),
                }
            }
            _ => Err(CdcError::Net("unexpected packet during handshake".into())),
        }
    }

    fn channel(&mut self) -> Result<&mut Box<dyn SocketChannel>> {
        self.channel
            .as_mut()
            .ok_or_else(|| CdcError::Net("not connected".into()))
    }

    /// Runs one statement. OK-only responses (SET and friends) come
    /// back as an empty result set.
    pub fn query(&mut self, sql: &str) -> Result<ResultSetPacket> {
        let command = QueryCommandPacket::new(sql).to_bytes();
        let ch = self.channel()?;
        write_packet(ch.as_mut(), 0, &command)?;

        let (body, _) = read_packet(ch.as_mut())?;
        match body.first().copied() {
            Some(PACKET_ERR) => return Err(ErrorPacket::from_bytes(&body)?.into_error()),
            Some(PACKET_OK) => return Ok(ResultSetPacket::new()),
            Some(_) => {}
            None => return Err(CdcError::Net("empty query response".into())),
        }

        let column_count = LogBuffer::new(&body).get_packed_num()? as usize;
        let mut result = ResultSetPacket::new();
        for _ in 0..column_count {
            let (body, _) = read_packet(ch.as_mut())?;
            result.columns.push(FieldPacket::from_bytes(&body)?.name);
        }
        // EOF after the column definitions
        let (body, _) = read_packet(ch.as_mut())?;
        if body.first().copied() != Some(PACKET_EOF) {
            return Err(CdcError::Net("missing EOF after field packets".into()));
        }
        loop {
            let (body, _) = read_packet(ch.as_mut())?;
            match body.first().copied() {
                Some(PACKET_EOF) if body.len() < 9 => break,
                Some(PACKET_ERR) => return Err(ErrorPacket::from_bytes(&body)?.into_error()),
                _ => result.rows.push(parse_row(&body, column_count)?),
            }
        }
        Ok(result)
    }

    /// `SHOW MASTER STATUS`, for starting at the server's current
    /// tail.
    pub fn master_status(&mut self) -> Result<(String, u32)> {
        let packet = self.query("show master status")?;
        if packet.rows.is_empty() {
            return Err(CdcError::Net(
                "'show master status' returned nothing; \
                 the REPLICATION CLIENT privilege is required and log_bin must be on"
                    .into(),
            ));
        }
        let file = packet.rows[0][0].clone().unwrap_or_default();
        let pos = packet.rows[0][1]
            .as_deref()
            .unwrap_or("4")
            .parse::<u32>()
            .map_err(|_| CdcError::Net("unparseable master position".into()))?;
        Ok((file, pos))
    }

    pub fn quit(&mut self) {
        if let Some(ch) = self.channel.as_mut() {
            let _ = write_packet(ch.as_mut(), 0, &QuitCommandPacket.to_bytes());
            ch.close();
        }
        self.channel = None;
    }

    /// Switches this connection into a binlog dump. In blocking mode
    /// the server parks the connection and pushes events forever; with
    /// `non_blocking` it sends EOF once the tail is reached.
    pub fn start_dump(
        mut self,
        file: &str,
        position: u32,
        server_id: u32,
        non_blocking: bool,
    ) -> Result<BinlogStream> {
        // Ask the server to tag events with whatever checksum it is
        // configured for; the decoder learns the algorithm from the
        // format description event. The artificial rotate arrives
        // before that event, so the algorithm is primed from the
        // server variable.
        if let Err(err) = self.query("SET @master_binlog_checksum= @@global.binlog_checksum") {
            warn!(%err, "could not negotiate binlog checksum");
        }
        let mut decoder = LogDecoder::new();
        match self.query("show global variables like 'binlog_checksum'") {
            Ok(result) => {
                if result.rows.first().and_then(|r| r.get(1)).and_then(|v| v.as_deref())
                    == Some("CRC32")
                {
                    decoder.set_checksum_alg(crate::binlog::event::BINLOG_CHECKSUM_ALG_CRC32);
                }
            }
            Err(err) => warn!(%err, "could not read binlog_checksum"),
        }

        let dump = BinlogDumpCommandPacket {
            binlog_file_name: file,
            binlog_position: position,
            slave_server_id: server_id,
            non_blocking,
        };
        let mut channel = self
            .channel
            .take()
            .ok_or_else(|| CdcError::Net("not connected".into()))?;
        write_packet(channel.as_mut(), 0, &dump.to_bytes())?;
        // Event gaps can be arbitrarily long on a quiet master.
        channel.set_read_timeout(None)?;
        info!(file, position, server_id, "binlog dump started");
        Ok(BinlogStream { channel, decoder })
    }
}

impl Drop for MysqlConnector {
    fn drop(&mut self) {
        self.quit();
    }
}

/// The replication stream. Each network packet wraps one event behind
/// a one byte status marker.
pub struct BinlogStream {
    channel: Box<dyn SocketChannel>,
    decoder: LogDecoder,
}

impl BinlogStream {
    /// Next event of interest. `Ok(None)` means the server reached the
    /// tail in non-blocking mode.
    pub fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
        loop {
            let (body, _) = read_packet(self.channel.as_mut())?;
            match body.first().copied() {
                Some(PACKET_OK) => {
                    if let Some(event) = self.decoder.decode(&body[1..])? {
                        return Ok(Some(event));
                    }
                }
                Some(PACKET_ERR) => return Err(ErrorPacket::from_bytes(&body)?.into_error()),
                Some(PACKET_EOF) => return Ok(None),
                _ => return Err(CdcError::Net("unexpected packet in binlog stream".into())),
            }
        }
    }
}
