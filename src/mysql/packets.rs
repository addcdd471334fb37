use crate::binlog::buffer::LogBuffer;
use crate::error::{CdcError, Result};
use crate::mysql::scramble::scramble411;

pub mod capability {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_LONG_FLAG: u32 = 4;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 8;
    pub const CLIENT_PROTOCOL_41: u32 = 512;
    pub const CLIENT_INTERACTIVE: u32 = 1024;
    pub const CLIENT_TRANSACTIONS: u32 = 8192;
    pub const CLIENT_SECURE_CONNECTION: u32 = 32768;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
}

pub const DEFAULT_PROTOCOL_VERSION: u8 = 10;
const MAX_PACKET_LENGTH: u32 = 1 << 24;

pub const COM_QUIT: u8 = 0x01;
pub const COM_QUERY: u8 = 0x03;
pub const COM_BINLOG_DUMP: u8 = 0x12;

pub const PACKET_OK: u8 = 0x00;
pub const PACKET_EOF: u8 = 0xfe;
pub const PACKET_ERR: u8 = 0xff;

/// Server greeting:
///
/// ```text
/// Bytes                    Name
/// -----                    ----
/// 1                        protocol version
/// n (null terminated)      server version
/// 4                        thread id
/// 8                        auth plugin data part 1
/// 1                        filler
/// 2                        capability flags (lower)
/// 1                        server charset
/// 2                        status flags
/// 2                        capability flags (upper)
/// 1                        auth plugin data length
/// 10                       reserved
/// max(13, len - 8)         auth plugin data part 2
/// n (null terminated)      auth plugin name
/// ```
pub struct HandshakeInitializationPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub seed: Vec<u8>,
    pub server_capabilities: u32,
    pub server_charset: u8,
    pub auth_plugin_name: String,
}

impl HandshakeInitializationPacket {
    pub fn from_bytes(body: &[u8]) -> Result<HandshakeInitializationPacket> {
        let mut buf = LogBuffer::new(body);
        let protocol_version = buf.get_u8()?;
        let server_version = buf.get_string_nul()?;
        let thread_id = buf.get_u32()?;
        let mut seed = buf.get_fixed_bytes(8)?.to_vec();
        buf.forward(1)?;
        let mut server_capabilities = buf.get_u16()? as u32;
        let mut server_charset = 0;
        let mut auth_plugin_name = String::new();

        if buf.has_remaining() {
            server_charset = buf.get_u8()?;
            buf.forward(2)?; // status flags
            server_capabilities |= (buf.get_u16()? as u32) << 16;
            let auth_data_len = buf.get_u8()? as usize;
            buf.forward(10)?;
            if server_capabilities & capability::CLIENT_SECURE_CONNECTION != 0 {
                let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8));
                let mut part2 = buf.get_fixed_bytes(part2_len)?;
                // part 2 carries a trailing NUL
                if part2.last() == Some(&0) {
                    part2 = &part2[..part2.len() - 1];
                }
                seed.extend_from_slice(part2);
            }
            if server_capabilities & capability::CLIENT_PLUGIN_AUTH != 0 {
                auth_plugin_name = buf.get_string_nul().unwrap_or_default();
            }
        }
        Ok(HandshakeInitializationPacket {
            protocol_version,
            server_version,
            thread_id,
            seed,
            server_capabilities,
            server_charset,
            auth_plugin_name,
        })
    }
}

/// Protocol 4.1 handshake response:
///
/// ```text
/// Bytes                    Name
/// -----                    ----
/// 4                        client flags
/// 4                        max packet size
/// 1                        charset number
/// 23                       filler, always 0x00
/// n (null terminated)      user
/// n (length coded)         scramble buff
/// n (null terminated)      database name (optional)
/// n (null terminated)      auth plugin name (optional)
/// ```
pub struct ClientAuthenticationPacket<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub charset_number: u8,
    pub seed: &'a [u8],
    pub auth_plugin_name: &'a str,
}

impl<'a> ClientAuthenticationPacket<'a> {
    const CLIENT_CAPABILITY: u32 = capability::CLIENT_LONG_PASSWORD
        | capability::CLIENT_LONG_FLAG
        | capability::CLIENT_PROTOCOL_41
        | capability::CLIENT_INTERACTIVE
        | capability::CLIENT_TRANSACTIONS
        | capability::CLIENT_SECURE_CONNECTION
        | capability::CLIENT_MULTI_STATEMENTS
        | capability::CLIENT_PLUGIN_AUTH;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&Self::CLIENT_CAPABILITY.to_le_bytes());
        out.extend_from_slice(&MAX_PACKET_LENGTH.to_le_bytes());
        out.push(self.charset_number);
        out.extend_from_slice(&[0u8; 23]);
        out.extend_from_slice(self.username.as_bytes());
        out.push(0);
        if self.password.is_empty() {
            out.push(0);
        } else {
            let scrambled = scramble411(self.password.as_bytes(), self.seed);
            out.push(scrambled.len() as u8);
            out.extend_from_slice(&scrambled);
        }
        if !self.auth_plugin_name.is_empty() {
            out.extend_from_slice(self.auth_plugin_name.as_bytes());
            out.push(0);
        }
        out
    }
}

/// 0xfe marker, plugin name, fresh seed.
pub struct AuthSwitchRequestPacket {
    pub auth_name: String,
    pub auth_data: Vec<u8>,
}

impl AuthSwitchRequestPacket {
    pub fn from_bytes(body: &[u8]) -> Result<AuthSwitchRequestPacket> {
        let mut buf = LogBuffer::new(body);
        buf.forward(1)?;
        let auth_name = buf.get_string_nul()?;
        let mut auth_data = buf.get_fixed_bytes(buf.remaining())?.to_vec();
        if auth_data.last() == Some(&0) {
            auth_data.pop();
        }
        Ok(AuthSwitchRequestPacket {
            auth_name,
            auth_data,
        })
    }
}

pub struct ErrorPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrorPacket {
    pub fn from_bytes(body: &[u8]) -> Result<ErrorPacket> {
        let mut buf = LogBuffer::new(body);
        buf.forward(1)?; // 0xff
        let error_code = buf.get_u16()?;
        let mut sql_state = String::new();
        let mut message_start = buf.position();
        if buf.remaining() > 0 {
            let marker = buf.get_u8()?;
            if marker == b'#' {
                sql_state = buf.get_fixed_string(5)?;
                message_start = buf.position();
            }
        }
        buf.seek(message_start)?;
        let message = buf.get_fixed_string(buf.remaining())?;
        Ok(ErrorPacket {
            error_code,
            sql_state,
            message,
        })
    }

    pub fn into_error(self) -> CdcError {
        CdcError::Net(format!(
            "server error {} ({}): {}",
            self.error_code, self.sql_state, self.message
        ))
    }
}

pub struct QueryCommandPacket<'a> {
    sql: &'a str,
}

impl<'a> QueryCommandPacket<'a> {
    pub fn new(sql: &'a str) -> QueryCommandPacket<'a> {
        QueryCommandPacket { sql }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.sql.len());
        out.push(COM_QUERY);
        out.extend_from_slice(self.sql.as_bytes());
        out
    }
}

pub struct QuitCommandPacket;

impl QuitCommandPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![COM_QUIT]
    }
}

pub const BINLOG_DUMP_NON_BLOCK: u16 = 1;

/// COM_BINLOG_DUMP:
///
/// ```text
/// Bytes  Name
/// -----  ----
/// 1      command
/// 4      binlog position to start at (little endian)
/// 2      binlog flags
/// 4      server id of this pseudo replica (little endian)
/// n      binlog file name
/// ```
pub struct BinlogDumpCommandPacket<'a> {
    pub binlog_file_name: &'a str,
    pub binlog_position: u32,
    pub slave_server_id: u32,
    pub non_blocking: bool,
}

impl<'a> BinlogDumpCommandPacket<'a> {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(COM_BINLOG_DUMP);
        out.extend_from_slice(&self.binlog_position.to_le_bytes());
        let flags = if self.non_blocking {
            BINLOG_DUMP_NON_BLOCK
        } else {
            0
        };
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&self.slave_server_id.to_le_bytes());
        out.extend_from_slice(self.binlog_file_name.as_bytes());
        out
    }
}
