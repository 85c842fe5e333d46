use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use strum::AsRefStr;

use super::block::Block;
use crate::constants::{CLIENT_NAME, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH};
use crate::io::{ClickHouseBytesRead, ClickHouseBytesWrite};
use crate::prelude::*;
use crate::query::Qid;
use crate::settings::Settings;
use crate::{Error, Result};

pub(crate) const DBMS_MIN_REVISION_WITH_CLIENT_INFO: u64 = 54032;
pub(crate) const DBMS_MIN_REVISION_WITH_SERVER_TIMEZONE: u64 = 54058;
pub(crate) const DBMS_MIN_REVISION_WITH_QUOTA_KEY_IN_CLIENT_INFO: u64 = 54060;
pub(crate) const DBMS_MIN_REVISION_WITH_SERVER_DISPLAY_NAME: u64 = 54372;
pub(crate) const DBMS_MIN_REVISION_WITH_VERSION_PATCH: u64 = 54401;
pub(crate) const DBMS_MIN_REVISION_WITH_SERVER_LOGS: u64 = 54406;
pub(crate) const DBMS_MIN_REVISION_WITH_CLIENT_WRITE_INFO: u64 = 54420;
pub(crate) const DBMS_MIN_REVISION_WITH_SETTINGS_SERIALIZED_AS_STRINGS: u64 = 54429;
pub(crate) const DBMS_MIN_REVISION_WITH_INTERSERVER_SECRET: u64 = 54441;
pub(crate) const DBMS_MIN_REVISION_WITH_OPENTELEMETRY: u64 = 54442;
pub(crate) const DBMS_MIN_PROTOCOL_VERSION_WITH_DISTRIBUTED_DEPTH: u64 = 54448;
pub(crate) const DBMS_MIN_PROTOCOL_VERSION_WITH_QUERY_START_TIME: u64 = 54449;
pub(crate) const DBMS_MIN_PROTOCOL_VERSION_WITH_PARALLEL_REPLICAS: u64 = 54453;
pub(crate) const DBMS_MIN_PROTOCOL_VERSION_WITH_CUSTOM_SERIALIZATION: u64 = 54454;
pub(crate) const DBMS_MIN_PROTOCOL_VERSION_WITH_ADDENDUM: u64 = 54458;
pub(crate) const DBMS_MIN_PROTOCOL_VERSION_WITH_PARAMETERS: u64 = 54459;

pub(crate) const DBMS_TCP_PROTOCOL_VERSION: u64 = DBMS_MIN_PROTOCOL_VERSION_WITH_PARAMETERS;

pub(crate) const MAX_STRING_SIZE: usize = 1 << 30;

const QUERY_KIND_INITIAL: u8 = 1;
const INTERFACE_TCP: u8 = 1;
const STAGE_COMPLETE: u64 = 2;
const COMPRESSION_DISABLED: u64 = 0;

#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr)]
pub(crate) enum ClientPacketId {
    Hello  = 0,
    Query  = 1,
    Data   = 2,
    Cancel = 3,
    Ping   = 4,
}

#[cfg(any(test, feature = "test-utils"))]
impl ClientPacketId {
    pub(crate) fn from_u64(i: u64) -> Result<Self> {
        Ok(match i {
            0 => ClientPacketId::Hello,
            1 => ClientPacketId::Query,
            2 => ClientPacketId::Data,
            3 => ClientPacketId::Cancel,
            4 => ClientPacketId::Ping,
            x => return Err(Error::Protocol(format!("unknown client packet id {x}"))),
        })
    }
}

#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr)]
pub(crate) enum ServerPacketId {
    Hello                = 0,
    Data                 = 1,
    Exception            = 2,
    Progress             = 3,
    Pong                 = 4,
    EndOfStream          = 5,
    ProfileInfo          = 6,
    Totals               = 7,
    Extremes             = 8,
    TablesStatusResponse = 9,
    Log                  = 10,
    TableColumns         = 11,
    PartUUIDs            = 12,
    ReadTaskRequest      = 13,
    ProfileEvents        = 14,
}

impl ServerPacketId {
    pub(crate) fn from_u64(i: u64) -> Result<Self> {
        Ok(match i {
            0 => ServerPacketId::Hello,
            1 => ServerPacketId::Data,
            2 => ServerPacketId::Exception,
            3 => ServerPacketId::Progress,
            4 => ServerPacketId::Pong,
            5 => ServerPacketId::EndOfStream,
            6 => ServerPacketId::ProfileInfo,
            7 => ServerPacketId::Totals,
            8 => ServerPacketId::Extremes,
            9 => ServerPacketId::TablesStatusResponse,
            10 => ServerPacketId::Log,
            11 => ServerPacketId::TableColumns,
            12 => ServerPacketId::PartUUIDs,
            13 => ServerPacketId::ReadTaskRequest,
            14 => ServerPacketId::ProfileEvents,
            x => {
                error!("invalid packet id from server: {}", x);
                return Err(Error::Protocol(format!("unknown packet id {x}")));
            }
        })
    }
}

/// Credentials and identity sent in the client hello.
#[derive(Debug, Clone)]
pub(crate) struct ClientHello<'a> {
    pub(crate) client_name: &'a str,
    pub(crate) database:    &'a str,
    pub(crate) username:    &'a str,
    pub(crate) password:    &'a str,
}

impl ClientHello<'_> {
    pub(crate) fn encode(&self, writer: &mut BytesMut) {
        writer.put_var_uint(ClientPacketId::Hello as u64);
        writer.put_string(format!("{CLIENT_NAME} {}", self.client_name).trim_end());
        writer.put_var_uint(VERSION_MAJOR);
        writer.put_var_uint(VERSION_MINOR);
        writer.put_var_uint(DBMS_TCP_PROTOCOL_VERSION);
        writer.put_string(self.database);
        writer.put_string(self.username);
        writer.put_string(self.password);
    }

    /// Sent right after the server hello once the negotiated revision supports it.
    pub(crate) fn encode_addendum(writer: &mut BytesMut, revision: u64) {
        if revision >= DBMS_MIN_PROTOCOL_VERSION_WITH_ADDENDUM {
            // Quota key
            writer.put_string("");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ServerHello {
    pub(crate) server_name:      String,
    pub(crate) major_version:    u64,
    pub(crate) minor_version:    u64,
    pub(crate) patch_version:    u64,
    pub(crate) revision_version: u64,
    pub(crate) timezone:         Option<String>,
    pub(crate) display_name:     Option<String>,
}

impl ServerHello {
    /// Reads the hello body, negotiating the revision down to what this client speaks.
    pub(crate) fn decode(reader: &mut dyn Buf) -> Result<Self> {
        let server_name = reader.try_get_utf8_string()?;
        let major_version = reader.try_get_var_uint()?;
        let minor_version = reader.try_get_var_uint()?;
        let revision_version =
            std::cmp::min(reader.try_get_var_uint()?, DBMS_TCP_PROTOCOL_VERSION);

        let timezone = if revision_version >= DBMS_MIN_REVISION_WITH_SERVER_TIMEZONE {
            Some(reader.try_get_utf8_string()?)
        } else {
            None
        };
        let display_name = if revision_version >= DBMS_MIN_REVISION_WITH_SERVER_DISPLAY_NAME {
            Some(reader.try_get_utf8_string()?)
        } else {
            None
        };
        let patch_version = if revision_version >= DBMS_MIN_REVISION_WITH_VERSION_PATCH {
            reader.try_get_var_uint()?
        } else {
            revision_version
        };

        Ok(ServerHello {
            server_name,
            major_version,
            minor_version,
            patch_version,
            revision_version,
            timezone,
            display_name,
        })
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub(crate) fn encode(&self, writer: &mut BytesMut) {
        writer.put_var_uint(ServerPacketId::Hello as u64);
        writer.put_string(&self.server_name);
        writer.put_var_uint(self.major_version);
        writer.put_var_uint(self.minor_version);
        writer.put_var_uint(self.revision_version);
        if self.revision_version >= DBMS_MIN_REVISION_WITH_SERVER_TIMEZONE {
            writer.put_string(self.timezone.as_deref().unwrap_or_default());
        }
        if self.revision_version >= DBMS_MIN_REVISION_WITH_SERVER_DISPLAY_NAME {
            writer.put_string(self.display_name.as_deref().unwrap_or_default());
        }
        if self.revision_version >= DBMS_MIN_REVISION_WITH_VERSION_PATCH {
            writer.put_var_uint(self.patch_version);
        }
    }
}

/// An exception raised by the server, including any nested causes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code:        i32,
    pub name:        String,
    pub message:     String,
    pub stack_trace: String,
    pub nested:      Option<Box<ServerError>>,
}

impl ServerError {
    pub(crate) fn decode(reader: &mut dyn Buf) -> Result<Self> {
        let code = reader.try_read_i32_le()?;
        let name = reader.try_get_utf8_string()?;
        let message = String::from_utf8_lossy(&reader.try_get_string()?).into_owned();
        let stack_trace = reader.try_get_utf8_string()?;
        let has_nested = reader.try_read_u8()? != 0;
        let nested = if has_nested { Some(Box::new(Self::decode(reader)?)) } else { None };
        Ok(ServerError { code, name, message, stack_trace, nested })
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub(crate) fn encode(&self, writer: &mut BytesMut) {
        writer.put_i32_le(self.code);
        writer.put_string(&self.name);
        writer.put_string(&self.message);
        writer.put_string(&self.stack_trace);
        writer.put_u8(u8::from(self.nested.is_some()));
        if let Some(nested) = &self.nested {
            nested.encode(writer);
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code: {}, name: {}, {}", self.code, self.name, self.message)?;
        if let Some(nested) = &self.nested {
            write!(f, " (caused by {nested})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}

/// Progress of a running query as reported by the server. Values are deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub read_rows:     u64,
    pub read_bytes:    u64,
    pub total_rows:    u64,
    pub written_rows:  u64,
    pub written_bytes: u64,
}

impl Progress {
    pub(crate) fn decode(reader: &mut dyn Buf, revision: u64) -> Result<Self> {
        let read_rows = reader.try_get_var_uint()?;
        let read_bytes = reader.try_get_var_uint()?;
        let total_rows = if revision >= DBMS_MIN_REVISION_WITH_SERVER_LOGS {
            reader.try_get_var_uint()?
        } else {
            0
        };
        let (written_rows, written_bytes) = if revision >= DBMS_MIN_REVISION_WITH_CLIENT_WRITE_INFO
        {
            (reader.try_get_var_uint()?, reader.try_get_var_uint()?)
        } else {
            (0, 0)
        };
        Ok(Progress { read_rows, read_bytes, total_rows, written_rows, written_bytes })
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub(crate) fn encode(&self, writer: &mut BytesMut) {
        writer.put_var_uint(ServerPacketId::Progress as u64);
        writer.put_var_uint(self.read_rows);
        writer.put_var_uint(self.read_bytes);
        writer.put_var_uint(self.total_rows);
        writer.put_var_uint(self.written_rows);
        writer.put_var_uint(self.written_bytes);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ProfileInfo {
    pub(crate) rows:                         u64,
    pub(crate) blocks:                       u64,
    pub(crate) bytes:                        u64,
    pub(crate) applied_limit:                bool,
    pub(crate) rows_before_limit:            u64,
    pub(crate) calculated_rows_before_limit: bool,
}

impl ProfileInfo {
    fn decode(reader: &mut dyn Buf) -> Result<Self> {
        Ok(ProfileInfo {
            rows:                         reader.try_get_var_uint()?,
            blocks:                       reader.try_get_var_uint()?,
            bytes:                        reader.try_get_var_uint()?,
            applied_limit:                reader.try_read_u8()? != 0,
            rows_before_limit:            reader.try_get_var_uint()?,
            calculated_rows_before_limit: reader.try_read_u8()? != 0,
        })
    }
}

/// A packet received after the handshake.
#[derive(Debug, AsRefStr)]
pub(crate) enum ServerPacket {
    Data(Block),
    Totals(Block),
    Extremes(Block),
    Log(Block),
    ProfileEvents(Block),
    Exception(ServerError),
    Progress(Progress),
    ProfileInfo(ProfileInfo),
    TableColumns { table: String, description: String },
    Pong,
    EndOfStream,
}

impl ServerPacket {
    pub(crate) fn decode(reader: &mut dyn Buf, revision: u64) -> Result<Self> {
        let id = ServerPacketId::from_u64(reader.try_get_var_uint()?)?;
        Ok(match id {
            ServerPacketId::Data => ServerPacket::Data(Self::read_block(reader, revision)?),
            ServerPacketId::Totals => ServerPacket::Totals(Self::read_block(reader, revision)?),
            ServerPacketId::Extremes => ServerPacket::Extremes(Self::read_block(reader, revision)?),
            ServerPacketId::Log => ServerPacket::Log(Self::read_block(reader, revision)?),
            ServerPacketId::ProfileEvents => {
                ServerPacket::ProfileEvents(Self::read_block(reader, revision)?)
            }
            ServerPacketId::Exception => ServerPacket::Exception(ServerError::decode(reader)?),
            ServerPacketId::Progress => ServerPacket::Progress(Progress::decode(reader, revision)?),
            ServerPacketId::ProfileInfo => ServerPacket::ProfileInfo(ProfileInfo::decode(reader)?),
            ServerPacketId::TableColumns => ServerPacket::TableColumns {
                table:       reader.try_get_utf8_string()?,
                description: reader.try_get_utf8_string()?,
            },
            ServerPacketId::Pong => ServerPacket::Pong,
            ServerPacketId::EndOfStream => ServerPacket::EndOfStream,
            id @ (ServerPacketId::Hello
            | ServerPacketId::TablesStatusResponse
            | ServerPacketId::PartUUIDs
            | ServerPacketId::ReadTaskRequest) => {
                return Err(Error::Protocol(format!("unexpected packet {}", id.as_ref())));
            }
        })
    }

    fn read_block(reader: &mut dyn Buf, revision: u64) -> Result<Block> {
        // Temporary table name, always empty for client-facing streams
        let _ = reader.try_get_string()?;
        Block::decode(reader, revision)
    }
}

/// The query packet, followed on the wire by an empty data block.
#[derive(Debug)]
pub(crate) struct Query<'a> {
    pub(crate) qid:         Qid,
    pub(crate) text:        &'a str,
    pub(crate) settings:    &'a Settings,
    pub(crate) client_name: &'a str,
    pub(crate) os_user:     &'a str,
    pub(crate) hostname:    &'a str,
}

impl Query<'_> {
    pub(crate) fn encode(&self, writer: &mut BytesMut, revision: u64) {
        writer.put_var_uint(ClientPacketId::Query as u64);
        writer.put_string(self.qid.to_string());

        if revision >= DBMS_MIN_REVISION_WITH_CLIENT_INFO {
            self.encode_client_info(writer, revision);
        }

        self.settings
            .encode(writer, revision >= DBMS_MIN_REVISION_WITH_SETTINGS_SERIALIZED_AS_STRINGS);
        writer.put_string(""); // End of settings

        if revision >= DBMS_MIN_REVISION_WITH_INTERSERVER_SECRET {
            writer.put_string("");
        }

        writer.put_var_uint(STAGE_COMPLETE);
        writer.put_var_uint(COMPRESSION_DISABLED);
        writer.put_string(self.text);

        if revision >= DBMS_MIN_PROTOCOL_VERSION_WITH_PARAMETERS {
            writer.put_string(""); // End of parameters
        }

        Block::default().encode_data_packet(writer, revision);
    }

    fn encode_client_info(&self, writer: &mut BytesMut, revision: u64) {
        writer.put_u8(QUERY_KIND_INITIAL);
        writer.put_string(""); // Initial user
        writer.put_string(""); // Initial query id
        writer.put_string("0.0.0.0:0"); // Initial address

        if revision >= DBMS_MIN_PROTOCOL_VERSION_WITH_QUERY_START_TIME {
            writer.put_i64_le(0);
        }

        writer.put_u8(INTERFACE_TCP);
        writer.put_string(self.os_user);
        writer.put_string(self.hostname);
        writer.put_string(format!("{CLIENT_NAME} {}", self.client_name).trim_end());
        writer.put_var_uint(VERSION_MAJOR);
        writer.put_var_uint(VERSION_MINOR);
        writer.put_var_uint(DBMS_TCP_PROTOCOL_VERSION);

        if revision >= DBMS_MIN_REVISION_WITH_QUOTA_KEY_IN_CLIENT_INFO {
            writer.put_string("");
        }
        if revision >= DBMS_MIN_PROTOCOL_VERSION_WITH_DISTRIBUTED_DEPTH {
            writer.put_var_uint(0);
        }
        if revision >= DBMS_MIN_REVISION_WITH_VERSION_PATCH {
            writer.put_var_uint(VERSION_PATCH);
        }
        if revision >= DBMS_MIN_REVISION_WITH_OPENTELEMETRY {
            writer.put_u8(0);
        }
        if revision >= DBMS_MIN_PROTOCOL_VERSION_WITH_PARALLEL_REPLICAS {
            writer.put_var_uint(0); // Collaborate with initiator
            writer.put_var_uint(0); // Count participating replicas
            writer.put_var_uint(0); // Number of current replica
        }
    }
}

/// A query packet as seen from the server side. Used by the in-process mock server.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Clone, Default)]
pub(crate) struct ReceivedQuery {
    pub(crate) id:       String,
    pub(crate) text:     String,
    pub(crate) settings: Vec<(String, String)>,
}

#[cfg(any(test, feature = "test-utils"))]
impl ReceivedQuery {
    /// Reads a query packet body written by [`Query::encode`], excluding the trailing data block.
    pub(crate) fn decode(reader: &mut dyn Buf, revision: u64) -> Result<Self> {
        let id = reader.try_get_utf8_string()?;

        // Client info
        let _ = reader.try_read_u8()?;
        for _ in 0..3 {
            let _ = reader.try_get_string()?;
        }
        let _ = reader.try_read_i64_le()?;
        let _ = reader.try_read_u8()?;
        for _ in 0..3 {
            let _ = reader.try_get_string()?;
        }
        for _ in 0..3 {
            let _ = reader.try_get_var_uint()?;
        }
        let _ = reader.try_get_string()?;
        let _ = reader.try_get_var_uint()?;
        let _ = reader.try_get_var_uint()?;
        let _ = reader.try_read_u8()?;
        if revision >= DBMS_MIN_PROTOCOL_VERSION_WITH_PARALLEL_REPLICAS {
            for _ in 0..3 {
                let _ = reader.try_get_var_uint()?;
            }
        }

        let mut settings = Vec::new();
        loop {
            let name = reader.try_get_utf8_string()?;
            if name.is_empty() {
                break;
            }
            let _flags = reader.try_get_var_uint()?;
            settings.push((name, reader.try_get_utf8_string()?));
        }

        let _ = reader.try_get_string()?; // Interserver secret
        let _ = reader.try_get_var_uint()?; // Stage
        let _ = reader.try_get_var_uint()?; // Compression
        let text = reader.try_get_utf8_string()?;
        let _ = reader.try_get_string()?; // Parameters terminator

        Ok(ReceivedQuery { id, text, settings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_hello_negotiates_revision() {
        let hello = ServerHello {
            server_name: "ClickHouse".into(),
            major_version: 24,
            minor_version: 3,
            patch_version: 1,
            revision_version: DBMS_TCP_PROTOCOL_VERSION,
            timezone: Some("UTC".into()),
            display_name: Some("node-1".into()),
        };
        let mut buf = BytesMut::new();
        hello.encode(&mut buf);
        let mut reader = &buf[..];
        assert_eq!(reader.try_get_var_uint().unwrap(), ServerPacketId::Hello as u64);
        assert_eq!(ServerHello::decode(&mut reader).unwrap(), hello);
    }

    #[test]
    fn test_nested_exception() {
        let error = ServerError {
            code:        60,
            name:        "DB::Exception".into(),
            message:     "Table default.missing does not exist".into(),
            stack_trace: String::new(),
            nested:      Some(Box::new(ServerError {
                code:        1,
                name:        "DB::Inner".into(),
                message:     "inner".into(),
                stack_trace: String::new(),
                nested:      None,
            })),
        };
        let mut buf = BytesMut::new();
        buf.put_var_uint(ServerPacketId::Exception as u64);
        error.encode(&mut buf);
        let packet = ServerPacket::decode(&mut &buf[..], DBMS_TCP_PROTOCOL_VERSION).unwrap();
        let ServerPacket::Exception(decoded) = packet else { panic!("expected exception") };
        assert_eq!(decoded, error);
        assert!(decoded.to_string().contains("caused by code: 1"));
    }

    #[test]
    fn test_query_packet_is_readable_by_server() {
        let mut settings = Settings::default();
        settings.add_setting("async_insert", 1);
        let query = Query {
            qid:         Qid::new(),
            text:        "SELECT 1",
            settings:    &settings,
            client_name: "",
            os_user:     "user",
            hostname:    "host",
        };
        let mut buf = BytesMut::new();
        query.encode(&mut buf, DBMS_TCP_PROTOCOL_VERSION);

        let mut reader = &buf[..];
        assert_eq!(reader.try_get_var_uint().unwrap(), ClientPacketId::Query as u64);
        let received = ReceivedQuery::decode(&mut reader, DBMS_TCP_PROTOCOL_VERSION).unwrap();
        assert_eq!(received.id, query.qid.to_string());
        assert_eq!(received.text, "SELECT 1");
        assert_eq!(received.settings, vec![("async_insert".to_string(), "1".to_string())]);

        // Trailing empty data block
        assert_eq!(reader.try_get_var_uint().unwrap(), ClientPacketId::Data as u64);
        let _ = reader.try_get_string().unwrap();
        let block = Block::decode(&mut reader, DBMS_TCP_PROTOCOL_VERSION).unwrap();
        assert_eq!(block.rows(), 0);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_profile_info_decodes_every_field() {
        let mut buf = BytesMut::new();
        buf.put_var_uint(ServerPacketId::ProfileInfo as u64);
        buf.put_var_uint(10);
        buf.put_var_uint(2);
        buf.put_var_uint(4096);
        buf.put_u8(1);
        buf.put_var_uint(25);
        buf.put_u8(0);
        let mut reader = &buf[..];
        let ServerPacket::ProfileInfo(info) =
            ServerPacket::decode(&mut reader, DBMS_TCP_PROTOCOL_VERSION).unwrap()
        else {
            panic!("expected profile info");
        };
        assert!(reader.is_empty());
        assert_eq!(info, ProfileInfo {
            rows:                         10,
            blocks:                       2,
            bytes:                        4096,
            applied_limit:                true,
            rows_before_limit:            25,
            calculated_rows_before_limit: false,
        });
    }

    #[test]
    fn test_unknown_packet_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_var_uint(99);
        assert!(matches!(
            ServerPacket::decode(&mut &buf[..], DBMS_TCP_PROTOCOL_VERSION),
            Err(Error::Protocol(_))
        ));
    }
}
