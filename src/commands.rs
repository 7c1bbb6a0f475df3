//! Base Commands and Data Records
//!
//! The well-known command ids every endpoint understands, the data records
//! travelling with them, and the well-known error codes. The records double
//! as a template for application commands: a record implements the qbinary
//! and JSON serialization traits and names its command id, and the helpers
//! here move it in and out of a [`Message`] content.
//!
//! Reliability rule for the whole command space: an id, once assigned to a
//! command name, must never change or be reused.

use crate::codec::json::{JsonRecord, Packer};
use crate::codec::qbinary::{BReader, BWriter, QBinary, RawVector};
use crate::error::Result;
use crate::message::{ExecStatus, Message, MessagePtr, SerializeFormat};
use crate::{Error, SocketType};
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

/// Well-known command ids.
pub mod command {
    use uuid::Uuid;

    /// Informs the peer that a received command is unknown to this side.
    pub const UNKNOWN: Uuid = Uuid::from_u128(0x4aef29d6_5b1a_4323_8655_ef0d4f1bb79d);

    /// Carries an out-of-band error report.
    pub const ERROR: Uuid = Uuid::from_u128(0xb18b98cc_b026_4bfe_8e33_e7afebfbe78b);

    /// Version compatibility exchange, the first message on a connection.
    /// Without it the message queue for a connection never starts.
    pub const PROTOCOL_COMPATIBLE: Uuid = Uuid::from_u128(0x173cbbeb_1d81_4e01_bf3c_5d06f9c878c3);

    /// Request to close the connection: the initiating side reports the
    /// reason, the peer logs it and answers with an empty Answer, after
    /// which the connection may be dropped.
    pub const CLOSE_CONNECTION: Uuid = Uuid::from_u128(0xe71921fd_e5b3_4f9b_8be7_283e8bb2a531);

    /// Periodic liveness probe. A connection that stops exchanging echoes is
    /// forcibly closed and the application is notified with a synthesized
    /// echo event.
    pub const ECHO_CONNECTION: Uuid = Uuid::from_u128(0xdb702b07_7f5a_403f_963a_ec50d41c7305);
}

pub(crate) fn register_builtin_commands() {
    crate::registry::register(command::UNKNOWN, "Unknown", true);
    crate::registry::register(command::ERROR, "Error", true);
    crate::registry::register(command::PROTOCOL_COMPATIBLE, "ProtocolCompatible", true);
    crate::registry::register(command::CLOSE_CONNECTION, "CloseConnection", true);
    crate::registry::register(command::ECHO_CONNECTION, "EchoConnection", true);
}

/// A data record bound to a command id.
pub trait CommandRecord {
    const COMMAND: Uuid;
}

/// Error description sent back as the Answer content when the command
/// processing failed with [`ExecStatus::Error`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageError {
    /// Group code, used to classify related errors.
    pub group: i32,
    /// Globally unique error code.
    pub code: Uuid,
    pub description: String,
}

impl MessageError {
    pub fn new(group: i32, code: Uuid, description: impl Into<String>) -> Self {
        Self { group, code, description: description.into() }
    }
}

impl QBinary for MessageError {
    fn to_raw(&self) -> Result<RawVector> {
        let mut v1 = BWriter::new();
        v1.write_i32(self.group);
        v1.write_uuid(&self.code);
        v1.write_str(&self.description);
        Ok(vec![v1.into_inner()])
    }

    fn from_raw(&mut self, raw: &RawVector) -> Result<()> {
        if let Some(chunk) = raw.first() {
            let mut r = BReader::new(chunk);
            self.group = r.read_i32()?;
            self.code = r.read_uuid()?;
            self.description = r.read_string()?;
        }
        Ok(())
    }
}

impl JsonRecord for MessageError {
    fn pack<P: Packer>(&mut self, p: &mut P) -> Result<()> {
        p.start_object();
        p.member("group").value_i32(&mut self.group);
        p.member("code").value_uuid(&mut self.code);
        p.member("description").value_string(&mut self.description);
        p.end_object();
        Ok(())
    }
}

/// Like [`MessageError`] but for a non-error negative outcome, sent as the
/// Answer content with [`ExecStatus::Failed`] (for example bad credentials).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageFailed {
    pub group: i32,
    pub code: Uuid,
    pub description: String,
}

impl MessageFailed {
    pub fn new(group: i32, code: Uuid, description: impl Into<String>) -> Self {
        Self { group, code, description: description.into() }
    }
}

impl QBinary for MessageFailed {
    fn to_raw(&self) -> Result<RawVector> {
        let mut v1 = BWriter::new();
        v1.write_i32(self.group);
        v1.write_uuid(&self.code);
        v1.write_str(&self.description);
        Ok(vec![v1.into_inner()])
    }

    fn from_raw(&mut self, raw: &RawVector) -> Result<()> {
        if let Some(chunk) = raw.first() {
            let mut r = BReader::new(chunk);
            self.group = r.read_i32()?;
            self.code = r.read_uuid()?;
            self.description = r.read_string()?;
        }
        Ok(())
    }
}

impl JsonRecord for MessageFailed {
    fn pack<P: Packer>(&mut self, p: &mut P) -> Result<()> {
        p.start_object();
        p.member("group").value_i32(&mut self.group);
        p.member("code").value_uuid(&mut self.code);
        p.member("description").value_string(&mut self.description);
        p.end_object();
        Ok(())
    }
}

/// Notification that a received command is unknown to the sending side.
#[derive(Debug, Clone, PartialEq)]
pub struct Unknown {
    /// The command nobody recognized.
    pub command_id: Uuid,
    /// Socket kind the unknown command arrived on.
    pub socket_type: SocketType,
    pub socket_descriptor: u64,
    /// UNIX socket name, when the command arrived on a local socket.
    pub socket_name: String,
    /// Peer address, when the command arrived on TCP or UDP.
    pub address: IpAddr,
    pub port: u16,
}

impl Default for Unknown {
    fn default() -> Self {
        Self {
            command_id: Uuid::nil(),
            socket_type: SocketType::Unknown,
            socket_descriptor: u64::MAX,
            socket_name: String::new(),
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

impl CommandRecord for Unknown {
    const COMMAND: Uuid = command::UNKNOWN;
}

impl QBinary for Unknown {
    fn to_raw(&self) -> Result<RawVector> {
        let mut v1 = BWriter::new();
        v1.write_uuid(&self.command_id);
        v1.write_u32(self.socket_type as u32);
        v1.write_u64(self.socket_descriptor);
        v1.write_str(&self.socket_name);
        v1.write_str(&self.address.to_string());
        v1.write_u16(self.port);
        Ok(vec![v1.into_inner()])
    }

    fn from_raw(&mut self, raw: &RawVector) -> Result<()> {
        if let Some(chunk) = raw.first() {
            let mut r = BReader::new(chunk);
            self.command_id = r.read_uuid()?;
            self.socket_type = SocketType::from_u32(r.read_u32()?);
            self.socket_descriptor = r.read_u64()?;
            self.socket_name = r.read_string()?;
            let address = r.read_string()?;
            self.address = address
                .parse()
                .map_err(|e| Error::serialize(format!("Invalid peer address '{address}': {e}")))?;
            self.port = r.read_u16()?;
        }
        Ok(())
    }
}

impl JsonRecord for Unknown {
    fn pack<P: Packer>(&mut self, p: &mut P) -> Result<()> {
        p.start_object();
        p.member("commandId").value_uuid(&mut self.command_id);
        let mut socket_type = self.socket_type as u32;
        p.member("socketType").value_u32(&mut socket_type);
        p.member("socketDescriptor").value_u64(&mut self.socket_descriptor);
        p.member("socketName").value_string(&mut self.socket_name);

        let mut protocol =
            if self.address.is_ipv6() { "ip6".to_string() } else { "ip4".to_string() };
        let mut address = self.address.to_string();
        p.member("addressProtocol").value_string(&mut protocol);
        p.member("address").value_string(&mut address);
        p.member("port").value_u16(&mut self.port);
        p.end_object();

        if p.is_reader() {
            self.socket_type = SocketType::from_u32(socket_type);
            self.address = address.parse().map_err(|e| {
                Error::serialize(format!("Invalid peer address '{address}': {e}"))
            })?;
        }
        Ok(())
    }
}

/// Out-of-band error report, used when the failure cannot be delivered as an
/// Answer (for example the command was never accepted for processing).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorData {
    /// Command whose processing produced the error.
    pub command_id: Uuid,
    /// Message the error relates to.
    pub message_id: Uuid,
    pub group: i32,
    pub code: Uuid,
    pub description: String,
}

impl ErrorData {
    pub fn assign(&mut self, err: &MessageError) {
        self.group = err.group;
        self.code = err.code;
        self.description = err.description.clone();
    }
}

impl CommandRecord for ErrorData {
    const COMMAND: Uuid = command::ERROR;
}

impl QBinary for ErrorData {
    fn to_raw(&self) -> Result<RawVector> {
        let mut v1 = BWriter::new();
        v1.write_uuid(&self.command_id);
        v1.write_uuid(&self.message_id);
        v1.write_i32(self.group);
        v1.write_uuid(&self.code);
        v1.write_str(&self.description);
        Ok(vec![v1.into_inner()])
    }

    fn from_raw(&mut self, raw: &RawVector) -> Result<()> {
        if let Some(chunk) = raw.first() {
            let mut r = BReader::new(chunk);
            self.command_id = r.read_uuid()?;
            self.message_id = r.read_uuid()?;
            self.group = r.read_i32()?;
            self.code = r.read_uuid()?;
            self.description = r.read_string()?;
        }
        Ok(())
    }
}

impl JsonRecord for ErrorData {
    fn pack<P: Packer>(&mut self, p: &mut P) -> Result<()> {
        p.start_object();
        p.member("commandId").value_uuid(&mut self.command_id);
        p.member("messageId").value_uuid(&mut self.message_id);
        p.member("group").value_i32(&mut self.group);
        p.member("code").value_uuid(&mut self.code);
        p.member("description").value_string(&mut self.description);
        p.end_object();
        Ok(())
    }
}

/// Reason a connection is being closed, sent ahead of the disconnect so the
/// peer knows why it is being dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloseConnection {
    pub group: i32,
    pub code: Uuid,
    pub description: String,
}

impl CommandRecord for CloseConnection {
    const COMMAND: Uuid = command::CLOSE_CONNECTION;
}

impl From<MessageError> for CloseConnection {
    fn from(err: MessageError) -> Self {
        Self { group: err.group, code: err.code, description: err.description }
    }
}

impl QBinary for CloseConnection {
    fn to_raw(&self) -> Result<RawVector> {
        let mut v1 = BWriter::new();
        v1.write_i32(self.group);
        v1.write_uuid(&self.code);
        v1.write_str(&self.description);
        Ok(vec![v1.into_inner()])
    }

    fn from_raw(&mut self, raw: &RawVector) -> Result<()> {
        if let Some(chunk) = raw.first() {
            let mut r = BReader::new(chunk);
            self.group = r.read_i32()?;
            self.code = r.read_uuid()?;
            self.description = r.read_string()?;
        }
        Ok(())
    }
}

impl JsonRecord for CloseConnection {
    fn pack<P: Packer>(&mut self, p: &mut P) -> Result<()> {
        p.start_object();
        p.member("group").value_i32(&mut self.group);
        p.member("code").value_uuid(&mut self.code);
        p.member("description").value_string(&mut self.description);
        p.end_object();
        Ok(())
    }
}

/// Well-known error codes for the `group = 0` protocol errors.
pub mod error {
    use super::MessageError;
    use uuid::Uuid;

    /// An error code with its default description.
    #[derive(Debug, Clone, Copy)]
    pub struct KnownError {
        pub group: i32,
        pub code: Uuid,
        pub description: &'static str,
    }

    impl KnownError {
        pub fn to_error(&self) -> MessageError {
            MessageError::new(self.group, self.code, self.description)
        }

        pub fn with_description(&self, description: impl Into<String>) -> MessageError {
            MessageError::new(self.group, self.code, description)
        }
    }

    pub const PROTOCOL_INCOMPATIBLE: KnownError = KnownError {
        group: 0,
        code: Uuid::from_u128(0xafa4209c_bd5a_4791_9713_5c3f4ab3c52b),
        description: "Protocol versions incompatible",
    };

    pub const QBINARY_PARSE: KnownError = KnownError {
        group: 0,
        code: Uuid::from_u128(0xed291487_d373_4aa1_93f5_c4d953e5d974),
        description: "QBinary parse error",
    };

    pub const JSON_PARSE: KnownError = KnownError {
        group: 0,
        code: Uuid::from_u128(0xdb5d018b_592f_4e80_850f_ebfccfe08986),
        description: "Json parse error",
    };

    pub const MESSAGE_CONTENT_PARSE: KnownError = KnownError {
        group: 0,
        code: Uuid::from_u128(0xd603db4a_bf1a_4a55_8df7_ab667684bf3e),
        description: "Message content parse error",
    };
}

/// Creates a command message carrying this record as content.
pub fn create_message<T>(record: &T, format: SerializeFormat) -> Result<Message>
where
    T: CommandRecord + QBinary + JsonRecord,
{
    let mut message = Message::create(T::COMMAND, format);
    write_to_message(record, &mut message)?;
    Ok(message)
}

/// Writes a record into the message content using the message's own content
/// format.
pub fn write_to_message<T>(record: &T, message: &mut Message) -> Result<()>
where
    T: QBinary + JsonRecord,
{
    let format = message.content_format();
    let content = match format {
        SerializeFormat::QBinary => crate::codec::qbinary::encode_record(record)?,
        SerializeFormat::Json => record.to_json()?,
    };
    message.set_content(content, format);
    Ok(())
}

/// Writes an error record into an answer and marks the outcome as
/// [`ExecStatus::Error`].
pub fn write_error(answer: &mut Message, err: &MessageError) -> Result<()> {
    write_to_message(err, answer)?;
    answer.set_exec_status(ExecStatus::Error);
    Ok(())
}

/// Writes a failure record into an answer and marks the outcome as
/// [`ExecStatus::Failed`].
pub fn write_failed(answer: &mut Message, failed: &MessageFailed) -> Result<()> {
    write_to_message(failed, answer)?;
    answer.set_exec_status(ExecStatus::Failed);
    Ok(())
}

/// Reads a record out of a message content, decompressing first when needed.
pub fn read_from_message<T>(message: &Message) -> Result<T>
where
    T: Default + QBinary + JsonRecord,
{
    if message.content_is_empty() {
        return Err(Error::serialize("Message content is empty"));
    }
    let content = message.content()?;
    match message.content_format() {
        SerializeFormat::QBinary => crate::codec::qbinary::decode_record(&content),
        SerializeFormat::Json => T::from_json(&content),
    }
}

/// Reads a record out of a shared message handle.
pub fn read_from_message_ptr<T>(message: &MessagePtr) -> Result<T>
where
    T: Default + QBinary + JsonRecord,
{
    read_from_message(message.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_ids_are_normative() {
        assert_eq!(command::UNKNOWN.to_string(), "4aef29d6-5b1a-4323-8655-ef0d4f1bb79d");
        assert_eq!(command::ERROR.to_string(), "b18b98cc-b026-4bfe-8e33-e7afebfbe78b");
        assert_eq!(
            command::PROTOCOL_COMPATIBLE.to_string(),
            "173cbbeb-1d81-4e01-bf3c-5d06f9c878c3"
        );
        assert_eq!(
            command::CLOSE_CONNECTION.to_string(),
            "e71921fd-e5b3-4f9b-8be7-283e8bb2a531"
        );
        assert_eq!(
            command::ECHO_CONNECTION.to_string(),
            "db702b07-7f5a-403f-963a-ec50d41c7305"
        );
        assert_eq!(
            error::PROTOCOL_INCOMPATIBLE.code.to_string(),
            "afa4209c-bd5a-4791-9713-5c3f4ab3c52b"
        );
        assert_eq!(
            error::QBINARY_PARSE.code.to_string(),
            "ed291487-d373-4aa1-93f5-c4d953e5d974"
        );
        assert_eq!(
            error::JSON_PARSE.code.to_string(),
            "db5d018b-592f-4e80-850f-ebfccfe08986"
        );
        assert_eq!(
            error::MESSAGE_CONTENT_PARSE.code.to_string(),
            "d603db4a-bf1a-4a55-8df7-ab667684bf3e"
        );
    }

    #[test]
    fn test_message_error_roundtrip_both_formats() {
        let err = MessageError::new(0, error::JSON_PARSE.code, "что-то пошло не так");

        let bytes = crate::codec::qbinary::encode_record(&err).unwrap();
        let restored: MessageError = crate::codec::qbinary::decode_record(&bytes).unwrap();
        assert_eq!(err, restored);

        let json = err.to_json().unwrap();
        let restored = MessageError::from_json(&json).unwrap();
        assert_eq!(err, restored);
    }

    #[test]
    fn test_unknown_record_roundtrip() {
        let unknown = Unknown {
            command_id: Uuid::new_v4(),
            socket_type: SocketType::Tcp,
            socket_descriptor: 17,
            socket_name: String::new(),
            address: "192.168.3.4".parse().unwrap(),
            port: 7777,
        };

        let bytes = crate::codec::qbinary::encode_record(&unknown).unwrap();
        let restored: Unknown = crate::codec::qbinary::decode_record(&bytes).unwrap();
        assert_eq!(unknown, restored);

        let json = unknown.to_json().unwrap();
        let restored = Unknown::from_json(&json).unwrap();
        assert_eq!(unknown, restored);
    }

    #[test]
    fn test_record_through_message_content() {
        let close = CloseConnection::from(error::PROTOCOL_INCOMPATIBLE.to_error());
        for format in [SerializeFormat::QBinary, SerializeFormat::Json] {
            let message = create_message(&close, format).unwrap();
            assert_eq!(message.command(), command::CLOSE_CONNECTION);
            assert_eq!(message.content_format(), format);
            let restored: CloseConnection = read_from_message(&message).unwrap();
            assert_eq!(close, restored);
        }
    }

    #[test]
    fn test_error_answer_sets_exec_status() {
        let m = Message::create(Uuid::new_v4(), SerializeFormat::QBinary);
        let mut answer = m.clone_for_answer();
        write_error(&mut answer, &error::QBINARY_PARSE.to_error()).unwrap();
        assert_eq!(answer.exec_status(), ExecStatus::Error);
        let restored: MessageError = read_from_message(&answer).unwrap();
        assert_eq!(restored.code, error::QBINARY_PARSE.code);

        let mut answer = m.clone_for_answer();
        let failed = MessageFailed::new(1, Uuid::new_v4(), "bad credentials");
        write_failed(&mut answer, &failed).unwrap();
        assert_eq!(answer.exec_status(), ExecStatus::Failed);
    }

    #[test]
    fn test_compressed_content_read() {
        let err = error::PROTOCOL_INCOMPATIBLE.with_description("x".repeat(2000));
        let mut message = create_message(&err, SerializeFormat::QBinary).unwrap();
        message.compress(6, crate::message::Compression::Zip).unwrap();
        let restored: MessageError = read_from_message(&message).unwrap();
        assert_eq!(restored.description.len(), 2000);
    }
}
