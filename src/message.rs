//! Message Envelope
//!
//! The unit of exchange between endpoints: a command id, a per-message id,
//! the sender's protocol version window, a bit-packed flags word and an
//! opaque content payload pre-serialized in its own format. Optional trailing
//! fields are elided on the wire; the flags word carries "not empty" bits
//! telling the receiver which fields follow.
//!
//! A message is created by a producer, optionally filled with content, tags
//! and destinations, and becomes immutable once enqueued (it travels as
//! [`MessagePtr`], a shared handle). The transient fields describing where a
//! message came from are never serialized.

use crate::codec::json::{looks_like_json, Packer, Reader, Writer};
use crate::codec::qbinary::{BReader, BWriter, QBinary};
use crate::compress;
use crate::error::{Error, Result};
use crate::host_point::{HostPoint, HostPointSet};
use crate::{SocketDescriptor, SocketDescriptorSet, SocketType, NO_SOCKET};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

/// Shared owning handle to a message; the body is immutable after enqueue.
pub type MessagePtr = Arc<Message>;

/// Maximum number of user tags a message may carry.
pub const MAX_TAGS: usize = 255;

/// Sentinel for [`Message::max_time_life`]: no expiry.
pub const TIME_LIFE_UNLIMITED: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Unknown = 0,
    /// Invites an [`MessageType::Answer`] with the same message id.
    Command = 1,
    Answer = 2,
    /// Fire-and-forget notification, never answered.
    Event = 3,
}

impl MessageType {
    pub fn from_u32(val: u32) -> Self {
        match val {
            1 => MessageType::Command,
            2 => MessageType::Answer,
            3 => MessageType::Event,
            _ => MessageType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Unknown => "unknown",
            MessageType::Command => "command",
            MessageType::Answer => "answer",
            MessageType::Event => "event",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(MessageType::Unknown),
            "command" => Some(MessageType::Command),
            "answer" => Some(MessageType::Answer),
            "event" => Some(MessageType::Event),
            _ => None,
        }
    }
}

/// Outcome of a command carried on an Answer message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExecStatus {
    Unknown = 0,
    Success = 1,
    /// A negative outcome that is not an error; the content holds a
    /// `MessageFailed` record.
    Failed = 2,
    /// Processing failed; the content holds a `MessageError` record.
    Error = 3,
}

impl ExecStatus {
    pub fn from_u32(val: u32) -> Self {
        match val {
            1 => ExecStatus::Success,
            2 => ExecStatus::Failed,
            3 => ExecStatus::Error,
            _ => ExecStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStatus::Unknown => "unknown",
            ExecStatus::Success => "success",
            ExecStatus::Failed => "failed",
            ExecStatus::Error => "error",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(ExecStatus::Unknown),
            "success" => Some(ExecStatus::Success),
            "failed" => Some(ExecStatus::Failed),
            "error" => Some(ExecStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl Priority {
    pub fn from_u32(val: u32) -> Self {
        match val {
            0 => Priority::High,
            2 => Priority::Low,
            _ => Priority::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Priority::High),
            "normal" => Some(Priority::Normal),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

/// Compression state of the message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Compression {
    None = 0,
    Zip = 1,
    Lzma = 2,
    Ppmd = 3,
    /// Forbids stream-level compression for this message, useful when the
    /// content is already compressed (JPG, PNG and similar formats).
    Disable = 7,
}

impl Compression {
    pub fn from_u32(val: u32) -> Self {
        match val {
            1 => Compression::Zip,
            2 => Compression::Lzma,
            3 => Compression::Ppmd,
            7 => Compression::Disable,
            _ => Compression::None,
        }
    }
}

/// Serialization format of a message or its content, encoded in 3 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum SerializeFormat {
    QBinary = 0,
    Json = 1,
}

impl SerializeFormat {
    pub fn from_u32(val: u32) -> Self {
        match val {
            1 => SerializeFormat::Json,
            _ => SerializeFormat::QBinary,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SerializeFormat::QBinary => "qbinary",
            SerializeFormat::Json => "json",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "qbinary" => Some(SerializeFormat::QBinary),
            "json" => Some(SerializeFormat::Json),
            _ => None,
        }
    }
}

impl Default for SerializeFormat {
    fn default() -> Self {
        SerializeFormat::QBinary
    }
}

// Flag word layout, LSB first:
//   bits 0..2   type
//   bits 3..5   exec status
//   bits 6..7   priority
//   bits 8..10  compression
//   bit  11     tags not empty
//   bit  12     max_time_life not empty
//   bit  13     content not empty
//   bit  14     proxy_id not empty
//   bit  15     access_id not empty
//   bits 16..23 reserved
//   bits 24..26 content format
//   bits 27..30 reserved
//   bit  31     flags2 not empty
const TAGS_NOT_EMPTY: u32 = 1 << 11;
const TIME_LIFE_NOT_EMPTY: u32 = 1 << 12;
const CONTENT_NOT_EMPTY: u32 = 1 << 13;
const PROXY_ID_NOT_EMPTY: u32 = 1 << 14;
const ACCESS_ID_NOT_EMPTY: u32 = 1 << 15;
const FLAGS2_NOT_EMPTY: u32 = 1 << 31;

/// The message envelope.
#[derive(Debug)]
pub struct Message {
    id: Uuid,
    command: Uuid,
    protocol_version_low: u16,
    protocol_version_high: u16,

    message_type: MessageType,
    exec_status: ExecStatus,
    priority: Priority,
    compression: Compression,
    content_format: SerializeFormat,

    /// Reserved flag word, serialized only when non-zero.
    flags2: u32,

    tags: Vec<u64>,
    max_time_life: u64,
    proxy_id: u64,
    access_id: Vec<u8>,
    content: Vec<u8>,

    // Transient metadata, never serialized.
    socket_type: SocketType,
    source_point: HostPoint,
    socket_descriptor: SocketDescriptor,
    socket_name: String,
    destination_points: HostPointSet,
    destination_sockets: SocketDescriptorSet,
    auxiliary: i64,
    processed: AtomicBool,
}

impl Message {
    fn empty() -> Self {
        Self {
            id: Uuid::nil(),
            command: Uuid::nil(),
            protocol_version_low: crate::PROTOCOL_VERSION_LOW,
            protocol_version_high: crate::PROTOCOL_VERSION_HIGH,
            message_type: MessageType::Unknown,
            exec_status: ExecStatus::Unknown,
            priority: Priority::Normal,
            compression: Compression::None,
            content_format: SerializeFormat::QBinary,
            flags2: 0,
            tags: Vec::new(),
            max_time_life: TIME_LIFE_UNLIMITED,
            proxy_id: 0,
            access_id: Vec::new(),
            content: Vec::new(),
            socket_type: SocketType::Unknown,
            source_point: HostPoint::null(),
            socket_descriptor: NO_SOCKET,
            socket_name: String::new(),
            destination_points: HostPointSet::new(),
            destination_sockets: SocketDescriptorSet::new(),
            auxiliary: 0,
            processed: AtomicBool::new(false),
        }
    }

    /// Creates a command message with a fresh id.
    ///
    /// The content format must be fixed at creation: an empty message still
    /// tells the peer which format the answer content is expected in.
    pub fn create(command: Uuid, content_format: SerializeFormat) -> Self {
        let mut m = Self::empty();
        m.id = Uuid::new_v4();
        m.command = command;
        m.message_type = MessageType::Command;
        m.content_format = content_format;
        m.proxy_id = crate::proxy_id();
        m
    }

    /// Creates a separate copy of this message for use as the answer.
    ///
    /// Keeps the id, the command, the version window, the flags, the tags,
    /// the life time and the socket metadata; the content and the destination
    /// collections start empty, and type/exec status/compression are reset to
    /// `Answer`/`Success`/`None`.
    pub fn clone_for_answer(&self) -> Self {
        let mut m = Self::empty();
        m.id = self.id;
        m.command = self.command;
        m.protocol_version_low = self.protocol_version_low;
        m.protocol_version_high = self.protocol_version_high;
        m.message_type = MessageType::Answer;
        m.exec_status = ExecStatus::Success;
        m.priority = self.priority;
        m.compression = Compression::None;
        m.content_format = self.content_format;
        m.flags2 = self.flags2;
        m.tags = self.tags.clone();
        m.max_time_life = self.max_time_life;
        m.proxy_id = self.proxy_id;
        m.access_id = self.access_id.clone();
        m.socket_type = self.socket_type;
        m.source_point = self.source_point;
        m.socket_descriptor = self.socket_descriptor;
        m.socket_name = self.socket_name.clone();
        m.auxiliary = self.auxiliary;
        m
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn command(&self) -> Uuid {
        self.command
    }

    /// The sender's protocol version window, checked on every node a message
    /// passes through (see the compatibility handshake).
    pub fn protocol_version_low(&self) -> u16 {
        self.protocol_version_low
    }

    pub fn protocol_version_high(&self) -> u16 {
        self.protocol_version_high
    }

    pub(crate) fn set_protocol_versions(&mut self, low: u16, high: u16) {
        self.protocol_version_low = low;
        self.protocol_version_high = high;
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn set_message_type(&mut self, val: MessageType) {
        self.message_type = val;
    }

    pub fn exec_status(&self) -> ExecStatus {
        self.exec_status
    }

    pub fn set_exec_status(&mut self, val: ExecStatus) {
        self.exec_status = val;
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, val: Priority) {
        self.priority = val;
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn content_format(&self) -> SerializeFormat {
        self.content_format
    }

    pub(crate) fn set_content_format(&mut self, val: SerializeFormat) {
        self.content_format = val;
    }

    /// User payload of up to 255 8-byte values carried outside the content,
    /// sparing a full content serialization round for small data.
    pub fn tags(&self) -> &[u64] {
        &self.tags
    }

    pub fn set_tags(&mut self, tags: Vec<u64>) {
        self.tags = tags;
        if self.tags.len() > MAX_TAGS {
            error!("Size of tags array greater than {MAX_TAGS}. Array will be truncated");
            self.tags.truncate(MAX_TAGS);
        }
    }

    pub fn tag(&self, index: usize) -> u64 {
        if index >= MAX_TAGS {
            error!("Tag index value not in range [0..{}]", MAX_TAGS - 1);
            return 0;
        }
        self.tags.get(index).copied().unwrap_or(0)
    }

    pub fn set_tag(&mut self, val: u64, index: usize) {
        if index >= MAX_TAGS {
            error!("Tag index value not in range [0..{}]", MAX_TAGS - 1);
            return;
        }
        if index >= self.tags.len() {
            self.tags.resize(index + 1, 0);
        }
        self.tags[index] = val;
    }

    /// Absolute UTC time in seconds after which the message is stale;
    /// [`TIME_LIFE_UNLIMITED`] means no limit.
    pub fn max_time_life(&self) -> u64 {
        self.max_time_life
    }

    pub fn set_max_time_life(&mut self, val: u64) {
        self.max_time_life = val;
    }

    /// Routing hint for intermediate proxy nodes (0 = unset).
    pub fn proxy_id(&self) -> u64 {
        self.proxy_id
    }

    pub fn set_proxy_id(&mut self, val: u64) {
        self.proxy_id = val;
    }

    /// Authentication token with application-defined meaning; UTF-8 when the
    /// message travels as JSON, arbitrary bytes in qbinary.
    pub fn access_id(&self) -> &[u8] {
        &self.access_id
    }

    pub fn set_access_id(&mut self, val: Vec<u8>) {
        self.access_id = val;
    }

    pub fn content_is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn clear_content(&mut self) {
        self.content.clear();
    }

    /// The raw content, decompressed first when needed.
    pub fn content(&self) -> Result<Vec<u8>> {
        self.decompressed_content()
    }

    pub(crate) fn raw_content(&self) -> &[u8] {
        &self.content
    }

    /// Installs a pre-serialized payload; the caller vouches that the bytes
    /// really are in `format`.
    pub fn set_content(&mut self, content: Vec<u8>, format: SerializeFormat) {
        self.content = content;
        self.content_format = format;
    }

    /// Compresses the content with the zip algorithm. Levels 0..=9 match the
    /// zip levels, -1 selects the default level. Compression is skipped for
    /// payloads that already fit a single unfragmented UDP datagram.
    pub fn compress(&mut self, level: i32, algorithm: Compression) -> Result<()> {
        if self.compression != Compression::None {
            return Ok(());
        }
        if algorithm == Compression::Disable {
            self.compression = Compression::Disable;
            return Ok(());
        }
        let level = compress::clamp_level(level);
        let size = self.wire_size() + crate::transport::udp::SIGNATURE_LEN;
        if level != 0 && size > 508 {
            match algorithm {
                Compression::Zip => {
                    self.content = compress::zlib_compress(&self.content, level)?;
                    self.compression = Compression::Zip;
                }
                _ => {
                    error!("Unsupported compression algorithm: {algorithm:?}");
                    return Err(Error::compression(format!(
                        "Unsupported compression algorithm: {algorithm:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Forbids stream-level compression of this message.
    pub fn disable_compression(&mut self) {
        let _ = self.compress(-1, Compression::Disable);
    }

    /// Decompresses the content in place.
    pub fn decompress(&mut self) -> Result<()> {
        if self.compression != Compression::None && self.compression != Compression::Disable {
            self.content = self.decompressed_content()?;
            self.compression = Compression::None;
        }
        Ok(())
    }

    fn decompressed_content(&self) -> Result<Vec<u8>> {
        match self.compression {
            Compression::None | Compression::Disable => Ok(self.content.clone()),
            Compression::Zip => compress::zlib_decompress(&self.content),
            Compression::Lzma | Compression::Ppmd => Err(Error::compression(format!(
                "Unsupported decompression algorithm: {:?}",
                self.compression
            ))),
        }
    }

    // ---- transient metadata ----

    /// Socket kind the message was received from.
    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub(crate) fn set_socket_type(&mut self, val: SocketType) {
        self.socket_type = val;
    }

    /// Peer address the message was received from; valid for TCP and UDP.
    pub fn source_point(&self) -> HostPoint {
        self.source_point
    }

    pub(crate) fn set_source_point(&mut self, val: HostPoint) {
        self.source_point = val;
    }

    /// Descriptor of the socket the message was received on; valid for TCP
    /// and UNIX sockets.
    pub fn socket_descriptor(&self) -> SocketDescriptor {
        self.socket_descriptor
    }

    pub(crate) fn set_socket_descriptor(&mut self, val: SocketDescriptor) {
        self.socket_descriptor = val;
    }

    /// Name of the UNIX socket the message was received from.
    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    pub(crate) fn set_socket_name(&mut self, val: String) {
        self.socket_name = val;
    }

    /// Destination addresses for sending through a UDP socket. When empty,
    /// the datagram goes back to [`Message::source_point`].
    pub fn destination_points(&self) -> &HostPointSet {
        &self.destination_points
    }

    pub fn append_destination_point(&mut self, point: HostPoint) {
        self.destination_points.insert(point);
    }

    /// Descriptors of the sockets a listener should route this message to.
    /// When empty, [`Message::socket_descriptor`] is used.
    pub fn destination_sockets(&self) -> &SocketDescriptorSet {
        &self.destination_sockets
    }

    pub fn append_destination_socket(&mut self, descriptor: SocketDescriptor) {
        self.destination_sockets.insert(descriptor);
    }

    /// Free-form value for application bookkeeping, never serialized.
    pub fn auxiliary(&self) -> i64 {
        self.auxiliary
    }

    pub fn set_auxiliary(&mut self, val: i64) {
        self.auxiliary = val;
    }

    /// Tells later handlers the message was already handled.
    pub fn processed(&self) -> bool {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn mark_as_processed(&self) {
        self.processed.store(true, Ordering::Relaxed);
    }

    /// Serialized envelope size estimate, used for the single-datagram UDP
    /// check and buffer reservation.
    pub fn wire_size(&self) -> usize {
        let mut size = 16 + 16 + 2 + 2 + 4;
        if self.flags2 != 0 {
            size += 4;
        }
        if !self.tags.is_empty() {
            size += 1 + self.tags.len() * 8;
        }
        if self.max_time_life != TIME_LIFE_UNLIMITED {
            size += 8;
        }
        if self.proxy_id != 0 {
            size += 8;
        }
        if !self.access_id.is_empty() {
            size += 4 + self.access_id.len();
        }
        if !self.content.is_empty() {
            size += 4 + self.content.len();
        }
        size
    }

    fn pack_flags(&self) -> u32 {
        let mut flags = self.message_type as u32
            | (self.exec_status as u32) << 3
            | (self.priority as u32) << 6
            | (self.compression as u32) << 8
            | (self.content_format as u32) << 24;
        if !self.tags.is_empty() {
            flags |= TAGS_NOT_EMPTY;
        }
        if self.max_time_life != TIME_LIFE_UNLIMITED {
            flags |= TIME_LIFE_NOT_EMPTY;
        }
        if !self.content.is_empty() {
            flags |= CONTENT_NOT_EMPTY;
        }
        if self.proxy_id != 0 {
            flags |= PROXY_ID_NOT_EMPTY;
        }
        if !self.access_id.is_empty() {
            flags |= ACCESS_ID_NOT_EMPTY;
        }
        if self.flags2 != 0 {
            flags |= FLAGS2_NOT_EMPTY;
        }
        flags
    }

    fn apply_flags(&mut self, flags: u32) {
        self.message_type = MessageType::from_u32(flags & 0x7);
        self.exec_status = ExecStatus::from_u32((flags >> 3) & 0x7);
        self.priority = Priority::from_u32((flags >> 6) & 0x3);
        self.compression = Compression::from_u32((flags >> 8) & 0x7);
        self.content_format = SerializeFormat::from_u32((flags >> 24) & 0x7);
    }

    // ---- qbinary form ----

    /// Serializes the envelope in the qbinary wire form.
    pub fn to_qbinary(&self) -> Vec<u8> {
        let mut w = BWriter::with_capacity(self.wire_size());
        self.write_qbinary(&mut w);
        w.into_inner()
    }

    pub(crate) fn write_qbinary(&self, w: &mut BWriter) {
        let flags = self.pack_flags();
        w.write_uuid(&self.id);
        w.write_uuid(&self.command);
        w.write_u16(self.protocol_version_low);
        w.write_u16(self.protocol_version_high);
        w.write_u32(flags);
        if flags & FLAGS2_NOT_EMPTY != 0 {
            w.write_u32(self.flags2);
        }
        if flags & TAGS_NOT_EMPTY != 0 {
            w.write_u8(self.tags.len() as u8);
            for tag in &self.tags {
                w.write_u64(*tag);
            }
        }
        if flags & TIME_LIFE_NOT_EMPTY != 0 {
            w.write_u64(self.max_time_life);
        }
        if flags & PROXY_ID_NOT_EMPTY != 0 {
            w.write_u64(self.proxy_id);
        }
        if flags & ACCESS_ID_NOT_EMPTY != 0 {
            w.write_bytes(&self.access_id);
        }
        if flags & CONTENT_NOT_EMPTY != 0 {
            w.write_bytes(&self.content);
        }
    }

    /// Restores a message from its qbinary wire form.
    pub fn from_qbinary(data: &[u8]) -> Result<Message> {
        let mut r = BReader::new(data);
        Self::read_qbinary(&mut r)
    }

    pub(crate) fn read_qbinary(r: &mut BReader<'_>) -> Result<Message> {
        let mut m = Message::empty();
        m.id = r.read_uuid()?;
        m.command = r.read_uuid()?;
        m.protocol_version_low = r.read_u16()?;
        m.protocol_version_high = r.read_u16()?;
        let flags = r.read_u32()?;
        m.apply_flags(flags);
        if flags & FLAGS2_NOT_EMPTY != 0 {
            m.flags2 = r.read_u32()?;
        }
        if flags & TAGS_NOT_EMPTY != 0 {
            let count = r.read_u8()? as usize;
            m.tags.reserve(count);
            for _ in 0..count {
                m.tags.push(r.read_u64()?);
            }
        }
        if flags & TIME_LIFE_NOT_EMPTY != 0 {
            m.max_time_life = r.read_u64()?;
        }
        if flags & PROXY_ID_NOT_EMPTY != 0 {
            m.proxy_id = r.read_u64()?;
        }
        if flags & ACCESS_ID_NOT_EMPTY != 0 {
            m.access_id = r.read_bytes()?;
        }
        if flags & CONTENT_NOT_EMPTY != 0 {
            m.content = r.read_bytes()?;
        }
        Ok(m)
    }

    // ---- json form ----

    /// Serializes the envelope as a JSON object. With `web_flags` the binary
    /// flag word is mirrored by a human-readable `webFlags` object.
    pub fn to_json(&self, web_flags: bool) -> Vec<u8> {
        let flags = self.pack_flags();
        let mut w = Writer::new();
        w.start_object();
        let mut id = self.id;
        w.member("id").value_uuid(&mut id);
        let mut command = self.command;
        w.member("command").value_uuid(&mut command);
        if self.protocol_version_low != 0 {
            let mut low = self.protocol_version_low;
            w.member("protocolVersionLow").value_u16(&mut low);
        }
        if self.protocol_version_high != 0 {
            let mut high = self.protocol_version_high;
            w.member("protocolVersionHigh").value_u16(&mut high);
        }
        let mut flags_val = flags;
        w.member("flags").value_u32(&mut flags_val);
        if flags & FLAGS2_NOT_EMPTY != 0 {
            let mut flags2 = self.flags2;
            w.member("flags2").value_u32(&mut flags2);
        }
        if flags & TAGS_NOT_EMPTY != 0 {
            let mut tags = self.tags.clone();
            w.member("tags").value_u64_seq(&mut tags);
        }
        if flags & TIME_LIFE_NOT_EMPTY != 0 {
            let mut life = self.max_time_life;
            w.member("maxTimeLife").value_u64(&mut life);
        }
        if flags & PROXY_ID_NOT_EMPTY != 0 {
            let mut proxy = self.proxy_id;
            w.member("proxyId").value_u64(&mut proxy);
        }
        if flags & ACCESS_ID_NOT_EMPTY != 0 {
            let mut access = String::from_utf8_lossy(&self.access_id).into_owned();
            w.member("accessId").value_string(&mut access);
        }
        if web_flags {
            w.member("webFlags").start_object();
            let mut type_str = self.message_type.as_str().to_string();
            w.member("type").value_string(&mut type_str);
            let mut status_str = self.exec_status.as_str().to_string();
            w.member("execStatus").value_string(&mut status_str);
            let mut priority_str = self.priority.as_str().to_string();
            w.member("priority").value_string(&mut priority_str);
            let mut format_str = self.content_format.as_str().to_string();
            w.member("contentFormat").value_string(&mut format_str);
            w.end_object();
        }
        if flags & CONTENT_NOT_EMPTY != 0 {
            let mut content = self.content.clone();
            w.member("content").value_bytes(&mut content);
        }
        w.end_object();
        w.into_bytes()
    }

    /// Restores a message from its JSON form. The binary `flags` word wins
    /// over the `webFlags` mirror when both are present and disagree.
    pub fn from_json(data: &[u8]) -> Result<Message> {
        let mut r = Reader::parse(data)?;
        let mut m = Message::empty();
        m.protocol_version_low = 0;
        m.protocol_version_high = 0;

        r.start_object();
        r.member("id").value_uuid(&mut m.id);
        r.member("command").value_uuid(&mut m.command);
        r.member_opt("protocolVersionLow").value_u16(&mut m.protocol_version_low);
        r.member_opt("protocolVersionHigh").value_u16(&mut m.protocol_version_high);
        let mut flags = 0u32;
        let flags_present = r.contains("flags");
        r.member_opt("flags").value_u32(&mut flags);
        r.member_opt("flags2").value_u32(&mut m.flags2);
        r.member_opt("tags").value_u64_seq(&mut m.tags);
        // Presence of the key is the sentinel here: absent means unlimited
        let mut life = 0u64;
        let life_set = r.contains("maxTimeLife");
        r.member_opt("maxTimeLife").value_u64(&mut life);
        r.member_opt("proxyId").value_u64(&mut m.proxy_id);
        let mut access = String::new();
        r.member_opt("accessId").value_string(&mut access);
        m.access_id = access.into_bytes();

        let mut web_type = String::new();
        let mut web_status = String::new();
        let mut web_priority = String::new();
        let mut web_format = String::new();
        r.member_opt("webFlags").start_object();
        r.member_opt("type").value_string(&mut web_type);
        r.member_opt("execStatus").value_string(&mut web_status);
        r.member_opt("priority").value_string(&mut web_priority);
        r.member_opt("contentFormat").value_string(&mut web_format);
        r.end_object();

        r.member_opt("content").value_bytes(&mut m.content);
        r.end_object();
        r.finish()?;

        if life_set {
            m.max_time_life = life;
        }
        m.apply_flags(flags);
        if !web_type.is_empty() {
            let web = (
                MessageType::from_str(&web_type),
                ExecStatus::from_str(&web_status),
                Priority::from_str(&web_priority),
                SerializeFormat::from_str(&web_format),
            );
            if flags_present {
                let mirrors_match = web.0 == Some(m.message_type)
                    && (web_status.is_empty() || web.1 == Some(m.exec_status))
                    && (web_priority.is_empty() || web.2 == Some(m.priority))
                    && (web_format.is_empty() || web.3 == Some(m.content_format));
                if !mirrors_match {
                    warn!(
                        id = %m.id,
                        "Binary flags and webFlags disagree, binary representation wins"
                    );
                }
            } else {
                if let Some(t) = web.0 {
                    m.message_type = t;
                }
                if let Some(s) = web.1 {
                    m.exec_status = s;
                }
                if let Some(p) = web.2 {
                    m.priority = p;
                }
                if let Some(f) = web.3 {
                    m.content_format = f;
                }
            }
        }
        // Content embedded raw is a JSON document by definition
        if !m.content.is_empty() && !flags_present && looks_like_json(&m.content) {
            m.content_format = SerializeFormat::Json;
        }
        Ok(m)
    }
}
