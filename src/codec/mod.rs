//! Serialization Codecs
//!
//! Two mirrored serialization envelopes carried over the same transports:
//! the versioned binary `qbinary` format and the JSON format. Both encode
//! the same records; which one travels on a connection is selected by the
//! protocol signature exchanged at connect time.

pub mod json;
pub mod qbinary;
