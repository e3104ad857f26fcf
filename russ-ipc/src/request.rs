// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The dial request: operation verb, service sub-path, attributes and
//! arguments, with the frame encoding exchanged on the wire.

use crate::codec::{Dec, Enc};
use crate::error::{Error, Result};
use crate::{MAX_REQUEST_BUF_SIZE, PROTOCOL_STRING, REQ_ARGS_MAX, REQ_ATTRS_MAX, REQ_SPATH_MAX};

/// Operation verb. The standard set is closed; anything else travels as an
/// extension carrying the raw string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Execute,
    List,
    Help,
    Id,
    Info,
    Extension(String),
}

impl Op {
    pub fn as_str(&self) -> &str {
        match self {
            Op::Execute => "execute",
            Op::List => "list",
            Op::Help => "help",
            Op::Id => "id",
            Op::Info => "info",
            Op::Extension(s) => s,
        }
    }
}

impl From<&str> for Op {
    fn from(s: &str) -> Op {
        match s {
            "execute" => Op::Execute,
            "list" => Op::List,
            "help" => Op::Help,
            "id" => Op::Id,
            "info" => Op::Info,
            other => Op::Extension(other.to_string()),
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable within one call after construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub op: Op,
    pub spath: String,
    pub attrv: Vec<String>,
    pub argv: Vec<String>,
}

impl Request {
    /// Validates the documented limits; violations are argument failures,
    /// rejected before any I/O.
    pub fn new(op: Op, spath: &str, attrv: Vec<String>, argv: Vec<String>) -> Result<Request> {
        if spath.len() > REQ_SPATH_MAX {
            return Err(Error::bad_args("service path too long"));
        }
        if attrv.len() > REQ_ATTRS_MAX {
            return Err(Error::bad_args("too many attributes"));
        }
        if argv.len() > REQ_ARGS_MAX {
            return Err(Error::bad_args("too many arguments"));
        }
        Ok(Request { op, spath: spath.to_string(), attrv, argv })
    }

    /// Encode the full frame: u32 payload size, protocol tag, op, spath,
    /// attribute array, argument array. The size prefix counts the bytes
    /// that follow it.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Enc::with_limit(MAX_REQUEST_BUF_SIZE + 4);
        enc.put_u32(0)?;
        enc.put_raw(PROTOCOL_STRING)?;
        enc.put_str(self.op.as_str())?;
        enc.put_str(&self.spath)?;
        enc.put_str_array(&self.attrv)?;
        enc.put_str_array(&self.argv)?;
        let payload = (enc.len() - 4) as u32;
        enc.patch(0, &payload.to_le_bytes());
        Ok(enc.into_bytes())
    }

    /// Decode a frame payload (the bytes after the size prefix). A tag
    /// mismatch means the peer speaks an incompatible protocol generation.
    pub fn decode(payload: &[u8]) -> Result<Request> {
        let mut dec = Dec::new(payload);
        let tag = dec.get_raw(4)?;
        if tag != PROTOCOL_STRING.as_slice() {
            return Err(Error::protocol("protocol tag mismatch"));
        }
        let op = Op::from(dec.get_str()?.as_str());
        let spath = dec.get_str()?;
        if spath.len() > REQ_SPATH_MAX {
            return Err(Error::protocol("service path too long"));
        }
        let attrv = dec.get_str_array(REQ_ATTRS_MAX)?;
        let argv = dec.get_str_array(REQ_ARGS_MAX)?;
        Ok(Request { op, spath, attrv, argv })
    }
}
