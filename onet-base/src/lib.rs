//! Base types and utilities for onet
//!
//! This crate holds the self-describing address model shared by every onet crate:
//!
//! - The global [`Protocol`] registry, which decides how the segments of an address are
//!   parsed and validated.
//! - [`Addr`], an ordered list of [`Segment`]s written as `/name/value/name/...`.
//! - [`ErrorKind`], the stable error classification used across the workspace.
#![cfg_attr(onet_docsrs, feature(doc_auto_cfg))]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod addr;
mod error;
pub mod protocol;

pub use self::{
    addr::{Addr, ParseError, Segment},
    error::ErrorKind,
    protocol::{
        Protocol, RegisterError, Validator, ValueError, lookup_protocol, register_protocol,
        register_protocols,
    },
};
