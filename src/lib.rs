//! Tryout: quota-gated, timed multiple-choice attempts.
//!
//! An attempt passes the access gate, which charges quota and mints a
//! short-lived access token. The token is verified at each stage boundary and
//! exchanged for a session. The exam runtime then drives the countdown,
//! autosaves answers and bookmarks, and submits exactly once, handing a signed
//! submission token to the result stage.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod logging;
pub mod storage;

pub mod access;
pub mod session;
pub mod token;

pub mod flow;
pub mod runtime;
