//! Control-protocol wire types.
//!
//! Transport is one TCP connection per request: the writer sends UTF-8 JSON
//! and half-closes its write side; the reader consumes until EOF, then
//! answers with a single JSON object and closes. Requests are dispatched on
//! the `q` field.

use crate::id::WorkerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Direction of a blast from the initiator's viewpoint: send to, receive
/// from, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "s")]
    Send,
    #[serde(rename = "r")]
    Receive,
    #[serde(rename = "b")]
    Both,
}

impl Direction {
    /// The peer's view of this direction: if the initiator sends, the
    /// responder receives, and vice versa.
    pub fn complement(self) -> Self {
        match self {
            Direction::Send => Direction::Receive,
            Direction::Receive => Direction::Send,
            Direction::Both => Direction::Both,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Direction::Send => 's',
            Direction::Receive => 'r',
            Direction::Both => 'b',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            's' => Some(Direction::Send),
            'r' => Some(Direction::Receive),
            'b' => Some(Direction::Both),
            _ => None,
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match (chars.next().and_then(Direction::from_char), chars.next()) {
            (Some(direction), None) => Ok(direction),
            _ => Err(format!("invalid direction {:?}", s)),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// The command names the manager dispatches on.
pub const COMMANDS: &[&str] = &[
    "register_worker",
    "keep_alive",
    "get_work",
    "report_flow",
    "connect_failed",
];

/// A request from a worker to the manager. Every request may carry an `ip`
/// override; without one the manager uses the observed peer address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "q", rename_all = "snake_case")]
pub enum Request {
    RegisterWorker {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blast_port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<IpAddr>,
    },
    KeepAlive {
        worker_id: WorkerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<IpAddr>,
    },
    GetWork {
        worker_id: WorkerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<IpAddr>,
    },
    ReportFlow {
        worker_id: WorkerId,
        blast_ip: IpAddr,
        blast_port: u16,
        /// Epoch seconds at the initiator's begin.
        start: i64,
        /// Elapsed seconds, two fractional digits.
        duration: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bytes_sent: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bytes_received: Option<u64>,
        /// Legacy single-counter form.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bytes: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        direction: Option<Direction>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<IpAddr>,
    },
    ConnectFailed {
        worker_id: WorkerId,
        blast_id: WorkerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blast_ip: Option<IpAddr>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blast_port: Option<u16>,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<IpAddr>,
    },
}

/// A manager response; serialized as the bare variant content.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    Registered(Registered),
    Work(Work),
    Failure(Failure),
    Unknown(Unknown),
    Empty(Empty),
}

impl Response {
    pub fn empty() -> Self {
        Response::Empty(Empty {})
    }

    /// The failure prompting a worker with a stale or unknown id to
    /// re-register.
    pub fn reregister(worker_id: &str) -> Self {
        Response::Failure(Failure {
            success: false,
            error_msg: Some(format!(
                "Unknown worker_id '{}'.  Please re-register.",
                worker_id
            )),
            retry_after: Some(1.0),
            reregister: Some(true),
        })
    }

    pub fn failure(error_msg: String, retry_after: Option<f64>) -> Self {
        Response::Failure(Failure {
            success: false,
            error_msg: Some(error_msg),
            retry_after,
            reregister: None,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct Registered {
    pub success: bool,
    pub worker_id: WorkerId,
}

#[derive(Debug, Serialize)]
pub struct Work {
    pub success: bool,
    pub blast_ip: IpAddr,
    pub blast_port: u16,
    pub blast_id: WorkerId,
    pub direction: Direction,
    /// Seconds the initiator should drive traffic for.
    pub duration: u64,
}

#[derive(Debug, Serialize)]
pub struct Failure {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reregister: Option<bool>,
}

/// Reply to a command the manager does not know.
#[derive(Debug, Serialize)]
pub struct Unknown {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct Empty {}

/// What a worker reads back from `register_worker`.
#[derive(Debug, Deserialize)]
pub struct RegisterReply {
    #[serde(default)]
    pub success: bool,
    pub worker_id: Option<WorkerId>,
    pub error_msg: Option<String>,
}

/// What a worker reads back from `get_work`; covers both the success and
/// the failure shape.
#[derive(Debug, Deserialize)]
pub struct WorkReply {
    #[serde(default)]
    pub success: bool,
    pub blast_ip: Option<IpAddr>,
    pub blast_port: Option<u16>,
    pub blast_id: Option<WorkerId>,
    pub direction: Option<Direction>,
    pub duration: Option<u64>,
    pub error_msg: Option<String>,
    pub retry_after: Option<f64>,
    pub reregister: Option<bool>,
}

/// What a worker reads back from keep_alive/report_flow/connect_failed.
#[derive(Debug, Deserialize)]
pub struct AckReply {
    pub success: Option<bool>,
    pub error_msg: Option<String>,
    pub reregister: Option<bool>,
}
