//! Control-plane wire details shared by the router and its workers.
//!
//! A worker announces itself through the target of its websocket handshake:
//! `input_<port>` or `output_<port>`, where the port is the worker's own
//! control HTTP port (the matrix UI embeds that page in an iframe). The
//! router answers with a single binary message carrying the name of the
//! shared region the worker must attach. Everything after that flows through
//! shared memory.

/// Length of a shared-region name: 32 characters from `[A-Za-z]`.
pub const REGION_NAME_LEN: usize = 32;

/// Which side of the matrix a worker sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Produces frames for the router to composite
    Input,
    /// Consumes frames the router composites
    Output,
}

impl Role {
    fn target_prefix(self) -> &'static str {
        match self {
            Role::Input => "input",
            Role::Output => "output",
        }
    }
}

/// A parsed registration target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterTarget {
    pub role: Role,
    /// The worker's own control HTTP port
    pub port: u16,
}

impl RegisterTarget {
    /// Parse a websocket request target, with or without its leading `/`.
    ///
    /// Returns `None` for anything that is not a well-formed registration
    /// target; such connections are treated as UI subscribers.
    pub fn parse(target: &str) -> Option<RegisterTarget> {
        let target = target.strip_prefix('/').unwrap_or(target);
        let (role, port) = if let Some(rest) = target.strip_prefix("input_") {
            (Role::Input, rest)
        } else if let Some(rest) = target.strip_prefix("output_") {
            (Role::Output, rest)
        } else {
            return None;
        };
        let port = port.parse::<u16>().ok()?;
        Some(RegisterTarget { role, port })
    }
}

/// Format the websocket target a worker registers with.
pub fn register_target(role: Role, port: u16) -> String {
    format!("{}_{}", role.target_prefix(), port)
}

/// Whether `name` has the exact shape of a shared-region name.
///
/// Attachers check this before touching the filesystem so a malicious or
/// corrupt hand-off cannot name a path outside the region directory.
pub fn is_valid_region_name(name: &str) -> bool {
    name.len() == REGION_NAME_LEN && name.bytes().all(|b| b.is_ascii_alphabetic())
}
