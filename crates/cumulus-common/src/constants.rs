//! Shared constants for Cumulus components.

/// Default controller TCP port (client sessions)
pub const DEFAULT_CONTROLLER_TCP_PORT: u16 = 14020;

/// Default controller UDP port (heartbeats and join probes)
pub const DEFAULT_CONTROLLER_UDP_PORT: u16 = 14021;

/// Node is marked offline after this much silence (milliseconds)
pub const DEFAULT_NODE_TIMEOUT_MS: u64 = 3000;

/// Sweep period of the membership tracker (milliseconds)
pub const DEFAULT_NODE_CHECK_PERIOD_MS: u64 = 1000;

/// Heartbeat period of a node (milliseconds)
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1000;

/// Total resource budget split across the fleet
pub const DEFAULT_TOTAL_BUDGET: i64 = 1000;

/// Credits charged per completed operator step
pub const DEFAULT_COST_PER_OPERATOR: i64 = 50;

/// Usage added to a node per character of a result it returned
pub const DEFAULT_COST_PER_RESULT_CHAR: u64 = 50;

/// Deadline for a client to complete the handshake (milliseconds)
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Admission vote collection window (milliseconds)
pub const DEFAULT_VOTE_TIMEOUT_MS: u64 = 2000;

/// Size of handshake challenges in bytes
pub const CHALLENGE_LEN: usize = 32;

/// Size of the session key in bytes (AES-256)
pub const SESSION_KEY_LEN: usize = 32;

/// Size of the session IV in bytes
pub const SESSION_IV_LEN: usize = 16;

/// Largest heartbeat or probe datagram we accept
pub const MAX_DATAGRAM_LEN: usize = 1024;

/// Largest join offer: the biggest payload a single UDP datagram can carry
pub const MAX_JOIN_OFFER_LEN: usize = 65_507;

/// Largest line accepted on any TCP connection, terminator excluded
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Wire keywords
pub mod wire {
    /// Node heartbeat: `!alive <tcpPort> <operators>`
    pub const ALIVE: &str = "!alive";

    /// Join probe sent by a node that wants to enter the fleet
    pub const HELLO: &str = "!hello";

    /// Phase 1 vote request: `!share <level>`
    pub const SHARE: &str = "!share";

    /// Positive vote
    pub const OK: &str = "!ok";

    /// Negative vote
    pub const NOK: &str = "!nok";

    /// Phase 2 commit: `!commit <level>`
    pub const COMMIT: &str = "!commit";

    /// Phase 2 abort
    pub const ROLLBACK: &str = "!rollback";

    /// Resource level query / answer
    pub const RESOURCES: &str = "!resources";

    /// Compute step request
    pub const COMPUTE: &str = "!compute";

    /// Compute step result
    pub const RESULT: &str = "!result";

    /// Request whose tag failed verification
    pub const TAMPERED: &str = "!tampered";

    /// Arithmetic failure on the node
    pub const ERROR: &str = "!error";

    /// Log export request
    pub const GET_LOGS: &str = "!getLogs";

    /// First handshake message keyword
    pub const AUTH: &str = "AUTH";

    /// Handshake answer keyword
    pub const AUTH_OK: &str = "OK";
}
