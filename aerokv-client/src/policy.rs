//! Per-request policies.
//!
//! Policies are plain structs with public fields, immutable once a
//! command starts. Each command type takes the narrowest policy that
//! covers it; `WritePolicy` and friends embed [`BasePolicy`] for the
//! shared timeout, retry and routing knobs.

use std::time::Duration;

use aerokv_core::expression::FilterExpression;
use aerokv_core::protocol::constants::{info1, info2, info3};

/// Which replica a read may be served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Replica {
    /// Always the partition master.
    Master,
    /// Start at the master, advance through replicas on retry.
    #[default]
    Sequence,
    /// Round-robin over all replicas.
    Any,
    /// A uniformly random replica.
    Random,
    /// Prefer replicas in the client's racks, then fall back to sequence.
    PreferRack,
}

/// Read consistency for availability-mode namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadModeAp {
    /// A single replica's answer suffices.
    #[default]
    One,
    /// Consult all replicas for the latest copy.
    All,
}

/// What a write does when the record does or does not already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordExistsAction {
    /// Create or update; merge bins.
    #[default]
    Update,
    /// Update only; fail if the record does not exist.
    UpdateOnly,
    /// Create or replace the whole record.
    Replace,
    /// Replace only; fail if the record does not exist.
    ReplaceOnly,
    /// Create only; fail if the record exists.
    CreateOnly,
}

/// Generation check applied by a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationPolicy {
    /// No check.
    #[default]
    None,
    /// Write only if the server generation equals the expected one.
    ExpectGenEqual,
    /// Write only if the server generation is less than the expected one.
    ExpectGenGreater,
}

/// When the server acknowledges a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitLevel {
    /// After all replicas commit.
    #[default]
    CommitAll,
    /// After the master commits.
    CommitMaster,
}

/// Record expiration carried by a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    /// Use the namespace default TTL.
    #[default]
    NamespaceDefault,
    /// Expire this many seconds after the write.
    Seconds(u32),
    /// Never expire.
    Never,
    /// Keep the record's current TTL untouched.
    DontUpdate,
}

impl Expiration {
    /// The u32 carried in the message header TTL slot.
    pub fn wire(self) -> u32 {
        match self {
            Expiration::NamespaceDefault => 0,
            Expiration::Seconds(secs) => secs,
            Expiration::Never => u32::MAX,
            Expiration::DontUpdate => u32::MAX - 1,
        }
    }
}

/// Knobs shared by every command.
#[derive(Debug, Clone, Default)]
pub struct BasePolicy {
    /// Deadline over all attempts; zero means no total limit.
    pub total_timeout: Duration,
    /// Per-attempt socket timeout; zero means no per-attempt limit.
    pub socket_timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base sleep before a retry; doubled each attempt, with jitter.
    pub sleep_between_retries: Duration,
    /// Replica selection for reads.
    pub replica: Replica,
    /// Read consistency in availability mode.
    pub read_mode_ap: ReadModeAp,
    /// Send the user key alongside the digest so the server stores it.
    pub send_key: bool,
    /// Compiled filter; records failing it report `FilteredOut`.
    pub filter_expression: Option<FilterExpression>,
}

impl BasePolicy {
    /// Defaults: 1 s total, 30 s socket, 2 retries, no sleep.
    pub fn new() -> Self {
        Self {
            total_timeout: Duration::from_secs(1),
            socket_timeout: Duration::from_secs(30),
            max_retries: 2,
            sleep_between_retries: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Info1 bits contributed by read settings.
    pub fn read_info1(&self) -> u8 {
        match self.read_mode_ap {
            ReadModeAp::One => 0,
            ReadModeAp::All => info1::READ_MODE_AP_ALL,
        }
    }
}

/// Policy for single-record reads.
pub type ReadPolicy = BasePolicy;

/// Policy for single-record writes, deletes and operate calls.
#[derive(Debug, Clone, Default)]
pub struct WritePolicy {
    /// Shared knobs.
    pub base: BasePolicy,
    /// Existence semantics.
    pub record_exists_action: RecordExistsAction,
    /// Generation check.
    pub generation_policy: GenerationPolicy,
    /// Expected generation for the check.
    pub generation: u32,
    /// Record expiration.
    pub expiration: Expiration,
    /// Write a durable tombstone on delete.
    pub durable_delete: bool,
    /// Commit acknowledgement level.
    pub commit_level: CommitLevel,
    /// Return a result slot for every operation, not just reads.
    pub respond_all_ops: bool,
    /// Allow retrying a write whose first attempt may have applied.
    pub retry_on_timeout: bool,
}

impl WritePolicy {
    /// Defaults on top of [`BasePolicy::new`].
    pub fn new() -> Self {
        Self {
            base: BasePolicy::new(),
            ..Default::default()
        }
    }

    /// Info2 bits for a write-shaped command.
    pub fn write_info2(&self) -> u8 {
        let mut bits = info2::WRITE;
        match self.generation_policy {
            GenerationPolicy::None => {}
            GenerationPolicy::ExpectGenEqual => bits |= info2::GENERATION,
            GenerationPolicy::ExpectGenGreater => bits |= info2::GENERATION_GT,
        }
        if self.durable_delete {
            bits |= info2::DURABLE_DELETE;
        }
        if self.record_exists_action == RecordExistsAction::CreateOnly {
            bits |= info2::CREATE_ONLY;
        }
        if self.respond_all_ops {
            bits |= info2::RESPOND_ALL_OPS;
        }
        bits
    }

    /// Info3 bits for a write-shaped command.
    pub fn write_info3(&self) -> u8 {
        let mut bits = 0;
        if self.commit_level == CommitLevel::CommitMaster {
            bits |= info3::COMMIT_MASTER;
        }
        match self.record_exists_action {
            RecordExistsAction::UpdateOnly => bits |= info3::UPDATE_ONLY,
            RecordExistsAction::Replace => bits |= info3::CREATE_OR_REPLACE,
            RecordExistsAction::ReplaceOnly => bits |= info3::REPLACE_ONLY,
            _ => {}
        }
        bits
    }
}

/// Policy for full-namespace scans.
#[derive(Debug, Clone)]
pub struct ScanPolicy {
    /// Shared knobs.
    pub base: BasePolicy,
    /// Server-side records-per-second throttle; zero means unlimited.
    pub records_per_second: u32,
    /// Nodes scanned concurrently; zero means all at once.
    pub max_concurrent_nodes: usize,
    /// Return bin data, not just keys and metadata.
    pub include_bin_data: bool,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy {
                // Scans run long; no total deadline by default.
                total_timeout: Duration::ZERO,
                socket_timeout: Duration::from_secs(30),
                ..Default::default()
            },
            records_per_second: 0,
            max_concurrent_nodes: 0,
            include_bin_data: true,
        }
    }
}

/// Policy for secondary-index queries.
#[derive(Debug, Clone)]
pub struct QueryPolicy {
    /// Shared knobs.
    pub base: BasePolicy,
    /// Nodes queried concurrently; zero means all at once.
    pub max_concurrent_nodes: usize,
    /// Return bin data, not just keys and metadata.
    pub include_bin_data: bool,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy {
                total_timeout: Duration::ZERO,
                socket_timeout: Duration::from_secs(30),
                ..Default::default()
            },
            max_concurrent_nodes: 0,
            include_bin_data: true,
        }
    }
}

/// Policy for batch commands.
#[derive(Debug, Clone)]
pub struct BatchPolicy {
    /// Shared knobs.
    pub base: BasePolicy,
    /// Return a slot for every key even when some nodes fail.
    pub respond_all_keys: bool,
    /// Nodes contacted concurrently; zero means all at once.
    pub max_concurrent_nodes: usize,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy::new(),
            respond_all_keys: true,
            max_concurrent_nodes: 0,
        }
    }
}

/// Policy for info commands.
#[derive(Debug, Clone)]
pub struct InfoPolicy {
    /// Round-trip deadline.
    pub timeout: Duration,
}

impl Default for InfoPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_info_bits() {
        let mut policy = WritePolicy::new();
        assert_eq!(policy.write_info2(), info2::WRITE);
        assert_eq!(policy.write_info3(), 0);

        policy.generation_policy = GenerationPolicy::ExpectGenEqual;
        policy.durable_delete = true;
        policy.record_exists_action = RecordExistsAction::CreateOnly;
        assert_eq!(
            policy.write_info2(),
            info2::WRITE | info2::GENERATION | info2::DURABLE_DELETE | info2::CREATE_ONLY
        );

        policy.record_exists_action = RecordExistsAction::ReplaceOnly;
        policy.commit_level = CommitLevel::CommitMaster;
        assert_eq!(
            policy.write_info3(),
            info3::COMMIT_MASTER | info3::REPLACE_ONLY
        );
    }

    #[test]
    fn expiration_wire_values() {
        assert_eq!(Expiration::NamespaceDefault.wire(), 0);
        assert_eq!(Expiration::Seconds(300).wire(), 300);
        assert_eq!(Expiration::Never.wire(), u32::MAX);
        assert_eq!(Expiration::DontUpdate.wire(), u32::MAX - 1);
    }

    #[test]
    fn read_mode_all_sets_info1() {
        let mut policy = BasePolicy::new();
        assert_eq!(policy.read_info1(), 0);
        policy.read_mode_ap = ReadModeAp::All;
        assert_eq!(policy.read_info1(), info1::READ_MODE_AP_ALL);
    }
}
