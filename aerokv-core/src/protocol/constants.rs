//! Protocol constants: header sizes, info flags, field and op codes.

/// Protocol version carried in the high nibble of the first header byte.
pub const PROTO_VERSION: u8 = 2;

/// Size of the proto-level header.
pub const PROTO_HEADER_SIZE: usize = 8;

/// Size of the record-message header that follows the proto header.
pub const MSG_HEADER_SIZE: usize = 22;

/// Frames above this size are refused on both encode and decode.
pub const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

/// Longest permitted bin name in bytes.
pub const MAX_BIN_NAME_LEN: usize = 15;

/// Proto payload types.
pub mod msg_type {
    /// Out-of-band name/value info exchange.
    pub const INFO: u8 = 1;
    /// Security and login exchange.
    pub const ADMIN: u8 = 2;
    /// Record operation message.
    pub const MESSAGE: u8 = 3;
}

/// Request/response info flags, first byte.
pub mod info1 {
    /// Contains a read operation.
    pub const READ: u8 = 0x01;
    /// Read all bins.
    pub const GET_ALL: u8 = 0x02;
    /// Batch protocol message.
    pub const BATCH: u8 = 0x08;
    /// Operation originates from cross-datacenter replication.
    pub const XDR: u8 = 0x10;
    /// Do not return bin data, metadata only.
    pub const NOBINDATA: u8 = 0x20;
    /// Involve all replicas in the read (relaxed consistency).
    pub const READ_MODE_AP_ALL: u8 = 0x40;
}

/// Request/response info flags, second byte.
pub mod info2 {
    /// Contains a write operation.
    pub const WRITE: u8 = 0x01;
    /// Delete the record.
    pub const DELETE: u8 = 0x02;
    /// Apply the write only if generation matches.
    pub const GENERATION: u8 = 0x04;
    /// Apply the write only if generation is greater.
    pub const GENERATION_GT: u8 = 0x08;
    /// Leave a tombstone on delete.
    pub const DURABLE_DELETE: u8 = 0x10;
    /// Fail if the record already exists.
    pub const CREATE_ONLY: u8 = 0x20;
    /// Return a result for every operation.
    pub const RESPOND_ALL_OPS: u8 = 0x80;
}

/// Request/response info flags, third byte.
pub mod info3 {
    /// Final frame of a multi-record response.
    pub const LAST: u8 = 0x01;
    /// Commit to master only before responding.
    pub const COMMIT_MASTER: u8 = 0x02;
    /// A partition is complete in this scan/query response.
    pub const PARTITION_DONE: u8 = 0x04;
    /// Fail unless the record already exists.
    pub const UPDATE_ONLY: u8 = 0x08;
    /// Delete all bins, then apply the writes.
    pub const CREATE_OR_REPLACE: u8 = 0x10;
    /// Replace an existing record only.
    pub const REPLACE_ONLY: u8 = 0x20;
}

/// Field types in the field table.
pub mod field_type {
    /// Namespace name.
    pub const NAMESPACE: u8 = 0;
    /// Set name.
    pub const SET: u8 = 1;
    /// User key with a leading particle-type byte.
    pub const KEY: u8 = 2;
    /// 20-byte record digest.
    pub const DIGEST: u8 = 4;
    /// Array of digests (legacy batch).
    pub const DIGEST_ARRAY: u8 = 6;
    /// Server task identifier for scans and queries.
    pub const TASK_ID: u8 = 7;
    /// Scan option bits.
    pub const SCAN_OPTIONS: u8 = 8;
    /// Scan socket timeout override.
    pub const SCAN_TIMEOUT: u8 = 9;
    /// Scan records-per-second cap.
    pub const SCAN_RPS: u8 = 10;
    /// Secondary index name.
    pub const INDEX_NAME: u8 = 21;
    /// Secondary index range filter payload.
    pub const INDEX_RANGE: u8 = 22;
    /// Secondary index collection type.
    pub const INDEX_FILTER: u8 = 23;
    /// Compiled filter expression.
    pub const FILTER_EXPRESSION: u8 = 26;
    /// UDF module name.
    pub const UDF_PACKAGE_NAME: u8 = 30;
    /// UDF function name.
    pub const UDF_FUNCTION: u8 = 31;
    /// Msgpack-encoded UDF argument list.
    pub const UDF_ARGLIST: u8 = 32;
    /// Bin name list for projection queries.
    pub const QUERY_BIN_LIST: u8 = 40;
    /// Per-key batch sub-request table.
    pub const BATCH_INDEX: u8 = 41;
}

/// Operation codes in the op table.
pub mod op {
    /// Read a bin.
    pub const READ: u8 = 1;
    /// Write a bin.
    pub const WRITE: u8 = 2;
    /// CDT/HLL/bitwise read, distinguished by bin particle type.
    pub const CDT_READ: u8 = 3;
    /// CDT/HLL/bitwise modify, distinguished by bin particle type.
    pub const CDT_MODIFY: u8 = 4;
    /// Integer increment.
    pub const INCR: u8 = 5;
    /// Append to a string or blob bin.
    pub const APPEND: u8 = 9;
    /// Prepend to a string or blob bin.
    pub const PREPEND: u8 = 10;
    /// Touch: bump generation and reset TTL without writing bins.
    pub const TOUCH: u8 = 11;
    /// Record delete. Expressed via the `info2::DELETE` flag; no op
    /// entry with this code is emitted.
    pub const DELETE: u8 = 13;
}

/// Admin (security) protocol constants.
pub mod admin {
    /// Authenticate a pooled connection with a session token.
    pub const AUTHENTICATE: u8 = 0;
    /// Login: exchange credentials for a session token.
    pub const LOGIN: u8 = 20;

    /// User name field.
    pub const FIELD_USER: u8 = 0;
    /// Clear password field (TLS-only deployments).
    pub const FIELD_PASSWORD: u8 = 1;
    /// Hashed credential field.
    pub const FIELD_CREDENTIAL: u8 = 3;
    /// Session token returned by login.
    pub const FIELD_SESSION_TOKEN: u8 = 5;
    /// Session TTL in seconds returned by login.
    pub const FIELD_SESSION_TTL: u8 = 6;

    /// Admin message header size after the proto header.
    pub const HEADER_SIZE: usize = 16;
    /// Offset of the result code in the admin response header.
    pub const RESULT_CODE_OFFSET: usize = 1;
}
