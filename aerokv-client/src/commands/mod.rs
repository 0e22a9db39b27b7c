//! Command execution: message assembly, node selection and the retry
//! loop shared by every record operation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use aerokv_core::key::Key;
use aerokv_core::msgpack;
use aerokv_core::operations::Operation;
use aerokv_core::protocol::constants::{field_type, info1, info2, msg_type};
use aerokv_core::protocol::message::{MessageBuilder, MessageHeader, ParsedMessage};
use aerokv_core::protocol::proto::ProtoFrame;
use aerokv_core::value::{SendBoolAs, Value};
use aerokv_core::{AerokvError, Record, Result, ResultCode};
use bytes::BytesMut;
use rand::Rng;
use tracing::debug;

use crate::cluster::{Cluster, Node};
use crate::policy::{BasePolicy, ReadPolicy, Replica, WritePolicy};

pub mod admin;
pub mod batch;
pub mod scan;

/// Bin name under which a successful UDF result is returned.
const UDF_SUCCESS_BIN: &str = "SUCCESS";
/// Bin name under which a UDF error message is returned.
const UDF_FAILURE_BIN: &str = "FAILURE";

/// Where a command may be sent.
pub(crate) enum Route {
    /// Routed by partition through the replica policy.
    Partition {
        namespace: String,
        partition: usize,
        replica: Replica,
    },
    /// Pinned to one node (scans, info).
    Node(Arc<Node>),
}

impl Route {
    fn for_key(key: &Key, replica: Replica) -> Self {
        Route::Partition {
            namespace: key.namespace.clone(),
            partition: usize::from(key.partition_id()),
            replica,
        }
    }
}

/// Runs one frame against the cluster under the policy's retry and
/// timeout limits.
/// `retry_writes` gates re-issuing after an ambiguous failure; reads
/// always retry retryable errors.
pub(crate) async fn execute(
    cluster: &Cluster,
    policy: &BasePolicy,
    route: Route,
    frame: ProtoFrame,
    retry_writes: bool,
) -> Result<ParsedMessage> {
    let deadline = (!policy.total_timeout.is_zero()).then(|| Instant::now() + policy.total_timeout);
    let mut last_err: Option<AerokvError> = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            if !retry_writes {
                break;
            }
            sleep_before_retry(policy, attempt, deadline).await;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(AerokvError::Timeout("total timeout elapsed".into()));
        }

        let node = match &route {
            Route::Node(node) => Some(Arc::clone(node)),
            Route::Partition {
                namespace,
                partition,
                replica,
            } => cluster.partitions().select(
                namespace,
                *partition,
                *replica,
                attempt as usize,
                cluster.config().rack_ids(),
            ),
        };
        let Some(node) = node else {
            last_err = Some(AerokvError::Cluster(
                "no node owns the target partition".into(),
            ));
            continue;
        };

        match attempt_on(&node, frame.clone(), policy.socket_timeout, deadline).await {
            Ok(parsed) => match parsed.header.result_code {
                0 => return Ok(parsed),
                code => {
                    let err = AerokvError::from_code(code, Some(node.name().to_string()));
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    debug!(node = %node, attempt, error = %err, "retryable server error");
                    last_err = Some(err);
                }
            },
            Err(e) if e.is_retryable() => {
                debug!(node = %node, attempt, error = %e, "attempt failed");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| AerokvError::Cluster("command never attempted".into())))
}

/// Time left for one attempt: the socket timeout clipped to the total
/// deadline. `None` when neither limit is set.
fn attempt_limit(socket_timeout: Duration, deadline: Option<Instant>) -> Option<Duration> {
    let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
    match (socket_timeout.is_zero(), remaining) {
        (false, Some(remaining)) => Some(socket_timeout.min(remaining)),
        (false, None) => Some(socket_timeout),
        (true, remaining) => remaining,
    }
}

/// One attempt against one node: acquire, round-trip under the socket
/// timeout, parse. A full pool queues the attempt for the remaining
/// time rather than failing outright. The connection is discarded on
/// any failure since the stream may hold a half-read reply.
async fn attempt_on(
    node: &Arc<Node>,
    frame: ProtoFrame,
    socket_timeout: Duration,
    deadline: Option<Instant>,
) -> Result<ParsedMessage> {
    let mut conn = node
        .acquire(attempt_limit(socket_timeout, deadline))
        .await?;

    // Waiting for the pool consumed part of the attempt; re-clip.
    let reply = match attempt_limit(socket_timeout, deadline) {
        None => conn.round_trip(frame).await,
        Some(limit) => match tokio::time::timeout(limit, conn.round_trip(frame)).await {
            Ok(reply) => reply,
            Err(_) => Err(AerokvError::Timeout(format!(
                "no reply from {} within {:?}",
                node, limit
            ))),
        },
    };

    match reply {
        Ok(reply) => {
            if reply.msg_type != msg_type::MESSAGE {
                node.forget(conn);
                return Err(AerokvError::Protocol(format!(
                    "expected record message, got proto type {}",
                    reply.msg_type
                )));
            }
            match ParsedMessage::parse(&reply.payload) {
                Ok(parsed) => {
                    node.release(conn);
                    Ok(parsed)
                }
                Err(e) => {
                    node.forget(conn);
                    Err(e)
                }
            }
        }
        Err(e) => {
            node.forget(conn);
            Err(e)
        }
    }
}

async fn sleep_before_retry(policy: &BasePolicy, attempt: u32, deadline: Option<Instant>) {
    if policy.sleep_between_retries.is_zero() {
        return;
    }
    // Exponential backoff with up to 50% random jitter.
    let base = policy.sleep_between_retries * 2u32.saturating_pow(attempt - 1);
    let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
    let mut sleep = base + Duration::from_millis(jitter);
    if let Some(deadline) = deadline {
        sleep = sleep.min(deadline.saturating_duration_since(Instant::now()));
    }
    tokio::time::sleep(sleep).await;
}

fn base_fields(policy: &BasePolicy, key: &Key) -> u16 {
    MessageBuilder::key_field_count(key, policy.send_key)
        + u16::from(policy.filter_expression.is_some())
}

fn write_base_fields(builder: &mut MessageBuilder, policy: &BasePolicy, key: &Key) {
    builder.write_key(key, policy.send_key);
    if let Some(expr) = &policy.filter_expression {
        builder.write_field(field_type::FILTER_EXPRESSION, expr.as_bytes());
    }
}

fn transaction_ttl(policy: &BasePolicy) -> u32 {
    policy.total_timeout.as_millis().try_into().unwrap_or(u32::MAX)
}

fn record_from(key: &Key, parsed: ParsedMessage) -> Record {
    let generation = parsed.header.generation;
    let expiration = parsed.header.expiration;
    Record::new(Some(key.clone()), parsed.into_bins(), generation, expiration)
}

/// Maps a not-found server error to `None`; everything else propagates.
fn absent_as_none<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(AerokvError::Server {
            code: ResultCode::KeyNotFound,
            ..
        }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Reads the named bins, or every bin when `bins` is empty. A missing
/// record surfaces as a not-found server error.
pub(crate) async fn get(
    cluster: &Cluster,
    policy: &ReadPolicy,
    key: &Key,
    bins: &[&str],
) -> Result<Record> {
    let mut header = MessageHeader {
        info1: info1::READ | policy.read_info1(),
        transaction_ttl: transaction_ttl(policy),
        n_fields: base_fields(policy, key),
        n_ops: bins.len() as u16,
        ..Default::default()
    };
    if bins.is_empty() {
        header.info1 |= info1::GET_ALL;
    }
    let mut builder = MessageBuilder::new(header);
    write_base_fields(&mut builder, policy, key);
    for bin in bins {
        builder.write_operation(&Operation::get(*bin).encode(SendBoolAs::Bool)?)?;
    }
    let frame = builder.finish()?;

    let route = Route::for_key(key, policy.replica);
    let parsed = execute(cluster, policy, route, frame, true).await?;
    Ok(record_from(key, parsed))
}

/// Reads generation and TTL without bin data.
pub(crate) async fn get_header(
    cluster: &Cluster,
    policy: &ReadPolicy,
    key: &Key,
) -> Result<Record> {
    let header = MessageHeader {
        info1: info1::READ | info1::GET_ALL | info1::NOBINDATA | policy.read_info1(),
        transaction_ttl: transaction_ttl(policy),
        n_fields: base_fields(policy, key),
        ..Default::default()
    };
    let mut builder = MessageBuilder::new(header);
    write_base_fields(&mut builder, policy, key);
    let frame = builder.finish()?;

    let route = Route::for_key(key, policy.replica);
    let parsed = execute(cluster, policy, route, frame, true).await?;
    Ok(record_from(key, parsed))
}

/// True if the record exists.
pub(crate) async fn exists(cluster: &Cluster, policy: &ReadPolicy, key: &Key) -> Result<bool> {
    absent_as_none(get_header(cluster, policy, key).await).map(|r| r.is_some())
}

fn write_header(policy: &WritePolicy, key: &Key, n_ops: u16) -> MessageHeader {
    MessageHeader {
        info2: policy.write_info2(),
        info3: policy.write_info3(),
        generation: policy.generation,
        expiration: policy.expiration.wire(),
        transaction_ttl: transaction_ttl(&policy.base),
        n_fields: base_fields(&policy.base, key),
        n_ops,
        ..Default::default()
    }
}

/// Writes the given bins.
pub(crate) async fn put(
    cluster: &Cluster,
    policy: &WritePolicy,
    key: &Key,
    bins: Vec<(String, Value)>,
) -> Result<()> {
    let send_bool_as = cluster.config().send_bool_as();
    let mut builder = MessageBuilder::new(write_header(policy, key, bins.len() as u16));
    write_base_fields(&mut builder, &policy.base, key);
    for (bin, value) in bins {
        builder.write_operation(&Operation::put(bin, value).encode(send_bool_as)?)?;
    }
    let frame = builder.finish()?;

    let route = Route::for_key(key, Replica::Master);
    execute(cluster, &policy.base, route, frame, policy.retry_on_timeout).await?;
    Ok(())
}

/// Deletes the record; false if it did not exist.
pub(crate) async fn delete(cluster: &Cluster, policy: &WritePolicy, key: &Key) -> Result<bool> {
    let mut header = write_header(policy, key, 0);
    header.info2 |= info2::DELETE;
    header.expiration = 0;
    let mut builder = MessageBuilder::new(header);
    write_base_fields(&mut builder, &policy.base, key);
    let frame = builder.finish()?;

    let route = Route::for_key(key, Replica::Master);
    absent_as_none(execute(cluster, &policy.base, route, frame, policy.retry_on_timeout).await)
        .map(|r| r.is_some())
}

/// Resets the record's TTL and bumps its generation.
pub(crate) async fn touch(cluster: &Cluster, policy: &WritePolicy, key: &Key) -> Result<()> {
    let mut builder = MessageBuilder::new(write_header(policy, key, 1));
    write_base_fields(&mut builder, &policy.base, key);
    builder.write_operation(&Operation::Touch.encode(SendBoolAs::Bool)?)?;
    let frame = builder.finish()?;

    let route = Route::for_key(key, Replica::Master);
    execute(cluster, &policy.base, route, frame, policy.retry_on_timeout).await?;
    Ok(())
}

/// Runs a mixed batch of operations against one record, in order, and
/// returns the read results.
pub(crate) async fn operate(
    cluster: &Cluster,
    policy: &WritePolicy,
    key: &Key,
    ops: &[Operation],
) -> Result<Record> {
    if ops.is_empty() {
        return Err(AerokvError::Param("operate requires at least one operation".into()));
    }
    let has_write = ops.iter().any(Operation::is_write);
    let has_read = ops.iter().any(Operation::is_read);

    let mut header = write_header(policy, key, ops.len() as u16);
    if !has_write {
        header.info2 = 0;
        header.info3 = 0;
        header.expiration = 0;
    }
    if has_read {
        header.info1 |= info1::READ | policy.base.read_info1();
        if ops.iter().any(|op| matches!(op, Operation::ReadAll)) {
            header.info1 |= info1::GET_ALL;
        }
    }

    let send_bool_as = cluster.config().send_bool_as();
    let mut builder = MessageBuilder::new(header);
    write_base_fields(&mut builder, &policy.base, key);
    for op in ops {
        builder.write_operation(&op.encode(send_bool_as)?)?;
    }
    let frame = builder.finish()?;

    // Reads may roam replicas; anything that writes goes to the master.
    let replica = if has_write {
        Replica::Master
    } else {
        policy.base.replica
    };
    let route = Route::for_key(key, replica);
    let retry = !has_write || policy.retry_on_timeout;
    let parsed = execute(cluster, &policy.base, route, frame, retry).await?;
    Ok(record_from(key, parsed))
}

/// Invokes a Lua UDF on the record and returns its result value.
pub(crate) async fn apply_udf(
    cluster: &Cluster,
    policy: &WritePolicy,
    key: &Key,
    package: &str,
    function: &str,
    args: &[Value],
) -> Result<Option<Value>> {
    let mut header = write_header(policy, key, 0);
    header.n_fields += 3;
    let mut builder = MessageBuilder::new(header);
    write_base_fields(&mut builder, &policy.base, key);
    builder.write_field_str(field_type::UDF_PACKAGE_NAME, package);
    builder.write_field_str(field_type::UDF_FUNCTION, function);
    let mut arglist = BytesMut::new();
    msgpack::pack_value(&Value::List(args.to_vec()), &mut arglist)?;
    builder.write_field(field_type::UDF_ARGLIST, &arglist);
    let frame = builder.finish()?;

    let route = Route::for_key(key, Replica::Master);
    let parsed = execute(cluster, &policy.base, route, frame, policy.retry_on_timeout).await?;

    let mut bins = parsed.into_bins();
    if let Some(failure) = bins.remove(UDF_FAILURE_BIN) {
        return Err(AerokvError::Udf(failure.to_string()));
    }
    Ok(bins.remove(UDF_SUCCESS_BIN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aerokv_core::protocol::constants::info3;
    use crate::policy::{CommitLevel, Expiration, GenerationPolicy};

    fn key() -> Key {
        Key::new("test", "demo", 1i64).unwrap()
    }

    #[test]
    fn write_header_carries_policy_bits() {
        let mut policy = WritePolicy::new();
        policy.generation_policy = GenerationPolicy::ExpectGenEqual;
        policy.generation = 7;
        policy.commit_level = CommitLevel::CommitMaster;
        policy.expiration = Expiration::Seconds(120);

        let header = write_header(&policy, &key(), 2);
        assert_eq!(header.info2, info2::WRITE | info2::GENERATION);
        assert_eq!(header.info3, info3::COMMIT_MASTER);
        assert_eq!(header.generation, 7);
        assert_eq!(header.expiration, 120);
        assert_eq!(header.n_fields, 3);
        assert_eq!(header.n_ops, 2);
    }

    #[test]
    fn attempt_limit_clips_to_deadline() {
        assert_eq!(attempt_limit(Duration::ZERO, None), None);
        assert_eq!(
            attempt_limit(Duration::from_secs(5), None),
            Some(Duration::from_secs(5))
        );

        let deadline = Instant::now() + Duration::from_secs(1);
        let clipped = attempt_limit(Duration::from_secs(5), Some(deadline)).unwrap();
        assert!(clipped <= Duration::from_secs(1));
        let from_deadline = attempt_limit(Duration::ZERO, Some(deadline)).unwrap();
        assert!(from_deadline <= Duration::from_secs(1));
    }

    #[test]
    fn transaction_ttl_is_millis() {
        let mut policy = BasePolicy::new();
        policy.total_timeout = Duration::from_millis(1500);
        assert_eq!(transaction_ttl(&policy), 1500);
        policy.total_timeout = Duration::ZERO;
        assert_eq!(transaction_ttl(&policy), 0);
    }

    #[test]
    fn absent_maps_not_found_only() {
        let hit: Result<u8> = Ok(1);
        assert_eq!(absent_as_none(hit).unwrap(), Some(1));

        let miss: Result<u8> = Err(AerokvError::Server {
            code: ResultCode::KeyNotFound,
            node: None,
        });
        assert_eq!(absent_as_none(miss).unwrap(), None);

        let broken: Result<u8> = Err(AerokvError::Server {
            code: ResultCode::GenerationError,
            node: None,
        });
        assert!(absent_as_none(broken).is_err());
    }
}
