//! The user-facing client handle.

use std::collections::HashMap;
use std::sync::Arc;

use aerokv_core::key::Key;
use aerokv_core::operations::Operation;
use aerokv_core::value::Value;
use aerokv_core::{AerokvError, Record, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::info;

use crate::cluster::{Cluster, ClusterView, Node};
use crate::commands::batch::{BatchRead, BatchResult, BatchWrite};
use crate::commands::scan::{IndexFilter, RecordStream, Task};
use crate::commands::{self, batch, scan};
use crate::config::ClientConfig;
use crate::policy::{BatchPolicy, QueryPolicy, ReadPolicy, ScanPolicy, WritePolicy};

/// Data type of a secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    /// Integer values.
    Numeric,
    /// String values.
    String,
    /// GeoJSON regions and points.
    Geo2DSphere,
    /// Raw blob values.
    Blob,
}

impl IndexType {
    fn as_str(self) -> &'static str {
        match self {
            IndexType::Numeric => "numeric",
            IndexType::String => "string",
            IndexType::Geo2DSphere => "geo2dsphere",
            IndexType::Blob => "blob",
        }
    }
}

/// A handle onto a running cluster. Cheap to clone; all clones share
/// the same connection pools and tend loop.
#[derive(Clone)]
pub struct Client {
    cluster: Arc<Cluster>,
}

impl Client {
    /// Connects to the cluster described by the configuration.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let cluster = Cluster::connect(config).await?;
        info!(nodes = cluster.current_view().nodes().len(), "connected");
        Ok(Self { cluster })
    }

    /// The cluster tracker behind this client.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// The current membership snapshot.
    pub fn cluster_view(&self) -> Arc<ClusterView> {
        self.cluster.current_view()
    }

    /// Stops the tend loop and closes every pooled connection.
    pub fn close(&self) {
        self.cluster.close();
    }

    /// Reads the named bins of a record, or every bin when `bins` is
    /// empty. A missing record surfaces as a not-found server error;
    /// use [`Client::exists`] for a boolean probe.
    pub async fn get(
        &self,
        policy: &ReadPolicy,
        key: &Key,
        bins: &[&str],
    ) -> Result<Record> {
        commands::get(&self.cluster, policy, key, bins).await
    }

    /// Reads generation and TTL without bin data.
    pub async fn get_header(&self, policy: &ReadPolicy, key: &Key) -> Result<Record> {
        commands::get_header(&self.cluster, policy, key).await
    }

    /// True if the record exists.
    pub async fn exists(&self, policy: &ReadPolicy, key: &Key) -> Result<bool> {
        commands::exists(&self.cluster, policy, key).await
    }

    /// Writes the given bins to a record.
    pub async fn put(
        &self,
        policy: &WritePolicy,
        key: &Key,
        bins: impl IntoIterator<Item = (impl Into<String>, impl Into<Value>)>,
    ) -> Result<()> {
        let bins: Vec<(String, Value)> = bins
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        commands::put(&self.cluster, policy, key, bins).await
    }

    /// Deletes a record; false if it did not exist.
    pub async fn delete(&self, policy: &WritePolicy, key: &Key) -> Result<bool> {
        commands::delete(&self.cluster, policy, key).await
    }

    /// Resets a record's TTL and bumps its generation.
    pub async fn touch(&self, policy: &WritePolicy, key: &Key) -> Result<()> {
        commands::touch(&self.cluster, policy, key).await
    }

    /// Runs a sequence of operations against one record atomically,
    /// returning the read results in bin order.
    pub async fn operate(
        &self,
        policy: &WritePolicy,
        key: &Key,
        ops: &[Operation],
    ) -> Result<Record> {
        commands::operate(&self.cluster, policy, key, ops).await
    }

    /// Invokes a previously registered UDF on one record.
    pub async fn apply_udf(
        &self,
        policy: &WritePolicy,
        key: &Key,
        package: &str,
        function: &str,
        args: &[Value],
    ) -> Result<Option<Value>> {
        commands::apply_udf(&self.cluster, policy, key, package, function, args).await
    }

    /// Reads many records at once; one slot per key, in input order.
    pub async fn batch_get(
        &self,
        policy: &BatchPolicy,
        reads: &[BatchRead],
    ) -> Result<Vec<BatchResult>> {
        batch::batch_get(&self.cluster, policy, reads).await
    }

    /// Applies per-record operations to many records at once; one slot
    /// per key, in input order.
    pub async fn batch_operate(
        &self,
        policy: &BatchPolicy,
        writes: &[BatchWrite],
    ) -> Result<Vec<BatchResult>> {
        batch::batch_operate(&self.cluster, policy, writes).await
    }

    /// Streams every record of a namespace (optionally one set).
    pub async fn scan(
        &self,
        policy: &ScanPolicy,
        namespace: &str,
        set_name: &str,
        bins: &[&str],
    ) -> Result<RecordStream> {
        scan::scan(&self.cluster, policy, namespace, set_name, bins).await
    }

    /// Streams the records matching a secondary-index predicate. With
    /// no filter this degenerates to a scan over the query codepath.
    pub async fn query(
        &self,
        policy: &QueryPolicy,
        namespace: &str,
        set_name: &str,
        filter: Option<IndexFilter>,
        bins: &[&str],
    ) -> Result<RecordStream> {
        scan::query(&self.cluster, policy, namespace, set_name, filter, bins).await
    }

    /// Applies write operations to every record of a set, server side,
    /// returning a task handle to poll for completion.
    pub async fn scan_background(
        &self,
        policy: &ScanPolicy,
        namespace: &str,
        set_name: &str,
        ops: Vec<Operation>,
    ) -> Result<Task> {
        scan::scan_background(&self.cluster, policy, namespace, set_name, ops).await
    }

    /// Sends info commands to one node.
    pub async fn info_node(
        &self,
        node: &Arc<Node>,
        commands: &[&str],
    ) -> Result<HashMap<String, String>> {
        let wait = self.cluster.config().network().connect_timeout();
        let mut conn = node.acquire(Some(wait)).await?;
        match conn.info(commands).await {
            Ok(response) => {
                node.release(conn);
                Ok(response)
            }
            Err(e) => {
                node.forget(conn);
                Err(e)
            }
        }
    }

    /// Sends info commands to an arbitrary node.
    pub async fn info_random_node(&self, commands: &[&str]) -> Result<HashMap<String, String>> {
        let node = self.cluster.random_node()?;
        self.info_node(&node, commands).await
    }

    /// Removes every record of a set (or whole namespace when `set_name`
    /// is empty) written before `before_nanos` (UNIX epoch); `None`
    /// truncates everything present at the time the server processes it.
    pub async fn truncate(
        &self,
        namespace: &str,
        set_name: &str,
        before_nanos: Option<u64>,
    ) -> Result<()> {
        let mut command = format!("truncate:namespace={}", namespace);
        if !set_name.is_empty() {
            command.push_str(&format!(";set={}", set_name));
        }
        if let Some(lut) = before_nanos {
            command.push_str(&format!(";lut={}", lut));
        }
        self.info_ddl(&command).await
    }

    /// Creates a secondary index over one bin.
    pub async fn create_index(
        &self,
        namespace: &str,
        set_name: &str,
        bin: &str,
        index_name: &str,
        index_type: IndexType,
    ) -> Result<()> {
        let mut command = format!("sindex-create:ns={}", namespace);
        if !set_name.is_empty() {
            command.push_str(&format!(";set={}", set_name));
        }
        command.push_str(&format!(
            ";indexname={};indexdata={},{}",
            index_name,
            bin,
            index_type.as_str()
        ));
        self.info_ddl(&command).await
    }

    /// Drops a secondary index.
    pub async fn drop_index(
        &self,
        namespace: &str,
        set_name: &str,
        index_name: &str,
    ) -> Result<()> {
        let mut command = format!("sindex-delete:ns={}", namespace);
        if !set_name.is_empty() {
            command.push_str(&format!(";set={}", set_name));
        }
        command.push_str(&format!(";indexname={}", index_name));
        self.info_ddl(&command).await
    }

    /// Registers a Lua UDF module under the given server-side name.
    pub async fn register_udf(&self, module_name: &str, source: &[u8]) -> Result<()> {
        let content = BASE64.encode(source);
        let command = format!(
            "udf-put:filename={};content={};content-len={};udf-type=LUA",
            module_name,
            content,
            content.len()
        );
        self.info_ddl(&command).await
    }

    /// Removes a registered UDF module.
    pub async fn remove_udf(&self, module_name: &str) -> Result<()> {
        let command = format!("udf-remove:filename={}", module_name);
        self.info_ddl(&command).await
    }

    /// Runs one DDL-flavored info command on a random node and maps an
    /// error value to the matching error.
    async fn info_ddl(&self, command: &str) -> Result<()> {
        let response = self.info_random_node(&[command]).await?;
        let value = response
            .get(command)
            .or_else(|| response.keys().next().and_then(|k| response.get(k)))
            .map(String::as_str)
            .unwrap_or("");
        if aerokv_core::info::is_error_value(value) {
            return Err(info_error(command, value));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("cluster", &self.cluster)
            .finish()
    }
}

/// Maps an `ERROR:<code>:<msg>` / `FAIL:<code>:<msg>` info value onto
/// the matching server error when a numeric code is present.
fn info_error(command: &str, value: &str) -> AerokvError {
    let code = value
        .split(':')
        .nth(1)
        .and_then(|c| c.trim().parse::<u8>().ok());
    match code {
        Some(code) => AerokvError::from_code(code, None),
        None => AerokvError::Cluster(format!("'{}' failed: {}", command, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aerokv_core::ResultCode;

    #[test]
    fn info_error_extracts_code() {
        let err = info_error("sindex-create:...", "FAIL:200:index found");
        assert_eq!(err.result_code(), Some(ResultCode::Unknown(200)));

        let err = info_error("truncate:...", "ERROR::bad");
        assert!(matches!(err, AerokvError::Cluster(_)));
    }

    #[test]
    fn index_type_names() {
        assert_eq!(IndexType::Numeric.as_str(), "numeric");
        assert_eq!(IndexType::Geo2DSphere.as_str(), "geo2dsphere");
    }
}
