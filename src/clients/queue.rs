use std::{
    sync::{
        LazyLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use prost::Message;
use redis::{
    AsyncCommands, Client, ConnectionInfo, ErrorKind, IntoConnectionInfo, RedisConnectionInfo,
    RedisError, RedisResult, Script,
    aio::{ConnectionLike, ConnectionManager, MultiplexedConnection},
    cluster::ClusterClientBuilder,
    cluster_async::ClusterConnection,
    sentinel::{SentinelClient, SentinelNodeConnectionInfo, SentinelServerType},
};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    error::QueueError,
    models::task::{Task, TaskInfo, TaskMessage},
};

const ALL_QUEUES_KEY: &str = "asynq:queues";

/// How long `close` waits for in-flight submissions before giving up on them.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// KEYS[1] task hash, KEYS[2] pending list
// ARGV[1] encoded task message, ARGV[2] task id, ARGV[3] enqueue time in unix nanos
static ENQUEUE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    return 0
end
redis.call("HSET", KEYS[1], "msg", ARGV[1], "state", "pending", "pending_since", ARGV[3])
redis.call("LPUSH", KEYS[2], ARGV[2])
return 1
"#,
    )
});

/// Submission seam between the HTTP handlers and the queue backend.
///
/// Implementations must be usable from many handlers at once without
/// external locking.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<TaskInfo, QueueError>;

    /// Stops accepting tasks and releases the backend once running
    /// submissions finish, waiting at most [`CLOSE_TIMEOUT`]. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueTopology {
    Standalone {
        address: String,
    },
    Failover {
        master_name: String,
        sentinels: Vec<String>,
    },
    Cluster {
        nodes: Vec<String>,
    },
}

impl QueueTopology {
    pub fn name(&self) -> &'static str {
        match self {
            QueueTopology::Standalone { .. } => "standalone",
            QueueTopology::Failover { .. } => "failover",
            QueueTopology::Cluster { .. } => "cluster",
        }
    }

    pub fn addresses(&self) -> Vec<&str> {
        match self {
            QueueTopology::Standalone { address } => vec![address.as_str()],
            QueueTopology::Failover { sentinels, .. } => {
                sentinels.iter().map(String::as_str).collect()
            }
            QueueTopology::Cluster { nodes } => nodes.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub topology: QueueTopology,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: i64,
    pub queue: String,
}

impl QueueOptions {
    /// Resolves the topology. Cluster wins over failover when both are enabled.
    pub fn from_config(config: &Config) -> Result<Self, QueueError> {
        let connections: Vec<String> = config
            .redis_connections
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();

        let topology = if config.redis_cluster {
            if config.redis_failover {
                warn!("Both cluster and failover are enabled, using cluster");
            }
            if connections.is_empty() {
                return Err(QueueError::config(
                    "cluster mode requires at least one address in REDIS_CONNECTIONS",
                ));
            }
            QueueTopology::Cluster { nodes: connections }
        } else if config.redis_failover {
            if config.redis_master_name.trim().is_empty() {
                return Err(QueueError::config("failover mode requires REDIS_MASTER_NAME"));
            }
            if connections.is_empty() {
                return Err(QueueError::config(
                    "failover mode requires at least one sentinel in REDIS_CONNECTIONS",
                ));
            }
            QueueTopology::Failover {
                master_name: config.redis_master_name.trim().to_string(),
                sentinels: connections,
            }
        } else {
            let address = match config.redis_connection.trim() {
                "" => connections.into_iter().next().ok_or_else(|| {
                    QueueError::config("standalone mode requires REDIS_CONNECTION")
                })?,
                address => address.to_string(),
            };
            QueueTopology::Standalone { address }
        };

        if config.queue_name.trim().is_empty() {
            return Err(QueueError::config("QUEUE_NAME cannot be empty"));
        }

        Ok(Self {
            topology,
            username: non_empty(&config.redis_username),
            password: non_empty(&config.redis_password),
            db: config.redis_db,
            queue: config.queue_name.trim().to_string(),
        })
    }

    fn apply_credentials(&self, info: &mut RedisConnectionInfo, select_db: bool) {
        if self.username.is_some() {
            info.username = self.username.clone();
        }
        if self.password.is_some() {
            info.password = self.password.clone();
        }
        if select_db {
            info.db = self.db;
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn node_info(address: &str) -> Result<ConnectionInfo, QueueError> {
    let url = if address.contains("://") {
        address.to_string()
    } else {
        format!("redis://{}", address)
    };

    url.as_str()
        .into_connection_info()
        .map_err(|e| QueueError::config(format!("invalid address '{}': {}", address, e)))
}

fn task_key(queue: &str, id: &str) -> String {
    format!("asynq:{{{}}}:t:{}", queue, id)
}

fn pending_key(queue: &str) -> String {
    format!("asynq:{{{}}}:pending", queue)
}

enum Backend {
    Standalone(ConnectionManager),
    Failover(FailoverBackend),
    Cluster(ClusterConnection),
}

/// Master connection resolved through sentinels, re-resolved after the
/// master goes away or is demoted.
struct FailoverBackend {
    sentinel: Mutex<SentinelClient>,
    master: RwLock<Option<MultiplexedConnection>>,
}

impl FailoverBackend {
    async fn connect(
        master_name: &str,
        sentinels: &[String],
        options: &QueueOptions,
    ) -> Result<Self, QueueError> {
        let sentinel_infos = sentinels
            .iter()
            .map(|s| node_info(s))
            .collect::<Result<Vec<_>, _>>()?;

        let mut master_info = RedisConnectionInfo::default();
        options.apply_credentials(&mut master_info, true);

        let mut client = SentinelClient::build(
            sentinel_infos,
            master_name.to_string(),
            Some(SentinelNodeConnectionInfo {
                tls_mode: None,
                redis_connection_info: Some(master_info),
            }),
            SentinelServerType::Master,
        )
        .map_err(QueueError::Connect)?;

        let connection = client
            .get_async_connection()
            .await
            .map_err(QueueError::Connect)?;

        Ok(Self {
            sentinel: Mutex::new(client),
            master: RwLock::new(Some(connection)),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        if let Some(conn) = self.master.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut sentinel = self.sentinel.lock().await;

        // resolved by another handler while we waited for the lock
        if let Some(conn) = self.master.read().await.as_ref() {
            return Ok(conn.clone());
        }

        debug!("Resolving queue master through sentinels");
        let conn = sentinel
            .get_async_connection()
            .await
            .map_err(QueueError::Connect)?;
        *self.master.write().await = Some(conn.clone());

        Ok(conn)
    }

    async fn invalidate(&self) {
        *self.master.write().await = None;
    }
}

fn master_lost(err: &RedisError) -> bool {
    err.is_connection_dropped() || err.is_io_error() || err.kind() == ErrorKind::ReadOnly
}

/// Owns a backend until close. Users hold a read lease for the whole
/// submission, so the backend is only dropped once no submission is running.
struct BackendSlot<T> {
    backend: RwLock<Option<T>>,
    closed: AtomicBool,
}

impl<T> BackendSlot<T> {
    fn new(backend: T) -> Self {
        Self {
            backend: RwLock::new(Some(backend)),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn acquire(&self) -> Result<RwLockReadGuard<'_, T>, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        RwLockReadGuard::try_map(self.backend.read().await, Option::as_ref)
            .map_err(|_| QueueError::Closed)
    }

    /// Refuses new leases, then takes the backend once current leases end.
    ///
    /// Returns `None` when already closed, or when leases are still held
    /// after `within`. The backend is then dropped with its last lease.
    async fn close(&self, within: Duration) -> Option<T> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }

        match tokio::time::timeout(within, self.backend.write()).await {
            Ok(mut backend) => backend.take(),
            Err(_) => {
                warn!(
                    timeout_ms = within.as_millis() as u64,
                    "Submissions still running at close, releasing backend after them"
                );
                None
            }
        }
    }
}

/// Long-lived handle to the task queue, shared by every request handler.
pub struct QueueClient {
    backend: BackendSlot<Backend>,
    options: QueueOptions,
}

impl QueueClient {
    pub async fn connect(options: QueueOptions) -> Result<Self, QueueError> {
        info!(
            topology = options.topology.name(),
            addresses = ?options.topology.addresses(),
            queue = %options.queue,
            "Connecting to queue backend"
        );

        let backend = match &options.topology {
            QueueTopology::Standalone { address } => {
                let mut info = node_info(address)?;
                options.apply_credentials(&mut info.redis, true);

                let client = Client::open(info).map_err(QueueError::Connect)?;
                let manager = ConnectionManager::new(client)
                    .await
                    .map_err(QueueError::Connect)?;
                Backend::Standalone(manager)
            }
            QueueTopology::Failover {
                master_name,
                sentinels,
            } => Backend::Failover(FailoverBackend::connect(master_name, sentinels, &options).await?),
            QueueTopology::Cluster { nodes } => {
                let infos = nodes
                    .iter()
                    .map(|n| {
                        let mut info = node_info(n)?;
                        options.apply_credentials(&mut info.redis, false);
                        Ok(info)
                    })
                    .collect::<Result<Vec<_>, QueueError>>()?;

                let client = ClusterClientBuilder::new(infos)
                    .build()
                    .map_err(QueueError::Connect)?;
                let connection = client
                    .get_async_connection()
                    .await
                    .map_err(QueueError::Connect)?;
                Backend::Cluster(connection)
            }
        };

        info!(topology = options.topology.name(), "Queue backend connection established");

        Ok(Self {
            backend: BackendSlot::new(backend),
            options,
        })
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.options.topology
    }
}

async fn submit<C>(conn: &mut C, queue: &str, id: &str, message: &[u8]) -> RedisResult<bool>
where
    C: ConnectionLike + Send + Sync,
{
    conn.sadd::<_, _, ()>(ALL_QUEUES_KEY, queue).await?;

    let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let created: i64 = ENQUEUE_SCRIPT
        .key(task_key(queue, id))
        .key(pending_key(queue))
        .arg(message)
        .arg(id)
        .arg(now)
        .invoke_async(conn)
        .await?;

    Ok(created == 1)
}

#[async_trait]
impl TaskQueue for QueueClient {
    async fn enqueue(&self, task: Task) -> Result<TaskInfo, QueueError> {
        let backend = self.backend.acquire().await?;

        let id = Uuid::new_v4().to_string();
        let queue = self.options.queue.as_str();
        let message = TaskMessage::pending(&task, id.clone(), queue.to_string()).encode_to_vec();

        let created = match &*backend {
            Backend::Standalone(manager) => {
                submit(&mut manager.clone(), queue, &id, &message).await
            }
            Backend::Failover(failover) => {
                let mut conn = failover.connection().await?;
                let result = submit(&mut conn, queue, &id, &message).await;
                if let Err(e) = &result
                    && master_lost(e)
                {
                    warn!(error = %e, "Lost queue master, will re-resolve on next submission");
                    failover.invalidate().await;
                }
                result
            }
            Backend::Cluster(connection) => {
                submit(&mut connection.clone(), queue, &id, &message).await
            }
        }
        .map_err(QueueError::Enqueue)?;

        if !created {
            return Err(QueueError::Conflict(id));
        }

        debug!(task_id = %id, queue, kind = %task.kind, "Task enqueued");

        Ok(TaskInfo {
            id,
            queue: queue.to_string(),
            kind: task.kind,
        })
    }

    async fn close(&self) {
        if let Some(backend) = self.backend.close(CLOSE_TIMEOUT).await {
            drop(backend);
            info!(topology = self.options.topology.name(), "Queue client closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.backend.is_closed()
    }
}
