//! Server pool
//!
//! Binds the generic resource pool to upstream connection lifecycles:
//! checkout/return with semaphore admission, generational invalidation,
//! background maintenance, and a bounded disconnect drain.

use super::connection::Connection;
use super::monitor::{emit, EventType, Monitor};
use super::resource::{ResourceHooks, ResourcePool, ResourcePoolOptions};
use super::wrapper::ConnectionWrapper;
use crate::config::PoolConfig;
use crate::error::{ConfigError, PoolError};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Server pool lifecycle states. Only `Connected` accepts checkouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    /// Initial and final state
    Disconnected = 0,
    /// Installing the resource pool
    Connecting = 1,
    /// Serving checkouts
    Connected = 2,
    /// Draining outstanding wrappers
    Disconnecting = 3,
}

impl ServerState {
    fn from_u8(value: u8) -> ServerState {
        match value {
            1 => ServerState::Connecting,
            2 => ServerState::Connected,
            3 => ServerState::Disconnecting,
            _ => ServerState::Disconnected,
        }
    }
}

/// Hooks binding the resource pool to connection lifecycles.
struct ConnectionLifecycle {
    address: String,
    state: Arc<AtomicU8>,
    generation: Arc<AtomicU64>,
    idle_timeout: Option<Duration>,
    monitor: Option<Arc<dyn Monitor>>,
}

impl ConnectionLifecycle {
    fn pool_open(&self) -> bool {
        matches!(
            ServerState::from_u8(self.state.load(Ordering::SeqCst)),
            ServerState::Connecting | ServerState::Connected
        )
    }
}

impl ResourceHooks<Connection> for ConnectionLifecycle {
    fn init(&self) -> Option<Connection> {
        // the dial is deferred to the first checkout
        let conn = Connection::new(
            &self.address,
            self.generation.load(Ordering::SeqCst),
            self.idle_timeout,
        );
        emit(
            &self.monitor,
            EventType::ConnectionCreated,
            &self.address,
            conn.id(),
            None,
        );
        Some(conn)
    }

    fn is_expired(&self, conn: &Connection) -> bool {
        conn.expired(self.pool_open(), self.generation.load(Ordering::SeqCst))
    }

    fn close(&self, mut conn: Connection) {
        let id = conn.id();
        let reason = conn.expire_reason().map(|r| r.as_str());
        conn.close();
        emit(
            &self.monitor,
            EventType::ConnectionClosed,
            &self.address,
            id,
            reason,
        );
    }
}

/// State shared between the pool, its wrappers, and the maintenance task.
pub(crate) struct ServerShared {
    address: String,
    config: PoolConfig,
    state: Arc<AtomicU8>,
    generation: Arc<AtomicU64>,
    semaphore: Arc<Semaphore>,
    pool: ResourcePool<Connection>,
    monitor: Option<Arc<dyn Monitor>>,
}

impl ServerShared {
    fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn is_open(&self) -> bool {
        matches!(
            self.state(),
            ServerState::Connecting | ServerState::Connected
        )
    }

    fn transition(&self, from: ServerState, to: ServerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Accept a connection back from a wrapper. `discard` is set when the
    /// caller marked the wrapper closed.
    pub(crate) fn check_in(&self, mut conn: Connection, discard: bool) {
        let id = conn.id();
        let generation = self.generation.load(Ordering::SeqCst);

        if discard || conn.expired(self.is_open(), generation) {
            let reason = conn.expire_reason().map(|r| r.as_str());
            conn.close();
            self.pool.decrement_total();
            emit(
                &self.monitor,
                EventType::ConnectionReturned,
                &self.address,
                id,
                None,
            );
            emit(
                &self.monitor,
                EventType::ConnectionClosed,
                &self.address,
                id,
                reason,
            );
            return;
        }

        conn.touch();
        if self.pool.put(conn) {
            emit(
                &self.monitor,
                EventType::ConnectionReturned,
                &self.address,
                id,
                None,
            );
        } else {
            // the pool shut down while this connection was out; the pool's
            // close hook already disposed of it
            self.pool.decrement_total();
            emit(
                &self.monitor,
                EventType::ConnectionReturned,
                &self.address,
                id,
                Some("pool_closed"),
            );
        }
    }
}

/// An upstream server pool.
pub struct Server {
    shared: Arc<ServerShared>,
    maintenance: CancellationToken,
}

impl Server {
    /// Build a pool for `address` and bring it to `Connected`: install the
    /// resource pool, start the maintenance task, and pre-fill up to
    /// `min_size`. Connections are minted undialed; the first checkout
    /// dials them.
    pub fn connect(
        address: &str,
        config: PoolConfig,
        monitor: Option<Arc<dyn Monitor>>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let state = Arc::new(AtomicU8::new(ServerState::Disconnected as u8));
        let generation = Arc::new(AtomicU64::new(0));

        state.store(ServerState::Connecting as u8, Ordering::SeqCst);

        let hooks = ConnectionLifecycle {
            address: address.to_string(),
            state: state.clone(),
            generation: generation.clone(),
            idle_timeout: config.connection_idle_timeout(),
            monitor: monitor.clone(),
        };

        let pool = ResourcePool::new(
            ResourcePoolOptions {
                min_size: config.min_size,
                max_size: config.max_size,
                maintain_interval: config.maintain_interval(),
            },
            Box::new(hooks),
        )?;

        let shared = Arc::new(ServerShared {
            address: address.to_string(),
            semaphore: Arc::new(Semaphore::new(config.max_size as usize)),
            config,
            state,
            generation,
            pool,
            monitor,
        });

        shared.transition(ServerState::Connecting, ServerState::Connected);
        emit(
            &shared.monitor,
            EventType::PoolCreated,
            &shared.address,
            0,
            None,
        );

        shared.pool.maintain();

        let maintenance = CancellationToken::new();
        let task_shared = shared.clone();
        let task_cancel = maintenance.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(task_shared.pool.maintain_interval());
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        debug!(address = %task_shared.address, "pool maintenance stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        task_shared.pool.maintain();
                    }
                }
            }
        });

        info!(address = %shared.address, min = shared.config.min_size, max = shared.config.max_size, "pool connected");
        Ok(Arc::new(Server {
            shared,
            maintenance,
        }))
    }

    /// Upstream address the pool serves.
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    /// Current pool generation.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Connections currently held in the pool.
    pub fn size(&self) -> u64 {
        self.shared.pool.size()
    }

    /// Connections held plus connections checked out.
    pub fn total_size(&self) -> u64 {
        self.shared.pool.total_size()
    }

    /// Bump the generation, logically expiring every connection minted
    /// before the bump. Pooled stale connections fall to maintenance or
    /// to the checkout filter.
    pub fn clear(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        emit(
            &self.shared.monitor,
            EventType::PoolCleared,
            &self.shared.address,
            0,
            None,
        );
    }

    /// Check out a connection, honoring `cancel` and an optional deadline
    /// while waiting for a semaphore permit. Expired pooled connections
    /// are discarded on the way; undialed connections are dialed here.
    pub async fn checkout(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<ConnectionWrapper, PoolError> {
        let shared = &self.shared;

        if shared.state() != ServerState::Connected {
            return Err(PoolError::Closed {
                address: shared.address.clone(),
            });
        }

        let acquire = shared.semaphore.clone().acquire_owned();
        let permit = if let Some(deadline) = deadline {
            tokio::select! {
                res = acquire => res.map_err(|_| PoolError::Closed {
                    address: shared.address.clone(),
                })?,
                _ = cancel.cancelled() => {
                    return Err(PoolError::Cancelled { address: shared.address.clone() });
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(PoolError::Timeout { address: shared.address.clone() });
                }
            }
        } else {
            tokio::select! {
                res = acquire => res.map_err(|_| PoolError::Closed {
                    address: shared.address.clone(),
                })?,
                _ = cancel.cancelled() => {
                    return Err(PoolError::Cancelled { address: shared.address.clone() });
                }
            }
        };

        // the pool may have started disconnecting while we waited
        if shared.state() != ServerState::Connected {
            return Err(PoolError::Closed {
                address: shared.address.clone(),
            });
        }

        loop {
            let mut conn = match shared.pool.get() {
                Some(conn) => conn,
                None => {
                    if !shared.pool.increment_total() {
                        // unreachable while the semaphore bounds
                        // concurrency at max_size
                        emit(
                            &shared.monitor,
                            EventType::GetFailed,
                            &shared.address,
                            0,
                            Some("pool_full"),
                        );
                        return Err(PoolError::Full {
                            address: shared.address.clone(),
                        });
                    }
                    let conn = Connection::new(
                        &shared.address,
                        shared.generation.load(Ordering::SeqCst),
                        shared.config.connection_idle_timeout(),
                    );
                    emit(
                        &shared.monitor,
                        EventType::ConnectionCreated,
                        &shared.address,
                        conn.id(),
                        None,
                    );
                    conn
                }
            };

            if conn.expired(shared.is_open(), shared.generation.load(Ordering::SeqCst)) {
                let id = conn.id();
                let reason = conn.expire_reason().map(|r| r.as_str());
                conn.close();
                shared.pool.decrement_total();
                emit(
                    &shared.monitor,
                    EventType::ConnectionClosed,
                    &shared.address,
                    id,
                    reason,
                );
                continue;
            }

            if !conn.is_dialed() {
                if let Err(e) = conn.connect(shared.config.connect_timeout()).await {
                    shared.pool.decrement_total();
                    emit(
                        &shared.monitor,
                        EventType::ConnectionClosed,
                        &shared.address,
                        conn.id(),
                        Some("dial_failed"),
                    );
                    emit(
                        &shared.monitor,
                        EventType::GetFailed,
                        &shared.address,
                        conn.id(),
                        Some("dial_failed"),
                    );
                    return Err(e);
                }
            }

            conn.touch();
            emit(
                &shared.monitor,
                EventType::GetSucceeded,
                &shared.address,
                conn.id(),
                None,
            );
            return Ok(ConnectionWrapper::new(conn, shared.clone(), permit));
        }
    }

    /// Drain and shut down: `Connected -> Disconnecting`, wait for every
    /// outstanding wrapper bounded by `deadline`, close the resource pool,
    /// `-> Disconnected`. Wrappers still out after the deadline find the
    /// pool closed when they return and dispose of their connections.
    pub async fn disconnect(&self, deadline: Option<Instant>) -> Result<(), PoolError> {
        if !self
            .shared
            .transition(ServerState::Connected, ServerState::Disconnecting)
        {
            return Err(PoolError::Closed {
                address: self.shared.address.clone(),
            });
        }

        self.maintenance.cancel();

        let permits = self.shared.config.max_size.min(u32::MAX as u64) as u32;
        let drain = self.shared.semaphore.acquire_many(permits);
        match deadline {
            Some(deadline) => {
                if tokio::time::timeout_at(deadline, drain).await.is_err() {
                    warn!(address = %self.shared.address, "disconnect drain timed out; closing with connections in flight");
                }
            }
            None => {
                let _ = drain.await;
            }
        }

        self.shared.pool.close();
        self.shared
            .transition(ServerState::Disconnecting, ServerState::Disconnected);
        emit(
            &self.shared.monitor,
            EventType::PoolClosed,
            &self.shared.address,
            0,
            None,
        );
        info!(address = %self.shared.address, "pool disconnected");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.maintenance.cancel();
    }
}
