//! Connection pool management for the embedded DuckDB database.
//!
//! The pool is a fixed-size stack of connections to one database, created
//! at startup. Acquisition pops a connection or fails immediately; it never
//! blocks or grows the pool. A [`PooledConnection`] guard returns its
//! connection on every exit path.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Arc, Mutex};

use duckdb::Connection;
use tracing::{debug, info};

use crate::{Error, Result};

/// A fixed-size pool of DuckDB connections.
pub struct DuckDbPool {
    connections: Mutex<Vec<Connection>>,
    size: usize,
}

impl DuckDbPool {
    /// Open a database file and build a pool of `size` connections to it.
    pub fn open(path: impl AsRef<Path>, size: usize) -> Result<Arc<Self>> {
        let path = path.as_ref();
        info!(path = %path.display(), size, "opening DuckDB connection pool");
        let base = Connection::open(path)?;
        Self::build(base, size)
    }

    /// Build a pool over an in-memory database. All connections share the
    /// same database instance.
    pub fn open_in_memory(size: usize) -> Result<Arc<Self>> {
        let base = Connection::open_in_memory()?;
        Self::build(base, size)
    }

    fn build(base: Connection, size: usize) -> Result<Arc<Self>> {
        if size == 0 {
            return Err(Error::InvalidPoolSize(size));
        }
        let mut connections = Vec::with_capacity(size);
        for _ in 1..size {
            connections.push(base.try_clone()?);
        }
        connections.push(base);
        debug!(size, "DuckDB connection pool ready");
        Ok(Arc::new(Self {
            connections: Mutex::new(connections),
            size,
        }))
    }

    /// Pop a connection from the pool.
    ///
    /// # Errors
    ///
    /// Fails immediately with [`Error::NoConnectionAvailable`] when every
    /// connection is checked out; acquisition never waits.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let connection = self
            .connections
            .lock()
            .expect("connection pool lock")
            .pop()
            .ok_or(Error::NoConnectionAvailable)?;
        Ok(PooledConnection {
            connection: Some(connection),
            pool: Arc::clone(self),
        })
    }

    /// The configured pool size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Connections currently checked in.
    pub fn available(&self) -> usize {
        self.connections.lock().expect("connection pool lock").len()
    }

    fn release(&self, connection: Connection) {
        self.connections
            .lock()
            .expect("connection pool lock")
            .push(connection);
    }
}

/// A connection checked out of a [`DuckDbPool`].
///
/// Dereferences to [`duckdb::Connection`]; the connection returns to the
/// pool when the guard drops, on success and error paths alike.
pub struct PooledConnection {
    connection: Option<Connection>,
    pool: Arc<DuckDbPool>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection.as_ref().expect("live pooled connection")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection.as_mut().expect("live pooled connection")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}
