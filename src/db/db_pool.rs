use duckdb::{AccessMode, Config, Connection};
use r2d2::ManageConnection;

/// Hands out connections opened with DuckDB's read-only access mode.
/// Even a query the guard wrongly accepted cannot write through one.
pub struct ReadOnlyConnectionManager {
    db_path: String,
}

impl ReadOnlyConnectionManager {
    pub fn new(db_path: String) -> Self {
        Self { db_path }
    }
}

impl ManageConnection for ReadOnlyConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let config = Config::default().access_mode(AccessMode::ReadOnly)?;
        Connection::open_with_flags(&self.db_path, config)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute_batch("SELECT 1")
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}
