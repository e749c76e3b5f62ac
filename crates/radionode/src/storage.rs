//! SQLite backed local discovery directory
//!
//! Lets several nodes on one host find each other (and relay negotiation
//! messages) through a shared database file while no rendezvous server is
//! reachable.

use anyhow::Result;
use meshradio_network::{NetworkError, PeerDirectory, SignalMailbox};
use meshradio_protocol::{NodeId, PeerRecord, SignalMessage};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

fn db_error(e: sqlx::Error) -> NetworkError {
    NetworkError::Directory(e.to_string())
}

/// Discovery directory and signaling mailbox in a SQLite database
pub struct SqliteDirectory {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteDirectory {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());

        info!("Opening database: {}", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        Self::migrate(&pool).await?;

        Ok(Self {
            pool,
            path: db_path.to_path_buf(),
        })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS discovery_peers (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signal_mailbox (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient TEXT NOT NULL,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait::async_trait]
impl PeerDirectory for SqliteDirectory {
    async fn read(&self) -> meshradio_network::Result<Vec<PeerRecord>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT id, timestamp FROM discovery_peers ORDER BY timestamp, id")
                .fetch_all(&self.pool)
                .await
                .map_err(db_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, timestamp) in rows {
            match NodeId::parse(&id) {
                Ok(id) => records.push(PeerRecord::new(id, timestamp.max(0) as u64)),
                Err(e) => warn!("Skipping invalid directory entry {:?}: {}", id, e),
            }
        }
        Ok(records)
    }

    async fn write(&self, records: &[PeerRecord]) -> meshradio_network::Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query("DELETE FROM discovery_peers")
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        for record in records {
            sqlx::query("INSERT OR REPLACE INTO discovery_peers (id, timestamp) VALUES (?, ?)")
                .bind(record.id.as_str())
                .bind(record.timestamp as i64)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)
    }

    fn mailbox(&self) -> Option<&dyn SignalMailbox> {
        Some(self)
    }

    fn describe(&self) -> String {
        format!("sqlite {}", self.path.display())
    }
}

#[async_trait::async_trait]
impl SignalMailbox for SqliteDirectory {
    async fn post(&self, message: &SignalMessage) -> meshradio_network::Result<()> {
        let target = message.target().ok_or_else(|| {
            NetworkError::Directory(format!("{} has no target", message.type_name()))
        })?;
        let body = message.encode()?;

        sqlx::query("INSERT INTO signal_mailbox (recipient, body) VALUES (?, ?)")
            .bind(target.as_str())
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn take(&self, recipient: &NodeId) -> meshradio_network::Result<Vec<SignalMessage>> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT seq, body FROM signal_mailbox WHERE recipient = ? ORDER BY seq",
        )
        .bind(recipient.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;

        if let Some((last, _)) = rows.last() {
            sqlx::query("DELETE FROM signal_mailbox WHERE recipient = ? AND seq <= ?")
                .bind(recipient.as_str())
                .bind(*last)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }
        tx.commit().await.map_err(db_error)?;

        let mut messages = Vec::with_capacity(rows.len());
        for (_, body) in rows {
            match SignalMessage::decode(&body) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Dropping unreadable mailbox entry: {}", e),
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshradio_network::directory::announce;
    use meshradio_protocol::SessionDescription;
    use tempfile::TempDir;

    fn node(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("radionode.db");

        let store = SqliteDirectory::open(&path).await.unwrap();
        store
            .write(&[PeerRecord::new(node("a"), 10), PeerRecord::new(node("b"), 20)])
            .await
            .unwrap();
        store.close().await;

        let reopened = SqliteDirectory::open(&path).await.unwrap();
        assert_eq!(
            reopened.read().await.unwrap(),
            vec![PeerRecord::new(node("a"), 10), PeerRecord::new(node("b"), 20)]
        );
    }

    #[tokio::test]
    async fn test_announce_through_shared_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.db");
        let first = SqliteDirectory::open(&path).await.unwrap();
        let second = SqliteDirectory::open(&path).await.unwrap();
        let window = 60_000;

        assert!(announce(&first, &node("a"), 1_000, window).await.unwrap().is_empty());
        let peers = announce(&second, &node("b"), 2_000, window).await.unwrap();
        assert_eq!(peers, vec![node("a")]);

        // a's record has gone stale by now
        let peers = announce(&second, &node("b"), 100_000, window).await.unwrap();
        assert!(peers.is_empty());
        assert_eq!(second.read().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mailbox_delivers_in_order_once() {
        let dir = TempDir::new().unwrap();
        let store = SqliteDirectory::open(&dir.path().join("mailbox.db")).await.unwrap();

        let first = SignalMessage::Offer {
            offer: SessionDescription::offer("tcp 127.0.0.1:1"),
            target: node("b"),
            from: node("a"),
        };
        let second = SignalMessage::Answer {
            answer: SessionDescription::answer("tcp 127.0.0.1:2"),
            target: node("b"),
            from: node("c"),
        };
        store.post(&first).await.unwrap();
        store.post(&second).await.unwrap();

        assert!(store.take(&node("a")).await.unwrap().is_empty());
        assert_eq!(store.take(&node("b")).await.unwrap(), vec![first, second]);
        assert!(store.take(&node("b")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_untargeted_messages_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = SqliteDirectory::open(&dir.path().join("mailbox.db")).await.unwrap();
        let result = store.post(&SignalMessage::PeerJoined { id: node("a") }).await;
        assert!(matches!(result, Err(NetworkError::Directory(_))));
    }
}
