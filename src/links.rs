//! Link directory: which channel pairs are relayed, and in which languages.
//!
//! Links are stored directionally, one row per direction, so a lookup by
//! source channel is a single keyed read. `link_pair` always writes both
//! directions.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::DirectoryError;
use crate::events::Id;

/// Resolved relay target for a source channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    pub target_channel: Id,
    pub source_lang: String,
    pub target_lang: String,
}

/// One direction of a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLink {
    pub guild_id: Id,
    pub channel_a: Id,
    pub lang_a: String,
    pub channel_b: Id,
    pub lang_b: String,
}

impl ChannelLink {
    fn target(&self) -> LinkTarget {
        LinkTarget {
            target_channel: self.channel_b,
            source_lang: self.lang_a.clone(),
            target_lang: self.lang_b.clone(),
        }
    }

    fn reversed(&self) -> Self {
        Self {
            guild_id: self.guild_id,
            channel_a: self.channel_b,
            lang_a: self.lang_b.clone(),
            channel_b: self.channel_a,
            lang_b: self.lang_a.clone(),
        }
    }

    fn touches(&self, channel: Id) -> bool {
        self.channel_a == channel || self.channel_b == channel
    }

    fn pair_key(&self) -> (Id, Id) {
        if self.channel_a <= self.channel_b {
            (self.channel_a, self.channel_b)
        } else {
            (self.channel_b, self.channel_a)
        }
    }
}

/// Keep one direction per channel pair
fn dedupe_pairs(links: Vec<ChannelLink>) -> Vec<ChannelLink> {
    let mut seen = HashSet::new();
    links
        .into_iter()
        .filter(|link| seen.insert(link.pair_key()))
        .collect()
}

pub trait LinkDirectory: Send + Sync {
    fn get_link(&self, guild: Id, channel: Id) -> BoxFuture<'_, Result<Option<LinkTarget>, DirectoryError>>;

    /// Link two channels both ways, replacing any link either channel had
    fn link_pair<'a>(
        &'a self,
        guild: Id,
        channel_a: Id,
        lang_a: &'a str,
        channel_b: Id,
        lang_b: &'a str,
    ) -> BoxFuture<'a, Result<(), DirectoryError>>;

    /// Remove the link between two channels. Returns rows removed.
    fn unlink_pair(&self, guild: Id, channel_a: Id, channel_b: Id) -> BoxFuture<'_, Result<u64, DirectoryError>>;

    /// Remove every link touching a channel
    fn unlink_channel(&self, guild: Id, channel: Id) -> BoxFuture<'_, Result<u64, DirectoryError>>;

    fn unlink_all(&self, guild: Id) -> BoxFuture<'_, Result<u64, DirectoryError>>;

    /// Links in a guild, one entry per pair
    fn list_links(&self, guild: Id) -> BoxFuture<'_, Result<Vec<ChannelLink>, DirectoryError>>;
}

// ==================== PostgreSQL ====================

pub type DbPool = Pool<Postgres>;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS channel_links (
    guild_id BIGINT NOT NULL,
    ch_a BIGINT NOT NULL,
    lang_a TEXT NOT NULL,
    ch_b BIGINT NOT NULL,
    lang_b TEXT NOT NULL,
    PRIMARY KEY (guild_id, ch_a)
)
"#;

fn to_db(id: Id) -> i64 {
    id.0 as i64
}

fn from_db(value: i64) -> Id {
    Id(value as u64)
}

type LinkRow = (i64, i64, String, i64, String);

fn row_to_link((guild, ch_a, lang_a, ch_b, lang_b): LinkRow) -> ChannelLink {
    ChannelLink {
        guild_id: from_db(guild),
        channel_a: from_db(ch_a),
        lang_a,
        channel_b: from_db(ch_b),
        lang_b,
    }
}

pub struct PgLinkDirectory {
    pool: DbPool,
}

impl PgLinkDirectory {
    /// Connect and create the links table if needed
    pub async fn connect(database_url: &str) -> Result<Self, DirectoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        let directory = Self { pool };
        directory.init_schema().await?;
        Ok(directory)
    }

    pub fn from_pool(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), DirectoryError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        info!("Link table ready");
        Ok(())
    }

    async fn fetch_link(&self, guild: Id, channel: Id) -> Result<Option<LinkTarget>, DirectoryError> {
        let row = sqlx::query_as::<_, LinkRow>(
            "SELECT guild_id, ch_a, lang_a, ch_b, lang_b FROM channel_links WHERE guild_id = $1 AND ch_a = $2",
        )
        .bind(to_db(guild))
        .bind(to_db(channel))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row_to_link(row).target()))
    }

    async fn store_pair(
        &self,
        guild: Id,
        channel_a: Id,
        lang_a: &str,
        channel_b: Id,
        lang_b: &str,
    ) -> Result<(), DirectoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM channel_links WHERE guild_id = $1 AND (ch_a IN ($2, $3) OR ch_b IN ($2, $3))",
        )
        .bind(to_db(guild))
        .bind(to_db(channel_a))
        .bind(to_db(channel_b))
        .execute(&mut *tx)
        .await?;

        for (src, src_lang, dst, dst_lang) in [
            (channel_a, lang_a, channel_b, lang_b),
            (channel_b, lang_b, channel_a, lang_a),
        ] {
            sqlx::query(
                "INSERT INTO channel_links (guild_id, ch_a, lang_a, ch_b, lang_b) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(to_db(guild))
            .bind(to_db(src))
            .bind(src_lang)
            .bind(to_db(dst))
            .bind(dst_lang)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_pair(&self, guild: Id, channel_a: Id, channel_b: Id) -> Result<u64, DirectoryError> {
        let result = sqlx::query(
            "DELETE FROM channel_links WHERE guild_id = $1 AND ((ch_a = $2 AND ch_b = $3) OR (ch_a = $3 AND ch_b = $2))",
        )
        .bind(to_db(guild))
        .bind(to_db(channel_a))
        .bind(to_db(channel_b))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_channel(&self, guild: Id, channel: Id) -> Result<u64, DirectoryError> {
        let result = sqlx::query("DELETE FROM channel_links WHERE guild_id = $1 AND (ch_a = $2 OR ch_b = $2)")
            .bind(to_db(guild))
            .bind(to_db(channel))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_guild(&self, guild: Id) -> Result<u64, DirectoryError> {
        let result = sqlx::query("DELETE FROM channel_links WHERE guild_id = $1")
            .bind(to_db(guild))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_guild(&self, guild: Id) -> Result<Vec<ChannelLink>, DirectoryError> {
        let rows = sqlx::query_as::<_, LinkRow>(
            "SELECT guild_id, ch_a, lang_a, ch_b, lang_b FROM channel_links WHERE guild_id = $1 ORDER BY ch_a",
        )
        .bind(to_db(guild))
        .fetch_all(&self.pool)
        .await?;
        Ok(dedupe_pairs(rows.into_iter().map(row_to_link).collect()))
    }
}

impl LinkDirectory for PgLinkDirectory {
    fn get_link(&self, guild: Id, channel: Id) -> BoxFuture<'_, Result<Option<LinkTarget>, DirectoryError>> {
        Box::pin(self.fetch_link(guild, channel))
    }

    fn link_pair<'a>(
        &'a self,
        guild: Id,
        channel_a: Id,
        lang_a: &'a str,
        channel_b: Id,
        lang_b: &'a str,
    ) -> BoxFuture<'a, Result<(), DirectoryError>> {
        Box::pin(self.store_pair(guild, channel_a, lang_a, channel_b, lang_b))
    }

    fn unlink_pair(&self, guild: Id, channel_a: Id, channel_b: Id) -> BoxFuture<'_, Result<u64, DirectoryError>> {
        Box::pin(self.delete_pair(guild, channel_a, channel_b))
    }

    fn unlink_channel(&self, guild: Id, channel: Id) -> BoxFuture<'_, Result<u64, DirectoryError>> {
        Box::pin(self.delete_channel(guild, channel))
    }

    fn unlink_all(&self, guild: Id) -> BoxFuture<'_, Result<u64, DirectoryError>> {
        Box::pin(self.delete_guild(guild))
    }

    fn list_links(&self, guild: Id) -> BoxFuture<'_, Result<Vec<ChannelLink>, DirectoryError>> {
        Box::pin(self.fetch_guild(guild))
    }
}

// ==================== JSON file ====================

/// Link directory kept in memory and persisted to a JSON file on every change.
/// Without a path it is purely in-memory.
pub struct FileLinkDirectory {
    path: Option<PathBuf>,
    links: Mutex<Vec<ChannelLink>>,
}

impl FileLinkDirectory {
    /// Load links from `path`; a missing file starts empty
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let path = path.as_ref().to_path_buf();
        let links = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => Vec::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!("Loaded {} link rows from {}", links.len(), path.display());
        Ok(Self {
            path: Some(path),
            links: Mutex::new(links),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            links: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ChannelLink>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a mutation and persist if anything changed. Returns rows removed or added.
    async fn mutate<F>(&self, change: F) -> Result<u64, DirectoryError>
    where
        F: FnOnce(&mut Vec<ChannelLink>) -> u64,
    {
        let (changed, snapshot) = {
            let mut links = self.lock();
            let changed = change(&mut links);
            let snapshot = if changed > 0 && self.path.is_some() {
                Some(serde_json::to_vec_pretty(&*links)?)
            } else {
                None
            };
            (changed, snapshot)
        };

        if let (Some(path), Some(bytes)) = (&self.path, snapshot) {
            tokio::fs::write(path, bytes).await?;
            debug!("Persisted links to {}", path.display());
        }
        Ok(changed)
    }

    fn remove_where<P: Fn(&ChannelLink) -> bool>(links: &mut Vec<ChannelLink>, predicate: P) -> u64 {
        let before = links.len();
        links.retain(|link| !predicate(link));
        (before - links.len()) as u64
    }
}

impl LinkDirectory for FileLinkDirectory {
    fn get_link(&self, guild: Id, channel: Id) -> BoxFuture<'_, Result<Option<LinkTarget>, DirectoryError>> {
        let found = self
            .lock()
            .iter()
            .find(|link| link.guild_id == guild && link.channel_a == channel)
            .map(ChannelLink::target);
        Box::pin(async move { Ok(found) })
    }

    fn link_pair<'a>(
        &'a self,
        guild: Id,
        channel_a: Id,
        lang_a: &'a str,
        channel_b: Id,
        lang_b: &'a str,
    ) -> BoxFuture<'a, Result<(), DirectoryError>> {
        let forward = ChannelLink {
            guild_id: guild,
            channel_a,
            lang_a: lang_a.to_string(),
            channel_b,
            lang_b: lang_b.to_string(),
        };
        Box::pin(async move {
            self.mutate(|links| {
                Self::remove_where(links, |l| {
                    l.guild_id == guild && (l.touches(channel_a) || l.touches(channel_b))
                });
                let backward = forward.reversed();
                links.push(forward);
                links.push(backward);
                2
            })
            .await?;
            Ok(())
        })
    }

    fn unlink_pair(&self, guild: Id, channel_a: Id, channel_b: Id) -> BoxFuture<'_, Result<u64, DirectoryError>> {
        Box::pin(self.mutate(move |links| {
            Self::remove_where(links, |l| {
                l.guild_id == guild && l.touches(channel_a) && l.touches(channel_b)
            })
        }))
    }

    fn unlink_channel(&self, guild: Id, channel: Id) -> BoxFuture<'_, Result<u64, DirectoryError>> {
        Box::pin(self.mutate(move |links| {
            Self::remove_where(links, |l| l.guild_id == guild && l.touches(channel))
        }))
    }

    fn unlink_all(&self, guild: Id) -> BoxFuture<'_, Result<u64, DirectoryError>> {
        Box::pin(self.mutate(move |links| Self::remove_where(links, |l| l.guild_id == guild)))
    }

    fn list_links(&self, guild: Id) -> BoxFuture<'_, Result<Vec<ChannelLink>, DirectoryError>> {
        let links: Vec<ChannelLink> = self
            .lock()
            .iter()
            .filter(|link| link.guild_id == guild)
            .cloned()
            .collect();
        Box::pin(async move { Ok(dedupe_pairs(links)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GUILD: Id = Id(1);

    // ==================== File Directory ====================

    #[tokio::test]
    async fn test_link_pair_is_bidirectional() {
        let dir = FileLinkDirectory::in_memory();
        dir.link_pair(GUILD, Id(10), "en", Id(20), "es").await.unwrap();

        let forward = dir.get_link(GUILD, Id(10)).await.unwrap().unwrap();
        assert_eq!(forward.target_channel, Id(20));
        assert_eq!(forward.source_lang, "en");
        assert_eq!(forward.target_lang, "es");

        let backward = dir.get_link(GUILD, Id(20)).await.unwrap().unwrap();
        assert_eq!(backward.target_channel, Id(10));
        assert_eq!(backward.source_lang, "es");
        assert_eq!(backward.target_lang, "en");
    }

    #[tokio::test]
    async fn test_unlinked_channel_has_no_target() {
        let dir = FileLinkDirectory::in_memory();
        assert!(dir.get_link(GUILD, Id(10)).await.unwrap().is_none());

        dir.link_pair(GUILD, Id(10), "en", Id(20), "es").await.unwrap();
        assert!(dir.get_link(Id(2), Id(10)).await.unwrap().is_none(), "scoped by guild");
    }

    #[tokio::test]
    async fn test_relinking_replaces_previous_pairs() {
        let dir = FileLinkDirectory::in_memory();
        dir.link_pair(GUILD, Id(10), "en", Id(20), "es").await.unwrap();
        dir.link_pair(GUILD, Id(10), "en", Id(30), "fr").await.unwrap();

        assert_eq!(
            dir.get_link(GUILD, Id(10)).await.unwrap().unwrap().target_channel,
            Id(30)
        );
        assert!(dir.get_link(GUILD, Id(20)).await.unwrap().is_none());
        assert_eq!(dir.list_links(GUILD).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unlink_operations() {
        let dir = FileLinkDirectory::in_memory();
        dir.link_pair(GUILD, Id(10), "en", Id(20), "es").await.unwrap();
        dir.link_pair(GUILD, Id(30), "en", Id(40), "de").await.unwrap();
        dir.link_pair(Id(2), Id(50), "en", Id(60), "ja").await.unwrap();

        assert_eq!(dir.unlink_pair(GUILD, Id(20), Id(10)).await.unwrap(), 2);
        assert!(dir.get_link(GUILD, Id(10)).await.unwrap().is_none());

        assert_eq!(dir.unlink_channel(GUILD, Id(40)).await.unwrap(), 2);
        assert!(dir.get_link(GUILD, Id(30)).await.unwrap().is_none());

        assert_eq!(dir.unlink_all(Id(2)).await.unwrap(), 2);
        assert_eq!(dir.unlink_all(Id(2)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_links_one_entry_per_pair() {
        let dir = FileLinkDirectory::in_memory();
        dir.link_pair(GUILD, Id(10), "en", Id(20), "es").await.unwrap();
        dir.link_pair(GUILD, Id(30), "pt", Id(40), "it").await.unwrap();

        let links = dir.list_links(GUILD).await.unwrap();
        assert_eq!(links.len(), 2);
        assert!(dir.list_links(Id(9)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_links_persist_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("links.json");

        {
            let dir = FileLinkDirectory::open(&path).unwrap();
            dir.link_pair(GUILD, Id(10), "en", Id(20), "es").await.unwrap();
        }

        let reopened = FileLinkDirectory::open(&path).unwrap();
        let target = reopened.get_link(GUILD, Id(20)).await.unwrap().unwrap();
        assert_eq!(target.target_channel, Id(10));
        assert_eq!(target.target_lang, "en");
    }

    #[test]
    fn test_open_missing_or_empty_file() {
        let tmp = TempDir::new().unwrap();
        assert!(FileLinkDirectory::open(tmp.path().join("absent.json")).is_ok());

        let empty = tmp.path().join("empty.json");
        std::fs::write(&empty, "  ").unwrap();
        assert!(FileLinkDirectory::open(&empty).is_ok());
    }

    #[test]
    fn test_open_corrupt_file_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            FileLinkDirectory::open(&path),
            Err(DirectoryError::Parse(_))
        ));
    }

    #[test]
    fn test_snowflakes_round_trip_through_bigint() {
        let id = Id(u64::MAX - 5);
        assert_eq!(from_db(to_db(id)), id);
    }

    // ==================== PostgreSQL ====================

    /// Requires TEST_DATABASE_URL pointing at a scratch database
    #[tokio::test]
    #[ignore]
    async fn test_pg_directory_round_trip() {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL not set");
        let dir = PgLinkDirectory::connect(&url).await.unwrap();
        let guild = Id(424242);

        dir.unlink_all(guild).await.unwrap();
        dir.link_pair(guild, Id(10), "en", Id(20), "es").await.unwrap();
        dir.link_pair(guild, Id(10), "en", Id(30), "fr").await.unwrap();

        assert!(dir.get_link(guild, Id(20)).await.unwrap().is_none());
        let target = dir.get_link(guild, Id(30)).await.unwrap().unwrap();
        assert_eq!(target.target_channel, Id(10));
        assert_eq!(dir.list_links(guild).await.unwrap().len(), 1);

        assert_eq!(dir.unlink_channel(guild, Id(30)).await.unwrap(), 2);
        assert!(dir.list_links(guild).await.unwrap().is_empty());
    }
}
