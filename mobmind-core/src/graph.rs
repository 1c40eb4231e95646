//! Monster relationship graph: pack leadership, threats and spatial state.
//!
//! The orchestrator only needs three questions answered: who leads this
//! monster, who threatens it, and where it is now. The game server keeps
//! `monster_packs` and `monster_threats` current in the queue database;
//! spatial rows are written back after every batch.

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::queue::{cutoff, now, open_shared};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS monster_packs (
    monster_id INTEGER PRIMARY KEY,
    leader_id  INTEGER NOT NULL CHECK (leader_id != monster_id),
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_monster_packs_leader ON monster_packs(leader_id);

CREATE TABLE IF NOT EXISTS monster_threats (
    source_id         INTEGER NOT NULL,
    target_monster_id INTEGER NOT NULL,
    threat_score      REAL NOT NULL,
    updated_at        TEXT NOT NULL,
    PRIMARY KEY (source_id, target_monster_id)
);
CREATE INDEX IF NOT EXISTS idx_monster_threats_target ON monster_threats(target_monster_id);

CREATE TABLE IF NOT EXISTS monster_spatial (
    monster_id INTEGER PRIMARY KEY,
    map_id     INTEGER NOT NULL,
    position_x INTEGER NOT NULL,
    position_y INTEGER NOT NULL,
    hp_ratio   REAL NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Position of a monster within its pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackRole {
    /// Leads at least one other monster
    Leader,
    /// Follows a leader
    Follower,
    /// Belongs to no pack
    Independent,
}

impl PackRole {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PackRole::Leader => "leader",
            PackRole::Follower => "follower",
            PackRole::Independent => "independent",
        }
    }
}

/// Answer to a team membership query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamMembership {
    pub role: PackRole,
    pub leader_id: Option<i64>,
    pub member_ids: Vec<i64>,
}

/// An actor threatening a monster
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreatEdge {
    pub source_id: i64,
    pub target_monster_id: i64,
    pub threat_score: f32,
}

/// Latest known spatial state of a monster
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpatialUpdate {
    pub position: (i32, i32),
    pub map_id: i32,
    pub hp_ratio: f32,
}

/// Relationship queries used by the orchestrator.
#[async_trait]
pub trait GraphManager: Send + Sync {
    /// Team membership for a monster, `None` if the monster is unknown
    async fn team_membership(&self, monster_id: i64) -> Result<Option<TeamMembership>>;

    /// Threats against the monster and its pack within `radius` hops
    async fn threat_network(&self, monster_id: i64, radius: u32) -> Result<Vec<ThreatEdge>>;

    /// Record the monster's latest position, map and hp
    async fn update_spatial(&self, monster_id: i64, update: SpatialUpdate) -> Result<()>;

    /// Drop spatial and threat state not refreshed within `retention_hours`
    async fn cleanup_stale(&self, retention_hours: u32) -> Result<usize>;
}

/// Relationship graph stored next to the request queue.
///
/// Thread-safe via internal Mutex, like the queue.
pub struct SqliteGraph {
    conn: Mutex<Connection>,
}

impl SqliteGraph {
    /// Open the graph tables in the database at `path`, creating them if needed
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(open_shared(path)?)
    }

    /// In-memory graph
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Add a LEADS edge from `leader_id` to `follower_id`
    pub fn assign_leader(&self, leader_id: i64, follower_id: i64) -> Result<()> {
        if leader_id == follower_id {
            return Err(Error::Graph(format!(
                "monster {leader_id} cannot lead itself"
            )));
        }

        let conn = self.conn()?;
        if leader_of(&conn, leader_id)? == Some(follower_id) {
            return Err(Error::Graph(format!(
                "monster {follower_id} already leads {leader_id}"
            )));
        }

        conn.execute(
            "INSERT INTO monster_packs (monster_id, leader_id, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(monster_id) DO UPDATE SET leader_id = excluded.leader_id,
                                                   updated_at = excluded.updated_at",
            params![follower_id, leader_id, now()],
        )?;
        debug!(leader_id, follower_id, "Assigned pack leader");
        Ok(())
    }

    /// Remove a monster and every edge touching it
    pub fn remove_monster(&self, monster_id: i64) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = tx.execute(
            "DELETE FROM monster_packs WHERE monster_id = ?1 OR leader_id = ?1",
            params![monster_id],
        )?;
        removed += tx.execute(
            "DELETE FROM monster_threats WHERE target_monster_id = ?1",
            params![monster_id],
        )?;
        removed += tx.execute(
            "DELETE FROM monster_spatial WHERE monster_id = ?1",
            params![monster_id],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Add or refresh a THREATENS edge against a monster
    pub fn record_threat(&self, source_id: i64, monster_id: i64, threat_score: f32) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO monster_threats (source_id, target_monster_id, threat_score, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(source_id, target_monster_id) DO UPDATE SET
                threat_score = excluded.threat_score, updated_at = excluded.updated_at",
            params![source_id, monster_id, threat_score, now()],
        )?;
        Ok(())
    }

    /// Last spatial update recorded for a monster
    pub fn spatial_state(&self, monster_id: i64) -> Result<Option<SpatialUpdate>> {
        let conn = self.conn()?;
        let update = conn
            .query_row(
                "SELECT position_x, position_y, map_id, hp_ratio
                 FROM monster_spatial WHERE monster_id = ?1",
                params![monster_id],
                |row| {
                    Ok(SpatialUpdate {
                        position: (row.get(0)?, row.get(1)?),
                        map_id: row.get(2)?,
                        hp_ratio: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(update)
    }

    /// Number of monsters with spatial state
    pub fn tracked_monsters(&self) -> Result<usize> {
        let count: i64 =
            self.conn()?
                .query_row("SELECT COUNT(*) FROM monster_spatial", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn leader_of(conn: &Connection, monster_id: i64) -> Result<Option<i64>> {
    let leader = conn
        .query_row(
            "SELECT leader_id FROM monster_packs WHERE monster_id = ?1",
            params![monster_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(leader)
}

/// Leader first, then followers by id
fn pack_of(conn: &Connection, leader_id: i64) -> Result<Vec<i64>> {
    let mut stmt =
        conn.prepare_cached("SELECT monster_id FROM monster_packs WHERE leader_id = ?1 ORDER BY monster_id")?;
    let mut members = vec![leader_id];
    for id in stmt.query_map(params![leader_id], |row| row.get(0))? {
        members.push(id?);
    }
    Ok(members)
}

fn is_known(conn: &Connection, monster_id: i64) -> Result<bool> {
    let known: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM monster_spatial WHERE monster_id = ?1)
             OR EXISTS(SELECT 1 FROM monster_threats WHERE target_monster_id = ?1)",
        params![monster_id],
        |row| row.get(0),
    )?;
    Ok(known)
}

#[async_trait]
impl GraphManager for SqliteGraph {
    async fn team_membership(&self, monster_id: i64) -> Result<Option<TeamMembership>> {
        let conn = self.conn()?;

        if let Some(leader_id) = leader_of(&conn, monster_id)? {
            return Ok(Some(TeamMembership {
                role: PackRole::Follower,
                leader_id: Some(leader_id),
                member_ids: pack_of(&conn, leader_id)?,
            }));
        }

        let members = pack_of(&conn, monster_id)?;
        if members.len() > 1 {
            return Ok(Some(TeamMembership {
                role: PackRole::Leader,
                leader_id: Some(monster_id),
                member_ids: members,
            }));
        }

        if !is_known(&conn, monster_id)? {
            return Ok(None);
        }
        Ok(Some(TeamMembership {
            role: PackRole::Independent,
            leader_id: None,
            member_ids: members,
        }))
    }

    async fn threat_network(&self, monster_id: i64, radius: u32) -> Result<Vec<ThreatEdge>> {
        let conn = self.conn()?;
        let targets = if radius > 0 {
            let leader_id = leader_of(&conn, monster_id)?.unwrap_or(monster_id);
            pack_of(&conn, leader_id)?
        } else {
            vec![monster_id]
        };

        let mut stmt = conn.prepare_cached(
            "SELECT source_id, target_monster_id, threat_score
             FROM monster_threats WHERE target_monster_id = ?1",
        )?;
        let mut edges = Vec::new();
        for target in targets {
            let rows = stmt.query_map(params![target], |row| {
                Ok(ThreatEdge {
                    source_id: row.get(0)?,
                    target_monster_id: row.get(1)?,
                    threat_score: row.get(2)?,
                })
            })?;
            for edge in rows {
                edges.push(edge?);
            }
        }

        edges.sort_by(|a, b| b.threat_score.total_cmp(&a.threat_score));
        Ok(edges)
    }

    async fn update_spatial(&self, monster_id: i64, update: SpatialUpdate) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO monster_spatial (monster_id, map_id, position_x, position_y, hp_ratio, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(monster_id) DO UPDATE SET
                map_id = excluded.map_id, position_x = excluded.position_x,
                position_y = excluded.position_y, hp_ratio = excluded.hp_ratio,
                updated_at = excluded.updated_at",
            params![
                monster_id,
                update.map_id,
                update.position.0,
                update.position.1,
                update.hp_ratio,
                now()
            ],
        )?;
        Ok(())
    }

    async fn cleanup_stale(&self, retention_hours: u32) -> Result<usize> {
        let before = cutoff(retention_hours);
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let spatial = tx.execute(
            "DELETE FROM monster_spatial WHERE updated_at < ?1",
            params![before],
        )?;
        let threats = tx.execute(
            "DELETE FROM monster_threats WHERE updated_at < ?1",
            params![before],
        )?;
        tx.commit()?;

        let removed = spatial + threats;
        if removed > 0 {
            info!(spatial, threats, "Cleaned up stale graph state");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{RequestProcessor, SqliteQueue, timestamp};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    fn graph() -> SqliteGraph {
        SqliteGraph::open_in_memory().unwrap()
    }

    fn spatial(x: i32) -> SpatialUpdate {
        SpatialUpdate {
            position: (x, 6),
            map_id: 2,
            hp_ratio: 0.75,
        }
    }

    #[test]
    fn test_pack_role_strings() {
        assert_eq!(PackRole::Leader.as_str(), "leader");
        assert_eq!(PackRole::Follower.as_str(), "follower");
        assert_eq!(PackRole::Independent.as_str(), "independent");
    }

    #[tokio::test]
    async fn test_unknown_monster_has_no_membership() {
        let graph = graph();
        assert_eq!(graph.team_membership(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_seen_monster_is_independent() {
        let graph = graph();
        graph.update_spatial(1, spatial(5)).await.unwrap();

        let membership = graph.team_membership(1).await.unwrap().unwrap();
        assert_eq!(membership.role, PackRole::Independent);
        assert_eq!(membership.leader_id, None);
        assert_eq!(membership.member_ids, vec![1]);
    }

    #[tokio::test]
    async fn test_leader_and_followers() {
        let graph = graph();
        graph.assign_leader(10, 12).unwrap();
        graph.assign_leader(10, 11).unwrap();

        let leader = graph.team_membership(10).await.unwrap().unwrap();
        assert_eq!(leader.role, PackRole::Leader);
        assert_eq!(leader.leader_id, Some(10));
        assert_eq!(leader.member_ids, vec![10, 11, 12]);

        let follower = graph.team_membership(12).await.unwrap().unwrap();
        assert_eq!(follower.role, PackRole::Follower);
        assert_eq!(follower.leader_id, Some(10));
        assert_eq!(follower.member_ids, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn test_reassigning_follower_moves_it() {
        let graph = graph();
        graph.assign_leader(1, 3).unwrap();
        graph.assign_leader(2, 3).unwrap();

        let membership = graph.team_membership(3).await.unwrap().unwrap();
        assert_eq!(membership.leader_id, Some(2));
        assert_eq!(graph.team_membership(1).await.unwrap(), None);
    }

    #[test]
    fn test_assign_leader_rejects_cycles() {
        let graph = graph();
        assert!(graph.assign_leader(1, 1).is_err());
        graph.assign_leader(1, 2).unwrap();
        assert!(graph.assign_leader(2, 1).is_err());
    }

    #[tokio::test]
    async fn test_remove_leader_dissolves_pack() {
        let graph = graph();
        graph.assign_leader(1, 2).unwrap();
        graph.update_spatial(2, spatial(1)).await.unwrap();
        assert!(graph.remove_monster(1).unwrap());

        let membership = graph.team_membership(2).await.unwrap().unwrap();
        assert_eq!(membership.role, PackRole::Independent);
        assert!(!graph.remove_monster(1).unwrap());
    }

    #[tokio::test]
    async fn test_threat_network_includes_allies() {
        let graph = graph();
        graph.assign_leader(1, 2).unwrap();
        graph.record_threat(900, 1, 0.4).unwrap();
        graph.record_threat(901, 2, 0.9).unwrap();
        graph.record_threat(900, 1, 0.5).unwrap();

        let own = graph.threat_network(1, 0).await.unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].threat_score, 0.5);

        let network = graph.threat_network(1, 2).await.unwrap();
        assert_eq!(network.len(), 2);
        assert_eq!(network[0].source_id, 901);
        assert_eq!(network[0].target_monster_id, 2);

        assert!(graph.threat_network(99, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_spatial() {
        let graph = graph();
        graph.update_spatial(3, spatial(5)).await.unwrap();
        graph.update_spatial(3, spatial(7)).await.unwrap();
        assert_eq!(graph.spatial_state(3).unwrap(), Some(spatial(7)));
        assert_eq!(graph.spatial_state(4).unwrap(), None);
        assert_eq!(graph.tracked_monsters().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_stale_bounds_tracked_state() {
        let graph = graph();
        for id in 0..50 {
            graph.update_spatial(id, spatial(1)).await.unwrap();
        }
        graph.record_threat(900, 1, 0.4).unwrap();
        graph.assign_leader(1, 2).unwrap();

        // Fresh state survives
        assert_eq!(graph.cleanup_stale(24).await.unwrap(), 0);

        let old = timestamp(Utc::now() - ChronoDuration::hours(48));
        {
            let conn = graph.conn().unwrap();
            conn.execute("UPDATE monster_spatial SET updated_at = ?1 WHERE monster_id != 2", params![old])
                .unwrap();
            conn.execute("UPDATE monster_threats SET updated_at = ?1", params![old])
                .unwrap();
        }

        assert_eq!(graph.cleanup_stale(24).await.unwrap(), 50);
        assert_eq!(graph.tracked_monsters().unwrap(), 1);
        assert!(graph.threat_network(1, 0).await.unwrap().is_empty());
        // Leadership belongs to the game server and is kept
        assert_eq!(graph.team_membership(2).await.unwrap().unwrap().leader_id, Some(1));
    }

    #[tokio::test]
    async fn test_game_server_rows_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let queue = SqliteQueue::open(&path, Duration::from_millis(10)).unwrap();
        let graph = SqliteGraph::open(&path).unwrap();

        // A separate writer, as the game server would be
        let writer = Connection::open(&path).unwrap();
        writer
            .execute_batch(
                "INSERT INTO monster_packs (monster_id, leader_id, updated_at)
                     VALUES (21, 20, '2026-01-01T00:00:00Z'), (22, 20, '2026-01-01T00:00:00Z');
                 INSERT INTO monster_threats (source_id, target_monster_id, threat_score, updated_at)
                     VALUES (500, 22, 0.8, '2026-01-01T00:00:00Z');",
            )
            .unwrap();
        assert!(
            writer
                .execute(
                    "INSERT INTO monster_packs (monster_id, leader_id, updated_at) VALUES (5, 5, 'x')",
                    [],
                )
                .is_err()
        );

        let membership = graph.team_membership(20).await.unwrap().unwrap();
        assert_eq!(membership.role, PackRole::Leader);
        assert_eq!(membership.member_ids, vec![20, 21, 22]);
        assert_eq!(graph.threat_network(20, 2).await.unwrap().len(), 1);
        assert!(queue.poll_requests(1).await.unwrap().is_empty());
    }
}
