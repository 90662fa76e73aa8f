//! In-memory `rusqlite`-backed `Repository` implementation. Stands in for
//! the external relational store in demos and tests; production deployments
//! swap in a real implementation behind the same trait.

use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection};

use crate::model::{CueList, Fixture, Scene};

use super::Repository;

pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE fixtures (id TEXT PRIMARY KEY, data TEXT NOT NULL);
             CREATE TABLE scenes (id TEXT PRIMARY KEY, data TEXT NOT NULL);
             CREATE TABLE cue_lists (id TEXT PRIMARY KEY, data TEXT NOT NULL);",
        )?;
        Ok(SqliteRepository {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert_fixture(&self, fixture: &Fixture) -> rusqlite::Result<()> {
        let data = serde_json::to_string(fixture).expect("Fixture serializes");
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO fixtures (id, data) VALUES (?1, ?2)",
            params![fixture.id, data],
        )?;
        Ok(())
    }

    pub fn insert_scene(&self, scene: &Scene) -> rusqlite::Result<()> {
        let data = serde_json::to_string(scene).expect("Scene serializes");
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO scenes (id, data) VALUES (?1, ?2)",
            params![scene.id, data],
        )?;
        Ok(())
    }

    pub fn insert_cue_list(&self, cue_list: &CueList) -> rusqlite::Result<()> {
        let data = serde_json::to_string(cue_list).expect("CueList serializes");
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO cue_lists (id, data) VALUES (?1, ?2)",
            params![cue_list.id, data],
        )?;
        Ok(())
    }

    fn fetch(&self, table: &str, id: &str) -> Option<String> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT data FROM {table} WHERE id = ?1"),
            params![id],
            |row| row.get::<_, String>(0),
        )
        .ok()
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn get_fixture(&self, id: &str) -> Option<Fixture> {
        let data = self.fetch("fixtures", id)?;
        serde_json::from_str(&data).ok()
    }

    async fn get_scene(&self, id: &str) -> Option<Scene> {
        let data = self.fetch("scenes", id)?;
        serde_json::from_str(&data).ok()
    }

    async fn get_cue_list(&self, id: &str) -> Option<CueList> {
        let data = self.fetch("cue_lists", id)?;
        let mut cue_list: CueList = serde_json::from_str(&data).ok()?;
        cue_list
            .cues
            .sort_by(|a, b| a.cue_number.total_cmp(&b.cue_number));
        Some(cue_list)
    }

    async fn list_fixtures(&self) -> Vec<Fixture> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match conn.prepare("SELECT data FROM fixtures") {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        let rows = stmt.query_map([], |row| row.get::<_, String>(0));
        let Ok(rows) = rows else {
            return Vec::new();
        };
        rows.filter_map(|r| r.ok())
            .filter_map(|data| serde_json::from_str(&data).ok())
            .collect()
    }
}
