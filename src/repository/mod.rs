//! Repository façade (§6): read-only lookups the core consumes. The real
//! store is an external relational database reached through this trait;
//! writes happen through API handlers entirely outside the core.

pub mod sqlite;

use async_trait::async_trait;

use crate::model::{CueList, Fixture, Scene};

#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_fixture(&self, id: &str) -> Option<Fixture>;
    async fn get_scene(&self, id: &str) -> Option<Scene>;
    async fn get_cue_list(&self, id: &str) -> Option<CueList>;

    /// Lists every patched fixture. §6's contract only names by-id lookups,
    /// but `fade_to_black` (§4.3) needs to find every intensity channel in
    /// the show, so this expansion adds one more read-only surface rather
    /// than inventing a side channel for it (SPEC_FULL §10).
    async fn list_fixtures(&self) -> Vec<Fixture>;
}
