//! Transaction workspaces.
//!
//! A workspace scopes a transaction to a subset of tables and chunks. The
//! default workspace is unrestricted.

use std::collections::{BTreeMap, BTreeSet};

use crate::id::Id;

#[derive(Debug, Clone, Default)]
pub struct Workspace {
    /// `None` = all tables.
    tables: Option<BTreeSet<String>>,
    /// Per-table chunk restriction; a table missing here is unrestricted.
    chunks: BTreeMap<String, BTreeSet<Id>>,
}

impl Workspace {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn restrict_to_tables(tables: impl IntoIterator<Item = String>) -> Self {
        Self {
            tables: Some(tables.into_iter().collect()),
            chunks: BTreeMap::new(),
        }
    }

    pub fn restrict_chunks(
        mut self,
        table: impl Into<String>,
        chunks: impl IntoIterator<Item = Id>,
    ) -> Self {
        let table = table.into();
        if let Some(tables) = &mut self.tables {
            tables.insert(table.clone());
        }
        self.chunks.insert(table, chunks.into_iter().collect());
        self
    }

    pub fn contains_table(&self, table: &str) -> bool {
        match &self.tables {
            None => true,
            Some(tables) => tables.contains(table),
        }
    }

    pub fn contains_chunk(&self, table: &str, chunk_id: Id) -> bool {
        if !self.contains_table(table) {
            return false;
        }
        match self.chunks.get(table) {
            None => true,
            Some(chunks) => chunks.contains(&chunk_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_workspace_contains_everything() {
        let workspace = Workspace::full();
        assert!(workspace.contains_table("anything"));
        assert!(workspace.contains_chunk("anything", Id::generate()));
    }

    #[test]
    fn test_table_restriction() {
        let workspace = Workspace::restrict_to_tables(vec!["poses".to_string()]);
        assert!(workspace.contains_table("poses"));
        assert!(!workspace.contains_table("landmarks"));
    }

    #[test]
    fn test_chunk_restriction() {
        let allowed = Id::generate();
        let workspace = Workspace::full().restrict_chunks("poses", vec![allowed]);
        assert!(workspace.contains_chunk("poses", allowed));
        assert!(!workspace.contains_chunk("poses", Id::generate()));
        // Other tables stay unrestricted.
        assert!(workspace.contains_chunk("landmarks", Id::generate()));
    }
}
